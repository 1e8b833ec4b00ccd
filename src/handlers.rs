use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    metrics,
    pending::PendingRegistry,
    reconciler::{Namespace, Outcome, ReconcileError, Reconciler, UnlinkOutcome},
    store::{LinkRecord, StoreError},
    verifier::{ChatVerifier, GameVerifier},
};

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Reconciler,
    pub pending: PendingRegistry,
    pub chat_verifier: ChatVerifier,
    pub game_verifier: GameVerifier,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(serve_metrics))
        .route("/link/chat", post(link_chat))
        .route("/link/game", post(link_game))
        .route("/unlink", post(unlink))
        .route("/links/:id", get(get_link))
        .with_state(state)
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    VerificationFailed(Namespace),
    InvalidState(&'static str),
    AlreadyLinked(LinkRecord),
    Conflict { namespace: Namespace, id: String },
    NotFound(&'static str),
    StoreUnavailable,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<LinkRecord>,
}

impl ApiErrorBody {
    fn bare(error: &'static str, message: Option<String>) -> Self {
        Self {
            error,
            message,
            namespace: None,
            id: None,
            link: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::VerificationFailed(namespace) => (
                StatusCode::UNAUTHORIZED,
                Json(ApiErrorBody::bare(
                    "verification_failed",
                    Some(format!("{} identity could not be verified", namespace.as_str())),
                )),
            )
                .into_response(),
            ApiError::InvalidState(msg) => (
                StatusCode::BAD_REQUEST,
                Json(ApiErrorBody::bare("invalid_state", Some(msg.to_string()))),
            )
                .into_response(),
            ApiError::AlreadyLinked(record) => (
                StatusCode::CONFLICT,
                Json(ApiErrorBody {
                    error: "already_linked",
                    message: Some("these identities are already linked".to_string()),
                    namespace: None,
                    id: None,
                    link: Some(record),
                }),
            )
                .into_response(),
            ApiError::Conflict { namespace, id } => (
                StatusCode::CONFLICT,
                Json(ApiErrorBody {
                    error: "conflict",
                    message: Some(format!(
                        "{} identity {} already belongs to another link; unlink it first",
                        namespace.as_str(),
                        id
                    )),
                    namespace: Some(namespace.as_str()),
                    id: Some(id),
                    link: None,
                }),
            )
                .into_response(),
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                Json(ApiErrorBody::bare("not_found", Some(msg.to_string()))),
            )
                .into_response(),
            ApiError::StoreUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiErrorBody::bare("store_unavailable", None)),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LinkChatRequest {
    pub session_id: Option<String>,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct LinkGameRequest {
    pub session_id: Option<String>,
    pub claimed_id: String,
    pub sig: String,
}

#[derive(Debug, Deserialize)]
pub struct UnlinkRequest {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct LinkResponse {
    pub outcome: &'static str,
    /// Echoed (or freshly minted) session identifier the caller must present
    /// on the second leg of the flow.
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkRecord>,
    /// Which namespace still has to authenticate, when awaiting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct UnlinkResponse {
    pub removed: u64,
}

/// POST /link/chat - chat-platform redirect lands here with a verified token
pub async fn link_chat(
    State(state): State<AppState>,
    Json(payload): Json<LinkChatRequest>,
) -> ApiResult<LinkResponse> {
    let chat_id = state.chat_verifier.verify(&payload.token).map_err(|err| {
        debug!(error = %err, "chat token rejected");
        metrics::VERIFY_FAILURES.with_label_values(&["chat"]).inc();
        ApiError::VerificationFailed(Namespace::Chat)
    })?;
    complete_link(&state, Namespace::Chat, chat_id, payload.session_id).await
}

/// POST /link/game - game-platform callback lands here with a signed ticket
pub async fn link_game(
    State(state): State<AppState>,
    Json(payload): Json<LinkGameRequest>,
) -> ApiResult<LinkResponse> {
    let game_id = state
        .game_verifier
        .verify(&payload.claimed_id, &payload.sig)
        .map_err(|err| {
            debug!(error = %err, "game ticket rejected");
            metrics::VERIFY_FAILURES.with_label_values(&["game"]).inc();
            ApiError::VerificationFailed(Namespace::Game)
        })?;
    complete_link(&state, Namespace::Game, game_id, payload.session_id).await
}

async fn complete_link(
    state: &AppState,
    namespace: Namespace,
    verified_id: String,
    session_id: Option<String>,
) -> ApiResult<LinkResponse> {
    let session_id = session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // A held pending value from the same namespace means the user restarted
    // that side of the flow; the reconciler treats that as a caller error, so
    // drop it here and let the fresh value overwrite (last write wins).
    let pending = state
        .pending
        .get(&session_id)
        .filter(|p| p.namespace != namespace);

    match state
        .reconciler
        .reconcile(namespace, &verified_id, pending.as_ref())
        .await
    {
        Ok(Outcome::Linked(record)) => {
            state.pending.clear(&session_id);
            metrics::LINK_OUTCOMES.with_label_values(&["linked"]).inc();
            debug!(session = %session_id, chat = %record.chat_id, "link completed");
            Ok(Json(LinkResponse {
                outcome: "linked",
                session_id,
                link: Some(record),
                awaiting: None,
            }))
        }
        Ok(Outcome::AwaitingOtherNamespace(p)) => {
            let awaiting = p.namespace.other().as_str();
            state.pending.put(&session_id, p);
            metrics::LINK_OUTCOMES.with_label_values(&["awaiting"]).inc();
            Ok(Json(LinkResponse {
                outcome: "awaiting_other_namespace",
                session_id,
                link: None,
                awaiting: Some(awaiting),
            }))
        }
        Ok(Outcome::AlreadyLinked(record)) => {
            metrics::LINK_OUTCOMES
                .with_label_values(&["already_linked"])
                .inc();
            Err(ApiError::AlreadyLinked(record))
        }
        Ok(Outcome::Conflict { namespace, id }) => {
            metrics::LINK_OUTCOMES.with_label_values(&["conflict"]).inc();
            Err(ApiError::Conflict { namespace, id })
        }
        Err(err) => Err(map_reconcile_err(err, namespace, &verified_id)),
    }
}

/// POST /unlink - remove a link by either identity. Idempotent.
pub async fn unlink(
    State(state): State<AppState>,
    Json(payload): Json<UnlinkRequest>,
) -> ApiResult<UnlinkResponse> {
    match state.reconciler.unlink(&payload.id).await {
        Ok(UnlinkOutcome::Removed(removed)) => {
            metrics::UNLINKS.with_label_values(&["removed"]).inc();
            Ok(Json(UnlinkResponse { removed }))
        }
        Ok(UnlinkOutcome::NotFound) => {
            metrics::UNLINKS.with_label_values(&["not_found"]).inc();
            Err(ApiError::NotFound("no link matches that identifier"))
        }
        Err(ReconcileError::InvalidState(msg)) => Err(ApiError::InvalidState(msg)),
        Err(ReconcileError::Store(err)) => {
            error!(error = %err, "unlink failed");
            Err(ApiError::StoreUnavailable)
        }
    }
}

/// GET /links/{id} - look up a link by chat or game identity
pub async fn get_link(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<LinkRecord> {
    match state.reconciler.lookup_either(&id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(ApiError::NotFound("no link matches that identifier")),
        Err(err) => {
            error!(error = %err, "link lookup failed");
            Err(ApiError::StoreUnavailable)
        }
    }
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn serve_metrics() -> String {
    metrics::render()
}

fn map_reconcile_err(err: ReconcileError, namespace: Namespace, verified_id: &str) -> ApiError {
    match err {
        ReconcileError::InvalidState(msg) => ApiError::InvalidState(msg),
        // The constraint is the final authority; a violation that escapes the
        // reconciler still reads as a lost uniqueness race.
        ReconcileError::Store(StoreError::UniqueViolation(column)) => ApiError::Conflict {
            namespace: if column == "game_id" {
                Namespace::Game
            } else {
                Namespace::Chat
            },
            id: verified_id.to_string(),
        },
        ReconcileError::Store(StoreError::Unavailable(msg)) => {
            error!(namespace = namespace.as_str(), error = %msg, "store unavailable");
            ApiError::StoreUnavailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LinkStore;
    use axum::{
        body::{self, Body},
        http::{Request, StatusCode},
    };
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    use hmac::{Hmac, Mac};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::util::ServiceExt;

    const CHAT_SECRET: &[u8] = b"chat-secret";
    const GAME_SECRET: &[u8] = b"game-secret";

    fn test_state() -> AppState {
        AppState {
            reconciler: Reconciler::new(LinkStore::memory()),
            pending: PendingRegistry::new(Duration::from_secs(60)),
            chat_verifier: ChatVerifier::new(CHAT_SECRET, None, "tether".into()),
            game_verifier: GameVerifier::new(GAME_SECRET.to_vec()),
        }
    }

    fn chat_token(sub: &str) -> String {
        #[derive(serde::Serialize)]
        struct Claims {
            sub: String,
            aud: String,
            exp: i64,
        }
        encode(
            &Header::default(),
            &Claims {
                sub: sub.to_string(),
                aud: "tether".to_string(),
                exp: chrono::Utc::now().timestamp() + 300,
            },
            &EncodingKey::from_secret(CHAT_SECRET),
        )
        .unwrap()
    }

    fn game_sig(claimed_id: &str) -> String {
        let mut mac = Hmac::<sha2::Sha256>::new_from_slice(GAME_SECRET).unwrap();
        mac.update(claimed_id.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn get_status(app: &Router, uri: &str) -> StatusCode {
        app.clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn two_leg_link_flow() {
        let app = build_router(test_state());

        let (status, body) = post_json(
            &app,
            "/link/chat",
            json!({ "token": chat_token("C1") }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "awaiting_other_namespace");
        assert_eq!(body["awaiting"], "game");
        let session_id = body["session_id"].as_str().unwrap().to_string();

        let (status, body) = post_json(
            &app,
            "/link/game",
            json!({ "session_id": session_id, "claimed_id": "G1", "sig": game_sig("G1") }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "linked");
        assert_eq!(body["link"]["chat_id"], "C1");
        assert_eq!(body["link"]["game_id"], "G1");

        assert_eq!(get_status(&app, "/links/C1").await, StatusCode::OK);
        assert_eq!(get_status(&app, "/links/G1").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn game_leg_first_works_too() {
        let app = build_router(test_state());

        let (status, body) = post_json(
            &app,
            "/link/game",
            json!({ "claimed_id": "G1", "sig": game_sig("G1") }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["awaiting"], "chat");
        let session_id = body["session_id"].as_str().unwrap().to_string();

        let (status, body) = post_json(
            &app,
            "/link/chat",
            json!({ "session_id": session_id, "token": chat_token("C1") }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "linked");
    }

    #[tokio::test]
    async fn bad_credentials_are_unauthorized() {
        let app = build_router(test_state());

        let (status, body) =
            post_json(&app, "/link/chat", json!({ "token": "not-a-jwt" })).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "verification_failed");

        let (status, _) = post_json(
            &app,
            "/link/game",
            json!({ "claimed_id": "G1", "sig": "forged" }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn taken_game_identity_conflicts() {
        let state = test_state();
        state.reconciler.store().link("C2", "G1").await.unwrap();
        let app = build_router(state);

        let (_, body) = post_json(
            &app,
            "/link/chat",
            json!({ "token": chat_token("C1") }),
        )
        .await;
        let session_id = body["session_id"].as_str().unwrap().to_string();

        let (status, body) = post_json(
            &app,
            "/link/game",
            json!({ "session_id": session_id, "claimed_id": "G1", "sig": game_sig("G1") }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");
        assert_eq!(body["namespace"], "game");
        assert_eq!(body["id"], "G1");

        // The loser never got a row.
        assert_eq!(get_status(&app, "/links/C1").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn relinking_a_linked_identity_is_a_conflict_response() {
        let state = test_state();
        state.reconciler.store().link("C1", "G1").await.unwrap();
        let app = build_router(state);

        let (status, body) = post_json(
            &app,
            "/link/chat",
            json!({ "token": chat_token("C1") }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_linked");
        assert_eq!(body["link"]["game_id"], "G1");
    }

    #[tokio::test]
    async fn unlink_then_repeat_is_not_found() {
        let state = test_state();
        state.reconciler.store().link("C1", "G1").await.unwrap();
        let app = build_router(state);

        let (status, body) = post_json(&app, "/unlink", json!({ "id": "C1" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], 1);

        let (status, _) = post_json(&app, "/unlink", json!({ "id": "C1" })).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        assert_eq!(get_status(&app, "/links/C1").await, StatusCode::NOT_FOUND);
        assert_eq!(get_status(&app, "/links/G1").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn abandoned_first_leg_leaves_no_record() {
        let app = build_router(test_state());

        let (status, _) = post_json(
            &app,
            "/link/chat",
            json!({ "token": chat_token("C1") }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Session never completes the game leg; the store holds nothing.
        assert_eq!(get_status(&app, "/links/C1").await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn restarting_the_same_leg_overwrites_pending() {
        let app = build_router(test_state());

        let (_, body) = post_json(
            &app,
            "/link/chat",
            json!({ "token": chat_token("C1") }),
        )
        .await;
        let session_id = body["session_id"].as_str().unwrap().to_string();

        // Same session, chat leg again with a different account.
        let (status, body) = post_json(
            &app,
            "/link/chat",
            json!({ "session_id": session_id, "token": chat_token("C9") }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "awaiting_other_namespace");

        // The game leg pairs with the most recent chat identity.
        let (_, body) = post_json(
            &app,
            "/link/game",
            json!({ "session_id": session_id, "claimed_id": "G1", "sig": game_sig("G1") }),
        )
        .await;
        assert_eq!(body["link"]["chat_id"], "C9");
    }

    #[test]
    fn store_unavailable_maps_to_service_unavailable() {
        let mapped = map_reconcile_err(
            ReconcileError::Store(StoreError::Unavailable("connection refused".into())),
            Namespace::Chat,
            "C1",
        );
        assert!(matches!(mapped, ApiError::StoreUnavailable));

        let response = ApiError::StoreUnavailable.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn escaped_constraint_violation_maps_to_conflict() {
        let mapped = map_reconcile_err(
            ReconcileError::Store(StoreError::UniqueViolation("game_id")),
            Namespace::Game,
            "G1",
        );
        match mapped {
            ApiError::Conflict { namespace, id } => {
                assert_eq!(namespace, Namespace::Game);
                assert_eq!(id, "G1");
            }
            other => panic!("unexpected mapping {other:?}"),
        }
    }

    #[tokio::test]
    async fn health_and_metrics_respond() {
        let app = build_router(test_state());
        assert_eq!(get_status(&app, "/health").await, StatusCode::OK);
        assert_eq!(get_status(&app, "/metrics").await, StatusCode::OK);
    }
}
