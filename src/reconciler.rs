use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::store::{LinkRecord, LinkStore, StoreError};

/// The two identity namespaces this service pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Chat,
    Game,
}

impl Namespace {
    pub fn other(self) -> Self {
        match self {
            Namespace::Chat => Namespace::Game,
            Namespace::Game => Namespace::Chat,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Chat => "chat",
            Namespace::Game => "game",
        }
    }
}

/// The half of an in-progress link buffered in session scope. Never persisted;
/// only the verifier's output ever reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingLink {
    pub namespace: Namespace,
    pub id: String,
}

/// Every reconcile call maps to exactly one of these.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Both identities verified; the pairing is now durable.
    Linked(LinkRecord),
    /// The presented pair is already recorded. Nothing was written.
    AlreadyLinked(LinkRecord),
    /// First half verified; the caller must stash this pending value in the
    /// session and send the user through the other namespace's flow.
    AwaitingOtherNamespace(PendingLink),
    /// One of the identities already belongs to a different record. The
    /// payload names the identity that lost so the caller can say which
    /// account needs an explicit unlink first.
    Conflict { namespace: Namespace, id: String },
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlinkOutcome {
    Removed(u64),
    NotFound,
}

/// The account-link reconciliation core. Holds no state of its own beyond the
/// store handle; pending state is owned by the caller's session.
#[derive(Clone)]
pub struct Reconciler {
    store: LinkStore,
}

impl Reconciler {
    pub fn new(store: LinkStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &LinkStore {
        &self.store
    }

    /// Decide what a freshly verified identity means for the link record,
    /// given whatever the session already holds.
    ///
    /// Reads are advisory only: the final authority on uniqueness is the
    /// store's constraint at write time, so a race lost to a concurrent
    /// request comes back as `Conflict`, never as a duplicate row.
    pub async fn reconcile(
        &self,
        new_namespace: Namespace,
        new_id: &str,
        pending: Option<&PendingLink>,
    ) -> Result<Outcome, ReconcileError> {
        if new_id.trim().is_empty() {
            return Err(ReconcileError::InvalidState("empty identifier"));
        }
        if let Some(pending) = pending {
            if pending.namespace == new_namespace {
                return Err(ReconcileError::InvalidState(
                    "pending identity is from the same namespace",
                ));
            }
            if pending.id.trim().is_empty() {
                return Err(ReconcileError::InvalidState("empty pending identifier"));
            }
        }

        let existing = self.lookup(new_namespace, new_id).await?;

        if let Some(record) = existing {
            if record.is_complete() {
                let partner = self.partner_of(&record, new_namespace);
                return Ok(match pending {
                    // A pending identity naming a different partner is a
                    // relink attempt; explicit unlink is required first.
                    Some(p) if p.id != partner => Outcome::Conflict {
                        namespace: new_namespace,
                        id: new_id.to_string(),
                    },
                    _ => Outcome::AlreadyLinked(record),
                });
            }
            // Half-linked row (legacy import): only a chat-side row can be
            // partial, so a pending game identity can finalize it in place.
            if let Some(p) = pending {
                return self.finalize(&record.chat_id, &p.id).await;
            }
            return Ok(Outcome::AwaitingOtherNamespace(PendingLink {
                namespace: new_namespace,
                id: new_id.to_string(),
            }));
        }

        match pending {
            None => {
                debug!(namespace = new_namespace.as_str(), id = %new_id, "buffering first link half");
                Ok(Outcome::AwaitingOtherNamespace(PendingLink {
                    namespace: new_namespace,
                    id: new_id.to_string(),
                }))
            }
            Some(p) => {
                // Pre-flight check so a doomed finalize can name the pending
                // side; the insert below remains the authoritative check.
                if let Some(other) = self.lookup(p.namespace, &p.id).await? {
                    if other.is_complete() {
                        return Ok(Outcome::Conflict {
                            namespace: p.namespace,
                            id: p.id.clone(),
                        });
                    }
                }
                let (chat_id, game_id) = match new_namespace {
                    Namespace::Chat => (new_id, p.id.as_str()),
                    Namespace::Game => (p.id.as_str(), new_id),
                };
                self.finalize(chat_id, game_id).await
            }
        }
    }

    /// Remove any record matching either identity. Idempotent.
    pub async fn unlink(&self, id: &str) -> Result<UnlinkOutcome, ReconcileError> {
        if id.trim().is_empty() {
            return Err(ReconcileError::InvalidState("empty identifier"));
        }
        let removed = self.store.delete_matching(id).await?;
        debug!(%id, removed, "unlink");
        if removed == 0 {
            Ok(UnlinkOutcome::NotFound)
        } else {
            Ok(UnlinkOutcome::Removed(removed))
        }
    }

    pub async fn lookup_either(&self, id: &str) -> Result<Option<LinkRecord>, ReconcileError> {
        if let Some(record) = self.store.get_by_chat(id).await? {
            return Ok(Some(record));
        }
        Ok(self.store.get_by_game(id).await?)
    }

    async fn lookup(
        &self,
        namespace: Namespace,
        id: &str,
    ) -> Result<Option<LinkRecord>, ReconcileError> {
        let record = match namespace {
            Namespace::Chat => self.store.get_by_chat(id).await?,
            Namespace::Game => self.store.get_by_game(id).await?,
        };
        Ok(record)
    }

    async fn finalize(&self, chat_id: &str, game_id: &str) -> Result<Outcome, ReconcileError> {
        match self.store.link(chat_id, game_id).await {
            Ok(record) => {
                debug!(%chat_id, %game_id, "link finalized");
                Ok(Outcome::Linked(record))
            }
            Err(StoreError::UniqueViolation(column)) => {
                let (namespace, id) = if column == "game_id" {
                    (Namespace::Game, game_id.to_string())
                } else {
                    (Namespace::Chat, chat_id.to_string())
                };
                debug!(namespace = namespace.as_str(), %id, "link lost uniqueness race");
                Ok(Outcome::Conflict { namespace, id })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn partner_of(&self, record: &LinkRecord, namespace: Namespace) -> String {
        match namespace {
            Namespace::Chat => record.game_id.clone().unwrap_or_default(),
            Namespace::Game => record.chat_id.clone(),
        }
    }
}
