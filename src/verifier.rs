use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

type HmacSha256 = Hmac<sha2::Sha256>;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("token validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token missing subject")]
    MissingSubject,
    #[error("ticket signature malformed")]
    MalformedSignature,
    #[error("ticket signature mismatch")]
    SignatureMismatch,
    #[error("ticket carries no identity")]
    MissingIdentity,
}

#[derive(Debug, Deserialize)]
struct ChatTokenClaims {
    sub: String,
}

/// Validates the short-lived HS256 token the chat platform hands the user on
/// redirect. The `sub` claim is the verified chat identifier; everything else
/// about the provider's OAuth flow stays outside this process.
#[derive(Clone)]
pub struct ChatVerifier {
    key: DecodingKey,
    issuer: Option<String>,
    audience: String,
}

impl ChatVerifier {
    pub fn new(secret: &[u8], issuer: Option<String>, audience: String) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            issuer,
            audience,
        }
    }

    pub fn verify(&self, token: &str) -> Result<String, VerifyError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[self.audience.as_str()]);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        let data = decode::<ChatTokenClaims>(token, &self.key, &validation)?;
        let sub = data.claims.sub;
        if sub.trim().is_empty() {
            return Err(VerifyError::MissingSubject);
        }
        Ok(sub)
    }
}

/// Validates the game platform's callback ticket: a `claimed_id` plus an
/// HMAC-SHA256 signature minted by the trusted callback proxy. OpenID-style
/// claimed ids are URLs whose last path segment is the identity.
#[derive(Clone)]
pub struct GameVerifier {
    mac_secret: Vec<u8>,
}

impl GameVerifier {
    pub fn new(mac_secret: Vec<u8>) -> Self {
        Self { mac_secret }
    }

    pub fn verify(&self, claimed_id: &str, sig: &str) -> Result<String, VerifyError> {
        let raw = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| VerifyError::MalformedSignature)?;
        let mut mac = HmacSha256::new_from_slice(&self.mac_secret)
            .map_err(|_| VerifyError::MalformedSignature)?;
        mac.update(claimed_id.as_bytes());
        mac.verify_slice(&raw)
            .map_err(|_| VerifyError::SignatureMismatch)?;

        let identity = extract_identity(claimed_id);
        if identity.is_empty() {
            return Err(VerifyError::MissingIdentity);
        }
        Ok(identity.to_string())
    }
}

/// OpenID providers return the identity as the tail of a URL
/// (e.g. `https://example.com/openid/id/7656119...`); bare ids pass through.
fn extract_identity(claimed_id: &str) -> &str {
    let trimmed = claimed_id.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.rsplit('/').next().unwrap_or_default()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    const SECRET: &[u8] = b"test-secret";

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        aud: String,
        iss: String,
        exp: i64,
    }

    fn mint_chat_token(sub: &str, aud: &str, iss: &str) -> String {
        let claims = TestClaims {
            sub: sub.to_string(),
            aud: aud.to_string(),
            iss: iss.to_string(),
            exp: chrono::Utc::now().timestamp() + 300,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    fn sign_ticket(secret: &[u8], claimed_id: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(claimed_id.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    #[test]
    fn chat_token_subject_is_returned() {
        let verifier = ChatVerifier::new(SECRET, Some("chat.example".into()), "tether".into());
        let token = mint_chat_token("C1", "tether", "chat.example");
        assert_eq!(verifier.verify(&token).unwrap(), "C1");
    }

    #[test]
    fn chat_token_with_wrong_secret_is_rejected() {
        let verifier = ChatVerifier::new(b"other-secret", None, "tether".into());
        let token = mint_chat_token("C1", "tether", "chat.example");
        assert!(matches!(
            verifier.verify(&token),
            Err(VerifyError::InvalidToken(_))
        ));
    }

    #[test]
    fn chat_token_with_wrong_audience_is_rejected() {
        let verifier = ChatVerifier::new(SECRET, None, "tether".into());
        let token = mint_chat_token("C1", "somewhere-else", "chat.example");
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn game_ticket_round_trip() {
        let verifier = GameVerifier::new(SECRET.to_vec());
        let sig = sign_ticket(SECRET, "G1");
        assert_eq!(verifier.verify("G1", &sig).unwrap(), "G1");
    }

    #[test]
    fn game_ticket_extracts_openid_url_tail() {
        let verifier = GameVerifier::new(SECRET.to_vec());
        let claimed = "https://games.example/openid/id/76561198000000000";
        let sig = sign_ticket(SECRET, claimed);
        assert_eq!(verifier.verify(claimed, &sig).unwrap(), "76561198000000000");
    }

    #[test]
    fn tampered_claimed_id_fails_verification() {
        let verifier = GameVerifier::new(SECRET.to_vec());
        let sig = sign_ticket(SECRET, "G1");
        assert!(matches!(
            verifier.verify("G2", &sig),
            Err(VerifyError::SignatureMismatch)
        ));
    }

    #[test]
    fn garbage_signature_is_malformed() {
        let verifier = GameVerifier::new(SECRET.to_vec());
        assert!(matches!(
            verifier.verify("G1", "!!not-base64!!"),
            Err(VerifyError::MalformedSignature)
        ));
    }
}
