use chrono::{serde::ts_seconds, DateTime, Duration, Utc};
use jsonwebtoken::{
    errors::Error as JwtError, DecodingKey, EncodingKey, Header, TokenData, Validation,
};
use serde::{Deserialize, Serialize};

use crate::model::{mongodb::Id, voter::VoterIdentity};
use crate::signing::SigningProvider;

/// Provider-specific wire state of a session, carried as plain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderState {
    Pki {
        sesscode: i64,
        /// Set once `PrepareSignature` has run; required by finalize.
        signature_id: Option<String>,
    },
    Phone {
        sesscode: i64,
    },
    Remote {
        session_id: String,
    },
}

/// One voter's in-flight signing attempt.
///
/// Never persisted server-side: the whole session is serialised into a
/// signed, expiring JWT handed to the client, and every poll/finalize call
/// carries it back. The external service's own session timeout is the
/// terminal backstop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningSession {
    pub provider: SigningProvider,
    pub vote_id: Id,
    pub voter: VoterIdentity,
    pub selections: Vec<String>,
    /// Base64 SHA-256 of the voter's container bytes.
    pub digest: String,
    pub challenge_code: Option<String>,
    pub state: ProviderState,
}

/// JWT claims: the session itself plus an expiry datetime.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(flatten)]
    session: SigningSession,
    #[serde(rename = "exp", with = "ts_seconds")]
    expire_at: DateTime<Utc>,
}

impl SigningSession {
    // Session serialization never fails.
    #[allow(clippy::missing_panics_doc)]
    /// Serialise into a signed session handle.
    pub fn into_token(self, secret: &[u8], ttl: Duration) -> String {
        let claims = Claims {
            session: self,
            expire_at: Utc::now() + ttl,
        };
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    /// Recover a session from its handle. Fails on tampering or expiry.
    pub fn from_token(token: &str, secret: &[u8]) -> Result<Self, JwtError> {
        jsonwebtoken::decode(
            token,
            &DecodingKey::from_secret(secret),
            &Validation::default(),
        )
        .map(|data: TokenData<Claims>| data.claims.session)
    }
}

#[cfg(test)]
mod tests {
    use mongodb::bson::oid::ObjectId;

    use super::*;

    fn example_session() -> SigningSession {
        SigningSession {
            provider: SigningProvider::Phone,
            vote_id: ObjectId::new().into(),
            voter: VoterIdentity::example(),
            selections: vec!["Yes".to_string()],
            digest: "2jmj7l5rSw0yVb/vlWAYkK/YBwk=".to_string(),
            challenge_code: Some("1234".to_string()),
            state: ProviderState::Phone { sesscode: 987654 },
        }
    }

    #[test]
    fn session_round_trips_through_its_token() {
        let session = example_session();
        let token = session.clone().into_token(b"secret", Duration::minutes(5));
        let restored = SigningSession::from_token(&token, b"secret").unwrap();
        assert_eq!(restored, session);
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let token = example_session().into_token(b"secret", Duration::minutes(5));
        assert!(SigningSession::from_token(&token, b"other secret").is_err());

        let mut broken = token;
        broken.push('x');
        assert!(SigningSession::from_token(&broken, b"secret").is_err());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let token = example_session().into_token(b"secret", Duration::minutes(-5));
        assert!(SigningSession::from_token(&token, b"secret").is_err());
    }
}
