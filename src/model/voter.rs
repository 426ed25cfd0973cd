use chrono::{serde::ts_seconds, DateTime, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{
    errors::Error as JwtError, DecodingKey, EncodingKey, Header, TokenData, Validation,
};
use rocket::{
    http::{Cookie, SameSite, Status},
    outcome::{try_outcome, IntoOutcome},
    request::{self, FromRequest},
    time::Duration,
    Request, State,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::{config::Config, model::phone::Msisdn};

pub const VOTER_COOKIE: &str = "voter";

pub type HmacSha256 = Hmac<Sha256>;

/// An authenticated voter, as resolved by one of the signing providers'
/// authentication flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterIdentity {
    pub national_id: String,
    pub country_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msisdn: Option<Msisdn>,
}

impl VoterIdentity {
    /// The voter's pseudonymous identifier: a hex HMAC-SHA256 of the national
    /// ID. Only this value is ever persisted or exposed in archives.
    pub fn pseudonym(&self, config: &Config) -> String {
        let mut hmac = HmacSha256::new_from_slice(config.hmac_secret())
            .expect("HMAC can take key of any size");
        hmac.update(self.national_id.as_bytes());
        data_encoding::HEXLOWER.encode(&hmac.finalize().into_bytes())
    }
}

/// A voter auth token, set as a cookie once an authentication flow completes.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoterToken {
    #[serde(flatten)]
    pub identity: VoterIdentity,
    #[serde(rename = "exp", with = "ts_seconds")]
    expire_at: DateTime<Utc>,
}

impl VoterToken {
    // Token serialization never fails.
    #[allow(clippy::missing_panics_doc)]
    /// Wrap an identity into a signed cookie.
    pub fn into_cookie(identity: VoterIdentity, config: &Config) -> Cookie<'static> {
        let token = Self {
            identity,
            expire_at: Utc::now() + config.auth_ttl(),
        };
        Cookie::build(
            VOTER_COOKIE,
            jsonwebtoken::encode(
                &Header::default(),
                &token,
                &EncodingKey::from_secret(config.jwt_secret()),
            )
            .unwrap(),
        )
        .max_age(Duration::seconds(config.auth_ttl().num_seconds()))
        .http_only(true)
        .same_site(SameSite::Strict)
        .finish()
    }

    /// Deserialize a token from a cookie.
    pub fn from_cookie(cookie: &Cookie<'static>, config: &Config) -> Result<Self, JwtError> {
        jsonwebtoken::decode(
            cookie.value(),
            &DecodingKey::from_secret(config.jwt_secret()),
            &Validation::default(),
        )
        .map(|data: TokenData<Self>| data.claims)
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for VoterIdentity {
    type Error = VoterTokenError;

    /// Get the voter identity from the auth cookie.
    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let config = req.guard::<&State<Config>>().await.unwrap(); // Valid as `Config` is always managed

        let cookie = try_outcome!(req
            .cookies()
            .get_private(VOTER_COOKIE)
            .into_outcome((Status::Unauthorized, VoterTokenError::Missing)));

        let token = try_outcome!(VoterToken::from_cookie(&cookie, config)
            .map_err(VoterTokenError::Jwt)
            .into_outcome(Status::Unauthorized));

        request::Outcome::Success(token.identity)
    }
}

#[derive(Debug, Error)]
pub enum VoterTokenError {
    #[error("Missing `voter` cookie")]
    Missing,
    #[error(transparent)]
    Jwt(#[from] JwtError),
}

/// Example data for tests.
#[cfg(test)]
mod examples {
    use super::*;

    impl VoterIdentity {
        pub fn example() -> Self {
            Self {
                national_id: "38001085718".to_string(),
                country_code: "EE".to_string(),
                msisdn: None,
            }
        }
    }
}
