use chrono::{serde::ts_seconds, DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, TokenData, Validation};
use rocket::{http::CookieJar, serde::json::Json, Route, State};
use serde::{Deserialize, Serialize};

use crate::certificate::{self, PersonalInfo};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::phone::Msisdn;
use crate::model::voter::{VoterIdentity, VoterToken};
use crate::signing::pki::{PkiSession, RpcClient};
use crate::signing::remote::RemoteClient;
use crate::signing::{SigningProvider, SigningStatus};

const AUTH_LANGUAGE: &str = "EST";

pub fn routes() -> Vec<Route> {
    routes![phone_challenge, remote_challenge, auth_status, logout]
}

/// An in-flight authentication flow, serialised into a signed token the
/// client carries between the challenge and status calls.
#[derive(Debug, Serialize, Deserialize)]
struct AuthSession {
    provider: SigningProvider,
    #[serde(skip_serializing_if = "Option::is_none")]
    sesscode: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    msisdn: Option<Msisdn>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuthClaims {
    #[serde(flatten)]
    session: AuthSession,
    #[serde(rename = "exp", with = "ts_seconds")]
    expire_at: DateTime<Utc>,
}

impl AuthSession {
    // Session serialization never fails.
    #[allow(clippy::missing_panics_doc)]
    fn into_token(self, config: &Config) -> String {
        let claims = AuthClaims {
            session: self,
            expire_at: Utc::now() + config.session_ttl(),
        };
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.jwt_secret()),
        )
        .unwrap()
    }

    fn from_token(token: &str, config: &Config) -> Result<Self> {
        let data: TokenData<AuthClaims> = jsonwebtoken::decode(
            token,
            &DecodingKey::from_secret(config.jwt_secret()),
            &Validation::default(),
        )?;
        Ok(data.claims.session)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhoneAuthRequest {
    national_id: String,
    phone: Msisdn,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteAuthRequest {
    national_id: String,
    country_code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthChallengeResponse {
    token: String,
    challenge_code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthStatusResponse {
    status: SigningStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    voter: Option<PersonalInfo>,
}

/// Start a phone-challenge log-in. The returned code is displayed to the
/// user so they can check it against their phone prompt.
#[post("/auth/phone", data = "<request>", format = "json")]
async fn phone_challenge(
    request: Json<PhoneAuthRequest>,
    pki: &State<RpcClient>,
    config: &State<Config>,
) -> Result<Json<AuthChallengeResponse>> {
    let seed: [u8; 32] = rand::random();
    let challenge = pki
        .mobile_authenticate(
            &request.national_id,
            &request.phone.to_string(),
            AUTH_LANGUAGE,
            &seed,
        )
        .await?;

    let token = AuthSession {
        provider: SigningProvider::Phone,
        sesscode: Some(challenge.session.sesscode),
        session_id: None,
        msisdn: Some(request.into_inner().phone),
    }
    .into_token(config);

    Ok(Json(AuthChallengeResponse {
        token,
        challenge_code: challenge.challenge_code,
    }))
}

/// Start a remote-challenge log-in.
#[post("/auth/remote", data = "<request>", format = "json")]
async fn remote_challenge(
    request: Json<RemoteAuthRequest>,
    remote: &State<RemoteClient>,
    config: &State<Config>,
) -> Result<Json<AuthChallengeResponse>> {
    let seed: [u8; 32] = rand::random();
    let challenge = remote
        .authenticate(&request.country_code, &request.national_id, &seed)
        .await?;

    let token = AuthSession {
        provider: SigningProvider::Remote,
        sesscode: None,
        session_id: Some(challenge.session_id),
        msisdn: None,
    }
    .into_token(config);

    Ok(Json(AuthChallengeResponse {
        token,
        challenge_code: challenge.challenge_code,
    }))
}

/// Poll an authentication flow. On success the voter's identity is resolved
/// from the signer certificate and set as an auth cookie.
#[get("/auth/status?<token>")]
async fn auth_status(
    token: String,
    pki: &State<RpcClient>,
    remote: &State<RemoteClient>,
    config: &State<Config>,
    cookies: &CookieJar<'_>,
) -> Result<Json<AuthStatusResponse>> {
    let session = AuthSession::from_token(&token, config)?;

    let (status, info) = match session.provider {
        SigningProvider::Phone => {
            let sesscode = session.sesscode.ok_or(Error::SessionNotStarted)?;
            pki.mobile_authenticate_status(&PkiSession { sesscode }, false)
                .await?
        }
        SigningProvider::Remote => {
            let session_id = session.session_id.as_deref().ok_or(Error::SessionNotStarted)?;
            let poll = remote.session_status(session_id).await?;
            match poll.normalize() {
                SigningStatus::Signed => {
                    let der = poll.certificate_der()?.ok_or(Error::RemoteFault {
                        code: "MALFORMED_RESPONSE".to_string(),
                        message: "completed session lacks a certificate".to_string(),
                    })?;
                    (SigningStatus::Signed, Some(certificate::from_der(&der)?))
                }
                status => (status, None),
            }
        }
        SigningProvider::Pki => {
            return Err(Error::Status(
                rocket::http::Status::BadRequest,
                "smartcard authentication is not challenge-based".to_string(),
            ))
        }
    };

    if let Some(ref info) = info {
        let identity = VoterIdentity {
            national_id: info.national_id.clone(),
            country_code: info.country_code.clone(),
            msisdn: session.msisdn,
        };
        cookies.add_private(VoterToken::into_cookie(identity, config));
    }

    Ok(Json(AuthStatusResponse {
        status,
        voter: info,
    }))
}

#[delete("/auth")]
fn logout(cookies: &CookieJar<'_>) -> rocket::http::Status {
    cookies.remove_private(rocket::http::Cookie::named(
        crate::model::voter::VOTER_COOKIE,
    ));
    rocket::http::Status::Ok
}
