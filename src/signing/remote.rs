use data_encoding::BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::signing::{challenge_code, SigningStatus};

/// How many times `get_certificate` polls the session endpoint before
/// giving up. Interactive flows are caller-driven instead.
const CERTIFICATE_POLLS: u32 = 30;
const CERTIFICATE_POLL_INTERVAL_SECONDS: u64 = 2;

/// A started remote-challenge flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChallenge {
    pub session_id: String,
    pub challenge_code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RelyingPartyRequest {
    #[serde(rename = "relyingPartyUUID")]
    relying_party_uuid: String,
    relying_party_name: String,
    certificate_level: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash_type: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionStarted {
    #[serde(rename = "sessionID")]
    session_id: String,
}

/// One poll of `GET /session/{id}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: String,
    pub result: Option<SessionResult>,
    pub cert: Option<SessionCertificate>,
    pub signature: Option<SessionSignature>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResult {
    pub end_result: String,
    pub document_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCertificate {
    pub value: String,
    pub certificate_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSignature {
    pub value: String,
    pub algorithm: Option<String>,
}

impl SessionStatus {
    /// Whether the flow is still in progress.
    pub fn is_running(&self) -> bool {
        self.state == "RUNNING"
    }

    /// Collapse the poll result into the normalized session status.
    pub fn normalize(&self) -> SigningStatus {
        if self.is_running() {
            return SigningStatus::Polling;
        }
        match self.result.as_ref().map(|r| r.end_result.as_str()) {
            Some("OK") => SigningStatus::Signed,
            Some("TIMEOUT") => SigningStatus::Expired,
            _ => SigningStatus::Failed,
        }
    }

    /// The rejection reason, for surfacing to the voter.
    pub fn end_result(&self) -> &str {
        self.result
            .as_ref()
            .map(|r| r.end_result.as_str())
            .unwrap_or("UNKNOWN")
    }

    /// The DER certificate, when the response carries one.
    pub fn certificate_der(&self) -> Result<Option<Vec<u8>>> {
        match &self.cert {
            Some(cert) => {
                let der = BASE64
                    .decode(cert.value.replace(['\r', '\n'], "").as_bytes())
                    .map_err(|e| Error::MalformedCertificate(e.to_string()))?;
                Ok(Some(der))
            }
            None => Ok(None),
        }
    }
}

/// Client for the remote-challenge signing service: a stateless HTTPS/JSON
/// protocol keyed on server-side session IDs.
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    rp_uuid: String,
    rp_name: String,
    access_token: String,
}

impl RemoteClient {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        rp_uuid: String,
        rp_name: String,
        access_token: String,
    ) -> Self {
        Self {
            http,
            base_url,
            rp_uuid,
            rp_name,
            access_token,
        }
    }

    fn request_body(&self, hash: Option<String>) -> RelyingPartyRequest {
        let hash_type = hash.as_ref().map(|_| "SHA256");
        RelyingPartyRequest {
            relying_party_uuid: self.rp_uuid.clone(),
            relying_party_name: self.rp_name.clone(),
            certificate_level: "QUALIFIED",
            hash,
            hash_type,
        }
    }

    async fn start_session(&self, path: &str, hash: Option<String>) -> Result<String> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.access_token)
            .json(&self.request_body(hash))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::RemoteFault {
                code: status.as_u16().to_string(),
                message,
            });
        }
        let started: SessionStarted = response.json().await.map_err(|e| Error::RemoteFault {
            code: "MALFORMED_RESPONSE".to_string(),
            message: e.to_string(),
        })?;
        Ok(started.session_id)
    }

    /// Start an authentication flow. The seed feeds both the hash the voter
    /// signs and the display code they confirm.
    pub async fn authenticate(
        &self,
        country_code: &str,
        national_id: &str,
        seed: &[u8],
    ) -> Result<RemoteChallenge> {
        let hash = BASE64.encode(&Sha256::digest(seed));
        let session_id = self
            .start_session(
                &format!("/authentication/pno/{country_code}/{national_id}"),
                Some(hash),
            )
            .await?;
        Ok(RemoteChallenge {
            session_id,
            challenge_code: challenge_code(seed),
        })
    }

    /// Start a signing flow for an already computed document digest.
    pub async fn sign(
        &self,
        country_code: &str,
        national_id: &str,
        document_digest: &[u8],
    ) -> Result<RemoteChallenge> {
        let hash = BASE64.encode(document_digest);
        let session_id = self
            .start_session(
                &format!("/signature/pno/{country_code}/{national_id}"),
                Some(hash),
            )
            .await?;
        Ok(RemoteChallenge {
            session_id,
            challenge_code: challenge_code(document_digest),
        })
    }

    /// Start a certificate-choice flow (no hash travels).
    pub async fn certificate_choice(
        &self,
        country_code: &str,
        national_id: &str,
    ) -> Result<String> {
        self.start_session(
            &format!("/certificatechoice/pno/{country_code}/{national_id}"),
            None,
        )
        .await
    }

    /// Poll a session once.
    pub async fn session_status(&self, session_id: &str) -> Result<SessionStatus> {
        let response = self
            .http
            .get(format!("{}/session/{session_id}", self.base_url))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::RemoteFault {
                code: status.as_u16().to_string(),
                message,
            });
        }
        response.json().await.map_err(|e| Error::RemoteFault {
            code: "MALFORMED_RESPONSE".to_string(),
            message: e.to_string(),
        })
    }

    /// Fetch a signer certificate ahead of signing. The choice session is
    /// asynchronous on the service side, so this polls the session endpoint
    /// (bounded) until the certificate value appears.
    pub async fn get_certificate(&self, country_code: &str, national_id: &str) -> Result<Vec<u8>> {
        let session_id = self.certificate_choice(country_code, national_id).await?;
        for _ in 0..CERTIFICATE_POLLS {
            let status = self.session_status(&session_id).await?;
            if status.is_running() {
                rocket::tokio::time::sleep(std::time::Duration::from_secs(
                    CERTIFICATE_POLL_INTERVAL_SECONDS,
                ))
                .await;
                continue;
            }
            if let Some(der) = status.certificate_der()? {
                return Ok(der);
            }
            return Err(Error::RemoteFault {
                code: status.end_result().to_string(),
                message: "certificate choice did not yield a certificate".to_string(),
            });
        }
        Err(Error::RemoteFault {
            code: "TIMEOUT".to_string(),
            message: "certificate choice did not complete in time".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use rocket::serde::json::serde_json;

    use super::*;

    #[test]
    fn running_session_keeps_polling() {
        let status: SessionStatus = serde_json::from_str(r#"{"state":"RUNNING"}"#).unwrap();
        assert!(status.is_running());
        assert_eq!(status.normalize(), SigningStatus::Polling);
    }

    #[test]
    fn complete_ok_session_carries_signature_and_certificate() {
        let status: SessionStatus = serde_json::from_str(
            r#"{
                "state": "COMPLETE",
                "result": {"endResult": "OK", "documentNumber": "PNOEE-38001085718-MOCK-Q"},
                "cert": {"value": "aGVsbG8=", "certificateLevel": "QUALIFIED"},
                "signature": {"value": "c2ln", "algorithm": "sha256WithRSAEncryption"}
            }"#,
        )
        .unwrap();
        assert_eq!(status.normalize(), SigningStatus::Signed);
        assert_eq!(status.certificate_der().unwrap().unwrap(), b"hello");
        assert_eq!(status.signature.unwrap().value, "c2ln");
    }

    #[test]
    fn refused_and_timed_out_sessions_normalize() {
        let refused: SessionStatus = serde_json::from_str(
            r#"{"state":"COMPLETE","result":{"endResult":"USER_REFUSED"}}"#,
        )
        .unwrap();
        assert_eq!(refused.normalize(), SigningStatus::Failed);
        assert_eq!(refused.end_result(), "USER_REFUSED");

        let timeout: SessionStatus =
            serde_json::from_str(r#"{"state":"COMPLETE","result":{"endResult":"TIMEOUT"}}"#)
                .unwrap();
        assert_eq!(timeout.normalize(), SigningStatus::Expired);
    }

    #[test]
    fn bad_certificate_base64_is_malformed() {
        let status: SessionStatus = serde_json::from_str(
            r#"{"state":"COMPLETE","result":{"endResult":"OK"},"cert":{"value":"!!!"}}"#,
        )
        .unwrap();
        assert!(matches!(
            status.certificate_der(),
            Err(Error::MalformedCertificate(_))
        ));
    }
}
