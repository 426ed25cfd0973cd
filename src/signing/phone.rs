use std::str::FromStr;

use data_encoding::HEXUPPER;
use serde::{Deserialize, Serialize};

use crate::certificate::{self, PersonalInfo};
use crate::error::Result;
use crate::signing::pki::{PkiSession, RpcClient};
use crate::signing::{challenge_code, SigningStatus};

/// A started phone-challenge flow: the gateway session plus the display code
/// the voter confirms against their phone prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneChallenge {
    pub session: PkiSession,
    pub challenge_code: String,
}

/// Transaction states reported by the gateway for phone-challenge flows.
///
/// Only `OUTSTANDING_TRANSACTION` (and the initial request acknowledgement)
/// keep a poll loop alive; every other state is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhoneStatus {
    RequestOk,
    Outstanding,
    Signature,
    UserAuthenticated,
    Expired,
    UserCancel,
    NotValid,
    SendingError,
    SimError,
    PhoneAbsent,
    RevokedCertificate,
    InternalError,
    Other(String),
}

impl FromStr for PhoneStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "OK" | "REQUEST_OK" => Self::RequestOk,
            "OUTSTANDING_TRANSACTION" => Self::Outstanding,
            "SIGNATURE" => Self::Signature,
            "USER_AUTHENTICATED" => Self::UserAuthenticated,
            "EXPIRED_TRANSACTION" => Self::Expired,
            "USER_CANCEL" => Self::UserCancel,
            "NOT_VALID" => Self::NotValid,
            "SENDING_ERROR" => Self::SendingError,
            "SIM_ERROR" => Self::SimError,
            "PHONE_ABSENT" => Self::PhoneAbsent,
            "REVOKED_CERTIFICATE" => Self::RevokedCertificate,
            "INTERNAL_ERROR" => Self::InternalError,
            other => Self::Other(other.to_string()),
        })
    }
}

impl PhoneStatus {
    /// Collapse a gateway state into the normalized session status.
    pub fn normalize(&self) -> SigningStatus {
        match self {
            Self::RequestOk | Self::Outstanding => SigningStatus::Polling,
            Self::Signature | Self::UserAuthenticated => SigningStatus::Signed,
            Self::Expired => SigningStatus::Expired,
            _ => SigningStatus::Failed,
        }
    }

    /// A human-readable description for the voter, so they can tell a
    /// retryable outage from an explicit rejection.
    pub fn describe(&self) -> String {
        match self {
            Self::UserCancel => "cancelled on the phone".to_string(),
            Self::PhoneAbsent => "phone unreachable".to_string(),
            Self::SimError => "SIM application error".to_string(),
            Self::SendingError => "challenge could not be delivered".to_string(),
            Self::NotValid => "signature not valid".to_string(),
            Self::RevokedCertificate => "certificate revoked".to_string(),
            Self::InternalError => "gateway internal error".to_string(),
            Self::Other(s) => s.clone(),
            _ => format!("{self:?}"),
        }
    }
}

/// Phone-challenge operations; these share the PKI gateway endpoint and its
/// session handles.
impl RpcClient {
    /// `MobileAuthenticate`: start a log-in flow. The display code is derived
    /// from the challenge seed locally, exactly as the phone derives it.
    pub async fn mobile_authenticate(
        &self,
        national_id: &str,
        msisdn: &str,
        language: &str,
        seed: &[u8],
    ) -> Result<PhoneChallenge> {
        let fields = self
            .call(
                "MobileAuthenticate",
                &[
                    ("IDCode", national_id.to_string()),
                    ("PhoneNo", msisdn.to_string()),
                    ("Language", language.to_string()),
                    ("ServiceName", self.service_name().to_string()),
                    ("SPChallenge", HEXUPPER.encode(seed)),
                    ("MessagingMode", "asynchClientServer".to_string()),
                ],
            )
            .await?;
        let sesscode = parse_sesscode(&fields)?;
        Ok(PhoneChallenge {
            session: PkiSession { sesscode },
            challenge_code: challenge_code(seed),
        })
    }

    /// `GetMobileAuthenticateStatus`: poll an authentication flow. Terminal
    /// success is `USER_AUTHENTICATED` (or a plain `OK` carrying the signer
    /// data); the signer's identity is then parsed from the certificate
    /// common name in the response.
    pub async fn mobile_authenticate_status(
        &self,
        session: &PkiSession,
        wait: bool,
    ) -> Result<(SigningStatus, Option<PersonalInfo>)> {
        let fields = self
            .call(
                "GetMobileAuthenticateStatus",
                &[
                    ("Sesscode", session.sesscode.to_string()),
                    ("WaitSignature", wait.to_string()),
                ],
            )
            .await?;
        let status: PhoneStatus = fields
            .get("Status")
            .map(String::as_str)
            .unwrap_or("INTERNAL_ERROR")
            .parse()
            .unwrap();
        let authenticated = matches!(status, PhoneStatus::UserAuthenticated)
            || (matches!(status, PhoneStatus::RequestOk) && fields.contains_key("UserCN"));
        if authenticated {
            let cn = fields.get("UserCN").ok_or(crate::error::Error::RemoteFault {
                code: "MALFORMED_RESPONSE".to_string(),
                message: "authenticated response lacks UserCN".to_string(),
            })?;
            let identity = certificate::from_common_name(cn)?;
            Ok((SigningStatus::Signed, Some(identity)))
        } else {
            Ok((status.normalize(), None))
        }
    }

    /// `MobileSign`: ask the gateway to push a signing challenge to the
    /// voter's phone for the session's prepared container.
    pub async fn mobile_sign(
        &self,
        session: &PkiSession,
        national_id: &str,
        msisdn: &str,
        language: &str,
    ) -> Result<()> {
        let fields = self
            .call(
                "MobileSign",
                &[
                    ("Sesscode", session.sesscode.to_string()),
                    ("SignerIDCode", national_id.to_string()),
                    ("SignerPhoneNo", msisdn.to_string()),
                    ("Language", language.to_string()),
                    ("AdditionalDataToBeDisplayed", self.service_name().to_string()),
                    ("MessagingMode", "asynchClientServer".to_string()),
                ],
            )
            .await?;
        let status: PhoneStatus = fields
            .get("Status")
            .map(String::as_str)
            .unwrap_or("INTERNAL_ERROR")
            .parse()
            .unwrap();
        match status {
            PhoneStatus::RequestOk | PhoneStatus::Outstanding => Ok(()),
            other => Err(crate::error::Error::RemoteFault {
                code: format!("{other:?}"),
                message: other.describe(),
            }),
        }
    }

    /// `GetStatusInfo`: poll a signing flow. The caller decides the polling
    /// cadence; this client never polls on its own.
    pub async fn get_status_info(&self, session: &PkiSession, wait: bool) -> Result<PhoneStatus> {
        let fields = self
            .call(
                "GetStatusInfo",
                &[
                    ("Sesscode", session.sesscode.to_string()),
                    ("ReturnDocInfo", "false".to_string()),
                    ("WaitSignature", wait.to_string()),
                ],
            )
            .await?;
        Ok(fields
            .get("Status")
            .map(String::as_str)
            .unwrap_or("INTERNAL_ERROR")
            .parse()
            .unwrap())
    }
}

fn parse_sesscode(fields: &std::collections::BTreeMap<String, String>) -> Result<i64> {
    fields
        .get("Sesscode")
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(crate::error::Error::RemoteFault {
            code: "MALFORMED_RESPONSE".to_string(),
            message: "response lacks a numeric Sesscode".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_map_to_session_states() {
        let cases = [
            ("OUTSTANDING_TRANSACTION", SigningStatus::Polling),
            ("OK", SigningStatus::Polling),
            ("SIGNATURE", SigningStatus::Signed),
            ("USER_AUTHENTICATED", SigningStatus::Signed),
            ("EXPIRED_TRANSACTION", SigningStatus::Expired),
            ("USER_CANCEL", SigningStatus::Failed),
            ("PHONE_ABSENT", SigningStatus::Failed),
            ("SOMETHING_NEW", SigningStatus::Failed),
        ];
        for (status, expected) in cases {
            let parsed: PhoneStatus = status.parse().unwrap();
            assert_eq!(parsed.normalize(), expected, "status {status}");
        }
    }

    #[test]
    fn failure_states_describe_themselves() {
        let status: PhoneStatus = "USER_CANCEL".parse().unwrap();
        assert_eq!(status.describe(), "cancelled on the phone");
        let status: PhoneStatus = "WEIRD".parse().unwrap();
        assert_eq!(status.describe(), "WEIRD");
    }
}
