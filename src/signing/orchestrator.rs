use std::collections::HashSet;

use chrono::Utc;
use data_encoding::BASE64;
use mongodb::bson::{doc, oid::ObjectId, spec::BinarySubtype, Binary, Bson};
use mongodb::options::UpdateOptions;
use rocket::http::Status;

use crate::config::Config;
use crate::container::assembler::{build_user_container, option_file_name};
use crate::container::CONTAINER_MIME_TYPE;
use crate::error::{Error, Result};
use crate::model::mongodb::Coll;
use crate::model::vote::{SignedBallot, Vote, VoteContainerFile, VoteUserContainer};
use crate::model::voter::VoterIdentity;
use crate::signing::phone::PhoneStatus;
use crate::signing::pki::{PkiSession, RpcClient};
use crate::signing::remote::RemoteClient;
use crate::signing::session::{ProviderState, SigningSession};
use crate::signing::{challenge_code, container_digest, SigningProvider, SigningStatus};

/// Name under which the voter's container travels through the RPC gateway.
const GATEWAY_DATA_FILE: &str = "vote.bdoc";
/// Default challenge language for the phone provider.
const DEFAULT_LANGUAGE: &str = "EST";

/// Everything a `begin` call hands back to the voter.
#[derive(Debug)]
pub struct BeginOutcome {
    pub session: SigningSession,
    /// Shown to the voter to confirm the phone/app prompt (phone/remote).
    pub challenge_code: Option<String>,
    /// Digest the voter's smartcard must sign locally (PKI only).
    pub digest_to_sign: Option<String>,
}

/// Normalized result of a poll or finalize call.
#[derive(Debug)]
pub struct PollOutcome {
    pub status: SigningStatus,
    /// Failure detail for the voter, when there is one.
    pub message: Option<String>,
}

impl PollOutcome {
    fn of(status: SigningStatus) -> Self {
        Self {
            status,
            message: None,
        }
    }

    fn failed(status: SigningStatus, message: String) -> Self {
        Self {
            status,
            message: Some(message),
        }
    }
}

/// Check every submitted selection against the vote's options, by the same
/// sanitized name the container filtering uses.
fn validate_selections(vote: &Vote, selections: &[String]) -> Result<()> {
    if selections.is_empty() {
        return Err(Error::Status(
            Status::BadRequest,
            "at least one option must be selected".to_string(),
        ));
    }
    let known: HashSet<String> = vote
        .options
        .iter()
        .map(|o| option_file_name(o))
        .collect::<Result<_>>()?;
    for selection in selections {
        if !known.contains(&option_file_name(selection)?) {
            return Err(Error::Status(
                Status::NotFound,
                format!("Option {selection:?} not found"),
            ));
        }
    }
    Ok(())
}

/// Start a signing session: build the voter's container, hash it, and hand
/// it to the chosen provider. Returns the session as plain data; the caller
/// wraps it into a token for the voter.
#[allow(clippy::too_many_arguments)]
pub async fn begin_signing(
    pki: &RpcClient,
    remote: &RemoteClient,
    config: &Config,
    vote: &Vote,
    files: &[VoteContainerFile],
    provider: SigningProvider,
    voter: VoterIdentity,
    selections: Vec<String>,
    certificate_b64: Option<String>,
) -> Result<BeginOutcome> {
    validate_selections(vote, &selections)?;

    let pseudonym = voter.pseudonym(config);
    let container = build_user_container(
        files,
        &selections,
        &pseudonym,
        &voter.country_code,
        None,
    )?;
    let digest = container_digest(&container);

    let (state, challenge, digest_to_sign) = match provider {
        SigningProvider::Pki => {
            let certificate = certificate_b64.ok_or_else(|| {
                Error::Status(
                    Status::BadRequest,
                    "smartcard signing requires the signer certificate".to_string(),
                )
            })?;
            let session = pki.start_session().await?;
            pki.check_certificate(&certificate).await?;
            pki.create_signed_doc(&session).await?;
            pki.add_data_file_content(&session, GATEWAY_DATA_FILE, CONTAINER_MIME_TYPE, &container)
                .await?;
            let prepared = pki.prepare_signature(&session, &certificate).await?;
            (
                ProviderState::Pki {
                    sesscode: session.sesscode,
                    signature_id: Some(prepared.signature_id),
                },
                None,
                Some(prepared.digest_to_sign),
            )
        }
        SigningProvider::Phone => {
            let msisdn = voter.msisdn.as_ref().ok_or_else(|| {
                Error::Status(
                    Status::BadRequest,
                    "phone signing requires a phone number".to_string(),
                )
            })?;
            let session = pki.start_session().await?;
            pki.create_signed_doc(&session).await?;
            pki.add_data_file_hash(
                &session,
                GATEWAY_DATA_FILE,
                CONTAINER_MIME_TYPE,
                container.len(),
                &digest,
            )
            .await?;
            pki.mobile_sign(
                &session,
                &voter.national_id,
                &msisdn.to_string(),
                DEFAULT_LANGUAGE,
            )
            .await?;
            (
                ProviderState::Phone {
                    sesscode: session.sesscode,
                },
                Some(challenge_code(&digest)),
                None,
            )
        }
        SigningProvider::Remote => {
            // Resolve the signer certificate up front; a voter without one
            // (or with someone else's) fails before any challenge is pushed.
            let certificate = remote
                .get_certificate(&voter.country_code, &voter.national_id)
                .await?;
            let info = crate::certificate::from_der(&certificate)?;
            if info.national_id != voter.national_id {
                return Err(Error::Status(
                    Status::Conflict,
                    "signer certificate does not match the voter".to_string(),
                ));
            }
            let started = remote
                .sign(&voter.country_code, &voter.national_id, &digest)
                .await?;
            (
                ProviderState::Remote {
                    session_id: started.session_id,
                },
                Some(started.challenge_code),
                None,
            )
        }
    };

    let session = SigningSession {
        provider,
        vote_id: vote.id,
        voter,
        selections,
        digest: BASE64.encode(&digest),
        challenge_code: challenge.clone(),
        state,
    };
    info!(
        "signing session started: provider {provider:?}, vote {}",
        vote.id
    );
    Ok(BeginOutcome {
        session,
        challenge_code: challenge,
        digest_to_sign,
    })
}

/// Poll a signing session. On terminal success the signed container and the
/// ballot ledger row are persisted before `Signed` is reported.
pub async fn poll_signing(
    pki: &RpcClient,
    remote: &RemoteClient,
    config: &Config,
    files: &Coll<VoteContainerFile>,
    containers: &Coll<VoteUserContainer>,
    ballots: &Coll<SignedBallot>,
    session: &SigningSession,
) -> Result<PollOutcome> {
    match &session.state {
        ProviderState::Pki { .. } => {
            // Smartcard signing completes through `finalize_signing`; until
            // then the voter's browser still holds the digest.
            Ok(PollOutcome::of(SigningStatus::ChallengeIssued))
        }
        ProviderState::Phone { sesscode } => {
            let gateway_session = PkiSession {
                sesscode: *sesscode,
            };
            let status = pki.get_status_info(&gateway_session, false).await?;
            match status {
                PhoneStatus::Signature => {
                    let signed = pki.get_signed_doc(&gateway_session).await?;
                    persist_signed(containers, ballots, config, session, signed).await?;
                    if let Err(e) = pki.close_session(&gateway_session).await {
                        warn!("failed to close gateway session {sesscode}: {e}");
                    }
                    Ok(PollOutcome::of(SigningStatus::Signed))
                }
                other => match other.normalize() {
                    SigningStatus::Failed => Ok(PollOutcome::failed(
                        SigningStatus::Failed,
                        other.describe(),
                    )),
                    status => Ok(PollOutcome::of(status)),
                },
            }
        }
        ProviderState::Remote { session_id } => {
            let status = remote.session_status(session_id).await?;
            match status.normalize() {
                SigningStatus::Signed => {
                    let certificate = status.certificate_der()?.ok_or(Error::RemoteFault {
                        code: "MALFORMED_RESPONSE".to_string(),
                        message: "completed session lacks a certificate".to_string(),
                    })?;
                    let info = crate::certificate::from_der(&certificate)?;
                    if info.national_id != session.voter.national_id {
                        return Err(Error::Status(
                            Status::Conflict,
                            "signer certificate does not match the session voter".to_string(),
                        ));
                    }
                    let signature = status.signature.as_ref().ok_or(Error::RemoteFault {
                        code: "MALFORMED_RESPONSE".to_string(),
                        message: "completed session lacks a signature".to_string(),
                    })?;
                    let signature_der = crate::signing::pki::decode_base64(&signature.value)?;
                    let signed =
                        rebuild_signed_container(files, session, config, &signature_der).await?;
                    persist_signed(containers, ballots, config, session, signed).await?;
                    Ok(PollOutcome::of(SigningStatus::Signed))
                }
                SigningStatus::Failed => Ok(PollOutcome::failed(
                    SigningStatus::Failed,
                    status.end_result().to_string(),
                )),
                other => Ok(PollOutcome::of(other)),
            }
        }
    }
}

/// Complete a smartcard session with the locally produced signature value.
pub async fn finalize_signing(
    pki: &RpcClient,
    config: &Config,
    containers: &Coll<VoteUserContainer>,
    ballots: &Coll<SignedBallot>,
    session: &SigningSession,
    signature_value_b64: &str,
) -> Result<PollOutcome> {
    let (sesscode, signature_id) = match &session.state {
        ProviderState::Pki {
            sesscode,
            signature_id: Some(signature_id),
        } => (*sesscode, signature_id.clone()),
        ProviderState::Pki {
            signature_id: None, ..
        } => return Err(Error::SessionNotStarted),
        _ => {
            return Err(Error::Status(
                Status::BadRequest,
                "only smartcard sessions are finalized with a signature value".to_string(),
            ))
        }
    };

    let gateway_session = PkiSession { sesscode };
    pki.finalize_signature(&gateway_session, &signature_id, signature_value_b64)
        .await?;
    let signed = pki.get_signed_doc(&gateway_session).await?;
    persist_signed(containers, ballots, config, session, signed).await?;
    if let Err(e) = pki.close_session(&gateway_session).await {
        warn!("failed to close gateway session {sesscode}: {e}");
    }
    Ok(PollOutcome::of(SigningStatus::Signed))
}

/// Rebuild the voter's container byte-identically and embed the detached
/// signature the remote provider returned.
async fn rebuild_signed_container(
    files: &Coll<VoteContainerFile>,
    session: &SigningSession,
    config: &Config,
    signature: &[u8],
) -> Result<Vec<u8>> {
    use rocket::futures::TryStreamExt;

    let template_files: Vec<VoteContainerFile> = files
        .find(doc! { "vote_id": session.vote_id }, None)
        .await?
        .try_collect()
        .await?;
    build_user_container(
        &template_files,
        &session.selections,
        &session.voter.pseudonym(config),
        &session.voter.country_code,
        Some(signature),
    )
}

/// Persist the signed outcome: the evidentiary container exactly once per
/// (vote, voter), plus a ledger row per signing.
async fn persist_signed(
    containers: &Coll<VoteUserContainer>,
    ballots: &Coll<SignedBallot>,
    config: &Config,
    session: &SigningSession,
    container: Vec<u8>,
) -> Result<()> {
    let pseudonym = session.voter.pseudonym(config);
    let now = Utc::now();

    // The unique index makes this append-once: a re-signing voter keeps
    // their original evidence row and gets a fresh ledger entry.
    let filter = doc! { "vote_id": session.vote_id, "voter_hmac": &pseudonym };
    let update = doc! { "$setOnInsert": {
        "vote_id": session.vote_id,
        "voter_hmac": &pseudonym,
        "container": Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: container,
        }),
        "created_at": mongodb::bson::DateTime::from_chrono(now),
    } };
    let options = UpdateOptions::builder().upsert(true).build();
    containers.update_one(filter, update, options).await?;

    let ballot = SignedBallot {
        id: ObjectId::new().into(),
        vote_id: session.vote_id,
        voter_hmac: pseudonym,
        selections: session.selections.clone(),
        created_at: now,
    };
    ballots.insert_one(&ballot, None).await?;
    info!("ballot recorded for vote {}", session.vote_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use mongodb::bson::oid::ObjectId;

    use super::*;

    fn example_vote() -> Vote {
        Vote {
            id: ObjectId::new().into(),
            topic_id: ObjectId::new().into(),
            title: "AGM".to_string(),
            options: vec!["Yes".to_string(), "No".to_string()],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn selections_must_match_an_option() {
        let vote = example_vote();
        assert!(validate_selections(&vote, &["Yes".to_string()]).is_ok());
        assert!(matches!(
            validate_selections(&vote, &["Maybe".to_string()]),
            Err(Error::Status(s, _)) if s == Status::NotFound
        ));
    }

    #[test]
    fn selections_match_by_sanitized_name() {
        let vote = example_vote();
        // Sanitizes to "Yes", which is a known option file.
        assert!(validate_selections(&vote, &["Ye/s".to_string()]).is_ok());
    }

    #[test]
    fn empty_selections_are_rejected() {
        let vote = example_vote();
        assert!(matches!(
            validate_selections(&vote, &[]),
            Err(Error::Status(s, _)) if s == Status::BadRequest
        ));
    }
}
