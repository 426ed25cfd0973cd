use chrono::Utc;
use mongodb::bson::{doc, oid::ObjectId};
use rocket::futures::TryStreamExt;
use rocket::{http::Status, serde::json::Json, Route, State};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::container::assembler::create_template_files;
use crate::error::{Error, Result};
use crate::model::mongodb::{Coll, Id};
use crate::model::phone::Msisdn;
use crate::model::vote::{SignedBallot, Vote, VoteContainerFile, VoteUserContainer};
use crate::model::voter::VoterIdentity;
use crate::signing::orchestrator;
use crate::signing::pki::RpcClient;
use crate::signing::remote::RemoteClient;
use crate::signing::session::SigningSession;
use crate::signing::{SigningProvider, SigningStatus};

pub fn routes() -> Vec<Route> {
    routes![create_vote, begin_sign, sign_status, finalize_sign]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateVoteRequest {
    title: String,
    /// The ballot text, already converted upstream; consumed as a blob.
    document: String,
    document_mime: String,
    options: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateVoteResponse {
    id: Id,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest {
    provider: SigningProvider,
    selections: Vec<String>,
    /// Base64 DER signer certificate; required for smartcard signing.
    certificate: Option<String>,
    /// Overrides the authenticated number for phone signing.
    phone: Option<Msisdn>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignBeginResponse {
    token: String,
    status: SigningStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    challenge_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    digest_to_sign: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignStatusResponse {
    status: SigningStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeRequest {
    token: String,
    /// Base64 signature value produced by the voter's smartcard.
    signature_value: String,
}

/// Look up a vote and check it belongs to the topic in the URL.
async fn vote_in_topic(votes: &Coll<Vote>, topic_id: Id, vote_id: Id) -> Result<Vote> {
    votes
        .find_one(doc! { "_id": vote_id, "topic_id": topic_id }, None)
        .await?
        .ok_or_else(|| Error::Status(Status::NotFound, format!("Vote {vote_id} not found")))
}

/// Open a vote for signing: persist the vote and build its immutable
/// template file set.
#[post("/topics/<topic_id>/votes", data = "<request>", format = "json")]
async fn create_vote(
    topic_id: Id,
    request: Json<CreateVoteRequest>,
    votes: Coll<Vote>,
    files: Coll<VoteContainerFile>,
) -> Result<Json<CreateVoteResponse>> {
    let request = request.into_inner();
    if request.options.is_empty() {
        return Err(Error::Status(
            Status::BadRequest,
            "a vote needs at least one option".to_string(),
        ));
    }

    let vote = Vote {
        id: ObjectId::new().into(),
        topic_id,
        title: request.title,
        options: request.options,
        created_at: Utc::now(),
    };
    let template_files =
        create_template_files(&vote, request.document.as_bytes(), &request.document_mime)?;

    votes.insert_one(&vote, None).await?;
    files.insert_many(&template_files, None).await?;
    info!(
        "vote {} opened for signing with {} template files",
        vote.id,
        template_files.len()
    );

    Ok(Json(CreateVoteResponse { id: vote.id }))
}

/// Begin a signing session for the authenticated voter.
#[post(
    "/topics/<topic_id>/votes/<vote_id>/sign",
    data = "<request>",
    format = "json"
)]
async fn begin_sign(
    topic_id: Id,
    vote_id: Id,
    identity: VoterIdentity,
    request: Json<SignRequest>,
    votes: Coll<Vote>,
    files: Coll<VoteContainerFile>,
    pki: &State<RpcClient>,
    remote: &State<RemoteClient>,
    config: &State<Config>,
) -> Result<Json<SignBeginResponse>> {
    let vote = vote_in_topic(&votes, topic_id, vote_id).await?;
    let template_files: Vec<VoteContainerFile> = files
        .find(doc! { "vote_id": vote.id }, None)
        .await?
        .try_collect()
        .await?;

    let request = request.into_inner();
    let mut voter = identity;
    if voter.msisdn.is_none() {
        voter.msisdn = request.phone;
    }

    let outcome = orchestrator::begin_signing(
        pki,
        remote,
        config,
        &vote,
        &template_files,
        request.provider,
        voter,
        request.selections,
        request.certificate,
    )
    .await?;

    Ok(Json(SignBeginResponse {
        token: outcome
            .session
            .into_token(config.jwt_secret(), config.session_ttl()),
        status: SigningStatus::ChallengeIssued,
        challenge_code: outcome.challenge_code,
        digest_to_sign: outcome.digest_to_sign,
    }))
}

/// Poll a signing session. The caller drives the cadence; a terminal status
/// means polling must stop.
#[get("/topics/<topic_id>/votes/<vote_id>/sign/status?<token>")]
async fn sign_status(
    topic_id: Id,
    vote_id: Id,
    token: String,
    votes: Coll<Vote>,
    files: Coll<VoteContainerFile>,
    containers: Coll<VoteUserContainer>,
    ballots: Coll<SignedBallot>,
    pki: &State<RpcClient>,
    remote: &State<RemoteClient>,
    config: &State<Config>,
) -> Result<Json<SignStatusResponse>> {
    vote_in_topic(&votes, topic_id, vote_id).await?;
    let session = SigningSession::from_token(&token, config.jwt_secret())?;
    if session.vote_id != vote_id {
        return Err(Error::Status(
            Status::BadRequest,
            "session token belongs to a different vote".to_string(),
        ));
    }

    let outcome =
        orchestrator::poll_signing(pki, remote, config, &files, &containers, &ballots, &session)
            .await?;
    if outcome.status.is_terminal() {
        info!(
            "signing session for vote {vote_id} finished as {:?}",
            outcome.status
        );
    }
    Ok(Json(SignStatusResponse {
        status: outcome.status,
        message: outcome.message,
    }))
}

/// Complete a smartcard session with the locally produced signature value.
#[post(
    "/topics/<topic_id>/votes/<vote_id>/sign/finalize",
    data = "<request>",
    format = "json"
)]
async fn finalize_sign(
    topic_id: Id,
    vote_id: Id,
    request: Json<FinalizeRequest>,
    votes: Coll<Vote>,
    containers: Coll<VoteUserContainer>,
    ballots: Coll<SignedBallot>,
    pki: &State<RpcClient>,
    config: &State<Config>,
) -> Result<Json<SignStatusResponse>> {
    vote_in_topic(&votes, topic_id, vote_id).await?;
    let request = request.into_inner();
    let session = SigningSession::from_token(&request.token, config.jwt_secret())?;
    if session.vote_id != vote_id {
        return Err(Error::Status(
            Status::BadRequest,
            "session token belongs to a different vote".to_string(),
        ));
    }

    let outcome = orchestrator::finalize_signing(
        pki,
        config,
        &containers,
        &ballots,
        &session,
        &request.signature_value,
    )
    .await?;
    Ok(Json(SignStatusResponse {
        status: outcome.status,
        message: outcome.message,
    }))
}
