use mongodb::bson::doc;
use rocket::{fs::NamedFile, http::Status, Route, State};

use crate::archive::{
    final_container_path, generate_final_archive, get_or_generate, wrap_archive,
    wrapped_archive_path,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::mongodb::{Coll, Id};
use crate::model::vote::{SignedBallot, Vote, VoteContainerFile, VoteUserContainer};

pub fn routes() -> Vec<Route> {
    routes![final_archive]
}

/// Download the aggregate archive for a vote: every voter's signed container
/// plus the results ledger. Cached on disk after the first generation;
/// `?wrap=zip` serves the re-packaged plain-ZIP variant.
#[get("/topics/<topic_id>/votes/<vote_id>/archive?<wrap>")]
async fn final_archive(
    topic_id: Id,
    vote_id: Id,
    wrap: Option<String>,
    votes: Coll<Vote>,
    files: Coll<VoteContainerFile>,
    containers: Coll<VoteUserContainer>,
    ballots: Coll<SignedBallot>,
    config: &State<Config>,
) -> Result<NamedFile> {
    votes
        .find_one(doc! { "_id": vote_id, "topic_id": topic_id }, None)
        .await?
        .ok_or_else(|| Error::Status(Status::NotFound, format!("Vote {vote_id} not found")))?;

    let path = final_container_path(config.files_dir(), topic_id, vote_id);

    match wrap.as_deref() {
        None => {
            get_or_generate(&path, |p| async move {
                generate_final_archive(&files, &containers, &ballots, vote_id, &p).await
            })
            .await?;
            Ok(NamedFile::open(path).await?)
        }
        Some("zip") => {
            let wrapped = wrapped_archive_path(config.files_dir(), topic_id, vote_id);
            // A cached wrapped file wins; otherwise make sure the inner
            // archive exists, then re-package it.
            let inner = &path;
            get_or_generate(&wrapped, |p| async move {
                get_or_generate(inner, |q| async move {
                    generate_final_archive(&files, &containers, &ballots, vote_id, &q).await
                })
                .await?;
                wrap_archive(inner, &p)
            })
            .await?;
            Ok(NamedFile::open(wrapped).await?)
        }
        Some(other) => Err(Error::Status(
            Status::BadRequest,
            format!("unsupported wrap format {other:?}"),
        )),
    }
}
