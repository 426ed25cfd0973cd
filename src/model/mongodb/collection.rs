use std::ops::Deref;

use mongodb::{
    bson::doc, error::Error as DbError, options::IndexOptions, Collection, Database, IndexModel,
};
use rocket::{
    request::{self, FromRequest, Request},
    State,
};

use crate::model::vote::{SignedBallot, Vote, VoteContainerFile, VoteUserContainer};

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[rocket::async_trait]
impl<'r, T> FromRequest<'r> for Coll<T>
where
    T: MongoCollection,
{
    type Error = ();

    /// Get the database connection from the managed state and wrap it in a collection.
    ///
    /// Panics iff the [`Database`] is not managed by [`rocket::Rocket`].
    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let db = req.guard::<&State<Database>>().await.unwrap();
        request::Outcome::Success(Coll::from_db(db))
    }
}

impl MongoCollection for Vote {
    const NAME: &'static str = "votes";
}

impl MongoCollection for VoteContainerFile {
    const NAME: &'static str = "vote_container_files";
}

impl MongoCollection for VoteUserContainer {
    const NAME: &'static str = "vote_user_containers";
}

impl MongoCollection for SignedBallot {
    const NAME: &'static str = "signed_ballots";
}

/// Ensure that all the required indexes exist on the given database.
///
/// This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    let unique = IndexOptions::builder().unique(true).build();

    // Template files: one file name per vote.
    let file_index = IndexModel::builder()
        .keys(doc! {"vote_id": 1, "file_name": 1})
        .options(unique.clone())
        .build();
    Coll::<VoteContainerFile>::from_db(db)
        .create_index(file_index, None)
        .await?;

    // User containers: append-once per (vote, voter).
    let container_index = IndexModel::builder()
        .keys(doc! {"vote_id": 1, "voter_hmac": 1})
        .options(unique)
        .build();
    Coll::<VoteUserContainer>::from_db(db)
        .create_index(container_index, None)
        .await?;

    // Ballot ledger: supports the latest-ballot-per-voter aggregation.
    let ballot_index = IndexModel::builder()
        .keys(doc! {"vote_id": 1, "voter_hmac": 1, "created_at": -1})
        .build();
    Coll::<SignedBallot>::from_db(db)
        .create_index(ballot_index, None)
        .await?;

    Ok(())
}
