use chrono::{DateTime, Utc};
use mongodb::bson::{doc, serde_helpers::chrono_datetime_as_bson_datetime, Binary, Document};
use serde::{Deserialize, Serialize};

use crate::model::mongodb::Id;

/// A vote that has been opened for digital-signature ballots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    #[serde(rename = "_id")]
    pub id: Id,
    pub topic_id: Id,
    pub title: String,
    /// Option display values, as shown to the voter.
    pub options: Vec<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

/// The role a template file plays inside a voter's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateFileKind {
    /// The ballot text, an opaque blob converted upstream.
    Document,
    /// Machine-readable vote metadata.
    Metadata,
    /// One file per vote option; included only when chosen.
    Option,
}

/// A single template file of a vote's container file set.
///
/// Created once when the vote is opened for signing, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteContainerFile {
    #[serde(rename = "_id")]
    pub id: Id,
    pub vote_id: Id,
    pub kind: TemplateFileKind,
    pub file_name: String,
    pub mime_type: String,
    pub content: Binary,
}

/// A voter's individually signed container.
///
/// Written exactly once per (vote, voter) pair; never updated. Re-signing is
/// recorded in the [`SignedBallot`] ledger instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteUserContainer {
    #[serde(rename = "_id")]
    pub id: Id,
    pub vote_id: Id,
    /// The voter's pseudonymous identifier.
    pub voter_hmac: String,
    pub container: Binary,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

/// One successfully signed ballot. A voter may sign repeatedly; only their
/// most recent ballot counts towards the results ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBallot {
    #[serde(rename = "_id")]
    pub id: Id,
    pub vote_id: Id,
    pub voter_hmac: String,
    /// Chosen option display values.
    pub selections: Vec<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

/// One row of the final results ledger: a voter's effective ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub voter: String,
    pub selections: Vec<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

/// The aggregation that collapses superseded ballots into one effective
/// ballot per voter: partition by voter, order by creation time (ties broken
/// by the document ID), take the most recent.
pub fn latest_ballot_pipeline(vote_id: Id) -> Vec<Document> {
    vec![
        doc! { "$match": { "vote_id": vote_id } },
        doc! { "$sort": { "voter_hmac": 1, "created_at": -1, "_id": -1 } },
        doc! { "$group": {
            "_id": "$voter_hmac",
            "selections": { "$first": "$selections" },
            "created_at": { "$first": "$created_at" },
        } },
        doc! { "$sort": { "_id": 1 } },
        doc! { "$project": {
            "_id": 0,
            "voter": "$_id",
            "selections": 1,
            "created_at": 1,
        } },
    ]
}

#[cfg(test)]
mod tests {
    use mongodb::bson::oid::ObjectId;

    use super::*;

    #[test]
    fn pipeline_collapses_to_latest_per_voter() {
        let pipeline = latest_ballot_pipeline(ObjectId::new().into());

        // Ordering must be newest-first with an explicit tie-breaker, so that
        // `$first` picks each voter's effective ballot.
        let sort = pipeline[1].get_document("$sort").unwrap();
        assert_eq!(sort.get_i32("created_at").unwrap(), -1);
        assert_eq!(sort.get_i32("_id").unwrap(), -1);

        let group = pipeline[2].get_document("$group").unwrap();
        assert_eq!(group.get_str("_id").unwrap(), "$voter_hmac");
        assert!(group
            .get_document("selections")
            .unwrap()
            .contains_key("$first"));
    }
}
