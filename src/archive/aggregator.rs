use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use mongodb::bson::doc;
use rocket::futures::TryStreamExt;
use zip::{write::FileOptions, ZipWriter};

use crate::container::{ContainerBuilder, CONTAINER_MIME_TYPE};
use crate::error::{Error, Result};
use crate::model::mongodb::{Coll, Id};
use crate::model::vote::{
    latest_ballot_pipeline, LedgerRow, SignedBallot, VoteContainerFile, VoteUserContainer,
};

/// Name of the results ledger entry in the final archive.
pub const LEDGER_FILE_NAME: &str = "votes.csv";

fn csv_err(e: csv::Error) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, e))
}

fn bson_err(e: mongodb::bson::de::Error) -> Error {
    Error::CacheGeneration(format!("undecodable ledger row: {e}"))
}

/// Entry name of one voter's signed container inside the final archive.
fn user_entry_name(voter_hmac: &str) -> String {
    format!("{voter_hmac}.bdoc")
}

fn write_ledger_header<W: Write>(csv: &mut csv::Writer<W>) -> Result<()> {
    csv.write_record(["voter", "choice", "signed_at"])
        .map_err(csv_err)
}

/// One ledger row per chosen option of an effective ballot.
fn write_ledger_row<W: Write>(csv: &mut csv::Writer<W>, row: &LedgerRow) -> Result<()> {
    let signed_at = row.created_at.to_rfc3339();
    for choice in &row.selections {
        csv.write_record([row.voter.as_str(), choice.as_str(), signed_at.as_str()])
            .map_err(csv_err)?;
    }
    Ok(())
}

/// Build the final archive for a vote into `path`: every template file, one
/// entry per voter's signed container, then the results ledger, all streamed
/// through the container builder so no more than one blob is in memory at a
/// time.
pub async fn generate_final_archive(
    files: &Coll<VoteContainerFile>,
    containers: &Coll<VoteUserContainer>,
    ballots: &Coll<SignedBallot>,
    vote_id: Id,
    path: &Path,
) -> Result<()> {
    let sink = File::create(path)?;
    let mut builder = ContainerBuilder::open(sink)?;

    // Template entries, in their creation order.
    let mut file_cursor = files
        .find(doc! { "vote_id": vote_id }, None)
        .await?;
    while let Some(file) = file_cursor.try_next().await? {
        builder.append(&file.file_name, &file.mime_type, &file.content.bytes)?;
    }

    // One signed container per voter, streamed from the cursor.
    let mut container_cursor = containers
        .find(doc! { "vote_id": vote_id }, None)
        .await?;
    let mut voters = 0usize;
    while let Some(user) = container_cursor.try_next().await? {
        builder.append(
            &user_entry_name(&user.voter_hmac),
            CONTAINER_MIME_TYPE,
            &user.container.bytes,
        )?;
        voters += 1;
    }

    // The results ledger, streamed row by row from the collapse query.
    builder.start_entry(LEDGER_FILE_NAME, "text/csv")?;
    {
        let mut csv = csv::Writer::from_writer(&mut builder);
        write_ledger_header(&mut csv)?;
        let mut row_cursor = ballots
            .aggregate(latest_ballot_pipeline(vote_id), None)
            .await?;
        while let Some(document) = row_cursor.try_next().await? {
            let row: LedgerRow = mongodb::bson::from_document(document).map_err(bson_err)?;
            write_ledger_row(&mut csv, &row)?;
        }
        csv.flush().map_err(Error::Io)?;
    }

    // Only a fully streamed ledger reaches this point.
    builder.finalize()?;
    info!("final archive generated for vote {vote_id}: {voters} voters");
    Ok(())
}

/// Re-package a finished archive inside a plain compressed ZIP for download.
pub fn wrap_archive(source: &Path, target: &Path) -> Result<()> {
    let inner_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::CacheGeneration("archive has no file name".to_string()))?;

    let mut zip = ZipWriter::new(File::create(target)?);
    zip.start_file(inner_name, FileOptions::default())?;
    io::copy(&mut File::open(source)?, &mut zip)?;
    zip.finish()?;
    Ok(())
}

/// In-memory variant of the aggregation used by the shape tests: same entry
/// layout as [`generate_final_archive`], fed from plain values.
#[cfg(test)]
fn assemble_archive<W: Write + io::Seek>(
    sink: W,
    templates: &[(&str, &str, &[u8])],
    users: &[(&str, &[u8])],
    rows: Vec<LedgerRow>,
) -> Result<W> {
    let mut builder = ContainerBuilder::open(sink)?;
    for (name, mime, content) in templates {
        builder.append(name, mime, content)?;
    }
    for (voter, container) in users {
        builder.append(&user_entry_name(voter), CONTAINER_MIME_TYPE, container)?;
    }
    builder.start_entry(LEDGER_FILE_NAME, "text/csv")?;
    {
        let mut csv = csv::Writer::from_writer(&mut builder);
        write_ledger_header(&mut csv)?;
        for row in &rows {
            write_ledger_row(&mut csv, row)?;
        }
        csv.flush().map_err(Error::Io)?;
    }
    builder.finalize()
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use chrono::Utc;
    use zip::ZipArchive;

    use super::*;

    fn row(voter: &str, choice: &str) -> LedgerRow {
        LedgerRow {
            voter: voter.to_string(),
            selections: vec![choice.to_string()],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn final_archive_has_templates_users_and_ledger() {
        let sink = assemble_archive(
            Cursor::new(Vec::new()),
            &[
                ("document.html", "text/html", b"<p>AGM</p>" as &[u8]),
                ("metadata.json", "application/json", b"{}"),
                ("Yes.txt", "text/plain", b"Yes"),
                ("No.txt", "text/plain", b"No"),
            ],
            &[
                ("aaa", b"container-a" as &[u8]),
                ("bbb", b"container-b"),
                ("ccc", b"container-c"),
            ],
            vec![row("aaa", "Yes"), row("bbb", "Yes"), row("ccc", "No")],
        )
        .unwrap();

        let mut archive = ZipArchive::new(Cursor::new(sink.into_inner())).unwrap();
        for name in [
            "document.html",
            "metadata.json",
            "Yes.txt",
            "No.txt",
            "aaa.bdoc",
            "bbb.bdoc",
            "ccc.bdoc",
        ] {
            assert!(archive.by_name(name).is_ok(), "missing entry {name}");
        }

        let mut ledger = String::new();
        archive
            .by_name(LEDGER_FILE_NAME)
            .unwrap()
            .read_to_string(&mut ledger)
            .unwrap();
        let data_rows: Vec<&str> = ledger.lines().skip(1).collect();
        assert_eq!(data_rows.len(), 3);
        assert_eq!(
            data_rows.iter().filter(|l| l.contains(",Yes,")).count(),
            2
        );
        assert_eq!(data_rows.iter().filter(|l| l.contains(",No,")).count(), 1);
    }

    #[test]
    fn ledger_has_one_row_per_chosen_option() {
        let mut csv = csv::Writer::from_writer(vec![]);
        write_ledger_header(&mut csv).unwrap();
        write_ledger_row(
            &mut csv,
            &LedgerRow {
                voter: "aaa".to_string(),
                selections: vec!["Yes".to_string(), "Abstain".to_string()],
                created_at: Utc::now(),
            },
        )
        .unwrap();
        let out = String::from_utf8(csv.into_inner().unwrap()).unwrap();
        assert_eq!(out.lines().count(), 3);
        assert!(out.starts_with("voter,choice,signed_at\n"));
    }

    #[test]
    fn wrapped_archive_contains_the_inner_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("final.bdoc");
        std::fs::write(&source, b"inner archive").unwrap();
        let target = dir.path().join("final.zip");

        wrap_archive(&source, &target).unwrap();

        let mut archive = ZipArchive::new(File::open(&target).unwrap()).unwrap();
        let mut content = Vec::new();
        archive
            .by_name("final.bdoc")
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"inner archive");
    }
}
