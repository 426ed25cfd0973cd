use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use mongodb::bson::{oid::ObjectId, spec::BinarySubtype, Binary};
use rocket::serde::json::serde_json::json;

use crate::container::builder::ContainerBuilder;
use crate::error::{Error, Result};
use crate::model::vote::{TemplateFileKind, Vote, VoteContainerFile};

/// Name of the metadata entry in every container.
pub const METADATA_FILE_NAME: &str = "metadata.json";
/// Name of the voter identity entry in a per-voter container.
pub const VOTER_FILE_NAME: &str = "voter.json";

/// Strip characters that are illegal in entry/file names from an option's
/// display value. Deterministic and idempotent.
///
/// Fails with [`Error::EmptyOptionName`] if nothing survives.
pub fn sanitize_option_name(value: &str) -> Result<String> {
    let sanitized: String = value
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') && !c.is_control())
        .collect();
    let sanitized = sanitized.trim().to_string();
    if sanitized.is_empty() {
        return Err(Error::EmptyOptionName(value.to_string()));
    }
    Ok(sanitized)
}

/// The container entry name for a vote option.
pub fn option_file_name(value: &str) -> Result<String> {
    Ok(format!("{}.txt", sanitize_option_name(value)?))
}

/// File name for the ballot document, derived from the blob's mime type.
fn document_file_name(mime_type: &str) -> String {
    let extension = match mime_type {
        "text/html" => "html",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        _ => "bin",
    };
    format!("document.{extension}")
}

fn binary(bytes: Vec<u8>) -> Binary {
    Binary {
        subtype: BinarySubtype::Generic,
        bytes,
    }
}

/// Build the template file set for a newly opened vote: the ballot document,
/// the metadata file, and one file per option. Rows are immutable once
/// persisted; every voter's container is assembled from them.
///
/// Distinct option values that sanitize to the same file name fail fast with
/// [`Error::DuplicateOptionFile`] rather than silently overwriting an entry.
pub fn create_template_files(
    vote: &Vote,
    document_content: &[u8],
    document_mime: &str,
) -> Result<Vec<VoteContainerFile>> {
    let mut files = Vec::with_capacity(vote.options.len() + 2);

    files.push(VoteContainerFile {
        id: ObjectId::new().into(),
        vote_id: vote.id,
        kind: TemplateFileKind::Document,
        file_name: document_file_name(document_mime),
        mime_type: document_mime.to_string(),
        content: binary(document_content.to_vec()),
    });

    let metadata = json!({
        "title": vote.title,
        "options": vote.options,
        "createdAt": vote.created_at.to_rfc3339(),
    });
    files.push(VoteContainerFile {
        id: ObjectId::new().into(),
        vote_id: vote.id,
        kind: TemplateFileKind::Metadata,
        file_name: METADATA_FILE_NAME.to_string(),
        mime_type: "application/json".to_string(),
        content: binary(metadata.to_string().into_bytes()),
    });

    let mut seen: HashMap<String, &String> = HashMap::new();
    for option in &vote.options {
        let file_name = option_file_name(option)?;
        if let Some(previous) = seen.insert(file_name.clone(), option) {
            return Err(Error::DuplicateOptionFile(
                previous.clone(),
                option.clone(),
            ));
        }
        files.push(VoteContainerFile {
            id: ObjectId::new().into(),
            vote_id: vote.id,
            kind: TemplateFileKind::Option,
            file_name,
            mime_type: "text/plain".to_string(),
            content: binary(option.clone().into_bytes()),
        });
    }

    Ok(files)
}

/// Name of the detached signature entry attached by the remote-challenge
/// flow.
pub const SIGNATURE_FILE_NAME: &str = "META-INF/signature-1.p7s";

/// Assemble one voter's to-be-signed container from the vote's template
/// files: document and metadata always, option files only when their name
/// matches a sanitized selection, plus a voter identity entry.
///
/// The output is deterministic for a given input set, so the container can
/// be rebuilt byte-identically when a detached `signature_value` arrives
/// after the signing flow completes.
pub fn build_user_container(
    files: &[VoteContainerFile],
    selections: &[String],
    voter_pseudonym: &str,
    country_code: &str,
    signature_value: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let chosen: HashSet<String> = selections
        .iter()
        .map(|s| option_file_name(s))
        .collect::<Result<_>>()?;

    let mut builder = ContainerBuilder::open(Cursor::new(Vec::new()))?;
    for file in files {
        let include = match file.kind {
            TemplateFileKind::Document | TemplateFileKind::Metadata => true,
            TemplateFileKind::Option => chosen.contains(&file.file_name),
        };
        if include {
            builder.append(&file.file_name, &file.mime_type, &file.content.bytes)?;
        }
    }

    let voter = json!({
        "voter": voter_pseudonym,
        "countryCode": country_code,
    });
    builder.append(
        VOTER_FILE_NAME,
        "application/json",
        voter.to_string().as_bytes(),
    )?;

    if let Some(signature) = signature_value {
        builder.append(
            SIGNATURE_FILE_NAME,
            "application/pkcs7-signature",
            signature,
        )?;
    }

    Ok(builder.finalize()?.into_inner())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use chrono::Utc;
    use zip::ZipArchive;

    use super::*;
    use crate::model::mongodb::Id;

    fn example_vote(options: &[&str]) -> Vote {
        Vote {
            id: Id::from(ObjectId::new()),
            topic_id: Id::from(ObjectId::new()),
            title: "Annual general meeting".to_string(),
            options: options.iter().map(|s| s.to_string()).collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_option_name("Op/ti*on \"A\"").unwrap();
        let twice = sanitize_option_name(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once, "Option A");
    }

    #[test]
    fn sanitize_rejects_empty_results() {
        assert!(matches!(
            sanitize_option_name("///"),
            Err(Error::EmptyOptionName(_))
        ));
        assert!(matches!(
            sanitize_option_name("  "),
            Err(Error::EmptyOptionName(_))
        ));
    }

    #[test]
    fn colliding_option_names_fail_fast() {
        let vote = example_vote(&["Option A", "Option/A"]);
        assert!(matches!(
            create_template_files(&vote, b"<p>text</p>", "text/html"),
            Err(Error::DuplicateOptionFile(..))
        ));
    }

    #[test]
    fn template_set_has_document_metadata_and_options() {
        let vote = example_vote(&["Yes", "No"]);
        let files = create_template_files(&vote, b"<p>text</p>", "text/html").unwrap();

        let names: Vec<&str> = files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, ["document.html", "metadata.json", "Yes.txt", "No.txt"]);
        assert_eq!(files[2].content.bytes, b"Yes");
    }

    #[test]
    fn user_container_includes_only_chosen_options() {
        let vote = example_vote(&["Yes", "No"]);
        let files = create_template_files(&vote, b"<p>text</p>", "text/html").unwrap();
        let bytes =
            build_user_container(&files, &["Yes".to_string()], "deadbeef", "EE", None).unwrap();

        let mut archive = ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        assert!(archive.by_name("Yes.txt").is_ok());
        assert!(archive.by_name("No.txt").is_err());
        assert!(archive.by_name("document.html").is_ok());
        assert!(archive.by_name("metadata.json").is_ok());

        let mut voter = String::new();
        archive
            .by_name(VOTER_FILE_NAME)
            .unwrap()
            .read_to_string(&mut voter)
            .unwrap();
        assert!(voter.contains("deadbeef"));
    }

    #[test]
    fn user_container_is_deterministic() {
        let vote = example_vote(&["Yes", "No"]);
        let files = create_template_files(&vote, b"<p>text</p>", "text/html").unwrap();
        let selections = ["Yes".to_string()];
        let first = build_user_container(&files, &selections, "cafe", "EE", None).unwrap();
        let second = build_user_container(&files, &selections, "cafe", "EE", None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn detached_signature_is_embedded_when_present() {
        let vote = example_vote(&["Yes"]);
        let files = create_template_files(&vote, b"x", "text/plain").unwrap();
        let bytes = build_user_container(
            &files,
            &["Yes".to_string()],
            "cafe",
            "EE",
            Some(b"signature-bytes"),
        )
        .unwrap();

        let mut archive = ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let mut signature = Vec::new();
        std::io::Read::read_to_end(
            &mut archive.by_name(SIGNATURE_FILE_NAME).unwrap(),
            &mut signature,
        )
        .unwrap();
        assert_eq!(signature, b"signature-bytes");
    }

    #[test]
    fn selection_matching_uses_sanitized_names() {
        // "Option/A" sanitizes to the same file name the template was
        // created under, so the selection still matches.
        let vote = example_vote(&["Option A"]);
        let files = create_template_files(&vote, b"x", "text/plain").unwrap();
        let bytes =
            build_user_container(&files, &["Option/A".to_string()], "cafe", "EE", None).unwrap();

        let mut archive = ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        assert!(archive.by_name("Option A.txt").is_ok());
    }
}
