use std::future::Future;
use std::path::{Path, PathBuf};

use rocket::tokio::fs;

use crate::error::{Error, Result};
use crate::model::mongodb::Id;

/// Cache path of a vote's final evidentiary container.
pub fn final_container_path(files_dir: &Path, topic_id: Id, vote_id: Id) -> PathBuf {
    files_dir
        .join(topic_id.to_string())
        .join(vote_id.to_string())
        .join("final.bdoc")
}

/// Cache path of the wrapped (plain ZIP) download variant.
pub fn wrapped_archive_path(files_dir: &Path, topic_id: Id, vote_id: Id) -> PathBuf {
    files_dir
        .join(topic_id.to_string())
        .join(vote_id.to_string())
        .join("final.zip")
}

/// Serve-or-build for a cached artifact: an existing readable file at `path`
/// is a cache hit and `generate` is never invoked; otherwise `generate`
/// writes the file, and a partially written file is removed before the
/// failure propagates, so a broken artifact is never served later.
pub async fn get_or_generate<F, Fut>(path: &Path, generate: F) -> Result<()>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if fs::metadata(path).await.is_ok() {
        debug!("archive cache hit: {}", path.display());
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    info!("archive cache miss, generating {}", path.display());
    match generate(path.to_path_buf()).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Err(remove_err) = fs::remove_file(path).await {
                warn!(
                    "could not remove partial archive {}: {remove_err}",
                    path.display()
                );
            }
            Err(Error::CacheGeneration(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[rocket::async_test]
    async fn second_call_is_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topic").join("vote").join("final.bdoc");
        let generations = AtomicUsize::new(0);
        let generations = &generations;

        for _ in 0..2 {
            get_or_generate(&path, |p| async move {
                generations.fetch_add(1, Ordering::SeqCst);
                std::fs::write(&p, b"archive bytes")?;
                Ok(())
            })
            .await
            .unwrap();
        }

        assert_eq!(generations.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"archive bytes");
    }

    #[rocket::async_test]
    async fn failed_generation_removes_the_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("final.bdoc");

        let result = get_or_generate(&path, |p| async move {
            std::fs::write(&p, b"partial")?;
            Err(Error::Status(
                rocket::http::Status::InternalServerError,
                "stream broke mid-way".to_string(),
            ))
        })
        .await;

        assert!(matches!(result, Err(Error::CacheGeneration(_))));
        assert!(!path.exists());
    }

    #[rocket::async_test]
    async fn generation_failure_does_not_poison_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("final.bdoc");

        let failed = get_or_generate(&path, |p| async move {
            std::fs::write(&p, b"partial")?;
            Err(Error::AlreadyFinalized)
        })
        .await;
        assert!(failed.is_err());

        // A later attempt regenerates from scratch.
        get_or_generate(&path, |p| async move {
            std::fs::write(&p, b"good")?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"good");
    }
}
