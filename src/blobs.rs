//! Thread blob store
//!
//! Full thread payloads live as JSON files under
//! `{root}/{owner_scope}/{thread_id}.json`. Path components are
//! percent-encoded so ids containing `/` or `:` stay inside the scope
//! directory. Writes land in a temp file that is renamed into place.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::{AppError, AppResult};
use crate::upstream::ThreadDetail;

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    owner_scope: String,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>, owner_scope: &str) -> Self {
        Self {
            root: root.into(),
            owner_scope: urlencoding::encode(owner_scope).into_owned(),
        }
    }

    fn scope_dir(&self) -> PathBuf {
        self.root.join(&self.owner_scope)
    }

    fn path_for(&self, thread_id: &str) -> PathBuf {
        self.scope_dir()
            .join(format!("{}.json", urlencoding::encode(thread_id)))
    }

    pub async fn put(&self, thread: &ThreadDetail) -> AppResult<()> {
        let dir = self.scope_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create blob dir", &dir, e))?;

        let path = self.path_for(&thread.id);
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        let body = serde_json::to_vec(thread)?;
        fs::write(&tmp, body)
            .await
            .map_err(|e| io_error("write blob", &tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_error("commit blob", &path, e));
        }
        Ok(())
    }

    pub async fn get(&self, thread_id: &str) -> AppResult<Option<ThreadDetail>> {
        let path = self.path_for(thread_id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read blob", &path, e)),
        }
    }

    /// Remove a blob; missing blobs are not an error
    pub async fn delete(&self, thread_id: &str) -> AppResult<()> {
        let path = self.path_for(thread_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete blob", &path, e)),
        }
    }
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> AppError {
    AppError::Internal(format!("{action} failed for {}: {err}", path.display()))
}
