//! Content-addressed attachment storage. Bodies land in an object store
//! keyed by their SHA-256; the metadata row in `attachments` points at the
//! shared key, so identical content is stored once no matter how many
//! messages carry it.

use std::path::PathBuf;

use async_trait::async_trait;
use ring::digest::{digest, SHA256};
use thiserror::Error;
use uuid::Uuid;

use crate::credentials::hex_encode;
use crate::db::models::Attachment;
use crate::db::{Database, DbError};
use crate::fetchers::RawAttachment;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store: {0}")]
    Object(String),

    #[error(transparent)]
    Db(#[from] DbError),
}

#[async_trait(?Send)]
pub trait ObjectStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<(), StoreError>;

    async fn object_exists(&self, key: &str) -> Result<bool, StoreError>;
}

/// Filesystem-backed object store rooted at a directory
/// (default `~/.esync/objects`).
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn default_root() -> Result<PathBuf, StoreError> {
        let home = dirs::home_dir()
            .ok_or_else(|| StoreError::Object("failed to determine home directory".to_string()))?;
        Ok(home.join(".esync").join("objects"))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait(?Send)]
impl ObjectStore for FsObjectStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<(), StoreError> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Object(format!("create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StoreError::Object(format!("write {}: {e}", path.display())))?;
        Ok(())
    }

    async fn object_exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.object_path(key))
            .await
            .unwrap_or(false))
    }
}

pub struct AttachmentStore<S: ObjectStore> {
    store: S,
}

impl<S: ObjectStore> AttachmentStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Persist one attachment for `email_id`. Returns the metadata row that
    /// was written; the object upload is skipped when a prior attachment
    /// already placed the same content.
    pub async fn ingest(
        &self,
        db: &Database,
        email_id: &str,
        raw: &RawAttachment,
    ) -> Result<Attachment, StoreError> {
        let content_hash = hex_encode(digest(&SHA256, &raw.content).as_ref());

        let storage_key = match db.find_storage_key_by_hash(&content_hash)? {
            Some(existing) => existing,
            None => {
                let key = storage_key_for(&content_hash);
                self.store
                    .put_object(&key, &raw.content, &raw.mime_type)
                    .await?;
                key
            }
        };

        let attachment = Attachment {
            id: Uuid::new_v4().to_string(),
            email_id: email_id.to_string(),
            filename: raw.filename.clone(),
            mime_type: raw.mime_type.clone(),
            size_bytes: raw.content.len() as i64,
            content_hash,
            storage_key,
        };
        db.insert_attachment(&attachment)?;
        Ok(attachment)
    }
}

fn storage_key_for(content_hash: &str) -> String {
    // Two-character fan-out keeps any one directory from growing unbounded.
    let prefix = &content_hash[..2.min(content_hash.len())];
    format!("attachments/{prefix}/{content_hash}")
}
