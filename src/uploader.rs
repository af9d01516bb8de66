use crate::types::{ChatwireError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Turns generated image bytes into a durable storage key.
///
/// Implementations must be idempotent: uploading the same bytes for the same
/// owner twice yields the same key, so retries never duplicate objects.
#[async_trait]
pub trait ImageUploader: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, owner: &str) -> Result<String>;
}

/// Content-addressed uploads into a local directory.
/// Keys look like `generated-images/<owner>/<sha256>.png`.
pub struct FsImageUploader {
    root: PathBuf,
}

impl FsImageUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Owner keys end up in paths; keep them to a safe alphabet.
pub fn sanitize_owner(owner: &str) -> String {
    let cleaned: String = owner
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "anonymous".to_string()
    } else {
        cleaned
    }
}

pub fn content_key(bytes: &[u8], owner: &str) -> String {
    let digest = Sha256::digest(bytes);
    format!(
        "generated-images/{}/{:x}.png",
        sanitize_owner(owner),
        digest
    )
}

#[async_trait]
impl ImageUploader for FsImageUploader {
    async fn upload(&self, bytes: Vec<u8>, owner: &str) -> Result<String> {
        if bytes.is_empty() {
            return Err(ChatwireError::Upload("empty image payload".to_string()).into());
        }
        let key = content_key(&bytes, owner);
        let path = self.root.join(&key);

        if tokio::fs::try_exists(&path).await? {
            tracing::debug!("[⚙️  -> 🗄️ ] Image {} already stored", key);
            return Ok(key);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write then rename so readers never see a partial file.
        let tmp = path.with_extension(format!("png.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::info!("[⚙️  -> 🗄️ ] Stored image {} ({} bytes)", key, bytes.len());
        Ok(key)
    }
}
