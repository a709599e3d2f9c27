use anyhow::{Context, Result};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{bad_request, not_found};

pub const MAX_UPLOAD_BYTES: usize = 4 * 1024 * 1024;
pub const MAX_FILES_PER_MESSAGE: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub storage_id: String,
    pub url: String,
}

/// Blob storage for attachments and generated images, one file per blob.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    public_url: String,
}

fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}

fn media_type_for(extension: &str) -> &'static str {
    match extension {
        "png" => "image/png",
        "jpg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Only images and PDFs up to 4 MiB may be attached.
pub fn validate_upload(media_type: &str, size: usize) -> Result<()> {
    if !(media_type.starts_with("image/") || media_type == "application/pdf") {
        return Err(bad_request("Only image and PDF files are allowed"));
    }
    if size > MAX_UPLOAD_BYTES {
        return Err(bad_request("File size exceeds 4MB"));
    }
    Ok(())
}

impl FileStore {
    pub async fn new(root: PathBuf, public_url: &str) -> Result<Self> {
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create file directory {}", root.display()))?;
        log::info!("File storage at {}", root.display());
        Ok(Self {
            root,
            public_url: public_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, storage_id: &str) -> String {
        format!("{}/api/files/{}", self.public_url, storage_id)
    }

    fn check_id(storage_id: &str) -> Result<&str> {
        let (stem, ext) = storage_id
            .split_once('.')
            .ok_or_else(|| not_found("File not found"))?;
        if Uuid::parse_str(stem).is_err() || ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(not_found("File not found"));
        }
        Ok(ext)
    }

    pub async fn put(&self, bytes: &[u8], media_type: &str) -> Result<StoredFile> {
        let storage_id = format!("{}.{}", Uuid::new_v4(), extension_for(media_type));
        let path = self.root.join(&storage_id);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write blob {}", storage_id))?;
        log::debug!("Stored blob {} ({} bytes)", storage_id, bytes.len());
        Ok(StoredFile {
            url: self.url_for(&storage_id),
            storage_id,
        })
    }

    pub async fn get(&self, storage_id: &str) -> Result<(Vec<u8>, &'static str)> {
        let ext = Self::check_id(storage_id)?;
        match tokio::fs::read(self.root.join(storage_id)).await {
            Ok(bytes) => Ok((bytes, media_type_for(ext))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found("File not found")),
            Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to read blob {}", storage_id))),
        }
    }

    pub async fn delete(&self, storage_id: &str) -> Result<()> {
        Self::check_id(storage_id)?;
        match tokio::fs::remove_file(self.root.join(storage_id)).await {
            Ok(()) => {
                log::info!("Deleted blob {}", storage_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Attempted to delete missing blob {}", storage_id);
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to delete blob {}", storage_id))),
        }
    }

    /// Best effort removal used after rows were already deleted.
    pub async fn delete_many(&self, storage_ids: &[String]) {
        for id in storage_ids {
            if let Err(e) = self.delete(id).await {
                log::error!("Failed to delete blob {}: {:?}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("files"), "http://localhost:3000/")
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_get_delete() {
        let (_dir, store) = store().await;
        let stored = store.put(b"%PDF-1.7", "application/pdf").await.unwrap();
        assert!(stored.storage_id.ends_with(".pdf"));
        assert_eq!(stored.url, format!("http://localhost:3000/api/files/{}", stored.storage_id));

        let (bytes, media_type) = store.get(&stored.storage_id).await.unwrap();
        assert_eq!(bytes, b"%PDF-1.7");
        assert_eq!(media_type, "application/pdf");

        store.delete(&stored.storage_id).await.unwrap();
        // second delete is a no-op
        store.delete(&stored.storage_id).await.unwrap();
        assert!(store.get(&stored.storage_id).await.is_err());
    }

    #[tokio::test]
    async fn rejects_path_like_ids() {
        let (_dir, store) = store().await;
        assert!(store.get("../secrets.txt").await.is_err());
        assert!(store.get("not-a-uuid.png").await.is_err());
    }

    #[test]
    fn upload_validation() {
        assert!(validate_upload("image/png", 1024).is_ok());
        assert!(validate_upload("application/pdf", MAX_UPLOAD_BYTES).is_ok());
        assert!(validate_upload("text/plain", 10).is_err());
        assert!(validate_upload("image/jpeg", MAX_UPLOAD_BYTES + 1).is_err());
    }
}
