// VaultStream Engine — Content-Addressed Blob Storage
//
// Local-filesystem backend keyed by SHA-256:
//   blobs/sha256/<XX>/<YY>/<sha256>.<ext>
// with two-level sharding on the first 4 hex chars. Writes are idempotent
// on the hash: putting the same bytes twice returns the same key and never
// rewrites the file. Callers supply the content type; storage persists
// bytes, it does not transcode.

use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::atoms::error::{EngineError, EngineResult};

/// Result of a `put`: the addressable key plus integrity metadata.
#[derive(Debug, Clone, Serialize)]
pub struct StoredBlob {
    pub key: String,
    pub sha256: String,
    pub size: u64,
}

pub struct BlobStorage {
    root: PathBuf,
    /// When set, `get_url` returns `<base>/<key>`; otherwise a file:// URL.
    public_base_url: Option<String>,
}

impl BlobStorage {
    pub fn new(root: PathBuf, public_base_url: Option<String>) -> EngineResult<Self> {
        std::fs::create_dir_all(&root)
            .map_err(|e| EngineError::Storage(format!("create blob root {:?}: {}", root, e)))?;
        Ok(BlobStorage { root, public_base_url })
    }

    /// Store `bytes` under its hash. Idempotent: an existing blob is left
    /// in place and its key returned without a second write.
    pub fn put(&self, bytes: &[u8], content_type: &str) -> EngineResult<StoredBlob> {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let sha256 = format!("{:x}", hasher.finalize());
        let key = Self::key_for(&sha256, content_type);
        let path = self.root.join(&key);

        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // Write via temp + rename so a crash never leaves a torn blob
            // under its final key.
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, bytes)?;
            std::fs::rename(&tmp, &path)?;
            debug!("[storage] Stored blob {} ({} bytes)", key, bytes.len());
        }

        Ok(StoredBlob { key, sha256, size: bytes.len() as u64 })
    }

    /// Cheap existence check; never reads the body.
    pub fn exists(&self, key: &str) -> bool {
        self.root.join(key).exists()
    }

    pub fn get(&self, key: &str) -> EngineResult<Vec<u8>> {
        let path = self.root.join(key);
        if !path.exists() {
            return Err(EngineError::NotFound(format!("blob {key}")));
        }
        Ok(std::fs::read(path)?)
    }

    /// Public or file URL for a stored key, as configured.
    pub fn get_url(&self, key: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!("file://{}", self.root.join(key).display()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_for(sha256: &str, content_type: &str) -> String {
        let ext = ext_for(content_type);
        format!("blobs/sha256/{}/{}/{}.{}", &sha256[0..2], &sha256[2..4], sha256, ext)
    }
}

fn ext_for(content_type: &str) -> &'static str {
    match content_type {
        "image/webp" => "webp",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "audio/mpeg" => "mp3",
        _ => "bin",
    }
}
