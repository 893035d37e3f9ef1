// VaultStream Engine — Settings Resolver
//
// Key/value configuration with a read-through fallback chain:
//   settings table (DB) → process environment → compile-time default.
// Writes always land in the DB. Reads are memoized for a short TTL and the
// memo entry is invalidated on write, so a changed setting takes effect
// within one cache window on other readers and immediately on the writer.
// Secret values (tokens, API keys) are masked when enumerated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use parking_lot::Mutex;

use crate::atoms::constants::SETTINGS_CACHE_TTL_SECS;
use crate::atoms::error::EngineResult;
use crate::engine::store::Store;

// ── Well-known keys ────────────────────────────────────────────────────────

pub mod keys {
    pub const API_TOKEN: &str = "API_TOKEN";
    pub const HTTP_PROXY: &str = "HTTP_PROXY";
    pub const STORAGE_BACKEND: &str = "STORAGE_BACKEND";
    pub const STORAGE_LOCAL_ROOT: &str = "STORAGE_LOCAL_ROOT";
    pub const STORAGE_PUBLIC_BASE_URL: &str = "STORAGE_PUBLIC_BASE_URL";
    pub const ENABLE_ARCHIVE_MEDIA_PROCESSING: &str = "ENABLE_ARCHIVE_MEDIA_PROCESSING";
    pub const ARCHIVE_IMAGE_WEBP_QUALITY: &str = "ARCHIVE_IMAGE_WEBP_QUALITY";
    pub const ARCHIVE_IMAGE_MAX_COUNT: &str = "ARCHIVE_IMAGE_MAX_COUNT";
    pub const TELEGRAM_ADMIN_IDS: &str = "TELEGRAM_ADMIN_IDS";
    pub const TEXT_LLM_API_KEY: &str = "TEXT_LLM_API_KEY";
    pub const TEXT_LLM_API_BASE: &str = "TEXT_LLM_API_BASE";
    pub const TEXT_LLM_API_MODEL: &str = "TEXT_LLM_API_MODEL";
    pub const VISION_LLM_API_KEY: &str = "VISION_LLM_API_KEY";
    pub const VISION_LLM_API_BASE: &str = "VISION_LLM_API_BASE";
    pub const VISION_LLM_API_MODEL: &str = "VISION_LLM_API_MODEL";
}

/// Compile-time defaults, the last link of the fallback chain.
fn compiled_default(key: &str) -> Option<&'static str> {
    match key {
        keys::STORAGE_BACKEND => Some("local"),
        keys::ENABLE_ARCHIVE_MEDIA_PROCESSING => Some("true"),
        keys::ARCHIVE_IMAGE_WEBP_QUALITY => Some("82"),
        keys::ARCHIVE_IMAGE_MAX_COUNT => Some("9"),
        _ => None,
    }
}

fn is_secret_key(key: &str) -> bool {
    key.contains("TOKEN") || key.contains("KEY") || key.contains("SECRET")
}

/// Mask a secret for display: first prefix chars + stars + last 4.
pub fn mask_secret(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 6 {
        return "****".into();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}-****{tail}")
}

// ── Resolver ───────────────────────────────────────────────────────────────

pub struct Settings {
    store: Arc<Store>,
    cache: Mutex<HashMap<String, (Option<String>, Instant)>>,
    ttl: Duration,
}

impl Settings {
    pub fn new(store: Arc<Store>) -> Self {
        Settings {
            store,
            cache: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(SETTINGS_CACHE_TTL_SECS),
        }
    }

    /// Resolve a key through DB → env → compiled default.
    pub fn get(&self, key: &str) -> Option<String> {
        {
            let cache = self.cache.lock();
            if let Some((value, at)) = cache.get(key) {
                if at.elapsed() < self.ttl {
                    return value.clone();
                }
            }
        }

        let resolved = self
            .store
            .get_setting(key)
            .ok()
            .flatten()
            .or_else(|| std::env::var(key).ok())
            .or_else(|| compiled_default(key).map(str::to_string));

        self.cache.lock().insert(key.to_string(), (resolved.clone(), Instant::now()));
        resolved
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).as_deref() {
            Some("1") | Some("true") | Some("yes") | Some("on") => true,
            Some("0") | Some("false") | Some("no") | Some("off") => false,
            _ => default,
        }
    }

    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    /// Write to the DB and drop the memo entry so the next read sees it.
    pub fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        self.store.set_setting(key, value)?;
        self.cache.lock().remove(key);
        info!("[settings] Updated {}", key);
        Ok(())
    }

    /// All DB-backed settings, secrets masked.
    pub fn enumerate(&self) -> EngineResult<Vec<(String, String)>> {
        let entries = self.store.list_settings()?;
        Ok(entries
            .into_iter()
            .map(|(k, v)| {
                let display = if is_secret_key(&k) { mask_secret(&v) } else { v };
                (k, display)
            })
            .collect())
    }
}
