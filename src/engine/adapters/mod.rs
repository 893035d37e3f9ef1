// VaultStream Engine — Adapter Registry
//
// An adapter turns a platform URL into a normalized `ParsedContent`.
// Routing is two-stage: per-adapter URL pattern matchers first (with
// short-link resolution for hosts like b23.tv), then the generic
// LLM-assisted fallback adapter that works on any page.
//
// Adapter errors are tagged by retry class:
//   Auth      — credentials required/invalid; not retryable until config changes
//   NotFound  — permanently gone; the content moves to `failed`
//   Transient — network weather; retried under the task-queue policy

mod bilibili;
mod generic;

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;

use crate::atoms::constants::ADAPTER_TIMEOUT_SECS;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::ParsedContent;
use crate::engine::settings::Settings;

pub use bilibili::BilibiliAdapter;
pub use generic::GenericAdapter;

// ── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Credentials required or invalid. Non-retryable until config changes.
    #[error("auth: {0}")]
    Auth(String),

    /// The content is permanently gone. Never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// Network weather. Retryable.
    #[error("transient: {0}")]
    Transient(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        AdapterError::Transient(e.to_string())
    }
}

// ── Adapter contract ───────────────────────────────────────────────────────

/// Shared dependencies an adapter may use during a parse.
pub struct AdapterContext {
    pub client: reqwest::Client,
    pub settings: Arc<Settings>,
}

impl AdapterContext {
    pub fn new(settings: Arc<Settings>) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(ADAPTER_TIMEOUT_SECS))
            .user_agent("Mozilla/5.0 (compatible; VaultStream/0.1)")
            .build()?;
        Ok(AdapterContext { client, settings })
    }
}

#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Platform slug recorded on contents this adapter produces.
    fn platform(&self) -> &'static str;

    /// Pattern match against a (short-link-resolved) URL.
    fn matches(&self, url: &str) -> bool;

    /// The dedup key for a URL this adapter claims. Must be deterministic
    /// and cheap: it runs at submission time, before any parse.
    fn canonicalize(&self, url: &str) -> Option<String>;

    async fn parse(&self, url: &str, ctx: &AdapterContext) -> Result<ParsedContent, AdapterError>;
}

// ── Routing ────────────────────────────────────────────────────────────────

/// Hosts that are only redirectors; their URLs are resolved with a HEAD
/// request before pattern matching.
const SHORTLINK_HOSTS: &[&str] = &["b23.tv"];

/// Outcome of routing a submitted URL.
pub struct Route {
    pub adapter: Arc<dyn Adapter>,
    /// The URL after short-link resolution; what the adapter will parse.
    pub resolved_url: String,
    pub platform: String,
    pub canonical_url: String,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("adapter", &self.adapter.name())
            .field("resolved_url", &self.resolved_url)
            .field("platform", &self.platform)
            .field("canonical_url", &self.canonical_url)
            .finish()
    }
}

pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn Adapter>>,
    fallback: Arc<dyn Adapter>,
    ctx: AdapterContext,
}

impl AdapterRegistry {
    pub fn new(settings: Arc<Settings>) -> EngineResult<Self> {
        let ctx = AdapterContext::new(Arc::clone(&settings))?;
        Ok(AdapterRegistry {
            adapters: vec![Arc::new(BilibiliAdapter::new())],
            fallback: Arc::new(GenericAdapter::new()),
            ctx,
        })
    }

    pub fn context(&self) -> &AdapterContext {
        &self.ctx
    }

    /// Route a URL to its adapter: resolve short links, try pattern
    /// matchers, fall back to the generic adapter.
    pub async fn route(&self, url: &str) -> EngineResult<Route> {
        let resolved = self.resolve_short_link(url).await?;

        for adapter in &self.adapters {
            if adapter.matches(&resolved) {
                let canonical = adapter.canonicalize(&resolved).ok_or_else(|| {
                    EngineError::Validation(format!("{} matched but could not canonicalize {resolved}", adapter.name()))
                })?;
                debug!("[adapters] {} → {}", resolved, adapter.name());
                return Ok(Route {
                    adapter: Arc::clone(adapter),
                    resolved_url: resolved,
                    platform: adapter.platform().to_string(),
                    canonical_url: canonical,
                });
            }
        }

        let canonical = self
            .fallback
            .canonicalize(&resolved)
            .ok_or_else(|| EngineError::Validation(format!("unparseable URL {resolved}")))?;
        Ok(Route {
            adapter: Arc::clone(&self.fallback),
            resolved_url: resolved,
            platform: self.fallback.platform().to_string(),
            canonical_url: canonical,
        })
    }

    /// Follow a known short-link host to its destination. Non-short-link
    /// URLs pass through untouched; resolution failures are transient.
    async fn resolve_short_link(&self, url: &str) -> EngineResult<String> {
        let parsed = match url::Url::parse(url) {
            Ok(u) => u,
            Err(_) => return Err(EngineError::Validation(format!("invalid URL: {url}"))),
        };
        let host = parsed.host_str().unwrap_or_default();
        if !SHORTLINK_HOSTS.iter().any(|h| host == *h) {
            return Ok(url.to_string());
        }

        match self.ctx.client.head(url).send().await {
            Ok(response) => Ok(response.url().to_string()),
            Err(e) => {
                warn!("[adapters] Short-link resolution failed for {}: {}", url, e);
                Err(EngineError::Transient(format!("resolve short link {url}: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_shortlink_urls_route_without_network() {
        let settings = Arc::new(Settings::new(Arc::new(
            crate::engine::store::Store::open_in_memory().unwrap(),
        )));
        let registry = AdapterRegistry::new(settings).unwrap();

        let route = registry
            .route("https://www.bilibili.com/video/BV1xx411c7mu?p=1&spm_id_from=333")
            .await
            .unwrap();
        assert_eq!(route.platform, "bilibili");
        assert_eq!(route.canonical_url, "https://www.bilibili.com/video/BV1xx411c7mu");

        let generic = registry.route("https://example.com/article?utm_source=x").await.unwrap();
        assert_eq!(generic.platform, "web");
        assert_eq!(generic.canonical_url, "https://example.com/article");
    }

    #[tokio::test]
    async fn invalid_urls_are_validation_errors() {
        let settings = Arc::new(Settings::new(Arc::new(
            crate::engine::store::Store::open_in_memory().unwrap(),
        )));
        let registry = AdapterRegistry::new(settings).unwrap();
        let err = registry.route("not a url").await.unwrap_err();
        assert_eq!(err.kind(), crate::atoms::error::ErrorKind::Validation);
    }
}
