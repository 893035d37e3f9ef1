// VaultStream Engine — Platform Transports
//
// The push worker talks to messaging platforms through one small contract:
// probe identity, send one message, send a merged forward, list joinable
// chats. Two implementations: the Telegram Bot HTTP API and a OneBot 11
// HTTP bridge for QQ. Errors carry their retry class so the worker can
// decide between backoff and terminal failure without knowing platforms.

mod onebot;
mod telegram;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{BotConfig, BotPlatform};
use crate::engine::store::DiscoveredChat;

pub use onebot::OneBotService;
pub use telegram::TelegramService;

// ── Contract types ─────────────────────────────────────────────────────────

/// What the renderer produces and a transport delivers.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedMessage {
    pub text: String,
    pub media_urls: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: String,
}

#[derive(Debug, Clone)]
pub struct BotIdentity {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// 429 / 5xx / network weather: retry under backoff.
    #[error("transient: {0}")]
    Retryable(String),

    /// 403 / permission / malformed request: retrying cannot help.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Retryable(_))
    }

    /// Classify an HTTP status per the shared retry policy.
    pub fn from_status(status: u16, detail: String) -> Self {
        if crate::engine::http::is_retryable_status(status) {
            TransportError::Retryable(format!("HTTP {status}: {detail}"))
        } else {
            TransportError::Permanent(format!("HTTP {status}: {detail}"))
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Retryable(e.to_string())
    }
}

#[async_trait]
pub trait PlatformService: Send + Sync {
    fn platform(&self) -> BotPlatform;

    /// Verify credentials and discover the bot's identity.
    async fn probe(&self) -> Result<BotIdentity, TransportError>;

    /// Deliver one message to one chat.
    async fn send(&self, chat_id: &str, message: &RenderedMessage) -> Result<SendOutcome, TransportError>;

    /// Deliver several items as a single forwarded/batched message where
    /// the platform supports it; platforms without native forward bundles
    /// deliver an equivalent single combined message.
    async fn send_forward(
        &self,
        chat_id: &str,
        messages: &[RenderedMessage],
    ) -> Result<SendOutcome, TransportError>;

    /// The chats the bot can currently post to.
    async fn list_chats(&self) -> Result<Vec<DiscoveredChat>, TransportError>;

    /// QR login payload, for platforms with QR flows. Default: none.
    async fn get_qr(&self) -> Result<Option<String>, TransportError> {
        Ok(None)
    }
}

/// Build the service for a bot config.
pub fn service_for(bot: &BotConfig) -> EngineResult<Arc<dyn PlatformService>> {
    match bot.platform {
        BotPlatform::Telegram => {
            let token = bot
                .bot_token
                .clone()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| EngineError::Config(format!("bot {} has no bot_token", bot.id)))?;
            Ok(Arc::new(TelegramService::new(token)?))
        }
        BotPlatform::Qq => {
            let base = bot
                .napcat_http_url
                .clone()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| EngineError::Config(format!("bot {} has no napcat_http_url", bot.id)))?;
            Ok(Arc::new(OneBotService::new(base)?))
        }
    }
}

/// Indirection over `service_for` so workers and sync jobs can be tested
/// against a mock platform.
pub trait ServiceFactory: Send + Sync {
    fn service(&self, bot: &BotConfig) -> EngineResult<Arc<dyn PlatformService>>;
}

pub struct DefaultServiceFactory;

impl ServiceFactory for DefaultServiceFactory {
    fn service(&self, bot: &BotConfig) -> EngineResult<Arc<dyn PlatformService>> {
        service_for(bot)
    }
}

// ── Shared helpers ─────────────────────────────────────────────────────────

/// Split a long text for platform message limits, preferring newline then
/// space boundaries.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }
        let mut cut = max_len;
        while cut > 0 && !remaining.is_char_boundary(cut) {
            cut -= 1;
        }
        let split_at = remaining[..cut]
            .rfind('\n')
            .or_else(|| remaining[..cut].rfind(' '))
            .unwrap_or(cut)
            .max(1);
        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_message_respects_boundaries() {
        let text = "line one\nline two\nline three";
        let chunks = split_message(text, 12);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.len() <= 12));
        assert_eq!(chunks.join("\n").replace("\n\n", "\n"), text.replace("\n\n", "\n"));
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_message("hi", 100), vec!["hi".to_string()]);
    }

    #[test]
    fn status_classification_matches_retry_policy() {
        assert!(TransportError::from_status(429, "slow down".into()).is_retryable());
        assert!(TransportError::from_status(502, "bad gateway".into()).is_retryable());
        assert!(!TransportError::from_status(403, "kicked".into()).is_retryable());
        assert!(!TransportError::from_status(400, "bad chat id".into()).is_retryable());
    }
}
