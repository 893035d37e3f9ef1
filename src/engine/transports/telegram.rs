// VaultStream Engine — Telegram Bot Transport
//
// Speaks the Bot HTTP API directly over reqwest: no webhooks, no public
// URL, no framework. Text goes through sendMessage (split at the 4096-char
// limit), single images through sendPhoto, multi-image items through
// sendMediaGroup. Chat discovery scans recent getUpdates for chats the bot
// participates in, which covers the channels/groups an admin just added
// the bot to.

use async_trait::async_trait;
use log::warn;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::atoms::constants::TRANSPORT_TIMEOUT_SECS;
use crate::atoms::error::EngineResult;
use crate::atoms::types::BotPlatform;
use crate::engine::store::DiscoveredChat;

use super::{BotIdentity, PlatformService, RenderedMessage, SendOutcome, TransportError, split_message};

const TG_API: &str = "https://api.telegram.org/bot";

/// Telegram message hard limit is 4096; leave headroom for ellipses.
const TG_TEXT_LIMIT: usize = 4000;

/// Caption limit on media messages.
const TG_CAPTION_LIMIT: usize = 1024;

// ── API envelope ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
    parameters: Option<TgResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct TgResponseParameters {
    retry_after: Option<u64>,
}

pub struct TelegramService {
    client: reqwest::Client,
    token: String,
}

impl TelegramService {
    pub fn new(token: String) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(TRANSPORT_TIMEOUT_SECS))
            .build()?;
        Ok(TelegramService { client, token })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}{}/{}", TG_API, self.token, method)
    }

    /// POST one Bot API method and unwrap the envelope with retry-class
    /// mapping: 429 carries `retry_after`, 403 means kicked/never-joined.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
    ) -> Result<T, TransportError> {
        let response = self.client.post(self.method_url(method)).json(body).send().await?;
        let status = response.status().as_u16();
        let envelope: TgResponse<T> = response
            .json()
            .await
            .map_err(|e| TransportError::Retryable(format!("{method}: decode: {e}")))?;

        if envelope.ok {
            return envelope
                .result
                .ok_or_else(|| TransportError::Retryable(format!("{method}: ok but empty result")));
        }

        let description = envelope.description.unwrap_or_default();
        let code = envelope.error_code.unwrap_or(status as i64) as u16;
        if code == 429 {
            let after = envelope.parameters.and_then(|p| p.retry_after).unwrap_or(1);
            return Err(TransportError::Retryable(format!(
                "{method}: rate limited, retry after {after}s: {description}"
            )));
        }
        Err(TransportError::from_status(code, format!("{method}: {description}")))
    }
}

#[async_trait]
impl PlatformService for TelegramService {
    fn platform(&self) -> BotPlatform {
        BotPlatform::Telegram
    }

    async fn probe(&self) -> Result<BotIdentity, TransportError> {
        let me: Value = self.call("getMe", &json!({})).await?;
        Ok(BotIdentity {
            id: me["id"].as_i64().unwrap_or_default().to_string(),
            username: me["username"].as_str().unwrap_or("unknown").to_string(),
        })
    }

    async fn send(&self, chat_id: &str, message: &RenderedMessage) -> Result<SendOutcome, TransportError> {
        match message.media_urls.len() {
            0 => {
                // Plain text; split at the platform limit, reply with the
                // first chunk's message id.
                let chunks = split_message(&message.text, TG_TEXT_LIMIT);
                let mut first_id: Option<i64> = None;
                for chunk in &chunks {
                    let sent: Value =
                        self.call("sendMessage", &json!({ "chat_id": chat_id, "text": chunk })).await?;
                    if first_id.is_none() {
                        first_id = sent["message_id"].as_i64();
                    }
                }
                Ok(SendOutcome { message_id: first_id.unwrap_or_default().to_string() })
            }
            1 => {
                let caption: String = message.text.chars().take(TG_CAPTION_LIMIT).collect();
                let sent: Value = self
                    .call(
                        "sendPhoto",
                        &json!({ "chat_id": chat_id, "photo": message.media_urls[0], "caption": caption }),
                    )
                    .await?;
                Ok(SendOutcome { message_id: sent["message_id"].as_i64().unwrap_or_default().to_string() })
            }
            _ => {
                // Album: caption rides on the first item; Telegram caps an
                // album at 10 entries.
                let caption: String = message.text.chars().take(TG_CAPTION_LIMIT).collect();
                let media: Vec<Value> = message
                    .media_urls
                    .iter()
                    .take(10)
                    .enumerate()
                    .map(|(i, media_url)| {
                        if i == 0 {
                            json!({ "type": "photo", "media": media_url, "caption": caption })
                        } else {
                            json!({ "type": "photo", "media": media_url })
                        }
                    })
                    .collect();
                let sent: Vec<Value> = self
                    .call("sendMediaGroup", &json!({ "chat_id": chat_id, "media": media }))
                    .await?;
                let first = sent.first().and_then(|m| m["message_id"].as_i64()).unwrap_or_default();
                Ok(SendOutcome { message_id: first.to_string() })
            }
        }
    }

    async fn send_forward(
        &self,
        chat_id: &str,
        messages: &[RenderedMessage],
    ) -> Result<SendOutcome, TransportError> {
        // No native forward bundles on the Bot API: deliver one combined
        // message with a rule separator, media flattened into an album.
        let text = messages.iter().map(|m| m.text.as_str()).collect::<Vec<_>>().join("\n\n———\n\n");
        let media_urls: Vec<String> =
            messages.iter().flat_map(|m| m.media_urls.iter().cloned()).collect();
        self.send(chat_id, &RenderedMessage { text, media_urls }).await
    }

    async fn list_chats(&self) -> Result<Vec<DiscoveredChat>, TransportError> {
        let updates: Vec<Value> = self
            .call("getUpdates", &json!({ "limit": 100, "allowed_updates": ["message", "my_chat_member", "channel_post"] }))
            .await?;

        let mut chats: Vec<DiscoveredChat> = Vec::new();
        for update in &updates {
            let chat = update
                .get("message")
                .or_else(|| update.get("channel_post"))
                .map(|m| &m["chat"])
                .or_else(|| update.get("my_chat_member").map(|m| &m["chat"]));
            let Some(chat) = chat else { continue };
            let Some(id) = chat["id"].as_i64() else { continue };
            let chat_id = id.to_string();
            if chats.iter().any(|c| c.chat_id == chat_id) {
                continue;
            }
            let chat_type = chat["type"].as_str().unwrap_or("group").to_string();
            // Direct chats with users are not push targets.
            if chat_type == "private" {
                continue;
            }
            chats.push(DiscoveredChat {
                chat_id,
                chat_type,
                title: chat["title"].as_str().unwrap_or_default().to_string(),
                username: chat["username"].as_str().map(str::to_string),
                can_post: true,
            });
        }
        if chats.is_empty() {
            warn!("[telegram] getUpdates returned no chats; the update log may have expired");
        }
        Ok(chats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_urls_embed_the_token() {
        let service = TelegramService::new("123:abc".into()).unwrap();
        assert_eq!(service.method_url("sendMessage"), "https://api.telegram.org/bot123:abc/sendMessage");
    }

    #[test]
    fn envelope_decodes_error_parameters() {
        let raw = r#"{"ok":false,"error_code":429,"description":"Too Many Requests","parameters":{"retry_after":7}}"#;
        let envelope: TgResponse<Value> = serde_json::from_str(raw).unwrap();
        assert!(!envelope.ok);
        assert_eq!(envelope.error_code, Some(429));
        assert_eq!(envelope.parameters.unwrap().retry_after, Some(7));
    }
}
