// VaultStream Engine — OneBot 11 Transport (QQ via local bridge)
//
// Talks to a NapCat (or any OneBot 11 compatible) HTTP endpoint running
// next to the service. Unlike Telegram this platform has native forward
// bundles: `send_forward_msg` wraps each item in a fake-sender node and QQ
// renders them as one collapsible forwarded card.

use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::atoms::constants::TRANSPORT_TIMEOUT_SECS;
use crate::atoms::error::EngineResult;
use crate::atoms::types::BotPlatform;
use crate::engine::store::DiscoveredChat;

use super::{BotIdentity, PlatformService, RenderedMessage, SendOutcome, TransportError};

// ── API envelope ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ObResponse<T> {
    status: String,
    retcode: i64,
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
}

pub struct OneBotService {
    client: reqwest::Client,
    base_url: String,
}

impl OneBotService {
    pub fn new(base_url: String) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(TRANSPORT_TIMEOUT_SECS))
            .build()?;
        Ok(OneBotService { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        action: &str,
        body: &Value,
    ) -> Result<T, TransportError> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, action))
            .json(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(TransportError::from_status(status, format!("{action} failed")));
        }
        let envelope: ObResponse<T> = response
            .json()
            .await
            .map_err(|e| TransportError::Retryable(format!("{action}: decode: {e}")))?;

        if envelope.status == "ok" || envelope.retcode == 0 {
            return envelope
                .data
                .ok_or_else(|| TransportError::Retryable(format!("{action}: ok but empty data")));
        }
        let message = envelope.message.unwrap_or_default();
        // OneBot retcodes: 1400-range are caller errors, others are bridge
        // trouble worth retrying.
        if (1400..1500).contains(&envelope.retcode) {
            Err(TransportError::Permanent(format!("{action}: retcode {}: {message}", envelope.retcode)))
        } else {
            Err(TransportError::Retryable(format!("{action}: retcode {}: {message}", envelope.retcode)))
        }
    }

    /// OneBot message segments for one rendered item: text plus images.
    fn segments(message: &RenderedMessage) -> Vec<Value> {
        let mut segments = vec![json!({ "type": "text", "data": { "text": message.text } })];
        for media_url in &message.media_urls {
            segments.push(json!({ "type": "image", "data": { "file": media_url } }));
        }
        segments
    }
}

#[async_trait]
impl PlatformService for OneBotService {
    fn platform(&self) -> BotPlatform {
        BotPlatform::Qq
    }

    async fn probe(&self) -> Result<BotIdentity, TransportError> {
        let info: Value = self.call("get_login_info", &json!({})).await?;
        Ok(BotIdentity {
            id: info["user_id"].as_i64().unwrap_or_default().to_string(),
            username: info["nickname"].as_str().unwrap_or("unknown").to_string(),
        })
    }

    async fn send(&self, chat_id: &str, message: &RenderedMessage) -> Result<SendOutcome, TransportError> {
        let group_id: i64 = chat_id
            .parse()
            .map_err(|_| TransportError::Permanent(format!("chat id '{chat_id}' is not a QQ group number")))?;
        let sent: Value = self
            .call(
                "send_msg",
                &json!({
                    "message_type": "group",
                    "group_id": group_id,
                    "message": Self::segments(message),
                }),
            )
            .await?;
        Ok(SendOutcome { message_id: sent["message_id"].as_i64().unwrap_or_default().to_string() })
    }

    async fn send_forward(
        &self,
        chat_id: &str,
        messages: &[RenderedMessage],
    ) -> Result<SendOutcome, TransportError> {
        let group_id: i64 = chat_id
            .parse()
            .map_err(|_| TransportError::Permanent(format!("chat id '{chat_id}' is not a QQ group number")))?;
        let nodes: Vec<Value> = messages
            .iter()
            .map(|m| {
                json!({
                    "type": "node",
                    "data": { "name": "VaultStream", "uin": "0", "content": Self::segments(m) }
                })
            })
            .collect();
        let sent: Value = self
            .call("send_forward_msg", &json!({ "group_id": group_id, "messages": nodes }))
            .await?;
        let message_id = sent["message_id"]
            .as_i64()
            .map(|v| v.to_string())
            .or_else(|| sent["message_id"].as_str().map(str::to_string))
            .unwrap_or_default();
        Ok(SendOutcome { message_id })
    }

    async fn list_chats(&self) -> Result<Vec<DiscoveredChat>, TransportError> {
        let groups: Vec<Value> = self.call("get_group_list", &json!({})).await?;
        Ok(groups
            .iter()
            .filter_map(|g| {
                let group_id = g["group_id"].as_i64()?;
                Some(DiscoveredChat {
                    chat_id: group_id.to_string(),
                    chat_type: "group".into(),
                    title: g["group_name"].as_str().unwrap_or_default().to_string(),
                    username: None,
                    can_post: true,
                })
            })
            .collect())
    }

    /// QR login: bridges that expose a QR endpoint return its payload;
    /// otherwise a placeholder the frontend renders as "open your bridge".
    async fn get_qr(&self) -> Result<Option<String>, TransportError> {
        match self.call::<Value>("get_qrcode", &json!({})).await {
            Ok(data) => Ok(data["qrcode"].as_str().map(str::to_string)),
            Err(TransportError::Permanent(_)) => {
                let placeholder =
                    base64::engine::general_purpose::STANDARD.encode(b"qr-unavailable: log in via the bridge UI");
                Ok(Some(placeholder))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_put_text_before_images() {
        let message = RenderedMessage {
            text: "hello".into(),
            media_urls: vec!["https://img/1.webp".into(), "https://img/2.webp".into()],
        };
        let segments = OneBotService::segments(&message);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0]["type"], "text");
        assert_eq!(segments[1]["type"], "image");
        assert_eq!(segments[2]["data"]["file"], "https://img/2.webp");
    }

    #[test]
    fn envelope_decodes_failures() {
        let raw = r#"{"status":"failed","retcode":1404,"data":null,"message":"group not found"}"#;
        let envelope: ObResponse<Value> = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.status, "failed");
        assert_eq!(envelope.retcode, 1404);
    }
}
