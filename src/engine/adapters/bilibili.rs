// VaultStream Engine — Bilibili Adapter
//
// Parses bilibili.com video pages through the public web-interface API.
// Short links (b23.tv) are resolved by the registry before this adapter
// sees the URL. The canonical form is the bare /video/<BVID> URL with every
// query parameter stripped.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use crate::atoms::types::{ParsedContent, ParsedContentDraft};

use super::{Adapter, AdapterContext, AdapterError};

const VIEW_API: &str = "https://api.bilibili.com/x/web-interface/view";

pub struct BilibiliAdapter {
    url_pattern: Regex,
}

impl BilibiliAdapter {
    pub fn new() -> Self {
        BilibiliAdapter {
            url_pattern: Regex::new(r"(?i)bilibili\.com/video/(BV[0-9A-Za-z]{10})").unwrap(),
        }
    }

    fn bvid(&self, url: &str) -> Option<String> {
        self.url_pattern.captures(url).map(|c| c[1].to_string())
    }
}

impl Default for BilibiliAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for BilibiliAdapter {
    fn name(&self) -> &'static str {
        "bilibili"
    }

    fn platform(&self) -> &'static str {
        "bilibili"
    }

    fn matches(&self, url: &str) -> bool {
        self.url_pattern.is_match(url)
    }

    fn canonicalize(&self, url: &str) -> Option<String> {
        self.bvid(url).map(|bvid| format!("https://www.bilibili.com/video/{bvid}"))
    }

    async fn parse(&self, url: &str, ctx: &AdapterContext) -> Result<ParsedContent, AdapterError> {
        let bvid = self
            .bvid(url)
            .ok_or_else(|| AdapterError::NotFound(format!("no BV id in {url}")))?;

        let response = ctx
            .client
            .get(VIEW_API)
            .query(&[("bvid", bvid.as_str())])
            .send()
            .await?;
        let status = response.status().as_u16();
        if crate::engine::http::is_retryable_status(status) {
            return Err(AdapterError::Transient(format!("view API HTTP {status}")));
        }
        let body: Value = response.json().await?;

        // API-level error codes: -404 gone, -403 restricted.
        match body["code"].as_i64().unwrap_or(0) {
            0 => {}
            -404 => return Err(AdapterError::NotFound(format!("video {bvid} does not exist"))),
            -403 => return Err(AdapterError::Auth(format!("video {bvid} requires credentials"))),
            code => {
                return Err(AdapterError::Transient(format!("view API code {code} for {bvid}")));
            }
        }

        let data = &body["data"];
        let stat = &data["stat"];
        let owner = &data["owner"];

        let tags: Vec<String> = data["tname"]
            .as_str()
            .map(|t| vec![t.to_string()])
            .unwrap_or_default();

        let draft = ParsedContentDraft {
            platform: self.platform().into(),
            content_type: "video".into(),
            content_id: bvid.clone(),
            title: data["title"].as_str().unwrap_or_default().to_string(),
            description: data["desc"].as_str().unwrap_or_default().to_string(),
            author_name: owner["name"].as_str().map(str::to_string),
            author_id: owner["mid"].as_i64().map(|m| m.to_string()),
            author_avatar_url: owner["face"].as_str().map(str::to_string),
            author_url: owner["mid"].as_i64().map(|m| format!("https://space.bilibili.com/{m}")),
            cover_url: data["pic"].as_str().map(str::to_string),
            media_urls: data["pic"].as_str().map(|p| vec![p.to_string()]).unwrap_or_default(),
            published_at: data["pubdate"]
                .as_i64()
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                .map(|t| t.to_rfc3339()),
            stats: Some(json!({
                "views": stat["view"],
                "likes": stat["like"],
                "coins": stat["coin"],
                "favorites": stat["favorite"],
                "danmaku": stat["danmaku"],
            })),
            tags,
            raw_metadata: Some(body.clone()),
            layout_type: Some("video".into()),
            canonical_url: format!("https://www.bilibili.com/video/{bvid}"),
            clean_url: Some(format!("https://www.bilibili.com/video/{bvid}")),
            is_nsfw: false,
        };

        ParsedContent::new(draft).map_err(AdapterError::Transient)
    }
}
