// VaultStream Engine — Generic Fallback Adapter
//
// Handles any URL no pattern adapter claims. Fetches the page, extracts
// title/description/media from standard meta tags, strips markup from the
// body, and infers a layout:
//   video URL present          → video
//   audio URL present          → audio
//   images ≥ 2 and body < 500  → gallery
//   body > 1000                → article
//   else an LLM hint when TEXT_LLM_* is configured, else article.

use async_trait::async_trait;
use log::{debug, warn};
use regex::Regex;
use serde_json::{json, Value};

use crate::atoms::types::{ParsedContent, ParsedContentDraft};
use crate::engine::settings::keys;

use super::{Adapter, AdapterContext, AdapterError};

/// Layout inference thresholds.
const GALLERY_MAX_BODY: usize = 500;
const ARTICLE_MIN_BODY: usize = 1000;

pub struct GenericAdapter {
    title_re: Regex,
    meta_re: Regex,
    tag_strip_re: Regex,
}

impl GenericAdapter {
    pub fn new() -> Self {
        GenericAdapter {
            title_re: Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap(),
            meta_re: Regex::new(
                r#"(?is)<meta[^>]+(?:property|name)\s*=\s*["']([^"']+)["'][^>]+content\s*=\s*["']([^"']*)["']"#,
            )
            .unwrap(),
            tag_strip_re: Regex::new(r"(?is)<script.*?</script>|<style.*?</style>|<[^>]+>").unwrap(),
        }
    }

    fn extract_meta(&self, html: &str, key: &str) -> Option<String> {
        self.meta_re
            .captures_iter(html)
            .find(|c| c[1].eq_ignore_ascii_case(key))
            .map(|c| c[2].trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn extract_images(&self, html: &str) -> Vec<String> {
        let mut images: Vec<String> = self
            .meta_re
            .captures_iter(html)
            .filter(|c| c[1].eq_ignore_ascii_case("og:image"))
            .map(|c| c[2].trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        images.dedup();
        images
    }

    fn body_text(&self, html: &str) -> String {
        let stripped = self.tag_strip_re.replace_all(html, " ");
        stripped.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Heuristic layout inference; the LLM hint is only consulted for the
    /// ambiguous middle band.
    fn infer_layout(
        video_url: Option<&str>,
        audio_url: Option<&str>,
        image_count: usize,
        body_len: usize,
    ) -> Option<&'static str> {
        if video_url.is_some() {
            return Some("video");
        }
        if audio_url.is_some() {
            return Some("audio");
        }
        if image_count >= 2 && body_len < GALLERY_MAX_BODY {
            return Some("gallery");
        }
        if body_len > ARTICLE_MIN_BODY {
            return Some("article");
        }
        None
    }

    /// Ask the configured text LLM to pick a layout for the ambiguous case.
    /// Any failure degrades to `None` (the caller defaults to article).
    async fn llm_layout_hint(&self, ctx: &AdapterContext, title: &str, body: &str) -> Option<String> {
        let base = ctx.settings.get(keys::TEXT_LLM_API_BASE)?;
        let key = ctx.settings.get(keys::TEXT_LLM_API_KEY)?;
        let model = ctx.settings.get(keys::TEXT_LLM_API_MODEL)?;

        let excerpt: String = body.chars().take(1500).collect();
        let request = json!({
            "model": model,
            "messages": [{
                "role": "user",
                "content": format!(
                    "Classify this web page as exactly one of: article, video, gallery, audio, link.\n\
                     Reply with the single word only.\nTitle: {title}\nBody: {excerpt}"
                ),
            }],
            "max_tokens": 8,
        });

        let response = ctx
            .client
            .post(format!("{}/chat/completions", base.trim_end_matches('/')))
            .bearer_auth(key)
            .json(&request)
            .send()
            .await
            .ok()?;
        let body: Value = response.json().await.ok()?;
        let hint = body["choices"][0]["message"]["content"].as_str()?.trim().to_lowercase();
        match hint.as_str() {
            "article" | "video" | "gallery" | "audio" | "link" => Some(hint),
            other => {
                debug!("[adapters] LLM layout hint '{}' ignored", other);
                None
            }
        }
    }
}

impl Default for GenericAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for GenericAdapter {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn platform(&self) -> &'static str {
        "web"
    }

    fn matches(&self, _url: &str) -> bool {
        true
    }

    /// Canonical form: scheme + host + path, tracking params and fragments
    /// dropped, non-tracking query preserved.
    fn canonicalize(&self, url: &str) -> Option<String> {
        let mut parsed = url::Url::parse(url).ok()?;
        parsed.set_fragment(None);
        let kept: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(k, _)| !k.starts_with("utm_") && k != "spm_id_from" && k != "fbclid")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            parsed.set_query(None);
        } else {
            let query = kept
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            parsed.set_query(Some(&query));
        }
        Some(parsed.to_string())
    }

    async fn parse(&self, url: &str, ctx: &AdapterContext) -> Result<ParsedContent, AdapterError> {
        let response = ctx.client.get(url).send().await?;
        let status = response.status().as_u16();
        if status == 404 || status == 410 {
            return Err(AdapterError::NotFound(format!("HTTP {status} for {url}")));
        }
        if status == 401 || status == 403 {
            return Err(AdapterError::Auth(format!("HTTP {status} for {url}")));
        }
        if !response.status().is_success() {
            return Err(AdapterError::Transient(format!("HTTP {status} for {url}")));
        }
        let html = response.text().await?;

        let title = self
            .extract_meta(&html, "og:title")
            .or_else(|| self.title_re.captures(&html).map(|c| c[1].trim().to_string()))
            .unwrap_or_else(|| url.to_string());
        let description = self
            .extract_meta(&html, "og:description")
            .or_else(|| self.extract_meta(&html, "description"))
            .unwrap_or_default();
        let video_url = self.extract_meta(&html, "og:video");
        let audio_url = self.extract_meta(&html, "og:audio");
        let images = self.extract_images(&html);
        let author = self.extract_meta(&html, "author").or_else(|| self.extract_meta(&html, "og:site_name"));
        let body = self.body_text(&html);

        let layout = match Self::infer_layout(video_url.as_deref(), audio_url.as_deref(), images.len(), body.len())
        {
            Some(layout) => layout.to_string(),
            None => self
                .llm_layout_hint(ctx, &title, &body)
                .await
                .unwrap_or_else(|| "article".to_string()),
        };

        let canonical = self
            .canonicalize(url)
            .ok_or_else(|| AdapterError::NotFound(format!("uncanonicalizable URL {url}")))?;

        let draft = ParsedContentDraft {
            platform: self.platform().into(),
            content_type: layout.clone(),
            content_id: canonical.clone(),
            title,
            description,
            author_name: author,
            cover_url: images.first().cloned(),
            media_urls: images,
            stats: Some(json!({})),
            raw_metadata: Some(json!({
                "body_chars": body.len(),
                "video_url": video_url,
                "audio_url": audio_url,
            })),
            layout_type: Some(layout),
            canonical_url: canonical.clone(),
            clean_url: Some(canonical),
            ..Default::default()
        };

        ParsedContent::new(draft).map_err(|e| {
            warn!("[adapters] generic draft rejected: {}", e);
            AdapterError::Transient(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_heuristics() {
        assert_eq!(GenericAdapter::infer_layout(Some("v"), None, 0, 10), Some("video"));
        assert_eq!(GenericAdapter::infer_layout(None, Some("a"), 5, 10), Some("audio"));
        assert_eq!(GenericAdapter::infer_layout(None, None, 3, 200), Some("gallery"));
        assert_eq!(GenericAdapter::infer_layout(None, None, 3, 900), None);
        assert_eq!(GenericAdapter::infer_layout(None, None, 0, 2000), Some("article"));
        assert_eq!(GenericAdapter::infer_layout(None, None, 0, 700), None);
    }

    #[test]
    fn canonicalize_strips_tracking_but_keeps_real_query() {
        let adapter = GenericAdapter::new();
        assert_eq!(
            adapter.canonicalize("https://example.com/post?utm_source=tg&id=42#frag").as_deref(),
            Some("https://example.com/post?id=42")
        );
        assert_eq!(
            adapter.canonicalize("https://example.com/post?utm_source=tg").as_deref(),
            Some("https://example.com/post")
        );
    }

    #[test]
    fn meta_extraction_reads_og_tags() {
        let adapter = GenericAdapter::new();
        let html = r#"<html><head>
            <title>Fallback</title>
            <meta property="og:title" content="OG Title" />
            <meta property="og:image" content="https://img.example/a.jpg" />
            <meta property="og:image" content="https://img.example/b.jpg" />
            <meta name="description" content="Plain description" />
        </head><body><p>Hello world</p></body></html>"#;
        assert_eq!(adapter.extract_meta(html, "og:title").as_deref(), Some("OG Title"));
        assert_eq!(adapter.extract_meta(html, "description").as_deref(), Some("Plain description"));
        assert_eq!(adapter.extract_images(html).len(), 2);
        assert_eq!(adapter.body_text(html), "Fallback Hello world");
    }
}
