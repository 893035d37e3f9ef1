// VaultStream Engine — Message Renderer
//
// Turns an archived content into the outgoing message for one target:
//   effective config = target override ▸ rule config ▸ system defaults
// Header and footer are templates over {{title}} {{author}} {{url}}
// {{date}} {{tags}} {{summary}}; unknown placeholders render as empty.
// Media selection prefers the archived WebP copies recorded during the
// parse over the original platform URLs.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::atoms::types::{
    AuthorMode, Content, ContentMode, DistributionRule, DistributionTarget, LinkMode, MediaMode,
    ResolvedRenderConfig,
};
use crate::engine::transports::RenderedMessage;

const SUMMARY_CHARS: usize = 200;

/// Effective render config for a `(rule, target)` pair.
pub fn effective_config(rule: &DistributionRule, target: &DistributionTarget) -> ResolvedRenderConfig {
    match &target.render_config_override {
        Some(overlay) => overlay.merged_over(&rule.render_config).resolved(),
        None => rule.render_config.resolved(),
    }
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{(\w+)\}\}").unwrap())
}

/// Expand template placeholders from a content. Unknown names → empty.
pub fn render_template(template: &str, content: &Content) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| match &caps[1] {
            "title" => content.title.clone(),
            "author" => content.author_name.clone().unwrap_or_default(),
            "url" => link_for(content, LinkMode::Clean).unwrap_or_default(),
            "date" => content.created_at.chars().take(10).collect(),
            "tags" => hashtags(&content.tags),
            "summary" => summary_of(content, None),
            _ => String::new(),
        })
        .into_owned()
}

fn hashtags(tags: &[String]) -> String {
    tags.iter().map(|t| format!("#{t}")).collect::<Vec<_>>().join(" ")
}

fn summary_of(content: &Content, custom: Option<&str>) -> String {
    if let Some(custom) = custom {
        return custom.to_string();
    }
    let mut summary: String = content.description.chars().take(SUMMARY_CHARS).collect();
    if content.description.chars().count() > SUMMARY_CHARS {
        summary.push('…');
    }
    summary
}

fn link_for(content: &Content, mode: LinkMode) -> Option<String> {
    match mode {
        LinkMode::None => None,
        LinkMode::Clean => content.clean_url.clone().or_else(|| Some(content.canonical_url.clone())),
        LinkMode::Original => Some(content.url.clone()),
    }
}

/// The archived image URLs recorded in `raw_metadata.archive.stored_images`.
fn archived_urls(content: &Content) -> Vec<String> {
    content
        .raw_metadata
        .as_ref()
        .and_then(|m| m["archive"]["stored_images"].as_array())
        .map(|images| {
            images
                .iter()
                .filter_map(|i| i["url"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn select_media(content: &Content, mode: MediaMode) -> Vec<String> {
    match mode {
        MediaMode::None => Vec::new(),
        MediaMode::Auto => {
            let archived = archived_urls(content);
            if !archived.is_empty() {
                return archived;
            }
            match &content.cover_url {
                Some(cover) => vec![cover.clone()],
                None => content.media_urls.iter().take(1).cloned().collect(),
            }
        }
        MediaMode::All => {
            let archived = archived_urls(content);
            if archived.len() >= content.media_urls.len() {
                archived
            } else {
                content.media_urls.clone()
            }
        }
    }
}

/// Render one content for one target.
pub fn render_message(
    content: &Content,
    config: &ResolvedRenderConfig,
    target: &DistributionTarget,
) -> RenderedMessage {
    let mut lines: Vec<String> = Vec::new();

    if !config.header_text.is_empty() {
        lines.push(render_template(&config.header_text, content));
    }
    if config.show_title && !content.title.is_empty() {
        lines.push(content.title.clone());
    }
    if config.show_platform_id && !content.platform_id.is_empty() {
        lines.push(format!("[{}] {}", content.platform, content.platform_id));
    }

    let author_line = match config.author_mode {
        AuthorMode::None => None,
        _ if !target.use_author_name => None,
        AuthorMode::Name => content.author_name.clone(),
        AuthorMode::Full => match (&content.author_name, &content.author_url) {
            (Some(name), Some(author_url)) => Some(format!("{name} ({author_url})")),
            (Some(name), None) => Some(name.clone()),
            _ => None,
        },
    };
    if let Some(author) = author_line {
        lines.push(format!("by {author}"));
    }

    match config.content_mode {
        ContentMode::Hidden => {}
        ContentMode::Summary => {
            let summary = summary_of(content, target.summary.as_deref());
            if !summary.is_empty() {
                lines.push(summary);
            }
        }
        ContentMode::Full => {
            if !content.description.is_empty() {
                lines.push(content.description.clone());
            }
        }
    }

    if config.show_tags && !content.tags.is_empty() {
        lines.push(hashtags(&content.tags));
    }
    if let Some(link) = link_for(content, config.link_mode) {
        lines.push(link);
    }
    if !config.footer_text.is_empty() {
        lines.push(render_template(&config.footer_text, content));
    }

    RenderedMessage { text: lines.join("\n"), media_urls: select_media(content, config.media_mode) }
}

// ── Payload cache ──────────────────────────────────────────────────────────
// The queue item's `rendered_payload` column stores this JSON shape so a
// re-claimed item can skip the render step.

#[derive(Serialize, Deserialize)]
struct CachedPayload {
    text: String,
    media_urls: Vec<String>,
}

pub fn payload_to_string(message: &RenderedMessage) -> String {
    serde_json::to_string(&CachedPayload {
        text: message.text.clone(),
        media_urls: message.media_urls.clone(),
    })
    .unwrap_or_default()
}

pub fn payload_from_string(raw: &str) -> Option<RenderedMessage> {
    serde_json::from_str::<CachedPayload>(raw)
        .ok()
        .map(|p| RenderedMessage { text: p.text, media_urls: p.media_urls })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::*;
    use serde_json::json;

    fn content() -> Content {
        Content {
            id: 1,
            platform: "bilibili".into(),
            platform_id: "BV1xx".into(),
            url: "https://www.bilibili.com/video/BV1xx?from=share".into(),
            canonical_url: "https://www.bilibili.com/video/BV1xx".into(),
            clean_url: Some("https://www.bilibili.com/video/BV1xx".into()),
            title: "A tour of queues".into(),
            description: "Long description ".repeat(30),
            author_name: Some("ien".into()),
            author_id: None,
            author_avatar_url: None,
            author_url: Some("https://space.bilibili.com/1".into()),
            cover_url: Some("https://cover/1.jpg".into()),
            cover_color: None,
            media_urls: vec!["https://img/1.jpg".into(), "https://img/2.jpg".into()],
            tags: vec!["tech".into(), "rust".into()],
            is_nsfw: false,
            layout_type: Some(LayoutType::Video),
            layout_type_override: None,
            content_type: Some("video".into()),
            extra_stats: None,
            raw_metadata: Some(json!({
                "archive": { "stored_images": [
                    { "url": "https://cdn/blobs/a.webp" },
                    { "url": "https://cdn/blobs/b.webp" }
                ]}
            })),
            status: ContentStatus::Pulled,
            review_status: ReviewStatus::Approved,
            failure_count: 0,
            last_error: None,
            last_error_type: None,
            last_error_at: None,
            reviewed_at: None,
            reviewed_by: None,
            reviewed_note: None,
            created_at: "2026-07-01T10:00:00+00:00".into(),
            updated_at: "2026-07-01T10:00:00+00:00".into(),
        }
    }

    fn target() -> DistributionTarget {
        DistributionTarget {
            id: 1,
            rule_id: 1,
            bot_chat_id: 1,
            enabled: true,
            merge_forward: false,
            use_author_name: true,
            summary: None,
            render_config_override: None,
        }
    }

    #[test]
    fn template_expands_known_and_blanks_unknown() {
        let c = content();
        assert_eq!(render_template("{{title}} — {{date}}", &c), "A tour of queues — 2026-07-01");
        assert_eq!(render_template("{{nope}}{{author}}", &c), "ien");
        assert_eq!(render_template("{{tags}}", &c), "#tech #rust");
    }

    #[test]
    fn render_respects_modes() {
        let c = content();
        let t = target();
        let config = ResolvedRenderConfig {
            show_platform_id: false,
            show_title: true,
            show_tags: false,
            author_mode: AuthorMode::Name,
            content_mode: ContentMode::Hidden,
            media_mode: MediaMode::None,
            link_mode: LinkMode::Original,
            header_text: String::new(),
            footer_text: "via {{author}}".into(),
        };
        let message = render_message(&c, &config, &t);
        assert!(message.text.contains("A tour of queues"));
        assert!(message.text.contains("by ien"));
        assert!(message.text.contains("?from=share"), "original link mode keeps the raw URL");
        assert!(message.text.ends_with("via ien"));
        assert!(message.media_urls.is_empty());
        assert!(!message.text.contains("#tech"));
    }

    #[test]
    fn auto_media_prefers_archived_copies() {
        let c = content();
        let resolved = RenderConfig::default().resolved();
        let message = render_message(&c, &resolved, &target());
        assert_eq!(message.media_urls, vec!["https://cdn/blobs/a.webp", "https://cdn/blobs/b.webp"]);
    }

    #[test]
    fn target_summary_overrides_description() {
        let c = content();
        let mut t = target();
        t.summary = Some("hand-written blurb".into());
        let resolved = RenderConfig::default().resolved();
        let message = render_message(&c, &resolved, &t);
        assert!(message.text.contains("hand-written blurb"));
        assert!(!message.text.contains("Long description Long description Long"));
    }

    #[test]
    fn payload_cache_roundtrip() {
        let message = RenderedMessage { text: "t".into(), media_urls: vec!["u".into()] };
        let cached = payload_to_string(&message);
        assert_eq!(payload_from_string(&cached).unwrap(), message);
        assert!(payload_from_string("not json").is_none());
    }
}
