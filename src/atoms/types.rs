// ── VaultStream Atoms: Domain Types ────────────────────────────────────────
// Core records shared by every engine layer: archived contents, distribution
// rules and targets, bot accounts and chats, the triplet push queue, and the
// pushed-record audit trail.
//
// Conventions:
//   • All row ids are opaque i64 (SQLite rowids). Messages carry only ids;
//     entities are resolved at the edge.
//   • Timestamps are RFC 3339 UTC strings, written from Rust (never from SQL)
//     so that lexicographic comparison in queries is also chronological.
//   • Dynamic JSON fields (`raw_metadata`, `extra_stats`, conditions, render
//     configs) stay opaque at rest and are projected into the typed structs
//     below at the component boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Content lifecycle ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    Unprocessed,
    Processing,
    Pulled,
    Failed,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentStatus::Unprocessed => "unprocessed",
            ContentStatus::Processing => "processing",
            ContentStatus::Pulled => "pulled",
            ContentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unprocessed" => Some(ContentStatus::Unprocessed),
            "processing" => Some(ContentStatus::Processing),
            "pulled" => Some(ContentStatus::Pulled),
            "failed" => Some(ContentStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    AutoApproved,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
            ReviewStatus::AutoApproved => "auto_approved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReviewStatus::Pending),
            "approved" => Some(ReviewStatus::Approved),
            "rejected" => Some(ReviewStatus::Rejected),
            "auto_approved" => Some(ReviewStatus::AutoApproved),
            _ => None,
        }
    }

    /// Approved either by a human or by auto-approval conditions.
    pub fn is_approved(&self) -> bool {
        matches!(self, ReviewStatus::Approved | ReviewStatus::AutoApproved)
    }
}

/// How a content renders in outgoing messages and list views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutType {
    Article,
    Video,
    Gallery,
    Audio,
    Link,
}

impl LayoutType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayoutType::Article => "article",
            LayoutType::Video => "video",
            LayoutType::Gallery => "gallery",
            LayoutType::Audio => "audio",
            LayoutType::Link => "link",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "article" => Some(LayoutType::Article),
            "video" => Some(LayoutType::Video),
            "gallery" => Some(LayoutType::Gallery),
            "audio" => Some(LayoutType::Audio),
            "link" => Some(LayoutType::Link),
            _ => None,
        }
    }
}

// ── Content ────────────────────────────────────────────────────────────────

/// One archived item. Unique on `(platform, canonical_url)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub id: i64,
    pub platform: String,
    pub platform_id: String,
    pub url: String,
    /// Platform-normalized URL used as the dedup key. Set before first persist.
    pub canonical_url: String,
    pub clean_url: Option<String>,
    pub title: String,
    pub description: String,
    pub author_name: Option<String>,
    pub author_id: Option<String>,
    pub author_avatar_url: Option<String>,
    pub author_url: Option<String>,
    pub cover_url: Option<String>,
    pub cover_color: Option<String>,
    pub media_urls: Vec<String>,
    pub tags: Vec<String>,
    pub is_nsfw: bool,
    pub layout_type: Option<LayoutType>,
    pub layout_type_override: Option<LayoutType>,
    pub content_type: Option<String>,
    /// Per-platform stats (views, likes…). Opaque JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_stats: Option<Value>,
    /// Raw adapter output, including `archive.stored_images[]`. Opaque JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_metadata: Option<Value>,
    pub status: ContentStatus,
    pub review_status: ReviewStatus,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub last_error_type: Option<String>,
    pub last_error_at: Option<String>,
    pub reviewed_at: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_note: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Content {
    /// Effective layout: override wins, then the parsed value, then `link`
    /// as the heuristic fallback for never-parsed contents.
    pub fn effective_layout(&self) -> LayoutType {
        self.layout_type_override
            .or(self.layout_type)
            .unwrap_or(LayoutType::Link)
    }
}

/// One user submission of a canonical URL. Many per `Content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSource {
    pub id: i64,
    pub content_id: i64,
    pub url: String,
    pub tags: Vec<String>,
    pub note: Option<String>,
    pub source: Option<String>,
    pub submitted_at: String,
}

// ── Distribution rules & targets ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NsfwPolicy {
    Block,
    Allow,
    SeparateChannel,
}

impl NsfwPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            NsfwPolicy::Block => "block",
            NsfwPolicy::Allow => "allow",
            NsfwPolicy::SeparateChannel => "separate_channel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "block" => Some(NsfwPolicy::Block),
            "allow" => Some(NsfwPolicy::Allow),
            "separate_channel" => Some(NsfwPolicy::SeparateChannel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMatchMode {
    #[default]
    Any,
    All,
}

/// What a rule matches. Stored as JSON in `distribution_rules.match_conditions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchConditions {
    /// Platform equality; `None` or `"*"` matches any platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Tag intersection must be non-empty (`any`) or complete (`all`).
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tags_exclude: Vec<String>,
    #[serde(default)]
    pub tags_match_mode: TagMatchMode,
    /// NSFW equality, when specified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_nsfw: Option<bool>,
}

/// Conditions under which a pending content is auto-approved when a rule
/// matches it. Stored as JSON in `distribution_rules.auto_approve_conditions`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoApproveConditions {
    /// Only these platforms qualify; empty means any.
    #[serde(default)]
    pub platforms: Vec<String>,
    /// Content must carry at least one of these tags; empty means any.
    #[serde(default)]
    pub tags: Vec<String>,
    /// NSFW contents never auto-approve when set.
    #[serde(default)]
    pub exclude_nsfw: bool,
}

impl AutoApproveConditions {
    pub fn satisfied_by(&self, content: &Content) -> bool {
        if self.exclude_nsfw && content.is_nsfw {
            return false;
        }
        if !self.platforms.is_empty() && !self.platforms.iter().any(|p| p == &content.platform) {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| content.tags.contains(t)) {
            return false;
        }
        true
    }
}

/// Matching + default rendering for a set of targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionRule {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    /// Higher first. Also the default priority of queue items it produces.
    pub priority: i64,
    pub match_conditions: MatchConditions,
    pub nsfw_policy: NsfwPolicy,
    pub approval_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_approve_conditions: Option<AutoApproveConditions>,
    /// Sliding-window rate limit: at most `rate_limit` pushes per target per
    /// `time_window_secs`. `None` disables the limiter for this rule.
    pub rate_limit: Option<u32>,
    pub time_window_secs: Option<u32>,
    pub render_config: RenderConfig,
    pub created_at: String,
    pub updated_at: String,
}

/// Rule → chat association with per-target overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionTarget {
    pub id: i64,
    pub rule_id: i64,
    pub bot_chat_id: i64,
    pub enabled: bool,
    /// Batch same-timestamp items into one forwarded message where the
    /// platform supports it.
    pub merge_forward: bool,
    pub use_author_name: bool,
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render_config_override: Option<RenderConfig>,
}

// ── Render config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorMode {
    None,
    Name,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentMode {
    Hidden,
    Summary,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaMode {
    None,
    Auto,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMode {
    None,
    Clean,
    Original,
}

/// Declarative template controlling what appears in an outgoing message.
/// Every field is optional so configs layer: target override → rule →
/// system defaults (`RenderConfig::resolved`). Canonicalized to this flat
/// keyset on ingress; the legacy nested `{structure: {...}}` shape is
/// accepted and flattened by `RenderConfig::normalize`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_platform_id: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_title: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_tags: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_mode: Option<AuthorMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_mode: Option<ContentMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_mode: Option<MediaMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_mode: Option<LinkMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer_text: Option<String>,
}

impl RenderConfig {
    /// Parse a stored JSON value, accepting both the canonical flat shape and
    /// the legacy nested `{"structure": {...}}` wrapper.
    pub fn normalize(value: &Value) -> RenderConfig {
        let flat = match value.get("structure") {
            Some(inner) if inner.is_object() => inner,
            _ => value,
        };
        serde_json::from_value(flat.clone()).unwrap_or_default()
    }

    /// Overlay `self` (the more specific layer) on top of `base`.
    pub fn merged_over(&self, base: &RenderConfig) -> RenderConfig {
        RenderConfig {
            show_platform_id: self.show_platform_id.or(base.show_platform_id),
            show_title: self.show_title.or(base.show_title),
            show_tags: self.show_tags.or(base.show_tags),
            author_mode: self.author_mode.or(base.author_mode),
            content_mode: self.content_mode.or(base.content_mode),
            media_mode: self.media_mode.or(base.media_mode),
            link_mode: self.link_mode.or(base.link_mode),
            header_text: self.header_text.clone().or_else(|| base.header_text.clone()),
            footer_text: self.footer_text.clone().or_else(|| base.footer_text.clone()),
        }
    }

    /// Fill every unset field with the system default.
    pub fn resolved(&self) -> ResolvedRenderConfig {
        ResolvedRenderConfig {
            show_platform_id: self.show_platform_id.unwrap_or(false),
            show_title: self.show_title.unwrap_or(true),
            show_tags: self.show_tags.unwrap_or(true),
            author_mode: self.author_mode.unwrap_or(AuthorMode::Name),
            content_mode: self.content_mode.unwrap_or(ContentMode::Summary),
            media_mode: self.media_mode.unwrap_or(MediaMode::Auto),
            link_mode: self.link_mode.unwrap_or(LinkMode::Clean),
            header_text: self.header_text.clone().unwrap_or_default(),
            footer_text: self.footer_text.clone().unwrap_or_default(),
        }
    }
}

/// A render config with every field decided. What the renderer consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRenderConfig {
    pub show_platform_id: bool,
    pub show_title: bool,
    pub show_tags: bool,
    pub author_mode: AuthorMode,
    pub content_mode: ContentMode,
    pub media_mode: MediaMode,
    pub link_mode: LinkMode,
    pub header_text: String,
    pub footer_text: String,
}

// ── Bot accounts & chats ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotPlatform {
    Telegram,
    Qq,
}

impl BotPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotPlatform::Telegram => "telegram",
            BotPlatform::Qq => "qq",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "telegram" => Some(BotPlatform::Telegram),
            "qq" => Some(BotPlatform::Qq),
            _ => None,
        }
    }
}

/// Credentials + lifecycle of one bot account.
/// At most one `is_primary = true` per platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub id: i64,
    pub platform: BotPlatform,
    pub name: String,
    pub enabled: bool,
    pub is_primary: bool,
    /// Telegram bot token. Masked in API responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    /// OneBot 11 bridge endpoints (QQ).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub napcat_http_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub napcat_ws_url: Option<String>,
    /// Discovered identity after the first successful probe.
    pub bot_id: Option<String>,
    pub bot_username: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A chat the bot has joined. Owned by `BotConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotChat {
    pub id: i64,
    pub bot_config_id: i64,
    /// Platform-side chat identifier (TG chat id / QQ group number).
    pub chat_id: String,
    pub chat_type: String,
    pub title: String,
    pub username: Option<String>,
    pub is_accessible: bool,
    pub enabled: bool,
    pub can_post: bool,
    pub total_pushed: i64,
    pub last_pushed_at: Option<String>,
    /// Redirect NSFW items here under `separate_channel` policy.
    pub nsfw_chat_id: Option<String>,
}

// ── Queue items ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Scheduled,
    Processing,
    Success,
    Failed,
    Skipped,
    Canceled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Scheduled => "scheduled",
            QueueStatus::Processing => "processing",
            QueueStatus::Success => "success",
            QueueStatus::Failed => "failed",
            QueueStatus::Skipped => "skipped",
            QueueStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "scheduled" => Some(QueueStatus::Scheduled),
            "processing" => Some(QueueStatus::Processing),
            "success" => Some(QueueStatus::Success),
            "failed" => Some(QueueStatus::Failed),
            "skipped" => Some(QueueStatus::Skipped),
            "canceled" => Some(QueueStatus::Canceled),
            _ => None,
        }
    }

    /// Terminal statuses never transition back except via explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Success | QueueStatus::Failed | QueueStatus::Skipped | QueueStatus::Canceled
        )
    }

    /// Logical bucket the stats endpoint groups by.
    pub fn bucket(&self) -> &'static str {
        match self {
            QueueStatus::Scheduled | QueueStatus::Processing => "will_push",
            QueueStatus::Pending => "pending_review",
            QueueStatus::Success => "pushed",
            QueueStatus::Failed | QueueStatus::Skipped | QueueStatus::Canceled => "filtered",
        }
    }
}

/// One `(content, rule, target)` triple awaiting delivery. The heart of the
/// distribution queue; unique on the triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentQueueItem {
    pub id: i64,
    pub content_id: i64,
    pub rule_id: i64,
    pub bot_chat_id: i64,
    pub status: QueueStatus,
    pub scheduled_at: Option<String>,
    /// Higher sorts earlier within the same `scheduled_at`.
    pub priority: i64,
    pub next_attempt_at: Option<String>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub locked_at: Option<String>,
    pub locked_by: Option<String>,
    pub message_id: Option<String>,
    /// Optional pre-render cache; `None` means render lazily at push time.
    pub rendered_payload: Option<String>,
    pub last_error: Option<String>,
    pub last_error_type: Option<String>,
    pub last_error_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub needs_approval: bool,
    pub approved_at: Option<String>,
    pub approved_by: Option<String>,
    pub nsfw_routing_result: Option<String>,
    pub passed_rate_limit: bool,
    pub rate_limit_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// ── Pushed records ─────────────────────────────────────────────────────────

/// Idempotency + audit row written on delivery. Unique `(content_id,
/// target_id)`; presence blocks a re-push unless the content was re-approved
/// after `pushed_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushedRecord {
    pub id: i64,
    pub content_id: i64,
    pub target_id: i64,
    pub message_id: String,
    pub push_status: String,
    pub pushed_at: String,
    pub error_message: Option<String>,
}

// ── Durable tasks (parse / distribute) ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Parse,
    Distribute,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Parse => "parse",
            TaskKind::Distribute => "distribute",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "parse" => Some(TaskKind::Parse),
            "distribute" => Some(TaskKind::Distribute),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    /// Exhausted all attempts; kept for inspection, never claimed again.
    Dead,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            "dead" => Some(TaskStatus::Dead),
            _ => None,
        }
    }
}

/// Durable work queue row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub kind: TaskKind,
    /// `{"content_id": …}` for parse, `{"queue_item_id": …}` for distribute.
    pub payload: Value,
    pub status: TaskStatus,
    pub priority: i64,
    pub retry_count: u32,
    pub max_attempts: u32,
    pub scheduled_for: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// ── Parsed content (adapter contract) ──────────────────────────────────────

/// Normalized output of a platform adapter. The constructor is the only way
/// to build one, and it rejects a missing or invalid `layout_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedContent {
    pub platform: String,
    pub content_type: String,
    pub content_id: String,
    pub title: String,
    pub description: String,
    pub author_name: Option<String>,
    pub author_id: Option<String>,
    pub author_avatar_url: Option<String>,
    pub author_url: Option<String>,
    pub cover_url: Option<String>,
    pub media_urls: Vec<String>,
    pub published_at: Option<String>,
    pub stats: Value,
    pub tags: Vec<String>,
    pub raw_metadata: Value,
    pub layout_type: LayoutType,
    pub canonical_url: String,
    pub clean_url: Option<String>,
    pub is_nsfw: bool,
}

/// Builder-style input for `ParsedContent::new`. Adapters fill what they
/// know; the constructor enforces the contract.
#[derive(Debug, Clone, Default)]
pub struct ParsedContentDraft {
    pub platform: String,
    pub content_type: String,
    pub content_id: String,
    pub title: String,
    pub description: String,
    pub author_name: Option<String>,
    pub author_id: Option<String>,
    pub author_avatar_url: Option<String>,
    pub author_url: Option<String>,
    pub cover_url: Option<String>,
    pub media_urls: Vec<String>,
    pub published_at: Option<String>,
    pub stats: Option<Value>,
    pub tags: Vec<String>,
    pub raw_metadata: Option<Value>,
    /// Mandatory. `None` or an unknown string fails construction.
    pub layout_type: Option<String>,
    pub canonical_url: String,
    pub clean_url: Option<String>,
    pub is_nsfw: bool,
}

impl ParsedContent {
    pub fn new(draft: ParsedContentDraft) -> Result<ParsedContent, String> {
        let layout_str = draft
            .layout_type
            .ok_or_else(|| "parsed content is missing layout_type".to_string())?;
        let layout_type = LayoutType::parse(&layout_str)
            .ok_or_else(|| format!("invalid layout_type '{layout_str}'"))?;
        if draft.platform.is_empty() {
            return Err("parsed content is missing platform".into());
        }
        if draft.canonical_url.is_empty() {
            return Err("parsed content is missing canonical_url".into());
        }
        Ok(ParsedContent {
            platform: draft.platform,
            content_type: draft.content_type,
            content_id: draft.content_id,
            title: draft.title,
            description: draft.description,
            author_name: draft.author_name,
            author_id: draft.author_id,
            author_avatar_url: draft.author_avatar_url,
            author_url: draft.author_url,
            cover_url: draft.cover_url,
            media_urls: draft.media_urls,
            published_at: draft.published_at,
            stats: draft.stats.unwrap_or_else(|| Value::Object(Default::default())),
            tags: draft.tags,
            raw_metadata: draft.raw_metadata.unwrap_or_else(|| Value::Object(Default::default())),
            layout_type,
            canonical_url: draft.canonical_url,
            clean_url: draft.clean_url,
            is_nsfw: draft.is_nsfw,
        })
    }
}

// ── Realtime events ────────────────────────────────────────────────────────

/// Event names the core emits. `as_str` values are the wire names used both
/// on the SSE stream and in the outbox table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ContentCreated,
    ContentUpdated,
    ContentDeleted,
    ContentReParsed,
    QueueUpdated,
    QueueItemReordered,
    ContentPushed,
    DistributionPushSuccess,
    DistributionPushFailed,
    BotStatusChanged,
    BotSyncProgress,
    BotSyncCompleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ContentCreated => "content_created",
            EventKind::ContentUpdated => "content_updated",
            EventKind::ContentDeleted => "content_deleted",
            EventKind::ContentReParsed => "content_re_parsed",
            EventKind::QueueUpdated => "queue_updated",
            EventKind::QueueItemReordered => "queue_item_reordered",
            EventKind::ContentPushed => "content_pushed",
            EventKind::DistributionPushSuccess => "distribution_push_success",
            EventKind::DistributionPushFailed => "distribution_push_failed",
            EventKind::BotStatusChanged => "bot_status_changed",
            EventKind::BotSyncProgress => "bot_sync_progress",
            EventKind::BotSyncCompleted => "bot_sync_completed",
        }
    }
}

/// A bus event: in-flight form delivered to subscribers. The durable outbox
/// row carries the same `(kind, payload)` plus `(id, origin, created_at)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parsed_content_requires_layout_type() {
        let draft = ParsedContentDraft {
            platform: "bilibili".into(),
            canonical_url: "https://www.bilibili.com/video/BV1".into(),
            layout_type: None,
            ..Default::default()
        };
        assert!(ParsedContent::new(draft).is_err());

        let bad = ParsedContentDraft {
            platform: "bilibili".into(),
            canonical_url: "https://www.bilibili.com/video/BV1".into(),
            layout_type: Some("carousel".into()),
            ..Default::default()
        };
        assert!(ParsedContent::new(bad).is_err());

        let ok = ParsedContentDraft {
            platform: "bilibili".into(),
            canonical_url: "https://www.bilibili.com/video/BV1".into(),
            layout_type: Some("video".into()),
            ..Default::default()
        };
        assert_eq!(ParsedContent::new(ok).unwrap().layout_type, LayoutType::Video);
    }

    #[test]
    fn render_config_normalizes_legacy_nested_shape() {
        let legacy = json!({"structure": {"show_title": false, "link_mode": "original"}});
        let cfg = RenderConfig::normalize(&legacy);
        assert_eq!(cfg.show_title, Some(false));
        assert_eq!(cfg.link_mode, Some(LinkMode::Original));

        let flat = json!({"author_mode": "full"});
        assert_eq!(RenderConfig::normalize(&flat).author_mode, Some(AuthorMode::Full));
    }

    #[test]
    fn render_config_merge_prefers_specific_layer() {
        let rule = RenderConfig { show_title: Some(true), header_text: Some("rule".into()), ..Default::default() };
        let target = RenderConfig { header_text: Some("target".into()), ..Default::default() };
        let merged = target.merged_over(&rule);
        assert_eq!(merged.show_title, Some(true));
        assert_eq!(merged.header_text.as_deref(), Some("target"));
    }

    #[test]
    fn queue_status_buckets() {
        assert_eq!(QueueStatus::Scheduled.bucket(), "will_push");
        assert_eq!(QueueStatus::Pending.bucket(), "pending_review");
        assert_eq!(QueueStatus::Success.bucket(), "pushed");
        assert_eq!(QueueStatus::Canceled.bucket(), "filtered");
        assert!(QueueStatus::Canceled.is_terminal());
        assert!(!QueueStatus::Processing.is_terminal());
    }

    #[test]
    fn effective_layout_prefers_override() {
        let mut content = Content {
            id: 1,
            platform: "web".into(),
            platform_id: String::new(),
            url: "https://example.com".into(),
            canonical_url: "https://example.com".into(),
            clean_url: None,
            title: String::new(),
            description: String::new(),
            author_name: None,
            author_id: None,
            author_avatar_url: None,
            author_url: None,
            cover_url: None,
            cover_color: None,
            media_urls: vec![],
            tags: vec![],
            is_nsfw: false,
            layout_type: Some(LayoutType::Article),
            layout_type_override: None,
            content_type: None,
            extra_stats: None,
            raw_metadata: None,
            status: ContentStatus::Pulled,
            review_status: ReviewStatus::Pending,
            failure_count: 0,
            last_error: None,
            last_error_type: None,
            last_error_at: None,
            reviewed_at: None,
            reviewed_by: None,
            reviewed_note: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(content.effective_layout(), LayoutType::Article);
        content.layout_type_override = Some(LayoutType::Gallery);
        assert_eq!(content.effective_layout(), LayoutType::Gallery);
        content.layout_type = None;
        content.layout_type_override = None;
        assert_eq!(content.effective_layout(), LayoutType::Link);
    }
}
