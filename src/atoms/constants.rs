// ── VaultStream Atoms: Constants ───────────────────────────────────────────
// All named constants for the crate live here.
// Rationale: collecting constants in one place eliminates magic numbers,
// makes auditing easier, and keeps every layer's code self-documenting.

// ── Task queue (parse / distribute) ────────────────────────────────────────
// Used by the durable task queue and the parse worker.

/// A claimed task whose lease is older than this is considered abandoned
/// and may be re-claimed by another worker.
pub const TASK_LEASE_SECS: i64 = 600; // 10 minutes

/// Default attempt ceiling for both task kinds and queue items.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Retry backoff base delay (doubles each attempt).
pub const RETRY_BASE_MS: u64 = 1_000;

/// Retry backoff cap.
pub const RETRY_CAP_MS: u64 = 300_000; // 5 minutes

/// Jitter applied to every computed backoff delay (± this fraction).
pub const RETRY_JITTER_FRACTION: f64 = 0.20;

// ── Parse worker ───────────────────────────────────────────────────────────

/// Concurrent parse slots per worker process.
pub const PARSE_CONCURRENCY_DEFAULT: usize = 4;

/// Adapter HTTP call timeout.
pub const ADAPTER_TIMEOUT_SECS: u64 = 30;

// ── Push worker ────────────────────────────────────────────────────────────

/// Push worker polling interval when idle. `push_now` wakes it immediately.
pub const PUSH_POLL_SECS: u64 = 30;

/// Queue items claimed per poll.
pub const PUSH_BATCH_SIZE: u32 = 16;

/// Lease on a claimed queue item; a crashed worker's items become
/// re-claimable after this.
pub const PUSH_LEASE_SECS: i64 = 600;

/// Transport call timeout.
pub const TRANSPORT_TIMEOUT_SECS: u64 = 60;

/// `push_now` rewinds `scheduled_at` by this much and pins this priority so
/// the item sorts first in every view and every claim.
pub const PUSH_NOW_REWIND_HOURS: i64 = 24;
pub const PUSH_NOW_PRIORITY: i64 = 9_999;

// ── Event bus ──────────────────────────────────────────────────────────────

/// Cross-process outbox polling interval.
pub const OUTBOX_POLL_MS: u64 = 1_000;

/// Bounded per-subscriber queue; a slower subscriber drops oldest events
/// and observes a `dropped_n` counter event instead.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ── Queue ordering / reorder ───────────────────────────────────────────────

/// Priority gap allocated between adjacent items when renormalizing, so a
/// reorder can usually slot between two neighbours without touching them.
pub const PRIORITY_GAP: i64 = 1_024;

// ── Media archive ──────────────────────────────────────────────────────────

/// Default WebP re-encode quality (0–100).
pub const ARCHIVE_WEBP_QUALITY_DEFAULT: u8 = 82;

/// Default per-content cap on archived images.
pub const ARCHIVE_IMAGE_MAX_COUNT_DEFAULT: usize = 9;

/// Media download timeout.
pub const MEDIA_DOWNLOAD_TIMEOUT_SECS: u64 = 60;

// ── Settings cache ─────────────────────────────────────────────────────────

/// Memoized settings reads expire after this many seconds.
pub const SETTINGS_CACHE_TTL_SECS: u64 = 30;

// ── Batch endpoint limits (enforced strictly) ──────────────────────────────

pub const BATCH_UPDATE_LIMIT: usize = 100;
pub const BATCH_DELETE_LIMIT: usize = 100;
pub const BATCH_REPARSE_LIMIT: usize = 20;

// ── Bot chat sync ──────────────────────────────────────────────────────────

/// Emit `bot_sync_progress` every this many upserted chats.
pub const SYNC_PROGRESS_EVERY: usize = 25;

// ── Exit codes ─────────────────────────────────────────────────────────────

pub const EXIT_FATAL_CONFIG: i32 = 1;
pub const EXIT_STORAGE_UNREACHABLE: i32 = 2;
pub const EXIT_DB_MIGRATION: i32 = 3;
