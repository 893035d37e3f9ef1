// VaultStream Engine — Archive Store
// All durable state lives in one SQLite database via rusqlite.
// A single connection behind a Mutex serializes writers; WAL keeps readers
// from blocking on them in multi-process deployments.
//
// Module layout:
//   contents   — content CRUD, canonical-URL dedup, sources, review
//   rules      — distribution rules + their targets
//   bots       — bot configs, chat registry, counters
//   queue      — triplet queue rows: upsert, claim, ordering, transitions
//   pushed     — pushed-record dedup/audit rows + rate-limit window counts
//   tasks      — durable parse/distribute work queue
//   outbox     — realtime event outbox (cross-process fan-out)
//   settings   — key/value settings store

use crate::atoms::error::EngineResult;
use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

mod bots;
mod contents;
mod outbox;
mod pushed;
mod queue;
mod rules;
mod schema;
mod settings;
mod tasks;

pub use bots::{ChatUpsert, DiscoveredChat};
pub use contents::{ContentListFilter, ContentPatch, NewShare};
pub use outbox::OutboxRow;
pub use queue::{QueueListFilter, QueueStats, QueueUpsert, UpsertOutcome};
pub use rules::{RuleDraft, TargetDraft};

/// Thread-safe database wrapper.
pub struct Store {
    /// The SQLite connection, protected by a Mutex.
    /// `pub` for integration tests that need raw access.
    pub conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the engine database at `path` and initialize tables.
    pub fn open(path: &Path) -> EngineResult<Self> {
        info!("[store] Opening archive store at {:?}", path);

        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();
        conn.execute_batch("PRAGMA busy_timeout=5000;").ok();

        schema::run_migrations(&conn)?;

        Ok(Store { conn: Mutex::new(conn) })
    }

    /// In-memory store with the full schema. Used by the test suite.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();
        schema::run_migrations(&conn)?;
        Ok(Store { conn: Mutex::new(conn) })
    }
}

/// Initialise an already-open connection with the full schema.
/// Used by integration tests that create their own connections.
pub fn schema_for_testing(conn: &Connection) {
    schema::run_migrations(conn).expect("schema_for_testing: migrations failed");
}
