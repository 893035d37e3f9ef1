// VaultStream Engine — Filesystem Layout
//
// Single source of truth for where persisted state lives:
//   data/vaultstream.db          — engine database (+ WAL side files)
//   data/media/blobs/sha256/…    — content-addressed media archive
//   logs/                        — log files when file logging is enabled
//
// The root defaults to ./data next to the process working directory and can
// be overridden with the VAULTSTREAM_DATA_DIR environment variable (useful
// for tests and packaged deployments).

use std::path::PathBuf;

/// Resolve the data root, creating it if missing.
pub fn data_dir() -> PathBuf {
    let root = std::env::var("VAULTSTREAM_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"));
    if !root.exists() {
        std::fs::create_dir_all(&root).ok();
    }
    root
}

/// Path to the engine's SQLite database.
pub fn engine_db_path() -> PathBuf {
    data_dir().join("vaultstream.db")
}

/// Root of the local blob store.
pub fn media_dir() -> PathBuf {
    let dir = data_dir().join("media");
    if !dir.exists() {
        std::fs::create_dir_all(&dir).ok();
    }
    dir
}
