//! Diagnostics for the food ordering server.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Health**: schema version, database size, order and route counts
//! - **Log retention**: prunes the daily log files written by `lib.rs`.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::db::DbState;
use crate::error::AppResult;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Number of daily log files to keep.
pub const MAX_LOG_FILES: usize = 14;

/// File name prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "server.log";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

pub fn get_about_info() -> Value {
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "profile": env!("BUILD_PROFILE"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Snapshot for `GET /api/health`.
pub fn get_health(db: &DbState) -> AppResult<Value> {
    let conn = db.lock()?;

    let schema_version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    let mut orders_by_status = Map::new();
    {
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM orders GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            orders_by_status.insert(status, json!(count));
        }
    }

    let open_routes: i64 = conn.query_row(
        "SELECT COUNT(*) FROM delivery_routes WHERE status != 'completed'",
        [],
        |row| row.get(0),
    )?;

    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

    Ok(json!({
        "status": "ok",
        "schemaVersion": schema_version,
        "dbSizeBytes": db_size,
        "ordersByStatus": orders_by_status,
        "openRoutes": open_routes,
        "about": get_about_info(),
    }))
}

// ---------------------------------------------------------------------------
// Log retention
// ---------------------------------------------------------------------------

/// Prune old log files in `log_dir`, keeping the newest `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .filter(|entry| entry.path().is_file())
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}
