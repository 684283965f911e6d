use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// An issued-but-unconfirmed rollback. Tokens are one-shot and live only
/// as long as the sidecar process; a restart just means previewing again.
pub struct PendingRollback {
    pub token: String,
    pub requested_at: String,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Keyed by manifest id; a newer request replaces the older token.
    pub pending_rollbacks: HashMap<String, PendingRollback>,
}

impl AppState {
    pub fn new() -> AppState {
        AppState {
            workspace: None,
            db: None,
            pending_rollbacks: HashMap::new(),
        }
    }
}
