//! Durable session record.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the store remembers about a session.
///
/// Serialized with camelCase keys and RFC 3339 timestamps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// Provider-assigned session key. Immutable.
    pub session_key: String,
    /// Identity allowed to access the session.
    pub owner_id: String,
    /// Working directory the provider isolates the session in.
    pub working_context: PathBuf,
    /// Human-readable label.
    pub display_name: String,
    /// When the session was first created.
    pub created_at: DateTime<Utc>,
    /// Last metadata write. Strictly increases per key.
    pub updated_at: DateTime<Utc>,
}

impl SessionMetadata {
    /// Whether `owner_id` may access this session.
    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id == owner_id
    }
}

/// `Session <first 8 chars of key>`.
pub fn default_display_name(session_key: &str) -> String {
    let prefix: String = session_key.chars().take(8).collect();
    format!("Session {prefix}")
}
