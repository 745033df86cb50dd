//! File-backed metadata store.
//!
//! ## File format
//!
//! ```json
//! { "version": 1, "sessions": { "<key>": { "sessionKey": "...", ... } } }
//! ```
//!
//! ## Write path
//!
//! 1. Clone the current map and apply the mutation to the clone
//! 2. Serialize and write it to a temp file in the same directory
//! 3. `fsync` the temp file, rename it over the durable file, `fsync` the directory
//! 4. Swap the clone in as the in-memory state
//!
//! One mutex covers the whole cycle, so concurrent mutations never interleave
//! and memory never runs ahead of disk.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::StoreError;
use crate::metadata::{SessionMetadata, default_display_name};

const FILE_VERSION: u32 = 1;

#[derive(Deserialize)]
struct StoreFile {
    version: u32,
    sessions: HashMap<String, SessionMetadata>,
}

#[derive(Serialize)]
struct StoreFileRef<'a> {
    version: u32,
    sessions: &'a HashMap<String, SessionMetadata>,
}

/// Snapshot of store size for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Number of stored sessions.
    pub total_sessions: usize,
    /// Number of distinct owners.
    pub unique_owners: usize,
    /// Size of the durable file in bytes.
    pub file_size_bytes: u64,
    /// Durable file location.
    pub path: PathBuf,
}

/// Crash-safe key → [`SessionMetadata`] store.
pub struct MetadataStore {
    path: PathBuf,
    sessions: Mutex<HashMap<String, SessionMetadata>>,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("path", &self.path)
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

impl MetadataStore {
    /// Open (or create) the store at `path`.
    ///
    /// A missing file is created empty. A file that cannot be read or does
    /// not hold a version-1 store is moved to `<file>.corrupt-<unix-ts>` and
    /// replaced by an empty store.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let sessions = match load(&path) {
            Ok(Some(sessions)) => {
                debug!(count = sessions.len(), "loaded session metadata");
                sessions
            }
            Ok(None) => {
                write_atomic(&path, &HashMap::new())?;
                info!("created empty metadata store");
                HashMap::new()
            }
            Err(reason) => {
                quarantine(&path, &reason);
                write_atomic(&path, &HashMap::new())?;
                HashMap::new()
            }
        };

        Ok(Self {
            path,
            sessions: Mutex::new(sessions),
        })
    }

    /// Durable file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace the record for `session_key`.
    ///
    /// `display_name` defaults to the existing name, then to
    /// [`default_display_name`]. `created_at` defaults to the existing value,
    /// then to now. `updated_at` always moves forward.
    #[instrument(skip(self, working_context, display_name, created_at))]
    pub fn store(
        &self,
        session_key: &str,
        owner_id: &str,
        working_context: &Path,
        display_name: Option<&str>,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<SessionMetadata, StoreError> {
        self.mutate(|sessions| {
            let previous = sessions.get(session_key);
            let now = Utc::now();
            let record = SessionMetadata {
                session_key: session_key.to_string(),
                owner_id: owner_id.to_string(),
                working_context: working_context.to_path_buf(),
                display_name: display_name
                    .map(str::to_string)
                    .or_else(|| previous.map(|p| p.display_name.clone()))
                    .unwrap_or_else(|| default_display_name(session_key)),
                created_at: created_at
                    .or_else(|| previous.map(|p| p.created_at))
                    .unwrap_or(now),
                updated_at: advance(previous.map(|p| p.updated_at), now),
            };
            let _ = sessions.insert(session_key.to_string(), record.clone());
            (record, true)
        })
    }

    /// Record for `session_key`, if any.
    pub fn get(&self, session_key: &str) -> Option<SessionMetadata> {
        self.sessions.lock().get(session_key).cloned()
    }

    /// Sessions of `owner_id`, newest `created_at` first.
    pub fn list_by_owner(&self, owner_id: &str, limit: usize, offset: usize) -> Vec<SessionMetadata> {
        let mut owned: Vec<SessionMetadata> = self
            .sessions
            .lock()
            .values()
            .filter(|m| m.is_owned_by(owner_id))
            .cloned()
            .collect();
        owned.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.session_key.cmp(&b.session_key))
        });
        owned.into_iter().skip(offset).take(limit).collect()
    }

    /// Number of sessions of `owner_id`.
    pub fn count_by_owner(&self, owner_id: &str) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|m| m.is_owned_by(owner_id))
            .count()
    }

    /// Rename a session. `None` if the key is unknown.
    #[instrument(skip(self))]
    pub fn update_display_name(
        &self,
        session_key: &str,
        display_name: &str,
    ) -> Result<Option<SessionMetadata>, StoreError> {
        self.mutate(|sessions| match sessions.get_mut(session_key) {
            Some(record) => {
                record.display_name = display_name.to_string();
                record.updated_at = advance(Some(record.updated_at), Utc::now());
                (Some(record.clone()), true)
            }
            None => (None, false),
        })
    }

    /// Remove a session. Returns whether it existed; removing an absent key
    /// succeeds without touching disk.
    #[instrument(skip(self))]
    pub fn remove(&self, session_key: &str) -> Result<bool, StoreError> {
        self.mutate(|sessions| {
            let existed = sessions.remove(session_key).is_some();
            (existed, existed)
        })
    }

    /// Drop every session created more than `max_age_days` ago.
    ///
    /// An age reaching past the representable calendar removes nothing.
    #[instrument(skip(self))]
    pub fn cleanup_older_than(&self, max_age_days: u32) -> Result<usize, StoreError> {
        let Some(cutoff) = Duration::try_days(i64::from(max_age_days))
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            debug!(max_age_days, "max age exceeds calendar range, nothing to clean up");
            return Ok(0);
        };
        let removed = self.mutate(|sessions| {
            let before = sessions.len();
            sessions.retain(|_, m| m.created_at >= cutoff);
            let removed = before - sessions.len();
            (removed, removed > 0)
        })?;
        if removed > 0 {
            info!(removed, max_age_days, "cleaned up old session metadata");
        }
        Ok(removed)
    }

    /// All stored session keys.
    pub fn keys(&self) -> HashSet<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Size and ownership counts.
    pub fn stats(&self) -> StoreStats {
        let (total_sessions, unique_owners) = {
            let sessions = self.sessions.lock();
            let owners: HashSet<&str> = sessions.values().map(|m| m.owner_id.as_str()).collect();
            (sessions.len(), owners.len())
        };
        StoreStats {
            total_sessions,
            unique_owners,
            file_size_bytes: fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
            path: self.path.clone(),
        }
    }

    /// Apply `change` to a copy of the map. When it reports a modification,
    /// persist the copy and swap it in.
    fn mutate<T, F>(&self, change: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut HashMap<String, SessionMetadata>) -> (T, bool),
    {
        let mut sessions = self.sessions.lock();
        let mut next = sessions.clone();
        let (result, modified) = change(&mut next);
        if modified {
            write_atomic(&self.path, &next)?;
            *sessions = next;
        }
        Ok(result)
    }
}

/// `now`, or one microsecond past `previous` when the clock has not moved
/// past it.
fn advance(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(prev) if now <= prev => prev + Duration::microseconds(1),
        _ => now,
    }
}

/// `Ok(None)` when the file does not exist; `Err(reason)` when it exists but
/// is unusable.
fn load(path: &Path) -> Result<Option<HashMap<String, SessionMetadata>>, String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.to_string()),
    };
    let file: StoreFile = serde_json::from_str(&content).map_err(|e| e.to_string())?;
    if file.version != FILE_VERSION {
        return Err(format!("unsupported store version {}", file.version));
    }
    Ok(Some(file.sessions))
}

fn quarantine(path: &Path, reason: &str) {
    let mut aside = path.as_os_str().to_owned();
    aside.push(format!(".corrupt-{}", Utc::now().timestamp()));
    let aside = PathBuf::from(aside);
    match fs::rename(path, &aside) {
        Ok(()) => warn!(
            reason,
            moved_to = %aside.display(),
            "metadata store corrupt, starting empty"
        ),
        Err(error) => warn!(
            reason,
            %error,
            "metadata store corrupt and could not be moved aside, starting empty"
        ),
    }
}

fn write_atomic(path: &Path, sessions: &HashMap<String, SessionMetadata>) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(&StoreFileRef {
        version: FILE_VERSION,
        sessions,
    })?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&json)?;
    tmp.as_file().sync_all()?;
    let _ = tmp.persist(path)?;

    // Commit the rename itself.
    #[cfg(unix)]
    fs::File::open(dir)?.sync_all()?;

    Ok(())
}
