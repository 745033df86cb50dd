//! Provider transcript inspection.
//!
//! The provider writes each conversation to
//! `<root>/<encoded working context>/<session key>.jsonl`, where the encoded
//! context is the path with `/` and `_` replaced by `-`. These checks never
//! touch the pool. Only [`TranscriptLocator::cleanup_invalid`] outside a dry
//! run changes anything on disk.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tether_settings::ProviderSettings;
use tracing::{debug, info, warn};

const TRANSCRIPT_EXTENSION: &str = "jsonl";

/// Transcripts listed in a [`StorageCheck`].
const RECENT_TRANSCRIPTS: usize = 10;

/// Directory name the provider uses for a working context.
pub fn encode_context(working_context: &Path) -> String {
    working_context.to_string_lossy().replace(['/', '_'], "-")
}

/// Whether `session_key` can name a transcript file. Separators and `..`
/// are rejected so a key never resolves outside its context directory.
pub fn is_valid_session_key(session_key: &str) -> bool {
    !session_key.is_empty()
        && !session_key.contains(['/', '\\', '\0'])
        && !session_key.contains("..")
}

/// A malformed transcript line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MalformedLine {
    /// 1-based line number.
    pub line_number: usize,
    /// Parser error.
    pub error: String,
}

/// Outcome of inspecting one transcript.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Session key inspected.
    pub session_key: String,
    /// Transcript location.
    pub path: PathBuf,
    /// The transcript exists.
    pub exists: bool,
    /// The transcript could be read.
    pub readable: bool,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Last modification.
    pub modified_at: Option<DateTime<Utc>>,
    /// Non-blank lines.
    pub total_lines: usize,
    /// Lines that parse as JSON.
    pub valid_lines: usize,
    /// Lines that do not.
    pub malformed_lines: Vec<MalformedLine>,
    /// Exists, readable, at least one valid line, no malformed lines.
    pub recoverable: bool,
    /// Why inspection stopped early.
    pub error: Option<String>,
}

impl RecoveryReport {
    fn failed(session_key: &str, path: PathBuf, error: &str) -> Self {
        Self {
            session_key: session_key.to_string(),
            path,
            exists: false,
            readable: false,
            size_bytes: 0,
            modified_at: None,
            total_lines: 0,
            valid_lines: 0,
            malformed_lines: Vec::new(),
            recoverable: false,
            error: Some(error.to_string()),
        }
    }

    fn missing(session_key: &str, path: PathBuf) -> Self {
        Self::failed(session_key, path, "transcript does not exist")
    }
}

/// One transcript on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptInfo {
    /// Session key (file stem).
    pub session_key: String,
    /// Transcript location.
    pub path: PathBuf,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Last modification.
    pub modified_at: Option<DateTime<Utc>>,
}

/// Why [`TranscriptLocator::cleanup_invalid`] flagged a transcript.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupReason {
    /// Zero bytes.
    Empty,
    /// Malformed lines, or no valid line at all.
    Malformed,
}

/// One flagged transcript.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupAction {
    /// Session key (file stem).
    pub session_key: String,
    /// Transcript location.
    pub path: PathBuf,
    /// Why it was flagged.
    pub reason: CleanupReason,
    /// Whether the file was deleted. Always `false` in a dry run.
    pub removed: bool,
}

/// Outcome of a transcript cleanup pass over one context directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptCleanupReport {
    /// Directory scanned.
    pub directory: PathBuf,
    /// Report only.
    pub dry_run: bool,
    /// Transcripts found.
    pub total_files: usize,
    /// Transcripts that passed inspection.
    pub valid_files: usize,
    /// Non-empty transcripts that failed inspection.
    pub invalid_files: usize,
    /// Zero-byte transcripts.
    pub empty_files: usize,
    /// Flagged transcripts, in listing order.
    pub actions: Vec<CleanupAction>,
    /// Unreadable files, failed deletions, or a missing directory.
    pub errors: Vec<String>,
}

impl TranscriptCleanupReport {
    /// Transcripts actually deleted.
    pub fn removed(&self) -> usize {
        self.actions.iter().filter(|a| a.removed).count()
    }
}

/// Transcript storage layout and permissions for one working context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageCheck {
    /// Transcripts root.
    pub root: PathBuf,
    /// The root is an existing directory.
    pub root_exists: bool,
    /// A file can be created in the root.
    pub root_writable: bool,
    /// Directory for the working context.
    pub context_dir: PathBuf,
    /// The context directory exists. The provider creates it on first use,
    /// so its absence is not an issue.
    pub context_dir_exists: bool,
    /// A file can be created in the context directory.
    pub context_dir_writable: bool,
    /// Transcripts in the context directory.
    pub transcript_count: usize,
    /// Most recently modified transcripts.
    pub recent: Vec<TranscriptInfo>,
    /// Problems that would stop the provider from persisting sessions.
    pub issues: Vec<String>,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
}

impl StorageCheck {
    /// No issues found.
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Locates and inspects provider transcripts under a root directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranscriptLocator {
    root: PathBuf,
}

impl TranscriptLocator {
    /// Locator rooted at `root` (normally `~/.claude/projects`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Locator for the configured transcripts root.
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        Self::new(settings.resolved_transcripts_root())
    }

    /// Transcripts root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the transcripts of `working_context`.
    pub fn context_dir(&self, working_context: &Path) -> PathBuf {
        self.root.join(encode_context(working_context))
    }

    /// Transcript path of `session_key`, or `None` if the key is not a
    /// valid file name.
    pub fn transcript_path(&self, session_key: &str, working_context: &Path) -> Option<PathBuf> {
        is_valid_session_key(session_key).then(|| {
            self.context_dir(working_context)
                .join(format!("{session_key}.{TRANSCRIPT_EXTENSION}"))
        })
    }

    /// Whether the provider has a transcript for `session_key`.
    pub async fn verify_exists(&self, session_key: &str, working_context: &Path) -> bool {
        let Some(path) = self.transcript_path(session_key, working_context) else {
            return false;
        };
        tokio::fs::try_exists(&path).await.unwrap_or(false)
    }

    /// Inspect the transcript of `session_key` line by line.
    pub async fn recover(&self, session_key: &str, working_context: &Path) -> RecoveryReport {
        let Some(path) = self.transcript_path(session_key, working_context) else {
            warn!(session_key, "refusing to inspect transcript for invalid session key");
            return RecoveryReport::failed(
                session_key,
                self.context_dir(working_context),
                "invalid session key",
            );
        };
        inspect(session_key, path).await
    }

    /// Report empty and malformed transcripts of `working_context`, deleting
    /// them unless `dry_run`.
    pub async fn cleanup_invalid(&self, working_context: &Path, dry_run: bool) -> TranscriptCleanupReport {
        let directory = self.context_dir(working_context);
        let mut report = TranscriptCleanupReport {
            directory,
            dry_run,
            total_files: 0,
            valid_files: 0,
            invalid_files: 0,
            empty_files: 0,
            actions: Vec::new(),
            errors: Vec::new(),
        };
        if !is_dir(&report.directory).await {
            report.errors.push(format!(
                "transcript directory does not exist: {}",
                report.directory.display()
            ));
            return report;
        }

        for transcript in self.list_transcripts(working_context).await {
            report.total_files += 1;
            let reason = if transcript.size_bytes == 0 {
                report.empty_files += 1;
                CleanupReason::Empty
            } else {
                let inspected = inspect(&transcript.session_key, transcript.path.clone()).await;
                if inspected.recoverable {
                    report.valid_files += 1;
                    continue;
                }
                if !inspected.readable {
                    let error = inspected.error.unwrap_or_default();
                    report.errors.push(format!("{}: {error}", transcript.path.display()));
                    continue;
                }
                report.invalid_files += 1;
                CleanupReason::Malformed
            };

            let removed = !dry_run
                && match tokio::fs::remove_file(&transcript.path).await {
                    Ok(()) => true,
                    Err(error) => {
                        warn!(path = %transcript.path.display(), %error, "failed to remove transcript");
                        report.errors.push(format!("{}: {error}", transcript.path.display()));
                        false
                    }
                };
            report.actions.push(CleanupAction {
                session_key: transcript.session_key,
                path: transcript.path,
                reason,
                removed,
            });
        }

        info!(
            directory = %report.directory.display(),
            dry_run,
            flagged = report.actions.len(),
            removed = report.removed(),
            "transcript cleanup finished"
        );
        report
    }

    /// Check that transcripts of `working_context` can be persisted, and
    /// list the most recent ones.
    pub async fn check_storage(&self, working_context: &Path) -> StorageCheck {
        let context_dir = self.context_dir(working_context);
        let root_exists = is_dir(&self.root).await;
        let root_writable = root_exists && is_writable(&self.root).await;
        let context_dir_exists = is_dir(&context_dir).await;
        let context_dir_writable = context_dir_exists && is_writable(&context_dir).await;

        let mut issues = Vec::new();
        if !root_exists {
            issues.push(format!("transcripts root does not exist: {}", self.root.display()));
        } else if !root_writable {
            issues.push(format!("transcripts root is not writable: {}", self.root.display()));
        }
        if context_dir_exists && !context_dir_writable {
            issues.push(format!(
                "transcript directory is not writable: {}",
                context_dir.display()
            ));
        }

        let mut recent = self.list_transcripts(working_context).await;
        let transcript_count = recent.len();
        recent.truncate(RECENT_TRANSCRIPTS);

        if !issues.is_empty() {
            warn!(root = %self.root.display(), issues = issues.len(), "transcript storage has issues");
        }
        StorageCheck {
            root: self.root.clone(),
            root_exists,
            root_writable,
            context_dir,
            context_dir_exists,
            context_dir_writable,
            transcript_count,
            recent,
            issues,
            checked_at: Utc::now(),
        }
    }

    /// All transcripts of `working_context`, most recently modified first.
    pub async fn list_transcripts(&self, working_context: &Path) -> Vec<TranscriptInfo> {
        let dir = self.context_dir(working_context);
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return Vec::new();
        };

        let mut transcripts = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    warn!(dir = %dir.display(), %error, "failed to read transcript directory");
                    break;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TRANSCRIPT_EXTENSION) {
                continue;
            }
            let Some(session_key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };
            let metadata = entry.metadata().await.ok();
            transcripts.push(TranscriptInfo {
                session_key,
                path,
                size_bytes: metadata.as_ref().map_or(0, std::fs::Metadata::len),
                modified_at: metadata
                    .and_then(|m| m.modified().ok())
                    .map(DateTime::<Utc>::from),
            });
        }

        transcripts.sort_by(|a, b| {
            b.modified_at
                .cmp(&a.modified_at)
                .then_with(|| a.session_key.cmp(&b.session_key))
        });
        transcripts
    }
}

/// Line-by-line inspection of the transcript at `path`.
async fn inspect(session_key: &str, path: PathBuf) -> RecoveryReport {
    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => {
            debug!(session_key, path = %path.display(), "no transcript to recover");
            return RecoveryReport::missing(session_key, path);
        }
    };

    let mut report = RecoveryReport {
        exists: true,
        size_bytes: metadata.len(),
        modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
        error: None,
        ..RecoveryReport::missing(session_key, path)
    };

    let content = match tokio::fs::read_to_string(&report.path).await {
        Ok(content) => content,
        Err(error) => {
            warn!(session_key, %error, "transcript unreadable");
            report.error = Some(error.to_string());
            return report;
        }
    };
    report.readable = true;

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        report.total_lines += 1;
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(_) => report.valid_lines += 1,
            Err(error) => report.malformed_lines.push(MalformedLine {
                line_number: index + 1,
                error: error.to_string(),
            }),
        }
    }

    report.recoverable = report.valid_lines > 0 && report.malformed_lines.is_empty();
    report
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir())
}

/// Whether a file can be created in `dir`. The test file is anonymous and
/// never outlives the call.
async fn is_writable(dir: &Path) -> bool {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || tempfile::tempfile_in(&dir).is_ok())
        .await
        .unwrap_or(false)
}
