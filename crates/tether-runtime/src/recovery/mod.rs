//! Validation and recovery utilities.
//!
//! Everything here is advisory: these functions inspect transcripts, compare
//! the pool with the metadata store, and report. State changes only through
//! [`reconnect`], or through [`reconcile_orphans`] and
//! [`TranscriptLocator::cleanup_invalid`] outside a dry run.

pub mod health;
pub mod orphans;
pub mod reconnect;
pub mod transcripts;

pub use health::{HealthIssue, HealthReport, HealthStatus, HealthThresholds, health_report};
pub use orphans::{OrphanAction, OrphanReport, reconcile_orphans};
pub use reconnect::{ReconnectOutcome, ReconnectReport, reconnect};
pub use transcripts::{
    CleanupAction, CleanupReason, MalformedLine, RecoveryReport, StorageCheck,
    TranscriptCleanupReport, TranscriptInfo, TranscriptLocator, encode_context,
    is_valid_session_key,
};
