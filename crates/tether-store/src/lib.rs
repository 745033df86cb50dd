//! # tether-store
//!
//! Durable session metadata for Tether.
//!
//! [`MetadataStore`] keeps one [`SessionMetadata`] record per session key in a
//! single JSON file. Every mutation rewrites the file through a temporary
//! sibling that is fsynced and atomically renamed into place, so a crash
//! leaves either the old or the new state on disk, never a torn one. The
//! in-memory view only changes after the write succeeded.
//!
//! The store outlives the in-memory session pool: it is what makes a session
//! resumable after eviction or a process restart.

#![deny(unsafe_code)]

pub mod errors;
pub mod metadata;
pub mod store;

pub use errors::StoreError;
pub use metadata::{SessionMetadata, default_display_name};
pub use store::{MetadataStore, StoreStats};
