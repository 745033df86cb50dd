//! # tether-runtime
//!
//! Live session management for Tether.
//!
//! - **Pool**: [`SessionPool`] caches one provider connection per session key,
//!   with per-key creation, validation on reuse, bounded retry, idle sweeping,
//!   and graceful shutdown
//! - **Service**: [`SessionService`] is the caller-facing contract that pairs
//!   the pool with the durable [`MetadataStore`](tether_store::MetadataStore)
//! - **Recovery**: transcript inspection, pool/store reconciliation,
//!   reconnection, and health reporting
//! - **Shutdown**: [`ShutdownCoordinator`] for cooperative cancellation of
//!   background tasks
//!
//! [`SessionPool`]: pool::SessionPool
//! [`SessionService`]: service::SessionService
//! [`ShutdownCoordinator`]: shutdown::ShutdownCoordinator

#![deny(unsafe_code)]

pub mod errors;
pub mod pool;
pub mod recovery;
pub mod service;
pub mod shutdown;

#[cfg(test)]
mod test_support;

pub use errors::{PoolError, ServiceError};
pub use pool::{PoolConfig, PoolEntryInfo, PoolStats, SessionHandle, SessionPool};
pub use service::{ChunkKind, ChunkStream, QueryResponse, SessionPage, SessionService, StreamChunk};
pub use shutdown::ShutdownCoordinator;
