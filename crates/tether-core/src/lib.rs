//! # tether-core
//!
//! Foundation types shared by every Tether crate:
//!
//! - **Connections**: [`Connection`] and [`ConnectionFactory`], the capability a
//!   provider adapter implements to open, resume, and drive a conversation
//! - **Provider events**: [`ProviderEvent`], the closed set of messages a
//!   provider turn can produce, plus the stream-json line decoder
//! - **Errors**: [`ConnectionError`] and [`DecodeError`] via `thiserror`
//! - **Retry**: [`RetryConfig`] and exponential backoff with jitter
//! - **Logging**: `tracing` subscriber bootstrap
//!
//! [`Connection`]: connection::Connection
//! [`ConnectionFactory`]: connection::ConnectionFactory
//! [`ProviderEvent`]: events::ProviderEvent
//! [`ConnectionError`]: errors::ConnectionError
//! [`DecodeError`]: errors::DecodeError
//! [`RetryConfig`]: retry::RetryConfig

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod events;
pub mod logging;
pub mod retry;

pub use connection::{ConnectRequest, Connection, ConnectionFactory, ConnectionState, ProviderEventStream};
pub use errors::{ConnectionError, DecodeError};
pub use events::{ProviderEvent, StreamLine, decode_stream_line};
pub use retry::RetryConfig;
