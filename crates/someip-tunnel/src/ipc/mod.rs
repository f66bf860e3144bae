//! IPC transport API.
//!
//! The bridge moves fixed-size [`Record`]s through a publish/subscribe
//! transport addressed by service name. Publishers keep the last
//! `history_size` records so late subscribers can catch up; each subscriber
//! buffers at most `subscriber_max_buffer_size` records and loses the oldest
//! beyond that.
//!
//! # Architecture
//!
//! - **memory**: In-process transport (tests and single-process deployments)
//! - **shm**: File-backed shared-memory transport for two processes (unix)

pub mod memory;
#[cfg(unix)]
pub mod shm;

use std::time::Duration;

use serde::Deserialize;

use crate::wire::Record;

pub const DEFAULT_HISTORY_SIZE: usize = 20;
pub const DEFAULT_SUBSCRIBER_MAX_BUFFER_SIZE: usize = 20;

/// Parameters of one publish/subscribe service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub history_size: usize,
    pub subscriber_max_buffer_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            history_size: DEFAULT_HISTORY_SIZE,
            subscriber_max_buffer_size: DEFAULT_SUBSCRIBER_MAX_BUFFER_SIZE,
        }
    }
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_history_size(mut self, history_size: usize) -> Self {
        self.history_size = history_size;
        self
    }

    pub fn with_subscriber_max_buffer_size(mut self, size: usize) -> Self {
        self.subscriber_max_buffer_size = size;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("invalid service config for '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("service '{name}' is incompatible: {reason}")]
    Incompatible { name: String, reason: String },

    #[error("send without a loaned record")]
    NothingLoaned,

    #[error("endpoint is closed")]
    Closed,

    #[error("io error on service '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl IpcError {
    pub fn io(name: &str, source: std::io::Error) -> Self {
        Self::Io {
            name: name.to_string(),
            source,
        }
    }
}

pub(crate) fn validate(config: &ServiceConfig) -> Result<(), IpcError> {
    let invalid = |reason: &str| IpcError::InvalidConfig {
        name: config.name.clone(),
        reason: reason.to_string(),
    };
    if config.name.is_empty() {
        return Err(invalid("empty service name"));
    }
    if config.name.contains('/') {
        return Err(invalid("service name must not contain '/'"));
    }
    if config.subscriber_max_buffer_size == 0 {
        return Err(invalid("subscriber buffer must hold at least one record"));
    }
    Ok(())
}

/// Creates or opens services by name.
pub trait Transport: Send + Sync {
    fn open_publisher(&self, config: &ServiceConfig) -> Result<Box<dyn Publisher>, IpcError>;

    fn open_subscriber(&self, config: &ServiceConfig) -> Result<Box<dyn Subscriber>, IpcError>;
}

pub trait Publisher: Send {
    /// Loans a zeroed record to fill in. Loaning again before [`Publisher::send`]
    /// returns the same slot.
    fn loan(&mut self) -> Result<&mut Record, IpcError>;

    /// Publishes the loaned record.
    fn send(&mut self) -> Result<(), IpcError>;
}

pub trait Subscriber: Send {
    /// Blocks until a record may be available or `timeout` elapses.
    /// Spurious wake-ups are allowed.
    fn wait(&mut self, timeout: Duration) -> Result<(), IpcError>;

    /// Takes the oldest buffered record, if any.
    fn receive(&mut self) -> Result<Option<Box<Record>>, IpcError>;
}
