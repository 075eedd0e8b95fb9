// Shared types used across the courier crates: error kinds, completion
// handles, and service registration records.
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod future;

pub use future::{Future, Promise};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    // Message text is rendered by the caller so it can name the method
    // signature when one is resolvable.
    #[error("{0}")]
    NetworkSend(String),
    #[error("network timeout")]
    NetworkTimeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("can't find service id: {0}")]
    ServiceUnknown(u32),
    #[error("unknown method id: {0}")]
    MethodUnknown(u32),
    #[error("there is already a pending request with id {0}")]
    DuplicateRequestId(u32),
    #[error("no subscription for link id {0}")]
    SubscriptionNotFound(u32),
    #[error("listen rejected: {0}")]
    ListenRejected(String),
    #[error("not configured: {0}")]
    NotConfigured(&'static str),
    #[error("worker pool is closed")]
    PoolClosed,
    #[error("remote error ({signature})")]
    Remote { signature: String, details: Bytes },
    #[error("completion dropped without resolution")]
    Broken,
}

impl Error {
    /// Human-readable detail text: the details buffer for remote faults,
    /// the display form otherwise.
    pub fn detail_text(&self) -> String {
        match self {
            Error::Remote { details, .. } => String::from_utf8_lossy(details).into_owned(),
            other => other.to_string(),
        }
    }
}

/// Registration record handed to the service directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub service_id: u32,
    pub process_id: u32,
    pub machine_id: String,
    pub endpoints: Vec<String>,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>, machine_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_id: 0,
            process_id: std::process::id(),
            machine_id: machine_id.into(),
            endpoints: Vec::new(),
        }
    }
}
