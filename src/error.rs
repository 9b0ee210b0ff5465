//! Crate-wide error taxonomy.

use std::time::Duration;

use thiserror::Error;

use crate::container::ContainerError;
use crate::jobs::QueueError;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unauthorized(String),

    /// Session ceiling reached; the caller may retry later.
    #[error("{0}")]
    Capacity(String),

    #[error("{0}")]
    Validation(String),

    #[error("Execution timeout ({}s)", .0.as_secs())]
    Timeout(Duration),

    #[error("session store: {0}")]
    Store(#[from] StoreError),

    #[error("container runtime: {0}")]
    Container(#[from] ContainerError),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid session record: {0}")]
    Record(#[from] serde_json::Error),
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for failures of the store, container engine, database or queue.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Store(_)
                | Self::Container(_)
                | Self::Database(_)
                | Self::Queue(_)
                | Self::Io(_)
                | Self::Record(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message() {
        let err = Error::Timeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "Execution timeout (30s)");
        assert!(!err.is_infrastructure());
    }
}
