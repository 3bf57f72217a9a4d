use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::TicketId;

/// Errors raised by a ranking builder. Never shown to readers.
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("no builder registered for contest {0}")]
    NoBuilder(String),
    #[error("inconsistent data: {0}")]
    Inconsistent(String),
    #[error("builder command: {0}")]
    Command(String),
    #[error("builder panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Engine error taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Busy/locked store; the next loop iteration retries.
    #[error("transient storage: {0}")]
    TransientStorage(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("builder: {0}")]
    Builder(#[from] BuilderError),
    #[error("ticket {0} does not own any ranking")]
    InconsistentTicket(TicketId),
    #[error("config: {0}")]
    Config(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientStorage(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::TransientStorage(_) => ErrorKind::TransientStorage,
            EngineError::Storage(_) => ErrorKind::Storage,
            EngineError::Builder(_) => ErrorKind::Builder,
            EngineError::InconsistentTicket(_) => ErrorKind::InconsistentTicket,
            EngineError::Config(_) => ErrorKind::Config,
        }
    }
}

/// Flat label for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientStorage,
    Storage,
    Builder,
    InconsistentTicket,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientStorage => "transient_storage",
            ErrorKind::Storage => "storage",
            ErrorKind::Builder => "builder",
            ErrorKind::InconsistentTicket => "inconsistent_ticket",
            ErrorKind::Config => "config",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
