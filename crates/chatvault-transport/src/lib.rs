//! Narrow transport capability over the messaging service.
//!
//! The engines speak to the remote side exclusively through the [`Transport`]
//! trait; the Bot-API adapter in [`botapi`] is the only code that knows wire
//! details. [`memory`] provides a process-local implementation for tests and
//! dry runs.

pub mod botapi;
pub mod memory;
pub mod pool;

use std::io::Write;
use std::time::Duration;

use chatvault_types::VaultError;
use thiserror::Error;

pub use botapi::{BotApiMessenger, BotApiTransport};
pub use memory::{MemoryMessenger, MemoryTransport};
pub use pool::{Credential, CredentialPool};

/// Failure family for transport calls.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("operation timed out")]
    Timeout,

    #[error("credential rejected: {0}")]
    Auth(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("document too large")]
    TooLarge,

    #[error("remote rejected request: {0}")]
    RemoteRejected(String),
}

impl TransportError {
    /// Transient failures that a retry with backoff may clear.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout | Self::RateLimited { .. }
        )
    }
}

impl From<TransportError> for VaultError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Network(msg) => VaultError::Network(msg),
            TransportError::Timeout => VaultError::Timeout,
            TransportError::Auth(msg) => VaultError::Auth(msg),
            TransportError::RateLimited { retry_after } => VaultError::RateLimited { retry_after },
            TransportError::TooLarge => VaultError::RemoteRejected("document too large".into()),
            TransportError::RemoteRejected(msg) => VaultError::RemoteRejected(msg),
        }
    }
}

/// What the remote side returned for a successful document send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// The service's identifier for the stored document.
    pub transport_id: String,
    /// The message carrying the document, needed for later deletion.
    pub message_id: i64,
}

/// Outcome of a message deletion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    Forbidden,
}

/// Capability the engines use to move bytes. Implementations must be safe to
/// share across worker threads.
pub trait Transport: Send + Sync {
    /// Send one document to the channel, returning the stored-file and
    /// message identifiers.
    fn send_document(
        &self,
        credential: &Credential,
        chat_id: &str,
        payload: &[u8],
        filename: &str,
        caption: Option<&str>,
    ) -> Result<SendReceipt, TransportError>;

    /// Resolve a stored-file identifier to a fetchable remote path.
    fn get_file_path(
        &self,
        credential: &Credential,
        transport_id: &str,
    ) -> Result<String, TransportError>;

    /// Stream the bytes at `remote_path` into `out`. Returns bytes written.
    fn fetch_bytes(
        &self,
        credential: &Credential,
        remote_path: &str,
        out: &mut dyn Write,
    ) -> Result<u64, TransportError>;

    /// Delete a previously sent message. Only the sending credential can.
    fn delete_message(
        &self,
        credential: &Credential,
        chat_id: &str,
        message_id: i64,
    ) -> Result<DeleteOutcome, TransportError>;
}

/// Out-of-band messaging surface used by the notifier: plain text out,
/// inbound command polling in.
pub trait Messenger: Send + Sync {
    fn send_message(&self, text: &str) -> Result<(), TransportError>;

    /// Long-poll for inbound message texts, waiting at most `timeout`.
    fn poll_commands(&self, timeout: Duration) -> Result<Vec<String>, TransportError>;
}
