use std::time::Duration;

use chatvault_transport::TransportError;
use chatvault_types::TransferSettings;
use tracing::{debug, warn};

/// Run a transport call with the engine's retry policy: up to
/// `max_retries_per_chunk` attempts, linear backoff between them, and the
/// server's `retry_after` hint honored when it is longer. Non-retryable
/// errors abort immediately.
pub fn with_retries<T>(
    label: &str,
    settings: &TransferSettings,
    mut call: impl FnMut() -> Result<T, TransportError>,
) -> Result<T, TransportError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match call() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < settings.max_retries_per_chunk => {
                let backoff = match &err {
                    TransportError::RateLimited { retry_after } => {
                        (*retry_after).max(settings.retry_backoff * attempt)
                    }
                    _ => settings.retry_backoff * attempt,
                };
                debug!(label, attempt, ?backoff, %err, "retrying after transient error");
                std::thread::sleep(backoff);
            }
            Err(err) => {
                if err.is_retryable() {
                    warn!(label, attempt, %err, "retries exhausted");
                }
                return Err(err);
            }
        }
    }
}
