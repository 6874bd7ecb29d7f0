//! Process-local transport used by the test suites and offline dry runs.
//! Stores sent documents in a map and supports scripted failures, byte
//! corruption, and a send hook for pause/cancel timing tests.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::{Credential, DeleteOutcome, Messenger, SendReceipt, Transport, TransportError};

/// Record of one successful `send_document` call.
#[derive(Debug, Clone)]
pub struct SendRecord {
    pub credential_id: String,
    pub chat_id: String,
    pub filename: String,
    pub caption: Option<String>,
    pub transport_id: String,
    pub message_id: i64,
}

type SendHook = Box<dyn Fn(u64) + Send + Sync>;

#[derive(Default)]
struct Stored {
    docs: HashMap<String, Vec<u8>>,
    messages: HashMap<i64, String>,
    sends: Vec<SendRecord>,
}

/// In-memory [`Transport`]. All state is behind mutexes so engine worker
/// threads can share one instance.
#[derive(Default)]
pub struct MemoryTransport {
    stored: Mutex<Stored>,
    next_id: AtomicU64,
    /// Errors handed out before the next successful send, in order.
    send_failures: Mutex<VecDeque<TransportError>>,
    /// Errors handed out before the next successful fetch, in order.
    fetch_failures: Mutex<VecDeque<TransportError>>,
    /// Called after each successful send with the total send count.
    on_send: Mutex<Option<SendHook>>,
    /// Called after each successful fetch with the total fetch count.
    on_fetch: Mutex<Option<SendHook>>,
    fetch_count: AtomicU64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue errors to be returned by upcoming `send_document` calls.
    pub fn fail_sends(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.send_failures.lock().unwrap().extend(errors);
    }

    /// Queue errors to be returned by upcoming `fetch_bytes` calls.
    pub fn fail_fetches(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.fetch_failures.lock().unwrap().extend(errors);
    }

    /// Install a hook fired after every successful send. Tests use this to
    /// pause or cancel a transfer at a precise point.
    pub fn on_send(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.on_send.lock().unwrap() = Some(Box::new(hook));
    }

    /// Install a hook fired after every successful fetch.
    pub fn on_fetch(&self, hook: impl Fn(u64) + Send + Sync + 'static) {
        *self.on_fetch.lock().unwrap() = Some(Box::new(hook));
    }

    /// Flip one byte of a stored document, simulating remote corruption.
    pub fn corrupt_document(&self, transport_id: &str, byte_index: usize) {
        let mut stored = self.stored.lock().unwrap();
        if let Some(doc) = stored.docs.get_mut(transport_id) {
            if let Some(byte) = doc.get_mut(byte_index) {
                *byte ^= 0xFF;
            }
        }
    }

    pub fn document(&self, transport_id: &str) -> Option<Vec<u8>> {
        self.stored.lock().unwrap().docs.get(transport_id).cloned()
    }

    pub fn sends(&self) -> Vec<SendRecord> {
        self.stored.lock().unwrap().sends.clone()
    }

    pub fn send_count(&self) -> u64 {
        self.stored.lock().unwrap().sends.len() as u64
    }

    pub fn document_count(&self) -> usize {
        self.stored.lock().unwrap().docs.len()
    }
}

impl Transport for MemoryTransport {
    fn send_document(
        &self,
        credential: &Credential,
        chat_id: &str,
        payload: &[u8],
        filename: &str,
        caption: Option<&str>,
    ) -> Result<SendReceipt, TransportError> {
        if let Some(err) = self.send_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let transport_id = format!("mem-{n}");
        let message_id = n as i64 + 1000;

        let total = {
            let mut stored = self.stored.lock().unwrap();
            stored.docs.insert(transport_id.clone(), payload.to_vec());
            stored.messages.insert(message_id, transport_id.clone());
            stored.sends.push(SendRecord {
                credential_id: credential.id().to_string(),
                chat_id: chat_id.to_string(),
                filename: filename.to_string(),
                caption: caption.map(str::to_string),
                transport_id: transport_id.clone(),
                message_id,
            });
            stored.sends.len() as u64
        };

        if let Some(hook) = self.on_send.lock().unwrap().as_ref() {
            hook(total);
        }

        Ok(SendReceipt {
            transport_id,
            message_id,
        })
    }

    fn get_file_path(
        &self,
        _credential: &Credential,
        transport_id: &str,
    ) -> Result<String, TransportError> {
        let stored = self.stored.lock().unwrap();
        if stored.docs.contains_key(transport_id) {
            Ok(format!("documents/{transport_id}"))
        } else {
            Err(TransportError::RemoteRejected(format!(
                "unknown file {transport_id}"
            )))
        }
    }

    fn fetch_bytes(
        &self,
        _credential: &Credential,
        remote_path: &str,
        out: &mut dyn Write,
    ) -> Result<u64, TransportError> {
        if let Some(err) = self.fetch_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let transport_id = remote_path.strip_prefix("documents/").unwrap_or(remote_path);
        let len = {
            let stored = self.stored.lock().unwrap();
            let doc = stored.docs.get(transport_id).ok_or_else(|| {
                TransportError::RemoteRejected(format!("unknown path {remote_path}"))
            })?;
            out.write_all(doc)
                .map_err(|e| TransportError::Network(format!("writer: {e}")))?;
            doc.len() as u64
        };
        let total = self.fetch_count.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(hook) = self.on_fetch.lock().unwrap().as_ref() {
            hook(total);
        }
        Ok(len)
    }

    fn delete_message(
        &self,
        _credential: &Credential,
        _chat_id: &str,
        message_id: i64,
    ) -> Result<DeleteOutcome, TransportError> {
        let mut stored = self.stored.lock().unwrap();
        match stored.messages.remove(&message_id) {
            Some(transport_id) => {
                stored.docs.remove(&transport_id);
                Ok(DeleteOutcome::Deleted)
            }
            None => Ok(DeleteOutcome::NotFound),
        }
    }
}

/// In-memory [`Messenger`]: inbound commands are pushed by the test, sent
/// texts are recorded for assertions.
#[derive(Default)]
pub struct MemoryMessenger {
    inbound: Mutex<VecDeque<String>>,
    outbound: Mutex<Vec<String>>,
}

impl MemoryMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_command(&self, text: impl Into<String>) {
        self.inbound.lock().unwrap().push_back(text.into());
    }

    pub fn sent(&self) -> Vec<String> {
        self.outbound.lock().unwrap().clone()
    }
}

impl Messenger for MemoryMessenger {
    fn send_message(&self, text: &str) -> Result<(), TransportError> {
        self.outbound.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn poll_commands(&self, _timeout: Duration) -> Result<Vec<String>, TransportError> {
        Ok(self.inbound.lock().unwrap().drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_fetch_round_trip() {
        let transport = MemoryTransport::new();
        let cred = Credential::new("tok");

        let receipt = transport
            .send_document(&cred, "chat", b"payload", "f.bin", Some("chunk 1/3"))
            .unwrap();
        let path = transport.get_file_path(&cred, &receipt.transport_id).unwrap();

        let mut out = Vec::new();
        let n = transport.fetch_bytes(&cred, &path, &mut out).unwrap();
        assert_eq!(n, 7);
        assert_eq!(out, b"payload");
    }

    #[test]
    fn scripted_failures_drain_in_order() {
        let transport = MemoryTransport::new();
        let cred = Credential::new("tok");
        transport.fail_sends([TransportError::Timeout, TransportError::Network("x".into())]);

        assert!(matches!(
            transport.send_document(&cred, "c", b"d", "f", None),
            Err(TransportError::Timeout)
        ));
        assert!(matches!(
            transport.send_document(&cred, "c", b"d", "f", None),
            Err(TransportError::Network(_))
        ));
        assert!(transport.send_document(&cred, "c", b"d", "f", None).is_ok());
    }

    #[test]
    fn delete_removes_document() {
        let transport = MemoryTransport::new();
        let cred = Credential::new("tok");
        let receipt = transport
            .send_document(&cred, "chat", b"payload", "f.bin", None)
            .unwrap();

        assert_eq!(
            transport
                .delete_message(&cred, "chat", receipt.message_id)
                .unwrap(),
            DeleteOutcome::Deleted
        );
        assert!(transport.get_file_path(&cred, &receipt.transport_id).is_err());
        assert_eq!(
            transport.delete_message(&cred, "chat", receipt.message_id).unwrap(),
            DeleteOutcome::NotFound
        );
    }

    #[test]
    fn corruption_flips_bytes() {
        let transport = MemoryTransport::new();
        let cred = Credential::new("tok");
        let receipt = transport
            .send_document(&cred, "chat", &[1, 2, 3], "f.bin", None)
            .unwrap();
        transport.corrupt_document(&receipt.transport_id, 1);
        assert_eq!(transport.document(&receipt.transport_id).unwrap(), vec![1, 0xFD, 3]);
    }
}
