//! HTTP adapter for the messaging service's bot API. The only module that
//! knows URLs, status codes, or response bodies.

use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response, multipart};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{Credential, DeleteOutcome, Messenger, SendReceipt, Transport, TransportError};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Document sends and fetches move multi-megabyte bodies.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);

/// Control operations (getFile, deleteMessage, sendMessage) are small.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(12);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message_id: i64,
    document: Option<ApiDocument>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiDocument {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct ApiFile {
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUpdate {
    update_id: i64,
    message: Option<ApiMessage>,
}

fn request_err(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(e.to_string())
    }
}

/// Map an HTTP failure status plus parsed body into the error family.
fn status_err(status: StatusCode, description: Option<String>, retry_after: Option<u64>) -> TransportError {
    let description = description.unwrap_or_else(|| status.to_string());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Auth(description),
        StatusCode::TOO_MANY_REQUESTS => TransportError::RateLimited {
            retry_after: Duration::from_secs(retry_after.unwrap_or(5)),
        },
        StatusCode::PAYLOAD_TOO_LARGE => TransportError::TooLarge,
        s if s.is_client_error() => TransportError::RemoteRejected(description),
        _ => TransportError::Network(description),
    }
}

fn parse_response<T: serde::de::DeserializeOwned>(
    response: Response,
) -> Result<T, TransportError> {
    let status = response.status();
    let body: ApiResponse<T> = response.json().map_err(request_err)?;
    if status.is_success() && body.ok {
        body.result
            .ok_or_else(|| TransportError::RemoteRejected("empty result".into()))
    } else {
        Err(status_err(
            status,
            body.description,
            body.parameters.and_then(|p| p.retry_after),
        ))
    }
}

/// Blocking bot-API transport. Cheap to clone per engine; the inner client
/// pools connections.
pub struct BotApiTransport {
    client: Client,
    api_base: String,
}

impl BotApiTransport {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    pub fn with_api_base(api_base: impl Into<String>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(request_err)?;
        Ok(Self {
            client,
            api_base: api_base.into(),
        })
    }

    fn method_url(&self, credential: &Credential, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, credential.token(), method)
    }
}

impl Transport for BotApiTransport {
    fn send_document(
        &self,
        credential: &Credential,
        chat_id: &str,
        payload: &[u8],
        filename: &str,
        caption: Option<&str>,
    ) -> Result<SendReceipt, TransportError> {
        let part = multipart::Part::bytes(payload.to_vec()).file_name(filename.to_string());
        let mut form = multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", part);
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }

        let response = self
            .client
            .post(self.method_url(credential, "sendDocument"))
            .multipart(form)
            .timeout(TRANSFER_TIMEOUT)
            .send()
            .map_err(request_err)?;

        let message: ApiMessage = parse_response(response)?;
        let document = message
            .document
            .ok_or_else(|| TransportError::RemoteRejected("response carried no document".into()))?;
        debug!(
            credential = credential.id(),
            filename,
            transport_id = %document.file_id,
            "document sent"
        );
        Ok(SendReceipt {
            transport_id: document.file_id,
            message_id: message.message_id,
        })
    }

    fn get_file_path(
        &self,
        credential: &Credential,
        transport_id: &str,
    ) -> Result<String, TransportError> {
        let response = self
            .client
            .post(self.method_url(credential, "getFile"))
            .json(&serde_json::json!({ "file_id": transport_id }))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .map_err(request_err)?;

        let file: ApiFile = parse_response(response)?;
        file.file_path
            .ok_or_else(|| TransportError::RemoteRejected("file has no fetch path".into()))
    }

    fn fetch_bytes(
        &self,
        credential: &Credential,
        remote_path: &str,
        out: &mut dyn Write,
    ) -> Result<u64, TransportError> {
        let url = format!(
            "{}/file/bot{}/{}",
            self.api_base,
            credential.token(),
            remote_path
        );
        let mut response = self
            .client
            .get(url)
            .timeout(TRANSFER_TIMEOUT)
            .send()
            .map_err(request_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_err(status, None, None));
        }
        response
            .copy_to(out)
            .map_err(|e| TransportError::Network(format!("fetch stream: {e}")))
    }

    fn delete_message(
        &self,
        credential: &Credential,
        chat_id: &str,
        message_id: i64,
    ) -> Result<DeleteOutcome, TransportError> {
        let response = self
            .client
            .post(self.method_url(credential, "deleteMessage"))
            .json(&serde_json::json!({ "chat_id": chat_id, "message_id": message_id }))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .map_err(request_err)?;

        let status = response.status();
        let body: ApiResponse<bool> = response.json().map_err(request_err)?;
        if status.is_success() && body.ok {
            return Ok(DeleteOutcome::Deleted);
        }
        let description = body.description.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && description.contains("not found") {
            return Ok(DeleteOutcome::NotFound);
        }
        if status == StatusCode::FORBIDDEN {
            return Ok(DeleteOutcome::Forbidden);
        }
        Err(status_err(status, Some(description), None))
    }
}

/// Out-of-band messenger over the same bot API, pinned to one credential and
/// one chat. Keeps its own update cursor.
pub struct BotApiMessenger {
    client: Client,
    api_base: String,
    credential: Credential,
    chat_id: String,
    offset: Mutex<i64>,
}

impl BotApiMessenger {
    pub fn new(credential: Credential, chat_id: impl Into<String>) -> Result<Self, TransportError> {
        Self::with_api_base(DEFAULT_API_BASE, credential, chat_id)
    }

    pub fn with_api_base(
        api_base: impl Into<String>,
        credential: Credential,
        chat_id: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(request_err)?;
        Ok(Self {
            client,
            api_base: api_base.into(),
            credential,
            chat_id: chat_id.into(),
            offset: Mutex::new(0),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base,
            self.credential.token(),
            method
        )
    }
}

impl Messenger for BotApiMessenger {
    fn send_message(&self, text: &str) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&serde_json::json!({ "chat_id": self.chat_id, "text": text }))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .map_err(request_err)?;
        let _: ApiMessage = parse_response(response)?;
        Ok(())
    }

    fn poll_commands(&self, timeout: Duration) -> Result<Vec<String>, TransportError> {
        let offset = *self
            .offset
            .lock()
            .map_err(|_| TransportError::Network("offset lock poisoned".into()))?;

        let response = self
            .client
            .post(self.method_url("getUpdates"))
            .json(&serde_json::json!({
                "timeout": timeout.as_secs(),
                "offset": offset,
                "allowed_updates": ["message"],
            }))
            // long poll: the server holds the request up to `timeout`
            .timeout(timeout + Duration::from_secs(5))
            .send()
            .map_err(request_err)?;

        let updates: Vec<ApiUpdate> = parse_response(response)?;
        let mut texts = Vec::new();
        let mut max_update = offset;
        for update in updates {
            max_update = max_update.max(update.update_id + 1);
            if let Some(text) = update.message.and_then(|m| m.text) {
                texts.push(text);
            }
        }
        if max_update != offset {
            match self.offset.lock() {
                Ok(mut guard) => *guard = max_update,
                Err(_) => warn!("update cursor lock poisoned, cursor not advanced"),
            }
        }
        Ok(texts)
    }
}
