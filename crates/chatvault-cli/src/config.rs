use std::path::PathBuf;
use std::time::Duration;

use chatvault_types::{TransferSettings, VaultError};

/// Runtime configuration, read once from the environment (after an optional
/// `.env` load) and threaded through the orchestrator explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    pub catalog_path: PathBuf,
    pub catalog_password: String,
    /// Ordered credential tokens; position 0 is the primary.
    pub credentials: Vec<String>,
    /// Destination channel within the messaging service.
    pub chat_id: String,
    pub scratch_root: PathBuf,
    pub settings: TransferSettings,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, VaultError> {
    match env_var(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            VaultError::Internal(format!("invalid value for {key}: {raw:?}"))
        }),
    }
}

impl Config {
    /// Read configuration from the environment. `CHATVAULT_PASSWORD`,
    /// `CHATVAULT_CREDENTIALS`, and `CHATVAULT_CHAT_ID` are required; the
    /// rest has defaults.
    pub fn from_env() -> Result<Self, VaultError> {
        let catalog_path = env_var("CHATVAULT_CATALOG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("chatvault.db"));
        let catalog_password = env_var("CHATVAULT_PASSWORD")
            .ok_or_else(|| VaultError::Internal("CHATVAULT_PASSWORD is not set".into()))?;
        let credentials: Vec<String> = env_var("CHATVAULT_CREDENTIALS")
            .ok_or_else(|| VaultError::Internal("CHATVAULT_CREDENTIALS is not set".into()))?
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        let chat_id = env_var("CHATVAULT_CHAT_ID")
            .ok_or_else(|| VaultError::Internal("CHATVAULT_CHAT_ID is not set".into()))?;
        let scratch_root = env_var("CHATVAULT_SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("chatvault-scratch"));

        let mut settings = TransferSettings::default();
        if let Some(chunk_size) = env_parse::<u64>("CHATVAULT_CHUNK_SIZE")? {
            settings.chunk_size = chunk_size;
        }
        if let Some(threshold) = env_parse::<u64>("CHATVAULT_CHUNK_THRESHOLD")? {
            settings.chunk_threshold = threshold;
        }
        if let Some(parallel) = env_parse::<usize>("CHATVAULT_MAX_PARALLEL_CHUNKS")? {
            settings.max_parallel_chunks = parallel;
        }
        if let Some(retries) = env_parse::<u32>("CHATVAULT_MAX_RETRIES")? {
            settings.max_retries_per_chunk = retries;
        }
        if let Some(backoff_ms) = env_parse::<u64>("CHATVAULT_RETRY_BACKOFF_MS")? {
            settings.retry_backoff = Duration::from_millis(backoff_ms);
        }

        Ok(Self {
            catalog_path,
            catalog_password,
            credentials,
            chat_id,
            scratch_root,
            settings,
        })
    }
}
