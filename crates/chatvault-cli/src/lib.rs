//! Orchestration layer and CLI wiring for chatvault.
//!
//! The [`orchestrator::Orchestrator`] is the one entry point UIs and the
//! mobile bridge consume: it owns the catalog, the credential pool, both
//! engines, the control registry, and the optional notifier, and threads
//! them together explicitly — no process-wide singletons.

pub mod config;
pub mod orchestrator;

pub use config::Config;
pub use orchestrator::{DownloadStart, Orchestrator, UploadRequest};
