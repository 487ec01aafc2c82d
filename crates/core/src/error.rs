use std::path::PathBuf;

use thiserror::Error;

use crate::diag::Diagnostics;
use crate::platform::keys::KeyError;
use crate::types::MonitorId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is already running preset `{0}`")]
    AlreadyRunning(String),
    #[error("preset failed validation with {} error(s)", .0.errors().count())]
    Invalid(Diagnostics),
    #[error("engine is not running")]
    NotRunning,
    #[error("internal fault: {0}")]
    Internal(String),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {}: {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("invalid document {}: {source}", path.display())]
    Json { path: PathBuf, source: serde_json::Error },
    #[error("lua error in {}: {message}", path.display())]
    Lua { path: PathBuf, message: String },
    #[error("unsupported preset file {}", path.display())]
    Unsupported { path: PathBuf },
}

/// Key dispatch failure. Terminates the attempt that triggered it.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("skill has no key bound")]
    Unbound,
    #[error(transparent)]
    InvalidKey(#[from] KeyError),
    #[error("input backend failed: {0}")]
    Backend(String),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Unbound | DispatchError::InvalidKey(_) => "key_unresolved",
            DispatchError::Backend(_) => "dispatch_failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("monitor {0} not found")]
    NoSuchMonitor(MonitorId),
    #[error("capture region is empty")]
    EmptyRegion,
    #[error("capture backend failed: {0}")]
    Backend(String),
}

impl CaptureError {
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::NoSuchMonitor(_) => "capture_no_monitor",
            CaptureError::EmptyRegion => "capture_empty_region",
            CaptureError::Backend(_) => "capture_failed",
        }
    }
}
