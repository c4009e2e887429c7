//! Error taxonomy shared across the monitor pipeline.
//!
//! Each kind maps to one recovery policy (see §7 of the design spec):
//! `ConfigError` is fatal at startup, `CaptureError`/`ProcessError` are
//! recovered per-tick by publishing an error payload, `AudioError` and
//! `RecorderError` are recovered inside their owning component, and
//! `ClientError` becomes an HTTP 400.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing or invalid '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}' as JSON: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("unsupported capture backend: {0:?} (expected \"GDI\")")]
    UnsupportedBackend(String),

    #[error("requested region has zero width or height after clamping to the virtual desktop")]
    EmptyRegion,

    #[error("screen capture is not supported on this platform")]
    UnsupportedPlatform,

    #[error("platform capture call failed: {0}")]
    Platform(String),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("{0} must be > 0")]
    NonPositiveScale(&'static str),

    #[error("grid_rows and grid_cols must both be >= 1")]
    InvalidGrid,

    #[error("frame shape mismatch: expected BGRA (H, W, 4)")]
    BadFrameShape,
}

#[derive(Debug, Error, Clone)]
pub enum AudioError {
    #[error("audio device enumeration/activation failed: {0}")]
    Device(String),

    #[error("audio capture is not supported on this platform")]
    UnsupportedPlatform,

    #[error("no loopback input device available")]
    NoLoopbackInputDevice,

    #[error("capture_failed:{0}")]
    CaptureFailed(String),
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to open clip writer at '{0}'")]
    WriterOpenFailed(String),

    #[error("mp4 encoding is not supported on this platform")]
    UnsupportedPlatform,

    #[error("failed to create assets directory '{path}': {source}")]
    AssetsDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    BadRequest(String),
}
