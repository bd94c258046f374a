//! Error kinds shared across the pipeline.
//!
//! Every component boundary returns an explicit [`Result`]; worker threads
//! log and exit instead of unwinding across the spawn boundary.

use thiserror::Error;

/// Classification of a device fault, as reported by the USB transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// The transfer timed out.
    Timeout,
    /// The endpoint stalled (EPIPE-class fault).
    Pipe,
    /// Some other fault the transport labels as recoverable.
    Other,
    /// The device is gone or refuses to respond; no retry will help.
    Fatal,
}

/// A fault raised by a [`crate::source::ByteSource`].
#[derive(Debug, Clone, Error)]
#[error("device error ({kind:?}): {message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Timeouts, pipe stalls and "other" faults get one soft reset before
    /// the worker gives up on the device.
    pub fn is_transient(&self) -> bool {
        !matches!(self.kind, DeviceErrorKind::Fatal)
    }
}

/// Top-level error for the entropy pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// USB fault from a hardware source.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Pool or group invariant violation. Fatal to the daemon.
    #[error("pool error: {0}")]
    Pool(String),

    /// Malformed request on a control connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Mutex poisoning, thread creation failure and the like.
    #[error("resource error: {0}")]
    Resource(String),

    /// Invalid options at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Underlying OS call failure.
    #[error("system error: {0}")]
    System(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the daemon should come down rather than limp on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Pool(_) | Error::Resource(_))
    }
}
