//! Stream error types

use thiserror::Error;

use super::StreamStatus;

/// Errors reported by stream operations.
///
/// Configuration errors are rejected synchronously with no side
/// effects; driver errors may be recoverable (a warning the caller can
/// retry past) or fatal (the stream should be closed and reopened).
/// Real-time code paths never construct these: saturation and
/// over/underflow are signaled through counters instead.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Neither an output nor an input parameter set was supplied.
    #[error("no stream parameters supplied for either direction")]
    NoStreamParams,

    /// A parameter set asked for fewer than one channel.
    #[error("invalid channel count: {0}")]
    InvalidChannelCount(u16),

    /// The requested sample rate is outside the usable range.
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    /// Device id outside the probed device list.
    #[error("device id {device} out of range ({count} devices probed)")]
    DeviceOutOfRange { device: usize, count: usize },

    /// The operation is not legal in the current lifecycle state.
    #[error("cannot {operation} while stream is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: StreamStatus,
    },

    /// No devices were found during probing.
    #[error("no audio devices found")]
    NoDevices,

    /// The device cannot satisfy the requested geometry or format.
    #[error("device cannot satisfy request: {0}")]
    DeviceCapability(String),

    /// Backend-level failure while probing or configuring.
    #[error("backend error: {0}")]
    Backend(String),

    /// Failed to build the driver stream.
    #[error("failed to build audio stream: {0}")]
    StreamBuild(String),

    /// Failed to start or stop the driver stream.
    #[error("failed to control audio stream: {0}")]
    StreamControl(String),
}

impl StreamError {
    /// Whether the stream should be considered unusable until
    /// reopened. Configuration and state errors are recoverable by
    /// correcting the call; driver-level failures are not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::Backend(_) | StreamError::StreamBuild(_) | StreamError::StreamControl(_)
        )
    }
}

/// Result type for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;
