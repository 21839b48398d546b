//! Error types for the network server core.
//!
//! Frame-level failures (malformed, bad MIC, replay, duplicate) are expected
//! during normal operation and are logged and dropped by the pipeline.
//! Configuration and hardware failures are fatal at startup.

use thiserror::Error;

/// Represents the different error types that can occur in the server core.
#[derive(Debug, Error)]
pub enum NsError {
    /// A PHY payload or Semtech datagram could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A MAC command payload was shorter than its CID requires.
    #[error("malformed MAC command: {0}")]
    MalformedCommand(String),

    /// No device keys or session matched the frame identifiers.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The frame MIC did not verify under any candidate key.
    #[error("MIC validation failed")]
    MicValidationFailed,

    /// The received frame counter was rejected by reconciliation.
    #[error("replayed or invalid frame counter: received {received}, stored {stored}")]
    ReplayedOrInvalidFCnt { received: u32, stored: u32 },

    /// The frame was already seen within the deduplication window.
    #[error("duplicate frame: {0}")]
    DuplicateFrame(String),

    /// The backing store rejected or timed out an operation.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A bus publish did not complete.
    #[error("bus publish failed: {0}")]
    BusPublishFailed(String),

    /// The requested downlink could not be scheduled inside its window.
    #[error("timing infeasible: {0}")]
    TimingInfeasible(String),

    /// The configuration file failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The configured band mode cannot be served by the gateway hardware.
    #[error("hardware incompatible: {0}")]
    HardwareIncompatible(String),

    /// A catch-all for uncategorized internal failures.
    #[error("{0}")]
    Internal(String),
}

impl NsError {
    /// Whether the error is an expected per-frame drop (logged at
    /// debug/warn) rather than an operational failure.
    pub fn is_frame_drop(&self) -> bool {
        matches!(
            self,
            NsError::MalformedFrame(_)
                | NsError::MalformedCommand(_)
                | NsError::UnknownDevice(_)
                | NsError::MicValidationFailed
                | NsError::ReplayedOrInvalidFCnt { .. }
                | NsError::DuplicateFrame(_)
        )
    }
}
