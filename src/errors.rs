//! Error taxonomy for the acquisition pipeline.
//!
//! Device and buffer errors are fatal: the loop cannot safely continue once
//! the DMA stream has desynchronized, so the process cleans up and exits.
//! Persistence I/O errors stay `std::io::Error` and never reach this enum;
//! the writer worker logs and skips them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaqError {
    /// Digitizer open/start/stop/status failure.
    #[error("digitizer fatal error: {0}")]
    Device(String),
    /// DMA wait exceeded the hardware timeout.
    #[error("DMA wait timed out after {0} ms")]
    Timeout(u64),
    /// Acquisition buffer allocation or geometry violation.
    #[error("acquisition buffer error: {0}")]
    Buffer(String),
    /// Rejected at startup, before the realtime loop begins.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DaqError>;
