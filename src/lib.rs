//! Realtime data path of an RF power-spectrum instrument: paced chunk
//! consumption from a digitizer ring buffer, double-buffered accumulation of
//! processed spectra, sigma-threshold RFI screening, and rotated, atomically
//! published output files.

pub mod accumulate;
pub mod acquire;
pub mod args;
pub mod aux;
pub mod device;
pub mod errors;
pub mod exfil;
pub mod process;
pub mod rfi;
pub mod ring;

/// Frequency-cut slots carried in every output header.
pub const MAXCUTS: usize = 10;
