//! ferry library
//!
//! Pushes a single file over TCP. The receiver skips content it already
//! holds (by digest) and only exposes a file under its final name once the
//! declared size has fully arrived.

pub mod checksum;
pub mod cli;
pub mod config;
pub mod error;
pub mod log;
pub mod logger;
pub mod net_async;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod url;

pub use error::{Result, TransferError};
pub use protocol_core::{TransferOutcome, TransferReport, TransferRequest};
