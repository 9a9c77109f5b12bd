//! Error types shared across the crate

use std::path::PathBuf;
use std::time::Duration;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("parse error at line {line}: {msg}")]
    Parse { line: usize, msg: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("timeout waiting for {what} after {}s", .after.as_secs_f32())]
    Timeout { what: &'static str, after: Duration },

    #[error("bootloader NACK during {0}")]
    Nack(&'static str),

    #[error(
        "verification mismatch at 0x{address:08X}: expected 0x{expected:02X}, got 0x{actual:02X}"
    )]
    VerificationMismatch {
        address: u32,
        expected: u8,
        actual: u8,
    },

    #[error("not connected")]
    NotConnected,
}
