//! Error types for stm32sprog.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::Command;

/// Result type for stm32sprog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for stm32sprog operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the serial link (including short reads on timeout).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port open/configuration error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Baud rate outside the set the bootloader wiring supports.
    #[error("Baud rate {0} is not supported")]
    UnsupportedBaudRate(u32),

    /// The bootloader never answered the wake-up byte.
    #[error("STM32 not detected")]
    NotDetected,

    /// GET_ID missing, malformed, or the product id is not in the table.
    #[error("Device not supported: {0}")]
    UnsupportedDevice(String),

    /// A required opcode is absent from the device's advertised command set.
    #[error("Target device does not support the {0:?} command")]
    CommandUnsupported(Command),

    /// Out-of-range erase request, unaligned address, or similar caller error.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The device rejected an erase frame.
    #[error("Unable to erase flash")]
    EraseFailed,

    /// The device rejected a write frame.
    #[error("Unable to write flash at {addr:#010x}")]
    WriteFailed {
        /// Address of the rejected block.
        addr: u32,
    },

    /// Read-back during verification was rejected or did not match.
    #[error("Flash verification failed at {addr:#010x}")]
    VerifyFailed {
        /// Address of the failing block or of the first mismatching byte.
        addr: u32,
        /// Mismatching (image byte, device byte) pair when the device
        /// answered but the data differed; `None` when it NACKed.
        mismatch: Option<(u8, u8)>,
    },

    /// The device rejected the GO command.
    #[error("Unable to start firmware at {addr:#010x}")]
    GoFailed {
        /// Vector table address that was rejected.
        addr: u32,
    },

    /// Firmware file could not be opened or read.
    #[error("Error reading file \"{}\": {source}", .path.display())]
    File {
        /// Path that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}
