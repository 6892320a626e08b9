//! # stm32sprog
//!
//! A library for programming STM32 microcontrollers through the factory
//! UART bootloader (ST application note AN3155).
//!
//! This crate provides the pieces the `stm32sprog` command-line tool is
//! built from:
//!
//! - Bootloader protocol driver: autobaud handshake, device discovery,
//!   page/global erase, block write, read-back verify, GO
//! - Sparse firmware image model with block merging and bounded streaming
//! - Product-ID table mapping chips to their Flash geometry
//! - Serial port abstraction (native implementation via the `serialport`
//!   crate) so the driver can be exercised without hardware
//!
//! ## Example
//!
//! ```rust,no_run
//! use stm32sprog::{read_firmware, FirmwareFormat, NativePort, Programmer, SerialConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Open the serial link and wake the bootloader up
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115_200))?;
//!     let mut programmer = Programmer::new(port);
//!     programmer.connect()?;
//!     programmer.identify()?;
//!
//!     // Load a raw firmware file and place it at the Flash base
//!     let (mut image, format) = read_firmware("firmware.bin")?;
//!     if format == FirmwareFormat::Raw {
//!         image.shift(i64::from(programmer.params().flash_begin))?;
//!     }
//!
//!     // Erase the pages the image covers, then write it
//!     programmer.erase_image(&image)?;
//!     programmer.write_image(&mut image, &mut |_written, _total| {})?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod flasher;
pub mod image;
pub mod port;
pub mod protocol;

// Re-exports for convenience
pub use port::native::NativePort;
pub use {
    device::{DeviceParameters, FlashLayout, FLASH_BASE},
    error::{Error, Result},
    flasher::{Programmer, ProgressFn, MAX_HANDSHAKE_ATTEMPTS},
    image::{read_firmware, FirmwareFormat, MemBlock, SparseImage},
    port::{Port, SerialConfig, SUPPORTED_BAUD_RATES},
    protocol::{Command, CommandSet, MAX_BLOCK_SIZE},
};
