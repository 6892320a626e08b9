//! Serial port abstraction.
//!
//! The protocol driver only needs a byte pipe with exact-length reads and
//! writes plus a DTR line, so it is written against the [`Port`] trait and
//! never touches a concrete serial implementation. Native platforms use
//! [`native::NativePort`] over the `serialport` crate; tests drive the
//! driver with an in-memory mock.
//!
//! The bootloader wire format is fixed at 8 data bits, **even parity**,
//! 1 stop bit, no flow control, raw mode. Only the baud rate and device
//! path vary, which is all [`SerialConfig`] exposes.

pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// Baud rates the bootloader link supports.
pub const SUPPORTED_BAUD_RATES: &[u32] = &[
    1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600, 115_200, 230_400,
];

/// Default read timeout; a frame that stalls longer than this is treated as
/// a failed exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Serial link configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate; must be one of [`SUPPORTED_BAUD_RATES`].
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Create a configuration with the default timeout.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reject baud rates the bootloader wiring cannot carry.
    pub fn validate(&self) -> Result<()> {
        if SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            Ok(())
        } else {
            Err(Error::UnsupportedBaudRate(self.baud_rate))
        }
    }
}

/// Byte-level serial transport consumed by the protocol driver.
pub trait Port: Read + Write + Send {
    /// Set the DTR (Data Terminal Ready) line state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Discard any pending input/output bytes.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Read exactly `buf.len()` bytes; a short read (timeout) is an error.
    fn read_exact_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_exact(buf)?;
        Ok(())
    }

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.write_all(buf)?;
        self.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_timeout() {
        let config = SerialConfig::new("/dev/ttyUSB0", 115_200);
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.baud_rate, 115_200);
    }

    #[test]
    fn test_config_builder() {
        let config = SerialConfig::new("COM3", 57600).with_timeout(Duration::from_secs(2));
        assert_eq!(config.port_name, "COM3");
        assert_eq!(config.timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_validate_accepts_supported_rates() {
        for &baud in SUPPORTED_BAUD_RATES {
            assert!(SerialConfig::new("/dev/ttyUSB0", baud).validate().is_ok());
        }
    }

    #[test]
    fn test_validate_rejects_unsupported_rates() {
        let err = SerialConfig::new("/dev/ttyUSB0", 921_600)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedBaudRate(921_600)));
    }
}
