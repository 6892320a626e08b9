//! Native serial port implementation using the `serialport` crate.

use std::io::{Read, Write};

use log::trace;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};

use crate::error::Result;
use crate::port::{Port, SerialConfig};

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
}

impl std::fmt::Debug for NativePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativePort")
            .field("name", &self.name)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl NativePort {
    /// Open a serial port in the bootloader's 8E1 raw configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        config.validate()?;

        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(DataBits::Eight)
            .parity(Parity::Even)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()?;

        Ok(Self {
            port: Some(port),
            name: config.port_name.clone(),
        })
    }

    /// Close the port and release the device.
    ///
    /// Dropping the port has the same effect; this only makes the moment
    /// explicit. Any I/O after close fails with a not-connected error.
    pub fn close(&mut self) {
        self.port.take();
    }
}

impl Port for NativePort {
    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("Setting DTR to {level}");
        if let Some(ref mut p) = self.port {
            p.write_data_terminal_ready(level)?;
        }
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(std::io::Write::flush)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_open_rejects_bad_baud_before_touching_device() {
        let config = SerialConfig::new("/dev/ttyUSB0", 123_456);
        let err = NativePort::open(&config).unwrap_err();
        assert!(matches!(err, Error::UnsupportedBaudRate(123_456)));
    }
}
