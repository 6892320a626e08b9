//! STM32 bootloader programming session.
//!
//! [`Programmer`] drives one serial connection through the AN3155 command
//! sequence: wake the bootloader up, learn what it is, then erase, write,
//! verify, and start the firmware. Every command blocks until the device
//! ACKs or the exchange fails; there is no pipelining and, past the
//! handshake retry limit, no retrying.
//!
//! The programmer is generic over [`Port`], so tests run the full command
//! sequence against a scripted in-memory transport.

use std::io;
use std::thread;
use std::time::Duration;

use log::{debug, info, trace};

use crate::device::{self, DeviceParameters};
use crate::error::{Error, Result};
use crate::image::sparse::SparseImage;
use crate::port::Port;
use crate::protocol::command::{
    address_frame, erase_pages_frame, extended_erase_pages_frame, write_block_frame, ERASE_GLOBAL,
    EXTENDED_ERASE_GLOBAL,
};
use crate::protocol::{Command, ACK, MAX_BLOCK_SIZE, MAX_EXTENDED_ERASE_PAGES, NACK, SYNC};

/// How many times the wake-up byte is sent before giving up.
pub const MAX_HANDSHAKE_ATTEMPTS: usize = 10;

/// Width of each half of the DTR reset pulse.
const DTR_PULSE: Duration = Duration::from_millis(10);

/// Steps the global-erase delay is spread over for progress reporting.
const ERASE_PROGRESS_STEPS: u32 = 100;

/// Progress observer: called with (completed, total) after each unit of
/// work. Units are bytes for write/verify and steps for global erase.
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64, u64);

/// A programming session over one serial port.
///
/// Operations follow the session's life in order: [`connect`], then
/// [`identify`], then any of the erase/write/verify operations, optionally
/// ending with [`go`].
///
/// [`connect`]: Programmer::connect
/// [`identify`]: Programmer::identify
/// [`go`]: Programmer::go
pub struct Programmer<P: Port> {
    port: P,
    params: DeviceParameters,
}

impl<P: Port> Programmer<P> {
    /// Create a session over an opened port.
    ///
    /// The device parameters start at their conservative defaults and are
    /// replaced by [`identify`](Programmer::identify).
    pub fn new(port: P) -> Self {
        Self {
            port,
            params: DeviceParameters::default(),
        }
    }

    /// The device parameters as currently known.
    pub fn params(&self) -> &DeviceParameters {
        &self.params
    }

    /// Consume the session and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Wake the bootloader up with the autobaud handshake.
    ///
    /// Pulses DTR (harmless where the board is not wired for it), then
    /// sends the wake-up byte until the bootloader ACKs, up to
    /// [`MAX_HANDSHAKE_ATTEMPTS`] times. A NACK here usually means the
    /// bootloader already ran its baud detection on an earlier attempt.
    pub fn connect(&mut self) -> Result<()> {
        debug!("Pulsing DTR to reset {} into the bootloader", self.port.name());
        self.port.set_dtr(true)?;
        thread::sleep(DTR_PULSE);
        self.port.set_dtr(false)?;
        thread::sleep(DTR_PULSE);

        for attempt in 1..=MAX_HANDSHAKE_ATTEMPTS {
            self.port.write_all_bytes(&[SYNC])?;
            match self.recv_ack() {
                Ok(true) => {
                    debug!("Bootloader answered wake-up on attempt {attempt}");
                    return Ok(());
                }
                Ok(false) => {
                    trace!("Wake-up rejected (attempt {attempt}/{MAX_HANDSHAKE_ATTEMPTS})");
                }
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::TimedOut => {
                    trace!("Wake-up unanswered (attempt {attempt}/{MAX_HANDSHAKE_ATTEMPTS})");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotDetected)
    }

    /// Query GET_VERSION and GET_ID and resolve the device parameters.
    ///
    /// GET_ID is mandatory: a bootloader that does not advertise it, or
    /// reports a product id outside the device table, is unsupported.
    pub fn identify(&mut self) -> Result<&DeviceParameters> {
        let mut params = DeviceParameters::default();

        if !self.command(Command::GetVersion)? {
            return Err(Error::UnsupportedDevice("no answer to GET_VERSION".into()));
        }
        let count = self.read_u8()?;
        params.bootloader_version = self.read_u8()?;
        for _ in 0..count {
            let opcode = self.read_u8()?;
            params.commands.insert_opcode(opcode);
        }
        if !self.recv_ack()? {
            return Err(Error::UnsupportedDevice(
                "GET_VERSION reply not terminated".into(),
            ));
        }
        let (major, minor) = params.version();
        debug!("Bootloader version {major}.{minor}, {count} commands advertised");

        if !params.commands.contains(Command::GetId) {
            return Err(Error::UnsupportedDevice(
                "GET_ID command not advertised".into(),
            ));
        }
        if !self.command(Command::GetId)? {
            return Err(Error::UnsupportedDevice("no answer to GET_ID".into()));
        }
        let id_len = self.read_u8()?;
        if id_len != 1 {
            return Err(Error::UnsupportedDevice(format!(
                "unexpected product id length byte {id_len:#04x}"
            )));
        }
        let mut id_bytes = [0u8; 2];
        self.port.read_exact_bytes(&mut id_bytes)?;
        let product_id = u16::from_be_bytes(id_bytes);
        if !self.recv_ack()? {
            return Err(Error::UnsupportedDevice(
                "GET_ID reply not terminated".into(),
            ));
        }

        let layout = device::layout_for(product_id).ok_or_else(|| {
            Error::UnsupportedDevice(format!("unknown product id {product_id:#06x}"))
        })?;
        params.apply_layout(layout);
        info!(
            "Detected {} device (id {product_id:#06x}), {} KiB flash",
            layout.name,
            (params.flash_end - params.flash_begin) / 1024
        );

        self.params = params;
        Ok(&self.params)
    }

    /// Erase `count` pages starting at page index `first`.
    ///
    /// Uses the legacy ERASE command when advertised, EXTENDED_ERASE
    /// otherwise. A zero count succeeds without touching the wire; a range
    /// the selected command cannot express is rejected.
    pub fn erase_pages(&mut self, first: u16, count: u16) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let last = u32::from(first) + u32::from(count) - 1;

        if self.params.commands.contains(Command::Erase) {
            if last > 0xFF {
                return Err(Error::InvalidArgument(format!(
                    "legacy erase cannot address page {last}"
                )));
            }
            debug!("Erasing {count} pages from {first} (legacy)");
            if !self.command(Command::Erase)? {
                return Err(Error::EraseFailed);
            }
            self.port.write_all_bytes(&erase_pages_frame(first, count))?;
        } else if self.params.commands.contains(Command::ExtendedErase) {
            if count > MAX_EXTENDED_ERASE_PAGES || last > 0xFFFF {
                return Err(Error::InvalidArgument(format!(
                    "extended erase cannot address {count} pages from {first}"
                )));
            }
            debug!("Erasing {count} pages from {first} (extended)");
            if !self.command(Command::ExtendedErase)? {
                return Err(Error::EraseFailed);
            }
            self.port
                .write_all_bytes(&extended_erase_pages_frame(first, count))?;
        } else {
            return Err(Error::CommandUnsupported(Command::Erase));
        }

        if !self.recv_ack()? {
            return Err(Error::EraseFailed);
        }
        Ok(())
    }

    /// Erase the whole Flash.
    ///
    /// Tries the command's global form first. Some devices refuse it; on
    /// NACK the erase is redone page by page over the full Flash range.
    /// After an accepted global erase the device needs quiet time, which is
    /// spread over the progress callback.
    pub fn erase_all(&mut self, progress: ProgressFn<'_>) -> Result<()> {
        let cmd = if self.params.commands.contains(Command::Erase) {
            Command::Erase
        } else if self.params.commands.contains(Command::ExtendedErase) {
            Command::ExtendedErase
        } else {
            return Err(Error::CommandUnsupported(Command::Erase));
        };

        debug!("Erasing all flash via {cmd:?}");
        if !self.command(cmd)? {
            return Err(Error::EraseFailed);
        }
        match cmd {
            Command::Erase => self.port.write_all_bytes(&ERASE_GLOBAL)?,
            _ => self.port.write_all_bytes(&EXTENDED_ERASE_GLOBAL)?,
        }

        if self.recv_ack()? {
            let step = self.params.erase_delay / ERASE_PROGRESS_STEPS;
            for i in 1..=ERASE_PROGRESS_STEPS {
                thread::sleep(step);
                progress(u64::from(i), u64::from(ERASE_PROGRESS_STEPS));
            }
            Ok(())
        } else {
            // Global erase refused; erase the full range page by page.
            debug!("Global erase refused, falling back to page erase");
            let pages = u16::try_from(self.params.page_count()).map_err(|_| {
                Error::InvalidArgument(format!(
                    "{} pages cannot be erased page by page",
                    self.params.page_count()
                ))
            })?;
            self.erase_pages(0, pages)
        }
    }

    /// Erase exactly the pages the image's blocks cover.
    pub fn erase_image(&mut self, image: &SparseImage) -> Result<()> {
        let begin = u64::from(self.params.flash_begin);
        let page_size = u64::from(self.params.page_size);

        for block in image.blocks() {
            if block.offset < begin {
                return Err(Error::InvalidArgument(format!(
                    "image block at {:#010x} lies below flash base",
                    block.offset
                )));
            }
            let first = (block.offset - begin) / page_size;
            let last = (block.end() - 1 - begin) / page_size;
            let count = last - first + 1;
            let (first, count) = (
                u16::try_from(first).map_err(|_| {
                    Error::InvalidArgument(format!("image block at {:#010x} beyond flash", block.offset))
                })?,
                u16::try_from(count).map_err(|_| {
                    Error::InvalidArgument(format!("image block at {:#010x} too large", block.offset))
                })?,
            );
            self.erase_pages(first, count)?;
        }
        Ok(())
    }

    /// Write every block of the image to the device.
    ///
    /// The image is streamed in chunks of at most 256 bytes that never
    /// cross a block boundary; each chunk's absolute address must be
    /// 4-byte aligned. The device gets `write_delay` of quiet time after
    /// every acknowledged chunk.
    pub fn write_image(&mut self, image: &mut SparseImage, progress: ProgressFn<'_>) -> Result<()> {
        if !self.params.commands.contains(Command::WriteMemory) {
            return Err(Error::CommandUnsupported(Command::WriteMemory));
        }

        let total = image.total_size();
        let mut written = 0u64;
        image.rewind();
        while let Some(block) = image.read(MAX_BLOCK_SIZE) {
            let addr = block_addr(block.offset)?;
            let len = block.len() as u64;
            trace!("Writing {len} bytes at {addr:#010x}");
            if !(self.command(Command::WriteMemory)?
                && self.send_address(addr)?
                && self.send_block(block.data)?)
            {
                return Err(Error::WriteFailed { addr });
            }
            thread::sleep(self.params.write_delay);
            written += len;
            progress(written, total);
        }
        Ok(())
    }

    /// Read every image block back from the device and compare.
    ///
    /// Stops at the first rejected read or mismatching byte.
    pub fn verify_image(&mut self, image: &mut SparseImage, progress: ProgressFn<'_>) -> Result<()> {
        if !self.params.commands.contains(Command::ReadMemory) {
            return Err(Error::CommandUnsupported(Command::ReadMemory));
        }

        let total = image.total_size();
        let mut compared = 0u64;
        let mut buf = [0u8; MAX_BLOCK_SIZE];
        image.rewind();
        while let Some(block) = image.read(MAX_BLOCK_SIZE) {
            let addr = block_addr(block.offset)?;
            let buf = &mut buf[..block.len()];
            trace!("Reading back {} bytes at {addr:#010x}", block.len());

            if !self.read_block(addr, buf)? {
                return Err(Error::VerifyFailed {
                    addr,
                    mismatch: None,
                });
            }
            if let Some(i) = block.data.iter().zip(buf.iter()).position(|(a, b)| a != b) {
                return Err(Error::VerifyFailed {
                    addr: addr + i as u32,
                    mismatch: Some((block.data[i], buf[i])),
                });
            }

            compared += block.len() as u64;
            progress(compared, total);
        }
        Ok(())
    }

    /// Leave the bootloader and start user code at `addr`.
    ///
    /// After the device ACKs the address it is gone; any further traffic on
    /// the port is undefined.
    pub fn go(&mut self, addr: u32) -> Result<()> {
        debug!("Starting firmware at {addr:#010x}");
        if !(self.command(Command::Go)? && self.send_address(addr)?) {
            return Err(Error::GoFailed { addr });
        }
        Ok(())
    }

    /// Send a command frame and await the ACK.
    fn command(&mut self, cmd: Command) -> Result<bool> {
        trace!("Sending command {cmd:?}");
        self.port.write_all_bytes(&cmd.frame())?;
        self.recv_ack()
    }

    /// Send an address frame and await the ACK.
    fn send_address(&mut self, addr: u32) -> Result<bool> {
        if addr % 4 != 0 {
            return Err(Error::InvalidArgument(format!(
                "address {addr:#010x} is not 4-byte aligned"
            )));
        }
        self.port.write_all_bytes(&address_frame(addr))?;
        self.recv_ack()
    }

    /// Send one write data block frame and await the ACK.
    fn send_block(&mut self, data: &[u8]) -> Result<bool> {
        self.port.write_all_bytes(&write_block_frame(data))?;
        self.recv_ack()
    }

    /// Send `{byte, ~byte}` and await the ACK.
    fn send_checked_byte(&mut self, byte: u8) -> Result<bool> {
        self.port.write_all_bytes(&[byte, !byte])?;
        self.recv_ack()
    }

    /// READ_MEM one block into `buf`. `false` means a NACK along the way.
    fn read_block(&mut self, addr: u32, buf: &mut [u8]) -> Result<bool> {
        debug_assert!(!buf.is_empty() && buf.len() <= MAX_BLOCK_SIZE);
        if !(self.command(Command::ReadMemory)? && self.send_address(addr)?) {
            return Ok(false);
        }
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_BLOCK_SIZE
        let n = (buf.len() - 1) as u8;
        if !self.send_checked_byte(n)? {
            return Ok(false);
        }
        self.port.read_exact_bytes(buf)?;
        Ok(true)
    }

    /// Read one byte from the port.
    fn read_u8(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.port.read_exact_bytes(&mut byte)?;
        Ok(byte[0])
    }

    /// Read one byte and report whether it is the ACK.
    fn recv_ack(&mut self) -> Result<bool> {
        match self.read_u8()? {
            ACK => Ok(true),
            NACK => {
                debug!("Received NACK");
                Ok(false)
            }
            other => {
                debug!("Expected ACK, got {other:#04x}");
                Ok(false)
            }
        }
    }
}

/// Narrow an image offset to a wire address.
fn block_addr(offset: u64) -> Result<u32> {
    u32::try_from(offset)
        .map_err(|_| Error::InvalidArgument(format!("offset {offset:#x} beyond the 32-bit bus")))
}
