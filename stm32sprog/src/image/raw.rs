//! Firmware file ingestion.
//!
//! Only RAW binaries are parsed here: the whole file becomes a single block
//! at offset 0, and the orchestrator relocates it to the device's Flash
//! base. Structured formats (Intel HEX, S-record) are expected to be
//! converted by an external tool; the image model accepts any source that
//! can produce (offset, bytes) blocks.

use std::fs;
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};
use crate::image::sparse::SparseImage;

/// How a firmware file's bytes map to target addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareFormat {
    /// Contiguous bytes with no address information; the image starts at
    /// offset 0 and must be shifted to the Flash base before programming.
    Raw,
}

/// Load a firmware file into a sparse image.
///
/// Returns the image together with the detected format so the caller knows
/// whether a relocation to the Flash base is still required.
pub fn read_firmware<P: AsRef<Path>>(path: P) -> Result<(SparseImage, FirmwareFormat)> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|source| Error::File {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("Loaded {} bytes from {}", data.len(), path.display());

    let mut image = SparseImage::new();
    image.insert(0, &data)?;
    Ok((image, FirmwareFormat::Raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_firmware_single_block_at_zero() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xAA; 300]).unwrap();

        let (mut image, format) = read_firmware(file.path()).unwrap();
        assert_eq!(format, FirmwareFormat::Raw);
        assert_eq!(image.total_size(), 300);

        image.rewind();
        let block = image.read(0).unwrap();
        assert_eq!(block.offset, 0);
        assert_eq!(block.len(), 300);
    }

    #[test]
    fn test_read_firmware_missing_file() {
        let err = read_firmware("/nonexistent/firmware.bin").unwrap_err();
        assert!(matches!(err, Error::File { .. }));
    }
}
