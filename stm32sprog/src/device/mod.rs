//! STM32 device model: product-ID table and per-device Flash parameters.
//!
//! GET_ID returns a 16-bit product id that selects the Flash layout. The
//! table below covers the STM32F1/L1 families the UART bootloader ships on;
//! an id outside the table is reported as unsupported rather than guessed.

use std::time::Duration;

use crate::protocol::CommandSet;

/// Base address of on-chip Flash on every supported part.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Flash geometry for one product id.
#[derive(Debug, Clone, Copy)]
pub struct FlashLayout {
    /// Product id as returned by GET_ID.
    pub product_id: u16,
    /// Human-readable family name.
    pub name: &'static str,
    /// One past the last Flash byte address.
    pub flash_end: u32,
    /// Smallest erasable unit in bytes.
    pub page_size: u32,
    /// Pages grouped into one protection sector.
    pub pages_per_sector: u32,
}

/// Known product ids and their Flash geometry.
pub const KNOWN_DEVICES: &[FlashLayout] = &[
    FlashLayout {
        product_id: 0x0412,
        name: "low-density",
        flash_end: 0x0800_8000,
        page_size: 1024,
        pages_per_sector: 4,
    },
    FlashLayout {
        product_id: 0x0410,
        name: "medium-density",
        flash_end: 0x0802_0000,
        page_size: 1024,
        pages_per_sector: 4,
    },
    FlashLayout {
        product_id: 0x0414,
        name: "high-density",
        flash_end: 0x0808_0000,
        page_size: 2048,
        pages_per_sector: 2,
    },
    FlashLayout {
        product_id: 0x0418,
        name: "connectivity line",
        flash_end: 0x0804_0000,
        page_size: 2048,
        pages_per_sector: 2,
    },
    FlashLayout {
        product_id: 0x0420,
        name: "medium-density value line",
        flash_end: 0x0802_0000,
        page_size: 1024,
        pages_per_sector: 4,
    },
    FlashLayout {
        product_id: 0x0428,
        name: "high-density value line",
        flash_end: 0x0808_0000,
        page_size: 2048,
        pages_per_sector: 2,
    },
    FlashLayout {
        product_id: 0x0430,
        name: "XL-density",
        flash_end: 0x0810_0000,
        page_size: 2048,
        pages_per_sector: 2,
    },
    FlashLayout {
        product_id: 0x0436,
        name: "medium-density ultra-low-power",
        flash_end: 0x0806_0000,
        page_size: 256,
        pages_per_sector: 16,
    },
    FlashLayout {
        product_id: 0x0416,
        name: "high-density ultra-low-power",
        flash_end: 0x0802_0000,
        page_size: 256,
        pages_per_sector: 16,
    },
];

/// Look up the Flash layout for a product id.
#[must_use]
pub fn layout_for(product_id: u16) -> Option<&'static FlashLayout> {
    KNOWN_DEVICES
        .iter()
        .find(|layout| layout.product_id == product_id)
}

/// Everything discovery learns about the connected bootloader.
///
/// Immutable once [`identify`](crate::flasher::Programmer::identify)
/// resolves it; the defaults below only matter until GET_ID succeeds.
#[derive(Debug, Clone)]
pub struct DeviceParameters {
    /// Bootloader version, major.minor packed in the high and low nibbles.
    pub bootloader_version: u8,
    /// Commands the bootloader advertised.
    pub commands: CommandSet,
    /// First Flash byte address.
    pub flash_begin: u32,
    /// One past the last Flash byte address.
    pub flash_end: u32,
    /// Smallest erasable unit in bytes.
    pub page_size: u32,
    /// Pages grouped into one protection sector.
    pub pages_per_sector: u32,
    /// Host-side pause after an acknowledged erase.
    pub erase_delay: Duration,
    /// Host-side pause after each acknowledged write block.
    pub write_delay: Duration,
}

impl Default for DeviceParameters {
    fn default() -> Self {
        Self {
            bootloader_version: 0,
            commands: CommandSet::new(),
            flash_begin: FLASH_BASE,
            flash_end: 0x0800_8000,
            page_size: 1024,
            pages_per_sector: 4,
            erase_delay: Duration::from_millis(40),
            write_delay: Duration::from_millis(80),
        }
    }
}

impl DeviceParameters {
    /// Bootloader version as (major, minor).
    #[must_use]
    pub fn version(&self) -> (u8, u8) {
        (self.bootloader_version >> 4, self.bootloader_version & 0x0F)
    }

    /// Total number of Flash pages.
    #[must_use]
    pub fn page_count(&self) -> u32 {
        (self.flash_end - self.flash_begin) / self.page_size
    }

    /// Overwrite the Flash geometry with a product's layout.
    pub fn apply_layout(&mut self, layout: &FlashLayout) {
        self.flash_end = layout.flash_end;
        self.page_size = layout.page_size;
        self.pages_per_sector = layout.pages_per_sector;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_for_known_ids() {
        let med = layout_for(0x0410).unwrap();
        assert_eq!(med.flash_end, 0x0802_0000);
        assert_eq!(med.page_size, 1024);
        assert_eq!(med.pages_per_sector, 4);

        let xl = layout_for(0x0430).unwrap();
        assert_eq!(xl.flash_end, 0x0810_0000);
        assert_eq!(xl.page_size, 2048);

        let ulp = layout_for(0x0436).unwrap();
        assert_eq!(ulp.page_size, 256);
        assert_eq!(ulp.pages_per_sector, 16);
    }

    #[test]
    fn test_layout_for_unknown_id() {
        assert!(layout_for(0x0440).is_none());
        assert!(layout_for(0x0000).is_none());
    }

    #[test]
    fn test_default_parameters() {
        let params = DeviceParameters::default();
        assert_eq!(params.flash_begin, 0x0800_0000);
        assert_eq!(params.flash_end, 0x0800_8000);
        assert_eq!(params.page_size, 1024);
        assert_eq!(params.page_count(), 32);
        assert_eq!(params.erase_delay, Duration::from_millis(40));
        assert_eq!(params.write_delay, Duration::from_millis(80));
    }

    #[test]
    fn test_version_nibbles() {
        let params = DeviceParameters {
            bootloader_version: 0x34,
            ..Default::default()
        };
        assert_eq!(params.version(), (3, 4));
    }

    #[test]
    fn test_apply_layout() {
        let mut params = DeviceParameters::default();
        params.apply_layout(layout_for(0x0414).unwrap());
        assert_eq!(params.flash_end, 0x0808_0000);
        assert_eq!(params.page_size, 2048);
        assert_eq!(params.page_count(), 256);
    }
}
