//! Bootloader wire protocol primitives.

pub mod checksum;
pub mod command;

// Re-export common types
pub use command::{
    Command, CommandSet, ACK, MAX_BLOCK_SIZE, MAX_ERASE_PAGES, MAX_EXTENDED_ERASE_PAGES, NACK,
    SYNC,
};
