//! STM32 UART system-bootloader client
//!
//! The factory bootloader speaks a byte-oriented protocol over 8E1 framing:
//! every command byte travels with its one's complement, variable-length
//! blocks carry a trailing XOR checksum, and each phase is acknowledged
//! individually. `Bootloader` is a scoped session: it forces even parity on
//! entry and restores the previous setting when dropped.

mod protocol;
mod types;
pub mod wire;

pub use protocol::{Bootloader, MAX_BLOCK_SIZE};
pub use types::{ChipInfo, Command, Version, ACK, NACK, SYNC_BYTE};
pub use wire::WirePort;
