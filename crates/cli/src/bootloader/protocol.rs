//! Protocol engine for the STM32 UART bootloader
//!
//! Wire rules: big-endian multi-byte integers, every command byte followed
//! by its one's complement, every variable-length block followed by the XOR
//! of its bytes, lengths encoded as N-1. Each phase of a command is
//! acknowledged with ACK/NACK under its own deadline.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serialport::Parity;
use tracing::{debug, warn};

use crate::bootloader::types::{ChipInfo, Command, Version, ACK, NACK, SYNC_BYTE};
use crate::bootloader::wire::WirePort;
use crate::chips;
use crate::error::{Error, Result};

/// Default per-step ACK deadline
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Sync handshake deadline
const SYNC_TIMEOUT: Duration = Duration::from_secs(2);
/// Write-completion deadline
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Standard erase deadline, also used for page-list erases
const ERASE_TIMEOUT: Duration = Duration::from_secs(60);
/// Extended mass-erase deadline
const MASS_ERASE_TIMEOUT: Duration = Duration::from_secs(120);
const WRITE_UNPROTECT_TIMEOUT: Duration = Duration::from_secs(10);
const READOUT_UNPROTECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for the data phase of a memory read
const DATA_READ_TIMEOUT: Duration = Duration::from_secs(2);
/// Port-level poll interval while a deadline loop is waiting
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Largest payload a single read or write transaction may carry
pub const MAX_BLOCK_SIZE: usize = 256;

/// Most pages a standard (one-byte-index) erase can name; 0xFF is the
/// global-erase sentinel
const MAX_STANDARD_ERASE_PAGES: usize = 255;

/// Scoped bootloader session over a serial link.
///
/// Construction forces even parity and remembers the previous setting;
/// dropping the value restores it on every exit path.
pub struct Bootloader<'a, P: WirePort> {
    port: &'a mut P,
    old_parity: Parity,
    /// Bootloader version, populated by [`Bootloader::get`]
    pub version: Option<Version>,
    /// Opcode list reported by GET
    pub commands: Vec<u8>,
    /// Whether the chip supports the two-byte-addressing erase variant
    pub extended_erase: bool,
}

impl<'a, P: WirePort> Bootloader<'a, P> {
    pub fn new(port: &'a mut P) -> Result<Self> {
        let old_parity = port.parity()?;
        port.set_parity(Parity::Even)?;
        if let Err(e) = port.set_timeout(POLL_TIMEOUT) {
            let _ = port.set_parity(old_parity);
            return Err(e);
        }
        Ok(Self {
            port,
            old_parity,
            version: None,
            commands: Vec::new(),
            extended_erase: false,
        })
    }

    /// One-time autobaud handshake. Returns `Ok(false)` when the chip does
    /// not answer with ACK — it is simply not in bootloader mode, which is
    /// not an error.
    pub fn sync(&mut self) -> Result<bool> {
        self.port.clear_buffers()?;
        self.port.write_all(&[SYNC_BYTE])?;
        self.port.flush()?;

        let deadline = Instant::now() + SYNC_TIMEOUT;
        loop {
            match self.poll_byte()? {
                Some(ACK) => return Ok(true),
                Some(NACK) => return Ok(false),
                Some(_) | None => {}
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }

    /// Enumerate the command set; records version, opcode list and
    /// extended-erase capability on the engine.
    pub fn get(&mut self) -> Result<()> {
        self.command(Command::Get, "GET")?;
        let count = self.read_byte(ACK_TIMEOUT, "GET length")? as usize;
        let version = self.read_byte(ACK_TIMEOUT, "GET version")?;
        let mut commands = vec![0u8; count];
        self.read_exact_deadline(&mut commands, ACK_TIMEOUT, "GET command list")?;
        self.wait_ack(ACK_TIMEOUT, "GET")?;

        self.extended_erase = commands.contains(&(Command::ExtendedErase as u8));
        self.version = Some(Version::from(version));
        self.commands = commands;
        debug!(
            version = %Version::from(version),
            commands = self.commands.len(),
            extended_erase = self.extended_erase,
            "enumerated bootloader"
        );
        Ok(())
    }

    /// Read the version byte; the two option bytes are discarded.
    pub fn get_version(&mut self) -> Result<Version> {
        self.command(Command::GetVersion, "GET VERSION")?;
        let version = self.read_byte(ACK_TIMEOUT, "GET VERSION data")?;
        let mut options = [0u8; 2];
        self.read_exact_deadline(&mut options, ACK_TIMEOUT, "GET VERSION options")?;
        self.wait_ack(ACK_TIMEOUT, "GET VERSION")?;
        Ok(Version::from(version))
    }

    /// Read the 12-bit product id.
    pub fn get_id(&mut self) -> Result<u16> {
        self.command(Command::GetId, "GET ID")?;
        let count = self.read_byte(ACK_TIMEOUT, "GET ID length")? as usize + 1;
        let mut raw = vec![0u8; count];
        self.read_exact_deadline(&mut raw, ACK_TIMEOUT, "GET ID data")?;
        self.wait_ack(ACK_TIMEOUT, "GET ID")?;

        let id = if raw.len() >= 2 {
            u16::from_be_bytes([raw[0], raw[1]])
        } else {
            raw[0] as u16
        };
        Ok(id)
    }

    /// Assemble [`ChipInfo`] from a prior [`Bootloader::get`] plus GET ID.
    pub fn identify(&mut self) -> Result<ChipInfo> {
        let chip_id = self.get_id()?;
        Ok(ChipInfo {
            chip_id,
            name: chips::chip_name(chip_id),
            version: self.version.unwrap_or_default(),
            commands: self.commands.clone(),
            extended_erase: self.extended_erase,
        })
    }

    /// Read `length` bytes (1-256) starting at `address`.
    pub fn read_memory(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        if length == 0 || length > MAX_BLOCK_SIZE {
            return Err(Error::InvalidArgument(format!(
                "read length {length} out of range 1-{MAX_BLOCK_SIZE}"
            )));
        }

        self.command(Command::ReadMemory, "READ MEMORY")?;
        self.send_address(address, "READ MEMORY address")?;

        let n = (length - 1) as u8;
        self.port.write_all(&[n, n ^ 0xFF])?;
        self.port.flush()?;
        self.wait_ack(ACK_TIMEOUT, "READ MEMORY length")?;

        let mut data = vec![0u8; length];
        self.read_exact_deadline(&mut data, DATA_READ_TIMEOUT, "READ MEMORY data")?;
        Ok(data)
    }

    /// Write up to 256 bytes at `address`. The payload is right-padded with
    /// 0xFF to a multiple of four bytes before transmission.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("cannot write empty data".into()));
        }
        if data.len() > MAX_BLOCK_SIZE {
            return Err(Error::InvalidArgument(format!(
                "write of {} bytes exceeds the {MAX_BLOCK_SIZE}-byte block limit",
                data.len()
            )));
        }
        if address % 4 != 0 {
            warn!("write address 0x{address:08X} is not 4-byte aligned");
        }

        self.command(Command::WriteMemory, "WRITE MEMORY")?;
        self.send_address(address, "WRITE MEMORY address")?;

        let mut padded = data.to_vec();
        while padded.len() % 4 != 0 {
            padded.push(0xFF);
        }
        let n = (padded.len() - 1) as u8;
        let checksum = padded.iter().fold(n, |acc, b| acc ^ b);

        let mut frame = Vec::with_capacity(padded.len() + 2);
        frame.push(n);
        frame.extend_from_slice(&padded);
        frame.push(checksum);
        self.port.write_all(&frame)?;
        self.port.flush()?;
        self.wait_ack(WRITE_TIMEOUT, "WRITE MEMORY data")
    }

    /// Global erase, dispatching on the enumerated command set.
    pub fn erase_all(&mut self) -> Result<()> {
        if self.extended_erase {
            self.command(Command::ExtendedErase, "EXTENDED ERASE")?;
            self.port.write_all(&[0xFF, 0xFF, 0x00])?;
            self.port.flush()?;
            self.wait_ack(MASS_ERASE_TIMEOUT, "EXTENDED ERASE")
        } else {
            self.command(Command::Erase, "ERASE")?;
            self.port.write_all(&[0xFF, 0x00])?;
            self.port.flush()?;
            self.wait_ack(ERASE_TIMEOUT, "ERASE")
        }
    }

    /// Erase specific pages, dispatching on the enumerated command set.
    pub fn erase_pages(&mut self, pages: &[u16]) -> Result<()> {
        if pages.is_empty() {
            return Err(Error::InvalidArgument("no pages to erase".into()));
        }
        if self.extended_erase {
            self.extended_erase_pages(pages)
        } else {
            self.standard_erase_pages(pages)
        }
    }

    fn standard_erase_pages(&mut self, pages: &[u16]) -> Result<()> {
        if pages.len() > MAX_STANDARD_ERASE_PAGES {
            return Err(Error::InvalidArgument(format!(
                "standard erase supports at most {MAX_STANDARD_ERASE_PAGES} pages"
            )));
        }
        if let Some(page) = pages.iter().find(|&&p| p > 0xFF) {
            return Err(Error::InvalidArgument(format!(
                "page {page} does not fit the standard erase's one-byte index"
            )));
        }

        self.command(Command::Erase, "ERASE")?;
        let mut block = Vec::with_capacity(pages.len() + 2);
        block.push((pages.len() - 1) as u8);
        block.extend(pages.iter().map(|&p| p as u8));
        let checksum = block.iter().fold(0u8, |acc, b| acc ^ b);
        block.push(checksum);
        self.port.write_all(&block)?;
        self.port.flush()?;
        self.wait_ack(ERASE_TIMEOUT, "ERASE pages")
    }

    fn extended_erase_pages(&mut self, pages: &[u16]) -> Result<()> {
        self.command(Command::ExtendedErase, "EXTENDED ERASE")?;
        let mut block = Vec::with_capacity(2 * pages.len() + 3);
        block.extend_from_slice(&((pages.len() - 1) as u16).to_be_bytes());
        for &page in pages {
            block.extend_from_slice(&page.to_be_bytes());
        }
        let checksum = block.iter().fold(0u8, |acc, b| acc ^ b);
        block.push(checksum);
        self.port.write_all(&block)?;
        self.port.flush()?;
        self.wait_ack(ERASE_TIMEOUT, "EXTENDED ERASE pages")
    }

    /// Jump to `address`. Some bootloaders never acknowledge the address
    /// phase; callers decide whether that is fatal.
    pub fn go(&mut self, address: u32) -> Result<()> {
        self.command(Command::Go, "GO")?;
        self.send_address(address, "GO address")
    }

    /// Lift write protection; the chip resets afterwards.
    pub fn write_unprotect(&mut self) -> Result<()> {
        self.command(Command::WriteUnprotect, "WRITE UNPROTECT")?;
        self.wait_ack(WRITE_UNPROTECT_TIMEOUT, "WRITE UNPROTECT")
    }

    /// Lift readout protection; the chip mass-erases and resets afterwards.
    pub fn readout_unprotect(&mut self) -> Result<()> {
        self.command(Command::ReadoutUnprotect, "READOUT UNPROTECT")?;
        self.wait_ack(READOUT_UNPROTECT_TIMEOUT, "READOUT UNPROTECT")
    }

    /// Send a command byte with its complement and consume the first ACK.
    fn command(&mut self, cmd: Command, what: &'static str) -> Result<()> {
        let opcode = cmd as u8;
        self.port.write_all(&[opcode, opcode ^ 0xFF])?;
        self.port.flush()?;
        self.wait_ack(ACK_TIMEOUT, what)
    }

    /// Send a big-endian address block with its XOR checksum and consume
    /// the ACK for it.
    fn send_address(&mut self, address: u32, what: &'static str) -> Result<()> {
        let bytes = address.to_be_bytes();
        let checksum = bytes.iter().fold(0u8, |acc, b| acc ^ b);
        let mut frame = [0u8; 5];
        frame[..4].copy_from_slice(&bytes);
        frame[4] = checksum;
        self.port.write_all(&frame)?;
        self.port.flush()?;
        self.wait_ack(ACK_TIMEOUT, what)
    }

    fn wait_ack(&mut self, timeout: Duration, what: &'static str) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.poll_byte()? {
                Some(ACK) => return Ok(()),
                Some(NACK) => return Err(Error::Nack(what)),
                Some(other) => {
                    debug!("discarding stray byte 0x{other:02X} while waiting for ACK")
                }
                None => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout { what, after: timeout });
            }
        }
    }

    fn read_byte(&mut self, timeout: Duration, what: &'static str) -> Result<u8> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(byte) = self.poll_byte()? {
                return Ok(byte);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout { what, after: timeout });
            }
        }
    }

    fn read_exact_deadline(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
        what: &'static str,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => {}
                Ok(n) => filled += n,
                Err(e) if is_poll_timeout(&e) => {}
                Err(e) => return Err(e.into()),
            }
            if filled < buf.len() && Instant::now() >= deadline {
                return Err(Error::Timeout { what, after: timeout });
            }
        }
        Ok(())
    }

    /// One poll for a single byte; `None` means nothing arrived within the
    /// port's poll timeout.
    fn poll_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8];
        match self.port.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if is_poll_timeout(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl<P: WirePort> Drop for Bootloader<'_, P> {
    fn drop(&mut self) {
        if let Err(e) = self.port.set_parity(self.old_parity) {
            warn!("failed to restore serial parity: {e}");
        }
    }
}

fn is_poll_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
    )
}
