//! High-level flash workflows
//!
//! Each workflow raises the pause gate, takes exclusive port access, opens a
//! bootloader scope (which forces even parity) and releases all three on
//! every exit path. Rendering is delegated: progress goes through a
//! callback, results are returned to the caller.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tracing::{info, warn};

use crate::bootloader::{Bootloader, ChipInfo, WirePort, MAX_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::firmware::{self, Segment};
use crate::serial::SerialSession;

/// User-level ceiling for one read request
pub const MAX_READ_LENGTH: usize = 4096;
/// Attempts per chunk before a transient failure becomes fatal
const MAX_CHUNK_ATTEMPTS: u32 = 3;
/// Back-off between chunk retries
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Progress callback: (bytes done, bytes total, phase start time)
pub type Progress<'a> = &'a mut dyn FnMut(u64, u64, Instant);

#[derive(Debug, Clone, Copy)]
pub struct FlashOptions {
    pub erase: bool,
    pub verify: bool,
    pub go: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            erase: true,
            verify: true,
            go: true,
        }
    }
}

/// Outcome of a flash workflow, for the caller to render.
#[derive(Debug)]
pub struct FlashReport {
    pub total: u64,
    pub segments: usize,
    pub chip: Option<ChipInfo>,
    /// Address jumped to, when the go step ran and was acknowledged
    pub jump: Option<u32>,
}

/// Discover chip id, name, bootloader version and command set.
pub fn chip_info(session: &SerialSession) -> Result<ChipInfo> {
    with_bootloader(session, |bl| {
        sync_and_enumerate(bl)?;
        bl.identify()
    })
}

/// Global flash erase.
pub fn erase(session: &SerialSession) -> Result<()> {
    with_bootloader(session, |bl| {
        sync_and_enumerate(bl)?;
        bl.erase_all()
    })
}

/// Parse a firmware file and program it.
pub fn flash(
    session: &SerialSession,
    path: &Path,
    base: Option<u32>,
    opts: FlashOptions,
    progress: Progress,
) -> Result<FlashReport> {
    let segments = firmware::load(path, base)?;
    let total: u64 = segments.iter().map(|s| s.data.len() as u64).sum();
    if total == 0 {
        return Err(Error::InvalidArgument("no data in firmware file".into()));
    }
    info!(
        file = %path.display(),
        bytes = total,
        segments = segments.len(),
        "flashing firmware"
    );

    with_bootloader(session, |bl| {
        if !bl.sync()? {
            return Err(Error::Nack("sync"));
        }

        // Discovery is best-effort here; an erase still works without it
        // because the dispatch falls back to the standard command.
        let chip = match bl.get().and_then(|_| bl.identify()) {
            Ok(chip) => Some(chip),
            Err(e) => {
                warn!("could not read chip info: {e}");
                None
            }
        };

        if opts.erase {
            bl.erase_all()?;
        }

        write_segments(bl, &segments, total, &mut *progress)?;

        if opts.verify {
            verify_segments(bl, &segments, total, &mut *progress)?;
        }

        let mut jump = None;
        if opts.go {
            if let Some(first) = segments.first() {
                match bl.go(first.address) {
                    Ok(()) => jump = Some(first.address),
                    Err(e) => warn!("GO command failed ({e}); normal on some devices"),
                }
            }
        }

        Ok(FlashReport {
            total,
            segments: segments.len(),
            chip,
            jump,
        })
    })
}

/// Compare a firmware file against flash contents. Returns bytes verified.
pub fn verify(
    session: &SerialSession,
    path: &Path,
    base: Option<u32>,
    progress: Progress,
) -> Result<u64> {
    let segments = firmware::load(path, base)?;
    let total: u64 = segments.iter().map(|s| s.data.len() as u64).sum();
    if total == 0 {
        return Err(Error::InvalidArgument("no data in firmware file".into()));
    }

    with_bootloader(session, |bl| {
        sync_and_enumerate(bl)?;
        verify_segments(bl, &segments, total, progress)?;
        Ok(total)
    })
}

/// Read `length` bytes (1-4096) from `address`.
pub fn read_memory(session: &SerialSession, address: u32, length: usize) -> Result<Vec<u8>> {
    if length == 0 || length > MAX_READ_LENGTH {
        return Err(Error::InvalidArgument(format!(
            "read length {length} out of range 1-{MAX_READ_LENGTH}"
        )));
    }

    with_bootloader(session, |bl| {
        sync_and_enumerate(bl)?;
        let mut data = Vec::with_capacity(length);
        let mut offset = 0;
        while offset < length {
            let len = MAX_BLOCK_SIZE.min(length - offset);
            data.extend_from_slice(&bl.read_memory(address + offset as u32, len)?);
            offset += len;
        }
        Ok(data)
    })
}

/// Jump to `address`. Returns whether the bootloader acknowledged; a missing
/// ACK after GO is a warning, not a failure.
pub fn go(session: &SerialSession, address: u32) -> Result<bool> {
    with_bootloader(session, |bl| {
        sync_and_enumerate(bl)?;
        match bl.go(address) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("GO command failed ({e}); normal on some devices");
                Ok(false)
            }
        }
    })
}

/// Pause the reader, take the port, open a parity scope, run `f`.
fn with_bootloader<T, F>(session: &SerialSession, f: F) -> Result<T>
where
    F: FnOnce(&mut Bootloader<'_, Box<dyn SerialPort>>) -> Result<T>,
{
    let _pause = session.pause_reader();
    let mut guard = session.acquire_port();
    let port = guard.as_mut().ok_or(Error::NotConnected)?;
    let mut bl = Bootloader::new(port)?;
    f(&mut bl)
}

fn sync_and_enumerate<P: WirePort>(bl: &mut Bootloader<'_, P>) -> Result<()> {
    if !bl.sync()? {
        return Err(Error::Nack("sync"));
    }
    bl.get()
}

fn write_segments<P: WirePort>(
    bl: &mut Bootloader<'_, P>,
    segments: &[Segment],
    total: u64,
    progress: Progress,
) -> Result<()> {
    let start = Instant::now();
    let mut written: u64 = 0;
    let mut failures: u32 = 0;

    for seg in segments {
        let mut offset = 0usize;
        while offset < seg.data.len() {
            let len = MAX_BLOCK_SIZE.min(seg.data.len() - offset);
            let address = seg.address.wrapping_add(offset as u32);
            match bl.write_memory(address, &seg.data[offset..offset + len]) {
                Ok(()) => {
                    failures = 0;
                    written += len as u64;
                    offset += len;
                    progress(written, total, start);
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_CHUNK_ATTEMPTS {
                        return Err(e);
                    }
                    warn!("write failed at 0x{address:08X}, retrying: {e}");
                    thread::sleep(RETRY_DELAY);
                }
            }
        }
    }
    Ok(())
}

fn verify_segments<P: WirePort>(
    bl: &mut Bootloader<'_, P>,
    segments: &[Segment],
    total: u64,
    progress: Progress,
) -> Result<()> {
    let start = Instant::now();
    let mut verified: u64 = 0;
    let mut failures: u32 = 0;

    for seg in segments {
        let mut offset = 0usize;
        while offset < seg.data.len() {
            let len = MAX_BLOCK_SIZE.min(seg.data.len() - offset);
            let address = seg.address.wrapping_add(offset as u32);
            let actual = match bl.read_memory(address, len) {
                Ok(bytes) => bytes,
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_CHUNK_ATTEMPTS {
                        return Err(e);
                    }
                    warn!("read failed at 0x{address:08X}, retrying: {e}");
                    thread::sleep(RETRY_DELAY);
                    continue;
                }
            };
            failures = 0;

            let expected = &seg.data[offset..offset + len];
            for (i, (&exp, &act)) in expected.iter().zip(actual.iter()).enumerate() {
                if exp != act {
                    return Err(Error::VerificationMismatch {
                        address: address.wrapping_add(i as u32),
                        expected: exp,
                        actual: act,
                    });
                }
            }

            verified += len as u64;
            offset += len;
            progress(verified, total, start);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::wire::testing::MockPort;
    use crate::bootloader::ACK;

    fn segment(address: u32, data: &[u8]) -> Segment {
        Segment {
            address,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_write_segments_reports_progress() {
        let mut port = MockPort::new(&[ACK, ACK, ACK]);
        let mut bl = Bootloader::new(&mut port).unwrap();
        let segments = vec![segment(0x0800_0000, &[0xDE, 0xAD, 0xBE, 0xEF])];
        let mut seen = Vec::new();
        write_segments(&mut bl, &segments, 4, &mut |cur, total, _| {
            seen.push((cur, total))
        })
        .unwrap();
        assert_eq!(seen, vec![(4, 4)]);
    }

    #[test]
    fn test_write_segments_chunks_at_256_bytes() {
        // Two write transactions: 256 bytes, then 44.
        let mut port = MockPort::new(&[ACK; 6]);
        let mut bl = Bootloader::new(&mut port).unwrap();
        let segments = vec![segment(0x0800_0000, &[0xAAu8; 300])];
        let mut seen = Vec::new();
        write_segments(&mut bl, &segments, 300, &mut |cur, total, _| {
            seen.push((cur, total))
        })
        .unwrap();
        assert_eq!(seen, vec![(256, 300), (300, 300)]);
        drop(bl);
        // Second transaction writes the 44-byte tail at the right offset.
        let second_addr = 0x0800_0000u32 + 256;
        assert!(port
            .written
            .windows(4)
            .any(|w| w == second_addr.to_be_bytes()));
    }

    #[test]
    fn test_write_segments_gives_up_after_three_attempts() {
        let mut port = MockPort::new(&[]);
        let mut bl = Bootloader::new(&mut port).unwrap();
        let segments = vec![segment(0x0800_0000, &[0x01, 0x02, 0x03, 0x04])];
        let result = write_segments(&mut bl, &segments, 4, &mut |_, _, _| {});
        assert!(result.is_err());
        drop(bl);
        // Three command frames were attempted.
        let attempts = port
            .written
            .windows(2)
            .filter(|w| w[0] == 0x31 && w[1] == 0xCE)
            .count();
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_verify_mismatch_pinpoints_byte() {
        // Chip returns DE AD BE EE where EF was written.
        let mut input = vec![ACK, ACK, ACK];
        input.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEE]);
        let mut port = MockPort::new(&input);
        let mut bl = Bootloader::new(&mut port).unwrap();
        let segments = vec![segment(0x0800_1000, &[0xDE, 0xAD, 0xBE, 0xEF])];
        let err = verify_segments(&mut bl, &segments, 4, &mut |_, _, _| {}).unwrap_err();
        match err {
            Error::VerificationMismatch {
                address,
                expected,
                actual,
            } => {
                assert_eq!(address, 0x0800_1003);
                assert_eq!(expected, 0xEF);
                assert_eq!(actual, 0xEE);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_verify_success_reports_progress() {
        let mut input = vec![ACK, ACK, ACK];
        input.extend_from_slice(&[0x11, 0x22, 0x33, 0x44]);
        let mut port = MockPort::new(&input);
        let mut bl = Bootloader::new(&mut port).unwrap();
        let segments = vec![segment(0x0800_0000, &[0x11, 0x22, 0x33, 0x44])];
        let mut seen = Vec::new();
        verify_segments(&mut bl, &segments, 4, &mut |cur, total, _| {
            seen.push((cur, total))
        })
        .unwrap();
        assert_eq!(seen, vec![(4, 4)]);
    }

    #[test]
    fn test_read_memory_rejects_out_of_range_lengths() {
        let session = SerialSession::new();
        assert!(matches!(
            read_memory(&session, 0x0800_0000, 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            read_memory(&session, 0x0800_0000, MAX_READ_LENGTH + 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_workflows_require_connection() {
        let session = SerialSession::new();
        assert!(matches!(chip_info(&session), Err(Error::NotConnected)));
        assert!(matches!(erase(&session), Err(Error::NotConnected)));
        assert!(matches!(go(&session, 0), Err(Error::NotConnected)));
        // The pause gate must be released again on the error path.
        assert!(!session.is_paused());
    }
}
