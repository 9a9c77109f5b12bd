//! Process-wide serial connection state

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, Parity, SerialPort, SerialPortInfo, StopBits};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Grace period after raising the pause flag, long enough for the reader
/// to observe it before protocol bytes hit the wire
pub const PAUSE_GRACE: Duration = Duration::from_millis(10);
/// Read timeout for terminal traffic
const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Counters {
    rx: u64,
    tx: u64,
}

/// Owner of the serial port and the display flags.
///
/// The port sits behind a mutex; the reader only ever `try_lock`s it, the
/// foreground holds it for the whole of a bootloader session. Counters have
/// their own short-lived lock.
pub struct SerialSession {
    port: Mutex<Option<Box<dyn SerialPort>>>,
    connection_lock: Mutex<()>,
    counters: Mutex<Counters>,
    reader_paused: AtomicBool,
    running: AtomicBool,
    show_timestamp: AtomicBool,
    hex_mode: AtomicBool,
    append_newline: AtomicBool,
}

impl SerialSession {
    pub fn new() -> Self {
        Self {
            port: Mutex::new(None),
            connection_lock: Mutex::new(()),
            counters: Mutex::new(Counters::default()),
            reader_paused: AtomicBool::new(false),
            running: AtomicBool::new(true),
            show_timestamp: AtomicBool::new(false),
            hex_mode: AtomicBool::new(false),
            append_newline: AtomicBool::new(true),
        }
    }

    /// Open `path` at `baud` with 8-N-1 framing and reset the counters.
    pub fn connect(&self, path: &str, baud: u32) -> Result<()> {
        if path.is_empty() {
            return Err(Error::InvalidArgument("port name cannot be empty".into()));
        }
        if baud == 0 {
            return Err(Error::InvalidArgument("baud rate must be positive".into()));
        }

        let _conn = lock(&self.connection_lock);
        let mut slot = lock(&self.port);
        if slot.is_some() {
            return Err(Error::InvalidArgument(
                "already connected; disconnect first".into(),
            ));
        }

        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .timeout(READ_TIMEOUT)
            .open()?;
        port.clear(ClearBuffer::All)?;

        *lock(&self.counters) = Counters::default();
        *slot = Some(port);
        info!(port = path, baud, "connected");
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        let _conn = lock(&self.connection_lock);
        match lock(&self.port).take() {
            Some(port) => {
                if let Err(e) = port.clear(ClearBuffer::All) {
                    debug!("could not clear buffers on disconnect: {e}");
                }
                info!("disconnected");
                Ok(())
            }
            None => Err(Error::NotConnected),
        }
    }

    /// Write terminal bytes to the port. A write failure closes the port;
    /// the next send reports `NotConnected`.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let mut slot = lock(&self.port);
        let port = slot.as_mut().ok_or(Error::NotConnected)?;
        match port.write_all(data) {
            Ok(()) => {
                lock(&self.counters).tx += data.len() as u64;
                Ok(())
            }
            Err(e) => {
                *slot = None;
                Err(e.into())
            }
        }
    }

    /// Cumulative (rx, tx) byte counts since the last connect.
    pub fn stats(&self) -> (u64, u64) {
        let counters = lock(&self.counters);
        (counters.rx, counters.tx)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.port).is_some()
    }

    /// Connected port name and baud rate, if any.
    pub fn port_status(&self) -> Option<(String, u32)> {
        lock(&self.port).as_ref().map(|p| {
            (
                p.name().unwrap_or_else(|| "?".into()),
                p.baud_rate().unwrap_or(0),
            )
        })
    }

    /// Enumerate serial devices on this machine.
    pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
        Ok(serialport::available_ports()?)
    }

    /// Port names only, for prompts and completion.
    pub fn available_ports() -> Vec<String> {
        serialport::available_ports()
            .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
            .unwrap_or_default()
    }

    /// Suspend the background reader for the lifetime of the returned guard.
    /// Sleeps the grace period so the reader has observed the flag before
    /// the caller touches the wire.
    pub fn pause_reader(&self) -> PauseGuard<'_> {
        self.reader_paused.store(true, Ordering::SeqCst);
        thread::sleep(PAUSE_GRACE);
        PauseGuard { session: self }
    }

    /// Exclusive access to the port slot for foreground protocol work.
    pub fn acquire_port(&self) -> MutexGuard<'_, Option<Box<dyn SerialPort>>> {
        lock(&self.port)
    }

    /// Non-blocking port access for the reader loop.
    pub(crate) fn try_port(&self) -> Option<MutexGuard<'_, Option<Box<dyn SerialPort>>>> {
        self.port.try_lock().ok()
    }

    pub(crate) fn add_rx(&self, n: u64) {
        lock(&self.counters).rx += n;
    }

    /// Drop the port after repeated I/O failures; the reader self-heals.
    pub(crate) fn force_close(&self) {
        lock(&self.port).take();
    }

    pub fn toggle_timestamp(&self) -> bool {
        !self.show_timestamp.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn toggle_hex(&self) -> bool {
        !self.hex_mode.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn toggle_newline(&self) -> bool {
        !self.append_newline.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn timestamp_enabled(&self) -> bool {
        self.show_timestamp.load(Ordering::SeqCst)
    }

    pub fn hex_enabled(&self) -> bool {
        self.hex_mode.load(Ordering::SeqCst)
    }

    pub fn newline_enabled(&self) -> bool {
        self.append_newline.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.reader_paused.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the reader thread to wind down.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Default for SerialSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the pause flag when the foreground leaves its protocol scope.
pub struct PauseGuard<'a> {
    session: &'a SerialSession,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.session.reader_paused.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let session = SerialSession::new();
        session.add_rx(600);
        session.add_rx(424);
        assert_eq!(session.stats(), (1024, 0));
    }

    #[test]
    fn test_send_without_port_is_not_connected() {
        let session = SerialSession::new();
        assert!(matches!(session.send(b"hello"), Err(Error::NotConnected)));
    }

    #[test]
    fn test_disconnect_without_port_is_not_connected() {
        let session = SerialSession::new();
        assert!(matches!(session.disconnect(), Err(Error::NotConnected)));
    }

    #[test]
    fn test_connect_rejects_bad_arguments() {
        let session = SerialSession::new();
        assert!(matches!(
            session.connect("", 115_200),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            session.connect("/dev/ttyUSB0", 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_pause_guard_raises_and_clears_flag() {
        let session = SerialSession::new();
        assert!(!session.is_paused());
        {
            let _guard = session.pause_reader();
            assert!(session.is_paused());
        }
        assert!(!session.is_paused());
    }

    #[test]
    fn test_toggles_flip_and_report_new_state() {
        let session = SerialSession::new();
        assert!(session.toggle_timestamp());
        assert!(session.timestamp_enabled());
        assert!(!session.toggle_timestamp());

        assert!(session.toggle_hex());
        assert!(!session.toggle_newline()); // defaults to on
    }
}
