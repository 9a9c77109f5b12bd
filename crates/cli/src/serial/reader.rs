//! Background reader: drains the port and renders terminal output
//!
//! Runs on its own OS thread for the life of the process. While the pause
//! gate is up it touches nothing; otherwise it polls the port, batches RX
//! counter updates, and flushes buffered bytes to the renderer on a newline
//! or after a short packet timeout.

use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tracing::debug;

use crate::serial::session::SerialSession;
use crate::ui;

/// Largest single read from the port
const READ_BUFFER_SIZE: usize = 16384;
/// Display buffer cap; halved when exceeded
const MAX_DISPLAY_BUFFER: usize = 32768;
/// Flush partial output after this much line silence
const PACKET_TIMEOUT: Duration = Duration::from_millis(50);
/// Back-off after the port is declared dead
const RECONNECT_DELAY: Duration = Duration::from_millis(500);
/// Consecutive I/O failures tolerated before closing the port
const MAX_CONSECUTIVE_ERRORS: u32 = 5;
/// Flush the local RX count into the shared counter this often
const COUNTER_FLUSH_BYTES: u64 = 1024;

/// Spawn the reader thread. Returns its handle so shutdown can join it.
pub fn spawn_reader(session: Arc<SerialSession>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("serial-reader".into())
        .spawn(move || reader_loop(&session))
        .expect("spawn serial reader thread")
}

fn reader_loop(session: &SerialSession) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; READ_BUFFER_SIZE];
    let mut last_rx = Instant::now();
    let mut consecutive_errors: u32 = 0;
    let mut local_rx: u64 = 0;

    while session.is_running() {
        if session.is_paused() {
            thread::sleep(Duration::from_millis(1));
            continue;
        }

        let read = match session.try_port() {
            Some(mut guard) => match guard.as_mut() {
                Some(port) => read_available(port.as_mut(), &mut chunk),
                None => {
                    drop(guard);
                    thread::sleep(Duration::from_millis(50));
                    continue;
                }
            },
            // Foreground holds the port; back off and re-check the gate.
            None => {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
        };

        match read {
            Ok(0) => {}
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                local_rx += n as u64;
                last_rx = Instant::now();
                consecutive_errors = 0;
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    debug!("closing port after repeated read failures: {e}");
                    if local_rx > 0 {
                        session.add_rx(local_rx);
                        local_rx = 0;
                    }
                    session.force_close();
                    consecutive_errors = 0;
                    thread::sleep(RECONNECT_DELAY);
                } else {
                    thread::sleep(Duration::from_millis(10));
                }
                continue;
            }
        }

        if local_rx >= COUNTER_FLUSH_BYTES {
            session.add_rx(local_rx);
            local_rx = 0;
        }

        truncate_display(&mut buffer);

        if buffer.is_empty() {
            thread::sleep(Duration::from_millis(1));
            continue;
        }

        let timed_out = last_rx.elapsed() > PACKET_TIMEOUT;
        if buffer.contains(&b'\n') || timed_out {
            flush_buffer(session, &mut buffer, timed_out);
        }
    }

    if local_rx > 0 {
        session.add_rx(local_rx);
    }
}

/// One bounded read of whatever is pending; a poll timeout is not an error.
fn read_available(port: &mut dyn SerialPort, chunk: &mut [u8]) -> std::io::Result<usize> {
    let waiting = port.bytes_to_read().map_err(std::io::Error::from)? as usize;
    if waiting == 0 {
        return Ok(0);
    }
    let n = waiting.min(chunk.len());
    match port.read(&mut chunk[..n]) {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e),
    }
}

/// Keep only the most recent half once the display buffer overflows.
fn truncate_display(buffer: &mut Vec<u8>) {
    if buffer.len() > MAX_DISPLAY_BUFFER {
        buffer.drain(..buffer.len() - MAX_DISPLAY_BUFFER / 2);
    }
}

fn flush_buffer(session: &SerialSession, buffer: &mut Vec<u8>, timed_out: bool) {
    let timestamp = session.timestamp_enabled();

    if session.hex_enabled() {
        ui::rx_line(&format_hex(buffer), timestamp);
        buffer.clear();
        return;
    }

    let text = scrub_text(buffer);
    if text.contains('\n') {
        let (lines, rest) = split_complete_lines(&text);
        for line in &lines {
            ui::rx_line(line, timestamp);
        }
        *buffer = rest.into_bytes();
    } else if timed_out {
        let partial = text.replace('\r', "");
        if !partial.is_empty() {
            ui::rx_line(&partial, timestamp);
        }
        buffer.clear();
    }
}

/// Uppercase hex pairs separated by spaces.
fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decode terminal bytes for display: non-ASCII bytes are dropped, control
/// characters other than tab, newline and carriage return are stripped.
fn scrub_text(bytes: &[u8]) -> String {
    bytes
        .iter()
        .copied()
        .filter(|b| b.is_ascii())
        .filter(|&b| !b.is_ascii_control() || matches!(b, b'\t' | b'\n' | b'\r'))
        .map(char::from)
        .collect()
}

/// Split off every complete line (carriage returns removed); the trailing
/// partial line is returned separately and stays buffered.
fn split_complete_lines(text: &str) -> (Vec<String>, String) {
    match text.rfind('\n') {
        Some(pos) => {
            let lines = text[..pos]
                .split('\n')
                .map(|line| line.replace('\r', ""))
                .collect();
            (lines, text[pos + 1..].to_string())
        }
        None => (Vec::new(), text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_drops_non_ascii_and_control() {
        let bytes = b"ok\x1B[2J\xC3\xA9\x00\tdone\r\n";
        assert_eq!(scrub_text(bytes), "ok[2J\tdone\r\n");
    }

    #[test]
    fn test_scrub_keeps_tab_newline_return() {
        assert_eq!(scrub_text(b"\t\r\n"), "\t\r\n");
    }

    #[test]
    fn test_split_complete_lines() {
        let (lines, rest) = split_complete_lines("one\r\ntwo\npart");
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(rest, "part");
    }

    #[test]
    fn test_split_without_newline_keeps_everything() {
        let (lines, rest) = split_complete_lines("partial");
        assert!(lines.is_empty());
        assert_eq!(rest, "partial");
    }

    #[test]
    fn test_split_trailing_newline_leaves_empty_rest() {
        let (lines, rest) = split_complete_lines("done\n");
        assert_eq!(lines, vec!["done".to_string()]);
        assert_eq!(rest, "");
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0xDE, 0xAD, 0x01]), "DE AD 01");
        assert_eq!(format_hex(&[]), "");
    }

    #[test]
    fn test_truncate_display_keeps_recent_half() {
        let mut buffer: Vec<u8> = (0..=255u8).cycle().take(MAX_DISPLAY_BUFFER + 1).collect();
        let expected_tail = buffer[buffer.len() - MAX_DISPLAY_BUFFER / 2..].to_vec();
        truncate_display(&mut buffer);
        assert_eq!(buffer.len(), MAX_DISPLAY_BUFFER / 2);
        assert_eq!(buffer, expected_tail);
    }

    #[test]
    fn test_truncate_display_leaves_small_buffers_alone() {
        let mut buffer = vec![1u8, 2, 3];
        truncate_display(&mut buffer);
        assert_eq!(buffer, vec![1, 2, 3]);
    }
}
