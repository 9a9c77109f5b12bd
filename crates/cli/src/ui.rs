//! Terminal rendering helpers
//!
//! All user-facing output funnels through here. The orchestrator and the
//! background reader hand over data; nothing in this module talks to the
//! port or the protocol.

use std::time::Instant;

use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use serialport::{SerialPortInfo, SerialPortType};

use crate::bootloader::{ChipInfo, Command};
use crate::serial::SerialSession;

fn timestamp_prefix(enabled: bool) -> String {
    if enabled {
        format!("[{}] ", Local::now().format("%H:%M:%S%.3f"))
    } else {
        String::new()
    }
}

/// A line received from the port.
pub fn rx_line(line: &str, timestamp: bool) {
    println!("{}{}", timestamp_prefix(timestamp), line);
}

/// Echo of data just sent to the port.
pub fn tx_line(text: &str, timestamp: bool) {
    println!("{}TX: {}", timestamp_prefix(timestamp), text);
}

pub fn success(msg: &str) {
    println!("+ {msg}");
}

pub fn note(msg: &str) {
    println!("! {msg}");
}

pub fn error(msg: &str) {
    eprintln!("x {msg}");
}

pub fn banner() {
    println!();
    println!("================================================");
    println!("  stmcli - serial terminal + STM32 flasher");
    println!("================================================");
    println!("Type /help for commands, /list to scan ports");
    println!();
}

pub fn clear_screen() {
    print!("\x1B[2J\x1B[H");
    banner();
}

/// Wiring and BOOT0 guide for entering the factory bootloader.
pub fn bootloader_guide() {
    println!();
    println!("-- STM32 bootloader mode ------------------------");
    println!("  1. Pull BOOT0 high (3.3V); BOOT1 low if present");
    println!("  2. Reset or power-cycle the chip");
    println!("  3. /connect PORT 115200, then /chipinfo");
    println!();
    println!("  Wiring: MCU TX (PA9/PA2) -> adapter RX");
    println!("          MCU RX (PA10/PA3) -> adapter TX, GND -> GND");
    println!("  The bootloader uses even parity; the session switches");
    println!("  automatically and restores your terminal settings after.");
    println!();
}

pub fn port_list(ports: &[SerialPortInfo]) {
    if ports.is_empty() {
        note("no serial ports found");
        return;
    }
    println!();
    println!("-- Available serial ports -----------------------");
    for (i, port) in ports.iter().enumerate() {
        let kind = match &port.port_type {
            SerialPortType::UsbPort(usb) => usb
                .product
                .clone()
                .unwrap_or_else(|| "USB serial device".into()),
            SerialPortType::BluetoothPort => "Bluetooth".into(),
            SerialPortType::PciPort => "PCI".into(),
            SerialPortType::Unknown => String::new(),
        };
        println!("  {}. {:<16} {}", i + 1, port.port_name, kind);
    }
    println!();
}

pub fn stats_panel(session: &SerialSession) {
    let (rx, tx) = session.stats();
    println!();
    println!("-- Connection statistics ------------------------");
    match session.port_status() {
        Some((name, baud)) => println!("  status:     connected to {name} @ {baud} baud"),
        None => println!("  status:     not connected"),
    }
    println!("  rx:         {} ({})", rx, format_bytes(rx));
    println!("  tx:         {} ({})", tx, format_bytes(tx));
    println!(
        "  timestamp:  {}   hex: {}   newline: {}",
        on_off(session.timestamp_enabled()),
        on_off(session.hex_enabled()),
        if session.newline_enabled() { "CRLF" } else { "raw" },
    );
    println!();
}

pub fn chip_panel(info: &ChipInfo) {
    println!();
    println!("-- Chip information -----------------------------");
    println!("  chip id:    0x{:04X}", info.chip_id);
    println!("  name:       {}", info.name);
    println!("  bootloader: {}", info.version);
    println!(
        "  ext erase:  {}",
        if info.extended_erase { "yes" } else { "no" }
    );
    let known: Vec<&str> = info
        .commands
        .iter()
        .filter_map(|&c| Command::mnemonic(c))
        .collect();
    println!("  commands:   {}", known.join(", "));
    println!();
}

fn on_off(v: bool) -> &'static str {
    if v {
        "on"
    } else {
        "off"
    }
}

pub fn format_bytes(n: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if n < KB {
        format!("{n} B")
    } else if n < MB {
        format!("{:.2} KB", n as f64 / KB as f64)
    } else if n < GB {
        format!("{:.2} MB", n as f64 / MB as f64)
    } else {
        format!("{:.2} GB", n as f64 / GB as f64)
    }
}

/// 16-byte rows: address, hex column, printable-ASCII gutter.
pub fn format_hex_dump(address: u32, data: &[u8]) -> String {
    let mut out = String::new();
    for (i, row) in data.chunks(16).enumerate() {
        let hex: Vec<String> = row.iter().map(|b| format!("{b:02X}")).collect();
        let ascii: String = row
            .iter()
            .map(|&b| {
                if (0x20..0x7F).contains(&b) {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        out.push_str(&format!(
            "{:08X}  {:<47}  |{}|\n",
            address.wrapping_add((i * 16) as u32),
            hex.join(" "),
            ascii
        ));
    }
    out
}

/// Renders orchestrator progress callbacks as a transfer bar; a new phase
/// (fresh start instant) gets a fresh bar.
pub struct ProgressRenderer {
    bar: Option<(ProgressBar, Instant)>,
}

impl ProgressRenderer {
    pub fn new() -> Self {
        Self { bar: None }
    }

    pub fn update(&mut self, current: u64, total: u64, start: Instant) {
        let stale = match &self.bar {
            Some((_, s)) => *s != start,
            None => true,
        };
        if stale {
            if let Some((bar, _)) = self.bar.take() {
                bar.finish_and_clear();
            }
            self.bar = Some((transfer_bar(total), start));
        }
        if let Some((bar, _)) = &self.bar {
            bar.set_position(current);
        }
    }

    pub fn finish(&mut self) {
        if let Some((bar, _)) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

impl Default for ProgressRenderer {
    fn default() -> Self {
        Self::new()
    }
}

fn transfer_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template(
            "  {wide_bar:.green} {percent:>3}% ({bytes}/{total_bytes}) {bytes_per_sec} ETA {eta}",
        )
        .expect("valid progress template")
        .progress_chars("━╸ "),
    );
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_hex_dump_rows() {
        let data: Vec<u8> = (0..18).collect();
        let dump = format_hex_dump(0x0800_0000, &data);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("08000000  00 01 02"));
        assert!(lines[1].starts_with("08000010  10 11"));
    }

    #[test]
    fn test_hex_dump_ascii_gutter() {
        let dump = format_hex_dump(0, b"Hi\x00!");
        assert!(dump.contains("|Hi.!|"));
    }
}
