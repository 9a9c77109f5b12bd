//! One-shot command-line surface
//!
//! With no subcommand the binary drops into the interactive shell; the
//! verbs below cover scripted use and exit non-zero on any failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::{Config, DEFAULT_BAUD};
use crate::flash::{self, FlashOptions};
use crate::serial::{spawn_reader, SerialSession};
use crate::shell::Shell;
use crate::ui;

/// Serial terminal and STM32 UART bootloader flasher
#[derive(Parser, Debug)]
#[command(name = "stmcli", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List available serial ports
    List,
    /// Flash a firmware image (.hex or .bin)
    Flash {
        /// Firmware file
        file: PathBuf,
        /// Serial port (e.g. /dev/ttyUSB0 or COM3)
        #[arg(short, long)]
        port: String,
        /// Baud rate
        #[arg(short, long, default_value_t = DEFAULT_BAUD)]
        baud: u32,
        /// Load address for raw binaries (decimal or 0x hex)
        #[arg(short, long, value_parser = parse_address)]
        address: Option<u32>,
        /// Skip the global erase before writing
        #[arg(long)]
        no_erase: bool,
        /// Skip read-back verification
        #[arg(long)]
        no_verify: bool,
        /// Jump to the image after flashing
        #[arg(long)]
        run: bool,
    },
    /// Erase all flash memory
    Erase {
        /// Serial port
        #[arg(short, long)]
        port: String,
        /// Baud rate
        #[arg(short, long, default_value_t = DEFAULT_BAUD)]
        baud: u32,
    },
    /// Jump to an address and execute
    Run {
        /// Serial port
        #[arg(short, long)]
        port: String,
        /// Baud rate
        #[arg(short, long, default_value_t = DEFAULT_BAUD)]
        baud: u32,
        /// Target address (decimal or 0x hex)
        #[arg(short, long, value_parser = parse_address, default_value = "0x08000000")]
        address: u32,
    },
    /// Read chip and bootloader identification
    Info {
        /// Serial port
        #[arg(short, long)]
        port: String,
        /// Baud rate
        #[arg(short, long, default_value_t = DEFAULT_BAUD)]
        baud: u32,
    },
}

fn parse_address(s: &str) -> Result<u32, String> {
    let trimmed = s.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|_| format!("invalid address {trimmed:?}"))
}

/// Entry point shared by all invocations: build the session, start the
/// reader, dispatch, then wind the reader down.
pub fn run(cli: Cli) -> anyhow::Result<()> {
    let session = Arc::new(SerialSession::new());
    let reader = spawn_reader(Arc::clone(&session));

    let outcome = match cli.command {
        None => Shell::new(Arc::clone(&session), Config::from_env())
            .run()
            .map_err(Into::into),
        Some(command) => run_one_shot(&session, command),
    };

    session.shutdown();
    let _ = reader.join();
    outcome
}

fn run_one_shot(session: &SerialSession, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::List => {
            let ports =
                SerialSession::list_ports().context("failed to enumerate serial ports")?;
            ui::port_list(&ports);
            Ok(())
        }

        Commands::Flash {
            file,
            port,
            baud,
            address,
            no_erase,
            no_verify,
            run,
        } => {
            session
                .connect(&port, baud)
                .with_context(|| format!("failed to open {port}"))?;

            let opts = FlashOptions {
                erase: !no_erase,
                verify: !no_verify,
                go: run,
            };
            let mut renderer = ui::ProgressRenderer::new();
            let mut on_progress =
                |current: u64, total: u64, start: Instant| renderer.update(current, total, start);
            let result = flash::flash(session, &file, address, opts, &mut on_progress);
            renderer.finish();

            let report =
                result.with_context(|| format!("failed to flash {}", file.display()))?;
            if let Some(chip) = &report.chip {
                ui::note(&format!("chip: 0x{:04X} ({})", chip.chip_id, chip.name));
            }
            ui::success(&format!(
                "flashed {} in {} segment(s)",
                ui::format_bytes(report.total),
                report.segments
            ));
            if let Some(addr) = report.jump {
                ui::success(&format!("application started at 0x{addr:08X}"));
            }
            session.disconnect()?;
            Ok(())
        }

        Commands::Erase { port, baud } => {
            session
                .connect(&port, baud)
                .with_context(|| format!("failed to open {port}"))?;
            flash::erase(session).context("erase failed")?;
            ui::success("flash memory erased");
            session.disconnect()?;
            Ok(())
        }

        Commands::Run {
            port,
            baud,
            address,
        } => {
            session
                .connect(&port, baud)
                .with_context(|| format!("failed to open {port}"))?;
            if flash::go(session, address).context("go failed")? {
                ui::success(&format!("application started at 0x{address:08X}"));
            } else {
                ui::note("jump sent without ACK; normal on some devices");
            }
            session.disconnect()?;
            Ok(())
        }

        Commands::Info { port, baud } => {
            session
                .connect(&port, baud)
                .with_context(|| format!("failed to open {port}"))?;
            let info = flash::chip_info(session).context("chip discovery failed")?;
            ui::chip_panel(&info);
            session.disconnect()?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_means_interactive() {
        let cli = Cli::try_parse_from(["stmcli"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_parse_flash_flags() {
        let cli = Cli::try_parse_from([
            "stmcli",
            "flash",
            "fw.hex",
            "--port",
            "/dev/ttyUSB0",
            "--no-erase",
            "--run",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Flash {
                file,
                port,
                baud,
                address,
                no_erase,
                no_verify,
                run,
            }) => {
                assert_eq!(file, PathBuf::from("fw.hex"));
                assert_eq!(port, "/dev/ttyUSB0");
                assert_eq!(baud, DEFAULT_BAUD);
                assert_eq!(address, None);
                assert!(no_erase);
                assert!(!no_verify);
                assert!(run);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_parse_flash_requires_port() {
        assert!(Cli::try_parse_from(["stmcli", "flash", "fw.hex"]).is_err());
    }

    #[test]
    fn test_parse_run_hex_address() {
        let cli = Cli::try_parse_from([
            "stmcli", "run", "--port", "COM3", "--address", "0x08004000",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Run { address, baud, .. }) => {
                assert_eq!(address, 0x0800_4000);
                assert_eq!(baud, DEFAULT_BAUD);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_parse_run_default_address_is_flash_start() {
        let cli = Cli::try_parse_from(["stmcli", "run", "--port", "COM3"]).unwrap();
        match cli.command {
            Some(Commands::Run { address, .. }) => {
                assert_eq!(address, crate::firmware::STM32_FLASH_START);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_parse_bad_address_rejected() {
        assert!(Cli::try_parse_from([
            "stmcli", "run", "--port", "COM3", "--address", "0xNOPE",
        ])
        .is_err());
    }
}
