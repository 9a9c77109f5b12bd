//! Interactive command shell
//!
//! Table-driven dispatch: each command is a name plus aliases, a usage line
//! and a handler; lookup is a single scan of the table. Anything not
//! starting with `/` is sent to the port as terminal traffic.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::flash::{self, FlashOptions};
use crate::serial::SerialSession;
use crate::ui;

enum Flow {
    Continue,
    Exit,
}

type Handler = fn(&Shell, &[&str]) -> Result<Flow>;

struct CommandSpec {
    name: &'static str,
    aliases: &'static [&'static str],
    usage: &'static str,
    help: &'static str,
    handler: Handler,
}

static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "help",
        aliases: &["h", "?"],
        usage: "/help",
        help: "Show this help",
        handler: cmd_help,
    },
    CommandSpec {
        name: "list",
        aliases: &["ls"],
        usage: "/list",
        help: "List available serial ports",
        handler: cmd_list,
    },
    CommandSpec {
        name: "connect",
        aliases: &["open"],
        usage: "/connect PORT [BAUD]",
        help: "Open a port (baud defaults to 115200)",
        handler: cmd_connect,
    },
    CommandSpec {
        name: "disconnect",
        aliases: &["close"],
        usage: "/disconnect",
        help: "Close the current port",
        handler: cmd_disconnect,
    },
    CommandSpec {
        name: "stats",
        aliases: &[],
        usage: "/stats",
        help: "Show connection statistics",
        handler: cmd_stats,
    },
    CommandSpec {
        name: "clear",
        aliases: &["cls"],
        usage: "/clear",
        help: "Clear the screen",
        handler: cmd_clear,
    },
    CommandSpec {
        name: "newline",
        aliases: &[],
        usage: "/newline",
        help: "Toggle appending CRLF to sent text",
        handler: cmd_newline,
    },
    CommandSpec {
        name: "timestamp",
        aliases: &["ts"],
        usage: "/timestamp",
        help: "Toggle timestamps on terminal output",
        handler: cmd_timestamp,
    },
    CommandSpec {
        name: "hex",
        aliases: &[],
        usage: "/hex",
        help: "Toggle hex display of terminal traffic",
        handler: cmd_hex,
    },
    CommandSpec {
        name: "bootloader",
        aliases: &["boot"],
        usage: "/bootloader",
        help: "Show the bootloader wiring guide",
        handler: cmd_bootloader,
    },
    CommandSpec {
        name: "chipinfo",
        aliases: &["id"],
        usage: "/chipinfo",
        help: "Read chip id and bootloader version",
        handler: cmd_chipinfo,
    },
    CommandSpec {
        name: "flash",
        aliases: &[],
        usage: "/flash FILE [ADDR]",
        help: "Flash firmware (.hex or .bin)",
        handler: cmd_flash,
    },
    CommandSpec {
        name: "verify",
        aliases: &[],
        usage: "/verify FILE [ADDR]",
        help: "Verify firmware against the chip",
        handler: cmd_verify,
    },
    CommandSpec {
        name: "erase",
        aliases: &[],
        usage: "/erase",
        help: "Erase all flash memory",
        handler: cmd_erase,
    },
    CommandSpec {
        name: "readmem",
        aliases: &["read"],
        usage: "/readmem ADDR LEN",
        help: "Read memory (LEN up to 4096 bytes)",
        handler: cmd_readmem,
    },
    CommandSpec {
        name: "go",
        aliases: &[],
        usage: "/go ADDR",
        help: "Jump to an address and execute",
        handler: cmd_go,
    },
    CommandSpec {
        name: "exit",
        aliases: &["quit", "q"],
        usage: "/exit",
        help: "Quit",
        handler: cmd_exit,
    },
];

fn find_command(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS
        .iter()
        .find(|c| c.name == name || c.aliases.contains(&name))
}

pub struct Shell {
    session: Arc<SerialSession>,
    config: Config,
}

impl Shell {
    pub fn new(session: Arc<SerialSession>, config: Config) -> Self {
        Self { session, config }
    }

    pub fn run(&self) -> Result<()> {
        ui::banner();
        let stdin = io::stdin();

        loop {
            self.prompt();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) => break, // EOF
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix('/') {
                let parts: Vec<&str> = rest.split_whitespace().collect();
                let Some(first) = parts.first() else { continue };
                let name = first.to_ascii_lowercase();
                match find_command(&name) {
                    Some(spec) => match (spec.handler)(self, &parts[1..]) {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Exit) => break,
                        Err(Error::NotConnected) => {
                            ui::error("not connected; use /connect PORT BAUD first")
                        }
                        Err(e) => ui::error(&e.to_string()),
                    },
                    None => {
                        ui::error(&format!("unknown command: /{name}"));
                        ui::note("type /help to see available commands");
                    }
                }
            } else {
                self.send_text(line);
            }
        }

        self.session.shutdown();
        Ok(())
    }

    fn prompt(&self) {
        let status = match self.session.port_status() {
            Some((name, baud)) => format!("{name}@{baud}"),
            None => "disconnected".into(),
        };
        let mut modes = vec![if self.session.newline_enabled() {
            "CRLF"
        } else {
            "RAW"
        }];
        if self.session.timestamp_enabled() {
            modes.push("TIME");
        }
        if self.session.hex_enabled() {
            modes.push("HEX");
        }
        print!("[{status}] [{}] > ", modes.join(" "));
        let _ = io::stdout().flush();
    }

    fn send_text(&self, text: &str) {
        let mut payload = text.as_bytes().to_vec();
        if self.session.newline_enabled() {
            payload.extend_from_slice(b"\r\n");
        }
        match self.session.send(&payload) {
            Ok(()) => {
                let timestamp = self.session.timestamp_enabled();
                if self.session.hex_enabled() {
                    let hex: Vec<String> = payload.iter().map(|b| format!("{b:02X}")).collect();
                    ui::tx_line(&hex.join(" "), timestamp);
                } else {
                    ui::tx_line(text, timestamp);
                }
            }
            Err(Error::NotConnected) => ui::note("not connected; use /connect PORT BAUD first"),
            Err(e) => ui::error(&format!("send failed: {e}")),
        }
    }
}

/// Accepts decimal or 0x-prefixed hex.
fn parse_number(s: &str) -> Result<u32> {
    let trimmed = s.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => trimmed.parse(),
    };
    parsed.map_err(|_| Error::InvalidArgument(format!("invalid number: {trimmed:?}")))
}

fn cmd_help(_shell: &Shell, _args: &[&str]) -> Result<Flow> {
    println!();
    for spec in COMMANDS {
        println!("  {:<22} {}", spec.usage, spec.help);
    }
    println!();
    println!("  Bare text is sent to the port; /newline controls the CRLF suffix.");
    println!();
    Ok(Flow::Continue)
}

fn cmd_list(_shell: &Shell, _args: &[&str]) -> Result<Flow> {
    let ports = SerialSession::list_ports()?;
    ui::port_list(&ports);
    Ok(Flow::Continue)
}

fn cmd_connect(shell: &Shell, args: &[&str]) -> Result<Flow> {
    let port = match args.first() {
        Some(port) => (*port).to_string(),
        None => shell.config.default_port.clone().ok_or_else(|| {
            Error::InvalidArgument("usage: /connect PORT [BAUD]".into())
        })?,
    };
    let baud = match args.get(1) {
        Some(baud) => parse_number(baud)?,
        None => shell.config.default_baud,
    };
    shell.session.connect(&port, baud)?;
    ui::success(&format!("connected to {port} at {baud} baud"));
    Ok(Flow::Continue)
}

fn cmd_disconnect(shell: &Shell, _args: &[&str]) -> Result<Flow> {
    shell.session.disconnect()?;
    ui::success("disconnected");
    Ok(Flow::Continue)
}

fn cmd_stats(shell: &Shell, _args: &[&str]) -> Result<Flow> {
    ui::stats_panel(&shell.session);
    Ok(Flow::Continue)
}

fn cmd_clear(_shell: &Shell, _args: &[&str]) -> Result<Flow> {
    ui::clear_screen();
    Ok(Flow::Continue)
}

fn cmd_newline(shell: &Shell, _args: &[&str]) -> Result<Flow> {
    let on = shell.session.toggle_newline();
    ui::note(&format!(
        "append CRLF: {}",
        if on { "enabled" } else { "disabled" }
    ));
    Ok(Flow::Continue)
}

fn cmd_timestamp(shell: &Shell, _args: &[&str]) -> Result<Flow> {
    let on = shell.session.toggle_timestamp();
    ui::note(&format!(
        "timestamp display: {}",
        if on { "enabled" } else { "disabled" }
    ));
    Ok(Flow::Continue)
}

fn cmd_hex(shell: &Shell, _args: &[&str]) -> Result<Flow> {
    let on = shell.session.toggle_hex();
    ui::note(&format!(
        "hex mode: {}",
        if on { "enabled" } else { "disabled" }
    ));
    Ok(Flow::Continue)
}

fn cmd_bootloader(_shell: &Shell, _args: &[&str]) -> Result<Flow> {
    ui::bootloader_guide();
    Ok(Flow::Continue)
}

fn cmd_chipinfo(shell: &Shell, _args: &[&str]) -> Result<Flow> {
    let info = flash::chip_info(&shell.session)?;
    ui::chip_panel(&info);
    Ok(Flow::Continue)
}

fn cmd_flash(shell: &Shell, args: &[&str]) -> Result<Flow> {
    let file = args
        .first()
        .ok_or_else(|| Error::InvalidArgument("usage: /flash FILE [ADDR]".into()))?;
    let address = args.get(1).map(|a| parse_number(a)).transpose()?;

    ui::note(&format!("flashing {file}"));
    let mut renderer = ui::ProgressRenderer::new();
    let mut on_progress =
        |current: u64, total: u64, start: Instant| renderer.update(current, total, start);
    let result = flash::flash(
        &shell.session,
        Path::new(file),
        address,
        FlashOptions::default(),
        &mut on_progress,
    );
    renderer.finish();

    let report = result?;
    if let Some(chip) = &report.chip {
        ui::note(&format!("chip: 0x{:04X} ({})", chip.chip_id, chip.name));
    }
    ui::success(&format!(
        "flashed {} in {} segment(s), verified",
        ui::format_bytes(report.total),
        report.segments
    ));
    match report.jump {
        Some(addr) => ui::success(&format!("application started at 0x{addr:08X}")),
        None => ui::note("no jump performed"),
    }
    Ok(Flow::Continue)
}

fn cmd_verify(shell: &Shell, args: &[&str]) -> Result<Flow> {
    let file = args
        .first()
        .ok_or_else(|| Error::InvalidArgument("usage: /verify FILE [ADDR]".into()))?;
    let address = args.get(1).map(|a| parse_number(a)).transpose()?;

    let mut renderer = ui::ProgressRenderer::new();
    let mut on_progress =
        |current: u64, total: u64, start: Instant| renderer.update(current, total, start);
    let result = flash::verify(&shell.session, Path::new(file), address, &mut on_progress);
    renderer.finish();

    let verified = result?;
    ui::success(&format!(
        "verification passed ({})",
        ui::format_bytes(verified)
    ));
    Ok(Flow::Continue)
}

fn cmd_erase(shell: &Shell, _args: &[&str]) -> Result<Flow> {
    ui::note("erasing flash memory (may take a while)...");
    flash::erase(&shell.session)?;
    ui::success("flash memory erased");
    Ok(Flow::Continue)
}

fn cmd_readmem(shell: &Shell, args: &[&str]) -> Result<Flow> {
    let (addr_arg, len_arg) = match (args.first(), args.get(1)) {
        (Some(a), Some(l)) => (a, l),
        _ => return Err(Error::InvalidArgument("usage: /readmem ADDR LEN".into())),
    };
    let address = parse_number(addr_arg)?;
    let length = parse_number(len_arg)? as usize;
    let data = flash::read_memory(&shell.session, address, length)?;
    print!("{}", ui::format_hex_dump(address, &data));
    Ok(Flow::Continue)
}

fn cmd_go(shell: &Shell, args: &[&str]) -> Result<Flow> {
    let addr_arg = args
        .first()
        .ok_or_else(|| Error::InvalidArgument("usage: /go ADDR".into()))?;
    let address = parse_number(addr_arg)?;
    if flash::go(&shell.session, address)? {
        ui::success(&format!("application started at 0x{address:08X}"));
    } else {
        ui::note("jump sent without ACK; normal on some devices");
    }
    Ok(Flow::Continue)
}

fn cmd_exit(_shell: &Shell, _args: &[&str]) -> Result<Flow> {
    Ok(Flow::Exit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_command_by_name_and_alias() {
        assert!(find_command("flash").is_some());
        assert!(find_command("ls").is_some());
        assert!(find_command("quit").is_some());
        assert!(find_command("nonsense").is_none());
    }

    #[test]
    fn test_command_names_unique() {
        let mut names: Vec<&str> = COMMANDS
            .iter()
            .flat_map(|c| std::iter::once(c.name).chain(c.aliases.iter().copied()))
            .collect();
        let before = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn test_parse_number_decimal_and_hex() {
        assert_eq!(parse_number("115200").unwrap(), 115_200);
        assert_eq!(parse_number("0x08000000").unwrap(), 0x0800_0000);
        assert_eq!(parse_number("0X10").unwrap(), 0x10);
        assert!(parse_number("garbage").is_err());
        assert!(parse_number("0xZZ").is_err());
    }
}
