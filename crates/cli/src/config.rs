//! Environment-derived defaults
//!
//! `STMCLI_PORT` and `STMCLI_BAUD` pre-fill the interactive shell's
//! `/connect`; one-shot verbs take their parameters on the command line.

/// Factory-bootloader default baud rate
pub const DEFAULT_BAUD: u32 = 115_200;

#[derive(Debug, Clone)]
pub struct Config {
    pub default_baud: u32,
    pub default_port: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let default_baud = std::env::var("STMCLI_BAUD")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&baud| baud > 0)
            .unwrap_or(DEFAULT_BAUD);
        let default_port = std::env::var("STMCLI_PORT").ok().filter(|p| !p.is_empty());
        Self {
            default_baud,
            default_port,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_baud: DEFAULT_BAUD,
            default_port: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides_and_fallbacks() {
        std::env::set_var("STMCLI_BAUD", "921600");
        std::env::set_var("STMCLI_PORT", "/dev/ttyACM3");
        let config = Config::from_env();
        assert_eq!(config.default_baud, 921_600);
        assert_eq!(config.default_port.as_deref(), Some("/dev/ttyACM3"));

        std::env::set_var("STMCLI_BAUD", "not-a-number");
        std::env::remove_var("STMCLI_PORT");
        let config = Config::from_env();
        assert_eq!(config.default_baud, DEFAULT_BAUD);
        assert!(config.default_port.is_none());

        std::env::remove_var("STMCLI_BAUD");
    }
}
