//! Command line configuration.

use std::net::IpAddr;

use cardreader::backend::DEFAULT_REPORT_SIZE;
use clap::{Parser, ValueEnum};
use log::LevelFilter;
use serde::{Deserialize, Serialize};

pub const RPC_DEFAULT_PORT: u16 = 50016;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum BackendKind {
    /// Fixed size HID reports
    Usb,
    /// Raw byte stream
    Uart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "cardreader-rpc-server", version, about = "Serve the cardreader core over TCP")]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: IpAddr,

    #[arg(long, default_value_t = RPC_DEFAULT_PORT)]
    pub port: u16,

    /// Transport used when a Create request does not name one
    #[arg(long, value_enum, default_value_t = BackendKind::Usb)]
    pub backend: BackendKind,

    /// HID report size in bytes, length byte included
    #[arg(long, default_value_t = DEFAULT_REPORT_SIZE)]
    pub report_size: usize,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([127, 0, 0, 1]),
            port: RPC_DEFAULT_PORT,
            backend: BackendKind::Usb,
            report_size: DEFAULT_REPORT_SIZE,
            log_level: LogLevel::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let config = ServerConfig::parse_from(["cardreader-rpc-server"]);
        assert_eq!(config.port, 50016);
        assert_eq!(config.backend, BackendKind::Usb);
        assert_eq!(config.report_size, 64);
        assert_eq!(LevelFilter::from(config.log_level), LevelFilter::Info);
    }

    #[test]
    fn test_cli_overrides() {
        let config = ServerConfig::parse_from([
            "cardreader-rpc-server",
            "--port",
            "6000",
            "--backend",
            "uart",
            "--log-level",
            "debug",
        ]);
        assert_eq!(config.port, 6000);
        assert_eq!(config.backend, BackendKind::Uart);
        assert_eq!(config.log_level, LogLevel::Debug);
    }
}
