//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Resolve mTLS-authenticated devices to their Intune managed-device record
#[derive(Parser, Debug)]
#[command(name = "intune-device-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "DEVICE_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "DEVICE_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "DEVICE_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "DEVICE_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "DEVICE_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Load and validate configuration, then print it with secrets redacted
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_server_mode() {
        let cli = Cli::try_parse_from(["intune-device-gateway"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn parses_overrides_and_subcommand() {
        let cli = Cli::try_parse_from([
            "intune-device-gateway",
            "--config",
            "gateway.yaml",
            "--port",
            "9443",
            "check-config",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("gateway.yaml")));
        assert_eq!(cli.port, Some(9443));
        assert!(matches!(cli.command, Some(Command::CheckConfig)));
    }
}
