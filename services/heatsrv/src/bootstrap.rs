//! Service Bootstrap and Initialization
//!
//! Command-line arguments, configuration loading and logging setup for the
//! `heatsrv` binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::logging::{parse_level, LogConfig};
use common::service_bootstrap::ServiceInfo;

use crate::config::AppConfig;
use crate::error::{HeatSrvError, Result};

/// Command-line arguments for heatsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "heatsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Elster CAN bus to MQTT gateway for heat pumps",
    long_about = None
)]
pub struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long, global = true)]
    pub log_level: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the gateway (default)
    Run,

    /// Read one parameter and print it
    Read {
        /// Receiver address, e.g. 0x180
        #[arg(short, long, value_parser = parse_hex_u16)]
        receiver: u16,
        /// Parameter index, e.g. 0x000c
        #[arg(short, long, value_parser = parse_hex_u16)]
        index: u16,
        /// Sender address, defaults to can.sender_id
        #[arg(short, long, value_parser = parse_hex_u16)]
        sender: Option<u16>,
    },

    /// Discover modules on the bus
    Scan {
        /// Sender address, defaults to can.sender_id
        #[arg(short, long, value_parser = parse_hex_u16)]
        sender: Option<u16>,
        /// First receiver to probe; without a range the configured list is used
        #[arg(long, value_parser = parse_hex_u16, requires = "to")]
        from: Option<u16>,
        /// Last receiver to probe (inclusive)
        #[arg(long, value_parser = parse_hex_u16, requires = "from")]
        to: Option<u16>,
    },

    /// Capture unsolicited telegrams for a while and list them
    Sniff {
        #[arg(short = 't', long, default_value_t = 30)]
        seconds: u64,
        /// Print the list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as YAML
    Config,
}

impl Args {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

/// clap value parser accepting `0x680` or `1664`
pub fn parse_hex_u16(text: &str) -> std::result::Result<u16, String> {
    common::serde_helpers::parse_u16_flexible(text)
}

pub fn service_info() -> ServiceInfo {
    ServiceInfo::new(
        "heatsrv",
        env!("CARGO_PKG_VERSION"),
        "Elster CAN bus to MQTT gateway",
    )
}

/// Load and validate the configuration named on the command line
pub fn load_config(args: &Args) -> Result<AppConfig> {
    let config = AppConfig::load(args.config.as_deref())?;
    config.validate()?;
    debug!("Configuration loaded");
    Ok(config)
}

/// Logger settings; `--log-level` wins over `service.log_level`
pub fn log_config(args: &Args, config: &AppConfig) -> LogConfig {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(config.service.log_level.as_str());

    let mut log_config = LogConfig::new(config.service.name.clone(), parse_level(level))
        .with_json(config.service.log_json)
        .with_ansi(!args.no_color);
    if let Some(dir) = &config.service.log_dir {
        log_config = log_config.with_log_dir(dir);
    }
    log_config
}

/// Initialize logging from configuration and command-line arguments
pub fn initialize_logging(args: &Args, config: &AppConfig) -> Result<()> {
    common::logging::init_with_config(log_config(args, config))
        .map_err(|e| HeatSrvError::Config(format!("Failed to init logging: {}", e)))
}

/// Re-read the configuration on SIGHUP and apply its log level
#[cfg(unix)]
pub async fn reload_log_level_on_hangup(args: Args, cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!("Failed to install SIGHUP handler: {}", e);
            return;
        },
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                match load_config(&args) {
                    Ok(config) => {
                        let directive = log_config(&args, &config).default_directive();
                        if let Err(e) = common::logging::set_log_level(&directive) {
                            warn!("SIGHUP: {}", e);
                        }
                    },
                    Err(e) => warn!("SIGHUP: configuration not reloaded: {}", e),
                }
                info!("Log filter: {}", common::logging::get_log_level());
            },
        }
    }
}

/// Log a summary of the configuration (`--validate`)
pub fn describe_configuration(config: &AppConfig) {
    info!("Service: {}", config.service.name);
    info!(
        "CAN: {} at {} baud, {} kbit/s, sender 0x{:03x}",
        config.can.port, config.can.baud_rate, config.can.bitrate_kbps, config.can.sender_id
    );
    info!(
        "MQTT: {} as '{}', topic root '{}'",
        config.mqtt.server_uri, config.mqtt.client_id, config.mqtt.topic
    );
    info!("Found {} reading(s)", config.polling.readings.len());
    for reading in &config.polling.readings {
        info!(
            "  {}: receiver 0x{:03x} index 0x{:04x}",
            reading.name, reading.receiver, reading.index
        );
    }
    info!("Configuration validation completed successfully");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_run() {
        let args = Args::parse_from(["heatsrv"]);
        assert_eq!(args.command(), Command::Run);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_read_accepts_hex() {
        let args = Args::parse_from(["heatsrv", "read", "--receiver", "0x180", "--index", "12"]);
        assert_eq!(
            args.command(),
            Command::Read {
                receiver: 0x180,
                index: 12,
                sender: None
            }
        );
    }

    #[test]
    fn test_scan_range_requires_both_ends() {
        assert!(Args::try_parse_from(["heatsrv", "scan", "--from", "0x180"]).is_err());

        let args =
            Args::try_parse_from(["heatsrv", "scan", "--from", "0x180", "--to", "0x183"]).unwrap();
        assert_eq!(
            args.command(),
            Command::Scan {
                sender: None,
                from: Some(0x180),
                to: Some(0x183)
            }
        );
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let args = Args::parse_from(["heatsrv", "sniff", "--json", "-c", "x.yaml"]);
        assert_eq!(args.config, Some(PathBuf::from("x.yaml")));
        assert_eq!(
            args.command(),
            Command::Sniff {
                seconds: 30,
                json: true
            }
        );
    }

    #[test]
    fn test_cli_log_level_overrides_config() {
        let mut config = AppConfig::default();
        config.service.log_level = "warn".to_string();

        let args = Args::parse_from(["heatsrv"]);
        assert_eq!(log_config(&args, &config).default_directive(), "info,heatsrv=warn");

        let args = Args::parse_from(["heatsrv", "--log-level", "debug", "--no-color"]);
        let log = log_config(&args, &config);
        assert_eq!(log.default_directive(), "info,heatsrv=debug");
        assert!(!log.ansi);
    }

    #[test]
    fn test_invalid_hex_rejected() {
        assert!(
            Args::try_parse_from(["heatsrv", "read", "--receiver", "0xZZ", "--index", "1"])
                .is_err()
        );
    }
}
