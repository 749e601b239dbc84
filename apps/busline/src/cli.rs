use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use busline::config::Config;
use busline::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "busline",
    about = "Follow a real-time bus: connection health and pushed notifications",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = "BUSLINE_CONFIG",
        help = "TOML configuration file"
    )]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "BUSLINE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "BUSLINE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect and print state transitions and notifications until ctrl-c
    Watch(WatchArgs),
    /// Print the effective configuration as TOML
    Config(WatchArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct WatchArgs {
    #[arg(long, value_name = "WS_URL", help = "Websocket endpoint of the bus server")]
    pub url: Option<String>,

    #[arg(
        long = "channel",
        value_name = "NAME",
        help = "Channel to subscribe to; repeat for several"
    )]
    pub channels: Vec<String>,

    #[arg(long, value_name = "ID", help = "Persona id of the local user")]
    pub self_persona: Option<u64>,

    #[arg(long, value_name = "N", help = "Short outages tolerated before reporting instability")]
    pub max_reconnects: Option<u32>,
}

impl WatchArgs {
    /// Flags take precedence over file and environment values.
    pub fn apply(&self, config: &mut Config) {
        if let Some(url) = &self.url {
            config.server_url = url.clone();
        }
        if !self.channels.is_empty() {
            config.channels = self.channels.clone();
        }
        if let Some(persona) = self.self_persona {
            config.self_persona = Some(persona);
        }
        if let Some(max) = self.max_reconnects {
            config.max_reconnect_attempts = max;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_loaded_values() {
        let cli = Cli::try_parse_from([
            "busline",
            "watch",
            "--url",
            "ws://bus.example/websocket",
            "--channel",
            "general",
            "--channel",
            "random",
            "--self-persona",
            "4",
        ])
        .expect("parse");
        let Command::Watch(args) = cli.command else {
            panic!("expected watch");
        };
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.server_url, "ws://bus.example/websocket");
        assert_eq!(config.channels, vec!["general", "random"]);
        assert_eq!(config.self_persona, Some(4));
        assert_eq!(config.max_reconnect_attempts, Config::default().max_reconnect_attempts);
    }
}
