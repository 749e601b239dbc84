mod cli;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use busline::config::Config;
use busline::telemetry::logging;
use busline::{BusClient, BusEvent, ConnectionState};
use cli::{Cli, Command, WatchArgs};

const PRESENCE_INTERVAL: Duration = Duration::from_secs(50);

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    match &cli.command {
        Command::Watch(args) => watch(load_config(&cli, args)?).await,
        Command::Config(args) => {
            print!("{}", load_config(&cli, args)?.to_toml()?);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli, args: &WatchArgs) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

async fn watch(config: Config) -> Result<()> {
    let channel = config
        .channel_config()
        .with_context(|| format!("invalid server url {}", config.server_url))?;
    let client = BusClient::new(config.monitor_config(), config.self_persona())?;
    let mut events = client.events();

    client.start();
    let handle = client.connect(channel);
    info!(
        target = "busline::transport",
        url = %config.server_url,
        channels = ?config.channels,
        "watching bus"
    );

    let started = tokio::time::Instant::now();
    let mut presence = tokio::time::interval(PRESENCE_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = presence.tick() => {
                // Nobody types into a watcher, so it is idle since launch.
                if handle.update_presence(started.elapsed()).is_err() {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event);
                    if matches!(
                        event,
                        BusEvent::StateChanged {
                            to: ConnectionState::Disconnected,
                            ..
                        }
                    ) {
                        info!(target = "busline::transport", "session ended; exiting");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target = "busline::dispatch", skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.close().await;
    client.shutdown();
    Ok(())
}

fn print_event(event: &BusEvent) {
    match event {
        BusEvent::StateChanged { from, to } if to.is_degraded() => {
            println!("state {from} -> {to} (connection issues)")
        }
        BusEvent::StateChanged { from, to } => println!("state {from} -> {to}"),
        BusEvent::Connect => println!("connected"),
        BusEvent::Reconnect => println!("reconnected"),
        BusEvent::Disconnect { code } => println!("disconnected ({code})"),
        BusEvent::Notification(envelope) => {
            println!("#{} {} {}", envelope.id, envelope.kind, envelope.payload)
        }
    }
}
