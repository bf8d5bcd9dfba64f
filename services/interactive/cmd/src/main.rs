//! Interactive socket client binary.
//!
//! Connects to an interactive endpoint, optionally negotiates compression and
//! calls one method, then logs socket activity until interrupted.

use anyhow::Context;
use clap::Parser;
use interactive_dispatch::Client;
use interactive_session::{CompressionScheme, SocketEvent};
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::{parse_compression, ClientConfig};
use logging::InteractiveLogFormatter;

/// Reconnecting client for the interactive method/reply protocol
#[derive(Parser, Debug)]
#[command(name = "interactive", version, about = "Interactive socket client")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "interactive.yaml")]
    config: PathBuf,

    /// Socket URL, e.g. wss://example.com/gameplay
    #[arg(long)]
    url: Option<String>,

    /// OAuth bearer token
    #[arg(long, conflicts_with = "jwt")]
    auth_token: Option<String>,

    /// JWT passed as a query parameter
    #[arg(long)]
    jwt: Option<String>,

    /// Ping interval, e.g. 10s
    #[arg(long)]
    ping_interval: Option<humantime::Duration>,

    /// Reply timeout, e.g. 5s
    #[arg(long)]
    reply_timeout: Option<humantime::Duration>,

    /// Compression schemes to offer, most preferred first (repeatable)
    #[arg(long, value_parser = parse_compression)]
    compression: Vec<CompressionScheme>,

    /// Method to call once connected
    #[arg(long)]
    method: Option<String>,

    /// JSON params for --method
    #[arg(long, default_value = "null")]
    params: String,

    /// Send --method with discard set and do not wait for a reply
    #[arg(long)]
    no_reply: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Flags win over the file and the environment
    fn apply_to(&self, config: &mut ClientConfig) {
        if let Some(url) = &self.url {
            config.url = url.clone();
        }
        if let Some(token) = &self.auth_token {
            config.auth_token = Some(token.clone());
            config.jwt = None;
        }
        if let Some(jwt) = &self.jwt {
            config.jwt = Some(jwt.clone());
            config.auth_token = None;
        }
        if let Some(interval) = self.ping_interval {
            config.ping_interval = interval.into();
        }
        if let Some(timeout) = self.reply_timeout {
            config.reply_timeout = timeout.into();
        }
        if !self.compression.is_empty() {
            config.compression = self.compression.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("interactive={}", args.log_level).parse()?)
        .add_directive(format!("interactive_session={}", args.log_level).parse()?)
        .add_directive(format!("interactive_dispatch={}", args.log_level).parse()?)
        .add_directive(format!("interactive_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(InteractiveLogFormatter::new("interactive"))
        .init();

    info!("Starting interactive client v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ClientConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);
    let options = config
        .to_socket_options()
        .context("invalid socket configuration")?;

    let client = Client::new();
    let events = client.open(options)?;
    let event_log = tokio::spawn(log_events(events));

    if !config.compression.is_empty() {
        match client.set_compression(&config.compression).await {
            Ok(scheme) => component_info!("cli", "Compression negotiated: {}", scheme),
            Err(e) => component_warn!("cli", "Compression negotiation failed: {}", e),
        }
    }

    if let Some(method) = &args.method {
        let params: Value = serde_json::from_str(&args.params).context("--params must be valid JSON")?;
        match client.execute(method, params, !args.no_reply).await {
            Ok(Value::Null) if args.no_reply => component_info!("cli", "Sent {}", method),
            Ok(result) => component_info!("cli", "{} returned {}", method, result),
            Err(e) => error!("{} failed: {}", method, e),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Received SIGINT, shutting down");

    client.close();
    event_log.abort();
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<SocketEvent>) {
    loop {
        match events.recv().await {
            Ok(SocketEvent::Opened) => component_info!("socket", "Connection open"),
            Ok(SocketEvent::Closed { reason }) => component_warn!("socket", "Connection closed: {}", reason),
            Ok(SocketEvent::Method(method)) => {
                component_info!("socket", "Peer called {} (id {})", method.method, method.id)
            }
            Ok(SocketEvent::Sent(frame)) => component_debug!("socket", "→ {}", frame),
            Ok(SocketEvent::Received(frame)) => component_debug!("socket", "← {}", frame),
            Ok(SocketEvent::ProtocolError(e)) => component_warn!("socket", "Protocol error: {}", e),
            Ok(SocketEvent::TransportError(e)) => component_warn!("socket", "Connect failed: {}", e),
            Err(RecvError::Lagged(skipped)) => component_warn!("socket", "Skipped {} events", skipped),
            Err(RecvError::Closed) => return,
        }
    }
}
