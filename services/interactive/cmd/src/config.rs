//! Configuration handling for the interactive client.
//!
//! Settings come from a YAML file, then environment variables, then command
//! line flags, each layer overriding the previous one.

use anyhow::{Context, Result};
use interactive_session::{
    shared, CompressionScheme, ConfigurationError, ExponentialReconnectionPolicy, SocketOptions,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Socket URL
    pub url: String,
    /// OAuth bearer token
    pub auth_token: Option<String>,
    /// JWT, sent as a query parameter
    pub jwt: Option<String>,
    /// Keepalive ping interval
    pub ping_interval: Duration,
    /// How long a call waits for its reply
    pub reply_timeout: Duration,
    /// First reconnect delay
    pub reconnect_base_delay: Duration,
    /// Reconnect delay ceiling
    pub reconnect_max_delay: Duration,
    /// Extra handshake headers
    pub headers: BTreeMap<String, String>,
    /// Extra query parameters
    pub query_params: BTreeMap<String, String>,
    /// Compression schemes to offer, most preferred first; empty skips negotiation
    pub compression: Vec<CompressionScheme>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/gameplay".to_string(),
            auth_token: None,
            jwt: None,
            ping_interval: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(20),
            headers: BTreeMap::new(),
            query_params: BTreeMap::new(),
            compression: Vec::new(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    interactive: Option<FileConfig>,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    url: Option<String>,
    auth_token: Option<String>,
    jwt: Option<String>,
    ping_interval: Option<String>,
    reply_timeout: Option<String>,
    reconnect: Option<ReconnectConfig>,
    headers: Option<BTreeMap<String, String>>,
    query_params: Option<BTreeMap<String, String>>,
    compression: Option<Vec<CompressionScheme>>,
}

#[derive(Debug, Deserialize)]
struct ReconnectConfig {
    base_delay: Option<String>,
    max_delay: Option<String>,
}

impl ClientConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config)?;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?}, using defaults: {}",
                        config_path.as_ref(),
                        e
                    );
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", config_path.as_ref());
            }
        }

        config.apply_environment_overrides()?;

        info!(
            "Final configuration: url={}, auth={}, ping_interval={}, reply_timeout={}",
            config.url,
            config.auth_kind(),
            humantime::format_duration(config.ping_interval),
            humantime::format_duration(config.reply_timeout)
        );

        Ok(config)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) -> Result<()> {
        let Some(file) = root_config.interactive else {
            return Ok(());
        };

        if let Some(url) = file.url {
            self.url = url;
        }
        if file.auth_token.is_some() {
            self.auth_token = file.auth_token;
        }
        if file.jwt.is_some() {
            self.jwt = file.jwt;
        }
        if let Some(value) = file.ping_interval {
            self.ping_interval = parse_duration("ping_interval", &value)?;
        }
        if let Some(value) = file.reply_timeout {
            self.reply_timeout = parse_duration("reply_timeout", &value)?;
        }
        if let Some(reconnect) = file.reconnect {
            if let Some(value) = reconnect.base_delay {
                self.reconnect_base_delay = parse_duration("reconnect.base_delay", &value)?;
            }
            if let Some(value) = reconnect.max_delay {
                self.reconnect_max_delay = parse_duration("reconnect.max_delay", &value)?;
            }
        }
        if let Some(headers) = file.headers {
            self.headers.extend(headers);
        }
        if let Some(query_params) = file.query_params {
            self.query_params.extend(query_params);
        }
        if let Some(compression) = file.compression {
            self.compression = compression;
        }

        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("INTERACTIVE_URL") {
            info!("URL overridden by environment: {}", url);
            self.url = url;
        }

        if let Some(token) = lookup("INTERACTIVE_AUTH_TOKEN") {
            self.auth_token = Some(token);
            info!("Auth token overridden by environment");
        }

        if let Some(jwt) = lookup("INTERACTIVE_JWT") {
            self.jwt = Some(jwt);
            info!("JWT overridden by environment");
        }

        if let Some(value) = lookup("INTERACTIVE_PING_INTERVAL") {
            self.ping_interval = parse_duration("INTERACTIVE_PING_INTERVAL", &value)?;
            info!("Ping interval overridden by environment: {}", value);
        }

        if let Some(value) = lookup("INTERACTIVE_REPLY_TIMEOUT") {
            self.reply_timeout = parse_duration("INTERACTIVE_REPLY_TIMEOUT", &value)?;
            info!("Reply timeout overridden by environment: {}", value);
        }

        Ok(())
    }

    fn auth_kind(&self) -> &'static str {
        match (&self.auth_token, &self.jwt) {
            (Some(_), Some(_)) => "ambiguous",
            (Some(_), None) => "oauth",
            (None, Some(_)) => "jwt",
            (None, None) => "none",
        }
    }

    /// Build validated socket options
    pub fn to_socket_options(&self) -> Result<SocketOptions, ConfigurationError> {
        let mut builder = SocketOptions::builder(self.url.as_str())
            .ping_interval(self.ping_interval)
            .reply_timeout(self.reply_timeout)
            .reconnection_policy(shared(ExponentialReconnectionPolicy::new(
                self.reconnect_base_delay,
                self.reconnect_max_delay,
            )));

        if let Some(token) = &self.auth_token {
            builder = builder.auth_token(token.as_str());
        }
        if let Some(jwt) = &self.jwt {
            builder = builder.jwt(jwt.as_str());
        }
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        for (key, value) in &self.query_params {
            builder = builder.query_param(key.as_str(), value.as_str());
        }

        builder.build()
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration for {}: {:?}", field, value))
}

/// Parse a compression scheme name as given on the command line
pub fn parse_compression(value: &str) -> Result<CompressionScheme, String> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase()))
        .map_err(|_| format!("unknown compression scheme {:?} (expected none, gzip or lz4)", value))
}
