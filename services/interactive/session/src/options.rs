//! Socket configuration snapshots.
//!
//! [`SocketOptions`] is immutable once built. The engine swaps the whole
//! snapshot when [`crate::InteractiveSocket::set_options`] merges a
//! [`SocketOptionsUpdate`]; anything already in flight keeps the snapshot it
//! started with.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use url::Url;

use crate::error::ConfigurationError;
use crate::reconnection::{shared, ExponentialReconnectionPolicy, SharedPolicy};
use crate::transport::ConnectRequest;

/// Default interval between keepalive pings
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Default time a call waits for its reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Query parameter carrying a JWT
pub const JWT_QUERY_PARAM: &str = "jwt";

/// Frame compression negotiated with the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionScheme {
    /// Plain text frames
    #[default]
    None,
    /// gzip
    Gzip,
    /// lz4
    Lz4,
}

impl fmt::Display for CompressionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionScheme::None => "none",
            CompressionScheme::Gzip => "gzip",
            CompressionScheme::Lz4 => "lz4",
        };
        f.write_str(name)
    }
}

/// Resolved credential
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    /// Anonymous connection
    None,
    /// OAuth bearer token sent in the `Authorization` header
    Bearer(String),
    /// JWT sent as the `jwt` query parameter
    Jwt(String),
}

impl Auth {
    fn resolve(auth_token: Option<String>, jwt: Option<String>) -> Result<Self, ConfigurationError> {
        match (auth_token, jwt) {
            (Some(_), Some(_)) => Err(ConfigurationError::AmbiguousAuth),
            (Some(token), None) => Ok(Auth::Bearer(token)),
            (None, Some(jwt)) => Ok(Auth::Jwt(jwt)),
            (None, None) => Ok(Auth::None),
        }
    }

    fn parts(&self) -> (Option<String>, Option<String>) {
        match self {
            Auth::None => (None, None),
            Auth::Bearer(token) => (Some(token.clone()), None),
            Auth::Jwt(jwt) => (None, Some(jwt.clone())),
        }
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Credentials never reach the logs
        match self {
            Auth::None => f.write_str("None"),
            Auth::Bearer(_) => f.write_str("Bearer(***)"),
            Auth::Jwt(_) => f.write_str("Jwt(***)"),
        }
    }
}

/// Immutable socket configuration
#[derive(Debug, Clone)]
pub struct SocketOptions {
    url: Url,
    auth: Auth,
    extra_headers: BTreeMap<String, String>,
    query_params: BTreeMap<String, String>,
    ping_interval: Duration,
    reply_timeout: Duration,
    handshake_timeout: Option<Duration>,
    reconnection_policy: SharedPolicy,
    compression_scheme: CompressionScheme,
}

impl SocketOptions {
    /// Start building options for `url`
    pub fn builder(url: impl Into<String>) -> SocketOptionsBuilder {
        SocketOptionsBuilder::new(url)
    }

    /// Socket URL without auth or query additions
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Resolved credential
    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    /// Extra handshake headers
    pub fn extra_headers(&self) -> &BTreeMap<String, String> {
        &self.extra_headers
    }

    /// Extra query parameters
    pub fn query_params(&self) -> &BTreeMap<String, String> {
        &self.query_params
    }

    /// Interval between keepalive pings
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    /// How long a call waits for its reply
    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    /// How long a connection attempt may take before it counts as failed;
    /// the ping interval unless set
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout.unwrap_or(self.ping_interval)
    }

    /// Backoff strategy for reconnects
    pub fn reconnection_policy(&self) -> &SharedPolicy {
        &self.reconnection_policy
    }

    /// Negotiated compression
    pub fn compression_scheme(&self) -> CompressionScheme {
        self.compression_scheme
    }

    /// Merge an update into a new snapshot, re-validating it
    pub fn merged(&self, update: SocketOptionsUpdate) -> Result<SocketOptions, ConfigurationError> {
        let (mut auth_token, mut jwt) = if update.clear_auth {
            (None, None)
        } else {
            self.auth.parts()
        };
        if update.auth_token.is_some() {
            auth_token = update.auth_token;
        }
        if update.jwt.is_some() {
            jwt = update.jwt;
        }

        let mut extra_headers = self.extra_headers.clone();
        extra_headers.extend(update.extra_headers);
        let mut query_params = self.query_params.clone();
        query_params.extend(update.query_params);

        let url = match update.url {
            Some(url) => parse_url(&url)?,
            None => self.url.clone(),
        };

        SocketOptions {
            url,
            auth: Auth::resolve(auth_token, jwt)?,
            extra_headers,
            query_params,
            ping_interval: update.ping_interval.unwrap_or(self.ping_interval),
            reply_timeout: update.reply_timeout.unwrap_or(self.reply_timeout),
            handshake_timeout: update.handshake_timeout.or(self.handshake_timeout),
            reconnection_policy: update
                .reconnection_policy
                .unwrap_or_else(|| self.reconnection_policy.clone()),
            compression_scheme: update.compression_scheme.unwrap_or(self.compression_scheme),
        }
        .validated()
    }

    /// Checks shared by the builder and `merged`
    fn validated(self) -> Result<Self, ConfigurationError> {
        validate_headers(&self.extra_headers)?;

        // Only one credential may reach the handshake, however it is supplied
        let credentials = [
            self.auth != Auth::None,
            self.query_params.contains_key(JWT_QUERY_PARAM),
            self.extra_headers
                .keys()
                .any(|name| name.eq_ignore_ascii_case("authorization")),
        ];
        if credentials.iter().filter(|present| **present).count() > 1 {
            return Err(ConfigurationError::AmbiguousAuth);
        }

        let durations = [
            ("ping_interval", Some(self.ping_interval)),
            ("reply_timeout", Some(self.reply_timeout)),
            ("handshake_timeout", self.handshake_timeout),
        ];
        for (name, value) in durations {
            if value == Some(Duration::ZERO) {
                return Err(ConfigurationError::ZeroDuration { name });
            }
        }
        Ok(self)
    }

    /// Resolve the handshake: bearer tokens go in a header, a JWT and any
    /// extra params go in the query string
    pub fn connect_request(&self) -> ConnectRequest {
        let mut url = self.url.clone();
        let jwt = match &self.auth {
            Auth::Jwt(jwt) => Some(jwt.as_str()),
            _ => None,
        };

        if !self.query_params.is_empty() || jwt.is_some() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query_params {
                pairs.append_pair(key, value);
            }
            if let Some(jwt) = jwt {
                pairs.append_pair(JWT_QUERY_PARAM, jwt);
            }
        }

        let mut headers: Vec<(String, String)> = self
            .extra_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Auth::Bearer(token) = &self.auth {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }

        ConnectRequest { url, headers }
    }
}

/// Builder for [`SocketOptions`]
#[derive(Debug, Clone)]
pub struct SocketOptionsBuilder {
    url: String,
    auth_token: Option<String>,
    jwt: Option<String>,
    extra_headers: BTreeMap<String, String>,
    query_params: BTreeMap<String, String>,
    ping_interval: Duration,
    reply_timeout: Duration,
    handshake_timeout: Option<Duration>,
    reconnection_policy: Option<SharedPolicy>,
    compression_scheme: CompressionScheme,
}

impl SocketOptionsBuilder {
    /// Defaults: 10s ping, 10s reply timeout, exponential backoff, no compression
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
            jwt: None,
            extra_headers: BTreeMap::new(),
            query_params: BTreeMap::new(),
            ping_interval: DEFAULT_PING_INTERVAL,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            handshake_timeout: None,
            reconnection_policy: None,
            compression_scheme: CompressionScheme::None,
        }
    }

    /// OAuth bearer token
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// JWT passed as a query parameter
    pub fn jwt(mut self, jwt: impl Into<String>) -> Self {
        self.jwt = Some(jwt.into());
        self
    }

    /// Add a handshake header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }

    /// Add a query parameter
    pub fn query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    /// Keepalive ping interval
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Reply timeout
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Connection attempt timeout, the ping interval by default
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Reconnection backoff strategy
    pub fn reconnection_policy(mut self, policy: SharedPolicy) -> Self {
        self.reconnection_policy = Some(policy);
        self
    }

    /// Compression scheme
    pub fn compression_scheme(mut self, scheme: CompressionScheme) -> Self {
        self.compression_scheme = scheme;
        self
    }

    /// Validate and freeze
    pub fn build(self) -> Result<SocketOptions, ConfigurationError> {
        let auth = Auth::resolve(self.auth_token, self.jwt)?;
        let url = parse_url(&self.url)?;

        SocketOptions {
            url,
            auth,
            extra_headers: self.extra_headers,
            query_params: self.query_params,
            ping_interval: self.ping_interval,
            reply_timeout: self.reply_timeout,
            handshake_timeout: self.handshake_timeout,
            reconnection_policy: self
                .reconnection_policy
                .unwrap_or_else(|| shared(ExponentialReconnectionPolicy::default())),
            compression_scheme: self.compression_scheme,
        }
        .validated()
    }
}

/// Partial options merged by `set_options`
#[derive(Debug, Clone, Default)]
pub struct SocketOptionsUpdate {
    /// New URL, used from the next connection attempt
    pub url: Option<String>,
    /// Drop existing credentials before applying `auth_token` / `jwt`
    pub clear_auth: bool,
    /// New bearer token
    pub auth_token: Option<String>,
    /// New JWT
    pub jwt: Option<String>,
    /// Headers added to (or replacing) the current ones
    pub extra_headers: BTreeMap<String, String>,
    /// Query parameters added to (or replacing) the current ones
    pub query_params: BTreeMap<String, String>,
    /// New ping interval
    pub ping_interval: Option<Duration>,
    /// New reply timeout
    pub reply_timeout: Option<Duration>,
    /// New connection attempt timeout
    pub handshake_timeout: Option<Duration>,
    /// New backoff strategy
    pub reconnection_policy: Option<SharedPolicy>,
    /// New compression scheme
    pub compression_scheme: Option<CompressionScheme>,
}

fn parse_url(url: &str) -> Result<Url, ConfigurationError> {
    Url::parse(url).map_err(|e| ConfigurationError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

fn validate_headers(headers: &BTreeMap<String, String>) -> Result<(), ConfigurationError> {
    for (name, value) in headers {
        HeaderName::from_bytes(name.as_bytes()).map_err(|e| ConfigurationError::InvalidHeader {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        HeaderValue::from_str(value).map_err(|e| ConfigurationError::InvalidHeader {
            name: name.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnection::FixedReconnectionPolicy;

    const URL: &str = "ws://127.0.0.1:1339/";

    #[test]
    fn test_defaults() {
        let options = SocketOptions::builder(URL).build().unwrap();
        assert_eq!(options.ping_interval(), DEFAULT_PING_INTERVAL);
        assert_eq!(options.reply_timeout(), DEFAULT_REPLY_TIMEOUT);
        assert_eq!(options.compression_scheme(), CompressionScheme::None);
        assert_eq!(options.auth(), &Auth::None);
    }

    #[test]
    fn test_ambiguous_auth_rejected_at_build() {
        let err = SocketOptions::builder(URL)
            .auth_token("asdf!")
            .jwt("wat?")
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigurationError::AmbiguousAuth);
        assert!(err.to_string().contains("both JWT and OAuth token"));
    }

    #[test]
    fn test_invalid_url_rejected_at_build() {
        let err = SocketOptions::builder("not a url").build().unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidUrl { .. }));
    }

    #[test]
    fn test_invalid_header_rejected_at_build() {
        let err = SocketOptions::builder(URL)
            .header("X-Bad Header", "v")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidHeader { .. }));
    }

    #[test]
    fn test_bearer_request_has_header_and_plain_url() {
        let request = SocketOptions::builder(URL)
            .auth_token("asdf!")
            .build()
            .unwrap()
            .connect_request();

        assert_eq!(request.url.as_str(), URL);
        assert!(request
            .headers
            .contains(&("Authorization".to_string(), "Bearer asdf!".to_string())));
    }

    #[test]
    fn test_jwt_request_uses_query_and_no_header() {
        let request = SocketOptions::builder(URL)
            .jwt("asdf!")
            .query_param("version", "3")
            .header("X-Interactive-Version", "1234")
            .build()
            .unwrap()
            .connect_request();

        let pairs: Vec<(String, String)> = request
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("version".to_string(), "3".to_string()),
                ("jwt".to_string(), "asdf!".to_string()),
            ]
        );
        assert!(request.headers.iter().all(|(name, _)| name != "Authorization"));
        assert!(request
            .headers
            .contains(&("X-Interactive-Version".to_string(), "1234".to_string())));
    }

    #[test]
    fn test_merge_keeps_unset_fields() {
        let options = SocketOptions::builder(URL)
            .auth_token("token")
            .ping_interval(Duration::from_millis(100))
            .build()
            .unwrap();

        let merged = options
            .merged(SocketOptionsUpdate {
                reply_timeout: Some(Duration::from_millis(5)),
                compression_scheme: Some(CompressionScheme::Gzip),
                reconnection_policy: Some(shared(FixedReconnectionPolicy::new(Duration::from_millis(5)))),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(merged.ping_interval(), Duration::from_millis(100));
        assert_eq!(merged.reply_timeout(), Duration::from_millis(5));
        assert_eq!(merged.compression_scheme(), CompressionScheme::Gzip);
        assert_eq!(merged.auth(), &Auth::Bearer("token".to_string()));
        assert_eq!(
            merged.reconnection_policy().lock().unwrap().next(),
            Duration::from_millis(5)
        );
        // The original snapshot is untouched
        assert_eq!(options.reply_timeout(), DEFAULT_REPLY_TIMEOUT);
    }

    #[test]
    fn test_merge_rejects_second_credential() {
        let options = SocketOptions::builder(URL).auth_token("token").build().unwrap();
        let err = options
            .merged(SocketOptionsUpdate {
                jwt: Some("jwt".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, ConfigurationError::AmbiguousAuth);

        let switched = options
            .merged(SocketOptionsUpdate {
                clear_auth: true,
                jwt: Some("jwt".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(switched.auth(), &Auth::Jwt("jwt".to_string()));
    }

    #[test]
    fn test_credentials_in_query_or_headers_conflict_with_auth() {
        let err = SocketOptions::builder(URL)
            .auth_token("asdf!")
            .query_param("jwt", "wat?")
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigurationError::AmbiguousAuth);

        let err = SocketOptions::builder(URL)
            .jwt("wat?")
            .header("authorization", "Bearer asdf!")
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigurationError::AmbiguousAuth);

        let err = SocketOptions::builder(URL)
            .header("Authorization", "Bearer asdf!")
            .query_param("jwt", "wat?")
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigurationError::AmbiguousAuth);

        // A single credential passed by hand is fine
        let options = SocketOptions::builder(URL)
            .header("Authorization", "Bearer asdf!")
            .build()
            .unwrap();
        let err = options
            .merged(SocketOptionsUpdate {
                query_params: [("jwt".to_string(), "wat?".to_string())].into_iter().collect(),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, ConfigurationError::AmbiguousAuth);
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        let err = SocketOptions::builder(URL)
            .ping_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigurationError::ZeroDuration { name: "ping_interval" });

        let err = SocketOptions::builder(URL)
            .handshake_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigurationError::ZeroDuration { name: "handshake_timeout" });

        let options = SocketOptions::builder(URL).build().unwrap();
        let err = options
            .merged(SocketOptionsUpdate {
                reply_timeout: Some(Duration::ZERO),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, ConfigurationError::ZeroDuration { name: "reply_timeout" });
    }

    #[test]
    fn test_handshake_timeout_defaults_to_ping_interval() {
        let options = SocketOptions::builder(URL)
            .ping_interval(Duration::from_secs(3))
            .build()
            .unwrap();
        assert_eq!(options.handshake_timeout(), Duration::from_secs(3));

        let merged = options
            .merged(SocketOptionsUpdate {
                handshake_timeout: Some(Duration::from_millis(250)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(merged.handshake_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_auth_debug_is_redacted() {
        let options = SocketOptions::builder(URL).auth_token("secret-token").build().unwrap();
        assert!(!format!("{:?}", options).contains("secret-token"));
    }

    #[test]
    fn test_compression_scheme_serde() {
        assert_eq!(serde_json::to_string(&CompressionScheme::Lz4).unwrap(), "\"lz4\"");
        let parsed: CompressionScheme = serde_json::from_str("\"gzip\"").unwrap();
        assert_eq!(parsed, CompressionScheme::Gzip);
        assert_eq!(CompressionScheme::None.to_string(), "none");
    }
}
