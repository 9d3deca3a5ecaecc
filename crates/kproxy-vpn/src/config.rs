//! Proxy and Runtime Configuration
//!
//! `ProxyConfiguration` describes one proxy endpoint and its credentials.
//! `Settings` holds everything else: endpoints used for checks, HTTP
//! timeouts, the virtual interface parameters, relay retry policy and
//! rotation delays. Both load from TOML.

use kproxy_net::{CertificatePin, Credentials, HttpClientConfig, PinError, ProxyEndpoint, ProxyKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Proxy protocol selected by the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProxyType {
    #[default]
    Http,
    Socks5,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Http => "HTTP",
            ProxyType::Socks5 => "SOCKS5",
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProxyType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "HTTP" => Ok(ProxyType::Http),
            "SOCKS5" => Ok(ProxyType::Socks5),
            _ => Err(ConfigError::InvalidProxyType(s.to_string())),
        }
    }
}

impl From<ProxyType> for ProxyKind {
    fn from(value: ProxyType) -> Self {
        match value {
            ProxyType::Http => ProxyKind::Http,
            ProxyType::Socks5 => ProxyKind::Socks5,
        }
    }
}

/// One proxy endpoint plus credentials
///
/// Built by the UI on submit and owned for one connection session.
/// A reconnect replaces it with a new value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfiguration {
    /// Proxy host name or address
    pub host: String,
    /// Proxy port (1-65535)
    pub port: u16,
    /// Proxy protocol
    #[serde(rename = "type", default)]
    pub proxy_type: ProxyType,
    /// Username (used only together with `password`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password (used only together with `username`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// SHA-256 certificate pin for `host`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_fingerprint: Option<String>,
}

impl ProxyConfiguration {
    /// Create a configuration without credentials
    pub fn new(host: impl Into<String>, port: u16, proxy_type: ProxyType) -> Self {
        Self {
            host: host.into(),
            port,
            proxy_type,
            username: None,
            password: None,
            certificate_fingerprint: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_certificate_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.certificate_fingerprint = Some(fingerprint.into());
        self
    }

    /// Credentials, only when both username and password are present
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some(Credentials::new(user.clone(), pass.clone())),
            _ => None,
        }
    }

    /// Parsed certificate pin, if one is configured
    pub fn certificate_pin(&self) -> Result<Option<CertificatePin>, ConfigError> {
        self.certificate_fingerprint
            .as_deref()
            .map(CertificatePin::parse)
            .transpose()
            .map_err(ConfigError::InvalidFingerprint)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidHost);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        self.certificate_pin()?;
        Ok(())
    }

    /// Proxy endpoint for the HTTP client
    pub fn endpoint(&self) -> Result<ProxyEndpoint, ConfigError> {
        self.validate()?;

        let mut endpoint = ProxyEndpoint::new(self.host.trim(), self.port, self.proxy_type.into());
        if let Some(credentials) = self.credentials() {
            endpoint = endpoint.with_credentials(credentials);
        }
        if let Some(pin) = self.certificate_pin()? {
            endpoint = endpoint.with_pin(pin);
        }
        Ok(endpoint)
    }
}

impl fmt::Debug for ProxyConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfiguration")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("proxy_type", &self.proxy_type)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .field("certificate_fingerprint", &self.certificate_fingerprint)
            .finish()
    }
}

impl fmt::Display for ProxyConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.proxy_type, self.host, self.port)
    }
}

/// Endpoints used for checks through the proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Reachability probe / current IP (JSON body with the caller's IP)
    pub ip_check_url: String,
    /// Fixed-size download for throughput measurement
    pub speed_test_url: String,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            ip_check_url: "https://api.ipify.org?format=json".to_string(),
            speed_test_url: "https://speed.cloudflare.com/__down?bytes=25000000".to_string(),
        }
    }
}

/// HTTP client timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            read_timeout_secs: 30,
            user_agent: None,
        }
    }
}

impl HttpSettings {
    pub fn client_config(&self) -> HttpClientConfig {
        let mut config = HttpClientConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            ..HttpClientConfig::default()
        };
        if let Some(ua) = &self.user_agent {
            config.user_agent = ua.clone();
        }
        config
    }
}

/// Virtual interface parameters handed to the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    /// Interface address
    pub address: Ipv4Addr,
    /// Interface prefix length
    pub prefix_len: u8,
    /// Route destination (0.0.0.0/0 = all traffic)
    pub route: Ipv4Addr,
    /// Route prefix length
    pub route_prefix_len: u8,
    /// DNS server pushed to the interface
    pub dns: IpAddr,
    /// Maximum transmission unit
    pub mtu: u16,
    /// Session label shown by the platform
    pub session_name: String,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(10, 0, 0, 2),
            prefix_len: 32,
            route: Ipv4Addr::UNSPECIFIED,
            route_prefix_len: 0,
            dns: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            mtu: 1500,
            session_name: "ProxyVPN".to_string(),
        }
    }
}

/// Relay recovery policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Wait between relay attempts
    pub retry_backoff_secs: u64,
    /// Give up after this many consecutive failures (unbounded when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            retry_backoff_secs: 5,
            max_retries: None,
        }
    }
}

impl RelaySettings {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

/// Shortest time transports stay disabled during rotation
pub const MIN_DISABLE_HOLD_MS: u64 = 1000;
/// Shortest wait after transports are re-enabled
pub const MIN_SETTLE_MS: u64 = 2000;

/// IP rotation delays
///
/// Values below the minimums are rejected by [`Settings::validate`] and
/// raised to the minimum when used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    /// Time transports stay disabled
    pub disable_hold_ms: u64,
    /// Time allowed for transports to come back before returning
    pub settle_ms: u64,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            disable_hold_ms: MIN_DISABLE_HOLD_MS,
            settle_ms: MIN_SETTLE_MS,
        }
    }
}

impl RotationSettings {
    pub fn disable_hold(&self) -> Duration {
        Duration::from_millis(self.disable_hold_ms.max(MIN_DISABLE_HOLD_MS))
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms.max(MIN_SETTLE_MS))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.disable_hold_ms < MIN_DISABLE_HOLD_MS {
            return Err(ConfigError::InvalidRotation(format!(
                "disable_hold_ms {} below minimum {}",
                self.disable_hold_ms, MIN_DISABLE_HOLD_MS
            )));
        }
        if self.settle_ms < MIN_SETTLE_MS {
            return Err(ConfigError::InvalidRotation(format!(
                "settle_ms {} below minimum {}",
                self.settle_ms, MIN_SETTLE_MS
            )));
        }
        Ok(())
    }
}

/// Complete runtime settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub endpoints: EndpointSettings,
    pub http: HttpSettings,
    pub interface: InterfaceConfig,
    pub relay: RelaySettings,
    pub rotation: RotationSettings,
}

impl Settings {
    /// Parse settings from TOML text
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.prefix_len > 32 || self.interface.route_prefix_len > 32 {
            return Err(ConfigError::InvalidInterface("prefix length above 32".into()));
        }
        if self.interface.mtu < 576 {
            return Err(ConfigError::InvalidInterface(format!(
                "MTU {} below IPv4 minimum 576",
                self.interface.mtu
            )));
        }
        if self.endpoints.ip_check_url.is_empty() || self.endpoints.speed_test_url.is_empty() {
            return Err(ConfigError::Parse("check endpoints must not be empty".into()));
        }
        self.rotation.validate()
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Proxy host must not be empty")]
    InvalidHost,

    #[error("Invalid proxy port (expected 1-65535)")]
    InvalidPort,

    #[error("Unknown proxy type: {0} (expected HTTP or SOCKS5)")]
    InvalidProxyType(String),

    #[error("Invalid certificate fingerprint: {0}")]
    InvalidFingerprint(#[from] PinError),

    #[error("Invalid interface configuration: {0}")]
    InvalidInterface(String),

    #[error("Invalid rotation timing: {0}")]
    InvalidRotation(String),

    #[error("Failed to read configuration: {0}")]
    Io(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}
