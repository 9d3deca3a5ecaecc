//! Proxy Connection Manager
//!
//! Owns everything that belongs to one proxy connection: the validated
//! configuration, the proxy-routed HTTP client, and the tunnel session.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut manager = ProxyConnectionManager::new(platform, Settings::default());
//! manager.connect(ProxyConfiguration::new("203.0.113.10", 1080, ProxyType::Socks5)).await?;
//!
//! let ip = manager.get_current_ip().await?;
//! let speed = manager.measure_speed().await?;
//!
//! manager.disconnect().await?;
//! ```

use crate::config::{ConfigError, ProxyConfiguration, Settings};
use crate::platform::{PlatformError, VpnPlatform};
use crate::probe::{self, SpeedTestResult};
use crate::relay::RelaySnapshot;
use crate::session::{TunnelSession, TunnelTarget, open_tunnel_socket};
use kproxy_net::{HttpError, ProxyClient};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Proxy request failed: {0}")]
    Client(#[from] HttpError),

    #[error("Connection test failed: {0}")]
    Reachability(u16),

    #[error("Interface setup failed: {0}")]
    Setup(#[from] PlatformError),

    #[error("Could not resolve {0}")]
    Resolve(String),

    #[error("Tunnel socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("Speed test failed: {0}")]
    SpeedTest(String),

    #[error("Disconnect incomplete: {0}")]
    Teardown(String),
}

/// Build the proxy-routed HTTP client for `config`
pub fn build_client(config: &ProxyConfiguration, settings: &Settings) -> Result<ProxyClient, ConnectionError> {
    let endpoint = config.endpoint()?;
    Ok(ProxyClient::new(endpoint, settings.http.client_config())?)
}

/// Proxy Connection Manager
///
/// - Probes the proxy before bringing anything up
/// - Establishes the virtual interface and the protected tunnel socket
/// - Runs the relay in a background session
/// - Tears all of it down on disconnect
pub struct ProxyConnectionManager {
    /// Host capabilities
    platform: Arc<dyn VpnPlatform>,
    /// Runtime settings
    settings: Settings,
    /// Proxy-routed client (present only while connected)
    client: Option<Arc<ProxyClient>>,
    /// Last configuration passed to `connect`
    current: Option<ProxyConfiguration>,
    /// Relay session
    session: Option<TunnelSession>,
}

impl ProxyConnectionManager {
    pub fn new(platform: Arc<dyn VpnPlatform>, settings: Settings) -> Self {
        Self {
            platform,
            settings,
            client: None,
            current: None,
            session: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Configuration of the current (or last attempted) connection
    pub fn current_config(&self) -> Option<&ProxyConfiguration> {
        self.current.as_ref()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn relay_stats(&self) -> Option<RelaySnapshot> {
        self.session.as_ref().map(TunnelSession::stats)
    }

    /// Shared handle to the active client
    pub fn client(&self) -> Option<Arc<ProxyClient>> {
        self.client.clone()
    }

    /// Connect through `config`
    ///
    /// Any previous connection is torn down first. The proxy must answer
    /// the IP-check URL with 2xx before the interface is established; on
    /// any failure nothing stays open.
    pub async fn connect(&mut self, config: ProxyConfiguration) -> Result<(), ConnectionError> {
        if self.session.is_some() || self.client.is_some() {
            if let Err(e) = self.teardown().await {
                warn!("Previous connection did not close cleanly: {}", e);
            }
        }

        info!("Connecting via {}", config);
        self.current = Some(config.clone());

        let client = build_client(&config, &self.settings)?;
        match self.activate(&config, &client).await {
            Ok(session) => {
                self.session = Some(session);
                self.client = Some(Arc::new(client));
                info!("Connected via {}", config);
                Ok(())
            }
            Err(e) => {
                error!("Connection via {} failed: {}", config, e);
                client.close().await;
                Err(e)
            }
        }
    }

    async fn activate(&self, config: &ProxyConfiguration, client: &ProxyClient) -> Result<TunnelSession, ConnectionError> {
        probe::check_reachability(client, &self.settings.endpoints.ip_check_url).await?;
        debug!("Proxy reachable");

        let interface = self.platform.establish(&self.settings.interface)?;
        let target = TunnelTarget::from(config);
        let socket = open_tunnel_socket(&target, self.platform.as_ref()).await?;

        Ok(TunnelSession::start(
            interface,
            socket,
            target,
            self.platform.clone(),
            self.settings.relay.clone(),
        ))
    }

    /// Body of the IP-check URL, fetched through the proxy
    pub async fn get_current_ip(&self) -> Result<String, ConnectionError> {
        let client = self.client.as_ref().ok_or(ConnectionError::NotConnected)?;
        probe::check_reachability(client, &self.settings.endpoints.ip_check_url).await
    }

    /// Download the speed-test URL through the proxy
    pub async fn measure_speed(&self) -> Result<SpeedTestResult, ConnectionError> {
        let client = self.client.as_ref().ok_or(ConnectionError::NotConnected)?;
        probe::measure_speed(client, &self.settings.endpoints.speed_test_url).await
    }

    /// Live probe: true when the IP-check URL currently answers 2xx
    pub async fn is_connected(&self) -> bool {
        self.get_current_ip().await.is_ok()
    }

    /// Tear down the connection
    ///
    /// Safe to call at any time. State is always cleared; an error only
    /// reports that some part did not close cleanly.
    pub async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        if self.session.is_none() && self.client.is_none() && self.current.is_none() {
            debug!("Disconnect requested with nothing to close");
            return Ok(());
        }

        info!("Disconnecting");
        let result = self.teardown().await;
        self.current = None;

        match &result {
            Ok(()) => info!("Disconnected"),
            Err(e) => warn!("Disconnected with errors: {}", e),
        }
        result
    }

    async fn teardown(&mut self) -> Result<(), ConnectionError> {
        let stopped = match self.session.take() {
            Some(session) => session.stop().await,
            None => Ok(()),
        };

        if let Some(client) = self.client.take() {
            client.close().await;
        }

        stopped
    }
}
