//! Tunnel Session
//!
//! Owns the virtual interface and the background relay task for one
//! connection. If the relay fails while the session is running, a fresh
//! protected UDP socket is opened after a backoff and relaying resumes on
//! the same interface.

use crate::config::{ProxyConfiguration, RelaySettings};
use crate::manager::ConnectionError;
use crate::platform::{VirtualInterface, VpnPlatform};
use crate::relay::{RelaySnapshot, RelayStats, TunnelRelay};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// UDP destination of the tunnel (the proxy's host and port)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
}

impl From<&ProxyConfiguration> for TunnelTarget {
    fn from(config: &ProxyConfiguration) -> Self {
        Self {
            host: config.host.trim().to_string(),
            port: config.port,
        }
    }
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Open a UDP socket connected to `target` and protect it from the interface
pub async fn open_tunnel_socket(target: &TunnelTarget, platform: &dyn VpnPlatform) -> Result<UdpSocket, ConnectionError> {
    let addr = tokio::net::lookup_host((target.host.as_str(), target.port))
        .await?
        .next()
        .ok_or_else(|| ConnectionError::Resolve(target.host.clone()))?;

    let local: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    platform.protect(&socket)?;

    debug!("Tunnel socket {} -> {}", socket.local_addr()?, addr);
    Ok(socket)
}

/// Running relay for one connection
pub struct TunnelSession {
    running: Arc<AtomicBool>,
    stats: Arc<RelayStats>,
    task: Option<JoinHandle<()>>,
}

impl TunnelSession {
    /// Start relaying between `interface` and `socket`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        interface: Box<dyn VirtualInterface>,
        socket: UdpSocket,
        target: TunnelTarget,
        platform: Arc<dyn VpnPlatform>,
        settings: RelaySettings,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(RelayStats::default());

        info!("Tunnel session started (target: {})", target);
        let task = tokio::spawn(relay_loop(
            interface,
            socket,
            target,
            platform,
            settings,
            running.clone(),
            stats.clone(),
        ));

        Self {
            running,
            stats,
            task: Some(task),
        }
    }

    /// Whether the relay task is still alive
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed) && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn stats(&self) -> RelaySnapshot {
        self.stats.snapshot()
    }

    /// Stop relaying and release the interface and socket
    ///
    /// Waits for the relay task to wind down so every descriptor it held
    /// is closed on return.
    pub async fn stop(mut self) -> Result<(), ConnectionError> {
        self.running.store(false, Ordering::Relaxed);

        let Some(task) = self.task.take() else {
            return Ok(());
        };

        task.abort();
        let result = match task.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(ConnectionError::Teardown(format!("relay task failed: {}", e))),
        };

        info!("Tunnel session stopped ({})", self.stats.snapshot());
        result
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn relay_loop(
    mut interface: Box<dyn VirtualInterface>,
    first_socket: UdpSocket,
    target: TunnelTarget,
    platform: Arc<dyn VpnPlatform>,
    settings: RelaySettings,
    running: Arc<AtomicBool>,
    stats: Arc<RelayStats>,
) {
    let mut relay = TunnelRelay::new(stats.clone());
    let mut pending = Some(first_socket);
    let mut failures: u32 = 0;

    while running.load(Ordering::Relaxed) {
        let socket = match pending.take() {
            Some(socket) => Ok(socket),
            None => open_tunnel_socket(&target, platform.as_ref()).await,
        };

        let result = match socket {
            Ok(socket) => {
                stats.record_attempt();
                relay
                    .run(&mut interface, &socket, || running.load(Ordering::Relaxed))
                    .await
                    .map_err(ConnectionError::from)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => break,
            Err(e) if !running.load(Ordering::Relaxed) => {
                debug!("Relay ended during shutdown: {}", e);
                break;
            }
            Err(e) => {
                failures += 1;
                if settings.max_retries.is_some_and(|max| failures > max) {
                    error!("Relay failed {} times, giving up: {}", failures, e);
                    break;
                }
                warn!(
                    "Relay error (failure {}): {}; reconnecting in {:?}",
                    failures,
                    e,
                    settings.backoff()
                );
                tokio::time::sleep(settings.backoff()).await;
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    debug!("Relay task finished");
}
