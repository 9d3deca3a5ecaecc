//! kproxy VPN - Device-wide Proxy Tunnel
//!
//! Routes device traffic through a user-supplied HTTP or SOCKS5 proxy.
//! The proxy is probed first; only then is a virtual interface established
//! and its packets relayed over a protected UDP socket to the proxy host.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      ConnectionStateMachine              │
//! │   connect / rotate IP / disconnect ──▶ observable state  │
//! │                                                          │
//! │  ┌───────────────────────────┐      ┌─────────────────┐  │
//! │  │  ProxyConnectionManager   │      │ NetworkRotator  │  │
//! │  │  ┌─────────────┐          │      │ (cellular/Wi-Fi │  │
//! │  │  │ ProxyClient │─ probe ──┼──┐   │   cycling)      │  │
//! │  │  └─────────────┘          │  │   └─────────────────┘  │
//! │  │  ┌─────────────────────┐  │  │                        │
//! │  │  │ TunnelSession       │  │  │                        │
//! │  │  │ interface ⇄ UDP     │──┼──┼──────┐                 │
//! │  │  └─────────────────────┘  │  │      │                 │
//! │  └───────────────────────────┘  │      │                 │
//! └─────────────────────────────────│──────│─────────────────┘
//!                                   ▼ TCP  ▼ UDP
//!                            ┌──────────────────────┐
//!                            │  HTTP / SOCKS5 proxy │
//!                            └──────────────────────┘
//! ```
//!
//! # Platform
//!
//! The host supplies the virtual interface, socket protection and radio
//! control through [`VpnPlatform`] and [`NetworkControl`].

mod config;
mod manager;
mod platform;
mod probe;
mod relay;
mod rotator;
mod session;
mod state;

#[cfg(test)]
mod testing;

pub use config::{
    ConfigError, EndpointSettings, HttpSettings, InterfaceConfig, ProxyConfiguration, ProxyType,
    RelaySettings, RotationSettings, Settings,
};
pub use manager::{ConnectionError, ProxyConnectionManager, build_client};
pub use platform::{NetworkControl, PlatformError, VirtualInterface, VpnPlatform};
#[cfg(unix)]
pub use platform::TunFd;
pub use probe::{SpeedTestResult, check_reachability, measure_speed, parse_ip};
pub use relay::{PACKET_SIZE, RelaySnapshot, RelayStats, TunnelRelay};
pub use rotator::{NetworkRotator, RotationError};
pub use session::{TunnelSession, TunnelTarget, open_tunnel_socket};
pub use state::{ConnectionEvent, ConnectionState, ConnectionStateMachine, StateError};
