//! Test doubles shared by the unit tests

use crate::config::{EndpointSettings, InterfaceConfig, ProxyConfiguration, ProxyType, Settings};
use crate::platform::{NetworkControl, PlatformError, VirtualInterface, VpnPlatform};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::Instant;

pub(crate) const IP_CHECK_URL: &str = "http://ip.test/?format=json";
pub(crate) const SPEED_TEST_URL: &str = "http://speed.test/__down?bytes=65536";
const SPEED_BYTES: usize = 64 * 1024;

pub(crate) fn test_settings() -> Settings {
    Settings {
        endpoints: EndpointSettings {
            ip_check_url: IP_CHECK_URL.to_string(),
            speed_test_url: SPEED_TEST_URL.to_string(),
        },
        ..Settings::default()
    }
}

struct ProxyState {
    ip_status: AtomicU16,
    ip_body: Mutex<String>,
    ip_requests: AtomicUsize,
    /// IP checks answered normally before switching to 503
    ip_budget: AtomicUsize,
}

/// Plain HTTP forward proxy answering the IP-check and speed-test URLs
pub(crate) struct FakeProxy {
    pub addr: SocketAddr,
    state: Arc<ProxyState>,
}

impl FakeProxy {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ProxyState {
            ip_status: AtomicU16::new(200),
            ip_body: Mutex::new(r#"{"ip":"203.0.113.7"}"#.to_string()),
            ip_requests: AtomicUsize::new(0),
            ip_budget: AtomicUsize::new(usize::MAX),
        });

        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, shared.clone()));
            }
        });

        Self { addr, state }
    }

    pub fn config(&self) -> ProxyConfiguration {
        ProxyConfiguration::new("127.0.0.1", self.addr.port(), ProxyType::Http)
    }

    pub fn set_ip_status(&self, status: u16) {
        self.state.ip_status.store(status, Ordering::Relaxed);
    }

    /// Answer the first `n` IP checks as usual, then 503
    pub fn fail_ip_checks_after(&self, n: usize) {
        self.state.ip_budget.store(n, Ordering::Relaxed);
    }

    pub fn set_ip_body(&self, body: &str) {
        *self.state.ip_body.lock().unwrap() = body.to_string();
    }

    pub fn ip_body(&self) -> String {
        self.state.ip_body.lock().unwrap().clone()
    }

    pub fn speed_bytes(&self) -> usize {
        SPEED_BYTES
    }
}

async fn serve(mut stream: TcpStream, state: Arc<ProxyState>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return,
            Ok(_) => head.push(byte[0]),
        }
    }
    let head = String::from_utf8_lossy(&head);

    let (status, body) = if head.starts_with("GET http://speed.test/") {
        (200, vec![b'x'; SPEED_BYTES])
    } else {
        let body = state.ip_body.lock().unwrap().clone();
        let served = state.ip_requests.fetch_add(1, Ordering::Relaxed);
        let status = if served >= state.ip_budget.load(Ordering::Relaxed) {
            503
        } else {
            state.ip_status.load(Ordering::Relaxed)
        };
        (status, body.into_bytes())
    };

    let response = format!(
        "HTTP/1.1 {} Test\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.write_all(&body).await;
    let _ = stream.flush().await;
}

/// Platform handing out in-memory interfaces
#[derive(Default)]
pub(crate) struct MockPlatform {
    hosts: Mutex<Vec<DuplexStream>>,
    establish_calls: AtomicUsize,
    protect_calls: AtomicUsize,
    deny_establish: AtomicBool,
    fail_protect: AtomicBool,
    panic_on_read: AtomicBool,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn establish_calls(&self) -> usize {
        self.establish_calls.load(Ordering::Relaxed)
    }

    pub fn protect_calls(&self) -> usize {
        self.protect_calls.load(Ordering::Relaxed)
    }

    pub fn deny_establish(&self) {
        self.deny_establish.store(true, Ordering::Relaxed);
    }

    /// Hand out interfaces whose first read panics the relay task
    pub fn panic_on_read(&self) {
        self.panic_on_read.store(true, Ordering::Relaxed);
    }

    pub fn fail_protect(&self) {
        self.fail_protect.store(true, Ordering::Relaxed);
    }

    /// Host side of the most recently established interface
    pub fn take_host(&self) -> DuplexStream {
        self.hosts.lock().unwrap().pop().unwrap()
    }
}

impl VpnPlatform for MockPlatform {
    fn establish(&self, _config: &InterfaceConfig) -> Result<Box<dyn VirtualInterface>, PlatformError> {
        self.establish_calls.fetch_add(1, Ordering::Relaxed);
        if self.deny_establish.load(Ordering::Relaxed) {
            return Err(PlatformError::PermissionNotGranted);
        }
        if self.panic_on_read.load(Ordering::Relaxed) {
            return Ok(Box::new(PanickingInterface));
        }

        let (interface, host) = tokio::io::duplex(64 * 1024);
        self.hosts.lock().unwrap().push(host);
        Ok(Box::new(interface))
    }

    fn protect(&self, _socket: &UdpSocket) -> Result<(), PlatformError> {
        self.protect_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_protect.load(Ordering::Relaxed) {
            return Err(PlatformError::ProtectFailed("mock".into()));
        }
        Ok(())
    }
}

struct PanickingInterface;

impl AsyncRead for PanickingInterface {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        panic!("interface read failed");
    }
}

impl AsyncWrite for PanickingInterface {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Network control that records every call with its (tokio) timestamp
pub(crate) struct MockControl {
    permission: AtomicBool,
    can_toggle_wifi: AtomicBool,
    fail_wifi: AtomicBool,
    calls: Mutex<Vec<(Instant, &'static str)>>,
}

impl MockControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            permission: AtomicBool::new(true),
            can_toggle_wifi: AtomicBool::new(true),
            fail_wifi: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn revoke_permission(&self) {
        self.permission.store(false, Ordering::Relaxed);
    }

    pub fn restrict_wifi(&self) {
        self.can_toggle_wifi.store(false, Ordering::Relaxed);
    }

    pub fn fail_wifi(&self) {
        self.fail_wifi.store(true, Ordering::Relaxed);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().iter().map(|(_, call)| *call).collect()
    }

    /// Time of the first call named `name`
    pub fn time_of(&self, name: &str) -> Instant {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|(_, call)| *call == name)
            .map(|(at, _)| *at)
            .unwrap()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push((Instant::now(), call));
    }
}

impl NetworkControl for MockControl {
    fn has_change_network_permission(&self) -> bool {
        self.permission.load(Ordering::Relaxed)
    }

    fn register_cellular_interest(&self) -> Result<(), PlatformError> {
        self.record("register_cellular");
        Ok(())
    }

    fn unregister_cellular_interest(&self) -> Result<(), PlatformError> {
        self.record("unregister_cellular");
        Ok(())
    }

    fn can_toggle_wifi(&self) -> bool {
        self.can_toggle_wifi.load(Ordering::Relaxed)
    }

    fn set_wifi_enabled(&self, enabled: bool) -> Result<(), PlatformError> {
        self.record(if enabled { "wifi_on" } else { "wifi_off" });
        if self.fail_wifi.load(Ordering::Relaxed) {
            return Err(PlatformError::Control("wifi toggle refused".into()));
        }
        Ok(())
    }

    fn open_connectivity_settings(&self) -> Result<(), PlatformError> {
        self.record("open_settings");
        Ok(())
    }
}
