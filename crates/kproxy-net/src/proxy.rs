//! Forward Proxy Handshakes
//!
//! Opens a byte stream to a destination through the configured proxy.
//!
//! # Protocol
//!
//! ```text
//! HTTP proxy:   TCP → CONNECT host:port (Proxy-Authorization) → 200 → bytes
//! SOCKS5 proxy: TCP → greeting → [RFC 1929 auth] → CONNECT → reply → bytes
//! ```
//!
//! Plain `http://` requests through an HTTP proxy skip the `CONNECT` step
//! and are sent to the proxy in absolute form instead (see the client).

use crate::client::HttpError;
use crate::pinning::CertificatePin;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use std::fmt;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_USER_PASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// RFC 1929 sub-negotiation version
const USER_PASS_VERSION: u8 = 0x01;

/// SOCKS5 commands
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 address types
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
const REPLY_SUCCESS: u8 = 0x00;

/// Upper bound for a CONNECT response head
const MAX_CONNECT_RESPONSE: usize = 8192;

/// Proxy protocol spoken to the upstream proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    /// HTTP proxy (`CONNECT` tunnels, absolute-form requests)
    Http,
    /// SOCKS5 proxy
    Socks5,
}

impl ProxyKind {
    /// URL scheme used for display
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyKind::Http => "http",
            ProxyKind::Socks5 => "socks5",
        }
    }
}

/// Proxy username and password
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `Basic <base64(username:password)>`, the `Proxy-Authorization` value
    pub fn basic_auth(&self) -> String {
        let token = BASE64.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {}", token)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// Upstream proxy the client routes every request through
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    /// Proxy host name or address
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Protocol spoken to the proxy
    pub kind: ProxyKind,
    /// Credentials, if the proxy requires authentication
    pub credentials: Option<Credentials>,
    /// Certificate pin for TLS sessions with `host`
    pub pin: Option<CertificatePin>,
}

impl ProxyEndpoint {
    /// Create an endpoint without credentials or pin
    pub fn new(host: impl Into<String>, port: u16, kind: ProxyKind) -> Self {
        Self {
            host: host.into(),
            port,
            kind,
            credentials: None,
            pin: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_pin(mut self, pin: CertificatePin) -> Self {
        self.pin = Some(pin);
        self
    }

    /// `host:port`, with IPv6 literals bracketed
    pub fn authority(&self) -> String {
        authority(&self.host, self.port)
    }

    /// `Proxy-Authorization` header value, when credentials are set
    pub fn proxy_authorization(&self) -> Option<String> {
        self.credentials.as_ref().map(Credentials::basic_auth)
    }

    /// Open a TCP connection to the proxy itself
    pub async fn connect_proxy(&self) -> Result<TcpStream, HttpError> {
        TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| HttpError::ConnectionFailed(format!("{}: {}", self.authority(), e)))
    }

    /// Open a byte stream to `target_host:target_port` through the proxy
    pub async fn connect(&self, target_host: &str, target_port: u16) -> Result<TcpStream, HttpError> {
        let mut stream = self.connect_proxy().await?;

        match self.kind {
            ProxyKind::Http => {
                let target = authority(target_host, target_port);
                http_connect(&mut stream, &target, self.proxy_authorization().as_deref()).await?;
            }
            ProxyKind::Socks5 => {
                socks5_connect(&mut stream, target_host, target_port, self.credentials.as_ref()).await?;
            }
        }

        debug!("Tunnel to {}:{} open via {}", target_host, target_port, self);
        Ok(stream)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind.scheme(), self.authority())
    }
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Establish an HTTP `CONNECT` tunnel on an open proxy connection
pub async fn http_connect<S>(
    stream: &mut S,
    target: &str,
    authorization: Option<&str>,
) -> Result<(), HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(value) = authorization {
        request.push_str(&format!("Proxy-Authorization: {value}\r\n"));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_response_head(stream).await?;
    let status = parse_status(&head)?;
    if !(200..300).contains(&status) {
        return Err(HttpError::ProxyRejected(status));
    }

    Ok(())
}

/// Read up to and including the blank line; never past it
async fn read_response_head<S>(stream: &mut S) -> Result<Vec<u8>, HttpError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            return Err(HttpError::ProxyProtocol("CONNECT response too large".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(HttpError::ProxyProtocol(
                "proxy closed the connection during CONNECT".into(),
            ));
        }
        head.push(byte[0]);
    }

    Ok(head)
}

fn parse_status(head: &[u8]) -> Result<u16, HttpError> {
    let text = String::from_utf8_lossy(head);
    let line = text.lines().next().unwrap_or_default();
    let mut parts = line.split_whitespace();

    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/1.") => code
            .parse()
            .map_err(|_| HttpError::ProxyProtocol(format!("malformed status line: {line}"))),
        _ => Err(HttpError::ProxyProtocol(format!("malformed status line: {line}"))),
    }
}

/// Run the SOCKS5 client handshake and `CONNECT` on an open proxy connection
pub async fn socks5_connect<S>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
    credentials: Option<&Credentials>,
) -> Result<(), HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ===== Method Negotiation =====

    let greeting: &[u8] = if credentials.is_some() {
        &[SOCKS5_VERSION, 2, AUTH_NO_AUTH, AUTH_USER_PASS]
    } else {
        &[SOCKS5_VERSION, 1, AUTH_NO_AUTH]
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(HttpError::ProxyProtocol("invalid SOCKS version".into()));
    }

    match (choice[1], credentials) {
        (AUTH_NO_AUTH, _) => {}
        (AUTH_USER_PASS, Some(creds)) => socks5_authenticate(stream, creds).await?,
        (AUTH_NO_ACCEPTABLE, _) => {
            return Err(HttpError::ProxyProtocol(
                "SOCKS proxy accepted none of the offered auth methods".into(),
            ));
        }
        (method, _) => {
            return Err(HttpError::ProxyProtocol(format!(
                "SOCKS proxy selected unsupported auth method {method:#04x}"
            )));
        }
    }

    // ===== Connection Request =====

    let mut request = Vec::with_capacity(7 + target_host.len());
    request.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00]);
    match target_host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ADDR_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ADDR_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(target_host.len()).map_err(|_| {
                HttpError::ProxyProtocol("destination host name too long for SOCKS5".into())
            })?;
            request.push(ADDR_DOMAIN);
            request.push(len);
            request.extend_from_slice(target_host.as_bytes());
        }
    }
    request.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&request).await?;

    // ===== Reply =====

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS5_VERSION {
        return Err(HttpError::ProxyProtocol("invalid SOCKS version in reply".into()));
    }
    if reply[1] != REPLY_SUCCESS {
        return Err(HttpError::ProxyProtocol(format!(
            "SOCKS CONNECT failed: {}",
            reply_message(reply[1])
        )));
    }

    // Bound address is not used, but must be drained
    let addr_len = match reply[3] {
        ADDR_IPV4 => 4,
        ADDR_IPV6 => 16,
        ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(HttpError::ProxyProtocol(format!(
                "invalid SOCKS address type {other:#04x}"
            )));
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

async fn socks5_authenticate<S>(stream: &mut S, credentials: &Credentials) -> Result<(), HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let username = credentials.username.as_bytes();
    let password = credentials.password.as_bytes();
    let (ulen, plen) = match (u8::try_from(username.len()), u8::try_from(password.len())) {
        (Ok(u), Ok(p)) => (u, p),
        _ => {
            return Err(HttpError::ProxyProtocol(
                "SOCKS credentials longer than 255 bytes".into(),
            ));
        }
    };

    let mut message = Vec::with_capacity(3 + username.len() + password.len());
    message.push(USER_PASS_VERSION);
    message.push(ulen);
    message.extend_from_slice(username);
    message.push(plen);
    message.extend_from_slice(password);
    stream.write_all(&message).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(HttpError::ProxyProtocol("SOCKS authentication rejected".into()));
    }

    Ok(())
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_basic_auth_encoding() {
        let creds = Credentials::new("user", "pass");
        assert_eq!(creds.basic_auth(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("alice", "hunter2");
        let shown = format!("{:?}", creds);
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_endpoint_display() {
        let http = ProxyEndpoint::new("proxy.example", 8080, ProxyKind::Http);
        assert_eq!(http.to_string(), "http://proxy.example:8080");

        let socks = ProxyEndpoint::new("::1", 1080, ProxyKind::Socks5);
        assert_eq!(socks.to_string(), "socks5://[::1]:1080");
    }

    #[test]
    fn test_proxy_authorization_requires_credentials() {
        let endpoint = ProxyEndpoint::new("proxy.example", 8080, ProxyKind::Http);
        assert!(endpoint.proxy_authorization().is_none());

        let endpoint = endpoint.with_credentials(Credentials::new("user", "pass"));
        assert_eq!(endpoint.proxy_authorization().as_deref(), Some("Basic dXNlcjpwYXNz"));
    }

    #[tokio::test]
    async fn test_http_connect_sends_authorization() {
        let (mut client, mut server) = duplex(4096);

        let proxy = tokio::spawn(async move {
            let head = read_response_head(&mut server).await.unwrap();
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8(head).unwrap()
        });

        http_connect(&mut client, "ip.test:443", Some("Basic dXNlcjpwYXNz"))
            .await
            .unwrap();

        let head = proxy.await.unwrap();
        assert!(head.starts_with("CONNECT ip.test:443 HTTP/1.1\r\n"));
        assert!(head.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn test_http_connect_rejected() {
        let (mut client, mut server) = duplex(4096);

        tokio::spawn(async move {
            let _ = read_response_head(&mut server).await;
            let _ = server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
        });

        let result = http_connect(&mut client, "ip.test:443", None).await;
        assert!(matches!(result, Err(HttpError::ProxyRejected(407))));
    }

    #[tokio::test]
    async fn test_socks5_connect_with_credentials() {
        let (mut client, mut server) = duplex(4096);

        let proxy = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [SOCKS5_VERSION, 2, AUTH_NO_AUTH, AUTH_USER_PASS]);
            server.write_all(&[SOCKS5_VERSION, AUTH_USER_PASS]).await.unwrap();

            let mut auth = [0u8; 11];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth, b"\x01\x04user\x04pass");
            server.write_all(&[USER_PASS_VERSION, 0x00]).await.unwrap();

            let mut request = [0u8; 5 + 7 + 2];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..5], &[SOCKS5_VERSION, CMD_CONNECT, 0x00, ADDR_DOMAIN, 7]);
            assert_eq!(&request[5..12], b"ip.test");
            assert_eq!(u16::from_be_bytes([request[12], request[13]]), 443);

            server
                .write_all(&[SOCKS5_VERSION, REPLY_SUCCESS, 0x00, ADDR_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let creds = Credentials::new("user", "pass");
        socks5_connect(&mut client, "ip.test", 443, Some(&creds))
            .await
            .unwrap();
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_socks5_connect_refused() {
        let (mut client, mut server) = duplex(4096);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await.unwrap();

            // IPv4 request: header(4) + addr(4) + port(2)
            let mut request = [0u8; 10];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(request[3], ADDR_IPV4);
            server
                .write_all(&[SOCKS5_VERSION, 0x05, 0x00, ADDR_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let result = socks5_connect(&mut client, "203.0.113.9", 80, None).await;
        match result {
            Err(HttpError::ProxyProtocol(msg)) => assert!(msg.contains("connection refused")),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
