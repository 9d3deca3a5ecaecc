//! kproxy Network Layer
//!
//! HTTP/1.1 client that sends every request through one forward proxy.
//!
//! Architecture:
//! 1. Request comes in with URL
//! 2. Stream to the destination is opened through the proxy
//!    (HTTP `CONNECT`, SOCKS5, or absolute-form for plain HTTP)
//! 3. `https://` streams are wrapped in rustls, pinned if configured
//! 4. hyper drives the request; bodies can be buffered or streamed

mod client;
mod pinning;
mod proxy;

pub use client::{BodyStream, HttpClientConfig, HttpError, ProxyClient, Response};
pub use pinning::{CertificatePin, PinError, PinnedVerifier, tls_config, webpki_roots};
pub use proxy::{Credentials, ProxyEndpoint, ProxyKind, http_connect, socks5_connect};
