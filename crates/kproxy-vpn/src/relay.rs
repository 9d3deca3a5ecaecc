//! Packet Relay
//!
//! Moves raw IP packets between the virtual interface and the UDP tunnel
//! socket. Each iteration reads one outbound packet from the interface and
//! sends it, then receives one inbound datagram and writes it back.
//! Empty reads are skipped; any I/O error ends the run.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::trace;

/// Relay buffer size, the largest packet carried in either direction
pub const PACKET_SIZE: usize = 32767;

/// Relay counters, shared between the relay task and observers
#[derive(Debug, Default)]
pub struct RelayStats {
    packets_out: AtomicU64,
    bytes_out: AtomicU64,
    packets_in: AtomicU64,
    bytes_in: AtomicU64,
    attempts: AtomicU64,
}

impl RelayStats {
    fn record_out(&self, bytes: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_in(&self, bytes: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySnapshot {
    /// Packets sent from the interface into the tunnel
    pub packets_out: u64,
    pub bytes_out: u64,
    /// Packets received from the tunnel into the interface
    pub packets_in: u64,
    pub bytes_in: u64,
    /// Relay runs started (first socket plus every reconnect)
    pub attempts: u64,
}

impl fmt::Display for RelaySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TX: {:.2}MB ({} pkts), RX: {:.2}MB ({} pkts), attempts: {}",
            self.bytes_out as f64 / (1024.0 * 1024.0),
            self.packets_out,
            self.bytes_in as f64 / (1024.0 * 1024.0),
            self.packets_in,
            self.attempts
        )
    }
}

/// Strictly alternating interface <-> socket pump
pub struct TunnelRelay {
    buffer: Box<[u8]>,
    stats: Arc<RelayStats>,
}

impl TunnelRelay {
    pub fn new(stats: Arc<RelayStats>) -> Self {
        Self {
            buffer: vec![0u8; PACKET_SIZE].into_boxed_slice(),
            stats,
        }
    }

    /// Relay until `should_continue` returns false or an I/O error occurs
    ///
    /// `should_continue` is checked at the top of every iteration.
    pub async fn run<I, F>(&mut self, interface: &mut I, socket: &UdpSocket, should_continue: F) -> io::Result<()>
    where
        I: AsyncRead + AsyncWrite + Unpin + ?Sized,
        F: Fn() -> bool,
    {
        while should_continue() {
            let n = interface.read(&mut self.buffer).await?;
            if n > 0 {
                let sent = socket.send(&self.buffer[..n]).await?;
                if sent != n {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short datagram send: {} of {} bytes", sent, n),
                    ));
                }
                self.stats.record_out(n);
                trace!("interface -> tunnel: {} bytes", n);
            }

            let n = socket.recv(&mut self.buffer).await?;
            if n > 0 {
                interface.write_all(&self.buffer[..n]).await?;
                interface.flush().await?;
                self.stats.record_in(n);
                trace!("tunnel -> interface: {} bytes", n);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    async fn socket_pair() -> (UdpSocket, UdpSocket) {
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        relay.connect(peer.local_addr().unwrap()).await.unwrap();
        peer.connect(relay.local_addr().unwrap()).await.unwrap();
        (relay, peer)
    }

    /// Interface whose reads follow a script and whose writes are recorded
    struct ScriptedInterface {
        reads: VecDeque<io::Result<Vec<u8>>>,
        written: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl AsyncRead for ScriptedInterface {
        fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            match self.reads.pop_front() {
                Some(Ok(packet)) => {
                    buf.put_slice(&packet);
                    Poll::Ready(Ok(()))
                }
                Some(Err(e)) => Poll::Ready(Err(e)),
                None => Poll::Pending,
            }
        }
    }

    impl AsyncWrite for ScriptedInterface {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            self.written.lock().unwrap().push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (socket, peer) = socket_pair().await;
        let (mut interface, mut host) = tokio::io::duplex(64 * 1024);
        let stats = Arc::new(RelayStats::default());

        let relay_stats = stats.clone();
        let task = tokio::spawn(async move {
            let mut relay = TunnelRelay::new(relay_stats);
            relay.run(&mut interface, &socket, || true).await
        });

        let outbound = vec![0x45u8; PACKET_SIZE];
        host.write_all(&outbound).await.unwrap();
        let mut buf = vec![0u8; 65536];
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &outbound[..]);

        peer.send(b"inbound packet").await.unwrap();
        let mut inbound = [0u8; 14];
        host.read_exact(&mut inbound).await.unwrap();
        assert_eq!(&inbound, b"inbound packet");

        // A second outbound packet proves the previous iteration completed
        host.write_all(b"ping").await.unwrap();
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        task.abort();
        let snapshot = stats.snapshot();
        assert!(snapshot.packets_out >= 1);
        assert!(snapshot.bytes_out >= PACKET_SIZE as u64);
        assert_eq!(snapshot.packets_in, 1);
        assert_eq!(snapshot.bytes_in, 14);
    }

    #[tokio::test]
    async fn test_empty_read_does_not_stop_relay() {
        let (socket, peer) = socket_pair().await;
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut interface = ScriptedInterface {
            reads: VecDeque::from(vec![Ok(Vec::new()), Ok(b"second".to_vec())]),
            written: written.clone(),
        };

        // Inbound datagram for the first iteration's receive half
        peer.send(b"reply").await.unwrap();

        let task = tokio::spawn(async move {
            let mut relay = TunnelRelay::new(Arc::new(RelayStats::default()));
            relay.run(&mut interface, &socket, || true).await
        });

        let mut buf = [0u8; 64];
        let n = peer.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second");
        assert_eq!(written.lock().unwrap().as_slice(), &[b"reply".to_vec()]);

        task.abort();
    }

    #[tokio::test]
    async fn test_io_error_ends_run() {
        let (socket, _peer) = socket_pair().await;
        let mut interface = ScriptedInterface {
            reads: VecDeque::from(vec![Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))]),
            written: Arc::new(Mutex::new(Vec::new())),
        };

        let mut relay = TunnelRelay::new(Arc::new(RelayStats::default()));
        let err = relay.run(&mut interface, &socket, || true).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_stop_flag_checked_before_io() {
        let (socket, _peer) = socket_pair().await;
        let mut interface = ScriptedInterface {
            reads: VecDeque::new(),
            written: Arc::new(Mutex::new(Vec::new())),
        };

        let mut relay = TunnelRelay::new(Arc::new(RelayStats::default()));
        assert!(relay.run(&mut interface, &socket, || false).await.is_ok());
    }

    #[test]
    fn test_snapshot_format() {
        let snapshot = RelaySnapshot {
            packets_out: 2,
            bytes_out: 1024 * 1024,
            packets_in: 1,
            bytes_in: 0,
            attempts: 1,
        };
        assert_eq!(snapshot.to_string(), "TX: 1.00MB (2 pkts), RX: 0.00MB (1 pkts), attempts: 1");
    }
}
