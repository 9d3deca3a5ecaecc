//! Platform Capabilities
//!
//! The host OS owns the virtual interface, socket protection and radio
//! control. These traits are the seam between the connection core and
//! whatever shell embeds it (mobile VPN service, desktop daemon, tests).

use crate::config::InterfaceConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;

/// Packet endpoint of an established virtual interface
///
/// One read yields one outbound IP packet; one write injects one
/// inbound packet. Dropping the value closes the interface.
pub trait VirtualInterface: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> VirtualInterface for T {}

/// Virtual interface and socket protection provided by the host
pub trait VpnPlatform: Send + Sync {
    /// Create the virtual interface with the given parameters
    fn establish(&self, config: &InterfaceConfig) -> Result<Box<dyn VirtualInterface>, PlatformError>;

    /// Exempt `socket` from the interface's routing so tunnel traffic
    /// does not loop back into it
    fn protect(&self, socket: &UdpSocket) -> Result<(), PlatformError>;
}

/// Radio and connectivity control used for IP rotation
pub trait NetworkControl: Send + Sync {
    /// Whether the app holds the permission to change network state
    fn has_change_network_permission(&self) -> bool;

    /// Ask the OS to bring up the cellular transport
    fn register_cellular_interest(&self) -> Result<(), PlatformError>;

    /// Withdraw the cellular transport request
    fn unregister_cellular_interest(&self) -> Result<(), PlatformError>;

    /// Whether Wi-Fi can be switched directly by the app
    fn can_toggle_wifi(&self) -> bool;

    fn set_wifi_enabled(&self, enabled: bool) -> Result<(), PlatformError>;

    /// Present the system connectivity panel to the user
    fn open_connectivity_settings(&self) -> Result<(), PlatformError>;
}

/// Platform errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlatformError {
    #[error("VPN permission not granted")]
    PermissionNotGranted,

    #[error("Failed to establish interface: {0}")]
    EstablishFailed(String),

    #[error("Failed to protect socket: {0}")]
    ProtectFailed(String),

    #[error("Network control failed: {0}")]
    Control(String),
}

#[cfg(unix)]
pub use tun::TunFd;

#[cfg(unix)]
mod tun {
    use std::io;
    use std::os::fd::{AsRawFd, OwnedFd, RawFd};
    use std::pin::Pin;
    use std::task::{Context, Poll, ready};
    use tokio::io::unix::AsyncFd;
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    /// Async wrapper around a TUN file descriptor handed over by the host
    ///
    /// The descriptor is switched to non-blocking mode and closed on drop.
    #[derive(Debug)]
    pub struct TunFd {
        inner: AsyncFd<OwnedFd>,
    }

    impl TunFd {
        pub fn new(fd: OwnedFd) -> io::Result<Self> {
            set_nonblocking(fd.as_raw_fd())?;
            Ok(Self {
                inner: AsyncFd::new(fd)?,
            })
        }
    }

    fn set_nonblocking(fd: RawFd) -> io::Result<()> {
        // SAFETY: fd is an open descriptor owned by the caller
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn check(n: isize) -> io::Result<usize> {
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    impl AsyncRead for TunFd {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            loop {
                let mut guard = ready!(self.inner.poll_read_ready(cx))?;
                let unfilled = buf.initialize_unfilled();

                let result = guard.try_io(|inner| {
                    // SAFETY: `unfilled` is valid for writes of its length
                    check(unsafe {
                        libc::read(
                            inner.get_ref().as_raw_fd(),
                            unfilled.as_mut_ptr().cast(),
                            unfilled.len(),
                        )
                    })
                });

                match result {
                    Ok(Ok(n)) => {
                        buf.advance(n);
                        return Poll::Ready(Ok(()));
                    }
                    Ok(Err(e)) => return Poll::Ready(Err(e)),
                    Err(_would_block) => continue,
                }
            }
        }
    }

    impl AsyncWrite for TunFd {
        fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            loop {
                let mut guard = ready!(self.inner.poll_write_ready(cx))?;

                let result = guard.try_io(|inner| {
                    // SAFETY: `buf` is valid for reads of its length
                    check(unsafe { libc::write(inner.get_ref().as_raw_fd(), buf.as_ptr().cast(), buf.len()) })
                });

                match result {
                    Ok(result) => return Poll::Ready(result),
                    Err(_would_block) => continue,
                }
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

}
