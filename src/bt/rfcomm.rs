//! RFCOMM session substrate (component B).
//!
//! Grounded in `bluer::rfcomm::Socket`/`Stream` (raw `AF_BLUETOOTH`/
//! `BTPROTO_RFCOMM` socket wrapped in `tokio::io::unix::AsyncFd`, with
//! `TIOCINQ`/`TIOCOUTQ` ioctls exposed as `input_buffer`/`output_buffer`).
//! The actual byte stream is abstracted behind [`Transport`] so that test
//! harnesses can substitute a `tokio::io::duplex` pair in place of a real
//! socket (§10.6) — production code never downcasts it.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::device::BdAddr;
use crate::errors::{Error, Result, TransportError};

/// Linux `bluetooth.h` constants; not exposed by the `libc` crate, so
/// pinned here the way `bluer`'s own `sys` module does.
mod linux_bt {
    pub const AF_BLUETOOTH: libc::c_int = 31;
    pub const BTPROTO_RFCOMM: libc::c_int = 3;
}

/// `bluetooth/rfcomm.h`'s `sockaddr_rc`, pinned by hand the way `bluer`'s
/// `sys` module does since `libc` only ships the generic address families.
#[repr(C)]
struct SockaddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: [u8; 6],
    rc_channel: u8,
}

/// BlueZ's `bdaddr_t` stores its six octets in reverse of the
/// colon-hex display order (`AA:BB:CC:DD:EE:FF` displays MSB-first,
/// `bdaddr_t` is LSB-first), matching `bluer::Address`'s wire form.
fn bdaddr_t(addr: BdAddr) -> [u8; 6] {
    let mut octets = addr.octets();
    octets.reverse();
    octets
}

/// Byte stream abstraction the AT command queue and session state
/// machine are built against. Implemented by [`RfcommStream`] for
/// production use; tests implement it via `tokio::io::duplex`.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// An RFCOMM `[addr]:channel` socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfcommAddr {
    pub addr: BdAddr,
    pub channel: u8,
}

/// A connected RFCOMM byte stream, backed by a raw nonblocking socket.
pub struct RfcommStream {
    fd: AsyncFd<std::os::fd::OwnedFd>,
}

impl RfcommStream {
    fn raw_socket() -> io::Result<std::os::fd::OwnedFd> {
        use std::os::fd::FromRawFd;

        let raw = unsafe {
            libc::socket(
                linux_bt::AF_BLUETOOTH,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                linux_bt::BTPROTO_RFCOMM,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { std::os::fd::OwnedFd::from_raw_fd(raw) })
    }

    /// Binds to any local adapter address/channel, the same `bind(any)`
    /// step `bluer::rfcomm::Stream::connect` performs before `connect(2)`.
    fn bind_any(raw: RawFd) -> io::Result<()> {
        let sa = SockaddrRc {
            rc_family: linux_bt::AF_BLUETOOTH as libc::sa_family_t,
            rc_bdaddr: [0; 6],
            rc_channel: 0,
        };
        let ret = unsafe {
            libc::bind(
                raw,
                &sa as *const SockaddrRc as *const libc::sockaddr,
                std::mem::size_of::<SockaddrRc>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Connects to `peer`'s RFCOMM channel (§4.1). `connect(2)` on a
    /// nonblocking socket returns `EINPROGRESS`; completion is then
    /// observed through writability readiness, followed by an
    /// `SO_ERROR` check, matching the same pattern the SCO endpoint
    /// uses (§4.6).
    pub async fn connect(peer: RfcommAddr) -> Result<Self> {
        let owned = Self::raw_socket().map_err(|e| Error::Transport(TransportError::SyscallError(e)))?;
        let raw = owned.as_raw_fd();
        Self::bind_any(raw).map_err(|e| Error::Transport(TransportError::SyscallError(e)))?;

        let sa = SockaddrRc {
            rc_family: linux_bt::AF_BLUETOOTH as libc::sa_family_t,
            rc_bdaddr: bdaddr_t(peer.addr),
            rc_channel: peer.channel,
        };
        let ret = unsafe {
            libc::connect(
                raw,
                &sa as *const SockaddrRc as *const libc::sockaddr,
                std::mem::size_of::<SockaddrRc>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(Error::Transport(TransportError::SyscallError(err)));
            }
        }

        let fd = AsyncFd::new(owned).map_err(|e| Error::Transport(TransportError::SyscallError(e)))?;

        if ret < 0 {
            let mut guard = fd
                .writable()
                .await
                .map_err(|e| Error::Transport(TransportError::SyscallError(e)))?;

            match Self::so_error(fd.as_raw_fd()) {
                Ok(0) => {}
                Ok(errno) => {
                    return Err(Error::Transport(TransportError::SyscallError(
                        io::Error::from_raw_os_error(errno),
                    )))
                }
                Err(e) => return Err(Error::Transport(TransportError::SyscallError(e))),
            }
            guard.clear_ready();
        }

        Ok(Self { fd })
    }

    fn so_error(raw: RawFd) -> io::Result<i32> {
        let mut errno: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                raw,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut errno as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(errno)
    }

    /// Number of bytes queued for transmission but not yet acknowledged
    /// by the peer, via `TIOCOUTQ`.
    pub fn output_buffer(&self) -> io::Result<u32> {
        ioctl_read(self.fd.as_raw_fd(), libc::TIOCOUTQ as _)
    }

    /// Number of bytes received but not yet read, via `TIOCINQ`.
    pub fn input_buffer(&self) -> io::Result<u32> {
        ioctl_read(self.fd.as_raw_fd(), libc::TIOCINQ as _)
    }
}

fn ioctl_read(fd: RawFd, request: libc::c_ulong) -> io::Result<u32> {
    let mut value: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(fd, request, &mut value as *mut _) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value as u32)
}

impl AsyncRead for RfcommStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        loop {
            let mut guard = match self.fd.poll_read_ready(cx) {
                std::task::Poll::Ready(Ok(guard)) => guard,
                std::task::Poll::Ready(Err(e)) => return std::task::Poll::Ready(Err(e)),
                std::task::Poll::Pending => return std::task::Poll::Pending,
            };

            let unfilled = buf.initialize_unfilled();
            let raw = self.fd.as_raw_fd();
            let n = unsafe { libc::read(raw, unfilled.as_mut_ptr() as *mut _, unfilled.len()) };
            if n >= 0 {
                buf.advance(n as usize);
                return std::task::Poll::Ready(Ok(()));
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                guard.clear_ready();
                continue;
            }
            return std::task::Poll::Ready(Err(err));
        }
    }
}

impl AsyncWrite for RfcommStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        loop {
            let mut guard = match self.fd.poll_write_ready(cx) {
                std::task::Poll::Ready(Ok(guard)) => guard,
                std::task::Poll::Ready(Err(e)) => return std::task::Poll::Ready(Err(e)),
                std::task::Poll::Pending => return std::task::Poll::Pending,
            };

            let raw = self.fd.as_raw_fd();
            let n = unsafe { libc::write(raw, buf.as_ptr() as *const _, buf.len()) };
            if n >= 0 {
                return std::task::Poll::Ready(Ok(n as usize));
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                guard.clear_ready();
                continue;
            }
            return std::task::Poll::Ready(Err(err));
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        let raw = self.fd.as_raw_fd();
        let ret = unsafe { libc::shutdown(raw, libc::SHUT_RDWR) };
        if ret < 0 {
            return std::task::Poll::Ready(Err(io::Error::last_os_error()));
        }
        std::task::Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfcomm_addr_equality() {
        let a = RfcommAddr {
            addr: BdAddr::zero(),
            channel: 1,
        };
        let b = RfcommAddr {
            addr: BdAddr::zero(),
            channel: 1,
        };
        assert_eq!(a, b);
    }
}
