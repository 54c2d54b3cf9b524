//! SCO audio endpoint (component E), §4.6.
//!
//! Grounded in `bluer`'s SCO socket plumbing and the same `AsyncFd`
//! pattern [`super::rfcomm::RfcommStream`] uses, adapted to a
//! packet-oriented `SOCK_SEQPACKET` socket instead of a byte stream.
//! The socket itself is driven by a small background task
//! ([`ScoDriver::run`]); [`ScoEndpoint`] is the synchronous handle the
//! pump (component F) sees, sharing ring buffers with the driver behind
//! a mutex the way the original's `SoundIoSco` shares a packet queue
//! with its HCI event callback.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use num_enum::TryFromPrimitive;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot};

use crate::audio::format::{Endpoint, EndpointProps, PcmFormat, QueueState};
use crate::device::BdAddr;
use crate::errors::{Error, Result, StreamError, TransportError};
use crate::hci::ScoHciConfig;

mod linux_bt {
    pub const AF_BLUETOOTH: libc::c_int = 31;
    pub const BTPROTO_SCO: libc::c_int = 2;
    pub const SOL_SCO: libc::c_int = 17;
    pub const SCO_OPTIONS: libc::c_int = 1;
}

/// `bluetooth/sco.h`'s `sockaddr_sco`; pinned by hand like `linux_bt`
/// above since `libc` doesn't carry Bluetooth address families.
#[repr(C)]
struct SockaddrSco {
    sco_family: libc::sa_family_t,
    sco_bdaddr: [u8; 6],
}

/// `bluetooth/sco.h`'s `struct sco_options`; only the leading `mtu`
/// field is read, but the struct is sized to match the kernel's layout
/// for the `getsockopt` call.
#[repr(C)]
#[derive(Default)]
struct ScoOptions {
    mtu: u16,
}

/// BlueZ's `bdaddr_t` is little-endian, the colon-hex display order is
/// MSB-first (§4.1's [`super::rfcomm`] uses the same convention).
fn bdaddr_t(addr: BdAddr) -> [u8; 6] {
    let mut octets = addr.octets();
    octets.reverse();
    octets
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ScoState {
    Idle = 0,
    SocketConnecting = 1,
    Connected = 2,
}

/// Which side of SCO teardown to suppress. Used when the link never
/// finished connecting (§8 scenario 6): the caller knows no audio ever
/// flowed, so it suppresses `async_stopped` since the async transfer
/// was never started, but still wants `audio_state_changed` to fire
/// with the RFCOMM disconnect reason.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseSuppress {
    pub audio_state_changed: bool,
    pub async_stopped: bool,
}

/// The SCO link's two one-shot teardown notifications. Each fires at
/// most once; a suppressed side is simply dropped, so its receiver
/// observes a closed channel rather than a value.
pub struct ScoTeardown {
    audio_state_changed: Option<oneshot::Sender<Option<String>>>,
    async_stopped: Option<oneshot::Sender<()>>,
}

impl ScoTeardown {
    fn new() -> (Self, oneshot::Receiver<Option<String>>, oneshot::Receiver<()>) {
        let (a_tx, a_rx) = oneshot::channel();
        let (s_tx, s_rx) = oneshot::channel();
        (
            Self {
                audio_state_changed: Some(a_tx),
                async_stopped: Some(s_tx),
            },
            a_rx,
            s_rx,
        )
    }

    /// Fires whichever notifications `suppress` doesn't mask. Later
    /// calls are no-ops since the first call already consumes both
    /// senders.
    pub fn close(&mut self, reason: Option<String>, suppress: CloseSuppress) {
        if let Some(tx) = self.audio_state_changed.take() {
            if !suppress.audio_state_changed {
                let _ = tx.send(reason);
            }
        }
        if let Some(tx) = self.async_stopped.take() {
            if !suppress.async_stopped {
                let _ = tx.send(());
            }
        }
    }
}

struct RawScoSocket {
    fd: AsyncFd<OwnedFd>,
}

impl RawScoSocket {
    fn open() -> io::Result<OwnedFd> {
        let raw = unsafe {
            libc::socket(
                linux_bt::AF_BLUETOOTH,
                libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK,
                linux_bt::BTPROTO_SCO,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(raw) })
    }

    fn bind(raw: RawFd, local: BdAddr) -> io::Result<()> {
        let sa = SockaddrSco {
            sco_family: linux_bt::AF_BLUETOOTH as libc::sa_family_t,
            sco_bdaddr: bdaddr_t(local),
        };
        let ret = unsafe {
            libc::bind(
                raw,
                &sa as *const SockaddrSco as *const libc::sockaddr,
                std::mem::size_of::<SockaddrSco>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Binds the local HCI address, connects to `peer`'s SCO socket
    /// (§4.6), and on success queries `SCO_OPTIONS` for the negotiated
    /// MTU the kernel actually settled on rather than trusting the
    /// configured value.
    async fn connect(local: BdAddr, peer: BdAddr) -> Result<(Self, u16)> {
        let owned = Self::open().map_err(|e| Error::Transport(TransportError::SyscallError(e)))?;
        let raw = owned.as_raw_fd();
        Self::bind(raw, local).map_err(|e| Error::Transport(TransportError::SyscallError(e)))?;

        let dest = SockaddrSco {
            sco_family: linux_bt::AF_BLUETOOTH as libc::sa_family_t,
            sco_bdaddr: bdaddr_t(peer),
        };
        let ret = unsafe {
            libc::connect(
                raw,
                &dest as *const SockaddrSco as *const libc::sockaddr,
                std::mem::size_of::<SockaddrSco>() as libc::socklen_t,
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

            let errno =
                Self::so_error(fd.as_raw_fd()).map_err(|e| Error::Transport(TransportError::SyscallError(e)))?;
            if errno != 0 {
                return Err(Error::Transport(TransportError::SyscallError(
                    io::Error::from_raw_os_error(errno),
                )));
            }
            guard.clear_ready();
        }

        let mtu = Self::negotiated_mtu(fd.as_raw_fd())
            .map_err(|e| Error::Transport(TransportError::SyscallError(e)))?;
        Ok((Self { fd }, mtu))
    }

    /// Queries `SOL_SCO`/`SCO_OPTIONS` for the MTU the kernel settled
    /// on after connect, the same `getsockopt` call the original's
    /// `ScoGetParams` makes.
    fn negotiated_mtu(raw: RawFd) -> io::Result<u16> {
        let mut opts = ScoOptions::default();
        let mut len = std::mem::size_of::<ScoOptions>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                raw,
                linux_bt::SOL_SCO,
                linux_bt::SCO_OPTIONS,
                &mut opts as *mut ScoOptions as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(opts.mtu)
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

    /// Bytes queued for transmission, via `TIOCOUTQ`. Not every kernel
    /// reports a meaningful value for a `SOCK_SEQPACKET` SCO socket, so
    /// callers treat an error here as "unsupported" and fall back to
    /// the symmetric-count estimate (§7 Open Question (a)).
    fn output_queued_bytes(&self) -> io::Result<u32> {
        let mut value: libc::c_int = 0;
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::TIOCOUTQ as _, &mut value as *mut _) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(value as u32)
    }

    fn recv_packet(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let raw = self.fd.as_raw_fd();
        let n = unsafe { libc::read(raw, buf.as_mut_ptr() as *mut _, buf.len()) };
        if n >= 0 {
            return Ok(Some(n as usize));
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err)
        }
    }

    fn send_packet(&self, buf: &[u8]) -> io::Result<Option<usize>> {
        let raw = self.fd.as_raw_fd();
        let n = unsafe { libc::write(raw, buf.as_ptr() as *const _, buf.len()) };
        if n >= 0 {
            return Ok(Some(n as usize));
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err)
        }
    }
}

#[derive(Default)]
struct SharedBuffers {
    input: Mutex<VecDeque<i16>>,
    output: Mutex<VecDeque<i16>>,
    packets_in: AtomicUsize,
    packets_out_completed: AtomicUsize,
    state: std::sync::atomic::AtomicU8,
}

impl SharedBuffers {
    fn set_state(&self, state: ScoState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    fn state(&self) -> ScoState {
        ScoState::try_from(self.state.load(Ordering::Relaxed)).unwrap_or(ScoState::Idle)
    }
}

/// The pump-facing half of a connected SCO link. Cheaply cloneable
/// handles would be unsound here (the pump takes ownership via `Box<dyn
/// Endpoint>`), so this is the single owner; [`ScoDriver`] holds the
/// matching `Arc<SharedBuffers>` and the socket itself.
pub struct ScoEndpoint {
    shared: Arc<SharedBuffers>,
    packet_samps: usize,
    outbuf_samps: usize,
    socket_for_queue_estimate: Option<Arc<RawScoSocket>>,
}

impl ScoEndpoint {
    /// `packet_samps = min(mtu, 48) / 2` (16-bit samples), §4.6.
    fn packet_samps_for(mtu: u16) -> usize {
        (mtu.min(48) as usize) / 2
    }

    pub fn state(&self) -> ScoState {
        self.shared.state()
    }
}

impl Endpoint for ScoEndpoint {
    fn props(&self) -> EndpointProps {
        EndpointProps {
            has_clock: true,
            does_source: true,
            does_sink: true,
            does_loop: false,
            remove_on_exhaust: false,
            outbuf_size: self.outbuf_samps,
        }
    }

    fn format(&self) -> PcmFormat {
        PcmFormat::mono_s16le(self.packet_samps)
    }

    fn queue_state(&self) -> QueueState {
        let in_queued = self.shared.input.lock().expect("sco input lock poisoned").len();

        let out_queued = match self.socket_for_queue_estimate.as_ref().and_then(|s| s.output_queued_bytes().ok()) {
            Some(bytes) => (bytes as usize) / 2,
            None => {
                let produced = self.shared.packets_in.load(Ordering::Relaxed);
                let completed = self.shared.packets_out_completed.load(Ordering::Relaxed);
                produced.saturating_sub(completed) * self.packet_samps
            }
        };

        QueueState { in_queued, out_queued }
    }

    fn read_input(&mut self, out: &mut [i16]) -> usize {
        let mut input = self.shared.input.lock().expect("sco input lock poisoned");
        let n = out.len().min(input.len());
        for slot in out.iter_mut().take(n) {
            *slot = input.pop_front().expect("checked length above");
        }
        n
    }

    fn drop_input(&mut self, n: usize) -> usize {
        let mut input = self.shared.input.lock().expect("sco input lock poisoned");
        let drop = n.min(input.len());
        input.drain(..drop);
        drop
    }

    fn write_output(&mut self, data: &[i16]) -> usize {
        let mut output = self.shared.output.lock().expect("sco output lock poisoned");
        output.extend(data.iter().copied());
        self.shared.packets_out_completed.fetch_add(data.len() / self.packet_samps.max(1), Ordering::Relaxed);
        data.len()
    }

    fn trim_output(&mut self, n: usize) -> usize {
        let mut output = self.shared.output.lock().expect("sco output lock poisoned");
        let drop = n.min(output.len());
        for _ in 0..drop {
            output.pop_back();
        }
        drop
    }
}

/// Background task that moves raw HCI SCO packets between the kernel
/// socket and [`ScoEndpoint`]'s shared ring buffers, notifying the pump
/// (via `notify`) each time a packet arrives.
pub struct ScoDriver {
    socket: Arc<RawScoSocket>,
    shared: Arc<SharedBuffers>,
    packet_bytes: usize,
    notify: mpsc::Sender<()>,
    teardown: ScoTeardown,
}

impl ScoDriver {
    pub async fn run(mut self) {
        let mut packet = vec![0u8; self.packet_bytes];
        loop {
            if let Err(e) = self.socket.fd.readable().await {
                warn!("SCO socket readiness error: {e}");
                self.teardown.close(Some(e.to_string()), CloseSuppress::default());
                return;
            }

            match self.socket.recv_packet(&mut packet) {
                Ok(Some(0)) => {
                    debug!("SCO link closed by peer");
                    self.teardown.close(None, CloseSuppress::default());
                    return;
                }
                Ok(Some(n)) => {
                    let mut input = self.shared.input.lock().expect("sco input lock poisoned");
                    for chunk in packet[..n].chunks_exact(2) {
                        input.push_back(i16::from_le_bytes([chunk[0], chunk[1]]));
                    }
                    drop(input);
                    self.shared.packets_in.fetch_add(1, Ordering::Relaxed);
                    let _ = self.notify.try_send(());
                    self.drain_output();
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!("SCO socket read failed: {e}");
                    self.teardown.close(Some(e.to_string()), CloseSuppress::default());
                    return;
                }
            }
        }
    }

    fn drain_output(&self) {
        let samps = self.packet_bytes / 2;
        loop {
            let mut output = self.shared.output.lock().expect("sco output lock poisoned");
            if output.len() < samps {
                return;
            }
            let mut bytes = Vec::with_capacity(self.packet_bytes);
            for _ in 0..samps {
                let sample = output.pop_front().expect("checked length above");
                bytes.extend_from_slice(&sample.to_le_bytes());
            }
            drop(output);
            if let Err(e) = self.socket.send_packet(&bytes) {
                warn!("SCO socket write failed: {e}");
                return;
            }
        }
    }

    /// Closes the link cooperatively, observing `suppress` for which
    /// teardown notification(s) to withhold.
    pub fn close(&mut self, reason: Option<String>, suppress: CloseSuppress) {
        self.teardown.close(reason, suppress);
    }
}

/// Connects a new SCO link, returning the pump-facing [`ScoEndpoint`],
/// the background [`ScoDriver`] to spawn, a notification receiver that
/// fires once per inbound packet, and the two teardown receivers.
pub async fn connect(
    local: BdAddr,
    peer: BdAddr,
    sco_config: ScoHciConfig,
) -> Result<(
    ScoEndpoint,
    ScoDriver,
    mpsc::Receiver<()>,
    oneshot::Receiver<Option<String>>,
    oneshot::Receiver<()>,
)> {
    sco_config.validate().map_err(|_| Error::Stream(StreamError::BadPumpConfig("SCO HCI config invalid".to_string())))?;

    let shared = Arc::new(SharedBuffers::default());
    shared.set_state(ScoState::SocketConnecting);
    let (socket, negotiated_mtu) = RawScoSocket::connect(local, peer).await?;
    let socket = Arc::new(socket);
    shared.set_state(ScoState::Connected);
    let packet_samps = ScoEndpoint::packet_samps_for(negotiated_mtu);
    let (notify_tx, notify_rx) = mpsc::channel(sco_config.max_packets.max(1) as usize);
    let (teardown, audio_state_rx, async_stopped_rx) = ScoTeardown::new();

    let endpoint = ScoEndpoint {
        shared: shared.clone(),
        packet_samps,
        outbuf_samps: packet_samps * sco_config.max_packets.max(1) as usize,
        socket_for_queue_estimate: Some(socket.clone()),
    };

    let driver = ScoDriver {
        socket,
        shared,
        packet_bytes: packet_samps * 2,
        notify: notify_tx,
        teardown,
    };

    Ok((endpoint, driver, notify_rx, audio_state_rx, async_stopped_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sco_config() -> ScoHciConfig {
        ScoHciConfig {
            mtu: 48,
            max_packets: 8,
            voice_setting: crate::hci::REQUIRED_VOICE_SETTING,
        }
    }

    #[test]
    fn packet_samps_derivation_halves_the_clipped_mtu() {
        assert_eq!(ScoEndpoint::packet_samps_for(48), 24);
        assert_eq!(ScoEndpoint::packet_samps_for(255), 24);
        assert_eq!(ScoEndpoint::packet_samps_for(16), 8);
    }

    #[test]
    fn symmetric_fallback_estimates_out_queued_from_packet_counters() {
        let shared = Arc::new(SharedBuffers::default());
        shared.packets_in.fetch_add(3, Ordering::Relaxed);
        shared.packets_out_completed.fetch_add(1, Ordering::Relaxed);

        let endpoint = ScoEndpoint {
            shared: shared.clone(),
            packet_samps: 24,
            outbuf_samps: 192,
            socket_for_queue_estimate: None,
        };
        assert_eq!(endpoint.queue_state().out_queued, 2 * 24);
    }

    #[test]
    fn close_fires_only_unsuppressed_teardown_sides() {
        let (mut teardown, mut audio_rx, mut async_rx) = ScoTeardown::new();
        teardown.close(
            Some("rfcomm disconnected".to_string()),
            CloseSuppress {
                audio_state_changed: false,
                async_stopped: true,
            },
        );

        assert_eq!(audio_rx.try_recv().unwrap(), Some("rfcomm disconnected".to_string()));
        assert!(async_rx.try_recv().is_err());
    }

    #[test]
    fn teardown_notifications_each_fire_at_most_once() {
        let (mut teardown, mut audio_rx, _async_rx) = ScoTeardown::new();
        teardown.close(Some("first".to_string()), CloseSuppress::default());
        teardown.close(Some("second".to_string()), CloseSuppress::default());
        assert_eq!(audio_rx.try_recv().unwrap(), Some("first".to_string()));
    }
}
