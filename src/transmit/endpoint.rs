//! Raw-L2 send/receive endpoints.
//!
//! `RawEndpoint` is the seam between the transmitter and the platform: on
//! Linux it is an `AF_PACKET` socket bound to exactly one device, so writes
//! leave the intended physical port even when several ports exist. The
//! in-memory endpoint backs tests and loopback benches without privileges.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// A device-bound raw frame endpoint.
///
/// `send` and `recv` are non-blocking; `WouldBlock` signals EAGAIN-like
/// backpressure that the transmitter absorbs with bounded retries.
pub trait RawEndpoint: Send + Sync {
    fn send(&self, frame: &[u8]) -> io::Result<usize>;
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Latest hardware TX timestamp in monotonic microseconds, when the
    /// device captures one. `None` means the caller substitutes a software
    /// clock reading.
    fn tx_timestamp(&self) -> Option<u64> {
        None
    }
}

#[cfg(target_os = "linux")]
pub use afpacket::AfPacketEndpoint;

#[cfg(target_os = "linux")]
mod afpacket {
    use std::io;
    use std::os::fd::{AsRawFd, OwnedFd};

    use nix::sys::socket::{
        bind, socket, AddressFamily, LinkAddr, MsgFlags, SockFlag, SockProtocol, SockType,
        SockaddrLike,
    };

    use super::RawEndpoint;

    /// `AF_PACKET`/`SOCK_RAW` socket bound to one interface.
    pub struct AfPacketEndpoint {
        fd: OwnedFd,
    }

    impl AfPacketEndpoint {
        /// Open and bind a raw socket to `device`. Requires CAP_NET_RAW.
        pub fn open(device: &str) -> anyhow::Result<Self> {
            let ifindex = nix::net::if_::if_nametoindex(device)
                .map_err(|e| anyhow::anyhow!("if_nametoindex({device}): {e}"))?;

            let fd = socket(
                AddressFamily::Packet,
                SockType::Raw,
                SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
                SockProtocol::EthAll,
            )
            .map_err(|e| anyhow::anyhow!("socket(AF_PACKET) for {device}: {e}"))?;

            // sockaddr_ll carries the interface index the socket is locked to.
            let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
            sll.sll_family = libc::AF_PACKET as libc::sa_family_t;
            sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
            sll.sll_ifindex = ifindex as i32;
            let addr = unsafe {
                LinkAddr::from_raw(
                    &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                    Some(std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t),
                )
            }
            .ok_or_else(|| anyhow::anyhow!("bad sockaddr_ll for {device}"))?;

            bind(fd.as_raw_fd(), &addr)
                .map_err(|e| anyhow::anyhow!("bind({device}): {e}"))?;

            tracing::debug!("opened AF_PACKET endpoint on {device} (ifindex {ifindex})");
            Ok(AfPacketEndpoint { fd })
        }
    }

    impl RawEndpoint for AfPacketEndpoint {
        fn send(&self, frame: &[u8]) -> io::Result<usize> {
            nix::sys::socket::send(self.fd.as_raw_fd(), frame, MsgFlags::MSG_DONTWAIT)
                .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
        }

        fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            nix::sys::socket::recv(self.fd.as_raw_fd(), buf, MsgFlags::MSG_DONTWAIT)
                .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
        }
    }
}

#[derive(Default)]
struct MemShared {
    /// Frames "on the wire", readable from any endpoint of the pair.
    wire: Mutex<VecDeque<Vec<u8>>>,
    /// Everything ever sent, in order, for assertions.
    sent_log: Mutex<Vec<Vec<u8>>>,
    /// Remaining sends that fail with EAGAIN before succeeding.
    eagain_budget: AtomicU32,
    /// Simulated carrier loss: sends fail hard.
    down: AtomicBool,
}

/// In-memory endpoint used by tests and loopback benches. Endpoints created
/// with [`MemoryEndpoint::peer`] share one wire: frames sent on either side
/// become receivable on both, which models an external loopback fixture.
#[derive(Clone, Default)]
pub struct MemoryEndpoint {
    shared: Arc<MemShared>,
}

impl MemoryEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Another endpoint on the same wire.
    pub fn peer(&self) -> MemoryEndpoint {
        MemoryEndpoint { shared: Arc::clone(&self.shared) }
    }

    /// All frames sent so far, in send order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.shared.sent_log.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.shared.sent_log.lock().unwrap().len()
    }

    /// Make the next `n` sends fail with `WouldBlock`.
    pub fn inject_eagain(&self, n: u32) {
        self.shared.eagain_budget.store(n, Ordering::Release);
    }

    /// Simulate carrier loss or recovery.
    pub fn set_down(&self, down: bool) {
        self.shared.down.store(down, Ordering::Release);
    }
}

impl RawEndpoint for MemoryEndpoint {
    fn send(&self, frame: &[u8]) -> io::Result<usize> {
        if self.shared.down.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::Other, "link down"));
        }
        let budget = self.shared.eagain_budget.load(Ordering::Acquire);
        if budget > 0 {
            self.shared.eagain_budget.store(budget - 1, Ordering::Release);
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "tx ring full"));
        }
        self.shared.sent_log.lock().unwrap().push(frame.to_vec());
        self.shared.wire.lock().unwrap().push_back(frame.to_vec());
        Ok(frame.len())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.shared.wire.lock().unwrap().pop_front() {
            Some(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::WouldBlock, "no frame")),
        }
    }
}
