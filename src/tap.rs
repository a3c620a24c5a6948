//! Layer-2 TAP device channel.
//!
//! Opens the kernel TUN/TAP device with `IFF_TAP | IFF_NO_PI`, captures the
//! hardware address, and moves Ethernet frames between the kernel and the
//! tunnel through the reactor: reads hand pool buffers to the registered
//! frame callback, writes drain a mutex-guarded send queue under
//! write-readiness.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::{BufferPool, FrameBuffer};
use crate::error::{AgentError, AgentResult};
use crate::reactor::{Endpoint, Reactor};

const TUN_PATH: &[u8] = b"/dev/net/tun\0";

/// Interface name limit including the terminating NUL.
pub const IFNAMSIZ: usize = libc::IFNAMSIZ;

/// Callback invoked with each frame read from the device. Ownership of the
/// buffer transfers to the callee.
pub type FrameReadHandler = Box<dyn Fn(FrameBuffer) + Send + Sync>;

/// TAP device configuration. Immutable after open.
#[derive(Debug, Clone)]
pub struct TapDescriptor {
    pub name: String,
    pub mtu: u32,
}

impl TapDescriptor {
    pub fn new(name: impl Into<String>, mtu: u32) -> Self {
        Self {
            name: name.into(),
            mtu,
        }
    }
}

/// Render a MAC address the way the controller expects it: uppercase hex,
/// no separators.
pub fn format_mac(mac: &[u8; 6]) -> String {
    let mut out = String::with_capacity(12);
    for byte in mac {
        out.push_str(&format!("{:02X}", byte));
    }
    out
}

#[derive(Default)]
struct TapState {
    name: String,
    mac: [u8; 6],
    mtu: u32,
    is_down: bool,
}

pub struct TapChannel {
    fd: AtomicI32,
    state: Mutex<TapState>,
    sendq: Mutex<VecDeque<FrameBuffer>>,
    pool: Arc<BufferPool>,
    reactor: Arc<Reactor>,
    on_frame_read: Mutex<Option<FrameReadHandler>>,
}

fn zeroed_ifreq(name: &str) -> libc::ifreq {
    // SAFETY: ifreq is plain data; all-zero is a valid representation
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (slot, byte) in ifr.ifr_name.iter_mut().zip(name.bytes()) {
        *slot = byte as libc::c_char;
    }
    ifr
}

fn config_socket() -> AgentResult<RawFd> {
    // SAFETY: plain socket(2) call
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(AgentError::last_os_error(
            "tap open failed - auxiliary socket bind",
        ));
    }
    Ok(fd)
}

impl TapChannel {
    pub fn new(pool: Arc<BufferPool>, reactor: Arc<Reactor>) -> Arc<Self> {
        Arc::new(Self {
            fd: AtomicI32::new(-1),
            state: Mutex::new(TapState {
                is_down: true,
                ..Default::default()
            }),
            sendq: Mutex::new(VecDeque::new()),
            pool,
            reactor,
            on_frame_read: Mutex::new(None),
        })
    }

    /// Open and create the kernel device described by `desc`.
    ///
    /// On any failure the channel is left closed and the distinct failing
    /// step is named in the error.
    pub fn open(&self, desc: &TapDescriptor) -> AgentResult<()> {
        if self.fd.load(Ordering::Acquire) >= 0 {
            return Err(AgentError::state("tap device is already open"));
        }
        if desc.name.is_empty() || desc.name.len() >= IFNAMSIZ {
            return Err(AgentError::config(format!(
                "tap open failed - the name length is outside the allowed range: {}",
                desc.name.len()
            )));
        }
        // SAFETY: TUN_PATH is a valid NUL-terminated path
        let fd = unsafe {
            libc::open(
                TUN_PATH.as_ptr().cast(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(AgentError::last_os_error("tap open failed - device open"));
        }

        let mut ifr = zeroed_ifreq(&desc.name);
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;
        // SAFETY: ifr outlives the call and matches the ioctl's expectations
        if unsafe { libc::ioctl(fd, libc::TUNSETIFF as _, &mut ifr as *mut libc::ifreq) } < 0 {
            let err = AgentError::last_os_error("tap open failed - the device could not be created");
            // SAFETY: fd was opened above
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let captured = (|| -> AgentResult<([u8; 6], u32)> {
            let cfg = config_socket()?;
            let result = (|| -> AgentResult<([u8; 6], u32)> {
                let mut ifr = zeroed_ifreq(&desc.name);
                ifr.ifr_ifru.ifru_mtu = desc.mtu as libc::c_int;
                // SAFETY: ifr is valid for each call below
                unsafe {
                    if libc::ioctl(cfg, libc::SIOCSIFMTU as _, &mut ifr as *mut libc::ifreq) < 0 {
                        return Err(AgentError::last_os_error(
                            "tap open failed - setting the device mtu",
                        ));
                    }
                    if libc::ioctl(cfg, libc::SIOCGIFHWADDR as _, &mut ifr as *mut libc::ifreq) < 0
                    {
                        return Err(AgentError::last_os_error(
                            "tap open failed - retrieving the device mac address",
                        ));
                    }
                    let mut mac = [0u8; 6];
                    for (dst, src) in mac.iter_mut().zip(ifr.ifr_ifru.ifru_hwaddr.sa_data.iter()) {
                        *dst = *src as u8;
                    }
                    if libc::ioctl(cfg, libc::SIOCGIFMTU as _, &mut ifr as *mut libc::ifreq) < 0 {
                        return Err(AgentError::last_os_error(
                            "tap open failed - reading the device mtu",
                        ));
                    }
                    Ok((mac, ifr.ifr_ifru.ifru_mtu as u32))
                }
            })();
            // SAFETY: cfg was opened by config_socket
            unsafe { libc::close(cfg) };
            result
        })();

        let (mac, mtu) = match captured {
            Ok(v) => v,
            Err(e) => {
                // SAFETY: fd was opened above
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };

        let mut state = self.state.lock().expect("tap state poisoned");
        state.name = desc.name.clone();
        state.mac = mac;
        state.mtu = mtu;
        state.is_down = true;
        self.fd.store(fd, Ordering::Release);
        log::info!("tap device {} opened, mtu {}", desc.name, mtu);
        Ok(())
    }

    /// Install the frame-read callback. Must happen before the channel is
    /// registered for read readiness.
    pub fn set_read_handler(&self, handler: FrameReadHandler) {
        *self.on_frame_read.lock().expect("tap handler poisoned") = Some(handler);
    }

    pub fn mac(&self) -> [u8; 6] {
        self.state.lock().expect("tap state poisoned").mac
    }

    pub fn mtu(&self) -> u32 {
        self.state.lock().expect("tap state poisoned").mtu
    }

    pub fn name(&self) -> String {
        self.state.lock().expect("tap state poisoned").name.clone()
    }

    fn set_flags(&self, name: &str, enable: libc::c_short, disable: libc::c_short) {
        let cfg = match config_socket() {
            Ok(fd) => fd,
            Err(e) => {
                log::error!("tap set flags failed: {}", e);
                return;
            }
        };
        let mut ifr = zeroed_ifreq(name);
        // SAFETY: ifr is valid for both calls
        unsafe {
            if libc::ioctl(cfg, libc::SIOCGIFFLAGS as _, &mut ifr as *mut libc::ifreq) < 0 {
                log::error!("tap set flags failed: {}", std::io::Error::last_os_error());
            } else {
                ifr.ifr_ifru.ifru_flags |= enable;
                ifr.ifr_ifru.ifru_flags &= !disable;
                if libc::ioctl(cfg, libc::SIOCSIFFLAGS as _, &mut ifr as *mut libc::ifreq) < 0 {
                    log::error!("tap set flags failed: {}", std::io::Error::last_os_error());
                }
            }
            libc::close(cfg);
        }
    }

    /// Bring the interface up. Redundant calls are no-ops.
    pub fn up(&self) {
        let mut state = self.state.lock().expect("tap state poisoned");
        if self.fd.load(Ordering::Acquire) < 0 || !state.is_down {
            return;
        }
        let name = state.name.clone();
        state.is_down = false;
        drop(state);
        self.set_flags(&name, libc::IFF_UP as libc::c_short, 0);
        log::info!("{} is now UP", name);
    }

    /// Bring the interface down. Redundant calls are no-ops.
    pub fn down(&self) {
        let mut state = self.state.lock().expect("tap state poisoned");
        if self.fd.load(Ordering::Acquire) < 0 || state.is_down {
            return;
        }
        let name = state.name.clone();
        state.is_down = true;
        drop(state);
        self.set_flags(&name, 0, libc::IFF_UP as libc::c_short);
        log::info!("{} is now DOWN", name);
    }

    pub fn is_down(&self) -> bool {
        self.state.lock().expect("tap state poisoned").is_down
    }

    /// Enqueue a frame for asynchronous write. Dropped when the device is
    /// down or closed.
    pub fn queue_write(&self, buf: FrameBuffer) {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 || self.is_down() {
            self.pool.release(buf);
            return;
        }
        self.sendq.lock().expect("tap sendq poisoned").push_back(buf);
        self.reactor.enable_write(fd);
    }

    /// Write a frame straight to the device, bypassing the send queue. Used
    /// for link ingress where the kernel is the only consumer. Returns the
    /// number of bytes written.
    pub fn write_direct(&self, buf: &FrameBuffer) -> AgentResult<usize> {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Err(AgentError::state("tap write on a closed device"));
        }
        // SAFETY: buf's bytes are valid for the call
        let n = unsafe { libc::write(fd, buf.bytes().as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(AgentError::last_os_error("tap write failed"));
        }
        Ok(n as usize)
    }

    fn drain_sendq(&self) -> AgentResult<()> {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Ok(());
        }
        loop {
            let mut queue = self.sendq.lock().expect("tap sendq poisoned");
            let Some(head) = queue.front_mut() else {
                self.reactor.disable_write(fd);
                return Ok(());
            };
            // SAFETY: head's bytes are valid for the call
            let n = unsafe { libc::write(fd, head.bytes().as_ptr().cast(), head.len()) };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::WouldBlock {
                    log::warn!("tap channel write failed: {}", err);
                }
                return Ok(());
            }
            let n = n as usize;
            if n < head.len() {
                head.consume(n);
                return Ok(());
            }
            let done = queue.pop_front().expect("head vanished");
            drop(queue);
            self.pool.release(done);
        }
    }

    fn read_one(&self) -> AgentResult<()> {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Ok(());
        }
        let mut buf = self.pool.acquire();
        let space = buf.space();
        // SAFETY: space is valid for the call
        let n = unsafe { libc::read(fd, space.as_mut_ptr().cast(), space.len()) };
        if n > 0 {
            buf.set_len(n as usize);
            let handler = self.on_frame_read.lock().expect("tap handler poisoned");
            if let Some(handler) = handler.as_ref() {
                handler(buf);
            } else {
                drop(handler);
                self.pool.release(buf);
            }
            return Ok(());
        }
        self.pool.release(buf);
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::WouldBlock {
                log::warn!("tap channel read failed: {}", err);
            }
        }
        Ok(())
    }
}

impl Endpoint for TapChannel {
    fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    fn read_next(&self) -> AgentResult<()> {
        self.read_one()
    }

    fn write_next(&self) -> AgentResult<()> {
        self.drain_sendq()
    }

    fn close(&self) {
        self.down();
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            // SAFETY: fd was ours and is forgotten after this
            unsafe { libc::close(fd) };
        }
        let mut queue = self.sendq.lock().expect("tap sendq poisoned");
        while let Some(buf) = queue.pop_front() {
            self.pool.release(buf);
        }
    }

    fn is_good(&self) -> bool {
        self.fd.load(Ordering::Acquire) >= 0
    }
}

impl Drop for TapChannel {
    fn drop(&mut self) {
        Endpoint::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> (Arc<BufferPool>, Arc<Reactor>) {
        (
            Arc::new(BufferPool::new(8)),
            Arc::new(Reactor::new().unwrap()),
        )
    }

    #[test]
    fn test_name_length_validation() {
        let (pool, reactor) = harness();
        let tap = TapChannel::new(pool, reactor);
        let desc = TapDescriptor::new("a".repeat(IFNAMSIZ), 1410);
        let err = tap.open(&desc).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        assert!(!tap.is_good());
    }

    #[test]
    fn test_queue_write_on_closed_channel_drops() {
        let (pool, reactor) = harness();
        let tap = TapChannel::new(pool.clone(), reactor);
        let buf = pool.acquire();
        assert_eq!(pool.max_used(), 1);
        tap.queue_write(buf);
        // buffer went back to the pool, not into the queue
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_up_down_idempotent_bookkeeping() {
        let (pool, reactor) = harness();
        let tap = TapChannel::new(pool, reactor);
        // channel never opened: state stays down, calls are no-ops
        tap.up();
        assert!(tap.is_down());
        tap.down();
        assert!(tap.is_down());
    }

    #[test]
    fn test_close_idempotent() {
        let (pool, reactor) = harness();
        let tap = TapChannel::new(pool, reactor);
        Endpoint::close(&*tap);
        Endpoint::close(&*tap);
        assert!(!tap.is_good());
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(
            format_mac(&[0xaa, 0xbb, 0x0c, 0x1d, 0x2e, 0x3f]),
            "AABB0C1D2E3F"
        );
    }
}
