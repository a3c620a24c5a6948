//! Framed request/response channel to the controller.
//!
//! A SEQPACKET Unix-domain socket connected to the controller's abstract
//! address carries each logical message as two datagrams: a 16-bit
//! little-endian length, then exactly that many bytes of UTF-8 JSON. The
//! receive path mirrors the discipline: a length datagram arms the body
//! read; the body datagram completes the message.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, UnixAddr};

use crate::error::{AgentError, AgentResult};
use crate::protocol::{ControlMessage, RECIPIENT};
use crate::reactor::{Endpoint, Reactor};

/// Callback receiving each completed message body.
pub type ControlHandler = Box<dyn Fn(Vec<u8>) + Send + Sync>;

struct SendState {
    sendq: VecDeque<Vec<u8>>,
    /// Body whose length datagram has already been sent.
    wbuf: Option<Vec<u8>>,
}

struct RecvState {
    /// Body length announced by the last length datagram; 0 means the next
    /// datagram is a length.
    pending_len: u16,
}

pub struct ControlChannel {
    fd: AtomicI32,
    good: AtomicBool,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    reactor: Arc<Reactor>,
    handler: Mutex<Option<ControlHandler>>,
    session_id: u32,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("fd", &self.fd)
            .field("good", &self.good)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl ControlChannel {
    /// Connect to the controller's abstract-namespace socket.
    pub fn connect(reactor: Arc<Reactor>, server_name: &str) -> AgentResult<Arc<Self>> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|e| AgentError::System(e.into()))?;
        let addr = UnixAddr::new_abstract(server_name.as_bytes())
            .map_err(|e| AgentError::config_with_source("invalid control socket name", e))?;
        connect(fd.as_raw_fd(), &addr).map_err(|e| {
            AgentError::System(std::io::Error::new(
                std::io::Error::from(e).kind(),
                format!("control channel connect to \"{}\" failed", server_name),
            ))
        })?;
        log::info!("control channel connected to {}", server_name);
        Ok(Self::from_fd(reactor, fd))
    }

    /// Wrap an already-connected socket. Used by `connect` and by tests
    /// driving a socketpair.
    pub fn from_fd(reactor: Arc<Reactor>, fd: OwnedFd) -> Arc<Self> {
        Arc::new(Self {
            fd: AtomicI32::new(fd.into_raw_fd()),
            good: AtomicBool::new(true),
            send: Mutex::new(SendState {
                sendq: VecDeque::new(),
                wbuf: None,
            }),
            recv: Mutex::new(RecvState { pending_len: 0 }),
            reactor,
            handler: Mutex::new(None),
            session_id: std::process::id(),
        })
    }

    /// Install the completed-message callback.
    pub fn set_handler(&self, handler: ControlHandler) {
        *self.handler.lock().expect("control handler poisoned") = Some(handler);
    }

    pub fn is_good(&self) -> bool {
        self.good.load(Ordering::Acquire) && self.fd.load(Ordering::Acquire) >= 0
    }

    /// Queue serialized text for transmission. Silently dropped when the
    /// channel is not good.
    pub fn queue_write(&self, text: String) {
        if !self.is_good() {
            return;
        }
        self.send
            .lock()
            .expect("control sendq poisoned")
            .sendq
            .push_back(text.into_bytes());
        self.reactor.enable_write(self.fd.load(Ordering::Acquire));
    }

    /// Stamp the recipient and session id and queue the message.
    pub fn deliver(&self, mut ctrl: ControlMessage) {
        ctrl.recipient = Some(RECIPIENT.to_string());
        ctrl.session_id = Some(self.session_id);
        match ctrl.serialize() {
            Ok(text) => {
                log::debug!("delivering control: {}", text);
                self.queue_write(text);
            }
            Err(e) => log::warn!("dropping undeliverable control: {}", e),
        }
    }

    fn send_datagram(&self, fd: RawFd, data: &[u8]) -> AgentResult<bool> {
        // SAFETY: data is valid for the call
        let n = unsafe {
            libc::send(
                fd,
                data.as_ptr().cast(),
                data.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(false);
            }
            return Err(AgentError::System(err));
        }
        if (n as usize) < data.len() {
            return Err(AgentError::System(std::io::Error::other(
                "control channel truncated send",
            )));
        }
        Ok(true)
    }

    /// One write-readiness step: send the pending length or the pending
    /// body, clearing write interest when the queue drains.
    fn write_step(&self) -> AgentResult<()> {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Ok(());
        }
        let mut send = self.send.lock().expect("control sendq poisoned");
        if send.wbuf.is_none() {
            let Some(front) = send.sendq.front() else {
                self.reactor.disable_write(fd);
                return Ok(());
            };
            let len = front.len() as u16;
            if !self.send_datagram(fd, &len.to_le_bytes())? {
                return Ok(());
            }
            send.wbuf = send.sendq.pop_front();
        } else {
            let body = send.wbuf.take().expect("checked above");
            match self.send_datagram(fd, &body) {
                Ok(true) => {}
                Ok(false) => {
                    send.wbuf = Some(body);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            if send.sendq.is_empty() {
                self.reactor.disable_write(fd);
            }
        }
        Ok(())
    }

    /// One read-readiness step: consume a length datagram or a body
    /// datagram, invoking the handler on each completed body.
    fn read_step(&self) -> AgentResult<()> {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Ok(());
        }
        let mut recv = self.recv.lock().expect("control recv poisoned");
        if recv.pending_len == 0 {
            let mut len_bytes = [0u8; 2];
            // SAFETY: len_bytes is valid for the call
            let n = unsafe { libc::recv(fd, len_bytes.as_mut_ptr().cast(), 2, 0) };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Ok(());
                }
                return Err(AgentError::System(err));
            }
            if n == 0 {
                return Err(AgentError::System(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "controller closed the control channel",
                )));
            }
            if n != 2 {
                return Err(AgentError::protocol("short control length datagram"));
            }
            recv.pending_len = u16::from_le_bytes(len_bytes);
        } else {
            let want = recv.pending_len as usize;
            let mut body = vec![0u8; want];
            // SAFETY: body is valid for the call
            let n = unsafe { libc::recv(fd, body.as_mut_ptr().cast(), want, 0) };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    return Ok(());
                }
                recv.pending_len = 0;
                return Err(AgentError::System(err));
            }
            if n == 0 {
                return Err(AgentError::System(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "controller closed the control channel",
                )));
            }
            body.truncate(n as usize);
            recv.pending_len = 0;
            drop(recv);
            let handler = self.handler.lock().expect("control handler poisoned");
            if let Some(handler) = handler.as_ref() {
                handler(body);
            } else {
                log::warn!("control message received before a handler was installed");
            }
        }
        Ok(())
    }
}

impl Endpoint for ControlChannel {
    fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    fn read_next(&self) -> AgentResult<()> {
        self.read_step()
    }

    fn write_next(&self) -> AgentResult<()> {
        self.write_step()
    }

    fn close(&self) {
        self.good.store(false, Ordering::Release);
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            // SAFETY: fd was ours and is forgotten after this
            unsafe {
                libc::shutdown(fd, libc::SHUT_RDWR);
                libc::close(fd);
            }
        }
    }

    fn is_good(&self) -> bool {
        ControlChannel::is_good(self)
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        Endpoint::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::commands;
    use nix::sys::socket::socketpair;

    fn seqpacket_pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .unwrap()
    }

    fn recv_datagram(fd: &OwnedFd) -> Vec<u8> {
        let mut buf = vec![0u8; 65536];
        // SAFETY: buf is valid for the call
        let n = unsafe { libc::recv(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
        assert!(n >= 0, "recv failed");
        buf.truncate(n as usize);
        buf
    }

    fn send_framed(fd: &OwnedFd, body: &[u8]) {
        let len = (body.len() as u16).to_le_bytes();
        // SAFETY: both slices are valid for the calls
        unsafe {
            assert_eq!(libc::send(fd.as_raw_fd(), len.as_ptr().cast(), 2, 0), 2);
            assert_eq!(
                libc::send(fd.as_raw_fd(), body.as_ptr().cast(), body.len(), 0),
                body.len() as isize
            );
        }
    }

    #[test]
    fn test_deliver_stamps_and_frames() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let (agent_end, controller_end) = seqpacket_pair();
        let channel = ControlChannel::from_fd(reactor.clone(), agent_end);
        reactor
            .register(
                channel.clone(),
                nix::sys::epoll::EpollFlags::EPOLLIN,
            )
            .unwrap();

        channel.deliver(ControlMessage::new_request(9, commands::REGISTER_DATAPLANE));
        // one step sends the length, the next the body
        channel.write_next().unwrap();
        channel.write_next().unwrap();

        let len = recv_datagram(&controller_end);
        assert_eq!(len.len(), 2);
        let body = recv_datagram(&controller_end);
        assert_eq!(u16::from_le_bytes([len[0], len[1]]) as usize, body.len());
        let msg = ControlMessage::deserialize(&body).unwrap();
        assert_eq!(msg.recipient.as_deref(), Some(RECIPIENT));
        assert_eq!(msg.session_id, Some(std::process::id()));
        assert_eq!(msg.command(), Some(commands::REGISTER_DATAPLANE));
    }

    #[test]
    fn test_back_to_back_requests_arrive_in_order() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let (agent_end, controller_end) = seqpacket_pair();
        let channel = ControlChannel::from_fd(reactor.clone(), agent_end);
        let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.set_handler(Box::new(move |body| sink.lock().unwrap().push(body)));
        reactor
            .register(channel.clone(), nix::sys::epoll::EpollFlags::EPOLLIN)
            .unwrap();

        send_framed(&controller_end, b"{\"TransactionId\":1}");
        send_framed(&controller_end, b"{\"TransactionId\":2}");
        for _ in 0..4 {
            reactor.poll_once().unwrap();
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], b"{\"TransactionId\":1}");
        assert_eq!(seen[1], b"{\"TransactionId\":2}");
    }

    #[test]
    fn test_peer_close_surfaces_eof() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let (agent_end, controller_end) = seqpacket_pair();
        let channel = ControlChannel::from_fd(reactor, agent_end);
        drop(controller_end);
        let err = channel.read_next().unwrap_err();
        assert!(matches!(err, AgentError::System(_)));
    }

    #[test]
    fn test_queue_write_after_close_drops() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let (agent_end, _controller_end) = seqpacket_pair();
        let channel = ControlChannel::from_fd(reactor, agent_end);
        Endpoint::close(&*channel);
        channel.queue_write("ignored".to_string());
        assert!(channel.send.lock().unwrap().sendq.is_empty());
        // close is idempotent
        Endpoint::close(&*channel);
    }

    #[test]
    fn test_connect_failure_is_typed() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let err = ControlChannel::connect(reactor, "tincan-test-no-such-socket").unwrap_err();
        assert!(matches!(err, AgentError::System(_)));
    }
}
