//! Single-threaded readiness multiplexer over the agent's long-lived
//! endpoints.
//!
//! The reactor thread is the only caller of `poll_once`; endpoint callbacks
//! are therefore serialized with each other. Interest toggles are safe from
//! any thread (epoll_ctl is thread-safe), which is how the network worker
//! schedules writes on the control channel and TAP device.

use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::error::{AgentError, AgentResult};

/// A channel registered with the reactor.
///
/// Callbacks run on the reactor thread. `close` must be idempotent; after
/// it runs `is_good` reports false and the endpoint is never dispatched
/// again.
pub trait Endpoint: Send + Sync {
    fn fd(&self) -> RawFd;
    fn read_next(&self) -> AgentResult<()>;
    fn write_next(&self) -> AgentResult<()>;
    fn close(&self);
    fn is_good(&self) -> bool;
}

struct Registration {
    endpoint: Arc<dyn Endpoint>,
    events: EpollFlags,
}

pub struct Reactor {
    epoll: Epoll,
    registry: Mutex<HashMap<RawFd, Registration>>,
    exit_flag: AtomicBool,
}

impl Reactor {
    /// Create the multiplexer. Failure here is the one fatal startup error.
    pub fn new() -> AgentResult<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| AgentError::System(e.into()))?;
        Ok(Self {
            epoll,
            registry: Mutex::new(HashMap::new()),
            exit_flag: AtomicBool::new(false),
        })
    }

    /// Register `endpoint` with the given initial interest set.
    pub fn register(&self, endpoint: Arc<dyn Endpoint>, interest: EpollFlags) -> AgentResult<()> {
        let fd = endpoint.fd();
        if fd < 0 {
            return Err(AgentError::state("cannot register a closed endpoint"));
        }
        let event = EpollEvent::new(interest, fd as u64);
        // SAFETY: the endpoint keeps the fd open for the registration's life
        self.epoll
            .add(unsafe { BorrowedFd::borrow_raw(fd) }, event)
            .map_err(|e| AgentError::System(e.into()))?;
        self.registry
            .lock()
            .expect("reactor registry poisoned")
            .insert(
                fd,
                Registration {
                    endpoint,
                    events: interest,
                },
            );
        Ok(())
    }

    /// Remove `fd` from the multiplexer and forget its endpoint.
    pub fn deregister(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        // SAFETY: delete only inspects the descriptor number
        if let Err(e) = self.epoll.delete(unsafe { BorrowedFd::borrow_raw(fd) }) {
            log::warn!("epoll delete failed for fd {}: {}", fd, e);
        }
        self.registry
            .lock()
            .expect("reactor registry poisoned")
            .remove(&fd);
    }

    pub fn enable_read(&self, fd: RawFd) {
        self.modify_interest(fd, EpollFlags::EPOLLIN, true);
    }

    pub fn disable_read(&self, fd: RawFd) {
        self.modify_interest(fd, EpollFlags::EPOLLIN, false);
    }

    pub fn enable_write(&self, fd: RawFd) {
        self.modify_interest(fd, EpollFlags::EPOLLOUT, true);
    }

    pub fn disable_write(&self, fd: RawFd) {
        self.modify_interest(fd, EpollFlags::EPOLLOUT, false);
    }

    fn modify_interest(&self, fd: RawFd, flag: EpollFlags, enable: bool) {
        let mut registry = self.registry.lock().expect("reactor registry poisoned");
        let Some(reg) = registry.get_mut(&fd) else {
            return;
        };
        let has = reg.events.contains(flag);
        if has == enable {
            return;
        }
        reg.events.set(flag, enable);
        let mut event = EpollEvent::new(reg.events, fd as u64);
        // SAFETY: registered fds stay open while registered
        if let Err(e) = self
            .epoll
            .modify(unsafe { BorrowedFd::borrow_raw(fd) }, &mut event)
        {
            log::warn!("epoll modify failed for fd {}: {}", fd, e);
        }
    }

    /// Block on one readiness event and dispatch it.
    ///
    /// Returns without dispatching when interrupted by a signal or when
    /// shutdown was requested. A failing endpoint callback closes and
    /// deregisters that endpoint; only multiplexer failure is an error.
    pub fn poll_once(&self) -> AgentResult<()> {
        let mut events = [EpollEvent::empty(); 1];
        let fired = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(AgentError::System(e.into())),
        };
        if self.exit_flag.load(Ordering::Acquire) {
            return Ok(());
        }
        for event in events.iter().take(fired) {
            self.dispatch(event);
        }
        Ok(())
    }

    fn dispatch(&self, event: &EpollEvent) {
        let fd = event.data() as RawFd;
        let flags = event.events();
        let endpoint = {
            let registry = self.registry.lock().expect("reactor registry poisoned");
            match registry.get(&fd) {
                Some(reg) => Arc::clone(&reg.endpoint),
                None => return,
            }
        };
        let outcome = if flags.contains(EpollFlags::EPOLLIN) {
            endpoint.read_next()
        } else if flags.contains(EpollFlags::EPOLLOUT) {
            endpoint.write_next()
        } else if flags.contains(EpollFlags::EPOLLRDHUP) {
            self.disable_read(fd);
            Ok(())
        } else if flags.contains(EpollFlags::EPOLLHUP) || flags.contains(EpollFlags::EPOLLERR) {
            endpoint.close();
            self.deregister(fd);
            Ok(())
        } else {
            Ok(())
        };
        if let Err(e) = outcome {
            log::warn!("endpoint fd {} failed, closing: {}", fd, e);
            endpoint.close();
            self.deregister(fd);
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.exit_flag.load(Ordering::Acquire)
    }

    /// Deregister and close every endpoint and stop dispatching.
    pub fn shutdown(&self) {
        self.exit_flag.store(true, Ordering::Release);
        let drained: Vec<(RawFd, Registration)> = self
            .registry
            .lock()
            .expect("reactor registry poisoned")
            .drain()
            .collect();
        for (fd, reg) in drained {
            // SAFETY: delete only inspects the descriptor number
            let _ = self.epoll.delete(unsafe { BorrowedFd::borrow_raw(fd) });
            reg.endpoint.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::sync::atomic::AtomicUsize;

    struct PipeEndpoint {
        fd: OwnedFd,
        reads: AtomicUsize,
        writes: AtomicUsize,
        closed: AtomicBool,
        reactor: Mutex<Option<Arc<Reactor>>>,
    }

    impl PipeEndpoint {
        fn new(fd: OwnedFd) -> Arc<Self> {
            Arc::new(Self {
                fd,
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                reactor: Mutex::new(None),
            })
        }
    }

    impl Endpoint for PipeEndpoint {
        fn fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }

        fn read_next(&self) -> AgentResult<()> {
            let mut buf = [0u8; 64];
            // SAFETY: buf is valid for the whole call
            unsafe {
                libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len());
            }
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn write_next(&self) -> AgentResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if let Some(reactor) = self.reactor.lock().unwrap().as_ref() {
                reactor.disable_write(self.fd.as_raw_fd());
            }
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_good(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_read_dispatch() {
        let (rx, tx) = nix::unistd::pipe().unwrap();
        let reactor = Arc::new(Reactor::new().unwrap());
        let ep = PipeEndpoint::new(rx);
        reactor
            .register(ep.clone(), EpollFlags::EPOLLIN)
            .unwrap();
        nix::unistd::write(&tx, b"x").unwrap();
        reactor.poll_once().unwrap();
        assert_eq!(ep.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_interest_toggles() {
        let (_rx, tx) = nix::unistd::pipe().unwrap();
        let reactor = Arc::new(Reactor::new().unwrap());
        let ep = PipeEndpoint::new(tx);
        *ep.reactor.lock().unwrap() = Some(reactor.clone());
        // a pipe's write end is immediately writable
        reactor
            .register(ep.clone(), EpollFlags::EPOLLOUT)
            .unwrap();
        reactor.poll_once().unwrap();
        assert_eq!(ep.writes.load(Ordering::SeqCst), 1);
        // interest was cleared inside the callback; enabling fires again
        reactor.enable_write(ep.fd());
        reactor.poll_once().unwrap();
        assert_eq!(ep.writes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_shutdown_closes_endpoints() {
        let (rx, _tx) = nix::unistd::pipe().unwrap();
        let reactor = Arc::new(Reactor::new().unwrap());
        let ep = PipeEndpoint::new(rx);
        reactor.register(ep.clone(), EpollFlags::EPOLLIN).unwrap();
        reactor.shutdown();
        assert!(reactor.shutdown_requested());
        assert!(!ep.is_good());
        // idempotent
        reactor.shutdown();
    }

    #[test]
    fn test_deregister_stops_dispatch() {
        let (rx, tx) = nix::unistd::pipe().unwrap();
        let reactor = Arc::new(Reactor::new().unwrap());
        let ep = PipeEndpoint::new(rx);
        let fd = ep.fd();
        reactor.register(ep.clone(), EpollFlags::EPOLLIN).unwrap();
        reactor.deregister(fd);
        nix::unistd::write(&tx, b"x").unwrap();
        // nothing is registered; wait would block, so only check bookkeeping
        assert_eq!(ep.reads.load(Ordering::SeqCst), 0);
    }
}
