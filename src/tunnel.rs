//! The tunnel: one TAP device, one identity, at most one virtual link.
//!
//! The tunnel enforces the link lifecycle and moves frames between its two
//! sides. Egress (TAP → peer) posts pool buffers to the link's worker;
//! ingress (peer → TAP) copies into a pool buffer and writes straight to
//! the device, bypassing the send queue, since the kernel is the only
//! consumer. The TAP comes UP on the first link-up and goes DOWN when the
//! tunnel is destroyed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::epoll::EpollFlags;
use serde_json::{json, Value};

use crate::buffer::{BufferPool, FrameBuffer};
use crate::control::ControlChannel;
use crate::error::{AgentError, AgentResult};
use crate::link::{LinkEventHandlers, LinkStats, VirtualLink, VlinkDescriptor};
use crate::protocol::{commands, ControlMessage, LINK_CONNECTED, LINK_DISCONNECTED};
use crate::reactor::{Endpoint, Reactor};
use crate::tap::{format_mac, TapChannel, TapDescriptor};
use crate::transport::ice::IceRole;
use crate::transport::sec::LinkIdentity;

/// TURN server coordinates carried through tunnel configuration.
#[derive(Debug, Clone)]
pub struct TurnDescriptor {
    pub address: String,
    pub user: String,
    pub password: String,
}

/// Identity of the tunnel and its local node, plus the assistive servers
/// its links gather with.
#[derive(Debug, Clone)]
pub struct TunnelDescriptor {
    pub uid: String,
    pub node_id: String,
    pub stun_servers: Vec<String>,
    pub turn_descs: Vec<TurnDescriptor>,
}

/// The remote end of a link as named by the controller.
#[derive(Debug, Clone)]
pub struct PeerDescriptor {
    pub uid: String,
    pub cas: String,
    pub fingerprint: String,
    pub mac_address: String,
}

/// Callback through which a link reports its local CAS; carries the
/// transaction id of the deferred response it completes.
pub type CasReadyHandler = Arc<dyn Fn(u64, String) + Send + Sync>;

pub struct Tunnel {
    descriptor: TunnelDescriptor,
    tap_desc: TapDescriptor,
    /// Captured at tunnel creation; applied to every link this tunnel
    /// creates.
    ignored_interfaces: Vec<String>,
    tap: Arc<TapChannel>,
    identity: LinkIdentity,
    vlink: Mutex<Option<Arc<VirtualLink>>>,
    ctrl: Arc<ControlChannel>,
    pool: Arc<BufferPool>,
    reactor: Arc<Reactor>,
    next_tid: Arc<AtomicU64>,
    cas_ready: CasReadyHandler,
}

impl Tunnel {
    /// Open the TAP device and generate the tunnel identity. Any failure
    /// leaves nothing behind.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        descriptor: TunnelDescriptor,
        tap_desc: TapDescriptor,
        ignored_interfaces: Vec<String>,
        ctrl: Arc<ControlChannel>,
        pool: Arc<BufferPool>,
        reactor: Arc<Reactor>,
        next_tid: Arc<AtomicU64>,
        cas_ready: CasReadyHandler,
    ) -> AgentResult<Arc<Self>> {
        let tap = TapChannel::new(pool.clone(), reactor.clone());
        tap.open(&tap_desc)?;
        let identity_name = format!("{}{}", descriptor.node_id, descriptor.uid);
        let identity = LinkIdentity::generate(&identity_name)
            .map_err(|e| AgentError::transport(format!("{:#}", e)))?;
        Ok(Arc::new(Self {
            descriptor,
            tap_desc,
            ignored_interfaces,
            tap,
            identity,
            vlink: Mutex::new(None),
            ctrl,
            pool,
            reactor,
            next_tid,
            cas_ready,
        }))
    }

    /// Install the TAP read-completion callback and register the device
    /// with the reactor.
    pub fn start(self: &Arc<Self>) -> AgentResult<()> {
        let weak = Arc::downgrade(self);
        let pool = self.pool.clone();
        self.tap.set_read_handler(Box::new(move |buf| {
            match weak.upgrade() {
                Some(tunnel) => tunnel.tap_read_complete(buf),
                None => pool.release(buf),
            }
        }));
        self.reactor
            .register(self.tap.clone(), EpollFlags::EPOLLIN)?;
        Ok(())
    }

    pub fn descriptor(&self) -> &TunnelDescriptor {
        &self.descriptor
    }

    pub fn fingerprint(&self) -> &str {
        &self.identity.fingerprint
    }

    pub fn mac_address(&self) -> String {
        format_mac(&self.tap.mac())
    }

    /// Create the link, or feed an existing one the peer's CAS. A tunnel
    /// carries at most one link; a repeated create is how the controller
    /// completes the candidate exchange.
    pub fn create_vlink(
        self: &Arc<Self>,
        link_id: &str,
        peer: PeerDescriptor,
        cas_transaction_id: u64,
    ) -> AgentResult<Arc<VirtualLink>> {
        let mut guard = self.vlink.lock().expect("tunnel link poisoned");
        if let Some(link) = guard.as_ref() {
            if !peer.cas.is_empty() {
                link.peer_candidates(peer.cas.clone());
                link.start_connections();
                log::info!("added remote CAS to link with peer {}", link.peer().uid);
            }
            return Ok(link.clone());
        }
        let role = IceRole::select(&self.descriptor.node_id, &peer.uid);
        log::info!("creating {} link with peer {}", role.as_str(), peer.uid);
        let desc = VlinkDescriptor::from_tunnel(link_id, &self.descriptor);
        let has_peer_cas = !peer.cas.is_empty();
        let link = VirtualLink::initialize(
            desc,
            peer,
            &self.identity,
            role,
            self.ignored_interfaces.clone(),
            cas_transaction_id,
            self.link_handlers(link_id),
            self.pool.clone(),
        )?;
        if has_peer_cas {
            link.start_connections();
        }
        *guard = Some(link.clone());
        Ok(link)
    }

    /// Forward the link's start request to its worker.
    pub fn start_connections(&self) -> AgentResult<()> {
        let guard = self.vlink.lock().expect("tunnel link poisoned");
        let link = guard
            .as_ref()
            .ok_or_else(|| AgentError::state("no link exists on this tunnel"))?;
        link.start_connections();
        Ok(())
    }

    fn link_handlers(self: &Arc<Self>, link_id: &str) -> LinkEventHandlers {
        let cas_ready = self.cas_ready.clone();
        let up_tunnel = Arc::downgrade(self);
        let up_link_id = link_id.to_string();
        let down_tunnel = Arc::downgrade(self);
        let down_link_id = link_id.to_string();
        let frame_tunnel = Arc::downgrade(self);
        LinkEventHandlers {
            on_local_cas_ready: Box::new(move |tid, cas| cas_ready(tid, cas)),
            on_link_up: Box::new(move |_| {
                if let Some(tunnel) = up_tunnel.upgrade() {
                    tunnel.vlink_up(&up_link_id);
                }
            }),
            on_link_down: Box::new(move |_| {
                if let Some(tunnel) = down_tunnel.upgrade() {
                    tunnel.vlink_down(&down_link_id);
                }
            }),
            on_message_received: Box::new(move |bytes| {
                if let Some(tunnel) = frame_tunnel.upgrade() {
                    tunnel.vlink_read_complete(bytes);
                }
            }),
        }
    }

    fn vlink_up(&self, link_id: &str) {
        self.tap.up();
        self.notify_link_state(link_id, LINK_CONNECTED);
    }

    fn vlink_down(&self, link_id: &str) {
        self.notify_link_state(link_id, LINK_DISCONNECTED);
    }

    fn notify_link_state(&self, link_id: &str, state: &str) {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let mut ctrl = ControlMessage::new_request(tid, commands::LINK_STATE_CHANGE);
        ctrl.set_request_field("TunnelId", Value::String(self.descriptor.uid.clone()));
        ctrl.set_request_field("LinkId", Value::String(link_id.to_string()));
        ctrl.set_request_field("Data", Value::String(state.to_string()));
        self.ctrl.deliver(ctrl);
    }

    /// Egress: a frame arrived from the kernel.
    pub fn tap_read_complete(&self, buf: FrameBuffer) {
        let link = self.vlink.lock().expect("tunnel link poisoned").clone();
        match link {
            Some(link) => link.transmit(buf),
            None => {
                log::warn!("frame read with no link present, dropped");
                self.pool.release(buf);
            }
        }
    }

    /// Ingress: a frame arrived from the peer. Runs on the network worker.
    pub fn vlink_read_complete(&self, bytes: &[u8]) {
        let mut buf = self.pool.acquire();
        buf.fill_from(bytes);
        if let Err(e) = self.tap.write_direct(&buf) {
            log::warn!("tap ingress write failed: {}", e);
        }
        self.pool.release(buf);
    }

    /// Snapshot of the tunnel for the controller.
    pub fn query_info(&self) -> Value {
        let link_ids: Vec<String> = self
            .vlink
            .lock()
            .expect("tunnel link poisoned")
            .as_ref()
            .map(|l| vec![l.id().to_string()])
            .unwrap_or_default();
        json!({
            "TunnelId": self.descriptor.uid,
            "NodeId": self.descriptor.node_id,
            "TapName": self.tap_desc.name,
            "MTU": self.tap.mtu(),
            "FPR": self.identity.fingerprint,
            "MAC": self.mac_address(),
            "LinkIds": link_ids,
        })
    }

    /// Role and local CAS of the link.
    pub fn query_link_cas(&self) -> AgentResult<Value> {
        let guard = self.vlink.lock().expect("tunnel link poisoned");
        let link = guard
            .as_ref()
            .ok_or_else(|| AgentError::state("no link exists on this tunnel"))?;
        Ok(json!({
            "IceRole": link.ice_role().as_str(),
            "CAS": link.candidates(),
        }))
    }

    pub fn query_link_id(&self) -> Option<String> {
        self.vlink
            .lock()
            .expect("tunnel link poisoned")
            .as_ref()
            .map(|l| l.id().to_string())
    }

    /// Link status and transport counters. Crosses to the network worker
    /// only when the link is READY; otherwise reports without blocking.
    pub fn query_link_info(&self) -> Value {
        let link = self.vlink.lock().expect("tunnel link poisoned").clone();
        match link {
            Some(link) if link.is_ready() => {
                let stats = link.get_stats();
                json!({
                    "IceRole": link.ice_role().as_str(),
                    "Status": "ONLINE",
                    "Stats": serde_json::to_value(&stats).unwrap_or_else(|_| json!({})),
                })
            }
            Some(link) => json!({
                "IceRole": link.ice_role().as_str(),
                "Status": "OFFLINE",
                "Stats": {},
            }),
            None => json!({
                "Status": "UNKNOWN",
                "Stats": {},
            }),
        }
    }

    /// Transport counters alone; empty when not READY.
    pub fn link_stats(&self) -> LinkStats {
        let link = self.vlink.lock().expect("tunnel link poisoned").clone();
        match link {
            Some(link) if link.is_ready() => link.get_stats(),
            _ => LinkStats::default(),
        }
    }

    /// Disconnect and drop the link.
    pub fn remove_link(&self, link_id: &str) -> AgentResult<()> {
        let link = {
            let mut guard = self.vlink.lock().expect("tunnel link poisoned");
            let Some(link) = guard.as_ref() else {
                return Ok(());
            };
            if link.id() != link_id {
                return Err(AgentError::state(
                    "the specified link id does not match this tunnel",
                ));
            }
            guard.take().expect("checked above")
        };
        link.disconnect();
        log::info!("link {} removed", link_id);
        Ok(())
    }

    /// Tear the tunnel down: link disconnected, TAP brought DOWN and
    /// closed, device deregistered.
    pub fn destroy(&self) {
        let link = self.vlink.lock().expect("tunnel link poisoned").take();
        if let Some(link) = link {
            link.disconnect();
        }
        let fd = Endpoint::fd(&*self.tap);
        if fd >= 0 {
            self.reactor.deregister(fd);
        }
        Endpoint::close(&*self.tap);
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    #[test]
    fn test_create_rejects_bad_tap_name() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let (agent_end, _controller_end) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .unwrap();
        let ctrl = ControlChannel::from_fd(reactor.clone(), agent_end);
        let descriptor = TunnelDescriptor {
            uid: "T1".into(),
            node_id: "N1".into(),
            stun_servers: vec![],
            turn_descs: vec![],
        };
        // an over-long name fails before any device access
        let result = Tunnel::create(
            descriptor,
            TapDescriptor::new("x".repeat(64), 1410),
            vec![],
            ctrl,
            Arc::new(BufferPool::new(8)),
            reactor,
            Arc::new(AtomicU64::new(1)),
            Arc::new(|_, _| {}),
        );
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[test]
    fn test_role_follows_node_ordering() {
        assert_eq!(IceRole::select("aaaa", "bbbb"), IceRole::Controlling);
        assert_eq!(IceRole::select("bbbb", "aaaa"), IceRole::Controlled);
    }
}
