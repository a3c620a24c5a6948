//! The top-level agent: control dispatch and the reactor run loop.
//!
//! One agent process owns one tunnel, named by `-t` at launch. Control
//! requests arrive over the controller channel and dispatch by command
//! name on the reactor thread; every request yields exactly one response,
//! possibly deferred until the link's local candidate set is known.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::epoll::EpollFlags;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use serde_json::{json, Value};

use crate::buffer::{BufferPool, DEFAULT_POOL_CAPACITY};
use crate::control::ControlChannel;
use crate::error::{AgentError, AgentResult};
use crate::logging::{AgentLogger, LogConfig};
use crate::protocol::{
    commands, parse_request, ControlMessage, CreateLinkParams, CreateTunnelParams,
};
use crate::reactor::Reactor;
use crate::tap::TapDescriptor;
use crate::tunnel::{PeerDescriptor, Tunnel, TunnelDescriptor, TurnDescriptor};

static EXIT_FLAG: AtomicBool = AtomicBool::new(false);

extern "C" fn request_stop(_signum: libc::c_int) {
    EXIT_FLAG.store(true, Ordering::Release);
}

/// True once a shutdown signal has been observed. Repeated signals are
/// indistinguishable from one.
pub fn exit_requested() -> bool {
    EXIT_FLAG.load(Ordering::Acquire)
}

fn install_signal_handlers() -> AgentResult<()> {
    let stop = SigAction::new(
        SigHandler::Handler(request_stop),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: the handler only stores to an atomic flag
    unsafe {
        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT] {
            sigaction(sig, &stop).map_err(|e| AgentError::System(e.into()))?;
        }
        sigaction(Signal::SIGALRM, &ignore).map_err(|e| AgentError::System(e.into()))?;
    }
    Ok(())
}

/// Launch parameters taken from the command line.
#[derive(Debug, Clone)]
pub struct AgentParams {
    /// Abstract-namespace name of the controller's socket.
    pub socket_name: String,
    /// The tunnel identifier this process owns.
    pub tunnel_id: String,
}

pub struct Agent {
    reactor: Arc<Reactor>,
    channel: Arc<ControlChannel>,
    pool: Arc<BufferPool>,
    tunnel: Mutex<Option<Arc<Tunnel>>>,
    /// Pending controls awaiting an asynchronous event, keyed by
    /// transaction id.
    inprogress: Arc<Mutex<HashMap<u64, ControlMessage>>>,
    next_tid: Arc<AtomicU64>,
    tunnel_id: String,
}

impl Agent {
    /// Connect to the controller and assemble the agent. Failure here is
    /// fatal to the process.
    pub fn new(params: &AgentParams) -> AgentResult<Arc<Self>> {
        let reactor = Arc::new(Reactor::new()?);
        let channel = ControlChannel::connect(reactor.clone(), &params.socket_name)?;
        Ok(Self::assemble(reactor, channel, params.tunnel_id.clone()))
    }

    /// Assemble around an already-connected control channel.
    pub fn with_channel(
        reactor: Arc<Reactor>,
        channel: Arc<ControlChannel>,
        tunnel_id: String,
    ) -> Arc<Self> {
        Self::assemble(reactor, channel, tunnel_id)
    }

    fn assemble(
        reactor: Arc<Reactor>,
        channel: Arc<ControlChannel>,
        tunnel_id: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            reactor,
            channel,
            pool: Arc::new(BufferPool::new(DEFAULT_POOL_CAPACITY)),
            tunnel: Mutex::new(None),
            inprogress: Arc::new(Mutex::new(HashMap::new())),
            next_tid: Arc::new(AtomicU64::new(1)),
            tunnel_id,
        })
    }

    fn next_tid(&self) -> u64 {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    /// Announce liveness, then dispatch readiness events until a shutdown
    /// signal arrives.
    pub fn run(self: &Arc<Self>) -> AgentResult<()> {
        install_signal_handlers()?;
        let weak = Arc::downgrade(self);
        self.channel.set_handler(Box::new(move |bytes| {
            if let Some(agent) = weak.upgrade() {
                agent.handle_controller_message(bytes);
            }
        }));
        self.reactor
            .register(self.channel.clone(), EpollFlags::EPOLLIN)?;
        self.register_dataplane();

        while !exit_requested() {
            if let Err(e) = self.reactor.poll_once() {
                self.shutdown();
                return Err(e);
            }
        }
        log::info!("shutdown requested");
        self.shutdown();
        Ok(())
    }

    fn register_dataplane(&self) {
        let mut ctrl = ControlMessage::new_request(self.next_tid(), commands::REGISTER_DATAPLANE);
        ctrl.set_request_field("Data", Value::String("Dataplane Ready".into()));
        self.channel.deliver(ctrl);
    }

    fn shutdown(&self) {
        let tunnel = self.tunnel.lock().expect("agent tunnel poisoned").take();
        if let Some(tunnel) = tunnel {
            tunnel.destroy();
        }
        self.reactor.shutdown();
    }

    fn tunnel(&self) -> AgentResult<Arc<Tunnel>> {
        self.tunnel
            .lock()
            .expect("agent tunnel poisoned")
            .clone()
            .ok_or_else(|| AgentError::state("no tunnel exists"))
    }

    /// Entry point for each message body received from the controller.
    pub fn handle_controller_message(self: &Arc<Self>, bytes: Vec<u8>) {
        let ctrl = match ControlMessage::deserialize(&bytes) {
            Ok(ctrl) => ctrl,
            Err(e) => {
                log::warn!("a control failed to execute: {}", e);
                return;
            }
        };
        if !ctrl.is_request() {
            log::warn!(
                "dropping non-request control, transaction {}",
                ctrl.transaction_id
            );
            return;
        }
        log::debug!(
            "received control {:?}, transaction {}",
            ctrl.command().unwrap_or("<none>"),
            ctrl.transaction_id
        );
        let outcome = self.dispatch(&ctrl);
        match outcome {
            Ok(Some(message)) => self.respond(ctrl, true, message),
            Ok(None) => {} // response deferred
            Err(e) => {
                match &e {
                    AgentError::State(_) => log::warn!(
                        "control {:?} rejected: {}",
                        ctrl.command().unwrap_or("<none>"),
                        e
                    ),
                    _ => log::error!(
                        "control {:?} failed: {}",
                        ctrl.command().unwrap_or("<none>"),
                        e
                    ),
                }
                self.respond(ctrl, false, Value::String(e.to_string()));
            }
        }
    }

    fn respond(&self, mut ctrl: ControlMessage, success: bool, message: Value) {
        ctrl.set_response(success, message);
        self.channel.deliver(ctrl);
    }

    /// Route a request to its handler. `Ok(None)` means the response was
    /// deferred.
    fn dispatch(self: &Arc<Self>, ctrl: &ControlMessage) -> AgentResult<Option<Value>> {
        let command = ctrl
            .command()
            .ok_or_else(|| AgentError::protocol("request carries no command"))?;
        match command {
            commands::CONFIGURE_LOGGING => {
                let cfg: LogConfig = parse_request(ctrl.request_body()?)?;
                AgentLogger::configure(&cfg)?;
                Ok(Some(Value::String("logging configuration applied".into())))
            }
            commands::CREATE_TUNNEL => {
                let info = self.create_tunnel(ctrl.request_body()?)?;
                Ok(Some(info))
            }
            commands::CREATE_LINK => self.create_link(ctrl),
            commands::QUERY_CAS => {
                let cas = self.tunnel()?.query_link_cas()?;
                Ok(Some(cas))
            }
            commands::QUERY_LINK_STATS => {
                let tunnel = self.tunnel()?;
                let mut per_link = serde_json::Map::new();
                if let Some(link_id) = tunnel.query_link_id() {
                    per_link.insert(link_id, tunnel.query_link_info());
                }
                let mut stats = serde_json::Map::new();
                stats.insert(tunnel.descriptor().uid.clone(), Value::Object(per_link));
                Ok(Some(Value::Object(stats)))
            }
            commands::QUERY_TUNNEL_INFO => Ok(Some(self.tunnel()?.query_info())),
            commands::REMOVE_LINK => {
                let link_id = ctrl
                    .request_body()?
                    .get("LinkId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AgentError::protocol("RemoveLink requires LinkId"))?
                    .to_string();
                self.tunnel()?.remove_link(&link_id)?;
                Ok(Some(Value::String("link removed".into())))
            }
            commands::REMOVE_TUNNEL => {
                let tunnel = self
                    .tunnel
                    .lock()
                    .expect("agent tunnel poisoned")
                    .take()
                    .ok_or_else(|| AgentError::state("no tunnel exists"))?;
                tunnel.destroy();
                log::info!("tunnel {} removed", self.tunnel_id);
                Ok(Some(Value::String("tunnel removed".into())))
            }
            commands::ECHO => {
                let message = ctrl
                    .request_body()?
                    .get("Message")
                    .cloned()
                    .unwrap_or_else(|| Value::String(String::new()));
                Ok(Some(message))
            }
            other => Err(AgentError::protocol(format!(
                "unrecognized command: {}",
                other
            ))),
        }
    }

    fn create_tunnel(self: &Arc<Self>, body: &Value) -> AgentResult<Value> {
        let params: CreateTunnelParams = parse_request(body)?;
        if params.tunnel_id != self.tunnel_id {
            return Err(AgentError::protocol(format!(
                "this process owns tunnel {}, not {}",
                self.tunnel_id, params.tunnel_id
            )));
        }
        if self.tunnel.lock().expect("agent tunnel poisoned").is_some() {
            return Err(AgentError::state(
                "the specified tunnel identifier already exists",
            ));
        }
        let descriptor = TunnelDescriptor {
            uid: params.tunnel_id.clone(),
            node_id: params.node_id.clone(),
            stun_servers: params.stun_servers.clone(),
            turn_descs: params
                .turn_servers
                .iter()
                .map(|t| TurnDescriptor {
                    address: t.address.clone(),
                    user: t.user.clone(),
                    password: t.password.clone(),
                })
                .collect(),
        };
        let weak = Arc::downgrade(self);
        let cas_ready: crate::tunnel::CasReadyHandler = Arc::new(move |tid, cas| {
            if let Some(agent) = weak.upgrade() {
                agent.on_local_cas_ready(tid, cas);
            }
        });
        let tunnel = Tunnel::create(
            descriptor,
            TapDescriptor::new(params.tap_name.clone(), params.mtu),
            params.ignored_net_interfaces.clone(),
            self.channel.clone(),
            self.pool.clone(),
            self.reactor.clone(),
            self.next_tid.clone(),
            cas_ready,
        )?;
        tunnel.start()?;
        let info = tunnel.query_info();
        *self.tunnel.lock().expect("agent tunnel poisoned") = Some(tunnel);
        Ok(info)
    }

    fn create_link(self: &Arc<Self>, ctrl: &ControlMessage) -> AgentResult<Option<Value>> {
        let body = ctrl.request_body()?;
        let params: CreateLinkParams = parse_request(body)?;
        if self.tunnel.lock().expect("agent tunnel poisoned").is_none() {
            // combined create: the link request carries the tunnel fields
            self.create_tunnel(body)?;
        }
        let tunnel = self.tunnel()?;
        if params.tunnel_id != tunnel.descriptor().uid {
            return Err(AgentError::protocol(format!(
                "this process owns tunnel {}, not {}",
                tunnel.descriptor().uid,
                params.tunnel_id
            )));
        }
        let peer = PeerDescriptor {
            uid: params.peer_info.uid,
            cas: params.peer_info.cas,
            fingerprint: params.peer_info.fingerprint,
            mac_address: params.peer_info.mac_address,
        };
        let tid = ctrl.transaction_id;
        // park the control before the link can race its CAS signal
        self.inprogress
            .lock()
            .expect("inprogress table poisoned")
            .insert(tid, ctrl.clone());
        let link = match tunnel.create_vlink(&params.link_id, peer, tid) {
            Ok(link) => link,
            Err(e) => {
                self.inprogress
                    .lock()
                    .expect("inprogress table poisoned")
                    .remove(&tid);
                return Err(e);
            }
        };
        if link.is_gathering_complete() {
            let parked = self
                .inprogress
                .lock()
                .expect("inprogress table poisoned")
                .remove(&tid);
            if parked.is_some() {
                let mut info = tunnel.query_info();
                if let Value::Object(map) = &mut info {
                    map.insert("CAS".into(), Value::String(link.candidates()));
                    map.insert(
                        "IceRole".into(),
                        Value::String(link.ice_role().as_str().into()),
                    );
                }
                return Ok(Some(info));
            }
            // the CAS signal already delivered the response
        }
        Ok(None)
    }

    /// Complete a deferred `CreateLink` once the link's local CAS is
    /// known. Runs on the network worker.
    fn on_local_cas_ready(&self, tid: u64, cas: String) {
        let parked = self
            .inprogress
            .lock()
            .expect("inprogress table poisoned")
            .remove(&tid);
        let Some(ctrl) = parked else {
            log::debug!("no pending control for transaction id {}", tid);
            return;
        };
        if cas.is_empty() {
            log::warn!("no local candidates available on this link");
        }
        let mut message = self
            .tunnel
            .lock()
            .expect("agent tunnel poisoned")
            .as_ref()
            .map(|t| t.query_info())
            .unwrap_or_else(|| json!({}));
        if let Value::Object(map) = &mut message {
            map.insert("CAS".into(), Value::String(cas.clone()));
        }
        self.respond(ctrl, !cas.is_empty(), message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Endpoint;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::os::fd::{AsRawFd, OwnedFd};

    struct Fixture {
        agent: Arc<Agent>,
        channel: Arc<ControlChannel>,
        controller_end: OwnedFd,
    }

    fn fixture() -> Fixture {
        let reactor = Arc::new(Reactor::new().unwrap());
        let (agent_end, controller_end) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .unwrap();
        let channel = ControlChannel::from_fd(reactor.clone(), agent_end);
        let agent = Agent::with_channel(reactor, channel.clone(), "T1".to_string());
        Fixture {
            agent,
            channel,
            controller_end,
        }
    }

    fn pump_response(fixture: &Fixture) -> ControlMessage {
        // one step for the length datagram, one for the body
        Endpoint::write_next(&*fixture.channel).unwrap();
        Endpoint::write_next(&*fixture.channel).unwrap();
        let mut buf = vec![0u8; 65536];
        // SAFETY: buf is valid for the calls
        let n = unsafe {
            libc::recv(
                fixture.controller_end.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
            )
        };
        assert_eq!(n, 2, "expected a length datagram");
        let n = unsafe {
            libc::recv(
                fixture.controller_end.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
            )
        };
        assert!(n > 0, "expected a body datagram");
        ControlMessage::deserialize(&buf[..n as usize]).unwrap()
    }

    fn request(tid: u64, command: &str, fields: Value) -> Vec<u8> {
        let mut ctrl = ControlMessage::new_request(tid, command);
        if let Value::Object(map) = fields {
            for (k, v) in map {
                ctrl.set_request_field(&k, v);
            }
        }
        ctrl.serialize().unwrap().into_bytes()
    }

    #[test]
    fn test_echo_roundtrip() {
        let fx = fixture();
        fx.agent.handle_controller_message(request(
            11,
            commands::ECHO,
            json!({"Message": "ping"}),
        ));
        let resp = pump_response(&fx);
        assert_eq!(resp.transaction_id, 11);
        let body = resp.response.unwrap();
        assert!(body.success);
        assert_eq!(body.message, Value::String("ping".into()));
    }

    #[test]
    fn test_unknown_command_fails() {
        let fx = fixture();
        fx.agent
            .handle_controller_message(request(12, "Reboot", json!({})));
        let resp = pump_response(&fx);
        let body = resp.response.unwrap();
        assert!(!body.success);
        assert!(body.message.as_str().unwrap().contains("unrecognized"));
    }

    #[test]
    fn test_query_without_tunnel_is_state_error() {
        let fx = fixture();
        fx.agent
            .handle_controller_message(request(13, commands::QUERY_TUNNEL_INFO, json!({})));
        let resp = pump_response(&fx);
        let body = resp.response.unwrap();
        assert!(!body.success);
        assert!(body.message.as_str().unwrap().contains("no tunnel"));
    }

    #[test]
    fn test_create_tunnel_id_mismatch_rejected() {
        let fx = fixture();
        fx.agent.handle_controller_message(request(
            14,
            commands::CREATE_TUNNEL,
            json!({
                "TunnelId": "OTHER",
                "NodeId": "N1",
                "TapName": "tap0",
                "MTU": 1410,
            }),
        ));
        let resp = pump_response(&fx);
        let body = resp.response.unwrap();
        assert!(!body.success);
        assert!(body.message.as_str().unwrap().contains("owns tunnel T1"));
    }

    #[test]
    fn test_malformed_message_is_dropped() {
        let fx = fixture();
        fx.agent
            .handle_controller_message(b"{broken json".to_vec());
        // no response was queued
        assert!(fx
            .channel
            .is_good());
        Endpoint::write_next(&*fx.channel).unwrap();
        let mut buf = [0u8; 16];
        // SAFETY: buf is valid for the call
        let n = unsafe {
            libc::recv(
                fx.controller_end.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
            )
        };
        assert!(n < 0, "no datagram expected");
    }

    #[test]
    fn test_deferred_response_completes_on_cas() {
        let fx = fixture();
        let mut parked = ControlMessage::new_request(55, commands::CREATE_LINK);
        parked.set_request_field("TunnelId", Value::String("T1".into()));
        fx.agent
            .inprogress
            .lock()
            .unwrap()
            .insert(55, parked);
        fx.agent.on_local_cas_ready(55, "CAS1:deadbeef:AAAA".into());
        let resp = pump_response(&fx);
        assert_eq!(resp.transaction_id, 55);
        let body = resp.response.unwrap();
        assert!(body.success);
        assert_eq!(
            body.message.get("CAS").and_then(Value::as_str),
            Some("CAS1:deadbeef:AAAA")
        );
        // exactly once: the table entry is gone
        assert!(fx.agent.inprogress.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_cas_transaction_dropped() {
        let fx = fixture();
        fx.agent.on_local_cas_ready(99, "CAS".into());
        Endpoint::write_next(&*fx.channel).unwrap();
        let mut buf = [0u8; 16];
        // SAFETY: buf is valid for the call
        let n = unsafe {
            libc::recv(
                fx.controller_end.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
            )
        };
        assert!(n < 0, "no datagram expected");
    }

    #[test]
    fn test_signal_handler_idempotent() {
        request_stop(libc::SIGTERM);
        request_stop(libc::SIGTERM);
        assert!(exit_requested());
        EXIT_FLAG.store(false, Ordering::Release);
    }
}
