//! Candidate gathering and connectivity checks using str0m.
//!
//! Gathering collects host candidates from the non-ignored interfaces and
//! server-reflexive candidates from the configured STUN servers. The local
//! candidate set travels to the peer, out of band, as an opaque encoded
//! payload (`CandidateSet`). Connectivity drives the str0m agent until a
//! remote address is nominated, then hands the socket to the secure layer.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use str0m::ice::{IceAgent, IceAgentEvent, IceCreds, StunMessage, StunPacket};
use str0m::net::{Protocol, Transmit};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::sleep_until;

use crate::transport::mux::{IceKeepalive, NominatedPath, PathSocket};

/// ICE role negotiated per link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    Controlling,
    Controlled,
}

impl IceRole {
    /// The lexicographically smaller node id controls; identities are
    /// globally unique so ties cannot occur.
    pub fn select(local_node_id: &str, peer_uid: &str) -> Self {
        if local_node_id < peer_uid {
            IceRole::Controlling
        } else {
            IceRole::Controlled
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IceRole::Controlling => "Controlling",
            IceRole::Controlled => "Controlled",
        }
    }
}

const CAS_PREFIX: &str = "CAS";
const CAS_VERSION: u16 = 1;

/// The candidate address set exchanged with the peer: ICE credentials plus
/// the gathered candidates, carried as one opaque string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSet {
    pub ufrag: String,
    pub pwd: String,
    pub candidates: Vec<String>,
}

impl CandidateSet {
    /// Encode to the wire form: `CAS<version>:<crc32>:<base64(json)>`.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).context("candidate set serialization failed")?;
        let checksum = crc32(&json);
        Ok(format!(
            "{}{}:{:08x}:{}",
            CAS_PREFIX,
            CAS_VERSION,
            checksum,
            URL_SAFE_NO_PAD.encode(&json)
        ))
    }

    /// Decode the wire form, verifying version and checksum.
    pub fn decode(payload: &str) -> Result<Self> {
        let trimmed = payload.trim();
        let mut parts = trimmed.splitn(3, ':');
        let header = parts.next().ok_or_else(|| anyhow!("candidate set missing header"))?;
        let checksum_hex = parts
            .next()
            .ok_or_else(|| anyhow!("candidate set missing checksum"))?;
        let body = parts.next().ok_or_else(|| anyhow!("candidate set missing body"))?;

        let version = header
            .strip_prefix(CAS_PREFIX)
            .ok_or_else(|| anyhow!("candidate set missing prefix"))?;
        if version != CAS_VERSION.to_string() {
            return Err(anyhow!(
                "candidate set version mismatch (expected {}, got {})",
                CAS_VERSION,
                version
            ));
        }
        let expected_crc =
            u32::from_str_radix(checksum_hex, 16).context("candidate set checksum malformed")?;
        let decoded = URL_SAFE_NO_PAD
            .decode(body.as_bytes())
            .context("candidate set base64 decode failed")?;
        let actual_crc = crc32(&decoded);
        if actual_crc != expected_crc {
            return Err(anyhow!(
                "candidate set checksum mismatch (expected {:08x}, got {:08x})",
                expected_crc,
                actual_crc
            ));
        }
        serde_json::from_slice(&decoded).context("candidate set json parse failed")
    }
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// A gathering/connectivity session over one UDP socket.
pub struct IceEndpoint {
    udp: UdpSocket,
    ice: IceAgent,
    local_candidates: Vec<String>,
}

impl IceEndpoint {
    /// Bind a socket and gather host plus server-reflexive candidates.
    /// Interfaces named in `ignored_interfaces` contribute nothing.
    pub async fn gather(
        stun_servers: &[String],
        ignored_interfaces: &[String],
    ) -> Result<Self> {
        let provider = str0m::crypto::from_feature_flags();
        let sha1 = provider.sha1_hmac_provider;
        provider.install_process_default();

        let mut ice = IceAgent::with_hmac(IceCreds::new(), sha1);

        let socket = std::net::UdpSocket::bind("0.0.0.0:0")
            .context("failed to bind UDP socket for candidate gathering")?;
        socket
            .set_nonblocking(true)
            .context("failed to set gathering socket nonblocking")?;
        let local_port = socket.local_addr().context("gathering socket local addr")?.port();
        let base_addr = socket.local_addr().context("gathering socket local addr")?;
        let udp = UdpSocket::from_std(socket).context("failed to adopt gathering socket")?;

        let mut local_candidates = Vec::new();
        for ip in usable_interface_addrs(ignored_interfaces) {
            let host_addr = SocketAddr::new(IpAddr::V4(ip), local_port);
            if let Ok(candidate) = str0m::Candidate::host(host_addr, "udp") {
                if let Some(added) = ice.add_local_candidate(candidate) {
                    local_candidates.push(added.to_sdp_string());
                }
            }
        }

        for stun in stun_servers {
            let Some(server) = resolve_stun_addr(stun) else {
                log::warn!("unresolvable STUN server: {}", stun);
                continue;
            };
            let client = stunclient::StunClient::new(server);
            match client.query_external_address_async(&udp).await {
                Ok(external) => {
                    if let Ok(candidate) =
                        str0m::Candidate::server_reflexive(external, base_addr, "udp")
                    {
                        if let Some(added) = ice.add_local_candidate(candidate) {
                            local_candidates.push(added.to_sdp_string());
                        }
                    }
                }
                Err(e) => {
                    log::warn!("STUN query failed for {}: {}", stun, e);
                }
            }
        }

        if local_candidates.is_empty() {
            log::warn!("candidate gathering produced no local candidates");
        }

        Ok(Self {
            udp,
            ice,
            local_candidates,
        })
    }

    /// The local candidate set to hand to the peer.
    pub fn local_candidate_set(&self) -> CandidateSet {
        let creds = self.ice.local_credentials().clone();
        CandidateSet {
            ufrag: creds.ufrag,
            pwd: creds.pass,
            candidates: self.local_candidates.clone(),
        }
    }

    /// Run connectivity checks against the peer's candidate set until a
    /// remote address is nominated, then wrap the socket for the secure
    /// layer. The returned keepalive must be spawned to keep the path
    /// verified.
    pub async fn connect(mut self, role: IceRole, remote: CandidateSet) -> Result<NominatedPath> {
        self.ice
            .set_controlling(matches!(role, IceRole::Controlling));
        self.ice.set_remote_credentials(IceCreds {
            ufrag: remote.ufrag,
            pass: remote.pwd,
        });
        for candidate in remote.candidates {
            let parsed = str0m::Candidate::from_sdp_string(&candidate)
                .with_context(|| format!("invalid remote candidate: {}", candidate))?;
            self.ice.add_remote_candidate(parsed);
        }

        let mut nominated: Option<SocketAddr> = None;
        self.ice.handle_timeout(Instant::now());
        let mut next_deadline = self.ice.poll_timeout();
        let mut buf = vec![0u8; 2000];

        loop {
            drain_transmit(&mut self.ice, &self.udp).await?;
            if drain_events(&mut self.ice, &mut nominated) {
                return Err(anyhow!("connectivity checks failed"));
            }

            if self.ice.state().is_connected() {
                if let Some(remote_addr) = nominated {
                    let local_addr = self.udp.local_addr().context("nominated path local addr")?;
                    let (socket, stun_rx) = PathSocket::new(self.udp)?;
                    let (disconnect_tx, disconnect_rx) = watch::channel(false);
                    let keepalive = IceKeepalive::new(
                        self.ice,
                        socket.clone(),
                        stun_rx,
                        local_addr,
                        disconnect_tx,
                    );
                    return Ok(NominatedPath {
                        socket,
                        keepalive,
                        remote_addr,
                        disconnect_rx,
                    });
                }
            }

            let deadline =
                next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_millis(50));
            let sleep = sleep_until(tokio::time::Instant::from_std(deadline));

            tokio::select! {
                result = self.udp.recv_from(&mut buf) => {
                    let (len, source) = result.context("candidate check recv failed")?;
                    if let Ok(message) = StunMessage::parse(&buf[..len]) {
                        let destination = self.udp.local_addr().context("gathering socket local addr")?;
                        let packet = StunPacket {
                            proto: Protocol::Udp,
                            source,
                            destination,
                            message,
                        };
                        self.ice.handle_packet(Instant::now(), packet);
                    }
                }
                _ = sleep => {
                    self.ice.handle_timeout(Instant::now());
                    next_deadline = self.ice.poll_timeout();
                }
            }
        }
    }
}

/// IPv4 addresses of interfaces eligible for host candidates.
fn usable_interface_addrs(ignored_interfaces: &[String]) -> Vec<std::net::Ipv4Addr> {
    let mut addrs = Vec::new();
    let Ok(ifaddrs) = nix::ifaddrs::getifaddrs() else {
        return addrs;
    };
    for ifaddr in ifaddrs {
        if ifaddr
            .flags
            .contains(nix::net::if_::InterfaceFlags::IFF_LOOPBACK)
        {
            continue;
        }
        if ignored_interfaces.contains(&ifaddr.interface_name) {
            continue;
        }
        let Some(addr) = ifaddr.address else { continue };
        let Some(sin) = addr.as_sockaddr_in() else {
            continue;
        };
        let ip = sin.ip();
        if !ip.is_unspecified() {
            addrs.push(ip);
        }
    }
    addrs
}

fn resolve_stun_addr(stun: &str) -> Option<SocketAddr> {
    match stun.to_socket_addrs() {
        Ok(mut iter) => iter.find(|addr| addr.is_ipv4()),
        Err(_) => None,
    }
}

async fn drain_transmit(ice: &mut IceAgent, udp: &UdpSocket) -> Result<()> {
    while let Some(Transmit {
        destination,
        contents,
        ..
    }) = ice.poll_transmit()
    {
        udp.send_to(&contents, destination)
            .await
            .context("failed to send connectivity check")?;
    }
    Ok(())
}

/// Drain agent events into `nominated`; true when the checks failed.
fn drain_events(ice: &mut IceAgent, nominated: &mut Option<SocketAddr>) -> bool {
    let mut failed = false;
    while let Some(event) = ice.poll_event() {
        match event {
            IceAgentEvent::IceConnectionStateChange(state) => {
                log::debug!("connectivity state: {:?}", state);
                if state.is_disconnected() {
                    failed = true;
                }
            }
            IceAgentEvent::NominatedSend { destination, .. } => {
                *nominated = Some(destination);
            }
            _ => {}
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> CandidateSet {
        CandidateSet {
            ufrag: "u1".into(),
            pwd: "p1".into(),
            candidates: vec![
                "candidate:1 1 udp 2130706431 192.0.2.10 51472 typ host".into(),
                "candidate:2 1 udp 1694498815 203.0.113.7 51472 typ srflx".into(),
            ],
        }
    }

    #[test]
    fn test_candidate_set_roundtrip() {
        let set = sample_set();
        let encoded = set.encode().unwrap();
        assert!(encoded.starts_with("CAS1:"));
        let decoded = CandidateSet::decode(&encoded).unwrap();
        assert_eq!(set, decoded);
    }

    #[test]
    fn test_candidate_set_detects_corruption() {
        let encoded = sample_set().encode().unwrap();
        // flip a character inside the base64 body
        let mut corrupted: Vec<char> = encoded.chars().collect();
        let last = corrupted.len() - 1;
        corrupted[last] = if corrupted[last] == 'A' { 'B' } else { 'A' };
        let corrupted: String = corrupted.into_iter().collect();
        assert!(CandidateSet::decode(&corrupted).is_err());
    }

    #[test]
    fn test_candidate_set_rejects_foreign_payload() {
        assert!(CandidateSet::decode("nonsense").is_err());
        assert!(CandidateSet::decode("CAS9:00000000:AAAA").is_err());
    }

    #[test]
    fn test_role_selection_is_antisymmetric() {
        assert_eq!(IceRole::select("aaaa", "bbbb"), IceRole::Controlling);
        assert_eq!(IceRole::select("bbbb", "aaaa"), IceRole::Controlled);
        assert_eq!(IceRole::Controlling.as_str(), "Controlling");
        assert_eq!(IceRole::Controlled.as_str(), "Controlled");
    }
}
