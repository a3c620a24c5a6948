//! Shared socket for the nominated path.
//!
//! After nomination the one UDP socket carries two protocols: STUN
//! keepalives for the ICE agent and QUIC for the secure datagram session.
//! `PathSocket` demultiplexes by first byte (STUN always starts 0x00-0x03,
//! QUIC never does) and feeds STUN to the `IceKeepalive` task while
//! presenting the QUIC flow to quinn through its `AsyncUdpSocket` trait.

use std::future::Future;
use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use str0m::ice::{IceAgent, IceAgentEvent, StunMessage, StunPacket};
use str0m::net::Protocol;
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

/// STUN's first two bits are zero, so the first byte is 0x00-0x03.
fn is_stun_packet(data: &[u8]) -> bool {
    matches!(data.first(), Some(b) if *b <= 0x03)
}

/// Headroom for keepalive bursts; overflow drops are logged.
const STUN_CHANNEL_CAPACITY: usize = 128;

pub(crate) struct StunDatagram {
    source: SocketAddr,
    data: Vec<u8>,
}

/// The nominated path's socket, shared between quinn and the ICE agent.
#[derive(Debug)]
pub struct PathSocket {
    io: UdpSocket,
    inner: quinn::udp::UdpSocketState,
    stun_tx: mpsc::Sender<StunDatagram>,
    local_addr: SocketAddr,
}

impl PathSocket {
    /// Wrap `io`, returning the socket and the receiver feeding STUN
    /// traffic to the keepalive task.
    pub(crate) fn new(io: UdpSocket) -> io::Result<(Arc<Self>, mpsc::Receiver<StunDatagram>)> {
        let local_addr = io.local_addr()?;
        let inner = quinn::udp::UdpSocketState::new((&io).into())?;
        let (stun_tx, stun_rx) = mpsc::channel(STUN_CHANNEL_CAPACITY);
        Ok((
            Arc::new(Self {
                io,
                inner,
                stun_tx,
                local_addr,
            }),
            stun_rx,
        ))
    }

    fn route_stun(&self, source: SocketAddr, data: Vec<u8>) {
        match self.stun_tx.try_send(StunDatagram { source, data }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!(
                    "keepalive channel full, dropping STUN packet from {}",
                    source
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // keepalive task gone; nothing left to feed
            }
        }
    }
}

impl AsyncUdpSocket for PathSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(PathPoller {
            socket: self,
            fut: None,
        })
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        self.io.try_io(Interest::WRITABLE, || {
            self.inner.send((&self.io).into(), transmit)
        })
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        loop {
            std::task::ready!(self.io.poll_recv_ready(cx))?;
            match self.io.try_io(Interest::READABLE, || {
                self.inner.recv((&self.io).into(), bufs, meta)
            }) {
                Ok(count) => {
                    // route STUN out of band, compact the QUIC packets down
                    let mut kept = 0;
                    for i in 0..count {
                        let len = meta[i].len;
                        if is_stun_packet(&bufs[i][..len]) {
                            self.route_stun(meta[i].addr, bufs[i][..len].to_vec());
                            continue;
                        }
                        if kept < i {
                            meta[kept] = meta[i];
                            let (head, tail) = bufs.split_at_mut(kept + 1);
                            let src = i - (kept + 1);
                            head[kept][..len].copy_from_slice(&tail[src][..len]);
                        }
                        kept += 1;
                    }
                    if kept > 0 {
                        return Poll::Ready(Ok(kept));
                    }
                    // every packet was STUN; wait for QUIC traffic
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // readiness was consumed; re-register the waker
                    continue;
                }
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn may_fragment(&self) -> bool {
        self.inner.may_fragment()
    }

    fn max_transmit_segments(&self) -> usize {
        self.inner.max_gso_segments()
    }

    fn max_receive_segments(&self) -> usize {
        self.inner.gro_segments()
    }
}

struct PathPoller {
    socket: Arc<PathSocket>,
    fut: Option<Pin<Box<dyn Future<Output = io::Result<()>> + Send + Sync>>>,
}

impl std::fmt::Debug for PathPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathPoller").finish_non_exhaustive()
    }
}

impl UdpPoller for PathPoller {
    fn poll_writable(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        if self.fut.is_none() {
            let socket = self.socket.clone();
            self.fut = Some(Box::pin(async move { socket.io.writable().await }));
        }
        let result = Pin::new(self.fut.as_mut().unwrap()).poll(cx);
        if result.is_ready() {
            self.fut = None;
        }
        result
    }
}

/// Drives the ICE agent after nomination: answers keepalives, emits
/// scheduled transmits, and flags the path when connectivity is lost.
pub struct IceKeepalive {
    ice: IceAgent,
    socket: Arc<PathSocket>,
    stun_rx: mpsc::Receiver<StunDatagram>,
    local_addr: SocketAddr,
    disconnect_tx: watch::Sender<bool>,
}

impl IceKeepalive {
    pub(crate) fn new(
        ice: IceAgent,
        socket: Arc<PathSocket>,
        stun_rx: mpsc::Receiver<StunDatagram>,
        local_addr: SocketAddr,
        disconnect_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            ice,
            socket,
            stun_rx,
            local_addr,
            disconnect_tx,
        }
    }

    /// Run until the path disconnects or the socket goes away. Spawned on
    /// the network worker alongside the secure session.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(Duration::from_millis(50));
        loop {
            tokio::select! {
                biased;

                _ = interval.tick() => {
                    self.ice.handle_timeout(Instant::now());
                    self.flush_transmits().await;
                    if self.drain_events() {
                        break;
                    }
                }

                incoming = self.stun_rx.recv() => {
                    match incoming {
                        Some(datagram) => {
                            self.handle_stun(datagram);
                            self.flush_transmits().await;
                            if self.drain_events() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }

    fn handle_stun(&mut self, datagram: StunDatagram) {
        if let Ok(message) = StunMessage::parse(&datagram.data) {
            self.ice.handle_packet(
                Instant::now(),
                StunPacket {
                    proto: Protocol::Udp,
                    source: datagram.source,
                    destination: self.local_addr,
                    message,
                },
            );
        }
    }

    async fn flush_transmits(&mut self) {
        while let Some(transmit) = self.ice.poll_transmit() {
            if let Err(e) = self
                .socket
                .io
                .send_to(&transmit.contents, transmit.destination)
                .await
            {
                log::debug!(
                    "keepalive send of {} bytes to {} failed: {}",
                    transmit.contents.len(),
                    transmit.destination,
                    e
                );
            }
        }
    }

    /// True when the agent reports the path lost.
    fn drain_events(&mut self) -> bool {
        let mut disconnected = false;
        while let Some(event) = self.ice.poll_event() {
            if let IceAgentEvent::IceConnectionStateChange(state) = event {
                if state.is_disconnected() {
                    let _ = self.disconnect_tx.send(true);
                    disconnected = true;
                }
            }
        }
        disconnected
    }
}

/// A nominated, verified peer path ready for the secure session.
pub struct NominatedPath {
    /// Shared socket for quinn.
    pub socket: Arc<PathSocket>,
    /// Keepalive task to spawn for the life of the link.
    pub keepalive: IceKeepalive,
    /// The peer address ICE nominated.
    pub remote_addr: SocketAddr,
    /// Signals true when ICE declares the path lost.
    pub disconnect_rx: watch::Receiver<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stun_classification() {
        assert!(is_stun_packet(&[0x00, 0x01]));
        assert!(is_stun_packet(&[0x03]));
        assert!(!is_stun_packet(&[0x40, 0x00]));
        assert!(!is_stun_packet(&[0xc0]));
        assert!(!is_stun_packet(&[]));
    }
}
