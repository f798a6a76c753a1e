//! Underlay: the UDP socket peers reach directly, packet sealing, and local
//! endpoint discovery.
//!
//! Every packet between peers, direct or relayed, has the same layout:
//!
//! ```text
//!  0      2      3                               35
//!  ├──────┼──────┼───────────────────────────────┼──────────────────────┤
//!  │ "TM" │ ver  │       sender node key         │ sealed bincode body  │
//!  └──────┴──────┴───────────────────────────────┴──────────────────────┘
//! ```
//!
//! The header is authenticated as associated data, so a packet cannot be
//! replayed under another sender's key. STUN responses share the socket
//! and are told apart by their magic cookie.

use crate::callback::LocalNode;
use crate::config::EngineTimings;
use crate::netstack::Frame;
use crate::relay_pool::RelayPool;
use crate::session::PathKind;
use crate::{Endpoint, EndpointSource, EngineError};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tailmesh_crypto::{NodeKey, PeerCipher};
use tailmesh_relay::RegionId;
use tailmesh_relay::stun::{StunClass, StunMessage, is_stun_packet};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

const MAGIC: &[u8; 2] = b"TM";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 3 + 32;
const MAX_DATAGRAM: usize = 65_535;

/// Socket buffer size requested from the kernel.
const SOCKET_BUFFER: usize = 2 * 1024 * 1024;

/// Address used only to learn which local interface routes outward.
const ROUTE_PROBE: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 9);

/// Sealed peer-to-peer messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Message {
    /// Path probe
    Ping { tx_id: u64 },
    /// Probe answer, with the address the ping arrived from when direct
    Pong {
        tx_id: u64,
        observed: Option<SocketAddr>,
    },
    /// Overlay stream segment
    Stream(Frame),
}

/// Raw input for the dispatcher.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// A packet and the path it came in on; relays also name the sender
    Packet {
        from: Option<NodeKey>,
        path: PathKind,
        bytes: Vec<u8>,
    },
    /// A relay could not deliver to `peer`
    PeerGone { region: RegionId, peer: NodeKey },
}

/// Seal `msg` for the peer behind `cipher`.
pub(crate) fn seal(local: &NodeKey, cipher: &PeerCipher, msg: &Message) -> Result<Vec<u8>, EngineError> {
    let body = bincode::serialize(msg).map_err(|e| EngineError::Io(e.to_string()))?;
    let mut packet = Vec::with_capacity(HEADER_LEN + body.len() + 64);
    packet.extend_from_slice(MAGIC);
    packet.push(VERSION);
    packet.extend_from_slice(local.as_bytes());
    let sealed = cipher.seal(&body, &packet)?;
    packet.extend_from_slice(&sealed);
    Ok(packet)
}

/// Claimed sender of a packet, if the header is well formed.
pub(crate) fn sender(packet: &[u8]) -> Option<NodeKey> {
    if packet.len() < HEADER_LEN || &packet[..2] != MAGIC || packet[2] != VERSION {
        return None;
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&packet[3..HEADER_LEN]);
    Some(NodeKey::from_bytes(key))
}

/// Authenticate and decode a packet from the peer behind `cipher`.
pub(crate) fn open(cipher: &PeerCipher, packet: &[u8]) -> Result<Message, EngineError> {
    if packet.len() < HEADER_LEN {
        return Err(EngineError::Crypto("packet too short".into()));
    }
    let (header, sealed) = packet.split_at(HEADER_LEN);
    let body = cipher.open(sealed, header)?;
    bincode::deserialize(&body).map_err(|e| EngineError::Io(e.to_string()))
}

/// The underlay socket plus the relay pool.
pub(crate) struct Magicsock {
    key: NodeKey,
    socket: Arc<UdpSocket>,
    pool: RelayPool,
    stun_pending: Mutex<HashMap<[u8; 12], oneshot::Sender<SocketAddr>>>,
}

impl Magicsock {
    /// Bind the underlay on all IPv4 interfaces.
    pub(crate) fn bind(key: NodeKey, port: u16, pool: RelayPool) -> Result<Self, EngineError> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let construction = |e: std::io::Error| EngineError::Construction(format!("underlay {addr}: {e}").into());

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(construction)?;
        // Best effort; the kernel may clamp these.
        let _ = socket.set_recv_buffer_size(SOCKET_BUFFER);
        let _ = socket.set_send_buffer_size(SOCKET_BUFFER);
        socket.bind(&addr.into()).map_err(construction)?;
        socket.set_nonblocking(true).map_err(construction)?;
        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(construction)?;

        Ok(Self {
            key,
            socket: Arc::new(socket),
            pool,
            stun_pending: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn local_port(&self) -> Result<u16, EngineError> {
        Ok(self.socket.local_addr()?.port())
    }

    pub(crate) fn pool(&self) -> &RelayPool {
        &self.pool
    }

    /// Seal and send `msg` over `path`. Datagrams the socket cannot take
    /// right now are dropped.
    pub(crate) fn send(&self, cipher: &PeerCipher, path: &PathKind, msg: &Message) -> Result<(), EngineError> {
        let packet = seal(&self.key, cipher, msg)?;
        match path {
            PathKind::Direct(addr) => match self.socket.try_send_to(&packet, *addr) {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    tracing::debug!(%addr, "underlay busy, dropping datagram");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            PathKind::Relay(region) => self.pool.send(*region, cipher.peer(), packet),
        }
    }

    /// Read datagrams until cancelled, forwarding peer packets.
    pub(crate) async fn run_reader(self: Arc<Self>, inbound: mpsc::Sender<Inbound>, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok(r) => r,
                    Err(e) => {
                        // ICMP errors from earlier sends surface here on some platforms.
                        tracing::debug!("underlay recv: {e}");
                        continue;
                    }
                },
            };
            let bytes = &buf[..len];
            if is_stun_packet(bytes) {
                self.on_stun(bytes);
                continue;
            }
            let packet = Inbound::Packet {
                from: None,
                path: PathKind::Direct(from),
                bytes: bytes.to_vec(),
            };
            if inbound.try_send(packet).is_err() {
                tracing::debug!(%from, "inbound queue full, dropping datagram");
            }
        }
    }

    fn on_stun(&self, bytes: &[u8]) {
        let Ok(msg) = StunMessage::decode(bytes) else {
            return;
        };
        if msg.class != StunClass::SuccessResponse {
            return;
        }
        let waiter = self
            .stun_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&msg.transaction_id);
        if let (Some(waiter), Some(mapped)) = (waiter, msg.mapped) {
            let _ = waiter.send(mapped);
        }
    }

    /// Ask one STUN server for our reflexive address.
    async fn stun_query(&self, server: SocketAddr, timeout: Duration) -> Option<SocketAddr> {
        let request = StunMessage::binding_request();
        let (tx, rx) = oneshot::channel();
        self.stun_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.transaction_id, tx);

        let result = match self.socket.send_to(&request.encode(), server).await {
            Ok(_) => tokio::time::timeout(timeout, rx).await.ok().and_then(Result::ok),
            Err(e) => {
                tracing::debug!(%server, "STUN request failed: {e}");
                None
            }
        };
        self.stun_pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request.transaction_id);
        result
    }

    /// Current candidate endpoints: loopback, the outbound interface and
    /// whatever the map's STUN servers report. Queries run on `tracker` and
    /// give up when `cancel` fires.
    async fn discover(
        self: &Arc<Self>,
        timings: &EngineTimings,
        tracker: &TaskTracker,
        cancel: &CancellationToken,
    ) -> Vec<Endpoint> {
        let Ok(port) = self.local_port() else {
            return Vec::new();
        };
        let mut endpoints = vec![Endpoint::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            EndpointSource::Local,
        )];
        if let Some(ip) = outbound_ip() {
            endpoints.push(Endpoint::new(SocketAddr::new(ip, port), EndpointSource::Local));
        }

        let servers = self.pool.stun_addrs();
        let (tx, mut rx) = mpsc::channel(servers.len().max(1));
        for server in servers {
            let sock = self.clone();
            let timeout = timings.stun_timeout;
            let cancel = cancel.clone();
            let tx = tx.clone();
            tracker.spawn(
                async move {
                    let mapped = tokio::select! {
                        () = cancel.cancelled() => None,
                        mapped = sock.stun_query(server, timeout) => mapped,
                    };
                    let _ = tx.send(mapped).await;
                }
                .in_current_span(),
            );
        }
        drop(tx);
        while let Some(res) = rx.recv().await {
            if let Some(mapped) = res {
                endpoints.push(Endpoint::new(mapped, EndpointSource::Stun));
            }
        }
        endpoints
    }

    /// Keep the local node's endpoints fresh until cancelled.
    pub(crate) async fn run_discovery(
        self: Arc<Self>,
        local: Arc<LocalNode>,
        timings: EngineTimings,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) {
        let mut maps = self.pool.subscribe_maps();
        loop {
            let endpoints = self.discover(&timings, &tracker, &cancel).await;
            if cancel.is_cancelled() {
                break;
            }
            tracing::debug!(count = endpoints.len(), "endpoint discovery finished");
            local.set_endpoints(endpoints);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(timings.endpoint_refresh_interval) => {}
                res = maps.changed() => if res.is_err() { break },
            }
        }
    }
}

/// Interface address the OS would use to reach the internet.
fn outbound_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(ROUTE_PROBE).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OverlayPrefix;
    use tailmesh_crypto::NodePrivate;
    use tailmesh_relay::stun::StunServer;
    use tailmesh_relay::{RelayMap, RelayNode, RelayRegion};

    fn pair() -> (NodePrivate, NodePrivate) {
        (NodePrivate::generate(), NodePrivate::generate())
    }

    #[test]
    fn test_seal_open() {
        let (a, b) = pair();
        let ab = PeerCipher::new(&a, &b.public_key()).unwrap();
        let ba = PeerCipher::new(&b, &a.public_key()).unwrap();
        let msg = Message::Pong {
            tx_id: 7,
            observed: Some("10.0.0.1:41641".parse().unwrap()),
        };
        let packet = seal(&a.public_key(), &ab, &msg).unwrap();
        assert_eq!(sender(&packet), Some(a.public_key()));
        assert_eq!(open(&ba, &packet).unwrap(), msg);
    }

    #[test]
    fn test_forged_sender_rejected() {
        let (a, b) = pair();
        let c = NodePrivate::generate();
        let ab = PeerCipher::new(&a, &b.public_key()).unwrap();
        let ba = PeerCipher::new(&b, &a.public_key()).unwrap();
        let mut packet = seal(&a.public_key(), &ab, &Message::Ping { tx_id: 1 }).unwrap();
        packet[3..HEADER_LEN].copy_from_slice(c.public_key().as_bytes());
        assert!(open(&ba, &packet).is_err());
    }

    #[test]
    fn test_sender_rejects_garbage() {
        assert_eq!(sender(b"nope"), None);
        let mut packet = vec![0u8; HEADER_LEN];
        packet[..2].copy_from_slice(b"XX");
        assert_eq!(sender(&packet), None);
    }

    #[tokio::test]
    async fn test_discovery_includes_loopback_and_stun() {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let stun = StunServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let stun_addr = stun.local_addr().unwrap();
        tracker.spawn(stun.run(cancel.clone()));

        let private = NodePrivate::generate();
        let key = private.public_key();
        let local = Arc::new(LocalNode::new(key, vec![OverlayPrefix::random()], false));
        let (tx, _rx) = mpsc::channel(8);
        let pool = RelayPool::new(
            private,
            local,
            tx.clone(),
            EngineTimings::default(),
            tracker.clone(),
            cancel.child_token(),
        );
        let url = url::Url::parse("http://127.0.0.1:1").unwrap();
        pool.set_map(RelayMap::new().with_region(
            RelayRegion::new(1, "t", "test").with_node(RelayNode::new("1a", 1, url).with_stun(stun_addr)),
        ));

        let sock = Arc::new(Magicsock::bind(key, 0, pool).unwrap());
        tracker.spawn(sock.clone().run_reader(tx, cancel.clone()));
        let port = sock.local_port().unwrap();
        let endpoints = sock.discover(&EngineTimings::default(), &tracker, &cancel).await;

        assert!(endpoints.contains(&Endpoint::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            EndpointSource::Local
        )));
        assert!(endpoints.contains(&Endpoint::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            EndpointSource::Stun
        )));

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_discovery_abandons_stun_on_cancel() {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        // Bound but never answers.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stun_addr = silent.local_addr().unwrap();

        let private = NodePrivate::generate();
        let key = private.public_key();
        let local = Arc::new(LocalNode::new(key, vec![OverlayPrefix::random()], false));
        let (tx, _rx) = mpsc::channel(8);
        let pool = RelayPool::new(
            private,
            local,
            tx,
            EngineTimings::default(),
            tracker.clone(),
            cancel.child_token(),
        );
        let url = url::Url::parse("http://127.0.0.1:1").unwrap();
        pool.set_map(RelayMap::new().with_region(
            RelayRegion::new(1, "t", "test").with_node(RelayNode::new("1a", 1, url).with_stun(stun_addr)),
        ));
        let sock = Arc::new(Magicsock::bind(key, 0, pool).unwrap());

        let timings = EngineTimings {
            stun_timeout: Duration::from_secs(60),
            ..EngineTimings::default()
        };
        let discovery = {
            let (sock, tracker, cancel) = (sock.clone(), tracker.clone(), cancel.clone());
            tokio::spawn(async move { sock.discover(&timings, &tracker, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let endpoints = tokio::time::timeout(Duration::from_secs(5), discovery)
            .await
            .expect("discovery ignored cancellation")
            .unwrap();
        assert!(endpoints.iter().all(|e| e.source == EndpointSource::Local));

        tracker.close();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait())
            .await
            .expect("STUN query outlived the tracker");
        drop(silent);
    }
}
