//! Relay server forwarding packets between registered node keys.
//!
//! One TCP listener serves `GET /derp`. Each connection is upgraded either
//! natively (`Upgrade: DERP`) or via WebSocket, then must register a node
//! key before it may send. Registration answers a `Challenge`: the client
//! seals the relay's nonce with the key shared between its private key and
//! the relay's, so only the holder of a key can claim its slot. A server configured as WebSocket-only rejects
//! the native upgrade with `400 Bad Request`, which is how clients learn
//! they must fall back.

use crate::http;
use crate::protocol::{
    Framing, REGISTER_PROOF_AAD, RelayErrorCode, RelayMessage, RelayReader, RelayWriter,
};
use crate::websocket;
use crate::{NATIVE_UPGRADE, RELAY_PATH, RelayError, WEBSOCKET_PROTOCOL};
use dashmap::DashMap;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tailmesh_crypto::{NodeKey, NodePrivate, PeerCipher};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Outbound queue depth per client
const CLIENT_QUEUE_DEPTH: usize = 512;

/// Time a fresh connection gets to finish the HTTP upgrade and register.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Simple fixed-window rate limiter
struct RateLimiter {
    /// Packets per client per window
    limit: usize,
    /// Window start and count per client
    counts: HashMap<NodeKey, (Instant, usize)>,
    /// Window duration
    window: Duration,
}

impl RateLimiter {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            counts: HashMap::new(),
            window,
        }
    }

    /// Check if a packet is allowed
    fn check(&mut self, key: NodeKey) -> bool {
        let now = Instant::now();
        let entry = self.counts.entry(key).or_insert((now, 0));

        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        if entry.1 >= self.limit {
            return false;
        }
        entry.1 += 1;
        true
    }

    /// Drop windows that ended long ago
    fn cleanup(&mut self) {
        let now = Instant::now();
        let keep = self.window * 2;
        self.counts
            .retain(|_, (start, _)| now.duration_since(*start) < keep);
    }
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum number of concurrent clients
    pub max_clients: usize,
    /// Rate limit (packets per client per second)
    pub rate_limit: usize,
    /// A client that sends nothing for this long is dropped
    pub client_timeout: Duration,
    /// How often rate limiter state is pruned
    pub cleanup_interval: Duration,
    /// Refuse the native upgrade; accept only WebSocket
    pub websocket_only: bool,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 10_000,
            rate_limit: 2_000,
            client_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30),
            websocket_only: false,
        }
    }
}

/// A registered client connection.
struct ClientHandle {
    conn_id: u64,
    tx: mpsc::Sender<RelayMessage>,
}

struct ServerInner {
    config: RelayServerConfig,
    clients: DashMap<NodeKey, ClientHandle>,
    rate_limiter: Mutex<RateLimiter>,
    relay_id: [u8; 16],
    private: NodePrivate,
    next_conn_id: AtomicU64,
}

/// DERP-style relay server
pub struct RelayServer {
    listener: TcpListener,
    inner: Arc<ServerInner>,
}

impl RelayServer {
    /// Bind a relay server.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn bind(addr: SocketAddr, config: RelayServerConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        let relay_id: [u8; 16] = rand::thread_rng().r#gen();

        Ok(Self {
            listener,
            inner: Arc::new(ServerInner {
                rate_limiter: Mutex::new(RateLimiter::new(
                    config.rate_limit,
                    Duration::from_secs(1),
                )),
                config,
                clients: DashMap::new(),
                relay_id,
                private: NodePrivate::generate(),
                next_conn_id: AtomicU64::new(1),
            }),
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Server relay ID
    #[must_use]
    pub fn relay_id(&self) -> [u8; 16] {
        self.inner.relay_id
    }

    /// Accept and serve connections until `cancel` fires, then wait for
    /// every connection task to finish.
    pub async fn run(self, cancel: CancellationToken) {
        let tracker = TaskTracker::new();
        let addr = self.listener.local_addr().ok();
        tracing::info!(
            ?addr,
            relay_id = %hex_id(&self.inner.relay_id),
            websocket_only = self.inner.config.websocket_only,
            "Relay server listening"
        );

        tracker.spawn(cleanup_task(self.inner.clone(), cancel.clone()));

        loop {
            let (stream, peer) = tokio::select! {
                () = cancel.cancelled() => break,
                res = self.listener.accept() => match res {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!("Accept error: {e}");
                        continue;
                    }
                },
            };

            let inner = self.inner.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move {
                if let Err(e) = handle_connection(inner, stream, cancel).await {
                    tracing::debug!(%peer, "Relay connection ended: {e}");
                }
            });
        }

        tracker.close();
        tracker.wait().await;
        tracing::info!(?addr, "Relay server stopped");
    }
}

fn hex_id(id: &[u8; 16]) -> String {
    id[..4].iter().map(|b| format!("{b:02x}")).collect()
}

async fn cleanup_task(inner: Arc<ServerInner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.cleanup_interval);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Ok(mut limiter) = inner.rate_limiter.lock() {
            limiter.cleanup();
        }
    }
}

async fn handle_connection(
    inner: Arc<ServerInner>,
    stream: TcpStream,
    cancel: CancellationToken,
) -> Result<(), RelayError> {
    stream.set_nodelay(true)?;
    let (read, mut write) = stream.into_split();
    let mut read = BufReader::new(read);

    let request = tokio::time::timeout(HANDSHAKE_TIMEOUT, http::read_request(&mut read)).await??;

    if request.path != RELAY_PATH {
        let resp = http::response_bytes(404, "Not Found", &[], "Not Found");
        write.write_all(&resp).await?;
        return Ok(());
    }

    let upgrade = request.header("Upgrade").unwrap_or_default().to_string();
    let framing = if upgrade.eq_ignore_ascii_case("websocket") {
        let Some(key) = request.header("Sec-WebSocket-Key") else {
            let resp = http::response_bytes(400, "Bad Request", &[], "missing Sec-WebSocket-Key");
            write.write_all(&resp).await?;
            return Ok(());
        };
        let accept = websocket::accept_key(key);
        let resp = http::response_bytes(
            101,
            "Switching Protocols",
            &[
                ("Upgrade", "websocket"),
                ("Connection", "Upgrade"),
                ("Sec-WebSocket-Accept", accept.as_str()),
                ("Sec-WebSocket-Protocol", WEBSOCKET_PROTOCOL),
            ],
            "",
        );
        write.write_all(&resp).await?;
        Framing::WebSocket { mask: false }
    } else if upgrade.eq_ignore_ascii_case(NATIVE_UPGRADE) && !inner.config.websocket_only {
        let resp = http::response_bytes(
            101,
            "Switching Protocols",
            &[("Upgrade", NATIVE_UPGRADE), ("Connection", "Upgrade")],
            "",
        );
        write.write_all(&resp).await?;
        Framing::Native
    } else {
        let body = format!("Invalid \"Upgrade\" header: {upgrade}");
        let resp = http::response_bytes(400, "Bad Request", &[], &body);
        write.write_all(&resp).await?;
        return Ok(());
    };
    write.flush().await?;

    serve_client(
        inner,
        RelayReader::new(read, framing),
        RelayWriter::new(write, framing),
        cancel,
    )
    .await
}

async fn serve_client<R, W>(
    inner: Arc<ServerInner>,
    mut reader: RelayReader<R>,
    mut writer: RelayWriter<W>,
    cancel: CancellationToken,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let key = match tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_message()).await?? {
        RelayMessage::Register { key } => key,
        other => {
            tracing::debug!("expected Register, got {}", other.message_type());
            send_error(&mut writer, RelayErrorCode::NotRegistered, "Not registered").await;
            return Err(RelayError::NotRegistered);
        }
    };

    if let Err(e) = verify_ownership(&inner, key, &mut reader, &mut writer).await {
        tracing::debug!(peer = %key.short(), "Registration refused: {e}");
        send_error(&mut writer, RelayErrorCode::KeyProofFailed, "Key ownership proof failed").await;
        return Err(RelayError::KeyProofFailed);
    }

    if inner.clients.len() >= inner.config.max_clients && !inner.clients.contains_key(&key) {
        send_error(&mut writer, RelayErrorCode::ServerFull, "Server at capacity").await;
        return Err(RelayError::ServerFull);
    }

    let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::channel::<RelayMessage>(CLIENT_QUEUE_DEPTH);

    // A newer connection for the same key replaces the older one; dropping
    // the old sender ends the old writer.
    inner.clients.insert(
        key,
        ClientHandle {
            conn_id,
            tx: tx.clone(),
        },
    );

    let ack = RelayMessage::RegisterAck {
        relay_id: inner.relay_id,
        success: true,
        error: None,
    };
    if let Err(e) = writer.write_message(&ack).await {
        inner
            .clients
            .remove_if(&key, |_, handle| handle.conn_id == conn_id);
        return Err(e);
    }
    tracing::debug!(peer = %key.short(), conn_id, "Client registered");

    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if writer.write_message(&msg).await.is_err() {
                return;
            }
        }
        let _ = writer.close().await;
    });

    let result = read_loop(&inner, key, &tx, &mut reader, &cancel).await;

    inner
        .clients
        .remove_if(&key, |_, handle| handle.conn_id == conn_id);
    drop(tx);
    let _ = write_task.await;
    tracing::debug!(peer = %key.short(), conn_id, "Client unregistered");

    result
}

/// Challenge the registering client to seal a fresh nonce for the relay key.
async fn verify_ownership<R, W>(
    inner: &ServerInner,
    key: NodeKey,
    reader: &mut RelayReader<R>,
    writer: &mut RelayWriter<W>,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let nonce: [u8; 32] = rand::thread_rng().r#gen();
    writer
        .write_message(&RelayMessage::Challenge {
            server_key: inner.private.public_key(),
            nonce,
        })
        .await?;

    let sealed = match tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read_message()).await?? {
        RelayMessage::Proof { sealed } => sealed,
        other => {
            return Err(RelayError::Handshake(format!(
                "expected Proof, got {}",
                other.message_type()
            )));
        }
    };

    let opened = PeerCipher::new(&inner.private, &key)
        .and_then(|cipher| cipher.open(&sealed, REGISTER_PROOF_AAD))
        .map_err(|e| RelayError::Handshake(e.to_string()))?;
    if opened != nonce {
        return Err(RelayError::Handshake("proof does not match nonce".into()));
    }
    Ok(())
}

async fn read_loop<R: AsyncRead + Unpin>(
    inner: &ServerInner,
    key: NodeKey,
    tx: &mpsc::Sender<RelayMessage>,
    reader: &mut RelayReader<R>,
    cancel: &CancellationToken,
) -> Result<(), RelayError> {
    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            res = tokio::time::timeout(inner.config.client_timeout, reader.read_message()) => res??,
        };

        match msg {
            RelayMessage::SendPacket { dest, payload } => {
                let allowed = inner
                    .rate_limiter
                    .lock()
                    .map(|mut limiter| limiter.check(key))
                    .unwrap_or(true);
                if !allowed {
                    let _ = tx.try_send(RelayMessage::Error {
                        code: RelayErrorCode::RateLimited,
                        message: "Rate limit exceeded".to_string(),
                    });
                    continue;
                }

                let dest_tx = inner.clients.get(&dest).map(|h| h.tx.clone());
                match dest_tx {
                    // A full queue drops the packet; the overlay retransmits.
                    Some(dest_tx) => {
                        let _ = dest_tx.try_send(RelayMessage::RecvPacket { src: key, payload });
                    }
                    None => {
                        let _ = tx.try_send(RelayMessage::PeerGone { peer: dest });
                    }
                }
            }
            RelayMessage::Ping { data } => {
                let _ = tx.try_send(RelayMessage::Pong { data });
            }
            RelayMessage::Keepalive | RelayMessage::Pong { .. } => {}
            RelayMessage::Disconnect => return Ok(()),
            other => {
                tracing::trace!(peer = %key.short(), "ignoring {}", other.message_type());
            }
        }
    }
}

async fn send_error<W: AsyncWrite + Unpin>(
    writer: &mut RelayWriter<W>,
    code: RelayErrorCode,
    message: &str,
) {
    let _ = writer
        .write_message(&RelayMessage::Error {
            code,
            message: message.to_string(),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ConnectOptions, RelayClient, Transport, seal_proof, upgrade};
    use crate::{RelayNode, RelayRegion};
    use url::Url;

    async fn start(config: RelayServerConfig) -> (RelayNode, CancellationToken) {
        let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), config)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));
        let url = Url::parse(&format!("http://{addr}")).unwrap();
        let region = RelayRegion::new(1, "test", "Test").with_node(RelayNode::new("1a", 1, url));
        (region.nodes[0].clone(), cancel)
    }

    fn private(b: u8) -> NodePrivate {
        NodePrivate::from_bytes([b; 32])
    }

    fn key(b: u8) -> NodeKey {
        private(b).public_key()
    }

    #[test]
    fn test_relay_server_config_default() {
        let config = RelayServerConfig::default();
        assert_eq!(config.max_clients, 10_000);
        assert!(!config.websocket_only);
    }

    #[test]
    fn test_rate_limiter() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(1));
        assert!(limiter.check(key(1)));
        assert!(limiter.check(key(1)));
        assert!(limiter.check(key(1)));
        assert!(!limiter.check(key(1)));
        assert!(limiter.check(key(2)));
    }

    #[test]
    fn test_rate_limiter_cleanup() {
        let mut limiter = RateLimiter::new(10, Duration::from_millis(100));
        limiter.check(key(1));
        limiter.cleanup();
        assert_eq!(limiter.counts.len(), 1);
    }

    #[tokio::test]
    async fn test_native_forwarding() {
        let (node, cancel) = start(RelayServerConfig::default()).await;
        let opts = ConnectOptions::default();

        let mut a = RelayClient::connect(&node, &private(1), &opts).await.unwrap();
        let mut b = RelayClient::connect(&node, &private(2), &opts).await.unwrap();
        assert!(a.forced_websocket().is_none());

        a.send(key(2), b"hello".to_vec()).await.unwrap();
        assert_eq!(
            b.recv().await.unwrap(),
            RelayMessage::RecvPacket {
                src: key(1),
                payload: b"hello".to_vec()
            }
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_missing_peer_reports_gone() {
        let (node, cancel) = start(RelayServerConfig::default()).await;
        let mut a = RelayClient::connect(&node, &private(1), &ConnectOptions::default())
            .await
            .unwrap();
        a.send(key(9), vec![1]).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), RelayMessage::PeerGone { peer: key(9) });
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_websocket_only_forces_fallback() {
        let (node, cancel) = start(RelayServerConfig {
            websocket_only: true,
            ..RelayServerConfig::default()
        })
        .await;

        let mut a = RelayClient::connect(&node, &private(1), &ConnectOptions::default())
            .await
            .unwrap();
        assert_eq!(
            a.forced_websocket(),
            Some(
                "GET failed with status code 400 (a proxy could be disallowing the use of 'Upgrade: derp'): Invalid \"Upgrade\" header: DERP"
            )
        );

        let mut b = RelayClient::connect(&node, &private(2), &ConnectOptions::default())
            .await
            .unwrap();
        b.send(key(1), vec![4, 2]).await.unwrap();
        assert_eq!(
            a.recv().await.unwrap(),
            RelayMessage::RecvPacket {
                src: key(2),
                payload: vec![4, 2]
            }
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_ping_answered() {
        let (node, cancel) = start(RelayServerConfig::default()).await;
        let client = RelayClient::connect(&node, &private(1), &ConnectOptions::default())
            .await
            .unwrap();
        let (mut reader, mut writer) = client.into_parts();
        writer
            .write_message(&RelayMessage::Ping { data: [3; 8] })
            .await
            .unwrap();
        assert_eq!(
            reader.read_message().await.unwrap(),
            RelayMessage::Pong { data: [3; 8] }
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_registration_requires_private_key() {
        let (node, cancel) = start(RelayServerConfig::default()).await;
        let opts = ConnectOptions::default();
        let mut victim = RelayClient::connect(&node, &private(1), &opts).await.unwrap();

        // Claim key(1) while holding only key(7)'s private half.
        let (mut reader, mut writer) = upgrade(&node, Transport::Native).await.unwrap();
        writer
            .write_message(&RelayMessage::Register { key: key(1) })
            .await
            .unwrap();
        let RelayMessage::Challenge { server_key, nonce } = reader.read_message().await.unwrap()
        else {
            panic!("expected challenge");
        };
        let sealed = seal_proof(&private(7), &server_key, &nonce).unwrap();
        writer
            .write_message(&RelayMessage::Proof { sealed })
            .await
            .unwrap();
        assert_eq!(
            reader.read_message().await.unwrap(),
            RelayMessage::Error {
                code: RelayErrorCode::KeyProofFailed,
                message: "Key ownership proof failed".to_string(),
            }
        );

        // The genuine holder keeps its slot.
        let mut sender = RelayClient::connect(&node, &private(2), &opts).await.unwrap();
        sender.send(key(1), vec![9]).await.unwrap();
        assert_eq!(
            victim.recv().await.unwrap(),
            RelayMessage::RecvPacket {
                src: key(2),
                payload: vec![9]
            }
        );
        cancel.cancel();
    }
}
