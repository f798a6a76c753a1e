//! Overlay stream stack.
//!
//! A minimal reliable byte stream carried in sealed peer messages. Each
//! stream is owned by a driver task; the application side talks to it
//! through channels (see [`OverlayStream`](crate::OverlayStream)).
//!
//! ```text
//!   dialer                                    listener
//!     │ ── Syn ───────────────────────────────► │  accept()
//!     │ ◄──────────────────────────── SynAck ── │
//!     │ ── Data{seq} ─────────────────────────► │
//!     │ ◄─────────────────────────── Ack{next} ─│
//!     │ ── Fin{seq} ──────────────────────────► │
//!     │ ◄───────────────────────────── Fin ──── │
//! ```
//!
//! Sequence numbers count segments, not bytes. Acks are cumulative and name
//! the next segment expected. Segments the reader has not consumed are not
//! acknowledged, which throttles the sender to the reader's pace.

use crate::config::EngineTimings;
use crate::transport::{OverlayListener, OverlayStream, StreamCmd, StreamShared};
use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Largest payload per segment.
pub(crate) const SEGMENT_SIZE: usize = 1200;

/// Unacknowledged segments a sender keeps in flight.
const SEND_WINDOW: usize = 64;

/// Segments buffered for a reader that is not keeping up.
const READ_BUFFER: usize = 64;

/// Out-of-order segments accepted ahead of the next expected one.
const RECV_WINDOW: u32 = 2 * SEND_WINDOW as u32;

/// Frames queued per stream driver.
const FRAME_QUEUE: usize = 256;

/// Pending connections per listener.
const ACCEPT_BACKLOG: usize = 128;

/// First port handed out for dials and `:0` listens.
const EPHEMERAL_START: u16 = 49_152;

/// A stream segment between two overlay sockets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Frame {
    pub(crate) src: SocketAddr,
    pub(crate) dst: SocketAddr,
    pub(crate) kind: FrameKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum FrameKind {
    Syn,
    SynAck,
    Data { seq: u32, payload: Vec<u8> },
    Ack { next: u32 },
    Fin { seq: u32 },
    Rst,
}

/// Sends frames toward whichever peer owns `frame.dst`.
pub(crate) trait PeerLink: Send + Sync + 'static {
    /// Send over the peer's current best path.
    fn send_frame(&self, frame: Frame) -> Result<(), EngineError>;
}

struct ListenerEntry {
    ip: Option<IpAddr>,
    accept: mpsc::Sender<OverlayStream>,
}

type StreamKey = (SocketAddr, SocketAddr);

/// Listeners and live streams of one engine.
pub(crate) struct Netstack {
    link: Arc<dyn PeerLink>,
    local_ips: Vec<IpAddr>,
    listeners: Mutex<HashMap<u16, ListenerEntry>>,
    streams: Mutex<HashMap<StreamKey, mpsc::Sender<FrameKind>>>,
    timings: EngineTimings,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Netstack {
    pub(crate) fn new(
        link: Arc<dyn PeerLink>,
        local_ips: Vec<IpAddr>,
        timings: EngineTimings,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            link,
            local_ips,
            listeners: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            timings,
            tracker,
            cancel,
        }
    }

    fn default_ip(&self) -> Result<IpAddr, EngineError> {
        self.local_ips
            .first()
            .copied()
            .ok_or_else(|| EngineError::InvalidAddress("no local overlay address".into()))
    }

    /// Bind a listener. An unspecified IP accepts on every local address;
    /// port 0 picks a free port.
    pub(crate) fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<OverlayListener, EngineError> {
        let ip = if addr.ip().is_unspecified() {
            None
        } else if self.local_ips.contains(&addr.ip()) {
            Some(addr.ip())
        } else {
            return Err(EngineError::InvalidAddress(format!("{} is not a local overlay address", addr.ip())));
        };

        let mut listeners = lock(&self.listeners);
        let port = match addr.port() {
            0 => (EPHEMERAL_START..=u16::MAX)
                .find(|p| !listeners.contains_key(p))
                .ok_or(EngineError::AddressInUse(addr))?,
            p if listeners.contains_key(&p) => return Err(EngineError::AddressInUse(addr)),
            p => p,
        };
        let (accept, rx) = mpsc::channel(ACCEPT_BACKLOG);
        listeners.insert(port, ListenerEntry { ip, accept });
        drop(listeners);

        let local = SocketAddr::new(ip.map_or_else(|| self.default_ip(), Ok)?, port);
        tracing::debug!(%local, "listening");
        Ok(OverlayListener::new(self.clone(), local, rx, self.cancel.clone()))
    }

    pub(crate) fn unbind(&self, port: u16) {
        lock(&self.listeners).remove(&port);
    }

    /// Open a stream to `remote` and wait for the handshake.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        remote: SocketAddr,
    ) -> Result<OverlayStream, EngineError> {
        let local_ip = self
            .local_ips
            .iter()
            .find(|ip| ip.is_ipv6() == remote.is_ipv6())
            .copied()
            .map_or_else(|| self.default_ip(), Ok)?;
        let local = self.allocate(local_ip, remote)?;
        let (tx, rx) = oneshot::channel();
        let stream = self.spawn_stream(local, remote, Some(tx))?;

        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            _ = self.cancel.cancelled() => Err(EngineError::Closed),
            res = rx => match res {
                Ok(Ok(())) => Ok(stream),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(EngineError::Closed),
            },
        }
    }

    fn allocate(&self, ip: IpAddr, remote: SocketAddr) -> Result<SocketAddr, EngineError> {
        let listeners = lock(&self.listeners);
        let streams = lock(&self.streams);
        let span = u32::from(u16::MAX - EPHEMERAL_START) + 1;
        let offset = rand::random::<u32>() % span;
        (0..span)
            .map(|i| EPHEMERAL_START + ((offset + i) % span) as u16)
            .map(|port| SocketAddr::new(ip, port))
            .find(|local| !listeners.contains_key(&local.port()) && !streams.contains_key(&(*local, remote)))
            .ok_or_else(|| EngineError::AddressInUse(SocketAddr::new(ip, 0)))
    }

    fn spawn_stream(
        self: &Arc<Self>,
        local: SocketAddr,
        remote: SocketAddr,
        connecting: Option<oneshot::Sender<Result<(), EngineError>>>,
    ) -> Result<OverlayStream, EngineError> {
        let (frames_tx, frames) = mpsc::channel(FRAME_QUEUE);
        {
            let mut streams = lock(&self.streams);
            if streams.contains_key(&(local, remote)) {
                return Err(EngineError::AddressInUse(local));
            }
            streams.insert((local, remote), frames_tx);
        }

        let (cmd_tx, cmds) = mpsc::channel(SEND_WINDOW);
        let (read_tx, read_rx) = mpsc::channel(READ_BUFFER);
        let shared = Arc::new(StreamShared::default());
        let driver = Driver {
            stack: self.clone(),
            local,
            remote,
            frames,
            cmds,
            cmds_open: true,
            read_tx: Some(read_tx),
            shared: shared.clone(),
            dialer: connecting.is_some(),
            connecting,
            syn_sent_at: Instant::now(),
            syn_retries: 0,
            next_seq: 0,
            unacked: BTreeMap::new(),
            fin_seq: None,
            recv_next: 0,
            reorder: BTreeMap::new(),
            peer_fin: false,
            linger_until: None,
        };
        self.tracker.spawn(driver.run(self.cancel.clone()));
        Ok(OverlayStream::new(local, remote, read_rx, cmd_tx, shared))
    }

    /// Route an inbound frame to its stream, a listener, or a reset.
    pub(crate) fn deliver(self: &Arc<Self>, frame: Frame) {
        if !self.local_ips.contains(&frame.dst.ip()) {
            tracing::debug!(dst = %frame.dst, "frame for foreign address");
            return;
        }
        let existing = lock(&self.streams).get(&(frame.dst, frame.src)).cloned();
        if let Some(tx) = existing {
            if tx.try_send(frame.kind).is_err() {
                tracing::debug!(local = %frame.dst, remote = %frame.src, "stream queue full, dropping frame");
            }
            return;
        }
        match frame.kind {
            FrameKind::Syn => self.accept(frame.dst, frame.src),
            FrameKind::Rst => {}
            _ => self.send(frame.dst, frame.src, FrameKind::Rst),
        }
    }

    fn accept(self: &Arc<Self>, local: SocketAddr, remote: SocketAddr) {
        let accept = lock(&self.listeners)
            .get(&local.port())
            .filter(|l| l.ip.is_none_or(|ip| ip == local.ip()))
            .map(|l| l.accept.clone());
        let Some(accept) = accept else {
            tracing::debug!(%local, %remote, "connection refused: nothing listening");
            self.send(local, remote, FrameKind::Rst);
            return;
        };
        let Ok(permit) = accept.try_reserve() else {
            tracing::warn!(%local, %remote, "accept backlog full, refusing connection");
            self.send(local, remote, FrameKind::Rst);
            return;
        };
        match self.spawn_stream(local, remote, None) {
            Ok(stream) => permit.send(stream),
            Err(e) => tracing::debug!(%local, %remote, "accept failed: {e}"),
        }
    }

    fn send(&self, src: SocketAddr, dst: SocketAddr, kind: FrameKind) {
        if let Err(e) = self.link.send_frame(Frame { src, dst, kind }) {
            tracing::debug!(%src, %dst, "frame not sent: {e}");
        }
    }

    fn remove_stream(&self, key: &StreamKey) {
        lock(&self.streams).remove(key);
    }

    #[cfg(test)]
    fn stream_count(&self) -> usize {
        lock(&self.streams).len()
    }
}

enum Incoming {
    Data(Vec<u8>),
    Fin,
}

struct Segment {
    /// `None` marks our FIN
    payload: Option<Vec<u8>>,
    sent_at: Instant,
    retries: u32,
}

enum Exit {
    Clean,
    /// The peer reset us; do not answer with another reset
    Remote(EngineError),
    Local(EngineError),
}

struct Driver {
    stack: Arc<Netstack>,
    local: SocketAddr,
    remote: SocketAddr,
    frames: mpsc::Receiver<FrameKind>,
    cmds: mpsc::Receiver<StreamCmd>,
    cmds_open: bool,
    read_tx: Option<mpsc::Sender<Vec<u8>>>,
    shared: Arc<StreamShared>,
    dialer: bool,
    connecting: Option<oneshot::Sender<Result<(), EngineError>>>,
    syn_sent_at: Instant,
    syn_retries: u32,
    next_seq: u32,
    unacked: BTreeMap<u32, Segment>,
    fin_seq: Option<u32>,
    recv_next: u32,
    reorder: BTreeMap<u32, Incoming>,
    peer_fin: bool,
    linger_until: Option<Instant>,
}

async fn dial_abandoned(tx: &mut Option<oneshot::Sender<Result<(), EngineError>>>) {
    match tx {
        Some(tx) => tx.closed().await,
        None => std::future::pending().await,
    }
}

async fn reader_capacity(tx: Option<mpsc::Sender<Vec<u8>>>) {
    if let Some(tx) = tx {
        let _ = tx.reserve().await;
    }
}

impl Driver {
    async fn run(mut self, cancel: CancellationToken) {
        if self.dialer {
            self.send(FrameKind::Syn);
        } else {
            self.send(FrameKind::SynAck);
        }

        let mut tick = tokio::time::interval(self.stack.timings.stream_retransmit / 2);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let exit = loop {
            let can_send = self.connecting.is_none() && self.cmds_open && self.unacked.len() < SEND_WINDOW;
            let blocked_reader = self.read_tx.clone().filter(|_| self.reorder.contains_key(&self.recv_next));
            let waiting_reader = blocked_reader.is_some();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Exit::Local(EngineError::Closed),
                _ = dial_abandoned(&mut self.connecting), if self.connecting.is_some() => {
                    break Exit::Local(EngineError::Cancelled);
                }
                _ = tick.tick() => {
                    if let Err(e) = self.on_tick() {
                        break Exit::Local(e);
                    }
                    if self.linger_until.is_some_and(|t| Instant::now() >= t) {
                        break Exit::Clean;
                    }
                }
                frame = self.frames.recv() => match frame {
                    Some(kind) => {
                        if let Err(exit) = self.on_frame(kind) {
                            break exit;
                        }
                    }
                    None => break Exit::Local(EngineError::Closed),
                },
                _ = reader_capacity(blocked_reader), if waiting_reader => {
                    if self.flush_ready() {
                        self.send_ack();
                    }
                }
                cmd = self.cmds.recv(), if can_send => match cmd {
                    Some(StreamCmd::Data(bytes)) => {
                        if let Err(e) = self.send_data(bytes) {
                            break Exit::Local(e);
                        }
                    }
                    Some(StreamCmd::Shutdown) | None => {
                        self.cmds_open = false;
                        if let Err(e) = self.queue_fin() {
                            break Exit::Local(e);
                        }
                    }
                },
            }

            if self.linger_until.is_none() && self.is_done() {
                self.linger_until = Some(Instant::now() + self.stack.timings.stream_retransmit * 4);
            }
        };

        match exit {
            Exit::Clean => {
                tracing::debug!(local = %self.local, remote = %self.remote, "stream closed");
            }
            Exit::Remote(e) => self.fail(e),
            Exit::Local(e) => {
                self.send(FrameKind::Rst);
                self.fail(e);
            }
        }
        self.stack.remove_stream(&(self.local, self.remote));
    }

    fn fail(&mut self, err: EngineError) {
        tracing::debug!(local = %self.local, remote = %self.remote, "stream failed: {err}");
        if let Some(tx) = self.connecting.take() {
            let _ = tx.send(Err(err));
            return;
        }
        self.shared.set_error(err);
        self.read_tx = None;
    }

    fn is_done(&self) -> bool {
        self.connecting.is_none()
            && !self.cmds_open
            && self.fin_seq.is_some()
            && self.unacked.is_empty()
            && (self.peer_fin || self.read_tx.as_ref().is_none_or(mpsc::Sender::is_closed))
    }

    fn send(&self, kind: FrameKind) {
        self.stack.send(self.local, self.remote, kind);
    }

    fn send_ack(&self) {
        self.send(FrameKind::Ack { next: self.recv_next });
    }

    fn established(&mut self) {
        if let Some(tx) = self.connecting.take() {
            tracing::debug!(local = %self.local, remote = %self.remote, "stream connected");
            let _ = tx.send(Ok(()));
        }
    }

    fn on_frame(&mut self, kind: FrameKind) -> Result<(), Exit> {
        match kind {
            FrameKind::Syn => {
                if !self.dialer {
                    self.send(FrameKind::SynAck);
                }
            }
            FrameKind::SynAck => self.established(),
            FrameKind::Rst => {
                let err = if self.connecting.is_some() {
                    EngineError::ConnectionRefused(self.remote)
                } else {
                    EngineError::reset("reset by peer")
                };
                return Err(Exit::Remote(err));
            }
            FrameKind::Data { seq, payload } => {
                self.established();
                self.on_segment(seq, Incoming::Data(payload));
            }
            FrameKind::Fin { seq } => {
                self.established();
                self.on_segment(seq, Incoming::Fin);
            }
            FrameKind::Ack { next } => self.on_ack(next),
        }
        Ok(())
    }

    fn on_segment(&mut self, seq: u32, item: Incoming) {
        if in_window(self.recv_next, seq) {
            self.reorder.entry(seq).or_insert(item);
        }
        self.flush_ready();
        // Duplicates are acked too so a sender whose ack was lost moves on.
        self.send_ack();
    }

    /// Hand in-order segments to the reader. Returns whether anything moved.
    fn flush_ready(&mut self) -> bool {
        let mut advanced = false;
        while let Some(item) = self.reorder.get(&self.recv_next) {
            if matches!(item, Incoming::Fin) {
                self.reorder.remove(&self.recv_next);
                self.recv_next += 1;
                self.peer_fin = true;
                self.read_tx = None;
                advanced = true;
                continue;
            }
            let permit = match &self.read_tx {
                Some(tx) => match tx.try_reserve() {
                    Ok(permit) => Some(permit),
                    Err(mpsc::error::TrySendError::Full(())) => break,
                    Err(mpsc::error::TrySendError::Closed(())) => None,
                },
                None => None,
            };
            if let Some(Incoming::Data(bytes)) = self.reorder.remove(&self.recv_next) {
                // Without a reader the data is consumed and dropped.
                if let Some(permit) = permit {
                    permit.send(bytes);
                }
            }
            self.recv_next += 1;
            advanced = true;
        }
        advanced
    }

    fn on_ack(&mut self, next: u32) {
        self.unacked = self.unacked.split_off(&next);
        // Any ack proves the peer is alive.
        for segment in self.unacked.values_mut() {
            segment.retries = 0;
        }
    }

    fn send_data(&mut self, payload: Vec<u8>) -> Result<(), EngineError> {
        let seq = advance_seq(&mut self.next_seq)?;
        self.send(FrameKind::Data {
            seq,
            payload: payload.clone(),
        });
        self.unacked.insert(
            seq,
            Segment {
                payload: Some(payload),
                sent_at: Instant::now(),
                retries: 0,
            },
        );
        Ok(())
    }

    fn queue_fin(&mut self) -> Result<(), EngineError> {
        if self.fin_seq.is_some() {
            return Ok(());
        }
        let seq = advance_seq(&mut self.next_seq)?;
        self.fin_seq = Some(seq);
        self.send(FrameKind::Fin { seq });
        self.unacked.insert(
            seq,
            Segment {
                payload: None,
                sent_at: Instant::now(),
                retries: 0,
            },
        );
        Ok(())
    }

    fn on_tick(&mut self) -> Result<(), EngineError> {
        let now = Instant::now();
        let rto = self.stack.timings.stream_retransmit;
        let max_retries = self.stack.timings.stream_max_retries;

        if self.connecting.is_some() {
            if now.saturating_duration_since(self.syn_sent_at) >= rto {
                if self.syn_retries >= max_retries {
                    return Err(EngineError::Handshake(
                        format!("no answer from {}", self.remote).into(),
                    ));
                }
                self.syn_retries += 1;
                self.syn_sent_at = now;
                self.send(FrameKind::Syn);
            }
            return Ok(());
        }

        let mut resend = Vec::new();
        for (seq, segment) in &mut self.unacked {
            if now.saturating_duration_since(segment.sent_at) < backoff(rto, segment.retries) {
                continue;
            }
            if segment.retries >= max_retries {
                return Err(EngineError::reset("retransmission limit reached"));
            }
            segment.retries += 1;
            segment.sent_at = now;
            resend.push(match &segment.payload {
                Some(payload) => FrameKind::Data {
                    seq: *seq,
                    payload: payload.clone(),
                },
                None => FrameKind::Fin { seq: *seq },
            });
        }
        for kind in resend {
            self.send(kind);
        }
        Ok(())
    }
}

/// Retransmission timeout after `retries` attempts, doubling up to 8x.
/// Take the next sequence number. Numbers never wrap and `u32::MAX` is
/// never sent, so the ack after the last segment still fits.
fn advance_seq(next: &mut u32) -> Result<u32, EngineError> {
    let seq = *next;
    *next = seq
        .checked_add(1)
        .ok_or(EngineError::reset("sequence space exhausted"))?;
    Ok(seq)
}

/// Whether a received segment may be buffered.
fn in_window(recv_next: u32, seq: u32) -> bool {
    seq != u32::MAX && seq >= recv_next && seq - recv_next < RECV_WINDOW
}

fn backoff(rto: Duration, retries: u32) -> Duration {
    rto * (1 << retries.min(3))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// One direction of a back-to-back link; can drop frames or be cut.
    #[derive(Default)]
    struct Wire {
        peer: Mutex<Option<Arc<Netstack>>>,
        drop_every: usize,
        sent: AtomicUsize,
        cut: AtomicBool,
    }

    impl PeerLink for Wire {
        fn send_frame(&self, frame: Frame) -> Result<(), EngineError> {
            let n = self.sent.fetch_add(1, Ordering::Relaxed);
            if self.cut.load(Ordering::Relaxed)
                || (self.drop_every != 0 && n % self.drop_every == self.drop_every - 1)
            {
                return Ok(());
            }
            let peer = lock(&self.peer).clone();
            match peer {
                Some(peer) => {
                    peer.deliver(frame);
                    Ok(())
                }
                None => Err(EngineError::NoRoute(frame.dst.to_string())),
            }
        }
    }

    struct Pair {
        a: Arc<Netstack>,
        b: Arc<Netstack>,
        wires: [Arc<Wire>; 2],
        cancel_a: CancellationToken,
        cancel_b: CancellationToken,
    }

    impl Pair {
        fn new(drop_every: usize) -> Self {
            let timings = EngineTimings {
                stream_retransmit: Duration::from_millis(20),
                stream_max_retries: 10,
                ..EngineTimings::default()
            };
            let wire = || {
                Arc::new(Wire {
                    drop_every,
                    ..Wire::default()
                })
            };
            let wires = [wire(), wire()];
            let (cancel_a, cancel_b) = (CancellationToken::new(), CancellationToken::new());
            let a = Arc::new(Netstack::new(
                wires[0].clone(),
                vec![ip_a()],
                timings.clone(),
                TaskTracker::new(),
                cancel_a.clone(),
            ));
            let b = Arc::new(Netstack::new(
                wires[1].clone(),
                vec![ip_b()],
                timings,
                TaskTracker::new(),
                cancel_b.clone(),
            ));
            *lock(&wires[0].peer) = Some(b.clone());
            *lock(&wires[1].peer) = Some(a.clone());
            Self {
                a,
                b,
                wires,
                cancel_a,
                cancel_b,
            }
        }

        fn cut(&self) {
            for wire in &self.wires {
                wire.cut.store(true, Ordering::Relaxed);
            }
        }
    }

    impl Drop for Pair {
        fn drop(&mut self) {
            self.cancel_a.cancel();
            self.cancel_b.cancel();
        }
    }

    fn ip_a() -> IpAddr {
        "fd7a:115c:a1e0::a".parse().unwrap()
    }

    fn ip_b() -> IpAddr {
        "fd7a:115c:a1e0::b".parse().unwrap()
    }

    fn addr_b(port: u16) -> SocketAddr {
        SocketAddr::new(ip_b(), port)
    }

    #[tokio::test]
    async fn test_connect_and_echo() {
        let pair = Pair::new(0);
        let listener = pair.b.listen(addr_b(80)).unwrap();
        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let mut stream = pair.a.connect(&CancellationToken::new(), addr_b(80)).await.unwrap();
        assert_eq!(stream.peer_addr(), addr_b(80));
        assert_eq!(stream.local_addr().ip(), ip_a());
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        stream.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_lossy_link_preserves_order() {
        let pair = Pair::new(5);
        let listener = pair.b.listen(addr_b(81)).unwrap();
        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let mut stream = pair.a.connect(&CancellationToken::new(), addr_b(81)).await.unwrap();
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
        stream.write_all(&payload).await.unwrap();
        stream.shutdown().await.unwrap();
        assert_eq!(server.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_unbound_port_refused() {
        let pair = Pair::new(0);
        let err = pair.a.connect(&CancellationToken::new(), addr_b(9)).await.unwrap_err();
        assert_eq!(err, EngineError::ConnectionRefused(addr_b(9)));
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let pair = Pair::new(0);
        let _first = pair.b.listen(addr_b(80)).unwrap();
        assert_eq!(
            pair.b.listen(addr_b(80)).unwrap_err(),
            EngineError::AddressInUse(addr_b(80))
        );
    }

    #[tokio::test]
    async fn test_listener_drop_unbinds() {
        let pair = Pair::new(0);
        drop(pair.b.listen(addr_b(80)).unwrap());
        assert!(pair.b.listen(addr_b(80)).is_ok());
    }

    #[tokio::test]
    async fn test_foreign_listen_address_rejected() {
        let pair = Pair::new(0);
        assert!(matches!(pair.a.listen(addr_b(80)), Err(EngineError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_ephemeral_listen_port() {
        let pair = Pair::new(0);
        let listener = pair.b.listen(SocketAddr::new("::".parse().unwrap(), 0)).unwrap();
        assert!(listener.local_addr().port() >= EPHEMERAL_START);
        assert_eq!(listener.local_addr().ip(), ip_b());
    }

    #[tokio::test]
    async fn test_dead_peer_resets_stream() {
        let pair = Pair::new(0);
        let listener = pair.b.listen(addr_b(82)).unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let mut stream = pair.a.connect(&CancellationToken::new(), addr_b(82)).await.unwrap();
        let _server_side = accept.await.unwrap();

        pair.cut();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 8];
        let err = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_engine_close_fails_streams() {
        let pair = Pair::new(0);
        let listener = pair.b.listen(addr_b(83)).unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let mut stream = pair.a.connect(&CancellationToken::new(), addr_b(83)).await.unwrap();
        let mut server_side = accept.await.unwrap();

        pair.cancel_a.cancel();
        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);

        // The peer is told through a reset.
        let err = tokio::time::timeout(Duration::from_secs(5), server_side.read(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_cancelled_dial_cleans_up() {
        let pair = Pair::new(0);
        let _listener = pair.b.listen(addr_b(84)).unwrap();
        pair.cut();

        let dial_cancel = CancellationToken::new();
        let canceller = dial_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = pair.a.connect(&dial_cancel, addr_b(84)).await.unwrap_err();
        assert_eq!(err, EngineError::Cancelled);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pair.a.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_unanswered_dial_times_out() {
        let pair = Pair::new(0);
        pair.cut();
        let err = tokio::time::timeout(
            Duration::from_secs(10),
            pair.a.connect(&CancellationToken::new(), addr_b(85)),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, EngineError::Handshake(_)));
    }

    #[test]
    fn test_sequence_exhaustion_resets() {
        let mut next = u32::MAX - 2;
        assert_eq!(advance_seq(&mut next).unwrap(), u32::MAX - 2);
        assert_eq!(advance_seq(&mut next).unwrap(), u32::MAX - 1);
        let err = advance_seq(&mut next).unwrap_err();
        assert!(matches!(err, EngineError::ConnectionReset(_)));
        assert_eq!(next, u32::MAX);
    }

    #[test]
    fn test_receive_window_bounds() {
        assert!(in_window(0, 0));
        assert!(in_window(10, 10 + RECV_WINDOW - 1));
        assert!(!in_window(10, 9));
        assert!(!in_window(10, 10 + RECV_WINDOW));
        assert!(!in_window(u32::MAX - 1, u32::MAX));
        assert!(in_window(u32::MAX - 1, u32::MAX - 1));
    }

    #[test]
    fn test_backoff_caps() {
        let rto = Duration::from_millis(100);
        assert_eq!(backoff(rto, 0), rto);
        assert_eq!(backoff(rto, 2), rto * 4);
        assert_eq!(backoff(rto, 10), rto * 8);
    }
}
