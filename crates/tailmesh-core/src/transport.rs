//! Listen and dial on the overlay.
//!
//! [`OverlayStream`] and [`OverlayListener`] are the handles callers get;
//! the stream machinery behind them lives in the netstack module.
//!
//! # Example
//!
//! ```no_run
//! use tailmesh_core::Engine;
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo(server: Engine, client: Engine) -> tailmesh_core::Result<()> {
//! let listener = server.listen("tcp", ":8080")?;
//! let addr = listener.local_addr();
//!
//! let mut conn = client.dial_tcp(&CancellationToken::new(), addr).await?;
//! conn.write_all(b"hello").await?;
//!
//! let mut accepted = listener.accept().await?;
//! let mut buf = [0u8; 5];
//! accepted.read_exact(&mut buf).await?;
//! # Ok(())
//! # }
//! ```

use crate::engine::Engine;
use crate::netstack::{Netstack, SEGMENT_SIZE};
use crate::{EngineError, Result};
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};

/// Application-side requests to a stream driver.
#[derive(Debug)]
pub(crate) enum StreamCmd {
    Data(Vec<u8>),
    Shutdown,
}

/// State a stream driver leaves behind for its handle.
#[derive(Debug, Default)]
pub(crate) struct StreamShared {
    error: OnceLock<EngineError>,
}

impl StreamShared {
    pub(crate) fn set_error(&self, err: EngineError) {
        let _ = self.error.set(err);
    }

    fn error(&self) -> Option<EngineError> {
        self.error.get().cloned()
    }
}

/// A reliable byte stream to a peer's overlay address.
///
/// Dropping the stream closes it gracefully; unsent data is still delivered.
pub struct OverlayStream {
    local: SocketAddr,
    remote: SocketAddr,
    reader: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
    eof: bool,
    writer: PollSender<StreamCmd>,
    write_closed: bool,
    shared: Arc<StreamShared>,
}

impl OverlayStream {
    pub(crate) fn new(
        local: SocketAddr,
        remote: SocketAddr,
        reader: mpsc::Receiver<Vec<u8>>,
        writer: mpsc::Sender<StreamCmd>,
        shared: Arc<StreamShared>,
    ) -> Self {
        Self {
            local,
            remote,
            reader,
            pending: Vec::new(),
            offset: 0,
            eof: false,
            writer: PollSender::new(writer),
            write_closed: false,
            shared,
        }
    }

    /// Local overlay address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Remote overlay address
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.remote
    }

    fn broken(&self) -> io::Error {
        match self.shared.error() {
            Some(err) => err.into(),
            None => io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"),
        }
    }
}

impl std::fmt::Debug for OverlayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayStream")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for OverlayStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.offset < this.pending.len() {
                let n = buf.remaining().min(this.pending.len() - this.offset);
                buf.put_slice(&this.pending[this.offset..this.offset + n]);
                this.offset += n;
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.reader.poll_recv(cx)) {
                Some(chunk) => {
                    this.pending = chunk;
                    this.offset = 0;
                }
                None => {
                    this.eof = true;
                    if let Some(err) = this.shared.error() {
                        return Poll::Ready(Err(err.into()));
                    }
                }
            }
        }
    }
}

impl AsyncWrite for OverlayStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.write_closed {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "write half closed")));
        }
        if ready!(this.writer.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(this.broken()));
        }
        let n = buf.len().min(SEGMENT_SIZE);
        if this.writer.send_item(StreamCmd::Data(buf[..n].to_vec())).is_err() {
            return Poll::Ready(Err(this.broken()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Written segments are owned by the driver as soon as they are queued.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Ok(()));
        }
        if ready!(this.writer.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(this.broken()));
        }
        if this.writer.send_item(StreamCmd::Shutdown).is_err() {
            return Poll::Ready(Err(this.broken()));
        }
        this.write_closed = true;
        Poll::Ready(Ok(()))
    }
}

/// Accepts inbound overlay streams on one port.
///
/// Dropping the listener unbinds the port.
pub struct OverlayListener {
    stack: Arc<Netstack>,
    local: SocketAddr,
    incoming: tokio::sync::Mutex<mpsc::Receiver<OverlayStream>>,
    cancel: CancellationToken,
}

impl OverlayListener {
    pub(crate) fn new(
        stack: Arc<Netstack>,
        local: SocketAddr,
        incoming: mpsc::Receiver<OverlayStream>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stack,
            local,
            incoming: tokio::sync::Mutex::new(incoming),
            cancel,
        }
    }

    /// Wait for the next inbound stream.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] once the engine closes.
    pub async fn accept(&self) -> Result<OverlayStream> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Closed),
            stream = incoming.recv() => stream.ok_or(EngineError::Closed),
        }
    }

    /// The bound overlay address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl std::fmt::Debug for OverlayListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayListener").field("local", &self.local).finish_non_exhaustive()
    }
}

impl Drop for OverlayListener {
    fn drop(&mut self) {
        self.stack.unbind(self.local.port());
    }
}

/// Parse `:port`, `addr:port` or `[addr]:port`. A bare port binds every
/// local overlay address.
fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    if let Some(port) = addr.strip_prefix(':') {
        let port = port
            .parse::<u16>()
            .map_err(|_| EngineError::InvalidAddress(format!("bad port in {addr:?}")))?;
        return Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port));
    }
    addr.parse()
        .map_err(|_| EngineError::InvalidAddress(format!("cannot parse {addr:?}")))
}

impl Engine {
    /// Bind an overlay listener.
    ///
    /// # Errors
    ///
    /// - [`EngineError::UnsupportedProtocol`] unless `protocol` is `tcp`
    /// - [`EngineError::InvalidAddress`] for malformed or non-local addresses
    /// - [`EngineError::AddressInUse`] if the port is taken
    /// - [`EngineError::Closed`] after [`Engine::close`]
    pub fn listen(&self, protocol: &str, addr: &str) -> Result<OverlayListener> {
        self.ensure_open()?;
        if protocol != "tcp" {
            return Err(EngineError::UnsupportedProtocol(protocol.to_string()));
        }
        let addr = parse_listen_addr(addr)?;
        let listener = self.netstack().listen(addr)?;
        tracing::info!(parent: self.span(), addr = %listener.local_addr(), "overlay listener bound");
        Ok(listener)
    }

    /// Open a stream to `remote`, waiting for a path to its owner first.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Cancelled`] if `cancel` fires first
    /// - [`EngineError::Closed`] if the engine closes first
    /// - [`EngineError::NoRoute`] if no known peer owns the address
    /// - [`EngineError::ConnectionRefused`] if nothing listens on the port
    pub async fn dial_tcp(&self, cancel: &CancellationToken, remote: SocketAddr) -> Result<OverlayStream> {
        self.ensure_open()?;
        if !crate::is_overlay_address(&remote.ip()) {
            return Err(EngineError::InvalidAddress(format!("{} is not an overlay address", remote.ip())));
        }
        self.wait_for_path(cancel, remote.ip()).await?;
        let stream = self.netstack().connect(cancel, remote).await?;
        tracing::debug!(parent: self.span(), local = %stream.local_addr(), %remote, "overlay stream connected");
        Ok(stream)
    }
}
