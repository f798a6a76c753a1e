//! Relay client: upgrade, register, exchange messages.
//!
//! Connecting first attempts the native `Upgrade: DERP` handshake. If the
//! relay (or something in front of it) answers with anything but
//! `101 Switching Protocols`, the client reconnects tunnelling the same
//! protocol over WebSocket and remembers why, so the reason can be
//! advertised to peers.

use crate::http::{self, HttpResponse};
use crate::protocol::{Framing, REGISTER_PROOF_AAD, RelayMessage, RelayReader, RelayWriter};
use crate::websocket;
use crate::{
    NATIVE_UPGRADE, RELAY_CONNECT_TIMEOUT, RELAY_PATH, RelayError, RelayNode, WEBSOCKET_PROTOCOL,
};
use std::time::Duration;
use tailmesh_crypto::{NodeKey, NodePrivate, PeerCipher};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Reading half of a client connection.
pub type ClientReader = RelayReader<BufReader<OwnedReadHalf>>;

/// Writing half of a client connection.
pub type ClientWriter = RelayWriter<OwnedWriteHalf>;

/// Options for [`RelayClient::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Skip the native upgrade and go straight to WebSocket, keeping this
    /// previously observed reason.
    pub forced_websocket: Option<String>,
    /// Bound on the whole connect and register sequence.
    pub timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            forced_websocket: None,
            timeout: RELAY_CONNECT_TIMEOUT,
        }
    }
}

/// A registered connection to one relay node.
pub struct RelayClient {
    reader: ClientReader,
    writer: ClientWriter,
    relay_id: [u8; 16],
    forced_websocket: Option<String>,
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("relay_id", &hex_prefix(&self.relay_id))
            .field("forced_websocket", &self.forced_websocket)
            .finish_non_exhaustive()
    }
}

fn hex_prefix(id: &[u8; 16]) -> String {
    id[..4].iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transport {
    Native,
    WebSocket,
}

impl RelayClient {
    /// Connect and register the public half of `private` with the relay
    /// node, proving ownership through the relay's challenge.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Timeout`] if the sequence exceeds
    /// `opts.timeout`, [`RelayError::Handshake`] if the WebSocket fallback
    /// is also refused, or the relay's registration error.
    pub async fn connect(
        node: &RelayNode,
        private: &NodePrivate,
        opts: &ConnectOptions,
    ) -> Result<Self, RelayError> {
        tokio::time::timeout(opts.timeout, Self::connect_inner(node, private, opts)).await?
    }

    async fn connect_inner(
        node: &RelayNode,
        private: &NodePrivate,
        opts: &ConnectOptions,
    ) -> Result<Self, RelayError> {
        let mut forced = opts.forced_websocket.clone();

        if forced.is_none() {
            match upgrade(node, Transport::Native).await {
                Ok((reader, writer)) => return register(reader, writer, private, None).await,
                Err(e @ RelayError::UpgradeRejected { .. }) => {
                    let reason = e.to_string();
                    tracing::info!(relay = %node.name, "native upgrade refused, falling back to WebSocket: {reason}");
                    forced = Some(reason);
                }
                Err(e) => return Err(e),
            }
        }

        let (reader, writer) = upgrade(node, Transport::WebSocket).await?;
        register(reader, writer, private, forced).await
    }

    /// Why this connection is tunnelled over WebSocket, if it is.
    #[must_use]
    pub fn forced_websocket(&self) -> Option<&str> {
        self.forced_websocket.as_deref()
    }

    /// Identifier the relay assigned at registration.
    #[must_use]
    pub fn relay_id(&self) -> [u8; 16] {
        self.relay_id
    }

    /// Send an opaque payload to `dest` via the relay.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is broken.
    pub async fn send(&mut self, dest: NodeKey, payload: Vec<u8>) -> Result<(), RelayError> {
        self.writer
            .write_message(&RelayMessage::SendPacket { dest, payload })
            .await
    }

    /// Receive the next message from the relay.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Closed`] when the relay hangs up.
    pub async fn recv(&mut self) -> Result<RelayMessage, RelayError> {
        self.reader.read_message().await
    }

    /// Split into independently owned halves.
    #[must_use]
    pub fn into_parts(self) -> (ClientReader, ClientWriter) {
        (self.reader, self.writer)
    }

    /// Say goodbye and close the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the goodbye cannot be written.
    pub async fn close(mut self) -> Result<(), RelayError> {
        self.writer.write_message(&RelayMessage::Disconnect).await?;
        self.writer.close().await
    }
}

pub(crate) async fn upgrade(
    node: &RelayNode,
    transport: Transport,
) -> Result<(ClientReader, ClientWriter), RelayError> {
    let (host, port) = node.authority()?;
    let stream = TcpStream::connect((host.as_str(), port)).await?;
    stream.set_nodelay(true)?;
    let (read, mut write) = stream.into_split();
    let mut read = BufReader::new(read);

    let host_header = match node.url.port() {
        Some(p) => format!("{}:{p}", node.url.host_str().unwrap_or(&host)),
        None => node.url.host_str().unwrap_or(&host).to_string(),
    };

    let ws_key = websocket::generate_key();
    let request = match transport {
        Transport::Native => http::request_bytes(
            "GET",
            RELAY_PATH,
            &[
                ("Host", host_header.as_str()),
                ("Upgrade", NATIVE_UPGRADE),
                ("Connection", "Upgrade"),
            ],
        ),
        Transport::WebSocket => http::request_bytes(
            "GET",
            RELAY_PATH,
            &[
                ("Host", host_header.as_str()),
                ("Upgrade", "websocket"),
                ("Connection", "Upgrade"),
                ("Sec-WebSocket-Key", ws_key.as_str()),
                ("Sec-WebSocket-Version", "13"),
                ("Sec-WebSocket-Protocol", WEBSOCKET_PROTOCOL),
            ],
        ),
    };
    write.write_all(&request).await?;
    write.flush().await?;

    let response = http::read_response(&mut read).await?;
    check_upgrade(&response, transport, &ws_key)?;

    let framing = match transport {
        Transport::Native => Framing::Native,
        Transport::WebSocket => Framing::WebSocket { mask: true },
    };
    Ok((
        RelayReader::new(read, framing),
        RelayWriter::new(write, framing),
    ))
}

fn check_upgrade(
    response: &HttpResponse,
    transport: Transport,
    ws_key: &str,
) -> Result<(), RelayError> {
    match transport {
        Transport::Native if response.status != 101 => Err(RelayError::UpgradeRejected {
            status: response.status,
            body: response.body.clone(),
        }),
        Transport::Native => Ok(()),
        Transport::WebSocket if response.status != 101 => Err(RelayError::Handshake(format!(
            "websocket upgrade failed with status code {}: {}",
            response.status, response.body
        ))),
        Transport::WebSocket => {
            let expected = websocket::accept_key(ws_key);
            if response.header("Sec-WebSocket-Accept") != Some(expected.as_str()) {
                return Err(RelayError::Handshake(
                    "missing or wrong Sec-WebSocket-Accept".into(),
                ));
            }
            Ok(())
        }
    }
}

async fn register(
    mut reader: ClientReader,
    mut writer: ClientWriter,
    private: &NodePrivate,
    forced_websocket: Option<String>,
) -> Result<RelayClient, RelayError> {
    writer
        .write_message(&RelayMessage::Register {
            key: private.public_key(),
        })
        .await?;

    match reader.read_message().await? {
        RelayMessage::Challenge { server_key, nonce } => {
            let sealed = seal_proof(private, &server_key, &nonce)?;
            writer.write_message(&RelayMessage::Proof { sealed }).await?;
        }
        RelayMessage::Error { code, .. } => return Err(code.into()),
        _ => return Err(RelayError::InvalidMessage),
    }

    match reader.read_message().await? {
        RelayMessage::RegisterAck {
            relay_id,
            success: true,
            ..
        } => Ok(RelayClient {
            reader,
            writer,
            relay_id,
            forced_websocket,
        }),
        RelayMessage::RegisterAck { error, .. } => Err(RelayError::Handshake(
            error.unwrap_or_else(|| "Registration failed".to_string()),
        )),
        RelayMessage::Error { code, .. } => Err(code.into()),
        _ => Err(RelayError::InvalidMessage),
    }
}

/// Seal the relay's registration nonce for `server_key`.
pub(crate) fn seal_proof(
    private: &NodePrivate,
    server_key: &NodeKey,
    nonce: &[u8],
) -> Result<Vec<u8>, RelayError> {
    PeerCipher::new(private, server_key)
        .and_then(|cipher| cipher.seal(nonce, REGISTER_PROOF_AAD))
        .map_err(|e| RelayError::Handshake(e.to_string()))
}
