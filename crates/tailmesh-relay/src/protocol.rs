//! Relay protocol message definitions and stream framing.
//!
//! Messages are bincode-encoded. On the native transport each message is
//! preceded by a 4-byte big-endian length; over WebSocket each message is one
//! binary frame.

use crate::websocket::{self, WsFrame};
use crate::{MAX_RELAY_PACKET_SIZE, RelayError};
use serde::{Deserialize, Serialize};
use tailmesh_crypto::NodeKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for an encoded message (payload plus envelope).
pub const MAX_FRAME_SIZE: usize = MAX_RELAY_PACKET_SIZE + 1024;

/// Relay protocol messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RelayMessage {
    /// Client registers its node key with the relay
    Register {
        /// Client's node key
        key: NodeKey,
    },

    /// Relay asks the client to prove it holds the private half of the
    /// key it registered
    Challenge {
        /// Relay's own node key
        server_key: NodeKey,
        /// Random nonce the client must seal
        nonce: [u8; 32],
    },

    /// Client answer to `Challenge`: the nonce sealed for the relay key
    Proof {
        /// Nonce sealed with the client/relay shared key
        sealed: Vec<u8>,
    },

    /// Relay acknowledges registration
    RegisterAck {
        /// Relay's unique identifier
        relay_id: [u8; 16],
        /// Whether registration succeeded
        success: bool,
        /// Optional error message
        error: Option<String>,
    },

    /// Client sends packet to another peer through relay
    SendPacket {
        /// Destination node key
        dest: NodeKey,
        /// Encrypted payload (relay cannot decrypt)
        payload: Vec<u8>,
    },

    /// Relay forwards packet to recipient
    RecvPacket {
        /// Source node key
        src: NodeKey,
        /// Encrypted payload
        payload: Vec<u8>,
    },

    /// The destination of a `SendPacket` is not connected to this relay
    PeerGone {
        /// Peer that is not registered here
        peer: NodeKey,
    },

    /// Latency probe; the relay answers with `Pong` carrying the same data
    Ping {
        /// Opaque probe data
        data: [u8; 8],
    },

    /// Answer to `Ping`
    Pong {
        /// Data copied from the `Ping`
        data: [u8; 8],
    },

    /// Keepalive message (no payload)
    Keepalive,

    /// Client disconnects from relay
    Disconnect,

    /// Relay error response
    Error {
        /// Error code
        code: RelayErrorCode,
        /// Human-readable error message
        message: String,
    },
}

/// Relay error codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayErrorCode {
    /// Client not registered with relay
    NotRegistered = 1,
    /// Destination peer not found
    PeerNotFound = 2,
    /// Rate limit exceeded
    RateLimited = 3,
    /// Invalid message format
    InvalidMessage = 4,
    /// Server at capacity
    ServerFull = 5,
    /// Registration proof did not match the registered key
    KeyProofFailed = 6,
    /// Internal server error
    InternalError = 7,
}

/// Associated data bound into every registration proof.
pub(crate) const REGISTER_PROOF_AAD: &[u8] = b"tailmesh relay register";

impl RelayMessage {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, RelayError> {
        bincode::serialize(self).map_err(|e| RelayError::Serialization(e.to_string()))
    }

    /// Deserialize message from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RelayError> {
        bincode::deserialize(bytes).map_err(|e| RelayError::Deserialization(e.to_string()))
    }

    /// Get the message type name
    pub fn message_type(&self) -> &'static str {
        match self {
            RelayMessage::Register { .. } => "Register",
            RelayMessage::Challenge { .. } => "Challenge",
            RelayMessage::Proof { .. } => "Proof",
            RelayMessage::RegisterAck { .. } => "RegisterAck",
            RelayMessage::SendPacket { .. } => "SendPacket",
            RelayMessage::RecvPacket { .. } => "RecvPacket",
            RelayMessage::PeerGone { .. } => "PeerGone",
            RelayMessage::Ping { .. } => "Ping",
            RelayMessage::Pong { .. } => "Pong",
            RelayMessage::Keepalive => "Keepalive",
            RelayMessage::Disconnect => "Disconnect",
            RelayMessage::Error { .. } => "Error",
        }
    }
}

/// How relay messages are delimited on an upgraded connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `Upgrade: DERP`: 4-byte length prefix per message.
    Native,
    /// `Upgrade: websocket`: one binary frame per message.
    WebSocket {
        /// Whether outgoing frames are masked (client side).
        mask: bool,
    },
}

/// Reading half of an upgraded relay connection.
pub struct RelayReader<R> {
    inner: R,
    framing: Framing,
}

/// Writing half of an upgraded relay connection.
pub struct RelayWriter<W> {
    inner: W,
    framing: Framing,
}

impl<R: AsyncRead + Unpin> RelayReader<R> {
    /// Wrap a reader
    pub fn new(inner: R, framing: Framing) -> Self {
        Self { inner, framing }
    }

    /// Read the next relay message.
    ///
    /// WebSocket control frames are consumed transparently; a close frame
    /// ends the stream with [`RelayError::Closed`]. Not cancel-safe: a
    /// partially read frame is lost if the future is dropped.
    pub async fn read_message(&mut self) -> Result<RelayMessage, RelayError> {
        match self.framing {
            Framing::Native => {
                let len = self.inner.read_u32().await? as usize;
                if len > MAX_FRAME_SIZE {
                    return Err(RelayError::FrameTooLarge(len));
                }
                let mut body = vec![0u8; len];
                self.inner.read_exact(&mut body).await?;
                RelayMessage::from_bytes(&body)
            }
            Framing::WebSocket { .. } => loop {
                match websocket::read_frame(&mut self.inner, MAX_FRAME_SIZE).await? {
                    WsFrame::Binary(body) => return RelayMessage::from_bytes(&body),
                    WsFrame::Close => return Err(RelayError::Closed),
                    // Control frames are not answered here; relays use
                    // protocol-level Ping/Pong instead.
                    WsFrame::Ping(_) | WsFrame::Pong(_) => continue,
                }
            },
        }
    }
}

impl<W: AsyncWrite + Unpin> RelayWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W, framing: Framing) -> Self {
        Self { inner, framing }
    }

    /// Encode and flush one relay message.
    pub async fn write_message(&mut self, msg: &RelayMessage) -> Result<(), RelayError> {
        let body = msg.to_bytes()?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(RelayError::FrameTooLarge(body.len()));
        }
        let frame = match self.framing {
            Framing::Native => {
                let mut frame = Vec::with_capacity(4 + body.len());
                frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
                frame.extend_from_slice(&body);
                frame
            }
            Framing::WebSocket { mask } => websocket::encode_binary(&body, mask),
        };
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Send a WebSocket close frame (no-op on the native transport) and
    /// shut the writer down.
    pub async fn close(&mut self) -> Result<(), RelayError> {
        if let Framing::WebSocket { mask } = self.framing {
            self.inner.write_all(&websocket::encode_close(mask)).await?;
        }
        self.inner.shutdown().await?;
        Ok(())
    }
}
