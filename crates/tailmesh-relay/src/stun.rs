//! STUN binding (RFC 5389) for reflexive endpoint discovery.
//!
//! Only the Binding method and the XOR-MAPPED-ADDRESS attribute are
//! implemented. Nodes send requests from their overlay UDP socket so the
//! reflected port is the one peers must use; the responder here is what a
//! relay region advertises in [`RelayNode::stun_addr`](crate::RelayNode).

use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// STUN magic cookie (RFC 5389)
const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN header size in bytes
const HEADER_SIZE: usize = 20;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunClass {
    /// Binding request
    Request,
    /// Binding success response
    SuccessResponse,
}

/// A Binding request or success response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    /// Message class
    pub class: StunClass,
    /// Transaction ID (96 bits)
    pub transaction_id: [u8; 12],
    /// XOR-MAPPED-ADDRESS, present in responses
    pub mapped: Option<SocketAddr>,
}

/// STUN error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StunError {
    /// Message shorter than a header or than its declared length
    MessageTooShort,
    /// Invalid magic cookie
    InvalidMagicCookie,
    /// Not a Binding request or success response
    InvalidMessageType,
    /// Malformed attribute
    InvalidAttribute,
}

impl std::fmt::Display for StunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageTooShort => write!(f, "STUN message too short"),
            Self::InvalidMagicCookie => write!(f, "Invalid STUN magic cookie"),
            Self::InvalidMessageType => write!(f, "Invalid STUN message type"),
            Self::InvalidAttribute => write!(f, "Invalid STUN attribute"),
        }
    }
}

impl std::error::Error for StunError {}

/// Cheap check used to demultiplex STUN from other UDP traffic.
#[must_use]
pub fn is_stun_packet(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_SIZE
        && bytes[0] & 0xC0 == 0
        && u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) == MAGIC_COOKIE
}

impl StunMessage {
    /// Create a Binding request with a random transaction ID.
    #[must_use]
    pub fn binding_request() -> Self {
        let mut transaction_id = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut transaction_id);
        Self {
            class: StunClass::Request,
            transaction_id,
            mapped: None,
        }
    }

    /// Create the success response to `request` reflecting `observed`.
    #[must_use]
    pub fn binding_response(request: &StunMessage, observed: SocketAddr) -> Self {
        Self {
            class: StunClass::SuccessResponse,
            transaction_id: request.transaction_id,
            mapped: Some(observed),
        }
    }

    /// Encode to wire format.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let msg_type = match self.class {
            StunClass::Request => BINDING_REQUEST,
            StunClass::SuccessResponse => BINDING_SUCCESS,
        };

        let mut attrs = Vec::new();
        if let Some(addr) = self.mapped {
            let value = encode_xor_address(addr, &self.transaction_id);
            attrs.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
            attrs.extend_from_slice(&(value.len() as u16).to_be_bytes());
            attrs.extend_from_slice(&value);
        }

        let mut bytes = Vec::with_capacity(HEADER_SIZE + attrs.len());
        bytes.extend_from_slice(&msg_type.to_be_bytes());
        bytes.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        bytes.extend_from_slice(&self.transaction_id);
        bytes.extend_from_slice(&attrs);
        bytes
    }

    /// Decode from wire format. Unknown attributes are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StunError`] if the header is malformed, the method is not
    /// Binding, or XOR-MAPPED-ADDRESS is malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self, StunError> {
        if bytes.len() < HEADER_SIZE {
            return Err(StunError::MessageTooShort);
        }

        let msg_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let msg_length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let magic_cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        if magic_cookie != MAGIC_COOKIE {
            return Err(StunError::InvalidMagicCookie);
        }
        if bytes.len() < HEADER_SIZE + msg_length {
            return Err(StunError::MessageTooShort);
        }

        let class = match msg_type {
            BINDING_REQUEST => StunClass::Request,
            BINDING_SUCCESS => StunClass::SuccessResponse,
            _ => return Err(StunError::InvalidMessageType),
        };

        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..20]);

        let mut mapped = None;
        let body = &bytes[HEADER_SIZE..HEADER_SIZE + msg_length];
        let mut offset = 0;
        while offset + 4 <= body.len() {
            let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
            let attr_length = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
            offset += 4;
            if offset + attr_length > body.len() {
                return Err(StunError::InvalidAttribute);
            }
            if attr_type == ATTR_XOR_MAPPED_ADDRESS {
                mapped = Some(decode_xor_address(
                    &body[offset..offset + attr_length],
                    &transaction_id,
                )?);
            }
            // Skip padding to 4-byte boundary
            offset += attr_length + (4 - attr_length % 4) % 4;
        }

        Ok(Self {
            class,
            transaction_id,
            mapped,
        })
    }
}

fn xor_key(transaction_id: &[u8; 12]) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction_id);
    key
}

fn encode_xor_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Vec<u8> {
    let key = xor_key(transaction_id);
    let mut value = vec![0, if addr.is_ipv4() { 0x01 } else { 0x02 }];
    let xor_port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    value.extend_from_slice(&xor_port.to_be_bytes());
    match addr.ip() {
        IpAddr::V4(ip) => value.extend(ip.octets().iter().zip(key).map(|(b, k)| b ^ k)),
        IpAddr::V6(ip) => value.extend(ip.octets().iter().zip(key).map(|(b, k)| b ^ k)),
    }
    value
}

fn decode_xor_address(value: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::InvalidAttribute);
    }
    let key = xor_key(transaction_id);
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    let ip = match (value[1], value.len()) {
        (0x01, 8) => {
            let mut octets = [0u8; 4];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ key[i];
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        (0x02, 20) => {
            let mut octets = [0u8; 16];
            for (i, octet) in octets.iter_mut().enumerate() {
                *octet = value[4 + i] ^ key[i];
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::InvalidAttribute),
    };
    Ok(SocketAddr::new(ip, port))
}

/// UDP STUN responder answering Binding requests.
pub struct StunServer {
    socket: UdpSocket,
}

impl StunServer {
    /// Bind the responder.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket cannot be bound.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        Ok(Self {
            socket: UdpSocket::bind(addr).await?,
        })
    }

    /// Address the responder is bound to.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket address cannot be read.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Answer requests until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut buf = [0u8; 1500];
        loop {
            let (len, from) = tokio::select! {
                () = cancel.cancelled() => break,
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!("STUN receive error: {e}");
                        continue;
                    }
                },
            };

            let request = match StunMessage::decode(&buf[..len]) {
                Ok(msg) if msg.class == StunClass::Request => msg,
                Ok(_) => continue,
                Err(e) => {
                    tracing::trace!(%from, "dropping non-STUN datagram: {e}");
                    continue;
                }
            };

            let response = StunMessage::binding_response(&request, from).encode();
            if let Err(e) = self.socket.send_to(&response, from).await {
                tracing::debug!(%from, "STUN send error: {e}");
            }
        }
    }
}
