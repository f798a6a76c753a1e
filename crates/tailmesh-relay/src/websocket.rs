//! Minimal RFC 6455 framing for tunnelling the relay protocol.
//!
//! Only what the relay needs: binary data frames (fragmented or not), close,
//! ping and pong. Client frames are masked, server frames are not.

use crate::RelayError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};

/// WebSocket FIN bit
const FIN_BIT: u8 = 0x80;
/// WebSocket MASK bit
const MASK_BIT: u8 = 0x80;

const OPCODE_CONTINUATION: u8 = 0x00;
const OPCODE_TEXT: u8 = 0x01;
const OPCODE_BINARY: u8 = 0x02;
const OPCODE_CLOSE: u8 = 0x08;
const OPCODE_PING: u8 = 0x09;
const OPCODE_PONG: u8 = 0x0A;

/// GUID appended to `Sec-WebSocket-Key` when computing the accept value.
const HANDSHAKE_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A decoded, unmasked WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    /// Complete binary (or text) message
    Binary(Vec<u8>),
    /// Close frame
    Close,
    /// Ping control frame
    Ping(Vec<u8>),
    /// Pong control frame
    Pong(Vec<u8>),
}

/// Compute `Sec-WebSocket-Accept` for a client key.
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(HANDSHAKE_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Random `Sec-WebSocket-Key` for a client handshake.
#[must_use]
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::thread_rng().r#gen();
    STANDARD.encode(nonce)
}

/// Encode a single final binary frame.
#[must_use]
pub fn encode_binary(payload: &[u8], mask: bool) -> Vec<u8> {
    encode_frame(OPCODE_BINARY, payload, mask)
}

/// Encode a close frame with no status.
#[must_use]
pub fn encode_close(mask: bool) -> Vec<u8> {
    encode_frame(OPCODE_CLOSE, &[], mask)
}

fn encode_frame(opcode: u8, payload: &[u8], mask: bool) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);

    // Byte 1: FIN + RSV + OPCODE
    frame.push(FIN_BIT | opcode);

    // Byte 2: MASK + Payload length
    let mask_bit = if mask { MASK_BIT } else { 0x00 };
    if payload.len() < 126 {
        frame.push(mask_bit | payload.len() as u8);
    } else if payload.len() < 65536 {
        frame.push(mask_bit | 126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        frame.push(mask_bit | 127);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }

    if mask {
        let key: [u8; 4] = rand::thread_rng().r#gen();
        frame.extend_from_slice(&key);
        frame.extend(payload.iter().enumerate().map(|(i, &b)| b ^ key[i % 4]));
    } else {
        frame.extend_from_slice(payload);
    }

    frame
}

/// Read one complete message, reassembling fragmented data frames.
///
/// # Errors
///
/// Returns [`RelayError::FrameTooLarge`] when the message exceeds `max_len`
/// and [`RelayError::InvalidMessage`] for unknown opcodes or a continuation
/// frame without a preceding data frame.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<WsFrame, RelayError> {
    let mut message: Option<Vec<u8>> = None;

    loop {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await?;

        let fin = head[0] & FIN_BIT != 0;
        let opcode = head[0] & 0x0F;
        let masked = head[1] & MASK_BIT != 0;

        let len = match head[1] & 0x7F {
            126 => u64::from(reader.read_u16().await?),
            127 => reader.read_u64().await?,
            n => u64::from(n),
        };
        let len = usize::try_from(len).map_err(|_| RelayError::FrameTooLarge(usize::MAX))?;
        let buffered = message.as_ref().map_or(0, Vec::len);
        if len > max_len || buffered + len > max_len {
            return Err(RelayError::FrameTooLarge(buffered + len));
        }

        let key = if masked {
            let mut key = [0u8; 4];
            reader.read_exact(&mut key).await?;
            Some(key)
        } else {
            None
        };

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        if let Some(key) = key {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        match opcode {
            OPCODE_CLOSE => return Ok(WsFrame::Close),
            OPCODE_PING => return Ok(WsFrame::Ping(payload)),
            OPCODE_PONG => return Ok(WsFrame::Pong(payload)),
            OPCODE_BINARY | OPCODE_TEXT if message.is_none() => {
                if fin {
                    return Ok(WsFrame::Binary(payload));
                }
                message = Some(payload);
            }
            OPCODE_CONTINUATION => {
                let Some(mut buf) = message.take() else {
                    return Err(RelayError::InvalidMessage);
                };
                buf.extend_from_slice(&payload);
                if fin {
                    return Ok(WsFrame::Binary(buf));
                }
                message = Some(buf);
            }
            _ => return Err(RelayError::InvalidMessage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc6455_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generate_key_is_16_bytes() {
        let key = generate_key();
        assert_eq!(STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_server_frame_layout() {
        let frame = encode_binary(b"hello", false);
        assert_eq!(frame[0], 0x82);
        assert_eq!(frame[1], 5);
        assert_eq!(&frame[2..], b"hello");
    }

    #[test]
    fn test_client_frame_is_masked() {
        let frame = encode_binary(b"hello", true);
        assert_eq!(frame[1] & 0x80, 0x80);
        assert_eq!(frame.len(), 2 + 4 + 5);
    }

    #[test]
    fn test_extended_lengths() {
        assert_eq!(encode_binary(&[0u8; 200], false)[1], 126);
        assert_eq!(encode_binary(&vec![0u8; 70_000], false)[1], 127);
    }

    #[tokio::test]
    async fn test_masked_roundtrip() {
        let payload = vec![0x5a; 1000];
        let frame = encode_binary(&payload, true);
        let mut cursor = std::io::Cursor::new(frame);
        assert_eq!(
            read_frame(&mut cursor, 4096).await.unwrap(),
            WsFrame::Binary(payload)
        );
    }

    #[tokio::test]
    async fn test_fragmented_message_reassembled() {
        let mut bytes = vec![OPCODE_BINARY, 3];
        bytes.extend_from_slice(b"abc");
        bytes.extend_from_slice(&[FIN_BIT | OPCODE_CONTINUATION, 2]);
        bytes.extend_from_slice(b"de");
        let mut cursor = std::io::Cursor::new(bytes);
        assert_eq!(
            read_frame(&mut cursor, 4096).await.unwrap(),
            WsFrame::Binary(b"abcde".to_vec())
        );
    }

    #[tokio::test]
    async fn test_close_and_ping() {
        let mut bytes = encode_frame(OPCODE_PING, b"p", false);
        bytes.extend_from_slice(&encode_close(true));
        let mut cursor = std::io::Cursor::new(bytes);
        assert_eq!(
            read_frame(&mut cursor, 16).await.unwrap(),
            WsFrame::Ping(b"p".to_vec())
        );
        assert_eq!(read_frame(&mut cursor, 16).await.unwrap(), WsFrame::Close);
    }

    #[tokio::test]
    async fn test_too_large_rejected() {
        let frame = encode_binary(&[1u8; 300], false);
        let mut cursor = std::io::Cursor::new(frame);
        assert!(matches!(
            read_frame(&mut cursor, 100).await,
            Err(RelayError::FrameTooLarge(300))
        ));
    }

    #[tokio::test]
    async fn test_stray_continuation_rejected() {
        let mut cursor = std::io::Cursor::new(vec![FIN_BIT | OPCODE_CONTINUATION, 0]);
        assert_eq!(
            read_frame(&mut cursor, 16).await,
            Err(RelayError::InvalidMessage)
        );
    }
}
