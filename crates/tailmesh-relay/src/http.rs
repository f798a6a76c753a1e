//! Just enough HTTP/1.1 for the relay upgrade handshake.
//!
//! Both sides read the head through a buffered reader that stays attached
//! to the connection afterwards, so bytes that arrive right behind the head
//! belong to the upgraded protocol and are never lost.

use crate::RelayError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound on request/response head size, and on the chunk-size lines
/// of one chunked body.
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Upper bound on a rejection body we are willing to read.
const MAX_BODY_SIZE: usize = 4 * 1024;

/// Parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method, e.g. `GET`
    pub method: String,
    /// Request target, e.g. `/derp`
    pub path: String,
    /// Headers in arrival order
    pub headers: Vec<(String, String)>,
}

/// Parsed status line, headers and (small) body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Reason phrase
    pub reason: String,
    /// Headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Body of a non-101 response, truncated to a few KiB
    pub body: String,
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Read one CRLF- or LF-terminated line without its terminator, charging it
/// against `budget`. Never buffers more than the remaining budget.
async fn read_line_limited<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    budget: &mut usize,
) -> Result<String, RelayError> {
    let mut raw = Vec::new();
    let n = (&mut *reader)
        .take(*budget as u64)
        .read_until(b'\n', &mut raw)
        .await?;
    *budget -= n;
    if raw.last() != Some(&b'\n') {
        return Err(if *budget == 0 {
            RelayError::Handshake("HTTP head too large".into())
        } else {
            RelayError::Closed
        });
    }
    let line = String::from_utf8(raw)
        .map_err(|_| RelayError::Handshake("HTTP line is not UTF-8".into()))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn read_head<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<(String, Vec<(String, String)>), RelayError> {
    let mut budget = MAX_HEAD_SIZE;
    let first = read_line_limited(reader, &mut budget).await?;

    let mut headers = Vec::new();
    loop {
        let line = read_line_limited(reader, &mut budget).await?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RelayError::Handshake(format!("malformed header line {line:?}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok((first, headers))
}

/// Read a `Transfer-Encoding: chunked` body, keeping at most
/// `MAX_BODY_SIZE` bytes. Trailers are not read.
async fn read_chunked<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, RelayError> {
    let mut budget = MAX_HEAD_SIZE;
    let mut body = Vec::new();
    loop {
        let line = read_line_limited(reader, &mut budget).await?;
        let size = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size, 16)
            .map_err(|_| RelayError::Handshake(format!("malformed chunk size {line:?}")))?;
        if size == 0 {
            return Ok(body);
        }
        let keep = size.min(MAX_BODY_SIZE - body.len());
        let start = body.len();
        body.resize(start + keep, 0);
        reader.read_exact(&mut body[start..]).await?;
        if keep < size {
            return Ok(body);
        }
        if !read_line_limited(reader, &mut budget).await?.is_empty() {
            return Err(RelayError::Handshake("chunk data overruns its size".into()));
        }
    }
}

/// Read a response body framed by chunking, `Content-Length`, or the end of
/// the connection, in that order of precedence.
async fn read_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    headers: &[(String, String)],
) -> Result<Vec<u8>, RelayError> {
    let chunked = find_header(headers, "Transfer-Encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return read_chunked(reader).await;
    }

    let mut raw = Vec::new();
    match find_header(headers, "Content-Length") {
        Some(len) => {
            let len = len
                .parse::<usize>()
                .map_err(|_| RelayError::Handshake(format!("malformed Content-Length {len:?}")))?
                .min(MAX_BODY_SIZE);
            raw.resize(len, 0);
            reader.read_exact(&mut raw).await?;
        }
        None => {
            (&mut *reader)
                .take(MAX_BODY_SIZE as u64)
                .read_to_end(&mut raw)
                .await?;
        }
    }
    Ok(raw)
}

/// Read a request head.
///
/// # Errors
///
/// Returns [`RelayError::Handshake`] for a malformed head and
/// [`RelayError::Closed`] if the peer hangs up first.
pub async fn read_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<HttpRequest, RelayError> {
    let (line, headers) = read_head(reader).await?;
    let mut parts = line.split_whitespace();
    let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(RelayError::Handshake(format!("malformed request line {line:?}")));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(RelayError::Handshake(format!("unsupported version {version}")));
    }
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        headers,
    })
}

/// Read a response head and, for non-101 responses, its body.
///
/// # Errors
///
/// Returns [`RelayError::Handshake`] for a malformed head and
/// [`RelayError::Closed`] if the peer hangs up first.
pub async fn read_response<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<HttpResponse, RelayError> {
    let (line, headers) = read_head(reader).await?;
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(RelayError::Handshake(format!("malformed status line {line:?}")));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| RelayError::Handshake(format!("malformed status line {line:?}")))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let body = if has_body(status) {
        let raw = read_body(reader, &headers).await?;
        String::from_utf8_lossy(&raw).trim_end().to_string()
    } else {
        String::new()
    };

    Ok(HttpResponse {
        status,
        reason,
        headers,
        body,
    })
}

/// Informational, `204` and `304` responses never carry a body.
fn has_body(status: u16) -> bool {
    !(100..200).contains(&status) && status != 204 && status != 304
}

/// Serialize a request head.
#[must_use]
pub fn request_bytes(method: &str, path: &str, headers: &[(&str, &str)]) -> Vec<u8> {
    let mut out = format!("{method} {path} HTTP/1.1\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    out.into_bytes()
}

/// Serialize a response; a non-empty body gets `Content-Length`.
#[must_use]
pub fn response_bytes(status: u16, reason: &str, headers: &[(&str, &str)], body: &str) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    if status != 101 {
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    out.push_str("\r\n");
    out.push_str(body);
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_request_roundtrip() {
        let bytes = request_bytes(
            "GET",
            "/derp",
            &[("Host", "127.0.0.1"), ("Upgrade", "DERP"), ("Connection", "Upgrade")],
        );
        let mut reader = BufReader::new(bytes.as_slice());
        let req = read_request(&mut reader).await.unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/derp");
        assert_eq!(req.header("upgrade"), Some("DERP"));
        assert_eq!(req.header("missing"), None);
    }

    #[tokio::test]
    async fn test_rejection_body_read() {
        let body = "Invalid \"Upgrade\" header: DERP";
        let bytes = response_bytes(400, "Bad Request", &[], body);
        let mut reader = BufReader::new(bytes.as_slice());
        let resp = read_response(&mut reader).await.unwrap();
        assert_eq!(resp.status, 400);
        assert_eq!(resp.reason, "Bad Request");
        assert_eq!(resp.body, body);
    }

    #[tokio::test]
    async fn test_switching_protocols_leaves_trailing_bytes() {
        let mut bytes = response_bytes(101, "Switching Protocols", &[("Upgrade", "DERP")], "");
        bytes.extend_from_slice(b"\x00\x00\x00\x01X");
        let mut reader = BufReader::new(bytes.as_slice());
        let resp = read_response(&mut reader).await.unwrap();
        assert_eq!(resp.status, 101);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"\x00\x00\x00\x01X");
    }

    #[tokio::test]
    async fn test_chunked_rejection_body_read() {
        let bytes = b"HTTP/1.1 400 Bad Request\r\nTransfer-Encoding: chunked\r\n\r\n\
10\r\nInvalid \"Upgrade\r\ne;ext=1\r\n\" header: derp\r\n0\r\n\r\n";
        let mut reader = BufReader::new(&bytes[..]);
        let resp = read_response(&mut reader).await.unwrap();
        assert_eq!(resp.status, 400);
        assert_eq!(resp.body, "Invalid \"Upgrade\" header: derp");
    }

    #[tokio::test]
    async fn test_close_delimited_rejection_body_read() {
        let bytes =
            b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\nInvalid \"Upgrade\" header: derp\n";
        let mut reader = BufReader::new(&bytes[..]);
        let resp = read_response(&mut reader).await.unwrap();
        assert_eq!(resp.status, 400);
        assert_eq!(resp.body, "Invalid \"Upgrade\" header: derp");
    }

    #[tokio::test]
    async fn test_oversized_body_truncated() {
        let mut bytes = b"HTTP/1.1 502 Bad Gateway\r\n\r\n".to_vec();
        bytes.extend(std::iter::repeat_n(b'x', MAX_BODY_SIZE * 2));
        let mut reader = BufReader::new(bytes.as_slice());
        let resp = read_response(&mut reader).await.unwrap();
        assert_eq!(resp.body.len(), MAX_BODY_SIZE);
    }

    #[tokio::test]
    async fn test_endless_header_line_bounded() {
        let mut reader = BufReader::new(tokio::io::repeat(b'a'));
        assert_eq!(
            read_request(&mut reader).await,
            Err(RelayError::Handshake("HTTP head too large".into()))
        );

        let mut head = b"HTTP/1.1 400 Bad Request\r\nX-Filler: ".to_vec();
        head.extend(std::iter::repeat_n(b'a', MAX_HEAD_SIZE));
        let mut reader = BufReader::new(head.as_slice());
        assert_eq!(
            read_response(&mut reader).await,
            Err(RelayError::Handshake("HTTP head too large".into()))
        );
    }

    #[tokio::test]
    async fn test_eof_before_head() {
        let mut reader = BufReader::new(&b""[..]);
        assert_eq!(read_request(&mut reader).await, Err(RelayError::Closed));
    }

    #[tokio::test]
    async fn test_malformed_header() {
        let mut reader = BufReader::new(&b"GET / HTTP/1.1\r\nnocolon\r\n\r\n"[..]);
        assert!(matches!(
            read_request(&mut reader).await,
            Err(RelayError::Handshake(_))
        ));
    }
}
