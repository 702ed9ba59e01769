//! HTTP/1.x wire framing for the facade's own sockets
//!
//! The facade owns both sides of the wire: it parses the client's proxy
//! request itself and serializes upstream requests itself, because the
//! processing model (one socket one request, raw CONNECT handling,
//! replayable bodies, commit-once responses) needs direct control over
//! framing. Head parsing is line-based with CRLF terminators and hard
//! limits on line length and header count.

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PorticoError, Result};

pub const CRLF: &str = "\r\n";

/// A single head line may not exceed this many bytes.
const MAX_LINE_LENGTH: usize = 16 * 1024;
const MAX_HEADER_COUNT: usize = 128;

/// Token the facade adds to Via headers it rewrites.
pub const VIA_TOKEN: &str = "portico";

/// Parsed head of an inbound proxy request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Parsed head of an upstream response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        transfer_encoding_is_chunked(&self.headers)
    }

    /// Whether the sender intends to reuse the connection afterwards.
    pub fn keep_alive(&self) -> bool {
        let connection = self
            .headers
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        match self.version {
            Version::HTTP_10 => connection.eq_ignore_ascii_case("keep-alive"),
            _ => !connection.eq_ignore_ascii_case("close"),
        }
    }
}

pub fn transfer_encoding_is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(http::header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
}

pub fn content_length_of(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Read one CRLF-terminated line, without the terminator.
pub async fn read_line<R>(reader: &mut R) -> std::io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(128);
    let n = reader
        .take(MAX_LINE_LENGTH as u64 + 2)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before a full line",
        ));
    }
    if !buf.ends_with(b"\n") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "line too long or truncated",
        ));
    }
    buf.pop();
    if buf.ends_with(b"\r") {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Parse the head of an inbound request: request line plus headers, up to
/// the blank separator line.
pub async fn read_request_head<R>(reader: &mut R) -> Result<RequestHead>
where
    R: AsyncBufRead + Unpin,
{
    let request_line = read_line(reader)
        .await
        .map_err(|e| PorticoError::InvalidRequest(format!("bad request line: {}", e)))?;

    let mut parts = request_line.split_whitespace();
    let method: Method = parts
        .next()
        .unwrap_or_default()
        .parse()
        .map_err(|_| PorticoError::InvalidRequest("bad method".to_string()))?;
    let uri = parts
        .next()
        .ok_or_else(|| PorticoError::InvalidRequest("missing request URI".to_string()))?
        .to_string();
    let version = parse_version(parts.next().unwrap_or("HTTP/1.1"))?;
    if parts.next().is_some() {
        return Err(PorticoError::InvalidRequest(
            "malformed request line".to_string(),
        ));
    }

    let headers = read_headers(reader).await?;
    Ok(RequestHead {
        method,
        uri,
        version,
        headers,
    })
}

/// Parse the head of an upstream response.
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let status_line = read_line(reader)
        .await
        .map_err(|e| PorticoError::Http(format!("bad status line: {}", e)))?;

    let mut parts = status_line.splitn(3, ' ');
    let version = parse_version(parts.next().unwrap_or_default())?;
    let status: StatusCode = parts
        .next()
        .unwrap_or_default()
        .parse()
        .map_err(|_| PorticoError::Http(format!("bad status line: {}", status_line)))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let headers = read_headers(reader).await?;
    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
    })
}

async fn read_headers<R>(reader: &mut R) -> Result<HeaderMap>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HeaderMap::new();
    loop {
        let line = read_line(reader)
            .await
            .map_err(|e| PorticoError::InvalidRequest(format!("bad header line: {}", e)))?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADER_COUNT {
            return Err(PorticoError::InvalidRequest("too many headers".to_string()));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| PorticoError::InvalidRequest(format!("bad header: {}", line)))?;
        let name: HeaderName = name
            .trim()
            .parse()
            .map_err(|_| PorticoError::InvalidRequest(format!("bad header name: {}", name)))?;
        let value: HeaderValue = value
            .trim()
            .parse()
            .map_err(|_| PorticoError::InvalidRequest(format!("bad header value: {}", line)))?;
        headers.append(name, value);
    }
}

pub fn parse_version(token: &str) -> Result<Version> {
    match token {
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/1.0" => Ok(Version::HTTP_10),
        other => Err(PorticoError::InvalidRequest(format!(
            "unsupported HTTP version: {}",
            other
        ))),
    }
}

pub fn version_token(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// Write one line followed by CRLF.
pub async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(CRLF.as_bytes()).await
}

/// Write an empty CRLF line (the head/body separator).
pub async fn write_blank_line<W>(writer: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(CRLF.as_bytes()).await
}

pub async fn write_header<W>(writer: &mut W, name: &str, value: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_line(writer, &format!("{}: {}", name, value)).await
}

/// Serialize a request head: request line, headers, blank line.
pub async fn write_request_head<W>(
    writer: &mut W,
    method: &Method,
    uri: &str,
    version: Version,
    headers: &HeaderMap,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_line(
        writer,
        &format!("{} {} {}", method, uri, version_token(version)),
    )
    .await?;
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        write_header(writer, name.as_str(), &value).await?;
    }
    write_blank_line(writer).await
}

/// Remove the `chunked` token from a Transfer-Encoding value; None when
/// nothing remains.
pub fn strip_chunked(value: &str) -> Option<String> {
    let rest: Vec<&str> = value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty() && !token.eq_ignore_ascii_case("chunked"))
        .collect();
    if rest.is_empty() {
        None
    } else {
        Some(rest.join(","))
    }
}

/// Build the Via value this hop reports, keeping any prior value.
pub fn via_value(version: Version, existing: Option<&str>) -> String {
    let protocol = match version {
        Version::HTTP_10 => "1.0",
        _ => "1.1",
    };
    match existing {
        Some(prior) if !prior.is_empty() => format!("{} {}, {}", protocol, VIA_TOKEN, prior),
        _ => format!("{} {}", protocol, VIA_TOKEN),
    }
}

/// Request headers that never travel to the upstream: hop-by-hop headers
/// and the proxy-auth pair this facade consumes itself.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "upgrade"
    )
}

/// Read the size line of one chunk. Returns None at the final 0-size chunk
/// (after consuming the trailer section).
pub async fn read_chunk_size<R>(reader: &mut R) -> std::io::Result<Option<usize>>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    let size_token = line.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size_token, 16).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad chunk size: {}", line),
        )
    })?;
    if size == 0 {
        // Trailer section runs until a blank line.
        loop {
            if read_line(reader).await?.is_empty() {
                break;
            }
        }
        return Ok(None);
    }
    Ok(Some(size))
}

/// Consume the CRLF that terminates a chunk's data.
pub async fn read_chunk_terminator<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    if !line.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "missing chunk terminator",
        ));
    }
    Ok(())
}

/// Write one chunk frame.
pub async fn write_chunk<W>(writer: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("{:x}{}", data.len(), CRLF).as_bytes())
        .await?;
    writer.write_all(data).await?;
    writer.write_all(CRLF.as_bytes()).await
}

/// Write the final 0-size chunk.
pub async fn write_last_chunk<W>(writer: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(b"0\r\n\r\n").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_request_head() {
        let raw = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader).await.unwrap();

        assert_eq!(head.method, Method::GET);
        assert_eq!(head.uri, "http://example.com/");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.get("host").unwrap(), "example.com");
        assert_eq!(head.headers.len(), 2);
    }

    #[tokio::test]
    async fn test_read_connect_request_head() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_request_head(&mut reader).await.unwrap();
        assert_eq!(head.method, Method::CONNECT);
        assert_eq!(head.uri, "example.com:443");
    }

    #[tokio::test]
    async fn test_malformed_request_line_is_rejected() {
        let raw = b"NOT A VALID LINE AT ALL\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_request_head(&mut reader).await.is_err());

        let raw = b"GET /\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        // Missing version is tolerated, but a bad one is not.
        assert!(read_request_head(&mut reader).await.is_ok());

        let raw = b"GET / HTTP/3.0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        assert!(read_request_head(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_read_response_head_with_reason() {
        let raw = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"proxy\"\r\nContent-Length: 0\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_response_head(&mut reader).await.unwrap();

        assert_eq!(head.status, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(head.reason, "Proxy Authentication Required");
        assert_eq!(head.content_length(), Some(0));
        assert!(head.keep_alive());
    }

    #[tokio::test]
    async fn test_chunked_detection() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let head = read_response_head(&mut reader).await.unwrap();
        assert!(head.is_chunked());
    }

    #[tokio::test]
    async fn test_chunk_coding_roundtrip() {
        let mut encoded = Vec::new();
        write_chunk(&mut encoded, b"hello ").await.unwrap();
        write_chunk(&mut encoded, b"world").await.unwrap();
        write_last_chunk(&mut encoded).await.unwrap();

        let mut reader = BufReader::new(&encoded[..]);
        let mut decoded = Vec::new();
        loop {
            match read_chunk_size(&mut reader).await.unwrap() {
                Some(size) => {
                    let mut data = vec![0u8; size];
                    tokio::io::AsyncReadExt::read_exact(&mut reader, &mut data)
                        .await
                        .unwrap();
                    decoded.extend_from_slice(&data);
                    read_chunk_terminator(&mut reader).await.unwrap();
                }
                None => break,
            }
        }
        assert_eq!(decoded, b"hello world");
    }

    #[test]
    fn test_strip_chunked() {
        assert_eq!(strip_chunked("chunked"), None);
        assert_eq!(strip_chunked("gzip, chunked"), Some("gzip".to_string()));
        assert_eq!(
            strip_chunked("gzip, chunked, deflate"),
            Some("gzip,deflate".to_string())
        );
    }

    #[test]
    fn test_via_value() {
        assert_eq!(via_value(Version::HTTP_11, None), "1.1 portico");
        assert_eq!(
            via_value(Version::HTTP_11, Some("1.0 upstream")),
            "1.1 portico, 1.0 upstream"
        );
        assert_eq!(via_value(Version::HTTP_10, None), "1.0 portico");
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("proxy-authorization"));
        assert!(!is_hop_by_hop_header("Content-Type"));
    }
}
