//! HTTP/1.1 wire format
//!
//! Heads are parsed with `httparse` and kept as [`RawHeaders`], which
//! preserve the order and spelling the peer sent. Bodies are streamed with
//! [`BodyReader`] according to their [`BodyFraming`].

use crate::error::{new_io_error, Error, Result};
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::{HeaderValue, Method, StatusCode, Version};
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound for a request or response head
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Upper bound for one chunk-size or trailer line
const MAX_LINE_SIZE: usize = 4 * 1024;
const MAX_HEADERS: usize = 128;
/// Largest slice handed out by [`BodyReader::next_chunk`]
const READ_CHUNK: usize = 16 * 1024;

/// Headers that describe one hop and never travel past the proxy
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "proxy-connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// Ordered header list that keeps the original name spelling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawHeaders {
  entries: Vec<(String, HeaderValue)>,
}

impl RawHeaders {
  /// Empty header list
  pub fn new() -> Self {
    Self::default()
  }
  /// Append a header, keeping any existing ones with the same name
  pub fn push(&mut self, name: impl Into<String>, value: HeaderValue) {
    self.entries.push((name.into(), value));
  }
  /// First value for `name`, compared case-insensitively
  pub fn get(&self, name: &str) -> Option<&HeaderValue> {
    self
      .entries
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v)
  }
  /// First value for `name` as text, if it is visible ASCII
  pub fn get_str(&self, name: &str) -> Option<&str> {
    self.get(name).and_then(|v| v.to_str().ok())
  }
  /// All values for `name`, in order
  pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a HeaderValue> + 'a {
    self
      .entries
      .iter()
      .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v)
  }
  /// Whether any header is called `name`
  pub fn contains(&self, name: &str) -> bool {
    self.get(name).is_some()
  }
  /// Remove every header called `name`, returning how many were dropped
  pub fn remove(&mut self, name: &str) -> usize {
    let before = self.entries.len();
    self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    before - self.entries.len()
  }
  /// Replace the first `name` header in place (dropping the rest) or append it
  pub fn set(&mut self, name: &str, value: HeaderValue) {
    match self
      .entries
      .iter()
      .position(|(k, _)| k.eq_ignore_ascii_case(name))
    {
      Some(index) => {
        self.entries[index].1 = value;
        let mut seen = false;
        self.entries.retain(|(k, _)| {
          if !k.eq_ignore_ascii_case(name) {
            return true;
          }
          let keep = !seen;
          seen = true;
          keep
        });
      }
      None => self.push(name, value),
    }
  }
  /// Whether a comma separated header such as `Connection` lists `token`
  pub fn has_token(&self, name: &str, token: &str) -> bool {
    self.get_all(name).any(|v| {
      v.to_str()
        .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
    })
  }
  /// Iterate `(name, value)` pairs in wire order
  pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
    self.entries.iter().map(|(k, v)| (k.as_str(), v))
  }
  /// Number of header lines
  pub fn len(&self) -> usize {
    self.entries.len()
  }
  /// Whether there are no headers
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
  /// Drop hop-by-hop headers, including any named in `Connection`
  pub fn strip_hop_by_hop(&mut self) {
    let named: Vec<String> = self
      .get_all("connection")
      .filter_map(|v| v.to_str().ok())
      .flat_map(|s| s.split(','))
      .map(|t| t.trim().to_ascii_lowercase())
      .filter(|t| !t.is_empty())
      .collect();
    self.entries.retain(|(k, _)| {
      let k = k.to_ascii_lowercase();
      !HOP_BY_HOP.contains(&k.as_str()) && !named.contains(&k)
    });
  }
  fn write_to(&self, out: &mut Vec<u8>) {
    for (k, v) in &self.entries {
      out.extend(k.as_bytes());
      out.extend(COLON_SPACE);
      out.extend(v.as_bytes());
      out.extend(CR_LF);
    }
  }
  fn from_parsed(parsed: &[httparse::Header<'_>]) -> Result<Self> {
    let mut headers = RawHeaders::new();
    for h in parsed {
      let value = HeaderValue::from_bytes(h.value)
        .map_err(|_| Error::invalid_request(format!("invalid value for header {}", h.name)))?;
      headers.push(h.name, value);
    }
    Ok(headers)
  }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
  /// No body
  Empty,
  /// Exactly this many bytes
  Length(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// Body runs until the peer closes (responses only)
  CloseDelimited,
}

fn content_length(headers: &RawHeaders) -> Result<Option<u64>> {
  let mut length = None;
  for v in headers.get_all("content-length") {
    let parsed = v
      .to_str()
      .ok()
      .and_then(|s| s.trim().parse::<u64>().ok())
      .ok_or_else(|| Error::invalid_request("invalid Content-Length"))?;
    if length.is_some_and(|l| l != parsed) {
      return Err(Error::invalid_request("conflicting Content-Length headers"));
    }
    length = Some(parsed);
  }
  Ok(length)
}

fn is_chunked(headers: &RawHeaders) -> bool {
  headers
    .get_all("transfer-encoding")
    .filter_map(|v| v.to_str().ok())
    .flat_map(|s| s.split(','))
    .last()
    .is_some_and(|t| t.trim().eq_ignore_ascii_case("chunked"))
}

fn parse_version(minor: Option<u8>) -> Version {
  match minor {
    Some(0) => Version::HTTP_10,
    _ => Version::HTTP_11,
  }
}

fn version_str(version: Version) -> &'static str {
  if version == Version::HTTP_10 {
    "HTTP/1.0"
  } else {
    "HTTP/1.1"
  }
}

fn wants_keep_alive(version: Version, headers: &RawHeaders) -> bool {
  if headers.has_token("connection", "close") {
    return false;
  }
  version == Version::HTTP_11
    || headers.has_token("connection", "keep-alive")
    || headers.has_token("proxy-connection", "keep-alive")
}

/// Request line plus headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
  /// Request method
  pub method: Method,
  /// Request target exactly as sent: origin-form, absolute-form or authority-form
  pub target: String,
  /// HTTP/1.0 or HTTP/1.1
  pub version: Version,
  /// Headers in wire order
  pub headers: RawHeaders,
}

impl RequestHead {
  /// Parse a complete head. Returns `None` if `buf` does not yet hold one.
  pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let len = match req.parse(buf) {
      Ok(httparse::Status::Complete(len)) => len,
      Ok(httparse::Status::Partial) => return Ok(None),
      Err(e) => return Err(Error::invalid_request(format!("malformed request head: {}", e))),
    };
    let method = Method::from_bytes(req.method.unwrap_or_default().as_bytes())
      .map_err(|_| Error::invalid_request("invalid method"))?;
    Ok(Some((
      Self {
        method,
        target: req.path.unwrap_or_default().to_string(),
        version: parse_version(req.version),
        headers: RawHeaders::from_parsed(req.headers)?,
      },
      len,
    )))
  }
  /// Value of the `Host` header
  pub fn host(&self) -> Option<&str> {
    self.headers.get_str("host")
  }
  /// Whether the client asked for a tunnel
  pub fn is_connect(&self) -> bool {
    self.method == Method::CONNECT
  }
  /// Whether the client connection may carry another request after this one.
  ///
  /// A request framed by both `Transfer-Encoding` and `Content-Length` is
  /// served, then the connection is closed.
  pub fn keep_alive(&self) -> bool {
    let ambiguous =
      self.headers.contains("transfer-encoding") && self.headers.contains("content-length");
    !ambiguous && wants_keep_alive(self.version, &self.headers)
  }
  /// Whether the client waits for `100 Continue` before sending the body
  pub fn expects_continue(&self) -> bool {
    self
      .headers
      .get_str("expect")
      .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
  }
  /// Body delimitation for this request
  pub fn body_framing(&self) -> Result<BodyFraming> {
    if is_chunked(&self.headers) {
      return Ok(BodyFraming::Chunked);
    }
    if self.headers.contains("transfer-encoding") {
      return Err(Error::invalid_request("request transfer coding must end in chunked"));
    }
    Ok(match content_length(&self.headers)? {
      Some(0) | None => BodyFraming::Empty,
      Some(n) => BodyFraming::Length(n),
    })
  }
  /// Serialize to wire bytes
  pub fn encode(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend(self.method.as_str().as_bytes());
    out.extend(SPACE);
    out.extend(self.target.as_bytes());
    out.extend(SPACE);
    out.extend(version_str(self.version).as_bytes());
    out.extend(CR_LF);
    self.headers.write_to(&mut out);
    out.extend(CR_LF);
    out
  }
}

/// Status line plus headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
  /// HTTP/1.0 or HTTP/1.1
  pub version: Version,
  /// Status code
  pub status: StatusCode,
  /// Reason phrase as sent by the origin, if any
  pub reason: Option<String>,
  /// Headers in wire order
  pub headers: RawHeaders,
}

impl ResponseHead {
  /// Fresh HTTP/1.1 head with no headers
  pub fn new(status: StatusCode) -> Self {
    Self {
      version: Version::HTTP_11,
      status,
      reason: None,
      headers: RawHeaders::new(),
    }
  }
  /// Parse a complete head. Returns `None` if `buf` does not yet hold one.
  pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let len = match resp.parse(buf) {
      Ok(httparse::Status::Complete(len)) => len,
      Ok(httparse::Status::Partial) => return Ok(None),
      Err(e) => {
        return Err(new_io_error(
          ErrorKind::InvalidData,
          &format!("malformed response head: {}", e),
        ))
      }
    };
    let status = StatusCode::from_u16(resp.code.unwrap_or_default())
      .map_err(|_| new_io_error(ErrorKind::InvalidData, "invalid status code"))?;
    Ok(Some((
      Self {
        version: parse_version(resp.version),
        status,
        reason: resp.reason.filter(|r| !r.is_empty()).map(str::to_string),
        headers: RawHeaders::from_parsed(resp.headers)?,
      },
      len,
    )))
  }
  /// Whether the origin keeps the connection open after this response
  pub fn keep_alive(&self) -> bool {
    wants_keep_alive(self.version, &self.headers)
  }
  /// Body delimitation for this response to a `method` request
  pub fn body_framing(&self, method: &Method) -> Result<BodyFraming> {
    if method == Method::HEAD
      || self.status.is_informational()
      || self.status == StatusCode::NO_CONTENT
      || self.status == StatusCode::NOT_MODIFIED
    {
      return Ok(BodyFraming::Empty);
    }
    if is_chunked(&self.headers) {
      return Ok(BodyFraming::Chunked);
    }
    Ok(match content_length(&self.headers)? {
      Some(0) => BodyFraming::Empty,
      Some(n) => BodyFraming::Length(n),
      None => BodyFraming::CloseDelimited,
    })
  }
  /// Serialize to wire bytes
  pub fn encode(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend(version_str(self.version).as_bytes());
    out.extend(SPACE);
    out.extend(self.status.as_str().as_bytes());
    out.extend(SPACE);
    let reason = self
      .reason
      .as_deref()
      .or_else(|| self.status.canonical_reason())
      .unwrap_or("");
    out.extend(reason.as_bytes());
    out.extend(CR_LF);
    self.headers.write_to(&mut out);
    out.extend(CR_LF);
    out
  }
}

/// Read one head (through the blank line) from `reader`.
///
/// Returns `None` on a clean EOF before the first byte. Leading empty lines
/// between pipelined requests are skipped.
pub async fn read_head<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>>
where
  R: AsyncBufRead + Unpin + ?Sized,
{
  let mut head = Vec::new();
  loop {
    let start = head.len();
    let n = (&mut *reader)
      .take((limit - start) as u64 + 1)
      .read_until(b'\n', &mut head)
      .await?;
    if n == 0 {
      if head.is_empty() {
        return Ok(None);
      }
      return Err(new_io_error(
        ErrorKind::UnexpectedEof,
        "connection closed inside a message head",
      ));
    }
    if head.len() > limit {
      return Err(Error::invalid_request("message head too large"));
    }
    let line = &head[start..];
    if line == b"\r\n" || line == b"\n" {
      if start == 0 {
        head.clear();
        continue;
      }
      return Ok(Some(head));
    }
  }
}

async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<()>
where
  R: AsyncBufRead + Unpin + ?Sized,
{
  buf.clear();
  let n = (&mut *reader)
    .take(MAX_LINE_SIZE as u64)
    .read_until(b'\n', buf)
    .await?;
  if n == 0 || buf.last() != Some(&b'\n') {
    return Err(new_io_error(
      ErrorKind::InvalidData,
      "unterminated line in chunked body",
    ));
  }
  Ok(())
}

/// Incremental body reader for one message.
#[derive(Debug)]
pub struct BodyReader {
  framing: BodyFraming,
  /// Bytes left in the current chunk or fixed-length body
  remaining: u64,
  /// Chunked only: a chunk body was fully read and its CRLF is pending
  chunk_open: bool,
  done: bool,
}

impl BodyReader {
  /// Reader for a body framed as `framing`
  pub fn new(framing: BodyFraming) -> Self {
    let remaining = match framing {
      BodyFraming::Length(n) => n,
      _ => 0,
    };
    Self {
      framing,
      remaining,
      chunk_open: false,
      done: framing == BodyFraming::Empty,
    }
  }
  /// Framing this reader follows
  pub fn framing(&self) -> BodyFraming {
    self.framing
  }
  /// Whether the whole body has been consumed
  pub fn is_done(&self) -> bool {
    self.done
  }
  /// Next slice of decoded body bytes, or `None` at the end of the body.
  pub async fn next_chunk<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>>
  where
    R: AsyncBufRead + Unpin + ?Sized,
  {
    if self.done {
      return Ok(None);
    }
    match self.framing {
      BodyFraming::Empty => {
        self.done = true;
        Ok(None)
      }
      BodyFraming::Length(_) => {
        let data = self.read_fixed(reader).await?;
        if self.remaining == 0 {
          self.done = true;
        }
        Ok(Some(data))
      }
      BodyFraming::CloseDelimited => {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
          self.done = true;
          return Ok(None);
        }
        let n = buf.len().min(READ_CHUNK);
        let data = Bytes::copy_from_slice(&buf[..n]);
        reader.consume(n);
        Ok(Some(data))
      }
      BodyFraming::Chunked => self.next_chunked(reader).await,
    }
  }

  async fn read_fixed<R>(&mut self, reader: &mut R) -> Result<Bytes>
  where
    R: AsyncBufRead + Unpin + ?Sized,
  {
    let buf = reader.fill_buf().await?;
    if buf.is_empty() {
      return Err(new_io_error(
        ErrorKind::UnexpectedEof,
        "connection closed inside a message body",
      ));
    }
    let n = buf.len().min(READ_CHUNK).min(self.remaining as usize);
    let data = Bytes::copy_from_slice(&buf[..n]);
    reader.consume(n);
    self.remaining -= n as u64;
    Ok(data)
  }

  async fn next_chunked<R>(&mut self, reader: &mut R) -> Result<Option<Bytes>>
  where
    R: AsyncBufRead + Unpin + ?Sized,
  {
    let mut line = Vec::new();
    if self.remaining == 0 {
      if self.chunk_open {
        read_line(reader, &mut line).await?;
        if line != CR_LF {
          return Err(new_io_error(
            ErrorKind::InvalidData,
            "chunk data not followed by CRLF",
          ));
        }
        self.chunk_open = false;
      }
      read_line(reader, &mut line).await?;
      let size = std::str::from_utf8(&line)
        .ok()
        .and_then(|s| s.trim().split(';').next())
        .and_then(|s| u64::from_str_radix(s.trim(), 16).ok())
        .ok_or_else(|| new_io_error(ErrorKind::InvalidData, "invalid chunk size"))?;
      if size == 0 {
        // trailers are read and dropped
        let mut trailers = 0;
        loop {
          read_line(reader, &mut line).await?;
          if line == b"\r\n" || line == b"\n" {
            break;
          }
          trailers += line.len();
          if trailers > MAX_HEAD_SIZE {
            return Err(new_io_error(ErrorKind::InvalidData, "chunked trailers too large"));
          }
        }
        self.done = true;
        return Ok(None);
      }
      self.remaining = size;
    }
    let data = self.read_fixed(reader).await?;
    if self.remaining == 0 {
      self.chunk_open = true;
    }
    Ok(Some(data))
  }
}

/// Frame `data` as one chunk of a chunked body.
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(data.len() + 12);
  out.extend(format!("{:x}", data.len()).as_bytes());
  out.extend(CR_LF);
  out.extend(data);
  out.extend(CR_LF);
  out
}

/// Terminator of a chunked body
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Largest body, encoded or decoded, buffered for content decoding
pub const MAX_DECODED_BODY: usize = 16 * 1024 * 1024;

/// Decode a `Content-Encoding` the proxy understands. Returns `None` for
/// encodings it leaves alone and for bodies that inflate past `limit` bytes.
#[cfg(feature = "gzip")]
pub fn decode_body(encoding: &str, body: &[u8], limit: usize) -> Result<Option<Vec<u8>>> {
  use flate2::read::{DeflateDecoder, MultiGzDecoder};
  use std::io::Read;
  let mut out = Vec::new();
  let cap = limit as u64 + 1;
  match encoding.trim().to_ascii_lowercase().as_str() {
    "gzip" | "x-gzip" => {
      MultiGzDecoder::new(body).take(cap).read_to_end(&mut out)?;
    }
    "deflate" => {
      DeflateDecoder::new(body).take(cap).read_to_end(&mut out)?;
    }
    _ => return Ok(None),
  }
  if out.len() > limit {
    return Ok(None);
  }
  Ok(Some(out))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[test]
  fn test_parse_request_head() {
    let raw = b"GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\nX-Case: One\r\nx-case: two\r\n\r\nrest";
    let (head, len) = RequestHead::parse(raw).unwrap().unwrap();
    assert_eq!(len, raw.len() - 4);
    assert_eq!(head.method, Method::GET);
    assert_eq!(head.target, "/a?b=1");
    assert_eq!(head.host(), Some("example.com"));
    let names: Vec<_> = head.headers.iter().map(|(k, _)| k).collect();
    assert_eq!(names, vec!["Host", "X-Case", "x-case"]);
    assert!(head.keep_alive());
    assert_eq!(head.body_framing().unwrap(), BodyFraming::Empty);
    assert_eq!(&head.encode()[..], &raw[..len]);
  }

  #[test]
  fn test_partial_head() {
    assert!(RequestHead::parse(b"GET / HTTP/1.1\r\nHost: a")
      .unwrap()
      .is_none());
    assert!(ResponseHead::parse(b"HTTP/1.1 200 OK\r\n").unwrap().is_none());
  }

  #[test]
  fn test_response_framing() {
    let (head, _) = ResponseHead::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n")
      .unwrap()
      .unwrap();
    assert_eq!(
      head.body_framing(&Method::GET).unwrap(),
      BodyFraming::Length(5)
    );
    assert_eq!(
      head.body_framing(&Method::HEAD).unwrap(),
      BodyFraming::Empty
    );
    let (head, _) = ResponseHead::parse(b"HTTP/1.0 200 OK\r\n\r\n")
      .unwrap()
      .unwrap();
    assert_eq!(
      head.body_framing(&Method::GET).unwrap(),
      BodyFraming::CloseDelimited
    );
    assert!(!head.keep_alive());
    let (head, _) =
      ResponseHead::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n")
        .unwrap()
        .unwrap();
    assert!(head.body_framing(&Method::GET).is_err());
  }

  #[test]
  fn test_strip_hop_by_hop() {
    let mut headers = RawHeaders::new();
    headers.push("Connection", HeaderValue::from_static("keep-alive, X-Secret"));
    headers.push("X-Secret", HeaderValue::from_static("1"));
    headers.push("Proxy-Authorization", HeaderValue::from_static("Basic x"));
    headers.push("Accept", HeaderValue::from_static("*/*"));
    headers.strip_hop_by_hop();
    let names: Vec<_> = headers.iter().map(|(k, _)| k).collect();
    assert_eq!(names, vec!["Accept"]);
  }

  #[test]
  fn test_set_replaces_in_place() {
    let mut headers = RawHeaders::new();
    headers.push("A", HeaderValue::from_static("1"));
    headers.push("content-length", HeaderValue::from_static("3"));
    headers.push("B", HeaderValue::from_static("2"));
    headers.push("Content-Length", HeaderValue::from_static("4"));
    headers.set("Content-Length", HeaderValue::from_static("9"));
    let pairs: Vec<_> = headers
      .iter()
      .map(|(k, v)| format!("{}={}", k, v.to_str().unwrap()))
      .collect();
    assert_eq!(pairs, vec!["A=1", "content-length=9", "B=2"]);
  }

  #[tokio::test]
  async fn test_read_head_and_chunked_body() {
    let raw: &[u8] = b"\r\nPOST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: t\r\n\r\nNEXT";
    let mut reader = BufReader::new(raw);
    let head = read_head(&mut reader, MAX_HEAD_SIZE).await.unwrap().unwrap();
    let (head, _) = RequestHead::parse(&head).unwrap().unwrap();
    assert_eq!(head.body_framing().unwrap(), BodyFraming::Chunked);

    let mut body = BodyReader::new(BodyFraming::Chunked);
    let mut out = Vec::new();
    while let Some(chunk) = body.next_chunk(&mut reader).await.unwrap() {
      out.extend_from_slice(&chunk);
    }
    assert_eq!(out, b"hello world");
    assert!(body.is_done());

    let mut rest = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut rest)
      .await
      .unwrap();
    assert_eq!(rest, b"NEXT");
  }

  #[tokio::test]
  async fn test_read_head_limits() {
    let mut big = b"GET / HTTP/1.1\r\nX: ".to_vec();
    big.extend(vec![b'a'; 200]);
    big.extend(b"\r\n\r\n");
    let mut reader = BufReader::new(&big[..]);
    assert!(read_head(&mut reader, 64).await.is_err());

    let mut reader = BufReader::new(&b""[..]);
    assert!(read_head(&mut reader, 64).await.unwrap().is_none());

    let mut reader = BufReader::new(&b"GET / HTTP/1.1\r\n"[..]);
    assert!(read_head(&mut reader, 64).await.is_err());
  }

  #[tokio::test]
  async fn test_length_body_eof() {
    let mut reader = BufReader::new(&b"abc"[..]);
    let mut body = BodyReader::new(BodyFraming::Length(5));
    assert_eq!(
      body.next_chunk(&mut reader).await.unwrap().unwrap(),
      Bytes::from_static(b"abc")
    );
    assert!(body.next_chunk(&mut reader).await.is_err());
  }

  #[tokio::test]
  async fn test_chunk_data_must_end_in_crlf() {
    let mut reader = BufReader::new(&b"3\r\nabcXY\r\n0\r\n\r\n"[..]);
    let mut body = BodyReader::new(BodyFraming::Chunked);
    assert_eq!(
      body.next_chunk(&mut reader).await.unwrap().unwrap(),
      Bytes::from_static(b"abc")
    );
    assert!(body.next_chunk(&mut reader).await.is_err());
    assert!(!body.is_done());
  }

  #[tokio::test]
  async fn test_trailers_are_capped() {
    let mut raw = b"0\r\n".to_vec();
    let line = format!("X-Pad: {}\r\n", "a".repeat(1000));
    while raw.len() <= MAX_HEAD_SIZE + line.len() {
      raw.extend(line.as_bytes());
    }
    raw.extend(b"\r\n");
    let mut reader = BufReader::new(&raw[..]);
    let mut body = BodyReader::new(BodyFraming::Chunked);
    assert!(body.next_chunk(&mut reader).await.is_err());
  }

  #[cfg(feature = "gzip")]
  #[test]
  fn test_decode_body_limit() {
    use flate2::write::GzEncoder;
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::best());
    encoder.write_all(&vec![b'z'; 4096]).unwrap();
    let gz = encoder.finish().unwrap();
    assert_eq!(decode_body("gzip", &gz, 4096).unwrap().unwrap().len(), 4096);
    assert!(decode_body("gzip", &gz, 4095).unwrap().is_none());
    assert!(decode_body("br", &gz, 4096).unwrap().is_none());
  }

  #[test]
  fn test_encode_chunk() {
    assert_eq!(encode_chunk(b"0123456789abcdef!"), b"11\r\n0123456789abcdef!\r\n");
  }
}
