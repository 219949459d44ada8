//! Incremental HTTP/1 parser (§4.3). A single instance parses either
//! requests or responses, fed one chunk at a time via `feed`. Works over
//! `bytes::Bytes`/`BytesMut` exclusively — the source this spec was
//! distilled from read bodies through a text reader, which mangles binary
//! payloads; forwarding must be byte-exact, so no `String` touches the
//! body path here.

use std::io::Read;

use bytes::{Buf, Bytes, BytesMut};
use flate2::read::{GzDecoder, ZlibDecoder};

use crate::flow::{Headers, Method};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
	Request,
	Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	ReadingStart,
	ReadingHeaders,
	ReadingBody,
	Complete,
	Error,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
	#[error("malformed start line: {0}")]
	Malformed(String),
}

#[derive(Debug, Clone, Default)]
pub struct StartLine {
	pub method: Option<Method>,
	pub target: Option<String>,
	pub status_code: Option<u16>,
	pub reason: Option<String>,
	pub version: String,
}

#[derive(Debug, Clone)]
pub struct ParsedMessage {
	pub start: StartLine,
	pub headers: Headers,
	pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
	Chunked,
	Length(u64),
	UntilClose,
	None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
	Size,
	Data(u64),
	DataCrlf,
	TrailerLine,
}

/// Finds the end of a CRLF-terminated line. Returns the index of the `\r`
/// (so the line content is `buf[..idx]`), or `None` if more data is needed.
/// A lone `\n` (no preceding `\r`) or a `\r` known not to be followed by
/// `\n` is a hard error per §4.3 "Lone CR or LF is an error".
fn find_line_end(buf: &[u8]) -> Result<Option<usize>, ParseError> {
	let mut i = 0;
	while i < buf.len() {
		match buf[i] {
			b'\n' => {
				if i == 0 || buf[i - 1] != b'\r' {
					return Err(ParseError::Malformed("lone LF in line ending".into()));
				}
				return Ok(Some(i - 1));
			},
			b'\r' => {
				if i + 1 < buf.len() && buf[i + 1] != b'\n' {
					return Err(ParseError::Malformed("lone CR in line ending".into()));
				}
			},
			_ => {},
		}
		i += 1;
	}
	Ok(None)
}

pub struct Http1Parser {
	kind: Kind,
	state: State,
	buf: BytesMut,
	start: StartLine,
	headers: Headers,
	framing: Framing,
	chunk_phase: ChunkPhase,
	body: BytesMut,
}

impl Http1Parser {
	pub fn new(kind: Kind) -> Self {
		Http1Parser {
			kind,
			state: State::ReadingStart,
			buf: BytesMut::new(),
			start: StartLine::default(),
			headers: Headers::new(),
			framing: Framing::None,
			chunk_phase: ChunkPhase::Size,
			body: BytesMut::new(),
		}
	}

	pub fn state(&self) -> State {
		self.state
	}

	/// Restores initial state for reuse on a keep-alive connection.
	pub fn reset(&mut self) {
		let kind = self.kind;
		let leftover = self.buf.split_off(0);
		*self = Http1Parser::new(kind);
		self.buf = leftover;
	}

	pub fn feed(&mut self, chunk: &[u8]) -> Result<(), ParseError> {
		if self.state == State::Error {
			return Ok(());
		}
		self.buf.extend_from_slice(chunk);
		loop {
			match self.state {
				State::ReadingStart => {
					if !self.try_parse_start_line()? {
						break;
					}
				},
				State::ReadingHeaders => {
					if !self.try_parse_headers()? {
						break;
					}
				},
				State::ReadingBody => {
					if !self.try_parse_body()? {
						break;
					}
				},
				State::Complete | State::Error => break,
			}
		}
		Ok(())
	}

	/// Signals upstream/downstream close for the legacy until-close framing
	/// (§4.3 "Otherwise read until the upstream closes").
	pub fn finish(&mut self) {
		if self.state == State::ReadingBody && self.framing == Framing::UntilClose {
			self.state = State::Complete;
		}
	}

	pub fn take_message(&mut self) -> Option<ParsedMessage> {
		if self.state != State::Complete {
			return None;
		}
		Some(ParsedMessage {
			start: std::mem::take(&mut self.start),
			headers: std::mem::take(&mut self.headers),
			body: self.body.split().freeze(),
		})
	}

	fn fail(&mut self, reason: impl Into<String>) -> Result<bool, ParseError> {
		self.state = State::Error;
		Err(ParseError::Malformed(reason.into()))
	}

	fn try_parse_start_line(&mut self) -> Result<bool, ParseError> {
		let Some(cr) = find_line_end(&self.buf)? else {
			return Ok(false);
		};
		let line = self.buf.split_to(cr + 2);
		let line = &line[..cr];
		let text = match std::str::from_utf8(line) {
			Ok(t) => t,
			Err(_) => return self.fail("start line is not valid UTF-8"),
		};
		match self.kind {
			Kind::Request => {
				let mut parts = text.splitn(3, ' ');
				let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
					return self.fail("request line must have 3 fields");
				};
				let Ok(method) = method.parse::<Method>() else {
					return self.fail(format!("unknown method {method}"));
				};
				if !version.starts_with("HTTP/") {
					return self.fail("missing HTTP version");
				}
				self.start = StartLine {
					method: Some(method),
					target: Some(target.to_string()),
					status_code: None,
					reason: None,
					version: version.to_string(),
				};
			},
			Kind::Response => {
				let mut parts = text.splitn(3, ' ');
				let (Some(version), Some(code), reason) = (parts.next(), parts.next(), parts.next()) else {
					return self.fail("status line must have at least 2 fields");
				};
				if !version.starts_with("HTTP/") {
					return self.fail("missing HTTP version");
				}
				let Ok(code) = code.parse::<u16>() else {
					return self.fail(format!("invalid status code {code}"));
				};
				self.start = StartLine {
					method: None,
					target: None,
					status_code: Some(code),
					reason: Some(reason.unwrap_or("").to_string()),
					version: version.to_string(),
				};
			},
		}
		self.state = State::ReadingHeaders;
		Ok(true)
	}

	fn try_parse_headers(&mut self) -> Result<bool, ParseError> {
		let Some(cr) = find_line_end(&self.buf)? else {
			return Ok(false);
		};
		if cr == 0 {
			self.buf.advance(2);
			self.determine_framing();
			self.state = State::ReadingBody;
			return Ok(true);
		}
		let line = self.buf.split_to(cr + 2);
		let line = &line[..cr];
		let text = match std::str::from_utf8(line) {
			Ok(t) => t,
			Err(_) => return self.fail("header line is not valid UTF-8"),
		};
		let Some((name, value)) = text.split_once(':') else {
			return self.fail("header line missing ':'");
		};
		self.headers.push(name.trim(), value.trim());
		Ok(true)
	}

	fn determine_framing(&mut self) {
		let chunked = self
			.headers
			.get("transfer-encoding")
			.map(|v| v.to_ascii_lowercase().contains("chunked"))
			.unwrap_or(false);
		if chunked {
			self.framing = Framing::Chunked;
			self.chunk_phase = ChunkPhase::Size;
			return;
		}
		if let Some(len) = self.headers.get("content-length").and_then(|v| v.trim().parse::<u64>().ok()) {
			self.framing = Framing::Length(len);
			return;
		}
		if self.kind == Kind::Response {
			let code = self.start.status_code.unwrap_or(200);
			if code < 200 || code == 204 || code == 304 {
				self.framing = Framing::None;
				return;
			}
			self.framing = Framing::UntilClose;
			return;
		}
		// Request with no Content-Length: no-body methods short-circuit,
		// everything else falls through to the legacy until-close delimiter.
		if self.start.method.map(|m| m.implies_no_body_without_content_length()).unwrap_or(true) {
			self.framing = Framing::None;
		} else {
			self.framing = Framing::UntilClose;
		}
	}

	fn try_parse_body(&mut self) -> Result<bool, ParseError> {
		match self.framing {
			Framing::None => {
				self.state = State::Complete;
				Ok(true)
			},
			Framing::Length(total) => {
				let want = (total as usize).saturating_sub(self.body.len());
				if want == 0 {
					self.state = State::Complete;
					return Ok(true);
				}
				let take = want.min(self.buf.len());
				if take == 0 {
					return Ok(false);
				}
				let chunk = self.buf.split_to(take);
				self.body.extend_from_slice(&chunk);
				if self.body.len() as u64 >= total {
					self.state = State::Complete;
				}
				Ok(true)
			},
			Framing::UntilClose => {
				if self.buf.is_empty() {
					return Ok(false);
				}
				let chunk = self.buf.split();
				self.body.extend_from_slice(&chunk);
				Ok(true)
			},
			Framing::Chunked => self.try_parse_chunk(),
		}
	}

	fn try_parse_chunk(&mut self) -> Result<bool, ParseError> {
		match self.chunk_phase {
			ChunkPhase::Size => {
				let Some(cr) = find_line_end(&self.buf)? else {
					return Ok(false);
				};
				let line = self.buf.split_to(cr + 2);
				let line = &line[..cr];
				let text = std::str::from_utf8(line).unwrap_or("");
				let size_str = text.split(';').next().unwrap_or("").trim();
				let Ok(size) = u64::from_str_radix(size_str, 16) else {
					return self.fail(format!("invalid chunk size {size_str:?}"));
				};
				if size == 0 {
					self.chunk_phase = ChunkPhase::TrailerLine;
				} else {
					self.chunk_phase = ChunkPhase::Data(size);
				}
				Ok(true)
			},
			ChunkPhase::Data(remaining) => {
				let take = (remaining as usize).min(self.buf.len());
				if take == 0 {
					return Ok(false);
				}
				let chunk = self.buf.split_to(take);
				self.body.extend_from_slice(&chunk);
				let left = remaining - take as u64;
				self.chunk_phase = if left == 0 { ChunkPhase::DataCrlf } else { ChunkPhase::Data(left) };
				Ok(true)
			},
			ChunkPhase::DataCrlf => {
				if self.buf.len() < 2 {
					return Ok(false);
				}
				if &self.buf[..2] != b"\r\n" {
					return self.fail("missing CRLF after chunk data");
				}
				self.buf.advance(2);
				self.chunk_phase = ChunkPhase::Size;
				Ok(true)
			},
			ChunkPhase::TrailerLine => {
				let Some(cr) = find_line_end(&self.buf)? else {
					return Ok(false);
				};
				let had_content = cr != 0;
				let line = self.buf.split_to(cr + 2);
				if had_content {
					let text = std::str::from_utf8(&line[..cr]).unwrap_or("");
					if let Some((name, value)) = text.split_once(':') {
						self.headers.push(name.trim(), value.trim());
					}
				} else {
					self.state = State::Complete;
				}
				Ok(true)
			},
		}
	}
}

/// Serializes an `HttpRequest` to origin-form HTTP/1.1 wire bytes for
/// forwarding to an upstream. Always re-frames with `Content-Length` (never
/// `Transfer-Encoding: chunked`) since the body has already been fully
/// buffered by the time a flow reaches this point; byte-exact per §9's
/// correction, never routed through a text encoder.
pub fn serialize_request(req: &crate::flow::HttpRequest) -> Bytes {
	let target = match &req.query {
		Some(q) if !q.is_empty() => format!("{}?{}", req.path, q),
		_ => req.path.clone(),
	};
	let mut out = BytesMut::new();
	out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method, target).as_bytes());
	let mut headers = req.headers.clone();
	headers.remove("transfer-encoding");
	let body_len = req.body.as_ref().map(|b| b.bytes.len()).unwrap_or(0);
	if req.body.is_some() || headers.get("content-length").is_some() {
		headers.set("Content-Length", body_len.to_string());
	}
	for (name, value) in headers.iter() {
		out.extend_from_slice(name.as_bytes());
		out.extend_from_slice(b": ");
		out.extend_from_slice(value.as_bytes());
		out.extend_from_slice(b"\r\n");
	}
	out.extend_from_slice(b"\r\n");
	if let Some(body) = &req.body {
		out.extend_from_slice(&body.bytes);
	}
	out.freeze()
}

/// Serializes an `HttpResponse` to HTTP/1.1 wire bytes for writing back to
/// the client. Same re-framing rule as `serialize_request`.
pub fn serialize_response(resp: &crate::flow::HttpResponse) -> Bytes {
	let mut out = BytesMut::new();
	out.extend_from_slice(
		format!("HTTP/1.1 {} {}\r\n", resp.status_code, resp.status_message).as_bytes(),
	);
	let mut headers = resp.headers.clone();
	headers.remove("transfer-encoding");
	headers.remove("content-encoding");
	let body_len = resp.body.as_ref().map(|b| b.bytes.len()).unwrap_or(0);
	let framing_forbids_body = resp.status_code < 200 || resp.status_code == 204 || resp.status_code == 304;
	if !framing_forbids_body {
		headers.set("Content-Length", body_len.to_string());
	} else {
		headers.remove("content-length");
	}
	for (name, value) in headers.iter() {
		out.extend_from_slice(name.as_bytes());
		out.extend_from_slice(b": ");
		out.extend_from_slice(value.as_bytes());
		out.extend_from_slice(b"\r\n");
	}
	out.extend_from_slice(b"\r\n");
	if !framing_forbids_body {
		if let Some(body) = &resp.body {
			out.extend_from_slice(&body.bytes);
		}
	}
	out.freeze()
}

/// Decompresses a complete body per §4.3's Content-Encoding rule. `deflate`
/// means zlib-wrapped DEFLATE (RFC 1950), not raw DEFLATE (RFC 1951) —
/// that's what real `Content-Encoding: deflate` responses actually send.
/// `br` is left opaque (decoded form equals raw bytes) since no pack
/// example depends on a Brotli crate.
pub fn decode_content_encoding(encoding: Option<&str>, body: &[u8]) -> std::io::Result<Bytes> {
	match encoding.map(|e| e.to_ascii_lowercase()) {
		Some(enc) if enc == "gzip" => {
			let mut out = Vec::new();
			GzDecoder::new(body).read_to_end(&mut out)?;
			Ok(Bytes::from(out))
		},
		Some(enc) if enc == "deflate" => {
			let mut out = Vec::new();
			ZlibDecoder::new(body).read_to_end(&mut out)?;
			Ok(Bytes::from(out))
		},
		_ => Ok(Bytes::copy_from_slice(body)),
	}
}

/// `tokio_util::codec::Decoder` wrapper so the connection manager can drive
/// the parser with `FramedRead` instead of calling `feed` by hand.
pub struct Http1Codec {
	parser: Http1Parser,
}

impl Http1Codec {
	pub fn new(kind: Kind) -> Self {
		Http1Codec { parser: Http1Parser::new(kind) }
	}
}

impl tokio_util::codec::Decoder for Http1Codec {
	type Item = ParsedMessage;
	type Error = std::io::Error;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		let chunk = src.split();
		self
			.parser
			.feed(&chunk)
			.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
		if let Some(msg) = self.parser.take_message() {
			self.parser.reset();
			return Ok(Some(msg));
		}
		Ok(None)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_simple_get_with_no_body() {
		let mut p = Http1Parser::new(Kind::Request);
		p.feed(b"GET /foo HTTP/1.1\r\nHost: example.test\r\n\r\n").unwrap();
		assert_eq!(p.state(), State::Complete);
		let msg = p.take_message().unwrap();
		assert_eq!(msg.start.method, Some(Method::Get));
		assert_eq!(msg.start.target.as_deref(), Some("/foo"));
		assert_eq!(msg.headers.get("host"), Some("example.test"));
		assert!(msg.body.is_empty());
	}

	#[test]
	fn parses_content_length_body_fed_incrementally() {
		let mut p = Http1Parser::new(Kind::Request);
		p.feed(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\n").unwrap();
		assert_eq!(p.state(), State::ReadingBody);
		p.feed(b"he").unwrap();
		assert_eq!(p.state(), State::ReadingBody);
		p.feed(b"llo").unwrap();
		assert_eq!(p.state(), State::Complete);
		assert_eq!(&p.take_message().unwrap().body[..], b"hello");
	}

	#[test]
	fn parses_chunked_body_with_extension_and_trailer() {
		let mut p = Http1Parser::new(Kind::Request);
		p.feed(b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
		p.feed(b"4;foo=bar\r\nWiki\r\n").unwrap();
		p.feed(b"5\r\npedia\r\n").unwrap();
		p.feed(b"0\r\n\r\n").unwrap();
		assert_eq!(p.state(), State::Complete);
		assert_eq!(&p.take_message().unwrap().body[..], b"Wikipedia");
	}

	#[test]
	fn response_204_has_no_body_regardless_of_headers() {
		let mut p = Http1Parser::new(Kind::Response);
		p.feed(b"HTTP/1.1 204 No Content\r\nContent-Length: 10\r\n\r\n").unwrap();
		assert_eq!(p.state(), State::Complete);
	}

	#[test]
	fn lone_lf_is_malformed() {
		let mut p = Http1Parser::new(Kind::Request);
		let err = p.feed(b"GET / HTTP/1.1\nHost: x\r\n\r\n").unwrap_err();
		assert!(matches!(err, ParseError::Malformed(_)));
		assert_eq!(p.state(), State::Error);
	}

	#[test]
	fn reset_allows_reuse_for_keep_alive() {
		let mut p = Http1Parser::new(Kind::Request);
		p.feed(b"GET / HTTP/1.1\r\n\r\n").unwrap();
		assert_eq!(p.state(), State::Complete);
		p.take_message();
		p.reset();
		assert_eq!(p.state(), State::ReadingStart);
		p.feed(b"GET /two HTTP/1.1\r\n\r\n").unwrap();
		assert_eq!(p.take_message().unwrap().start.target.as_deref(), Some("/two"));
	}

	#[test]
	fn gzip_body_decodes() {
		use flate2::write::GzEncoder;
		use flate2::Compression;
		use std::io::Write;
		let mut enc = GzEncoder::new(Vec::new(), Compression::default());
		enc.write_all(b"hello world").unwrap();
		let compressed = enc.finish().unwrap();
		let decoded = decode_content_encoding(Some("gzip"), &compressed).unwrap();
		assert_eq!(&decoded[..], b"hello world");
	}

	#[test]
	fn deflate_body_is_zlib_wrapped_not_raw() {
		use flate2::write::ZlibEncoder;
		use flate2::Compression;
		use std::io::Write;
		let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
		enc.write_all(b"hello world").unwrap();
		let compressed = enc.finish().unwrap();
		let decoded = decode_content_encoding(Some("deflate"), &compressed).unwrap();
		assert_eq!(&decoded[..], b"hello world");
	}
}
