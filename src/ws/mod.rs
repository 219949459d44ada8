//! WebSocket frame parser (§4.5, RFC 6455). Handles both directions
//! (client→server masked, server→client unmasked), fragmentation reassembly
//! for data frames, and the opening handshake's `Sec-WebSocket-Accept`
//! computation.

use base64::Engine;
use bytes::{Buf, BytesMut};
use sha1::{Digest, Sha1};

use crate::flow::Headers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
	Continuation,
	Text,
	Binary,
	Close,
	Ping,
	Pong,
}

impl Opcode {
	fn from_u8(b: u8) -> Option<Opcode> {
		match b {
			0x0 => Some(Opcode::Continuation),
			0x1 => Some(Opcode::Text),
			0x2 => Some(Opcode::Binary),
			0x8 => Some(Opcode::Close),
			0x9 => Some(Opcode::Ping),
			0xa => Some(Opcode::Pong),
			_ => None,
		}
	}

	fn is_control(self) -> bool {
		matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
	}
}

#[derive(Debug, Clone)]
pub struct Frame {
	pub fin: bool,
	pub opcode: Opcode,
	pub masked: bool,
	pub payload: Vec<u8>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WsError {
	#[error("reserved opcode {0:#x}")]
	ReservedOpcode(u8),
	#[error("control frame must not be fragmented")]
	FragmentedControlFrame,
	#[error("continuation frame received with no fragment in progress")]
	UnexpectedContinuation,
	#[error("data frame received mid-fragmentation without a continuation opcode")]
	InterruptedFragmentation,
}

/// A decoded close frame payload (§4.5): 2-byte big-endian status code plus
/// a best-effort UTF-8 reason string.
pub struct CloseInfo {
	pub code: Option<u16>,
	pub reason: Option<String>,
}

pub fn parse_close_payload(payload: &[u8]) -> CloseInfo {
	if payload.len() < 2 {
		return CloseInfo { code: None, reason: None };
	}
	let code = u16::from_be_bytes([payload[0], payload[1]]);
	let reason = std::str::from_utf8(&payload[2..]).ok().map(str::to_owned);
	CloseInfo { code: Some(code), reason }
}

/// Incremental frame parser plus fragmentation reassembly. One instance
/// handles a single direction of a single connection.
pub struct WsParser {
	buf: BytesMut,
	reassembly: Option<(Opcode, Vec<u8>)>,
}

impl WsParser {
	pub fn new() -> Self {
		WsParser { buf: BytesMut::new(), reassembly: None }
	}

	pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, WsError> {
		self.buf.extend_from_slice(chunk);
		let mut out = Vec::new();
		loop {
			match self.try_parse_one()? {
				Some(raw) => {
					if let Some(assembled) = self.reassemble(raw)? {
						out.push(assembled);
					}
				},
				None => break,
			}
		}
		Ok(out)
	}

	/// Parses exactly one wire frame (without fragmentation logic), or
	/// returns `None` if more bytes are needed.
	fn try_parse_one(&mut self) -> Result<Option<RawFrame>, WsError> {
		if self.buf.len() < 2 {
			return Ok(None);
		}
		let b0 = self.buf[0];
		let b1 = self.buf[1];
		let fin = b0 & 0x80 != 0;
		let opcode_bits = b0 & 0x0f;
		let Some(opcode) = Opcode::from_u8(opcode_bits) else {
			return Err(WsError::ReservedOpcode(opcode_bits));
		};
		let masked = b1 & 0x80 != 0;
		let len7 = b1 & 0x7f;

		let mut offset = 2usize;
		let payload_len: u64 = match len7 {
			126 => {
				if self.buf.len() < offset + 2 {
					return Ok(None);
				}
				let len = u16::from_be_bytes([self.buf[offset], self.buf[offset + 1]]) as u64;
				offset += 2;
				len
			},
			127 => {
				if self.buf.len() < offset + 8 {
					return Ok(None);
				}
				let mut arr = [0u8; 8];
				arr.copy_from_slice(&self.buf[offset..offset + 8]);
				offset += 8;
				u64::from_be_bytes(arr)
			},
			n => n as u64,
		};

		let mask_key = if masked {
			if self.buf.len() < offset + 4 {
				return Ok(None);
			}
			let mut key = [0u8; 4];
			key.copy_from_slice(&self.buf[offset..offset + 4]);
			offset += 4;
			Some(key)
		} else {
			None
		};

		let total = offset + payload_len as usize;
		if self.buf.len() < total {
			return Ok(None);
		}

		if opcode.is_control() && (!fin || payload_len > 125) {
			return Err(WsError::FragmentedControlFrame);
		}

		self.buf.advance(offset);
		let mut payload = self.buf.split_to(payload_len as usize).to_vec();
		if let Some(key) = mask_key {
			for (i, b) in payload.iter_mut().enumerate() {
				*b ^= key[i % 4];
			}
		}

		Ok(Some(RawFrame { fin, opcode, masked, payload }))
	}

	fn reassemble(&mut self, raw: RawFrame) -> Result<Option<Frame>, WsError> {
		if raw.opcode.is_control() {
			return Ok(Some(Frame { fin: raw.fin, opcode: raw.opcode, masked: raw.masked, payload: raw.payload }));
		}
		match raw.opcode {
			Opcode::Continuation => {
				let Some((started_opcode, mut buf)) = self.reassembly.take() else {
					return Err(WsError::UnexpectedContinuation);
				};
				buf.extend_from_slice(&raw.payload);
				if raw.fin {
					Ok(Some(Frame { fin: true, opcode: started_opcode, masked: raw.masked, payload: buf }))
				} else {
					self.reassembly = Some((started_opcode, buf));
					Ok(None)
				}
			},
			Opcode::Text | Opcode::Binary => {
				if self.reassembly.is_some() {
					return Err(WsError::InterruptedFragmentation);
				}
				if raw.fin {
					Ok(Some(Frame { fin: true, opcode: raw.opcode, masked: raw.masked, payload: raw.payload }))
				} else {
					self.reassembly = Some((raw.opcode, raw.payload));
					Ok(None)
				}
			},
			Opcode::Close | Opcode::Ping | Opcode::Pong => unreachable!("handled above"),
		}
	}
}

impl Default for WsParser {
	fn default() -> Self {
		Self::new()
	}
}

struct RawFrame {
	fin: bool,
	opcode: Opcode,
	masked: bool,
	payload: Vec<u8>,
}

const HANDSHAKE_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// True if the request headers carry a WebSocket upgrade (§4.5): `Upgrade:
/// websocket` and `Connection` containing `upgrade`, case-insensitively.
pub fn is_upgrade_request(headers: &Headers) -> bool {
	let upgrade = headers.get("upgrade").map(|v| v.eq_ignore_ascii_case("websocket")).unwrap_or(false);
	let connection = headers
		.get("connection")
		.map(|v| v.to_ascii_lowercase().split(',').any(|p| p.trim() == "upgrade"))
		.unwrap_or(false);
	upgrade && connection
}

/// Computes `Sec-WebSocket-Accept` from the client's `Sec-WebSocket-Key`.
pub fn compute_accept(client_key: &str) -> String {
	let mut hasher = Sha1::new();
	hasher.update(client_key.as_bytes());
	hasher.update(HANDSHAKE_GUID.as_bytes());
	let digest = hasher.finalize();
	base64::engine::general_purpose::STANDARD.encode(digest)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn mask(payload: &[u8], key: [u8; 4]) -> Vec<u8> {
		payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]).collect()
	}

	fn frame_bytes(fin: bool, opcode: u8, masked: bool, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
		let mut out = vec![(if fin { 0x80 } else { 0 }) | opcode];
		let mask_bit = if masked { 0x80 } else { 0 };
		assert!(payload.len() < 126);
		out.push(mask_bit | payload.len() as u8);
		if masked {
			out.extend_from_slice(&key);
			out.extend_from_slice(&mask(payload, key));
		} else {
			out.extend_from_slice(payload);
		}
		out
	}

	#[test]
	fn unmasked_text_frame_round_trips() {
		let mut p = WsParser::new();
		let bytes = frame_bytes(true, 0x1, false, b"hello", [0; 4]);
		let frames = p.feed(&bytes).unwrap();
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].opcode, Opcode::Text);
		assert_eq!(frames[0].payload, b"hello");
	}

	#[test]
	fn masked_client_frame_is_unmasked() {
		let mut p = WsParser::new();
		let key = [0x11, 0x22, 0x33, 0x44];
		let bytes = frame_bytes(true, 0x2, true, b"binary!!", key);
		let frames = p.feed(&bytes).unwrap();
		assert_eq!(frames[0].payload, b"binary!!");
		assert!(frames[0].masked);
	}

	#[test]
	fn fragmented_text_is_reassembled_and_control_frames_interleave() {
		let mut p = WsParser::new();
		let mut input = Vec::new();
		input.extend(frame_bytes(false, 0x1, false, b"Hel", [0; 4])); // first fragment, FIN=0
		input.extend(frame_bytes(true, 0x9, false, b"ping-data", [0; 4])); // interleaved Ping
		input.extend(frame_bytes(true, 0x0, false, b"lo", [0; 4])); // final continuation

		let frames = p.feed(&input).unwrap();
		assert_eq!(frames.len(), 2);
		assert_eq!(frames[0].opcode, Opcode::Ping);
		assert_eq!(frames[1].opcode, Opcode::Text);
		assert_eq!(frames[1].payload, b"Hello");
	}

	#[test]
	fn fragmented_control_frame_is_rejected() {
		let mut p = WsParser::new();
		let bytes = frame_bytes(false, 0x8, false, b"x", [0; 4]);
		assert_eq!(p.feed(&bytes), Err(WsError::FragmentedControlFrame));
	}

	#[test]
	fn close_payload_extracts_code_and_reason() {
		let mut payload = 1000u16.to_be_bytes().to_vec();
		payload.extend_from_slice(b"bye");
		let info = parse_close_payload(&payload);
		assert_eq!(info.code, Some(1000));
		assert_eq!(info.reason.as_deref(), Some("bye"));
	}

	#[test]
	fn handshake_accept_matches_rfc_example() {
		// RFC 6455 §1.3 worked example.
		assert_eq!(compute_accept("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
	}

	#[test]
	fn recognizes_upgrade_request_case_insensitively() {
		let mut h = Headers::new();
		h.push("Upgrade", "WebSocket");
		h.push("Connection", "Keep-Alive, Upgrade");
		assert!(is_upgrade_request(&h));
	}

	#[test]
	fn masked_hello_frame_decodes_to_text_hello() {
		let bytes = [0x81u8, 0x85, 0x37, 0xFA, 0x21, 0x3D, 0x7F, 0x9F, 0x4D, 0x51, 0x58];
		let mut p = WsParser::new();
		let frames = p.feed(&bytes).unwrap();
		assert_eq!(frames.len(), 1);
		assert!(frames[0].fin);
		assert_eq!(frames[0].opcode, Opcode::Text);
		assert_eq!(frames[0].payload, b"hello");
	}
}
