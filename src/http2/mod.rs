//! HTTP/2 frame-level parser (§4.4). A `Http2Parser` runs once per
//! direction of a connection (client→proxy, proxy→upstream) but both
//! directions share one `HashMap<u32, Stream>` so a complete flow —
//! request headers/body from one direction, response headers/body from
//! the other — can be assembled and handed to C6.

pub mod frame;
pub mod hpack;
pub mod huffman;
pub mod stream;

use std::collections::HashMap;

use bytes::{Buf, BytesMut};

pub use stream::{Stream, StreamState};

use frame::{Frame, FrameType, FLAG_ACK, FLAG_END_HEADERS, FLAG_END_STREAM, FLAG_PADDED, FLAG_PRIORITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	/// Parses bytes sent by the client (to us, acting as the server).
	ClientFacing,
	/// Parses bytes sent by the upstream server (to us, acting as client).
	ServerFacing,
}

#[derive(Debug, Clone)]
pub enum Http2Event {
	SettingsReceived,
	Ping { ack: bool, payload: [u8; 8] },
	Goaway { last_stream_id: u32, error_code: u32 },
	StreamReset { stream_id: u32 },
	StreamComplete { stream_id: u32 },
	WindowUpdateError { stream_id: Option<u32> },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Http2Error {
	#[error("frame error: {0}")]
	Frame(#[from] frame::FrameError),
	#[error("hpack error: {0}")]
	Hpack(#[from] hpack::HpackError),
	#[error("continuation frame received without a pending header block")]
	UnexpectedContinuation,
	#[error("malformed frame payload: {0}")]
	Malformed(String),
}

const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const DEFAULT_INITIAL_WINDOW: i64 = 65_535;
const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

struct PendingHeaders {
	stream_id: u32,
	buf: BytesMut,
	end_stream: bool,
}

pub struct Http2Parser {
	role: Role,
	buf: BytesMut,
	preface_consumed: bool,
	decode_table: hpack::DynamicTable,
	max_frame_size: u32,
	conn_recv_window: i64,
	pending: Option<PendingHeaders>,
}

impl Http2Parser {
	pub fn new(role: Role) -> Self {
		Http2Parser {
			role,
			buf: BytesMut::new(),
			preface_consumed: !matches!(role, Role::ClientFacing),
			decode_table: hpack::DynamicTable::new(4096),
			max_frame_size: DEFAULT_MAX_FRAME_SIZE,
			conn_recv_window: DEFAULT_INITIAL_WINDOW,
			pending: None,
		}
	}

	pub fn feed(&mut self, chunk: &[u8], streams: &mut HashMap<u32, Stream>) -> Result<Vec<Http2Event>, Http2Error> {
		self.buf.extend_from_slice(chunk);
		let mut events = Vec::new();

		if !self.preface_consumed {
			if self.buf.len() < CLIENT_PREFACE.len() {
				return Ok(events);
			}
			if &self.buf[..CLIENT_PREFACE.len()] != CLIENT_PREFACE {
				return Err(Http2Error::Malformed("missing connection preface".into()));
			}
			self.buf.advance(CLIENT_PREFACE.len());
			self.preface_consumed = true;
		}

		while let Some(f) = frame::try_parse(&mut self.buf, self.max_frame_size)? {
			self.handle_frame(f, streams, &mut events)?;
		}
		Ok(events)
	}

	fn stream_mut<'a>(&self, streams: &'a mut HashMap<u32, Stream>, id: u32) -> &'a mut Stream {
		streams.entry(id).or_insert_with(|| Stream::new(id, DEFAULT_INITIAL_WINDOW))
	}

	fn handle_frame(
		&mut self,
		f: Frame,
		streams: &mut HashMap<u32, Stream>,
		events: &mut Vec<Http2Event>,
	) -> Result<(), Http2Error> {
		match f.frame_type {
			FrameType::Settings => {
				if f.has_flag(FLAG_ACK) {
					return Ok(());
				}
				for chunk in f.payload.chunks(6) {
					if chunk.len() < 6 {
						break;
					}
					let id = u16::from_be_bytes([chunk[0], chunk[1]]);
					let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
					match id {
						0x1 => self.decode_table.set_max_size(value),
						0x5 => self.max_frame_size = value,
						_ => {}, // unknown identifiers are ignored per §4.4
					}
				}
				events.push(Http2Event::SettingsReceived);
			},
			FrameType::Ping => {
				let mut payload = [0u8; 8];
				let n = f.payload.len().min(8);
				payload[..n].copy_from_slice(&f.payload[..n]);
				events.push(Http2Event::Ping { ack: f.has_flag(FLAG_ACK), payload });
			},
			FrameType::Goaway => {
				if f.payload.len() < 8 {
					return Err(Http2Error::Malformed("GOAWAY frame too short".into()));
				}
				let last_stream_id =
					u32::from_be_bytes([f.payload[0], f.payload[1], f.payload[2], f.payload[3]]) & 0x7fff_ffff;
				let error_code = u32::from_be_bytes([f.payload[4], f.payload[5], f.payload[6], f.payload[7]]);
				events.push(Http2Event::Goaway { last_stream_id, error_code });
			},
			FrameType::WindowUpdate => {
				if f.payload.len() < 4 {
					return Err(Http2Error::Malformed("WINDOW_UPDATE frame too short".into()));
				}
				let increment =
					(u32::from_be_bytes([f.payload[0], f.payload[1], f.payload[2], f.payload[3]]) & 0x7fff_ffff) as i64;
				if f.stream_id == 0 {
					self.conn_recv_window += increment;
					if self.conn_recv_window > i32::MAX as i64 {
						events.push(Http2Event::WindowUpdateError { stream_id: None });
					}
				} else {
					let s = self.stream_mut(streams, f.stream_id);
					s.recv_window += increment;
					if s.recv_window > i32::MAX as i64 {
						events.push(Http2Event::WindowUpdateError { stream_id: Some(f.stream_id) });
					}
				}
			},
			FrameType::RstStream => {
				if let Some(s) = streams.get_mut(&f.stream_id) {
					s.reset();
				}
				events.push(Http2Event::StreamReset { stream_id: f.stream_id });
			},
			FrameType::Priority | FrameType::PushPromise => {
				// Parsed for framing correctness only; not surfaced as events.
			},
			FrameType::Headers => self.handle_headers(f, streams, events)?,
			FrameType::Continuation => self.handle_continuation(f, streams, events)?,
			FrameType::Data => self.handle_data(f, streams, events)?,
			FrameType::Unknown(_) => {},
		}
		Ok(())
	}

	fn strip_padding<'a>(&self, flags: u8, payload: &'a [u8]) -> Result<&'a [u8], Http2Error> {
		if flags & FLAG_PADDED == 0 {
			return Ok(payload);
		}
		let Some(&pad_len) = payload.first() else {
			return Err(Http2Error::Malformed("PADDED flag set but frame is empty".into()));
		};
		let pad_len = pad_len as usize;
		let body = &payload[1..];
		if body.len() < pad_len {
			return Err(Http2Error::Malformed("pad length exceeds frame payload".into()));
		}
		Ok(&body[..body.len() - pad_len])
	}

	fn handle_headers(
		&mut self,
		f: Frame,
		streams: &mut HashMap<u32, Stream>,
		events: &mut Vec<Http2Event>,
	) -> Result<(), Http2Error> {
		let mut payload = self.strip_padding(f.flags, &f.payload)?;
		if f.flags & FLAG_PRIORITY != 0 {
			if payload.len() < 5 {
				return Err(Http2Error::Malformed("PRIORITY flag set but frame too short".into()));
			}
			payload = &payload[5..];
		}
		let end_stream = f.has_flag(FLAG_END_STREAM);
		if f.has_flag(FLAG_END_HEADERS) {
			self.finish_header_block(f.stream_id, payload, end_stream, streams, events)?;
		} else {
			self.pending = Some(PendingHeaders {
				stream_id: f.stream_id,
				buf: BytesMut::from(payload),
				end_stream,
			});
		}
		Ok(())
	}

	fn handle_continuation(
		&mut self,
		f: Frame,
		streams: &mut HashMap<u32, Stream>,
		events: &mut Vec<Http2Event>,
	) -> Result<(), Http2Error> {
		let Some(pending) = self.pending.as_mut() else {
			return Err(Http2Error::UnexpectedContinuation);
		};
		if pending.stream_id != f.stream_id {
			return Err(Http2Error::UnexpectedContinuation);
		}
		pending.buf.extend_from_slice(&f.payload);
		if f.has_flag(FLAG_END_HEADERS) {
			let PendingHeaders { stream_id, buf, end_stream } = self.pending.take().unwrap();
			self.finish_header_block(stream_id, &buf, end_stream, streams, events)?;
		}
		Ok(())
	}

	fn finish_header_block(
		&mut self,
		stream_id: u32,
		block: &[u8],
		end_stream: bool,
		streams: &mut HashMap<u32, Stream>,
		events: &mut Vec<Http2Event>,
	) -> Result<(), Http2Error> {
		let headers = hpack::decode_header_block(block, &mut self.decode_table)?;
		let s = self.stream_mut(streams, stream_id);
		match self.role {
			Role::ClientFacing => s.on_request_headers(headers, end_stream),
			Role::ServerFacing => s.on_response_headers(headers, end_stream),
		}
		if s.is_complete() {
			events.push(Http2Event::StreamComplete { stream_id });
		}
		Ok(())
	}

	fn handle_data(
		&mut self,
		f: Frame,
		streams: &mut HashMap<u32, Stream>,
		events: &mut Vec<Http2Event>,
	) -> Result<(), Http2Error> {
		let payload = self.strip_padding(f.flags, &f.payload)?;
		self.conn_recv_window -= payload.len() as i64;
		if self.conn_recv_window < 0 {
			events.push(Http2Event::WindowUpdateError { stream_id: None });
		}
		let end_stream = f.has_flag(FLAG_END_STREAM);
		let s = self.stream_mut(streams, f.stream_id);
		match self.role {
			Role::ClientFacing => s.on_request_data(payload, end_stream),
			Role::ServerFacing => s.on_response_data(payload, end_stream),
		}
		if s.is_complete() {
			events.push(Http2Event::StreamComplete { stream_id: f.stream_id });
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::BufMut;

	fn settings_frame(entries: &[(u16, u32)]) -> Vec<u8> {
		let mut payload = BytesMut::new();
		for (id, value) in entries {
			payload.put_u16(*id);
			payload.put_u32(*value);
		}
		frame::encode(&Frame {
			frame_type: FrameType::Settings,
			flags: 0,
			stream_id: 0,
			payload: payload.freeze(),
		})
		.to_vec()
	}

	fn headers_frame(stream_id: u32, block: &[u8], end_stream: bool) -> Vec<u8> {
		frame::encode(&Frame {
			frame_type: FrameType::Headers,
			flags: FLAG_END_HEADERS | if end_stream { FLAG_END_STREAM } else { 0 },
			stream_id,
			payload: bytes::Bytes::copy_from_slice(block),
		})
		.to_vec()
	}

	#[test]
	fn client_preface_is_consumed_exactly_once() {
		let mut parser = Http2Parser::new(Role::ClientFacing);
		let mut streams = HashMap::new();
		let mut input = CLIENT_PREFACE.to_vec();
		input.extend_from_slice(&settings_frame(&[(0x5, 32_768)]));
		let events = parser.feed(&input, &mut streams).unwrap();
		assert!(matches!(events[0], Http2Event::SettingsReceived));
		assert_eq!(parser.max_frame_size, 32_768);
	}

	#[test]
	fn request_then_response_headers_completes_the_stream() {
		let mut client = Http2Parser::new(Role::ClientFacing);
		let mut server = Http2Parser::new(Role::ServerFacing);
		let mut streams = HashMap::new();

		let mut req_input = CLIENT_PREFACE.to_vec();
		// indexed :method GET (0x82), indexed :path / (0x84)
		req_input.extend_from_slice(&headers_frame(1, &[0x82, 0x84], true));
		client.feed(&req_input, &mut streams).unwrap();
		assert!(streams.get(&1).unwrap().request_headers.is_some());

		// indexed :status 200 (0x88)
		let resp_input = headers_frame(1, &[0x88], true);
		let events = server.feed(&resp_input, &mut streams).unwrap();
		assert!(events.iter().any(|e| matches!(e, Http2Event::StreamComplete { stream_id: 1 })));
	}

	#[test]
	fn continuation_without_pending_headers_errors() {
		let mut server = Http2Parser::new(Role::ServerFacing);
		let mut streams = HashMap::new();
		let cont = frame::encode(&Frame {
			frame_type: FrameType::Continuation,
			flags: FLAG_END_HEADERS,
			stream_id: 1,
			payload: bytes::Bytes::from_static(&[0x88]),
		});
		assert!(matches!(
			server.feed(&cont, &mut streams),
			Err(Http2Error::UnexpectedContinuation)
		));
	}

	#[test]
	fn ping_ack_flag_is_reported() {
		let mut server = Http2Parser::new(Role::ServerFacing);
		let mut streams = HashMap::new();
		let ping = frame::encode(&Frame {
			frame_type: FrameType::Ping,
			flags: FLAG_ACK,
			stream_id: 0,
			payload: bytes::Bytes::copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]),
		});
		let events = server.feed(&ping, &mut streams).unwrap();
		assert!(matches!(events[0], Http2Event::Ping { ack: true, .. }));
	}
}
