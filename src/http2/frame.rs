//! HTTP/2 frame header (RFC 7540 §4.1) and frame type/flag definitions.

use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
	Data,
	Headers,
	Priority,
	RstStream,
	Settings,
	PushPromise,
	Ping,
	Goaway,
	WindowUpdate,
	Continuation,
	Unknown(u8),
}

impl FrameType {
	fn from_u8(b: u8) -> FrameType {
		match b {
			0x0 => FrameType::Data,
			0x1 => FrameType::Headers,
			0x2 => FrameType::Priority,
			0x3 => FrameType::RstStream,
			0x4 => FrameType::Settings,
			0x5 => FrameType::PushPromise,
			0x6 => FrameType::Ping,
			0x7 => FrameType::Goaway,
			0x8 => FrameType::WindowUpdate,
			0x9 => FrameType::Continuation,
			other => FrameType::Unknown(other),
		}
	}

	fn to_u8(self) -> u8 {
		match self {
			FrameType::Data => 0x0,
			FrameType::Headers => 0x1,
			FrameType::Priority => 0x2,
			FrameType::RstStream => 0x3,
			FrameType::Settings => 0x4,
			FrameType::PushPromise => 0x5,
			FrameType::Ping => 0x6,
			FrameType::Goaway => 0x7,
			FrameType::WindowUpdate => 0x8,
			FrameType::Continuation => 0x9,
			FrameType::Unknown(b) => b,
		}
	}
}

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;
pub const FLAG_ACK: u8 = 0x1;

pub const FRAME_HEADER_LEN: usize = 9;

#[derive(Debug, Clone)]
pub struct Frame {
	pub frame_type: FrameType,
	pub flags: u8,
	/// Top bit is reserved and ignored on read, always written as zero.
	pub stream_id: u32,
	pub payload: Bytes,
}

impl Frame {
	pub fn has_flag(&self, flag: u8) -> bool {
		self.flags & flag != 0
	}
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
	#[error("frame exceeds the negotiated max frame size")]
	TooLarge,
}

/// Attempts to parse one complete frame from the front of `buf`. Returns
/// `None` if more bytes are needed; never consumes a partial frame.
pub fn try_parse(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Frame>, FrameError> {
	if buf.len() < FRAME_HEADER_LEN {
		return Ok(None);
	}
	let length = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]);
	if length > max_frame_size {
		return Err(FrameError::TooLarge);
	}
	let total = FRAME_HEADER_LEN + length as usize;
	if buf.len() < total {
		return Ok(None);
	}
	let frame_type = FrameType::from_u8(buf[3]);
	let flags = buf[4];
	let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;

	let mut raw = buf.split_to(total);
	raw.advance(FRAME_HEADER_LEN);
	Ok(Some(Frame {
		frame_type,
		flags,
		stream_id,
		payload: raw.freeze(),
	}))
}

pub fn encode(frame: &Frame) -> Bytes {
	let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + frame.payload.len());
	let len = frame.payload.len() as u32;
	out.put_u8((len >> 16) as u8);
	out.put_u8((len >> 8) as u8);
	out.put_u8(len as u8);
	out.put_u8(frame.frame_type.to_u8());
	out.put_u8(frame.flags);
	out.put_u32(frame.stream_id & 0x7fff_ffff);
	out.extend_from_slice(&frame.payload);
	out.freeze()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_and_reencodes_a_settings_frame() {
		let mut buf = BytesMut::new();
		let original = Frame {
			frame_type: FrameType::Settings,
			flags: 0,
			stream_id: 0,
			payload: Bytes::from_static(&[0, 3, 0, 0, 0, 100]),
		};
		buf.extend_from_slice(&encode(&original));
		let parsed = try_parse(&mut buf, 16_384).unwrap().unwrap();
		assert_eq!(parsed.frame_type, FrameType::Settings);
		assert_eq!(parsed.stream_id, 0);
		assert_eq!(&parsed.payload[..], &[0, 3, 0, 0, 0, 100]);
	}

	#[test]
	fn incomplete_frame_returns_none_without_consuming() {
		let mut buf = BytesMut::from(&b"\x00\x00\x05\x04\x00\x00\x00\x00\x00ab"[..]);
		assert!(try_parse(&mut buf, 16_384).unwrap().is_none());
		assert_eq!(buf.len(), 11);
	}

	#[test]
	fn oversized_frame_is_rejected() {
		let mut buf = BytesMut::new();
		buf.extend_from_slice(&[0xff, 0xff, 0xff, 0x0, 0x0, 0, 0, 0, 0]);
		assert_eq!(try_parse(&mut buf, 16_384), Err(FrameError::TooLarge));
	}

	#[test]
	fn reserved_bit_is_ignored_on_read() {
		let mut buf = BytesMut::new();
		buf.extend_from_slice(&[0, 0, 0, 0x4, 0x0, 0x80, 0, 0, 5]);
		let parsed = try_parse(&mut buf, 16_384).unwrap().unwrap();
		assert_eq!(parsed.stream_id, 5);
	}
}
