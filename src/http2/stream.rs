//! Per-stream state (RFC 7540 §5.1). The proxy observes both directions of
//! a stream (client request, server response) from the single middle
//! vantage point, so "local"/"remote" here mean "request side"/"response
//! side" rather than a single endpoint's view.

use bytes::BytesMut;

use crate::flow::Headers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
	Idle,
	ReservedLocal,
	ReservedRemote,
	Open,
	HalfClosedLocal,
	HalfClosedRemote,
	Closed,
}

pub struct Stream {
	pub id: u32,
	pub state: StreamState,
	pub request_headers: Option<Headers>,
	pub response_headers: Option<Headers>,
	pub request_data: BytesMut,
	pub response_data: BytesMut,
	pub send_window: i64,
	pub recv_window: i64,
	request_ended: bool,
	response_ended: bool,
}

impl Stream {
	pub fn new(id: u32, initial_window: i64) -> Self {
		Stream {
			id,
			state: StreamState::Idle,
			request_headers: None,
			response_headers: None,
			request_data: BytesMut::new(),
			response_data: BytesMut::new(),
			send_window: initial_window,
			recv_window: initial_window,
			request_ended: false,
			response_ended: false,
		}
	}

	pub fn is_client_initiated(&self) -> bool {
		self.id % 2 == 1
	}

	pub fn reserve(&mut self, local: bool) {
		self.state = if local { StreamState::ReservedLocal } else { StreamState::ReservedRemote };
	}

	pub fn on_request_headers(&mut self, headers: Headers, end_stream: bool) {
		self.request_headers = Some(headers);
		if self.state == StreamState::Idle {
			self.state = StreamState::Open;
		}
		if end_stream {
			self.mark_request_ended();
		}
	}

	pub fn on_response_headers(&mut self, headers: Headers, end_stream: bool) {
		self.response_headers = Some(headers);
		if end_stream {
			self.mark_response_ended();
		}
	}

	pub fn on_request_data(&mut self, data: &[u8], end_stream: bool) {
		self.request_data.extend_from_slice(data);
		if end_stream {
			self.mark_request_ended();
		}
	}

	pub fn on_response_data(&mut self, data: &[u8], end_stream: bool) {
		self.response_data.extend_from_slice(data);
		if end_stream {
			self.mark_response_ended();
		}
	}

	fn mark_request_ended(&mut self) {
		self.request_ended = true;
		self.advance_state();
	}

	fn mark_response_ended(&mut self) {
		self.response_ended = true;
		self.advance_state();
	}

	fn advance_state(&mut self) {
		self.state = match (self.request_ended, self.response_ended) {
			(true, true) => StreamState::Closed,
			(true, false) => StreamState::HalfClosedLocal,
			(false, true) => StreamState::HalfClosedRemote,
			(false, false) => StreamState::Open,
		};
	}

	pub fn reset(&mut self) {
		self.state = StreamState::Closed;
	}

	pub fn is_closed(&self) -> bool {
		self.state == StreamState::Closed
	}

	/// The synthetic C6 message fires once both headers and (for
	/// data-carrying streams) the response body have been observed.
	pub fn is_complete(&self) -> bool {
		self.request_headers.is_some() && self.response_headers.is_some() && self.response_ended
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn odd_ids_are_client_initiated() {
		assert!(Stream::new(1, 65_535).is_client_initiated());
		assert!(!Stream::new(2, 65_535).is_client_initiated());
	}

	#[test]
	fn both_sides_ending_closes_the_stream() {
		let mut s = Stream::new(1, 65_535);
		s.on_request_headers(Headers::new(), true);
		assert_eq!(s.state, StreamState::HalfClosedLocal);
		s.on_response_headers(Headers::new(), true);
		assert_eq!(s.state, StreamState::Closed);
		assert!(s.is_complete());
	}

	#[test]
	fn response_ending_first_is_half_closed_remote() {
		let mut s = Stream::new(1, 65_535);
		s.on_request_headers(Headers::new(), false);
		s.on_response_headers(Headers::new(), true);
		assert_eq!(s.state, StreamState::HalfClosedRemote);
		assert!(!s.is_complete());
		s.on_request_data(b"", true);
		assert_eq!(s.state, StreamState::Closed);
	}
}
