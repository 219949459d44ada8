//! HPACK header compression (RFC 7541). Static table, dynamic table with
//! FIFO eviction, integer/string encoding, and the subset of
//! representation types spec.md §4.4 names: indexed header, literal with
//! incremental indexing, dynamic table size update, literal without
//! indexing/never indexed.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use super::huffman;
use crate::flow::Headers;

/// The 61 static table entries, 1-indexed per RFC 7541 Appendix A.
const STATIC_TABLE: [(&str, &str); 61] = [
	(":authority", ""),
	(":method", "GET"),
	(":method", "POST"),
	(":path", "/"),
	(":path", "/index.html"),
	(":scheme", "http"),
	(":scheme", "https"),
	(":status", "200"),
	(":status", "204"),
	(":status", "206"),
	(":status", "304"),
	(":status", "400"),
	(":status", "404"),
	(":status", "500"),
	("accept-charset", ""),
	("accept-encoding", "gzip, deflate"),
	("accept-language", ""),
	("accept-ranges", ""),
	("accept", ""),
	("access-control-allow-origin", ""),
	("age", ""),
	("allow", ""),
	("authorization", ""),
	("cache-control", ""),
	("content-disposition", ""),
	("content-encoding", ""),
	("content-language", ""),
	("content-length", ""),
	("content-location", ""),
	("content-range", ""),
	("content-type", ""),
	("cookie", ""),
	("date", ""),
	("etag", ""),
	("expect", ""),
	("expires", ""),
	("from", ""),
	("host", ""),
	("if-match", ""),
	("if-modified-since", ""),
	("if-none-match", ""),
	("if-range", ""),
	("if-unmodified-since", ""),
	("last-modified", ""),
	("link", ""),
	("location", ""),
	("max-forwards", ""),
	("proxy-authenticate", ""),
	("proxy-authorization", ""),
	("range", ""),
	("referer", ""),
	("refresh", ""),
	("retry-after", ""),
	("server", ""),
	("set-cookie", ""),
	("strict-transport-security", ""),
	("transfer-encoding", ""),
	("user-agent", ""),
	("vary", ""),
	("via", ""),
	("www-authenticate", ""),
];

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HpackError {
	#[error("header block ended mid-representation")]
	Truncated,
	#[error("index {0} is out of range")]
	InvalidIndex(u64),
	#[error("integer encoding overflowed")]
	IntegerOverflow,
	#[error("huffman decoding failed: {0}")]
	Huffman(#[from] huffman::HuffmanError),
	#[error("string is not valid UTF-8")]
	InvalidUtf8,
}

/// Dynamic table: FIFO insertion at front, eviction from the back until
/// the new entry fits under the negotiated size limit (RFC 7541 §2.3.2).
/// Entry "size" is `name.len() + value.len() + 32` per the RFC's fixed
/// per-entry overhead.
pub struct DynamicTable {
	entries: VecDeque<(String, String)>,
	max_size: u32,
	current_size: u32,
}

fn entry_size(name: &str, value: &str) -> u32 {
	(name.len() + value.len() + 32) as u32
}

impl DynamicTable {
	pub fn new(max_size: u32) -> Self {
		DynamicTable { entries: VecDeque::new(), max_size, current_size: 0 }
	}

	pub fn set_max_size(&mut self, max_size: u32) {
		self.max_size = max_size;
		self.evict_to_fit();
	}

	fn evict_to_fit(&mut self) {
		while self.current_size > self.max_size {
			if let Some((name, value)) = self.entries.pop_back() {
				self.current_size -= entry_size(&name, &value);
			} else {
				break;
			}
		}
	}

	pub fn insert(&mut self, name: String, value: String) {
		let size = entry_size(&name, &value);
		self.current_size += size;
		self.entries.push_front((name, value));
		self.evict_to_fit();
	}

	/// `index` is 1-based and counted after the static table (i.e. dynamic
	/// index 1 == static table index 62).
	pub fn get(&self, dynamic_index: usize) -> Option<&(String, String)> {
		self.entries.get(dynamic_index - 1)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}
}

fn lookup_index(table: &DynamicTable, index: u64) -> Result<(String, String), HpackError> {
	let index = index as usize;
	if index == 0 {
		return Err(HpackError::InvalidIndex(0));
	}
	if index <= STATIC_TABLE.len() {
		let (n, v) = STATIC_TABLE[index - 1];
		return Ok((n.to_string(), v.to_string()));
	}
	table
		.get(index - STATIC_TABLE.len())
		.cloned()
		.ok_or(HpackError::InvalidIndex(index as u64))
}

/// Decodes an HPACK integer with an `prefix_bits`-bit prefix (RFC 7541 §5.1).
/// Returns the value and how many bytes were consumed.
fn decode_integer(buf: &[u8], prefix_bits: u8) -> Result<(u64, usize), HpackError> {
	if buf.is_empty() {
		return Err(HpackError::Truncated);
	}
	let mask = (1u8 << prefix_bits) - 1;
	let mut value = (buf[0] & mask) as u64;
	if value < mask as u64 {
		return Ok((value, 1));
	}
	let mut m = 0u32;
	let mut i = 1;
	loop {
		let Some(&b) = buf.get(i) else {
			return Err(HpackError::Truncated);
		};
		value += ((b & 0x7f) as u64) << m;
		m += 7;
		i += 1;
		if b & 0x80 == 0 {
			break;
		}
		if m > 63 {
			return Err(HpackError::IntegerOverflow);
		}
	}
	Ok((value, i))
}

fn encode_integer(out: &mut BytesMut, prefix_bits: u8, prefix_value: u8, value: u64) {
	let mask = (1u8 << prefix_bits) - 1;
	if value < mask as u64 {
		out.put_u8(prefix_value | value as u8);
		return;
	}
	out.put_u8(prefix_value | mask);
	let mut remaining = value - mask as u64;
	while remaining >= 0x80 {
		out.put_u8(((remaining & 0x7f) | 0x80) as u8);
		remaining >>= 7;
	}
	out.put_u8(remaining as u8);
}

/// Decodes a string literal (RFC 7541 §5.2): 1-bit Huffman flag, 7-bit
/// prefix length, then that many raw or Huffman-coded bytes.
fn decode_string(buf: &[u8]) -> Result<(String, usize), HpackError> {
	if buf.is_empty() {
		return Err(HpackError::Truncated);
	}
	let huffman_coded = buf[0] & 0x80 != 0;
	let (len, len_bytes) = decode_integer(buf, 7)?;
	let len = len as usize;
	let start = len_bytes;
	let end = start + len;
	if buf.len() < end {
		return Err(HpackError::Truncated);
	}
	let raw = &buf[start..end];
	let bytes = if huffman_coded { huffman::decode(raw)? } else { raw.to_vec() };
	let s = String::from_utf8(bytes).map_err(|_| HpackError::InvalidUtf8)?;
	Ok((s, end))
}

/// Encodes a string literal without Huffman coding (plain literal, per
/// spec.md §9's resolved Open Question: encoding always uses
/// non-Huffman literals).
fn encode_string(out: &mut BytesMut, value: &str) {
	encode_integer(out, 7, 0x00, value.len() as u64);
	out.extend_from_slice(value.as_bytes());
}

/// Decodes one complete header block into an ordered `Headers` list,
/// applying dynamic-table-size updates and insertions as it goes.
pub fn decode_header_block(block: &[u8], table: &mut DynamicTable) -> Result<Headers, HpackError> {
	let mut headers = Headers::new();
	let mut i = 0;
	while i < block.len() {
		let b = block[i];
		if b & 0x80 != 0 {
			// Indexed header field.
			let (index, used) = decode_integer(&block[i..], 7)?;
			let (name, value) = lookup_index(table, index)?;
			headers.push(name, value);
			i += used;
		} else if b & 0x40 != 0 {
			// Literal with incremental indexing.
			let (index, used) = decode_integer(&block[i..], 6)?;
			i += used;
			let name = if index == 0 {
				let (s, consumed) = decode_string(&block[i..])?;
				i += consumed;
				s
			} else {
				lookup_index(table, index)?.0
			};
			let (value, consumed) = decode_string(&block[i..])?;
			i += consumed;
			table.insert(name.clone(), value.clone());
			headers.push(name, value);
		} else if b & 0x20 != 0 {
			// Dynamic table size update.
			let (new_size, used) = decode_integer(&block[i..], 5)?;
			table.set_max_size(new_size as u32);
			i += used;
		} else {
			// Literal without indexing (0x00 prefix) or never indexed (0x10 prefix).
			let (index, used) = decode_integer(&block[i..], 4)?;
			i += used;
			let name = if index == 0 {
				let (s, consumed) = decode_string(&block[i..])?;
				i += consumed;
				s
			} else {
				lookup_index(table, index)?.0
			};
			let (value, consumed) = decode_string(&block[i..])?;
			i += consumed;
			headers.push(name, value);
		}
	}
	Ok(headers)
}

/// Encodes headers as literals without indexing, using plain (non-Huffman)
/// string literals throughout — sufficient for re-emitting headers toward
/// the UI/HAR export; see module doc.
pub fn encode_header_block(headers: &Headers) -> Bytes {
	let mut out = BytesMut::new();
	for (name, value) in headers.iter() {
		out.put_u8(0x00);
		encode_string(&mut out, name);
		encode_string(&mut out, value);
	}
	out.freeze()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decodes_indexed_static_entry() {
		let mut table = DynamicTable::new(4096);
		// index 2 == (":method", "GET")
		let block = [0x82u8];
		let headers = decode_header_block(&block, &mut table).unwrap();
		assert_eq!(headers.get(":method"), Some("GET"));
	}

	#[test]
	fn literal_with_incremental_indexing_populates_dynamic_table() {
		let mut table = DynamicTable::new(4096);
		let mut block = BytesMut::new();
		block.put_u8(0x40); // literal, new name, incremental indexing
		encode_string(&mut block, "x-custom");
		encode_string(&mut block, "value1");
		let headers = decode_header_block(&block, &mut table).unwrap();
		assert_eq!(headers.get("x-custom"), Some("value1"));
		assert_eq!(table.len(), 1);
	}

	#[test]
	fn dynamic_table_evicts_oldest_entries_over_size_limit() {
		let mut table = DynamicTable::new(64);
		table.insert("a".into(), "1".repeat(20));
		table.insert("b".into(), "2".repeat(20));
		// Each entry is ~20+1+32 = 53 bytes; inserting a second evicts the first.
		assert_eq!(table.len(), 1);
		assert_eq!(table.get(1).unwrap().0, "b");
	}

	#[test]
	fn dynamic_table_size_update_shrinks_and_evicts() {
		let mut table = DynamicTable::new(4096);
		table.insert("name".into(), "value".into());
		assert_eq!(table.len(), 1);
		let mut block = BytesMut::new();
		block.put_u8(0x20); // size update to 0
		let headers = decode_header_block(&block, &mut table).unwrap();
		assert!(headers.is_empty());
		assert_eq!(table.len(), 0);
	}

	#[test]
	fn decodes_worked_example_request_header_block() {
		let block = [
			0x82u8, 0x86, 0x84, 0x41, 0x0F, 0x77, 0x77, 0x77, 0x2E, 0x65, 0x78, 0x61, 0x6D, 0x70, 0x6C, 0x65, 0x2E, 0x63, 0x6F,
			0x6D,
		];
		let mut table = DynamicTable::new(4096);
		let headers = decode_header_block(&block, &mut table).unwrap();
		assert_eq!(headers.get(":method"), Some("GET"));
		assert_eq!(headers.get(":scheme"), Some("http"));
		assert_eq!(headers.get(":path"), Some("/"));
		assert_eq!(headers.get(":authority"), Some("www.example.com"));
	}

	#[test]
	fn integer_round_trips_across_continuation_bytes() {
		let mut out = BytesMut::new();
		encode_integer(&mut out, 5, 0, 1337);
		let (value, used) = decode_integer(&out, 5).unwrap();
		assert_eq!(value, 1337);
		assert_eq!(used, out.len());
	}
}
