//! Minimal, unencrypted PKCS#12 (PFX) container builder.
//!
//! No maintained crate in the retrieval pack builds a plain PFX from raw
//! cert+key DER, so this hand-rolls the handful of RFC 7292 structures we
//! actually need: a `SafeContents` holding one `CertBag` and one `KeyBag`,
//! wrapped in a `NoCrypt` `AuthenticatedSafe` with no `macData` (no
//! passphrase, no integrity check — acceptable for a local developer CA
//! that is only ever imported once into an OS trust store).

const OID_PKCS7_DATA: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x01];
const OID_PKCS12_CERT_BAG: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x0c, 0x0a, 0x01, 0x03];
const OID_PKCS12_KEY_BAG: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x0c, 0x0a, 0x01, 0x01];
const OID_PKCS9_X509_CERTIFICATE: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x09, 0x16, 0x01];

const TAG_SEQUENCE: u8 = 0x30;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_INTEGER: u8 = 0x02;
const TAG_OID: u8 = 0x06;
const TAG_EXPLICIT_0: u8 = 0xa0;

fn der_len(len: usize) -> Vec<u8> {
	if len < 0x80 {
		vec![len as u8]
	} else {
		let bytes = len.to_be_bytes();
		let first_nonzero = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
		let trimmed = &bytes[first_nonzero..];
		let mut out = vec![0x80 | trimmed.len() as u8];
		out.extend_from_slice(trimmed);
		out
	}
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(content.len() + 6);
	out.push(tag);
	out.extend(der_len(content.len()));
	out.extend_from_slice(content);
	out
}

fn sequence(parts: &[&[u8]]) -> Vec<u8> {
	let content: Vec<u8> = parts.concat();
	tlv(TAG_SEQUENCE, &content)
}

fn oid(bytes: &[u8]) -> Vec<u8> {
	tlv(TAG_OID, bytes)
}

fn octet_string(bytes: &[u8]) -> Vec<u8> {
	tlv(TAG_OCTET_STRING, bytes)
}

fn explicit0(content: &[u8]) -> Vec<u8> {
	tlv(TAG_EXPLICIT_0, content)
}

fn content_info_data(payload: &[u8]) -> Vec<u8> {
	sequence(&[&oid(OID_PKCS7_DATA), &explicit0(&octet_string(payload))])
}

fn cert_bag(cert_der: &[u8]) -> Vec<u8> {
	let bag_value = sequence(&[
		&oid(OID_PKCS9_X509_CERTIFICATE),
		&explicit0(&octet_string(cert_der)),
	]);
	sequence(&[&oid(OID_PKCS12_CERT_BAG), &explicit0(&bag_value)])
}

fn key_bag(key_pkcs8_der: &[u8]) -> Vec<u8> {
	// bagValue for a keyBag IS the PrivateKeyInfo itself, not wrapped in another SEQUENCE.
	sequence(&[&oid(OID_PKCS12_KEY_BAG), &explicit0(key_pkcs8_der)])
}

/// Builds an unencrypted, un-MAC'd PFX wrapping a single cert+key pair.
pub fn build(cert_der: &[u8], key_pkcs8_der: &[u8]) -> Vec<u8> {
	let safe_contents = sequence(&[&cert_bag(cert_der), &key_bag(key_pkcs8_der)]);
	let authenticated_safe = sequence(&[&content_info_data(&safe_contents)]);
	let auth_safe = content_info_data(&authenticated_safe);
	sequence(&[&tlv(TAG_INTEGER, &[0x03]), &auth_safe])
}
