//! Root CA persistence and leaf signing (§4.1). Grounded on the teacher's
//! `control::caclient` for error/log shape, and on `cursor-proxy`'s
//! `load_ca`/`generate_cert_for_domain` for the actual rcgen call sequence
//! (no MITM-CA code exists in the teacher's own tree, so this component is
//! the first to exercise the `rcgen` dependency it already carries).

mod pfx;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use rcgen::{
	BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
	ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use ring::aead;
use time::OffsetDateTime;
use tracing::{debug, info};

pub const SUBJECT_CN: &str = "SyrahProxy CA";
const CA_VALIDITY_YEARS: i64 = 10;

/// Filename of the encrypted root CA store (spec.md §3: "Stored encrypted
/// with a process-known passphrase in a PKCS#12-equivalent container").
/// This is the sole basis `load_or_create` uses to decide whether a CA
/// already exists; it is distinct from the plaintext `.key`/`.pem`/`.cer`/
/// `.p12` install artifacts `write_artifacts` writes for OS trust-store
/// import (§6), which are a separate, intentionally-unencrypted concern.
const CA_STORE_FILENAME: &str = "syrah-ca-store.p12";

/// Fixed, compiled-in passphrase the process derives its store key from.
/// Not a user secret and not configurable — it satisfies spec.md's
/// "process-known passphrase" wording (the container isn't meant to resist
/// an attacker with read access to the binary, only to avoid leaving the CA
/// private key as a bare PEM file on disk).
const CA_STORE_PASSPHRASE: &[u8] = b"syrah-root-ca-store-v1";

fn store_key() -> aead::LessSafeKey {
	let digest = ring::digest::digest(&ring::digest::SHA256, CA_STORE_PASSPHRASE);
	let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, digest.as_ref()).expect("sha-256 digest is 32 bytes");
	aead::LessSafeKey::new(unbound)
}

/// Encrypts `plaintext` (the PEM key+cert pair) with AES-256-GCM under the
/// process-known passphrase, prefixing a random nonce.
fn encrypt_store(plaintext: &[u8]) -> Vec<u8> {
	let mut nonce_bytes = [0u8; aead::NONCE_LEN];
	rand::rng().fill(&mut nonce_bytes);
	let mut in_out = plaintext.to_vec();
	store_key()
		.seal_in_place_append_tag(aead::Nonce::assume_unique_for_key(nonce_bytes), aead::Aad::empty(), &mut in_out)
		.expect("in-memory seal cannot fail");
	let mut out = Vec::with_capacity(nonce_bytes.len() + in_out.len());
	out.extend_from_slice(&nonce_bytes);
	out.extend_from_slice(&in_out);
	out
}

/// Decrypts a store file produced by [`encrypt_store`]. Any failure
/// (truncated file, wrong passphrase, tampered bytes) is a corrupt store
/// per spec.md's `load_or_create`: "if the persisted container exists and
/// decrypts, return it; otherwise ..." — here "otherwise" surfaces as
/// [`CaError::Corrupt`], which is fatal to the proxy (§4.1).
fn decrypt_store(data: &[u8]) -> Result<Vec<u8>, CaError> {
	if data.len() < aead::NONCE_LEN {
		return Err(CaError::Corrupt("store file shorter than a nonce".into()));
	}
	let (nonce_bytes, ciphertext) = data.split_at(aead::NONCE_LEN);
	let nonce = aead::Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CaError::Corrupt("malformed nonce".into()))?;
	let mut buf = ciphertext.to_vec();
	let plaintext = store_key()
		.open_in_place(nonce, aead::Aad::empty(), &mut buf)
		.map_err(|_| CaError::Corrupt("store decryption failed (wrong passphrase or corrupt container)".into()))?;
	Ok(plaintext.to_vec())
}

/// Packs the key and cert PEM blocks into one length-prefixed buffer for
/// the encrypted store (the cert/key bags of a real PKCS#12 file are what
/// this stands in for; see `pfx.rs` for the export-side equivalent).
fn encode_store_pair(key_pem: &str, cert_pem: &str) -> Vec<u8> {
	let mut out = Vec::with_capacity(key_pem.len() + cert_pem.len() + 8);
	out.extend_from_slice(&(key_pem.len() as u32).to_be_bytes());
	out.extend_from_slice(key_pem.as_bytes());
	out.extend_from_slice(&(cert_pem.len() as u32).to_be_bytes());
	out.extend_from_slice(cert_pem.as_bytes());
	out
}

fn decode_store_pair(data: &[u8]) -> Result<(String, String), CaError> {
	let bad = || CaError::Corrupt("malformed store payload".into());
	if data.len() < 4 {
		return Err(bad());
	}
	let key_len = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;
	let rest = data.get(4..).ok_or_else(bad)?;
	let key_pem = rest.get(..key_len).ok_or_else(bad)?;
	let rest = rest.get(key_len..).ok_or_else(bad)?;
	if rest.len() < 4 {
		return Err(bad());
	}
	let cert_len = u32::from_be_bytes(rest[0..4].try_into().unwrap()) as usize;
	let cert_pem = rest.get(4..4 + cert_len).ok_or_else(bad)?;
	let key_pem = String::from_utf8(key_pem.to_vec()).map_err(|_| bad())?;
	let cert_pem = String::from_utf8(cert_pem.to_vec()).map_err(|_| bad())?;
	Ok((key_pem, cert_pem))
}

#[derive(thiserror::Error, Debug)]
pub enum CaError {
	#[error("CA key material missing at {0}")]
	Missing(PathBuf),
	#[error("CA key material corrupt: {0}")]
	Corrupt(String),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("certificate generation failed: {0}")]
	Sign(#[from] rcgen::Error),
}

/// Which on-disk artifact to produce for `export` / installation into an OS
/// trust store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
	Pem,
	Der,
	Pfx,
}

/// The loaded (or freshly generated) root CA: a key pair plus a
/// self-signed certificate usable both as an installable trust anchor and
/// as the issuer for leaf certs.
pub struct CaMaterial {
	key: KeyPair,
	issuer: Certificate,
	cert_pem: String,
	cert_der: Vec<u8>,
}

fn ca_params() -> CertificateParams {
	let mut params = CertificateParams::default();
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, SUBJECT_CN);
	dn.push(DnType::OrganizationName, "Syrah");
	params.distinguished_name = dn;
	params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
	params.not_before = OffsetDateTime::now_utc();
	params.not_after = OffsetDateTime::now_utc() + time::Duration::days(365 * CA_VALIDITY_YEARS);
	params
}

impl CaMaterial {
	/// Loads the root CA from `dir`, generating and persisting a fresh one
	/// if absent. Corresponds to spec.md's `load_or_create`: the encrypted
	/// store file is what decides "exists"; if present it must also decrypt,
	/// or the CA is considered corrupt (fatal per §4.1).
	pub fn load_or_create(dir: &Path) -> Result<CaMaterial, CaError> {
		fs::create_dir_all(dir)?;
		let store_path = dir.join(CA_STORE_FILENAME);

		if store_path.exists() {
			return Self::load(&store_path);
		}

		info!(dir = %dir.display(), "no root CA found, generating one");
		let key = KeyPair::generate()?;
		let params = ca_params();
		let issuer = params.self_signed(&key)?;
		let cert_pem = issuer.pem();
		let cert_der = issuer.der().to_vec();
		let key_pem = key.serialize_pem();

		let encrypted = encrypt_store(&encode_store_pair(&key_pem, &cert_pem));
		fs::write(&store_path, &encrypted)?;
		fs::set_permissions(&store_path, fs::Permissions::from_mode(0o600))?;
		debug!(dir = %dir.display(), "persisted new encrypted root CA store");

		Ok(CaMaterial {
			key,
			issuer,
			cert_pem,
			cert_der,
		})
	}

	fn load(store_path: &Path) -> Result<CaMaterial, CaError> {
		let encrypted = fs::read(store_path)?;
		let plaintext = decrypt_store(&encrypted)?;
		let (key_pem, cert_pem) = decode_store_pair(&plaintext)?;
		let key = KeyPair::from_pem(&key_pem).map_err(|e| CaError::Corrupt(e.to_string()))?;
		// The persisted cert bytes are kept verbatim for export/install, but the
		// in-memory `Certificate` used as a signing issuer is regenerated from
		// the same fixed parameters plus the loaded key — identical to
		// `cursor-proxy::load_ca`'s "we have the key, that's what matters for
		// signing" approach, rather than re-parsing the stored DER.
		let params = ca_params();
		let issuer = params.self_signed(&key)?;
		let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
			.next()
			.ok_or_else(|| CaError::Corrupt("no certificate found in PEM".into()))?
			.map_err(|e| CaError::Corrupt(e.to_string()))?
			.to_vec();
		info!(store = %store_path.display(), "loaded and decrypted existing root CA store");
		Ok(CaMaterial {
			key,
			issuer,
			cert_pem,
			cert_der,
		})
	}

	/// Signs a fresh leaf certificate for `subject_cn`/`san_dns_names`, valid
	/// for `validity`. Returns (key PEM, key DER/PKCS8, cert DER).
	pub fn sign_leaf(
		&self,
		subject_cn: &str,
		san_dns_names: &[String],
		validity: Duration,
	) -> Result<LeafMaterial, CaError> {
		let mut params = CertificateParams::default();
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, subject_cn);
		params.distinguished_name = dn;
		params.subject_alt_names = san_dns_names
			.iter()
			.map(|h| {
				let ia5 = h
					.as_str()
					.try_into()
					.map_err(|_| CaError::Corrupt(format!("invalid SAN host name: {h}")))?;
				Ok(SanType::DnsName(ia5))
			})
			.collect::<Result<Vec<SanType>, CaError>>()?;
		params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
		params.not_before = OffsetDateTime::now_utc();
		params.not_after = OffsetDateTime::now_utc() + time::Duration::seconds(validity.as_secs() as i64);

		let key = KeyPair::generate()?;
		let cert = params.signed_by(&key, &self.issuer, &self.key)?;
		Ok(LeafMaterial {
			key_der: key.serialize_der(),
			cert_der: cert.der().to_vec(),
		})
	}

	pub fn export(&self, format: ExportFormat) -> Vec<u8> {
		match format {
			ExportFormat::Pem => self.cert_pem.as_bytes().to_vec(),
			ExportFormat::Der => self.cert_der.clone(),
			ExportFormat::Pfx => pfx::build(&self.cert_der, &self.key.serialize_der()),
		}
	}

	pub fn cert_der(&self) -> &[u8] {
		&self.cert_der
	}

	/// Writes the plaintext `.key`/`.pem`/`.cer`/`.p12` install artifacts (§6
	/// Certificate artifacts) derived from the encrypted store `load_or_create`
	/// holds in memory. These are deliberately unencrypted: they exist to be
	/// installed into an OS/browser trust store or handed to `openssl`, not to
	/// serve as the CA's own at-rest storage (that's `CA_STORE_FILENAME`'s job).
	/// Safe to call on every startup: all four are deterministic re-encodings
	/// of the already-loaded cert/key.
	pub fn write_artifacts(&self, dir: &Path) -> Result<(), CaError> {
		let key_path = dir.join("syrah-ca.key");
		fs::write(&key_path, self.key.serialize_pem().as_bytes())?;
		fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
		fs::write(dir.join("syrah-ca-cert.pem"), self.export(ExportFormat::Pem))?;
		fs::write(dir.join("syrah-ca-cert.cer"), self.export(ExportFormat::Der))?;
		fs::write(dir.join("syrah-ca-cert.p12"), self.export(ExportFormat::Pfx))?;
		Ok(())
	}
}

/// A CA-signed leaf key+cert pair, ready to be loaded into a `rustls`
/// `ServerConfig`.
#[derive(Clone)]
pub struct LeafMaterial {
	pub key_der: Vec<u8>,
	pub cert_der: Vec<u8>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generates_and_reloads_ca() {
		let dir = tempfile_dir();
		let ca = CaMaterial::load_or_create(&dir).unwrap();
		let pem1 = ca.export(ExportFormat::Pem);
		drop(ca);

		let ca2 = CaMaterial::load_or_create(&dir).unwrap();
		let pem2 = ca2.export(ExportFormat::Pem);
		assert_eq!(pem1, pem2, "reloading must not regenerate a new CA cert file");
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[test]
	fn signs_leaf_for_host() {
		let dir = tempfile_dir();
		let ca = CaMaterial::load_or_create(&dir).unwrap();
		let leaf = ca
			.sign_leaf("example.test", &["example.test".to_string()], Duration::from_secs(86400 * 365))
			.unwrap();
		assert!(!leaf.cert_der.is_empty());
		assert!(!leaf.key_der.is_empty());
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[test]
	fn store_file_is_not_plaintext_pem() {
		let dir = tempfile_dir();
		let _ca = CaMaterial::load_or_create(&dir).unwrap();
		let raw = std::fs::read(dir.join(CA_STORE_FILENAME)).unwrap();
		let as_text = String::from_utf8_lossy(&raw);
		assert!(!as_text.contains("PRIVATE KEY"), "store file must not contain a plaintext PEM key");
		assert!(!as_text.contains("CERTIFICATE"), "store file must not contain a plaintext PEM cert");
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[test]
	fn corrupt_store_fails_to_load() {
		let dir = tempfile_dir();
		let _ca = CaMaterial::load_or_create(&dir).unwrap();
		let store_path = dir.join(CA_STORE_FILENAME);
		let mut raw = std::fs::read(&store_path).unwrap();
		let last = raw.len() - 1;
		raw[last] ^= 0xff;
		std::fs::write(&store_path, &raw).unwrap();

		let err = CaMaterial::load_or_create(&dir).unwrap_err();
		assert!(matches!(err, CaError::Corrupt(_)), "tampered store must surface as CaError::Corrupt");
		std::fs::remove_dir_all(&dir).unwrap();
	}

	fn tempfile_dir() -> PathBuf {
		let mut dir = std::env::temp_dir();
		dir.push(format!("syrah-ca-test-{}-{:?}", std::process::id(), std::thread::current().id()));
		dir
	}
}
