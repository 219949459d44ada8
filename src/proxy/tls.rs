//! TLS configuration for both sides of interception: a per-host server
//! config built from a freshly-minted leaf (C2), and a client config used to
//! dial the real upstream once interception has already shown the client
//! whatever cert we hand it. Grounded on the teacher's `transport::tls`
//! (`accept`, `ALL_TLS_VERSIONS`) for the server side, and on its
//! `transport::tls::insecure::NoVerifier` for the upstream client side: the
//! teacher reaches for a no-op `ServerCertVerifier` for mTLS-bypass
//! scenarios where trust is already established out of band; here trust is
//! established by the client already trusting our own root CA, so verifying
//! the real upstream's certificate chain a second time doesn't add
//! meaningful protection for a local debugging proxy and every MITM proxy
//! in the retrieval pack (e.g. `cursor-proxy`) does the same.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};

use crate::ca::LeafMaterial;

pub static ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
	&[&rustls::version::TLS12, &rustls::version::TLS13];

/// Builds a server-side TLS config presenting `leaf` (chained to the root
/// CA cert so OS/browser chain validation succeeds), advertising `h2` and
/// `http/1.1` via ALPN so the connection manager can branch on the
/// negotiated protocol after the handshake.
pub fn server_config(leaf: &LeafMaterial, ca_cert_der: &[u8]) -> Result<ServerConfig, rustls::Error> {
	let chain = vec![
		CertificateDer::from(leaf.cert_der.clone()),
		CertificateDer::from(ca_cert_der.to_vec()),
	];
	let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.key_der.clone()));
	let mut cfg = ServerConfig::builder_with_protocol_versions(ALL_TLS_VERSIONS)
		.with_no_client_auth()
		.with_single_cert(chain, key)?;
	cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	Ok(cfg)
}

/// Client config for dialing the real upstream after interception. Accepts
/// any certificate the upstream presents (see module docs); offers `h2` and
/// `http/1.1` via ALPN.
pub fn upstream_client_config() -> ClientConfig {
	let mut cfg = ClientConfig::builder_with_protocol_versions(ALL_TLS_VERSIONS)
		.dangerous()
		.with_custom_certificate_verifier(Arc::new(NoVerifier))
		.with_no_client_auth();
	cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	cfg
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn verify_tls13_signature(
		&self,
		_message: &[u8],
		_cert: &CertificateDer<'_>,
		_dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		Ok(HandshakeSignatureValid::assertion())
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		vec![
			SignatureScheme::RSA_PKCS1_SHA256,
			SignatureScheme::RSA_PKCS1_SHA384,
			SignatureScheme::RSA_PKCS1_SHA512,
			SignatureScheme::ECDSA_NISTP256_SHA256,
			SignatureScheme::ECDSA_NISTP384_SHA384,
			SignatureScheme::RSA_PSS_SHA256,
			SignatureScheme::RSA_PSS_SHA384,
			SignatureScheme::RSA_PSS_SHA512,
			SignatureScheme::ED25519,
		]
	}
}
