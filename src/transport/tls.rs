//! TLS client configuration for the configured [`TrustPolicy`].

use crate::config::TrustPolicy;
use crate::error::{BuildError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;

/// ALPN identifier for HTTP/2
pub const ALPN_H2: &[u8] = b"h2";

/// Verifies the certificate chain against a private CA and nothing else.
///
/// Host names are not checked: agents are reached by address and may not
/// have stable DNS names, so trust comes from holding the CA key.
#[derive(Debug)]
struct PinnedCaVerifier {
    roots: Arc<RootCertStore>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinnedCaVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.algorithms.all,
        )?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Parse every certificate in a PEM bundle into a root store.
pub fn parse_ca_bundle(pem: &str, source: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
        let cert = cert.map_err(|e| {
            BuildError::connection(source, format!("invalid CA certificate PEM: {}", e))
        })?;
        roots.add(cert).map_err(|e| {
            BuildError::connection(source, format!("unusable CA certificate: {}", e))
        })?;
    }
    if roots.is_empty() {
        return Err(BuildError::connection(
            source,
            "CA certificate bundle contains no certificates",
        ));
    }
    Ok(roots)
}

/// Build the rustls client config for `trust`, advertising only `h2`.
///
/// `endpoint` is used for error messages.
pub fn tls_client_config(trust: &TrustPolicy, endpoint: &str) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let algorithms = provider.signature_verification_algorithms;
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| BuildError::connection(endpoint, e))?;

    let mut config = match trust {
        TrustPolicy::PublicRoots => {
            let roots = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        TrustPolicy::PinnedCa(pem) => {
            let roots = parse_ca_bundle(pem, endpoint)?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(PinnedCaVerifier {
                    roots: Arc::new(roots),
                    algorithms,
                }))
                .with_no_client_auth()
        }
        TrustPolicy::DevelopmentCa(path) => {
            let pem = std::fs::read_to_string(path).map_err(|e| {
                BuildError::connection(
                    endpoint,
                    format!("cannot read development CA {}: {}", path.display(), e),
                )
            })?;
            let roots = parse_ca_bundle(&pem, endpoint)?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(PinnedCaVerifier {
                    roots: Arc::new(roots),
                    algorithms,
                }))
                .with_no_client_auth()
        }
    };

    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(config)
}
