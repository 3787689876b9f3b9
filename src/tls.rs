use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    CryptoProvider, WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme, SupportedProtocolVersion};
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "tls1.0")]
    Tls10,
    #[serde(rename = "tls1.1")]
    Tls11,
    #[serde(rename = "tls1.2")]
    Tls12,
    #[serde(rename = "tls1.3")]
    Tls13,
}

/// Client certificate presented during the handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientIdentity {
    Pem {
        cert_chain_path: PathBuf,
        private_key_path: PathBuf,
    },
    /// Not supported by the rustls backend; rejected when the client is built.
    Pkcs12 { path: PathBuf, password: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// Accept any server certificate. Handshake signatures are still checked.
    pub skip_verify: bool,
    pub min_version: TlsVersion,
    pub max_version: TlsVersion,
    pub client_identity: Option<ClientIdentity>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            skip_verify: true,
            min_version: TlsVersion::Tls10,
            max_version: TlsVersion::Tls13,
            client_identity: None,
        }
    }
}

/// rustls only speaks TLS 1.2 and 1.3; older minimums select 1.2 as the floor.
fn protocol_versions(tls_options: &TlsOptions) -> Vec<&'static SupportedProtocolVersion> {
    let mut versions = Vec::new();
    let accepts = |version: TlsVersion| {
        tls_options.min_version <= version && version <= tls_options.max_version
    };
    if accepts(TlsVersion::Tls13) {
        versions.push(&rustls::version::TLS13);
    }
    if accepts(TlsVersion::Tls12) {
        versions.push(&rustls::version::TLS12);
    }
    versions
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn tls_config_error(message: impl Into<String>) -> Error {
    Error::configuration(format!("tls: {}", message.into()))
}

fn read_pem_file(path: &Path, what: &str) -> Result<Vec<u8>, Error> {
    std::fs::read(path)
        .map_err(|source| tls_config_error(format!("failed to read {what} {}: {source}", path.display())))
}

pub(crate) fn build_rustls_tls_config(tls_options: &TlsOptions) -> Result<rustls::ClientConfig, Error> {
    let versions = protocol_versions(tls_options);
    if versions.is_empty() {
        return Err(tls_config_error(format!(
            "no supported protocol version between {:?} and {:?}",
            tls_options.min_version, tls_options.max_version
        )));
    }

    let provider: Arc<CryptoProvider> = Arc::new(rustls::crypto::ring::default_provider());
    let algorithms = provider.signature_verification_algorithms;
    let wants_verifier = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&versions)
        .map_err(|source| tls_config_error(source.to_string()))?;

    let config_builder = if tls_options.skip_verify {
        wants_verifier
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { algorithms }))
    } else {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        wants_verifier.with_root_certificates(root_store)
    };

    match &tls_options.client_identity {
        None => Ok(config_builder.with_no_client_auth()),
        Some(ClientIdentity::Pem {
            cert_chain_path,
            private_key_path,
        }) => {
            let cert_chain_pem = read_pem_file(cert_chain_path, "client certificate chain")?;
            let private_key_pem = read_pem_file(private_key_path, "client private key")?;

            let mut cert_chain = Vec::new();
            for item in CertificateDer::pem_slice_iter(&cert_chain_pem) {
                let certificate = item.map_err(|source| {
                    tls_config_error(format!("failed to parse client certificate chain PEM: {source}"))
                })?;
                cert_chain.push(certificate);
            }
            if cert_chain.is_empty() {
                return Err(tls_config_error(
                    "client certificate chain PEM is empty or invalid",
                ));
            }
            let private_key = PrivateKeyDer::from_pem_slice(&private_key_pem).map_err(|source| {
                tls_config_error(format!("failed to parse client private key PEM: {source}"))
            })?;
            config_builder
                .with_client_auth_cert(cert_chain, private_key)
                .map_err(|source| {
                    tls_config_error(format!("failed to configure client identity: {source}"))
                })
        }
        Some(ClientIdentity::Pkcs12 { path, .. }) => Err(tls_config_error(format!(
            "PKCS#12 identity {} is unsupported by the rustls backend; use a PEM cert+key",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{ClientIdentity, TlsOptions, TlsVersion, build_rustls_tls_config, protocol_versions};
    use crate::error::Error;

    #[test]
    fn default_range_enables_tls12_and_tls13() {
        let versions = protocol_versions(&TlsOptions::default());
        assert_eq!(versions.len(), 2);
        build_rustls_tls_config(&TlsOptions::default()).expect("default tls config should build");
    }

    #[test]
    fn tls13_only_range() {
        let options = TlsOptions {
            min_version: TlsVersion::Tls13,
            ..TlsOptions::default()
        };
        let versions = protocol_versions(&options);
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, rustls::ProtocolVersion::TLSv1_3);
    }

    #[test]
    fn range_without_supported_versions_is_rejected() {
        let options = TlsOptions {
            min_version: TlsVersion::Tls10,
            max_version: TlsVersion::Tls11,
            ..TlsOptions::default()
        };
        match build_rustls_tls_config(&options) {
            Err(Error::Configuration { message }) => assert!(message.contains("protocol version")),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn verifying_config_builds_with_webpki_roots() {
        let options = TlsOptions {
            skip_verify: false,
            ..TlsOptions::default()
        };
        build_rustls_tls_config(&options).expect("verifying tls config should build");
    }

    #[test]
    fn pkcs12_identity_is_unsupported() {
        let options = TlsOptions {
            client_identity: Some(ClientIdentity::Pkcs12 {
                path: PathBuf::from("client.p12"),
                password: "secret".to_owned(),
            }),
            ..TlsOptions::default()
        };
        match build_rustls_tls_config(&options) {
            Err(Error::Configuration { message }) => assert!(message.contains("PKCS#12")),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_pem_files_are_configuration_errors() {
        let options = TlsOptions {
            client_identity: Some(ClientIdentity::Pem {
                cert_chain_path: PathBuf::from("/nonexistent/client.crt"),
                private_key_path: PathBuf::from("/nonexistent/client.key"),
            }),
            ..TlsOptions::default()
        };
        match build_rustls_tls_config(&options) {
            Err(Error::Configuration { message }) => assert!(message.contains("client certificate chain")),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
