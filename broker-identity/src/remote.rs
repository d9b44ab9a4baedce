//! TLS dialer for the remote verifier.
//!
//! The transport only keeps signatures and credentials away from passive
//! observers. Who the verifier is gets settled by the challenge/signature
//! exchange, so by default the server certificate chain and name are not
//! checked ([`PeerVerification::ConfidentialityOnly`]).

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{self, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info};

use crate::channel::MessageChannel;
use crate::config::DialerConfig;
use crate::error::DialError;

/// CA bundle compiled into the crate.
pub const EMBEDDED_CA_BUNDLE: &[u8] = include_bytes!("../assets/self-signed-ca.cert");

/// Channel to the remote verifier.
pub type RemoteChannel = MessageChannel<TlsStream<TcpStream>>;

/// How much of the verifier's certificate is checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PeerVerification {
    /// Encrypt only. Chain and hostname are not checked; the handshake
    /// signature still is.
    #[default]
    ConfidentialityOnly,
    /// Full WebPKI validation against the CA bundle.
    VerifyAgainstBundle,
}

/// Dials the remote verifier.
#[derive(Debug, Clone)]
pub struct RemoteDialer {
    config: DialerConfig,
}

impl RemoteDialer {
    pub fn new(config: DialerConfig) -> Self {
        Self { config }
    }

    /// Open an encrypted channel to `address` (`host:port`).
    pub async fn connect(&self, address: &str) -> Result<RemoteChannel, DialError> {
        let tls_config = self.tls_config()?;
        let server_name = server_name(address)?;
        let connector = TlsConnector::from(Arc::new(tls_config));

        debug!("Dialing verifier at {}", address);
        let dial = async {
            let tcp = TcpStream::connect(address)
                .await
                .map_err(|source| DialError::Dial {
                    address: address.to_string(),
                    source,
                })?;
            connector
                .connect(server_name, tcp)
                .await
                .map_err(|source| DialError::Handshake {
                    address: address.to_string(),
                    source,
                })
        };

        let timeout = self.config.connect_timeout;
        let result = match tokio::time::timeout(timeout, dial).await {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout {
                address: address.to_string(),
                timeout,
            }),
        };

        match result {
            Ok(stream) => {
                info!("Connected to verifier at {}", address);
                Ok(MessageChannel::new(stream))
            }
            Err(e) => {
                error!("{}", e);
                Err(e)
            }
        }
    }

    fn tls_config(&self) -> Result<ClientConfig, DialError> {
        let bundle = self.config.ca_bundle.as_deref().unwrap_or(EMBEDDED_CA_BUNDLE);
        let roots = load_ca_bundle(bundle)?;

        let provider = Arc::new(crypto::ring::default_provider());
        let algorithms = provider.signature_verification_algorithms;
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?;

        let config = match self.config.verification {
            PeerVerification::VerifyAgainstBundle => {
                builder.with_root_certificates(roots).with_no_client_auth()
            }
            PeerVerification::ConfidentialityOnly => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(HandshakeOnlyVerifier { algorithms }))
                .with_no_client_auth(),
        };
        Ok(config)
    }
}

/// Parse a PEM bundle into a root store. At least one certificate is required.
pub fn load_ca_bundle(pem: &[u8]) -> Result<RootCertStore, DialError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DialError::CertificateLoad(e.to_string()))?;
    if certs.is_empty() {
        return Err(DialError::CertificateLoad(
            "no certificates in bundle".to_string(),
        ));
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| DialError::CertificateLoad(e.to_string()))?;
    }
    Ok(roots)
}

fn server_name(address: &str) -> Result<ServerName<'static>, DialError> {
    let invalid = || DialError::InvalidAddress(address.to_string());

    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    if port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string()).map_err(|_| invalid())
}

/// Accepts any certificate but checks the handshake signature against it.
#[derive(Debug)]
struct HandshakeOnlyVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for HandshakeOnlyVerifier {
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
        crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::ServerConfig;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    /// TLS echo server presenting a throwaway certificate for `names`.
    async fn start_echo_server(names: &[&str]) -> std::net::SocketAddr {
        let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(
            names.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
        )
        .unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let server_config =
            ServerConfig::builder_with_provider(Arc::new(crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_no_client_auth()
                .with_single_cert(vec![cert.der().clone()], key)
                .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(tcp).await else {
                        return;
                    };
                    let mut channel = MessageChannel::new(tls);
                    while let Ok(msg) = channel.recv::<Vec<u8>>().await {
                        if channel.send(&msg).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[test]
    fn test_embedded_bundle_loads() {
        let roots = load_ca_bundle(EMBEDDED_CA_BUNDLE).unwrap();
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn test_server_name_parsing() {
        assert!(server_name("verifier.example:443").is_ok());
        assert!(server_name("127.0.0.1:8443").is_ok());
        assert!(server_name("[::1]:8443").is_ok());
        assert!(matches!(
            server_name("verifier.example"),
            Err(DialError::InvalidAddress(_))
        ));
        assert!(matches!(
            server_name("verifier.example:https"),
            Err(DialError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_ignores_unrelated_cert_and_name() {
        let addr = start_echo_server(&["verifier.example"]).await;
        let dialer = RemoteDialer::new(DialerConfig::default());

        let mut channel = dialer.connect(&addr.to_string()).await.unwrap();
        channel.send(&b"signature".to_vec()).await.unwrap();
        let echoed: Vec<u8> = channel.recv().await.unwrap();
        assert_eq!(echoed, b"signature");
    }

    #[tokio::test]
    async fn test_verify_against_bundle_rejects_unrelated_cert() {
        let addr = start_echo_server(&["localhost"]).await;
        let dialer = RemoteDialer::new(DialerConfig {
            verification: PeerVerification::VerifyAgainstBundle,
            ..DialerConfig::default()
        });

        let result = dialer.connect(&format!("localhost:{}", addr.port())).await;
        assert!(matches!(result, Err(DialError::Handshake { .. })));
    }

    #[tokio::test]
    async fn test_bad_bundle() {
        let dialer = RemoteDialer::new(DialerConfig::default().with_ca_bundle(&b"not a pem"[..]));
        assert!(matches!(
            dialer.connect("127.0.0.1:1").await,
            Err(DialError::CertificateLoad(_))
        ));

        let garbage = b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        let dialer = RemoteDialer::new(DialerConfig::default().with_ca_bundle(&garbage[..]));
        assert!(matches!(
            dialer.connect("127.0.0.1:1").await,
            Err(DialError::CertificateLoad(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = RemoteDialer::new(DialerConfig::default());
        assert!(matches!(
            dialer.connect(&addr.to_string()).await,
            Err(DialError::Dial { .. })
        ));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = RemoteDialer::new(DialerConfig {
            connect_timeout: Duration::from_millis(200),
            ..DialerConfig::default()
        });
        assert!(matches!(
            dialer.connect(&addr.to_string()).await,
            Err(DialError::Timeout { .. })
        ));
        drop(listener);
    }
}
