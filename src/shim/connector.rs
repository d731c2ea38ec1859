//! Creates ext_proc clients for endpoint picker targets.

use std::io;
use std::sync::Arc;

use http::Uri;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tower::service_fn;

use crate::ext_proc_api::external_processor_client::ExternalProcessorClient;

const ALPN_H2: &[u8] = b"h2";

/// Produces a client for a `host:port` target.
///
/// A fresh client is made per request since the target comes from the
/// request headers.
pub trait ExtProcConnector: Send + Sync {
    fn connect(
        &self,
        target: &str,
    ) -> Result<ExternalProcessorClient<Channel>, tonic::transport::Error>;
}

/// How the shim secures its connection to endpoint pickers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickerTls {
    /// TLS without certificate verification. Pickers serve self-signed
    /// certificates.
    #[default]
    SkipVerify,
    /// TLS verified against the webpki roots.
    Verify,
    /// Plaintext HTTP/2.
    Disabled,
}

/// Connects over gRPC.
///
/// Channels are lazy: an unreachable picker surfaces when the stream is
/// opened, not here.
#[derive(Clone)]
pub struct GrpcConnector {
    tls: PickerTls,
    insecure: Arc<ClientConfig>,
}

impl GrpcConnector {
    pub fn new(tls: PickerTls) -> Result<Self, tokio_rustls::rustls::Error> {
        Ok(Self {
            tls,
            insecure: Arc::new(insecure_client_config()?),
        })
    }

    #[cfg(test)]
    pub fn plaintext() -> Self {
        Self::new(PickerTls::Disabled).unwrap()
    }
}

impl ExtProcConnector for GrpcConnector {
    fn connect(
        &self,
        target: &str,
    ) -> Result<ExternalProcessorClient<Channel>, tonic::transport::Error> {
        let channel = match self.tls {
            PickerTls::Disabled => {
                Endpoint::from_shared(format!("http://{}", target))?.connect_lazy()
            }
            PickerTls::Verify => Endpoint::from_shared(format!("https://{}", target))?
                .tls_config(ClientTlsConfig::new().with_webpki_roots())?
                .connect_lazy(),
            PickerTls::SkipVerify => {
                // The channel stays plain HTTP/2; TLS is done by the connector.
                let config = Arc::clone(&self.insecure);
                Endpoint::from_shared(format!("http://{}", target))?.connect_with_connector_lazy(
                    service_fn(move |uri: Uri| connect_insecure(Arc::clone(&config), uri)),
                )
            }
        };
        Ok(ExternalProcessorClient::new(channel))
    }
}

async fn connect_insecure(
    config: Arc<ClientConfig>,
    uri: Uri,
) -> io::Result<TokioIo<tokio_rustls::client::TlsStream<TcpStream>>> {
    let host = uri
        .host()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no host"))?;
    let port = uri.port_u16().unwrap_or(443);
    let server_name = ServerName::try_from(host.as_str())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
        .to_owned();

    let tcp = TcpStream::connect((host.as_str(), port)).await?;
    let tls = TlsConnector::from(config).connect(server_name, tcp).await?;
    Ok(TokioIo::new(tls))
}

fn insecure_client_config() -> Result<ClientConfig, tokio_rustls::rustls::Error> {
    let provider = Arc::new(crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
        .with_no_client_auth();
    config.alpn_protocols.push(ALPN_H2.into());
    Ok(config)
}

/// Accepts any server certificate while still checking handshake
/// signatures.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
