//! rustls-based TLS connector.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector as TokioTlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::TlsError;
use crate::wrapper::TlsPreloginWrapper;

/// TLS connector for TDS sessions.
pub struct TlsConnector {
    inner: TokioTlsConnector,
}

impl TlsConnector {
    /// Create a connector.
    ///
    /// With `trust_server_certificate` set, certificate and hostname
    /// validation are skipped entirely. That is only acceptable for
    /// development against servers with self-signed certificates and is
    /// logged as a warning.
    pub fn new(trust_server_certificate: bool) -> Result<Self, TlsError> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if trust_server_certificate {
            tracing::warn!("server certificate validation disabled");
            let provider = rustls::crypto::CryptoProvider::get_default()
                .ok_or_else(|| TlsError::Configuration("no crypto provider installed".into()))?
                .clone();
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }));
        }

        Ok(Self {
            inner: TokioTlsConnector::from(Arc::new(config)),
        })
    }

    /// Perform a TLS handshake over the given stream.
    pub async fn connect<S>(&self, stream: S, server_name: &str) -> Result<TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let dns_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;

        tracing::debug!(server_name, "performing TLS handshake");

        self.inner
            .connect(dns_name, stream)
            .await
            .map_err(|e| TlsError::HandshakeFailed(e.to_string()))
    }

    /// Perform the TDS 7.x tunneled handshake: handshake records travel in
    /// PRELOGIN packets, and the wrapper becomes a pass-through once the
    /// session is secure.
    pub async fn connect_tunneled<S>(
        &self,
        stream: S,
        server_name: &str,
    ) -> Result<TlsStream<TlsPreloginWrapper<S>>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let wrapped = TlsPreloginWrapper::new(stream);
        let mut tls_stream = self.connect(wrapped, server_name).await?;

        let (io, _session) = tls_stream.get_mut();
        io.handshake_complete();

        tracing::debug!("tunneled TLS handshake completed");
        Ok(tls_stream)
    }
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector").finish_non_exhaustive()
    }
}

/// Development-only verifier accepting any server certificate.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
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
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_connector_builds() {
        assert!(TlsConnector::new(false).is_ok());
    }

    #[test]
    fn trusting_connector_builds() {
        assert!(TlsConnector::new(true).is_ok());
    }
}
