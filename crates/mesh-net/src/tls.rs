//! Mutual TLS on top of gateway streams.
//!
//! Both sides of every link present the deterministic self-signed
//! certificate derived from their identity seed. The verifiers here check
//! *structure* only: the certificate must carry an Ed25519 key and be
//! correctly self-signed, and any other key type fails the handshake.
//! Whether the identity inside is *authorized* is decided afterwards by
//! the peer set, which sees the identity this module extracts.

use std::sync::Arc;

use mesh_crypto::{verify_peer_certificate, CertAndKey, PublicIdentity, SecretIdentity};
use mesh_gateway::GatewayStream;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{Error, Result};

/// Validate a TLS signature made by the key inside `cert`.
///
/// Used for the handshake's CertificateVerify step on both sides.
fn verify_handshake_signature(
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    if dss.scheme != SignatureScheme::ED25519 {
        return Err(rustls::Error::PeerIncompatible(
            rustls::PeerIncompatible::NoSignatureSchemesInCommon,
        ));
    }
    let identity = verify_peer_certificate(cert.as_ref())
        .map_err(|_| bad_certificate())?;
    identity
        .verify(message, dss.signature())
        .map_err(|_| rustls::Error::InvalidCertificate(rustls::CertificateError::BadSignature))?;
    Ok(HandshakeSignatureValid::assertion())
}

/// The rustls error we map every structural certificate failure to.
fn bad_certificate() -> rustls::Error {
    rustls::Error::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure)
}

/// Server-side verifier: requires a client certificate and checks it
/// structurally.
#[derive(Debug)]
struct RequireStructuralClientCert;

impl ClientCertVerifier for RequireStructuralClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let _: PublicIdentity =
            verify_peer_certificate(end_entity.as_ref()).map_err(|_| bad_certificate())?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        // The overlay is TLS 1.3 only.
        Err(rustls::Error::PeerIncompatible(
            rustls::PeerIncompatible::Tls12NotOffered,
        ))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_handshake_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}

/// Client-side verifier: checks the server certificate structurally,
/// ignoring the server name (hidden addresses have no meaningful DNS
/// identity; the name in the certificate is always `localhost`).
#[derive(Debug)]
struct StructuralServerCert;

impl ServerCertVerifier for StructuralServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let _: PublicIdentity =
            verify_peer_certificate(end_entity.as_ref()).map_err(|_| bad_certificate())?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::PeerIncompatible(
            rustls::PeerIncompatible::Tls12NotOffered,
        ))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_handshake_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![SignatureScheme::ED25519]
    }
}

/// Turn a [`CertAndKey`] into the shapes rustls wants.
fn split_cert(cert: &CertAndKey) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let chain = vec![CertificateDer::from(cert.certificate_der.clone())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.private_key_der.clone()));
    (chain, key)
}

/// Build the acceptor for inbound links, presenting `identity` and
/// requiring a structurally valid client certificate.
pub(crate) fn acceptor(identity: &SecretIdentity) -> Result<TlsAcceptor> {
    let cert = identity.certificate()?;
    let (chain, key) = split_cert(&cert);
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::tls("server config", e))?
        .with_client_cert_verifier(Arc::new(RequireStructuralClientCert))
        .with_single_cert(chain, key)
        .map_err(|e| Error::tls("server certificate", e))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the connector for outbound links, presenting `identity`.
pub(crate) fn connector(identity: &SecretIdentity) -> Result<TlsConnector> {
    let cert = identity.certificate()?;
    let (chain, key) = split_cert(&cert);
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::tls("client config", e))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(StructuralServerCert))
        .with_client_auth_cert(chain, key)
        .map_err(|e| Error::tls("client certificate", e))?;
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accept one inbound TLS handshake, returning the authenticated client
/// identity and the wrapped stream.
pub(crate) async fn accept(
    acceptor: &TlsAcceptor,
    stream: GatewayStream,
) -> Result<(PublicIdentity, GatewayStream)> {
    let tls = acceptor
        .accept(stream)
        .await
        .map_err(|e| Error::Io(Arc::new(e)))?;
    let identity = peer_identity(tls.get_ref().1.peer_certificates())?;
    Ok((identity, Box::new(tls)))
}

/// An outbound mTLS dialer bound to one local identity.
///
/// The dialer wraps a gateway stream in TLS, presenting our deterministic
/// certificate and structurally validating the server's. It is cheap to
/// clone and reusable across connections.
#[derive(Clone)]
pub struct Dialer {
    /// The configured TLS connector.
    connector: TlsConnector,
}

impl Dialer {
    /// Build a dialer presenting `identity`.
    pub fn new(identity: &SecretIdentity) -> Result<Self> {
        Ok(Dialer {
            connector: connector(identity)?,
        })
    }

    /// Run the TLS handshake over `stream`, returning the authenticated
    /// server identity and the wrapped stream.
    pub async fn connect(&self, stream: GatewayStream) -> Result<(PublicIdentity, GatewayStream)> {
        let name = ServerName::try_from("localhost").map_err(|_| {
            Error::tls(
                "server name",
                rustls::Error::General("invalid server name".into()),
            )
        })?;
        let tls = self
            .connector
            .connect(name, stream)
            .await
            .map_err(|e| Error::Io(Arc::new(e)))?;
        let identity = peer_identity(tls.get_ref().1.peer_certificates())?;
        Ok((identity, Box::new(tls)))
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer").finish_non_exhaustive()
    }
}

/// Extract and re-verify the peer identity after a finished handshake.
fn peer_identity(certs: Option<&[CertificateDer<'_>]>) -> Result<PublicIdentity> {
    let cert = certs
        .and_then(|c| c.first())
        .ok_or_else(|| Error::tls("peer certificate", rustls::Error::NoCertificatesPresented))?;
    Ok(verify_peer_certificate(cert.as_ref())?)
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;

    /// Boxed duplex pair standing in for two gateway streams.
    fn stream_pair() -> (GatewayStream, GatewayStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }

    #[tokio::test]
    async fn mutual_authentication() {
        let server_id = SecretIdentity::generate();
        let client_id = SecretIdentity::generate();
        let acc = acceptor(&server_id).unwrap();
        let dialer = Dialer::new(&client_id).unwrap();
        let (a, b) = stream_pair();

        let (server_res, client_res) = tokio::join!(accept(&acc, a), dialer.connect(b));
        let (seen_client, _stream) = server_res.unwrap();
        let (seen_server, _stream) = client_res.unwrap();
        assert_eq!(seen_client.fingerprint(), client_id.fingerprint());
        assert_eq!(seen_server.fingerprint(), server_id.fingerprint());
    }

    #[tokio::test]
    async fn data_flows_after_handshake() {
        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

        let server_id = SecretIdentity::generate();
        let client_id = SecretIdentity::generate();
        let acc = acceptor(&server_id).unwrap();
        let dialer = Dialer::new(&client_id).unwrap();
        let (a, b) = stream_pair();

        let server = tokio::spawn(async move {
            let (_id, mut stream) = accept(&acc, a).await.unwrap();
            let mut buf = [0_u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").await.unwrap();
        });
        let (_id, mut stream) = dialer.connect(b).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0_u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
        server.await.unwrap();
    }
}
