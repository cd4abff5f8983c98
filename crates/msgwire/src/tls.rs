//! TLS plumbing: identities and rustls configuration.
//!
//! Every connection is carried inside TLS 1.3. The server presents a
//! certificate; the client by default accepts any certificate (peer
//! verification is the application's choice, not the transport's) and
//! switches to callback-decides verification when the application
//! installs one via `Client::set_verify_callback`.

use crate::error::Error;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::fmt;
use std::sync::Arc;

/// Decides whether a presented server certificate is acceptable.
pub type VerifyCallback = dyn Fn(&CertificateDer<'_>) -> bool + Send + Sync;

/// A server's TLS identity: certificate chain plus private key.
pub struct Identity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Identity {
    /// Generates a fresh private key and matching self-signed
    /// certificate for the given subject alternative names.
    pub fn self_signed<I, S>(subject_alt_names: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = subject_alt_names.into_iter().map(Into::into).collect();
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(names).map_err(|e| Error::Identity(e.to_string()))?;
        Ok(Self {
            cert_chain: vec![cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        })
    }

    /// Like [`self_signed`](Self::self_signed), but returns the identity
    /// as a `(certificate, key)` PEM pair instead. Useful for writing out
    /// test fixtures or demo credentials.
    pub fn self_signed_pem<I, S>(subject_alt_names: I) -> Result<(String, String), Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = subject_alt_names.into_iter().map(Into::into).collect();
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(names).map_err(|e| Error::Identity(e.to_string()))?;
        Ok((cert.pem(), key_pair.serialize_pem()))
    }

    /// Loads an identity from PEM-encoded certificate chain and private
    /// key strings.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, Error> {
        let cert_chain = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::Io)?;
        if cert_chain.is_empty() {
            return Err(Error::Identity("no certificates in PEM input".to_string()));
        }
        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(Error::Io)?
            .ok_or_else(|| Error::Identity("no private key in PEM input".to_string()))?;
        Ok(Self { cert_chain, key })
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Builds the server-side rustls configuration: TLS 1.3 only, no client
/// authentication, single certificate.
pub(crate) fn server_config(identity: &Identity) -> Result<Arc<ServerConfig>, Error> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(identity.cert_chain.clone(), identity.key.clone_key())?;
    Ok(Arc::new(config))
}

/// Builds the client-side rustls configuration: TLS 1.3 only. Without a
/// callback any server certificate is accepted; with one, the callback
/// decides.
pub(crate) fn client_config(verify: Option<Arc<VerifyCallback>>) -> Result<ClientConfig, Error> {
    let supported = provider().signature_verification_algorithms;
    let verifier: Arc<dyn ServerCertVerifier> = match verify {
        Some(callback) => Arc::new(CallbackVerifier {
            callback,
            supported,
        }),
        None => Arc::new(AcceptAnyCert { supported }),
    };
    let config = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(config)
}

/// The default client verifier: trusts any presented certificate, while
/// still checking handshake signatures so the session is bound to the
/// presented key.
struct AcceptAnyCert {
    supported: WebPkiSupportedAlgorithms,
}

impl fmt::Debug for AcceptAnyCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AcceptAnyCert")
    }
}

impl ServerCertVerifier for AcceptAnyCert {
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

/// A verifier that delegates the accept/reject decision to an
/// application callback.
struct CallbackVerifier {
    callback: Arc<VerifyCallback>,
    supported: WebPkiSupportedAlgorithms,
}

impl fmt::Debug for CallbackVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallbackVerifier")
    }
}

impl ServerCertVerifier for CallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if (self.callback)(end_entity) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}
