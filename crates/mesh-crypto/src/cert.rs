//! Deterministic self-signed certificates for mutual TLS.
//!
//! For the most part the overlay doesn't care about X.509 at all: peers are
//! authenticated by the Ed25519 identity key inside the certificate, and
//! everything else is scaffolding that TLS requires. The certificate is
//! derived *deterministically* from the identity seed — serial 0, fixed
//! validity, `localhost` names, and Ed25519's deterministic signature — so
//! that peers can re-derive it offline and a reboot never invalidates an
//! authorization.

use ed25519_dalek::pkcs8::EncodePrivateKey as _;
use ed25519_dalek::Signer as _;
use x509_cert::certificate::{Certificate, TbsCertificate, Version};
use x509_cert::der::asn1::{BitString, GeneralizedTime, Ia5String, OctetString};
use x509_cert::der::{Decode as _, Encode as _};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, ObjectIdentifier, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};

use crate::{Error, PublicIdentity, Result, SecretIdentity};

/// RFC 8410 algorithm identifier of Ed25519.
const ID_ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");

/// RFC 5280 extension identifier of subjectAltName.
const ID_CE_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");

/// NotAfter of every certificate: Unix 31415926535, i.e. deep into the
/// year 2965. Effectively permanent.
const NOT_AFTER_UNIX: u64 = 31_415_926_535;

/// The name carried in both the subject DN and the subject alt name.
const HOSTNAME: &str = "localhost";

/// A DER certificate together with the PKCS#8 key that can answer for it.
///
/// This is the exact shape TLS libraries want to be handed.
#[derive(Clone)]
pub struct CertAndKey {
    /// The self-signed certificate, DER encoded.
    pub certificate_der: Vec<u8>,
    /// The matching private key, PKCS#8 DER encoded.
    pub private_key_der: Vec<u8>,
}

impl std::fmt::Debug for CertAndKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertAndKey")
            .field("certificate_der", &self.certificate_der.len())
            .finish_non_exhaustive()
    }
}

/// The Ed25519 algorithm identifier, used for both the key and the
/// signature. RFC 8410 says the parameters MUST be absent.
fn ed25519_algorithm() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: ID_ED25519,
        parameters: None,
    }
}

impl SecretIdentity {
    /// Derive the deterministic certificate for this identity.
    ///
    /// The same seed always produces byte-identical output.
    pub fn certificate(&self) -> Result<CertAndKey> {
        let signer = self.as_dalek();
        let public = self.public();

        let name: Name = format!("CN={}", HOSTNAME)
            .parse()
            .map_err(Error::Der)?;
        let validity = Validity {
            not_before: Time::GeneralTime(
                GeneralizedTime::from_unix_duration(std::time::Duration::ZERO)
                    .map_err(Error::Der)?,
            ),
            not_after: Time::GeneralTime(
                GeneralizedTime::from_unix_duration(std::time::Duration::from_secs(
                    NOT_AFTER_UNIX,
                ))
                .map_err(Error::Der)?,
            ),
        };
        let spki = SubjectPublicKeyInfoOwned {
            algorithm: ed25519_algorithm(),
            subject_public_key: BitString::from_bytes(public.as_bytes()).map_err(Error::Der)?,
        };
        let san = SubjectAltName(vec![GeneralName::DnsName(
            Ia5String::new(HOSTNAME).map_err(Error::Der)?,
        )]);
        let san_ext = Extension {
            extn_id: ID_CE_SUBJECT_ALT_NAME,
            critical: false,
            extn_value: OctetString::new(san.to_der().map_err(Error::Der)?).map_err(Error::Der)?,
        };

        let tbs = TbsCertificate {
            version: Version::V3,
            serial_number: SerialNumber::new(&[0]).map_err(Error::Der)?,
            signature: ed25519_algorithm(),
            issuer: name.clone(),
            validity,
            subject: name,
            subject_public_key_info: spki,
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: Some(vec![san_ext]),
        };

        let tbs_der = tbs.to_der().map_err(Error::Der)?;
        let signature = signer.sign(&tbs_der);
        let certificate = Certificate {
            tbs_certificate: tbs,
            signature_algorithm: ed25519_algorithm(),
            signature: BitString::from_bytes(&signature.to_bytes()).map_err(Error::Der)?,
        };

        let private_key_der = signer
            .to_pkcs8_der()
            .map_err(|_| Error::InvalidCertificate("pkcs8 encoding failed"))?
            .as_bytes()
            .to_vec();
        Ok(CertAndKey {
            certificate_der: certificate.to_der().map_err(Error::Der)?,
            private_key_der,
        })
    }
}

/// Validate a peer's certificate and extract the identity inside it.
///
/// Checks, in order: the subject key is Ed25519 (any other key type is a
/// handshake failure), the signature algorithm is Ed25519, and the
/// certificate is self-signed by the subject key. Whether the identity is
/// *authorized* is not our business; the peer set decides that.
pub fn verify_peer_certificate(der: &[u8]) -> Result<PublicIdentity> {
    let cert =
        Certificate::from_der(der).map_err(|_| Error::InvalidCertificate("unparseable DER"))?;

    let spki = &cert.tbs_certificate.subject_public_key_info;
    if spki.algorithm.oid != ID_ED25519 {
        return Err(Error::InvalidCertificate("subject key is not Ed25519"));
    }
    let key_bytes = spki
        .subject_public_key
        .as_bytes()
        .ok_or(Error::InvalidCertificate("unaligned subject key"))?;
    let identity = PublicIdentity::from_bytes(key_bytes)?;

    if cert.signature_algorithm.oid != ID_ED25519 {
        return Err(Error::InvalidCertificate("signature is not Ed25519"));
    }
    let tbs_der = cert.tbs_certificate.to_der().map_err(Error::Der)?;
    let sig_bytes = cert
        .signature
        .as_bytes()
        .ok_or(Error::InvalidCertificate("unaligned signature"))?;
    identity
        .verify(&tbs_der, sig_bytes)
        .map_err(|_| Error::InvalidCertificate("self-signature does not verify"))?;

    Ok(identity)
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;

    #[test]
    fn deterministic() {
        let a = SecretIdentity::from_seed([1_u8; 32]).certificate().unwrap();
        let b = SecretIdentity::from_seed([1_u8; 32]).certificate().unwrap();
        assert_eq!(a.certificate_der, b.certificate_der);
        assert_eq!(a.private_key_der, b.private_key_der);

        let c = SecretIdentity::from_seed([2_u8; 32]).certificate().unwrap();
        assert_ne!(a.certificate_der, c.certificate_der);
    }

    #[test]
    fn verify_extracts_identity() {
        let id = SecretIdentity::generate();
        let cert = id.certificate().unwrap();
        let recovered = verify_peer_certificate(&cert.certificate_der).unwrap();
        assert_eq!(recovered.fingerprint(), id.fingerprint());
    }

    #[test]
    fn verify_rejects_tampering() {
        let id = SecretIdentity::from_seed([5_u8; 32]);
        let mut der = id.certificate().unwrap().certificate_der;
        // Parse once to find where the serial lives; easier to just flip a
        // byte in the middle of the TBS region and watch the signature die.
        let mid = der.len() / 2;
        der[mid] ^= 0x01;
        assert!(verify_peer_certificate(&der).is_err());
    }

    #[test]
    fn verify_rejects_garbage() {
        assert!(matches!(
            verify_peer_certificate(b"not a certificate"),
            Err(Error::InvalidCertificate(_))
        ));
    }
}
