//! Ed25519 key wrappers used throughout the overlay.
//!
//! We define a separate wrapper for each role a key can have, as a safety
//! net against confusing one kind of key for another: an *identity* key
//! authenticates a user, while an *address* key only ever names a listening
//! endpoint. Without a system like this it gets pretty hard to make sure
//! that each key is used only in the right way.

use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use base64ct::{Base64UrlUnpadded, Encoding as _};
use ed25519_dalek::{Signer as _, Verifier as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{Bytes, DeserializeAs as _, SerializeAs as _};
use sha3::{Digest as _, Sha3_256};
use subtle::ConstantTimeEq as _;

use crate::{Error, Result};

/// The length of an Ed25519 key (secret seed or public key), in bytes.
pub const KEY_LEN: usize = 32;

/// The length of an Ed25519 signature, in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// A fingerprint: the SHA3-256 digest of a public key, displayed as
/// unpadded base64url.
///
/// Fingerprints are how peers are named everywhere in the overlay: in the
/// key ring, in the peer set's authorization map, and in log messages.
/// Comparisons are constant-time.
#[derive(Clone, Copy)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint of a public key's byte representation.
    pub(crate) fn of(public_key: &[u8]) -> Self {
        let mut h = Sha3_256::new();
        h.update(public_key);
        Fingerprint(h.finalize().into())
    }

    /// Return the raw digest bytes of this fingerprint.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}
impl Eq for Fingerprint {}

impl Hash for Fingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl PartialOrd for Fingerprint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Fingerprint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Base64UrlUnpadded::encode_string(&self.0))
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl FromStr for Fingerprint {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let mut buf = [0_u8; 32];
        let decoded = Base64UrlUnpadded::decode(s, &mut buf)
            .map_err(|_| Error::Unparseable("fingerprint"))?;
        if decoded.len() != 32 {
            return Err(Error::Unparseable("fingerprint"));
        }
        Ok(Fingerprint(buf))
    }
}

// Fingerprints appear as map keys in persisted state, so they serialize as
// strings rather than byte arrays.
impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The public half of a user's long-term identity key.
///
/// Presented inside a peer's deterministic TLS certificate, and used to
/// verify the signed records of the event protocol.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicIdentity(ed25519_dalek::VerifyingKey);

impl PublicIdentity {
    /// Reconstruct a public identity from its 32-byte representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| Error::InvalidLength {
            role: "public identity",
            expected: KEY_LEN,
            got: bytes.len(),
        })?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&arr).map_err(|_| Error::MalformedKey)?;
        Ok(PublicIdentity(key))
    }

    /// Return the 32-byte representation of this key.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        self.0.as_bytes()
    }

    /// Return the fingerprint naming this identity.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.0.as_bytes())
    }

    /// Verify `signature` over `message` against this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let sig: [u8; SIGNATURE_LEN] =
            signature.try_into().map_err(|_| Error::InvalidLength {
                role: "signature",
                expected: SIGNATURE_LEN,
                got: signature.len(),
            })?;
        let sig = ed25519_dalek::Signature::from_bytes(&sig);
        self.0.verify(message, &sig).map_err(|_| Error::BadSignature)
    }

    /// Return the underlying dalek key.
    pub(crate) fn as_dalek(&self) -> &ed25519_dalek::VerifyingKey {
        &self.0
    }
}

impl Debug for PublicIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PublicIdentity({})", self.fingerprint())
    }
}

impl Serialize for PublicIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        Bytes::serialize_as(self.0.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for PublicIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes: [u8; KEY_LEN] = Bytes::deserialize_as(deserializer)?;
        PublicIdentity::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// The secret half of a user's long-term identity key.
///
/// This is the key a deterministic TLS certificate is derived from; it also
/// signs event check-ins and infection reports.
#[derive(Clone)]
pub struct SecretIdentity(ed25519_dalek::SigningKey);

impl SecretIdentity {
    /// Generate a fresh identity from the thread RNG.
    pub fn generate() -> Self {
        let seed: [u8; KEY_LEN] = rand::random();
        SecretIdentity(ed25519_dalek::SigningKey::from_bytes(&seed))
    }

    /// Reconstruct an identity from its 32-byte secret seed.
    pub fn from_seed(seed: [u8; KEY_LEN]) -> Self {
        SecretIdentity(ed25519_dalek::SigningKey::from_bytes(&seed))
    }

    /// Return the 32-byte secret seed.
    pub fn seed(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }

    /// Return the public half of this identity.
    pub fn public(&self) -> PublicIdentity {
        PublicIdentity(self.0.verifying_key())
    }

    /// Return the fingerprint of the public half.
    pub fn fingerprint(&self) -> Fingerprint {
        self.public().fingerprint()
    }

    /// Sign `message` with this identity, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.0.sign(message).to_bytes()
    }

    /// Return the underlying dalek key.
    pub(crate) fn as_dalek(&self) -> &ed25519_dalek::SigningKey {
        &self.0
    }
}

impl Debug for SecretIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Never log the seed.
        write!(f, "SecretIdentity({})", self.fingerprint())
    }
}

impl PartialEq for SecretIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bytes().ct_eq(&other.0.to_bytes()).into()
    }
}
impl Eq for SecretIdentity {}

impl Serialize for SecretIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        Bytes::serialize_as(&self.0.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for SecretIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let seed: [u8; KEY_LEN] = Bytes::deserialize_as(deserializer)?;
        Ok(SecretIdentity::from_seed(seed))
    }
}

/// The public half of an address key.
///
/// An address key maps 1:1 to a hidden-service endpoint on the anonymizing
/// network; its public form is what peers dial.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicAddress(ed25519_dalek::VerifyingKey);

impl PublicAddress {
    /// Reconstruct a public address from its 32-byte representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| Error::InvalidLength {
            role: "public address",
            expected: KEY_LEN,
            got: bytes.len(),
        })?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&arr).map_err(|_| Error::MalformedKey)?;
        Ok(PublicAddress(key))
    }

    /// Return the 32-byte representation of this key.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        self.0.as_bytes()
    }

    /// Return the fingerprint naming this address.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.0.as_bytes())
    }

    /// Return the onion form of this address, as the gateway dials it.
    pub fn onion(&self) -> crate::OnionAddr {
        crate::OnionAddr::from_public_key(self.0.as_bytes())
    }
}

impl Debug for PublicAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PublicAddress({})", self.fingerprint())
    }
}

impl Serialize for PublicAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        Bytes::serialize_as(self.0.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for PublicAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bytes: [u8; KEY_LEN] = Bytes::deserialize_as(deserializer)?;
        PublicAddress::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// The secret half of an address key.
///
/// Whoever holds this can listen at the corresponding hidden address.
#[derive(Clone)]
pub struct SecretAddress(ed25519_dalek::SigningKey);

impl SecretAddress {
    /// Generate a fresh address from the thread RNG.
    pub fn generate() -> Self {
        let seed: [u8; KEY_LEN] = rand::random();
        SecretAddress(ed25519_dalek::SigningKey::from_bytes(&seed))
    }

    /// Reconstruct an address from its 32-byte secret seed.
    pub fn from_seed(seed: [u8; KEY_LEN]) -> Self {
        SecretAddress(ed25519_dalek::SigningKey::from_bytes(&seed))
    }

    /// Return the 32-byte secret seed.
    pub fn seed(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }

    /// Return the public half of this address.
    pub fn public(&self) -> PublicAddress {
        PublicAddress(self.0.verifying_key())
    }

    /// Return the fingerprint of the public half.
    pub fn fingerprint(&self) -> Fingerprint {
        self.public().fingerprint()
    }
}

impl Debug for SecretAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Never log the seed.
        write!(f, "SecretAddress({})", self.fingerprint())
    }
}

impl PartialEq for SecretAddress {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bytes().ct_eq(&other.0.to_bytes()).into()
    }
}
impl Eq for SecretAddress {}

impl Serialize for SecretAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        Bytes::serialize_as(&self.0.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for SecretAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let seed: [u8; KEY_LEN] = Bytes::deserialize_as(deserializer)?;
        Ok(SecretAddress::from_seed(seed))
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;

    #[test]
    fn fingerprint_roundtrip() {
        let id = SecretIdentity::from_seed([7_u8; 32]);
        let fp = id.fingerprint();
        let text = fp.to_string();
        // base64url of 32 bytes, unpadded.
        assert_eq!(text.len(), 43);
        let parsed: Fingerprint = text.parse().unwrap();
        assert_eq!(parsed, fp);
    }

    #[test]
    fn fingerprint_rejects_garbage() {
        assert!("not base64!!".parse::<Fingerprint>().is_err());
        // Too short.
        assert!("AAAA".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn identity_and_address_are_distinct_namespaces() {
        let seed = [3_u8; 32];
        let id = SecretIdentity::from_seed(seed);
        let addr = SecretAddress::from_seed(seed);
        // Same seed, same curve point, but the types stay apart; the
        // fingerprints agree because the public bytes agree.
        assert_eq!(id.public().as_bytes(), addr.public().as_bytes());
        assert_eq!(id.fingerprint(), addr.fingerprint());
    }

    #[test]
    fn sign_and_verify() {
        let id = SecretIdentity::generate();
        let sig = id.sign(b"hello onion");
        assert!(id.public().verify(b"hello onion", &sig).is_ok());
        assert!(id.public().verify(b"hello union", &sig).is_err());
        assert!(matches!(
            id.public().verify(b"hello onion", &sig[..63]),
            Err(Error::InvalidLength { .. })
        ));
    }

    #[test]
    fn serde_seed_roundtrip() {
        let id = SecretIdentity::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: SecretIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        let addr = SecretAddress::generate();
        let json = serde_json::to_string(&addr.public()).unwrap();
        let back: PublicAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr.public());
    }
}
