//! Encoding of address keys as hidden-service endpoints.
//!
//! An address key maps 1:1 to a v3-style onion address: the base32 form of
//! `pubkey ‖ checksum ‖ version`, where the checksum ties the address to
//! the key and the version byte is `3`. The overlay always talks to the
//! single virtual port 1; the gateway is responsible for resolving the
//! resulting `<base32>.onion:1` string.

use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use sha3::{Digest as _, Sha3_256};

use crate::{Error, Result, KEY_LEN};

/// Prefix fed into the checksum digest, fixed by the address format.
const CHECKSUM_PREFIX: &[u8] = b".onion checksum";

/// Version byte of the address format.
const VERSION: u8 = 3;

/// The single virtual port the overlay listens on.
pub(crate) const VIRTUAL_PORT: u16 = 1;

/// A hidden-service endpoint derived from an address public key.
///
/// This is the value handed to the gateway for dialing, and the value a
/// gateway listener reports itself as.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OnionAddr {
    /// The Ed25519 public key the address is derived from.
    key: [u8; KEY_LEN],
}

impl OnionAddr {
    /// Derive the onion address of an address public key.
    pub(crate) fn from_public_key(key: &[u8; KEY_LEN]) -> Self {
        OnionAddr { key: *key }
    }

    /// Return the public key bytes this address was derived from.
    pub fn public_key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Compute the two checksum bytes for `key`.
    fn checksum(key: &[u8; KEY_LEN]) -> [u8; 2] {
        let mut h = Sha3_256::new();
        h.update(CHECKSUM_PREFIX);
        h.update(key);
        h.update([VERSION]);
        let digest = h.finalize();
        [digest[0], digest[1]]
    }
}

impl Display for OnionAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut raw = [0_u8; KEY_LEN + 3];
        raw[..KEY_LEN].copy_from_slice(&self.key);
        raw[KEY_LEN..KEY_LEN + 2].copy_from_slice(&Self::checksum(&self.key));
        raw[KEY_LEN + 2] = VERSION;
        let b32 = BASE32_NOPAD.encode(&raw).to_ascii_lowercase();
        write!(f, "{}.onion:{}", b32, VIRTUAL_PORT)
    }
}

impl Debug for OnionAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "OnionAddr({})", self)
    }
}

impl FromStr for OnionAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let host = s
            .strip_suffix(&format!(":{}", VIRTUAL_PORT))
            .and_then(|h| h.strip_suffix(".onion"))
            .ok_or(Error::Unparseable("onion address"))?;
        let raw = BASE32_NOPAD
            .decode(host.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::Unparseable("onion address"))?;
        if raw.len() != KEY_LEN + 3 || raw[KEY_LEN + 2] != VERSION {
            return Err(Error::Unparseable("onion address"));
        }
        let mut key = [0_u8; KEY_LEN];
        key.copy_from_slice(&raw[..KEY_LEN]);
        if raw[KEY_LEN..KEY_LEN + 2] != Self::checksum(&key) {
            return Err(Error::Unparseable("onion address"));
        }
        Ok(OnionAddr { key })
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;
    use crate::SecretAddress;

    #[test]
    fn roundtrip() {
        let addr = SecretAddress::from_seed([42_u8; 32]).public().onion();
        let text = addr.to_string();
        assert!(text.ends_with(".onion:1"));
        // 35 bytes of payload encode to 56 base32 characters.
        assert_eq!(text.len(), 56 + ".onion:1".len());
        let parsed: OnionAddr = text.parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn checksum_detects_corruption() {
        let text = SecretAddress::from_seed([42_u8; 32])
            .public()
            .onion()
            .to_string();
        // Flip one character of the key portion.
        let mut bad = text.clone().into_bytes();
        bad[0] = if bad[0] == b'a' { b'b' } else { b'a' };
        let bad = String::from_utf8(bad).unwrap();
        assert!(bad.parse::<OnionAddr>().is_err());
        assert!("gibberish.onion:1".parse::<OnionAddr>().is_err());
        assert!(text.strip_suffix(":1").unwrap().parse::<OnionAddr>().is_err());
    }

    #[test]
    fn deterministic() {
        let a = SecretAddress::from_seed([9_u8; 32]).public().onion();
        let b = SecretAddress::from_seed([9_u8; 32]).public().onion();
        assert_eq!(a.to_string(), b.to_string());
    }
}
