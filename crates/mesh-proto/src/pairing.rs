//! Envelope of the pairing protocol.
//!
//! Pairing runs over an ephemeral side channel whose whole secret was
//! exchanged out-of-band (for example inside a QR code). The single
//! record each side sends is its real key ring; everything else about the
//! exchange lives in the pairing state machine.

use mesh_crypto::{PublicAddress, PublicIdentity};
use serde::{Deserialize, Serialize};

/// Protocol name advertised during version negotiation.
pub const PROTOCOL: &str = "pairing";

/// The single version of the pairing protocol currently defined.
pub const VERSION: u64 = 1;

/// A record of the pairing protocol; exactly one field is set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct PairingEnvelope {
    /// The sender's real identity and current preferred address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityExchange>,
}

impl PairingEnvelope {
    /// An envelope carrying our real key ring.
    pub fn identity(identity: PublicIdentity, address: PublicAddress) -> Self {
        PairingEnvelope {
            identity: Some(IdentityExchange { identity, address }),
        }
    }
}

/// The real keys revealed during pairing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct IdentityExchange {
    /// The sender's long-term identity key.
    pub identity: PublicIdentity,
    /// The sender's current preferred address key.
    pub address: PublicAddress,
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;
    use mesh_crypto::{SecretAddress, SecretIdentity};

    #[test]
    fn cbor_roundtrip() {
        let env = PairingEnvelope::identity(
            SecretIdentity::generate().public(),
            SecretAddress::generate().public(),
        );
        let mut buf = Vec::new();
        ciborium::into_writer(&env, &mut buf).unwrap();
        let back: PairingEnvelope = ciborium::from_reader(&buf[..]).unwrap();
        assert_eq!(
            back.identity.unwrap().identity,
            env.identity.unwrap().identity
        );
    }
}
