//! The key ring: a user's local keys plus everything they trust.
//!
//! A [`SecretKeyRing`] bundles the local identity, the ordered list of
//! local addresses (newest last; the last entry is the *preferred*
//! address), the map of trusted remote key rings, and the accesses map
//! recording which peers are currently associated with which local
//! address.
//!
//! Structural invariants, maintained by every mutating method and
//! re-checked when a ring is deserialized:
//!
//!  1. every key of `accesses` names an entry of `addresses`;
//!  2. the union of the access sets equals the key set of `trusted`;
//!  3. every trusted peer appears in exactly one access set;
//!  4. a non-preferred address whose access set empties is retired.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::{Error, Fingerprint, PublicAddress, PublicIdentity, Result, SecretAddress, SecretIdentity};

/// The public keys a peer advertises about themselves: who they are, and
/// where they currently believe they can be reached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct PublicKeyRing {
    /// The peer's long-term identity key.
    pub identity: PublicIdentity,
    /// The peer's current believed address key.
    pub address: PublicAddress,
}

impl PublicKeyRing {
    /// Construct a public key ring from its parts.
    pub fn new(identity: PublicIdentity, address: PublicAddress) -> Self {
        PublicKeyRing { identity, address }
    }
}

/// Serde shape of a [`SecretKeyRing`]; conversion re-checks invariants.
#[derive(Clone, Serialize, Deserialize)]
struct RingData {
    /// Local secret identity.
    identity: SecretIdentity,
    /// Local secret addresses, newest last.
    addresses: Vec<SecretAddress>,
    /// Trusted peers by identity fingerprint.
    trusted: HashMap<Fingerprint, PublicKeyRing>,
    /// Address fingerprint → identity fingerprints bound to it.
    accesses: HashMap<Fingerprint, BTreeSet<Fingerprint>>,
}

/// The outcome of removing a peer from the ring.
#[derive(Debug)]
#[non_exhaustive]
pub struct UntrustOutcome {
    /// The fresh preferred address generated as part of the removal.
    pub new_address: SecretAddress,
    /// Address fingerprints retired because their access set emptied.
    pub retired: Vec<Fingerprint>,
}

/// The outcome of moving a peer to the preferred address pool.
#[derive(Debug)]
#[non_exhaustive]
pub struct MoveOutcome {
    /// Whether the ring changed at all.
    pub moved: bool,
    /// The address fingerprint retired because the move emptied it.
    pub retired: Option<Fingerprint>,
}

/// A user's complete key ring. Persisted as part of the profile.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "RingData", into = "RingData")]
pub struct SecretKeyRing {
    /// Local secret identity. Immutable for the lifetime of a profile.
    identity: SecretIdentity,
    /// Local secret addresses, newest last (the last is preferred).
    addresses: Vec<SecretAddress>,
    /// Trusted peers by identity fingerprint.
    trusted: HashMap<Fingerprint, PublicKeyRing>,
    /// Address fingerprint → identity fingerprints permitted to dial it.
    accesses: HashMap<Fingerprint, BTreeSet<Fingerprint>>,
}

impl SecretKeyRing {
    /// Create a fresh ring with a new identity and one listening address.
    pub fn generate() -> Self {
        let address = SecretAddress::generate();
        let mut accesses = HashMap::new();
        accesses.insert(address.fingerprint(), BTreeSet::new());
        SecretKeyRing {
            identity: SecretIdentity::generate(),
            addresses: vec![address],
            trusted: HashMap::new(),
            accesses,
        }
    }

    /// Return the local secret identity.
    pub fn identity(&self) -> &SecretIdentity {
        &self.identity
    }

    /// Return the local addresses, newest last.
    pub fn addresses(&self) -> &[SecretAddress] {
        &self.addresses
    }

    /// Return the preferred (newest) local address.
    pub fn preferred_address(&self) -> &SecretAddress {
        self.addresses
            .last()
            .expect("key ring invariant: at least one address")
    }

    /// Return the public half of every peer we trust.
    pub fn trusted(&self) -> &HashMap<Fingerprint, PublicKeyRing> {
        &self.trusted
    }

    /// Return the trusted entry for one peer, if any.
    pub fn trusted_peer(&self, fp: &Fingerprint) -> Option<&PublicKeyRing> {
        self.trusted.get(fp)
    }

    /// Return the fingerprint of the local address `fp` currently sits
    /// under, if the peer is trusted.
    pub fn address_of_peer(&self, fp: &Fingerprint) -> Option<Fingerprint> {
        self.accesses
            .iter()
            .find(|(_, set)| set.contains(fp))
            .map(|(addr, _)| *addr)
    }

    /// Return the public key ring we advertise about ourselves.
    pub fn public(&self) -> PublicKeyRing {
        PublicKeyRing {
            identity: self.identity.public(),
            address: self.preferred_address().public(),
        }
    }

    /// Add a peer to the ring, associating them with the preferred
    /// address. Fails if the peer is already present.
    pub fn trust(&mut self, peer: PublicKeyRing) -> Result<()> {
        let fp = peer.identity.fingerprint();
        if self.trusted.contains_key(&fp) {
            return Err(Error::RingInvariant("peer already trusted"));
        }
        let preferred = self.preferred_address().fingerprint();
        self.trusted.insert(fp, peer);
        self.accesses.entry(preferred).or_default().insert(fp);
        Ok(())
    }

    /// Remove a peer from the ring.
    ///
    /// The peer is dropped from `trusted` and from whichever access set it
    /// lived in; a fresh preferred address is generated (so the removed
    /// peer can no longer find us there), and any non-preferred address
    /// whose access set is now empty is retired.
    pub fn untrust(&mut self, fp: &Fingerprint) -> Result<UntrustOutcome> {
        if self.trusted.remove(fp).is_none() {
            return Err(Error::RingInvariant("peer not trusted"));
        }
        for set in self.accesses.values_mut() {
            set.remove(fp);
        }

        let new_address = SecretAddress::generate();
        self.accesses
            .insert(new_address.fingerprint(), BTreeSet::new());
        self.addresses.push(new_address.clone());

        let retired = self.retire_empty();
        Ok(UntrustOutcome {
            new_address,
            retired,
        })
    }

    /// Update the believed address of a trusted peer. Returns true if the
    /// stored address actually changed.
    pub fn update_trusted_address(
        &mut self,
        fp: &Fingerprint,
        address: PublicAddress,
    ) -> Result<bool> {
        let entry = self
            .trusted
            .get_mut(fp)
            .ok_or(Error::RingInvariant("peer not trusted"))?;
        if entry.address == address {
            return Ok(false);
        }
        entry.address = address;
        Ok(true)
    }

    /// Move a peer into the preferred address pool, retiring the address
    /// it came from when that empties a non-preferred set.
    pub fn move_to_preferred(&mut self, fp: &Fingerprint) -> Result<MoveOutcome> {
        if !self.trusted.contains_key(fp) {
            return Err(Error::RingInvariant("peer not trusted"));
        }
        let preferred = self.preferred_address().fingerprint();
        let current = self
            .address_of_peer(fp)
            .ok_or(Error::RingInvariant("trusted peer missing from accesses"))?;
        if current == preferred {
            return Ok(MoveOutcome {
                moved: false,
                retired: None,
            });
        }
        if let Some(set) = self.accesses.get_mut(&current) {
            set.remove(fp);
        }
        self.accesses.entry(preferred).or_default().insert(*fp);
        let retired = self.retire_empty();
        Ok(MoveOutcome {
            moved: true,
            retired: retired.into_iter().next(),
        })
    }

    /// Drop every non-preferred address whose access set is empty,
    /// returning the fingerprints of the addresses retired.
    fn retire_empty(&mut self) -> Vec<Fingerprint> {
        let preferred = self.preferred_address().fingerprint();
        let mut retired = Vec::new();
        let empty: Vec<Fingerprint> = self
            .accesses
            .iter()
            .filter(|(addr, set)| **addr != preferred && set.is_empty())
            .map(|(addr, _)| *addr)
            .collect();
        for addr in empty {
            self.accesses.remove(&addr);
            self.addresses.retain(|a| a.fingerprint() != addr);
            retired.push(addr);
        }
        retired
    }

    /// Check the structural invariants; used on deserialize.
    fn validate(&self) -> Result<()> {
        if self.addresses.is_empty() {
            return Err(Error::RingInvariant("no local addresses"));
        }
        let address_fps: BTreeSet<Fingerprint> =
            self.addresses.iter().map(|a| a.fingerprint()).collect();
        if address_fps.len() != self.addresses.len() {
            return Err(Error::RingInvariant("duplicate local address"));
        }
        for addr in self.accesses.keys() {
            if !address_fps.contains(addr) {
                return Err(Error::RingInvariant("access set for unknown address"));
            }
        }
        let mut seen: BTreeSet<Fingerprint> = BTreeSet::new();
        for set in self.accesses.values() {
            for fp in set {
                if !seen.insert(*fp) {
                    return Err(Error::RingInvariant("peer in two access sets"));
                }
                if !self.trusted.contains_key(fp) {
                    return Err(Error::RingInvariant("access entry for unknown peer"));
                }
            }
        }
        if seen.len() != self.trusted.len() {
            return Err(Error::RingInvariant("trusted peer missing from accesses"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for SecretKeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKeyRing")
            .field("identity", &self.identity.fingerprint())
            .field("addresses", &self.addresses.len())
            .field("trusted", &self.trusted.len())
            .finish_non_exhaustive()
    }
}

impl From<SecretKeyRing> for RingData {
    fn from(ring: SecretKeyRing) -> RingData {
        RingData {
            identity: ring.identity,
            addresses: ring.addresses,
            trusted: ring.trusted,
            accesses: ring.accesses,
        }
    }
}

impl TryFrom<RingData> for SecretKeyRing {
    type Error = Error;
    fn try_from(data: RingData) -> Result<SecretKeyRing> {
        let ring = SecretKeyRing {
            identity: data.identity,
            addresses: data.addresses,
            trusted: data.trusted,
            accesses: data.accesses,
        };
        ring.validate()?;
        Ok(ring)
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;

    /// A peer key ring for testing, derived from a seed byte.
    fn peer(seed: u8) -> PublicKeyRing {
        PublicKeyRing {
            identity: SecretIdentity::from_seed([seed; 32]).public(),
            address: SecretAddress::from_seed([seed.wrapping_add(100); 32]).public(),
        }
    }

    /// Assert the published invariants of `ring` hold.
    fn check_invariants(ring: &SecretKeyRing) {
        ring.validate().unwrap();
    }

    #[test]
    fn fresh_ring() {
        let ring = SecretKeyRing::generate();
        assert_eq!(ring.addresses().len(), 1);
        assert!(ring.trusted().is_empty());
        check_invariants(&ring);
    }

    #[test]
    fn trust_binds_to_preferred() {
        let mut ring = SecretKeyRing::generate();
        let p = peer(1);
        let fp = p.identity.fingerprint();
        ring.trust(p.clone()).unwrap();
        assert!(ring.trust(p).is_err());
        assert_eq!(
            ring.address_of_peer(&fp).unwrap(),
            ring.preferred_address().fingerprint()
        );
        check_invariants(&ring);
    }

    #[test]
    fn untrust_rotates_and_retires() {
        let mut ring = SecretKeyRing::generate();
        let original = ring.preferred_address().fingerprint();
        let a = peer(1);
        let b = peer(2);
        let a_fp = a.identity.fingerprint();
        let b_fp = b.identity.fingerprint();
        ring.trust(a).unwrap();
        ring.trust(b).unwrap();

        // Removing a peer grows a fresh preferred address; the original
        // address survives because b still lives there.
        let outcome = ring.untrust(&a_fp).unwrap();
        assert!(outcome.retired.is_empty());
        assert_eq!(ring.addresses().len(), 2);
        assert_ne!(ring.preferred_address().fingerprint(), original);
        assert_eq!(ring.address_of_peer(&b_fp).unwrap(), original);
        check_invariants(&ring);

        // Removing the last occupant retires the now-empty old address.
        let outcome = ring.untrust(&b_fp).unwrap();
        assert_eq!(outcome.retired, vec![original]);
        assert_eq!(ring.addresses().len(), 2);
        check_invariants(&ring);
    }

    #[test]
    fn untrust_unknown_fails() {
        let mut ring = SecretKeyRing::generate();
        assert!(ring.untrust(&peer(9).identity.fingerprint()).is_err());
    }

    #[test]
    fn move_to_preferred_retires_emptied() {
        let mut ring = SecretKeyRing::generate();
        let original = ring.preferred_address().fingerprint();
        let a = peer(1);
        let b = peer(2);
        let a_fp = a.identity.fingerprint();
        let b_fp = b.identity.fingerprint();
        ring.trust(a).unwrap();
        ring.trust(b).unwrap();
        // Rotation: a is removed, b stays on the original address.
        ring.untrust(&a_fp).unwrap();

        let outcome = ring.move_to_preferred(&b_fp).unwrap();
        assert!(outcome.moved);
        assert_eq!(outcome.retired, Some(original));
        assert_eq!(
            ring.address_of_peer(&b_fp).unwrap(),
            ring.preferred_address().fingerprint()
        );
        check_invariants(&ring);

        // A second move is a no-op.
        let outcome = ring.move_to_preferred(&b_fp).unwrap();
        assert!(!outcome.moved);
        assert!(outcome.retired.is_none());
    }

    #[test]
    fn update_trusted_address() {
        let mut ring = SecretKeyRing::generate();
        let p = peer(1);
        let fp = p.identity.fingerprint();
        ring.trust(p.clone()).unwrap();
        assert!(!ring.update_trusted_address(&fp, p.address).unwrap());
        let other = SecretAddress::from_seed([77; 32]).public();
        assert!(ring.update_trusted_address(&fp, other).unwrap());
        assert_eq!(ring.trusted_peer(&fp).unwrap().address, other);
    }

    #[test]
    fn serde_validates() {
        let mut ring = SecretKeyRing::generate();
        ring.trust(peer(1)).unwrap();
        let json = serde_json::to_string(&ring).unwrap();
        let back: SecretKeyRing = serde_json::from_str(&json).unwrap();
        check_invariants(&back);
        assert_eq!(back.trusted().len(), 1);

        // A ring whose accesses disagree with its trusted map is refused.
        let mut broken: serde_json::Value = serde_json::from_str(&json).unwrap();
        broken["trusted"] = serde_json::json!({});
        assert!(serde_json::from_value::<SecretKeyRing>(broken).is_err());
    }
}
