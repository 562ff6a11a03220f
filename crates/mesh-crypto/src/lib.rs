#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list @@
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
//! <!-- @@ end lint list @@ -->

mod cert;
mod keys;
mod onion;
mod ring;

pub use cert::{verify_peer_certificate, CertAndKey};
pub use keys::{
    Fingerprint, PublicAddress, PublicIdentity, SecretAddress, SecretIdentity, KEY_LEN,
    SIGNATURE_LEN,
};
pub use onion::OnionAddr;
pub use ring::{PublicKeyRing, SecretKeyRing};

use thiserror::Error;

/// An error produced while handling key material.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// A byte string did not have the length required for its key type.
    #[error("Invalid length for {role}: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// What the bytes were supposed to be.
        role: &'static str,
        /// The required length.
        expected: usize,
        /// The length we actually received.
        got: usize,
    },

    /// A byte string was not a valid Ed25519 public key.
    #[error("Malformed Ed25519 public key")]
    MalformedKey,

    /// A signature did not verify against the expected key and message.
    #[error("Bad signature")]
    BadSignature,

    /// A certificate was structurally invalid, used a non-Ed25519 key, or
    /// was not properly self-signed.
    #[error("Invalid peer certificate: {0}")]
    InvalidCertificate(&'static str),

    /// A textual fingerprint or onion address failed to parse.
    #[error("Unparseable {0}")]
    Unparseable(&'static str),

    /// A key ring violated one of its structural invariants.
    #[error("Key ring invariant violated: {0}")]
    RingInvariant(&'static str),

    /// DER encoding or decoding failed while building a certificate.
    #[error("DER error while handling certificate")]
    Der(#[source] x509_cert::der::Error),
}

/// A `Result` with this crate's [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;
