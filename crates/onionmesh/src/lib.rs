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

mod backend;
mod cdn;
mod contact;
mod profile;
mod store;

pub use backend::Backend;
pub use cdn::ContentStore;
pub use contact::Contact;
pub use profile::Profile;
pub use store::{FsStore, MemStore, Store, StoreError};

use std::sync::Arc;

/// An error surfaced by the application core.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An operation needed outbound connectivity while the gateway is
    /// off.
    #[error("Network gateway is disabled")]
    NetworkDisabled,

    /// No profile exists yet.
    #[error("Profile not found")]
    ProfileNotFound,

    /// A profile already exists.
    #[error("Profile already exists")]
    ProfileExists,

    /// No such contact.
    #[error("Contact not found")]
    ContactNotFound,

    /// The contact already exists.
    #[error("Contact already exists")]
    ContactExists,

    /// Attempted to add ourselves as a contact.
    #[error("Cannot add self as contact")]
    SelfContact,

    /// No such event.
    #[error("Event not found")]
    EventNotFound,

    /// We already joined this event.
    #[error("Event already joined")]
    EventAlreadyJoined,

    /// The event has concluded.
    #[error("Event has concluded")]
    EventConcluded,

    /// No checkin is in progress.
    #[error("No checkin in progress")]
    CheckinNotInProgress,

    /// A pairing session is already running.
    #[error("Already pairing")]
    AlreadyPairing,

    /// No pairing session is running.
    #[error("Not pairing")]
    NotPairing,

    /// The proposed infection-status transition is not allowed.
    #[error("Invalid status transition")]
    InvalidTransition,

    /// The operation was cancelled by the caller.
    #[error("Cancelled")]
    ContextCancelled,

    /// Durable storage failed.
    #[error("Storage failure")]
    Store(#[from] StoreError),

    /// The overlay link layer failed.
    #[error("Link failure")]
    Net(#[from] mesh_net::Error),

    /// Record framing on a contact link failed.
    #[error("Protocol transport failure")]
    Proto(#[from] mesh_proto::Error),

    /// The event protocol failed.
    #[error("Event protocol failure")]
    Events(#[from] mesh_events::Error),

    /// The pairing protocol failed.
    #[error("Pairing failure")]
    Pairing(#[from] mesh_pairing::Error),

    /// The gateway failed.
    #[error("Gateway failure")]
    Gateway(#[from] mesh_gateway::Error),

    /// Key material was unusable.
    #[error("Cryptographic failure")]
    Crypto(#[from] mesh_crypto::Error),

    /// Persisted state failed to encode or decode.
    #[error("Corrupt persisted state for {what}")]
    Corrupt {
        /// The record in question.
        what: &'static str,
        /// What went wrong, if decoding produced a cause.
        #[source]
        source: Option<Arc<serde_json::Error>>,
    },

    /// An internal error that should never occur.
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

impl Error {
    /// Wrap a JSON failure for the named record.
    pub(crate) fn corrupt(e: serde_json::Error, what: &'static str) -> Self {
        Error::Corrupt {
            what,
            source: Some(Arc::new(e)),
        }
    }
}

/// Convenience alias used when storing boxed callback errors.
pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A `Result` with this crate's [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Shared handle to a store.
pub type SharedStore = Arc<dyn Store>;
