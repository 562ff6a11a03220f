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

mod client;
mod hosted;
mod joined;
mod server;

pub use client::{EventClient, EventGuest, GuestProfile};
pub use hosted::HostedEvent;
pub use joined::JoinedEvent;
pub use server::{CheckinCredential, CheckinSession, EventHost, EventServer};

use std::time::Duration;

use mesh_proto::event::InfectionStatus;

/// How often a guest rechecks an event's statistics.
pub const STATS_RECHECK: Duration = Duration::from_secs(6 * 60 * 60);

/// How often a guest retries delivering a pending infection report.
pub const REPORT_RETRY: Duration = Duration::from_secs(30 * 60);

/// How long after its end an event keeps running (and can be synced).
pub const MAINTENANCE_PERIOD: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// How long after its end an event record is retained at all.
pub const ARCHIVE_PERIOD: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Idle timeout applied to established event links.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for the checkin exchange: a single timeout covers each
/// side's whole record exchange, the same way the version-negotiation
/// handshake is bounded.
pub const CHECKIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Whether a participant may move from `old` to `new`.
///
/// Rejected: repeating the current status, moving to `unknown`, and any
/// move away from the terminal `negative`/`positive`. Everything else is
/// allowed, so statuses make monotone progress and eventually stabilize.
pub fn valid_transition(old: InfectionStatus, new: InfectionStatus) -> bool {
    if new == old || new == InfectionStatus::Unknown {
        return false;
    }
    !matches!(
        old,
        InfectionStatus::Negative | InfectionStatus::Positive
    )
}

/// An error produced by the event protocol.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The event has concluded; no further checkins or exchanges.
    #[error("Event has concluded")]
    EventConcluded,

    /// No checkin is in progress for this guest.
    #[error("No checkin in progress")]
    CheckinNotInProgress,

    /// A record field had the wrong size.
    #[error("Invalid size for {field}")]
    InvalidSize {
        /// The offending field.
        field: &'static str,
    },

    /// A signature failed to verify.
    #[error("Invalid signature")]
    InvalidSignature,

    /// A record proposed an illegal status transition (guest side; the
    /// organizer answers these with the current status instead).
    #[error("Invalid status transition")]
    InvalidTransition,

    /// A participant tried to change the real identity behind their
    /// pseudonym. Treated as hostile.
    #[error("Identity swap attempt")]
    IdentitySwap,

    /// The peer violated the protocol (wrong record, bad metadata).
    #[error("Protocol violation: {0}")]
    Violation(&'static str),

    /// A step missed its deadline.
    #[error("Timed out in {0}")]
    Timeout(&'static str),

    /// The operation was cancelled by the caller.
    #[error("Cancelled")]
    ContextCancelled,

    /// The session or server has been shut down.
    #[error("Shut down")]
    Closed,

    /// Record framing or negotiation failed.
    #[error("Protocol transport failure")]
    Proto(#[from] mesh_proto::Error),

    /// Link establishment failed.
    #[error("Link failure")]
    Net(#[from] mesh_net::Error),

    /// The gateway failed underneath us.
    #[error("Gateway failure")]
    Gateway(#[from] mesh_gateway::Error),

    /// Key material was unusable.
    #[error("Cryptographic failure")]
    Crypto(#[from] mesh_crypto::Error),

    /// An internal error that should never occur.
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

/// A `Result` with this crate's [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error type used by host and guest callbacks.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;
    use InfectionStatus::*;

    #[test]
    fn transition_table() {
        // First report: anything but unknown.
        assert!(valid_transition(Unknown, Suspected));
        assert!(valid_transition(Unknown, Negative));
        assert!(valid_transition(Unknown, Positive));
        assert!(!valid_transition(Unknown, Unknown));

        // Suspected can resolve either way.
        assert!(valid_transition(Suspected, Negative));
        assert!(valid_transition(Suspected, Positive));
        assert!(!valid_transition(Suspected, Suspected));
        assert!(!valid_transition(Suspected, Unknown));

        // Negative and positive are terminal.
        for old in [Negative, Positive] {
            for new in [Unknown, Negative, Suspected, Positive] {
                assert!(!valid_transition(old, new), "{old:?} -> {new:?}");
            }
        }
    }
}
