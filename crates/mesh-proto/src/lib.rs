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

pub mod contact;
pub mod event;
mod handshake;
mod mux;
pub mod pairing;
mod record;
mod time;

pub use handshake::{negotiate, Handshake, HANDSHAKE_TIMEOUT};
pub use mux::{Muxer, ProtocolHandler};
pub use record::{split, Decoder, Encoder, RecordReader, RecordWriter, MAX_RECORD_LEN};
pub use time::Timestamp;

use std::sync::Arc;

/// An error produced while framing, negotiating, or dispatching records.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Network IO failed while reading or writing a record.
    #[error("Record IO error")]
    Io(#[source] Arc<std::io::Error>),

    /// A record failed to encode.
    #[error("Record encoding failed")]
    Encode(#[source] Arc<ciborium::ser::Error<std::io::Error>>),

    /// A record failed to decode.
    #[error("Record decoding failed")]
    Decode(#[source] Arc<ciborium::de::Error<std::io::Error>>),

    /// A record exceeded the maximum permitted size.
    #[error("Record of {0} bytes exceeds the {MAX_RECORD_LEN} byte limit")]
    TooLarge(usize),

    /// The protocol handshake did not finish within its deadline.
    #[error("Protocol handshake timed out")]
    HandshakeTimeout,

    /// The two sides tried to speak different protocols.
    #[error("Protocol mismatch: we speak {ours}, peer sent {theirs}")]
    HandshakeProtocolMismatch {
        /// The protocol we were prepared to run.
        ours: String,
        /// The protocol the peer asked for.
        theirs: String,
    },

    /// There is no protocol version both sides support.
    #[error("No common version for protocol {0}")]
    NoCommonVersion(String),

    /// The negotiated version has no registered handler.
    ///
    /// This is a bug in the caller: handlers should be registered for
    /// every advertised version.
    #[error("No handler registered for {protocol} v{version}")]
    UnsupportedVersion {
        /// The negotiated protocol.
        protocol: String,
        /// The negotiated version.
        version: u64,
    },

    /// An application handler failed.
    #[error("Protocol handler failed")]
    Handler(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// A record carried a field of the wrong size.
    #[error("Invalid size for {field}: expected {expected}, got {got}")]
    InvalidSize {
        /// The field in question.
        field: &'static str,
        /// The size the protocol requires.
        expected: usize,
        /// The size we received.
        got: usize,
    },
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    /// Wrap an application error as a handler failure.
    pub fn handler<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        Error::Handler(Arc::new(e))
    }
}

/// A `Result` with this crate's [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;
