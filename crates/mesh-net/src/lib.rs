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

mod breaker;
mod node;
mod peers;
mod server;
mod tls;

pub use node::{Node, NodeConfig, RingCallback};
pub use peers::{exchange_magic, ConnHandler, Direction, PeerSet, MAGIC};
pub use server::Server;
pub use tls::Dialer;

use std::sync::Arc;

/// An error produced while establishing or running an authenticated link.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The peer's identity is not authorized here.
    #[error("Unauthorized peer {0}")]
    Unauthorized(mesh_crypto::Fingerprint),

    /// We already have a live link to this peer.
    #[error("Duplicate connection for peer {0}")]
    Duplicate(mesh_crypto::Fingerprint),

    /// The peer sent the wrong protocol magic.
    #[error("Protocol magic mismatch")]
    MagicMismatch,

    /// A link-establishment step missed its deadline.
    #[error("Timed out in {0}")]
    HandshakeTimeout(&'static str),

    /// The peer set or node has been shut down.
    #[error("Shut down")]
    Closed,

    /// The dialed peer is not in the key ring.
    #[error("No such peer {0}")]
    UnknownPeer(mesh_crypto::Fingerprint),

    /// The gateway failed underneath us.
    #[error("Gateway failure")]
    Gateway(#[from] mesh_gateway::Error),

    /// Key or certificate material was unusable.
    #[error("Cryptographic failure")]
    Crypto(#[from] mesh_crypto::Error),

    /// The TLS handshake failed.
    #[error("TLS failure in {action}")]
    Tls {
        /// What we were doing.
        action: &'static str,
        /// What happened.
        #[source]
        source: Arc<rustls::Error>,
    },

    /// Plain IO failed on an established link.
    #[error("Link IO error")]
    Io(#[source] Arc<std::io::Error>),

    /// The application handler for a link failed.
    #[error("Application handler failed")]
    App(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// The ring-change callback failed; in-memory and persisted state may
    /// now diverge.
    #[error("Ring persistence callback failed")]
    RingCallback(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// An internal error that should never occur.
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<mesh_proto::Error> for Error {
    fn from(e: mesh_proto::Error) -> Self {
        Error::App(Arc::new(e))
    }
}

impl Error {
    /// Wrap a rustls error with the action that produced it.
    pub(crate) fn tls(action: &'static str, source: rustls::Error) -> Self {
        Error::Tls {
            action,
            source: Arc::new(source),
        }
    }
}

/// A `Result` with this crate's [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;
