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

mod mock;

pub use mock::{MockGateway, MockNetwork};

use std::sync::Arc;

use async_trait::async_trait;
use mesh_crypto::{OnionAddr, SecretAddress};
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream obtained from a gateway.
///
/// Dropping the stream closes it; cancellation of a pending dial is
/// expressed by dropping the dial future.
pub type GatewayStream = Box<dyn Stream>;

/// Object-safe alias for the traits a gateway stream must implement.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// A source of inbound streams for one listening address.
#[async_trait]
pub trait IncomingStreams: Send {
    /// Wait for the next inbound stream.
    async fn accept(&mut self) -> Result<GatewayStream>;
}

/// A listener bound to one hidden address.
///
/// Dropping the listener unpublishes the address.
pub struct Listener {
    /// The hidden address this listener is reachable at.
    onion: OnionAddr,
    /// Source of inbound streams.
    incoming: Box<dyn IncomingStreams>,
}

impl Listener {
    /// Assemble a listener from its parts. Used by gateway implementations.
    pub fn new(onion: OnionAddr, incoming: Box<dyn IncomingStreams>) -> Self {
        Listener { onion, incoming }
    }

    /// Return the hidden address this listener is reachable at.
    pub fn onion(&self) -> &OnionAddr {
        &self.onion
    }

    /// Wait for the next inbound stream.
    pub async fn accept(&mut self) -> Result<GatewayStream> {
        self.incoming.accept().await
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("onion", &self.onion).finish_non_exhaustive()
    }
}

/// Access to the anonymizing network.
///
/// A gateway only moves bytes: it can publish a listener for an address
/// secret and it can dial a hidden address. It MUST NOT authenticate
/// anything; mutual TLS above it does that.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    /// Publish a listener for `address` and return it.
    async fn listen(&self, address: &SecretAddress) -> Result<Listener>;

    /// Dial the hidden address `onion` and return the raw stream.
    async fn dial(&self, onion: &OnionAddr) -> Result<GatewayStream>;
}

/// An error produced by a gateway.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The gateway is administratively disabled.
    #[error("Gateway is disabled")]
    Disabled,

    /// Nobody is listening at the dialed address.
    #[error("Hidden address unreachable: {0}")]
    Unreachable(OnionAddr),

    /// The listener was closed under us.
    #[error("Listener closed")]
    ListenerClosed,

    /// Network IO failed.
    #[error("Network IO error in {action}")]
    Io {
        /// What we were doing.
        action: &'static str,
        /// What happened.
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl Error {
    /// Construct an [`Error::Io`] from an action and its cause.
    pub(crate) fn from_io(action: &'static str, source: std::io::Error) -> Self {
        Error::Io {
            action,
            source: Arc::new(source),
        }
    }
}

/// A `Result` with this crate's [`Error`] as its error type.
pub type Result<T> = std::result::Result<T, Error>;
