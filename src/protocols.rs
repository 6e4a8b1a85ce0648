//! Protocol trait definitions for Causeway's relay layer.
//!
//! The relay core does not dial peers itself: reaching a destination is
//! the outer transport's job. [`RelayDialer`] is the seam through which
//! that capability is supplied. Defining it here, separately from the
//! components that consume it, keeps the handshake and slot table free of
//! any dependency on a concrete transport.

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::Identity;
use crate::stream::BoxedDuplex;

/// Protocol identifier for inbound relay requests (initiator -> relay).
pub const RELAY_REQUEST_PROTOCOL: &str = "/causeway/relay/request/1.0";

/// Protocol identifier the relay uses when dialing the destination on
/// behalf of an initiator (relay -> destination).
pub const RELAY_DELIVERY_PROTOCOL: &str = "/causeway/relay/delivery/1.0";

/// Outbound dialing capability supplied by the embedding node.
///
/// `dial` must return a fresh duplex stream to `destination` speaking the
/// given protocol, or fail with a reachability error. Implementations are
/// expected to bound their own connection attempts; the relay core
/// additionally applies its dial timeout.
#[async_trait]
pub trait RelayDialer: Send + Sync + 'static {
    /// Open a new duplex stream to `destination` for `protocol`.
    async fn dial(&self, destination: &Identity, protocol: &str) -> Result<BoxedDuplex>;
}
