//! # Relay Orchestrator
//!
//! Composes the relay handshake and the slot table to service inbound
//! relay requests on a relay node. The outer transport accepts streams
//! for the relay request protocol and hands each one to
//! [`Relay::serve_inbound`]; everything after that - negotiation, dialing
//! the destination through the supplied [`RelayDialer`], slot
//! registration, and piping - happens inside this module's collaborators.
//!
//! Each inbound request is one independently schedulable unit of work;
//! callers typically spawn one task per accepted stream.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::handshake::RelayHandshake;
use crate::identity::Identity;
use crate::protocols::RelayDialer;
use crate::slots::{SlotTable, DEFAULT_FREE_TIMEOUT, DEFAULT_MAX_SLOTS};
use crate::stream::BoxedDuplex;

/// Relay-side tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Maximum relayed connections (active + reserved) hosted at once.
    pub max_slots: usize,
    /// Idle period after which an unused relayed connection is reclaimed.
    pub free_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { max_slots: DEFAULT_MAX_SLOTS, free_timeout: DEFAULT_FREE_TIMEOUT }
    }
}

/// Relay-side service brokering relayed connections. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    dialer: Arc<dyn RelayDialer>,
    slots: SlotTable,
    free_timeout: Duration,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("free_timeout", &self.free_timeout)
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Create a relay service around the supplied dialer.
    ///
    /// Spawns the slot table actor; the relay is ready to serve as soon
    /// as this returns.
    pub fn new(dialer: Arc<dyn RelayDialer>, config: RelayConfig) -> Self {
        debug!(
            max_slots = config.max_slots,
            free_timeout_secs = config.free_timeout.as_secs(),
            "relay service started"
        );
        Self {
            dialer,
            slots: SlotTable::new(config.max_slots),
            free_timeout: config.free_timeout,
        }
    }

    /// Service one inbound relay request from `source` end-to-end.
    ///
    /// Runs the relay side of the handshake over `stream`; the outcome is
    /// communicated to the peers over their channels. Returns when the
    /// negotiation is finished (successful piping continues in the slot's
    /// own task).
    pub async fn serve_inbound(&self, source: Identity, stream: BoxedDuplex) {
        RelayHandshake::new(stream)
            .negotiate(&source, self.dialer.as_ref(), &self.slots, self.free_timeout)
            .await;
    }

    /// The slot table hosting this relay's connections.
    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    /// Stop the slot table actor and all piping tasks.
    pub async fn shutdown(&self) {
        self.slots.shutdown().await;
    }
}
