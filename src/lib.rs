//! # Causeway - Relay-Based NAT Traversal Core
//!
//! Causeway lets two peers that cannot dial each other directly establish
//! a bidirectional byte channel through a third, cooperating peer (the
//! relay). It provides:
//!
//! - **Relay Handshake**: the three-role negotiation protocol
//!   (initiator / relay / destination) run over framed duplex streams
//! - **Relay Slot Table**: the relay-side registry that pipes bytes
//!   between the two legs of each relayed connection, probes liveness,
//!   reuses live connections on reconnect, and reclaims idle ones
//!
//! ## Architecture
//!
//! The slot table uses the **Actor Pattern** for safe concurrent state:
//! a cheap-to-clone handle sends commands to a private actor that owns
//! all slots and processes commands sequentially. Each relayed
//! connection runs its own piping task; each handshake session is an
//! independent task owned by whoever accepted or dialed the stream.
//!
//! The outer transport stays pluggable: streams enter the crate as
//! [`BoxedDuplex`] trait objects and outbound dialing is supplied through
//! the [`RelayDialer`] trait.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Ed25519 keypairs and 32-byte public-key identities |
//! | `stream` | Duplex stream abstraction and length-delimited framing |
//! | `messages` | The one-byte handshake status vocabulary |
//! | `handshake` | The three-role relay negotiation protocol |
//! | `slots` | Relay-side slot table, piping, and reclamation |
//! | `protocols` | Dialer trait and protocol identifiers |
//! | `relay` | Orchestrator serving inbound relay requests |

mod handshake;
mod identity;
mod messages;
mod protocols;
mod relay;
mod slots;
mod stream;

pub use handshake::{
    HandleOutcome, InitiateOutcome, RelayHandshake, DIAL_TIMEOUT, HANDSHAKE_READ_TIMEOUT,
};
pub use identity::{Identity, IdentityError, Keypair, IDENTITY_LENGTH};
pub use messages::HandshakeMessage;
pub use protocols::{RelayDialer, RELAY_DELIVERY_PROTOCOL, RELAY_REQUEST_PROTOCOL};
pub use relay::{Relay, RelayConfig};
pub use slots::{
    SlotError, SlotTable, DEFAULT_FREE_TIMEOUT, DEFAULT_MAX_SLOTS, PROBE_TIMEOUT,
};
pub use stream::{BoxedDuplex, Duplex, FramedChannel, MAX_FRAME_SIZE};
