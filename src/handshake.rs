//! # Relay Handshake
//!
//! The three-role negotiation protocol that establishes a relayed
//! connection between two peers that cannot dial each other directly:
//!
//! - the **initiator** runs [`RelayHandshake::initiate`] toward the relay
//! - the **relay** runs [`RelayHandshake::negotiate`], consulting its
//!   [`SlotTable`] and, when needed, opening a second handshake session
//!   toward the destination
//! - the **destination** runs [`RelayHandshake::handle`]
//!
//! Each session owns one framed channel. There are no retries: any
//! failure terminates the session and is reported to the caller, who may
//! retry at a higher layer. Every path answers the peer with the most
//! specific failure code available and releases its channel(s), so the
//! framing layer never leaks buffered state.
//!
//! A handshake is consumed by the operation that runs it; once the
//! channel has been released no further protocol messages can be sent or
//! expected, and the type system enforces it.

use std::time::Duration;

use tracing::{debug, error, warn};

use crate::identity::Identity;
use crate::messages::HandshakeMessage;
use crate::protocols::{RelayDialer, RELAY_DELIVERY_PROTOCOL};
use crate::slots::SlotTable;
use crate::stream::{BoxedDuplex, FramedChannel};

/// Upper bound on each framed read within a handshake session.
/// SECURITY: A peer that connects and goes silent cannot pin a session
/// forever.
pub const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the relay's dial toward the destination.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

// ============================================================================
// Outcomes
// ============================================================================

/// Result of [`RelayHandshake::initiate`].
///
/// Failures are deliberately opaque: the initiator learns only that the
/// relayed path did not come up. The specific relay-side code is logged
/// for diagnostics, not surfaced.
pub enum InitiateOutcome {
    /// The relay answered `OK`; the stream is now relayed to the destination.
    Established(BoxedDuplex),
    Failed,
}

impl InitiateOutcome {
    pub fn is_established(&self) -> bool {
        matches!(self, InitiateOutcome::Established(_))
    }
}

/// Result of [`RelayHandshake::handle`].
pub enum HandleOutcome {
    /// The initiator was identified; the stream is now relayed to them.
    Accepted {
        stream: BoxedDuplex,
        counterparty: Identity,
    },
    Failed,
}

impl HandleOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, HandleOutcome::Accepted { .. })
    }
}

// ============================================================================
// RelayHandshake
// ============================================================================

/// One relay handshake session over one framed channel.
pub struct RelayHandshake {
    channel: FramedChannel<BoxedDuplex>,
}

impl RelayHandshake {
    /// Begin a handshake session, taking ownership of the stream.
    pub fn new(stream: BoxedDuplex) -> Self {
        Self { channel: FramedChannel::new(stream) }
    }

    /// Immediately end the session with the given reason.
    ///
    /// Writes one framed message carrying `reason`, then releases and
    /// returns the raw stream so the caller can close it. Consuming
    /// `self` makes a second reject on the same session a compile error.
    pub async fn reject(self, reason: HandshakeMessage) -> BoxedDuplex {
        let mut channel = self.channel;
        if let Err(e) = channel.write_frame(&[reason.to_byte()]).await {
            debug!(reason = %reason, error = %e, "failed to write rejection");
        }
        channel.release()
    }

    /// The initiator's role: request a relayed path to `destination`.
    ///
    /// Writes the destination's public key, then reads exactly one status
    /// reply. Any read error or empty reply is a failure; only `OK`
    /// establishes the relayed stream. The channel is released on every
    /// path.
    pub async fn initiate(self, relay: &Identity, destination: &Identity) -> InitiateOutcome {
        let mut channel = self.channel;

        if let Err(e) = channel.write_frame(&destination.encode()).await {
            error!(relay = %relay, error = %e, "failed to send relay request");
            drop(channel.release());
            return InitiateOutcome::Failed;
        }

        let reply = match read_frame_bounded(&mut channel).await {
            Some(reply) if !reply.is_empty() => reply,
            Some(_) => {
                debug!(relay = %relay, "received empty reply, discarding");
                drop(channel.release());
                return InitiateOutcome::Failed;
            }
            None => {
                error!(relay = %relay, "error while reading relay answer");
                drop(channel.release());
                return InitiateOutcome::Failed;
            }
        };

        let answer = HandshakeMessage::from_byte(reply[0]);
        let stream = channel.release();

        match answer {
            HandshakeMessage::Ok => {
                debug!(
                    destination = %destination,
                    relay = %relay,
                    "established outbound relayed connection"
                );
                InitiateOutcome::Established(stream)
            }
            other => {
                error!(
                    destination = %destination,
                    relay = %relay,
                    answer = %other,
                    "could not establish relayed connection"
                );
                drop(stream);
                InitiateOutcome::Failed
            }
        }
    }

    /// The destination's role: accept or refuse an inbound relayed
    /// connection brokered by the relay `source`.
    ///
    /// Reads the initiator's public key; an empty or undecodable payload
    /// is answered with `FAIL`. On success the stream is released and
    /// returned together with the decoded initiator identity.
    pub async fn handle(self, source: &Identity) -> HandleOutcome {
        let mut channel = self.channel;

        let frame = match read_frame_bounded(&mut channel).await {
            Some(frame) if !frame.is_empty() => frame,
            _ => {
                error!(relay = %source, "received empty message, ignoring request");
                answer_and_close(channel, HandshakeMessage::Fail).await;
                return HandleOutcome::Failed;
            }
        };

        let initiator = match Identity::decode(&frame) {
            Ok(initiator) => initiator,
            Err(e) => {
                error!(relay = %source, error = %e, "could not decode initiator public key");
                answer_and_close(channel, HandshakeMessage::Fail).await;
                return HandleOutcome::Failed;
            }
        };

        if let Err(e) = channel.write_frame(&[HandshakeMessage::Ok.to_byte()]).await {
            error!(relay = %source, error = %e, "failed to acknowledge relayed connection");
            drop(channel.release());
            return HandleOutcome::Failed;
        }

        debug!(
            initiator = %initiator,
            relay = %source,
            "established inbound relayed connection"
        );
        HandleOutcome::Accepted { stream: channel.release(), counterparty: initiator }
    }

    /// The relay's role: broker one inbound relay request from `source`.
    ///
    /// The outcome is communicated entirely over the channel, so this
    /// returns nothing. Reuses an existing active slot when one is
    /// registered for the pair (no second dial); otherwise dials the
    /// destination through `dialer`, runs the delivery handshake, and
    /// registers a new slot. The slot is reserved before `OK` is written
    /// to either side, so both peers holding `OK` implies the slot was
    /// admitted.
    pub async fn negotiate(
        self,
        source: &Identity,
        dialer: &dyn RelayDialer,
        slots: &SlotTable,
        free_timeout: Duration,
    ) {
        let mut channel = self.channel;
        debug!(source = %source, "handling relay request");

        let frame = match read_frame_bounded(&mut channel).await {
            Some(frame) if !frame.is_empty() => frame,
            _ => {
                error!(source = %source, "unable to identify counterparty, ending stream");
                answer_and_close(channel, HandshakeMessage::FailInvalidPublicKey).await;
                return;
            }
        };

        let destination = match Identity::decode(&frame) {
            Ok(destination) => destination,
            Err(e) => {
                error!(source = %source, error = %e, "cannot decode destination public key");
                answer_and_close(channel, HandshakeMessage::FailInvalidPublicKey).await;
                return;
            }
        };

        debug!(source = %source, destination = %destination, "counterparty identified");

        if destination == *source {
            error!(source = %source, "peer tried to loop back to itself, dropping connection");
            answer_and_close(channel, HandshakeMessage::FailLoopbacksAreNotAllowed).await;
            return;
        }

        // Reconnect path: an existing live slot is reused by swapping in
        // the new source-side stream, avoiding a second dial.
        let had_slot = slots.exists(source, &destination).await;
        if had_slot && slots.is_active(source, &destination).await {
            if channel.write_frame(&[HandshakeMessage::Ok.to_byte()]).await.is_err() {
                drop(channel.release());
                return;
            }
            let stream = channel.release();
            if let Err(e) = slots.update_existing(source, &destination, stream).await {
                warn!(
                    source = %source,
                    destination = %destination,
                    error = %e,
                    "failed to update existing relayed connection"
                );
            }
            return;
        }

        // New slots need admission; reject before burning a dial. A dead
        // slot for this pair does not count against the pair: its key is
        // reclaimed at reservation time.
        if !had_slot && slots.at_capacity().await {
            warn!(source = %source, destination = %destination, "relay is full");
            answer_and_close(channel, HandshakeMessage::FailRelayFull).await;
            return;
        }

        let dialed = tokio::time::timeout(
            DIAL_TIMEOUT,
            dialer.dial(&destination, RELAY_DELIVERY_PROTOCOL),
        )
        .await;
        let to_destination = match dialed {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!(
                    source = %source,
                    destination = %destination,
                    error = %e,
                    "cannot establish relayed connection: destination unreachable"
                );
                answer_and_close(channel, HandshakeMessage::FailCouldNotReachCounterparty).await;
                return;
            }
            Err(_) => {
                error!(source = %source, destination = %destination, "dial timed out");
                answer_and_close(channel, HandshakeMessage::FailCouldNotReachCounterparty).await;
                return;
            }
        };

        // Second session, toward the destination: deliver the initiator's
        // key and await its verdict.
        let mut destination_channel = FramedChannel::new(to_destination);
        if let Err(e) = destination_channel.write_frame(&source.encode()).await {
            error!(destination = %destination, error = %e, "failed to deliver initiator key");
            drop(destination_channel.release());
            answer_and_close(channel, HandshakeMessage::FailCouldNotReachCounterparty).await;
            return;
        }

        let destination_answer = match read_frame_bounded(&mut destination_channel).await {
            Some(reply) if !reply.is_empty() => HandshakeMessage::from_byte(reply[0]),
            _ => {
                error!(destination = %destination, "no answer from destination");
                drop(destination_channel.release());
                answer_and_close(channel, HandshakeMessage::FailCouldNotReachCounterparty).await;
                return;
            }
        };

        if !destination_answer.is_ok() {
            error!(
                source = %source,
                destination = %destination,
                answer = %destination_answer,
                "destination refused relayed connection"
            );
            drop(destination_channel.release());
            answer_and_close(channel, HandshakeMessage::FailCouldNotReachCounterparty).await;
            return;
        }

        // Admit the slot before telling either peer OK: once both hold
        // OK, registration can no longer be refused.
        if let Err(e) = slots.reserve(source, &destination).await {
            warn!(
                source = %source,
                destination = %destination,
                error = %e,
                "cannot admit relayed connection"
            );
            let code = match e {
                crate::slots::SlotError::AtCapacity => HandshakeMessage::FailRelayFull,
                _ => HandshakeMessage::Fail,
            };
            drop(destination_channel.release());
            answer_and_close(channel, code).await;
            return;
        }

        if channel.write_frame(&[HandshakeMessage::Ok.to_byte()]).await.is_err() {
            // The source vanished between request and answer; dropping
            // both streams signals the destination, and the reservation
            // expires on its own.
            error!(source = %source, destination = %destination, "source went away before OK");
            drop(channel.release());
            drop(destination_channel.release());
            return;
        }

        let source_stream = channel.release();
        let destination_stream = destination_channel.release();

        match slots
            .create_new(source, &destination, source_stream, destination_stream, free_timeout)
            .await
        {
            Ok(()) => {
                debug!(source = %source, destination = %destination, "relayed connection established");
            }
            Err(e) => {
                error!(
                    source = %source,
                    destination = %destination,
                    error = %e,
                    "cannot register relayed connection"
                );
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Read one frame, bounded by [`HANDSHAKE_READ_TIMEOUT`].
///
/// `None` folds together transport errors and timeouts; an empty frame is
/// `Some(vec![])`, which callers treat as a distinct protocol error.
async fn read_frame_bounded(channel: &mut FramedChannel<BoxedDuplex>) -> Option<Vec<u8>> {
    match tokio::time::timeout(HANDSHAKE_READ_TIMEOUT, channel.read_frame()).await {
        Ok(Ok(frame)) => Some(frame),
        Ok(Err(e)) => {
            debug!(error = %e, "handshake read failed");
            None
        }
        Err(_) => {
            debug!("handshake read timed out");
            None
        }
    }
}

/// Answer the peer with `status`, then release and drop the stream.
async fn answer_and_close(mut channel: FramedChannel<BoxedDuplex>, status: HandshakeMessage) {
    if let Err(e) = channel.write_frame(&[status.to_byte()]).await {
        debug!(status = %status, error = %e, "failed to write handshake status");
    }
    drop(channel.release());
}
