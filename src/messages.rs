//! # Relay Handshake Wire Messages
//!
//! The relay handshake speaks a deliberately tiny wire vocabulary: every
//! protocol message is either a raw public-key blob (an [`Identity`] in
//! encoded form) or a single status byte, each carried as the payload of
//! one length-delimited frame.
//!
//! The status byte values are a cross-implementation contract: the seven
//! known codes are numbered 0..6 in the order listed below and must never
//! be renumbered.
//!
//! [`Identity`]: crate::identity::Identity

/// One-byte status code exchanged during the relay handshake.
///
/// Unrecognized bytes decode into [`HandshakeMessage::Unknown`] rather
/// than failing: this byte arrives from remote peers, so a garbage value
/// is data to be handled, never a reason to crash. Receivers treat any
/// `Unknown` where a status is expected as [`HandshakeMessage::Fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// Request accepted; the relayed connection is being established.
    Ok,
    /// Generic failure.
    Fail,
    /// The relay could not reach or negotiate with the destination.
    FailCouldNotReachCounterparty,
    /// The peer at the other end could not be identified.
    FailCouldNotIdentifyPeer,
    /// The transmitted public key was empty or undecodable.
    FailInvalidPublicKey,
    /// Source and destination are the same peer.
    FailLoopbacksAreNotAllowed,
    /// The relay is at its configured slot capacity.
    FailRelayFull,
    /// Any byte value outside 0..=6.
    Unknown(u8),
}

impl HandshakeMessage {
    /// Encode as the single wire byte.
    pub fn to_byte(self) -> u8 {
        match self {
            HandshakeMessage::Ok => 0,
            HandshakeMessage::Fail => 1,
            HandshakeMessage::FailCouldNotReachCounterparty => 2,
            HandshakeMessage::FailCouldNotIdentifyPeer => 3,
            HandshakeMessage::FailInvalidPublicKey => 4,
            HandshakeMessage::FailLoopbacksAreNotAllowed => 5,
            HandshakeMessage::FailRelayFull => 6,
            HandshakeMessage::Unknown(byte) => byte,
        }
    }

    /// Decode from the wire byte. Total: every byte value decodes.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => HandshakeMessage::Ok,
            1 => HandshakeMessage::Fail,
            2 => HandshakeMessage::FailCouldNotReachCounterparty,
            3 => HandshakeMessage::FailCouldNotIdentifyPeer,
            4 => HandshakeMessage::FailInvalidPublicKey,
            5 => HandshakeMessage::FailLoopbacksAreNotAllowed,
            6 => HandshakeMessage::FailRelayFull,
            other => HandshakeMessage::Unknown(other),
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, HandshakeMessage::Ok)
    }
}

impl std::fmt::Display for HandshakeMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeMessage::Ok => write!(f, "OK"),
            HandshakeMessage::Fail => write!(f, "FAIL"),
            HandshakeMessage::FailCouldNotReachCounterparty => {
                write!(f, "FAIL_COULD_NOT_REACH_COUNTERPARTY")
            }
            HandshakeMessage::FailCouldNotIdentifyPeer => {
                write!(f, "FAIL_COULD_NOT_IDENTIFY_PEER")
            }
            HandshakeMessage::FailInvalidPublicKey => write!(f, "FAIL_INVALID_PUBLIC_KEY"),
            HandshakeMessage::FailLoopbacksAreNotAllowed => {
                write!(f, "FAIL_LOOPBACKS_ARE_NOT_ALLOWED")
            }
            HandshakeMessage::FailRelayFull => write!(f, "FAIL_RELAY_FULL"),
            HandshakeMessage::Unknown(byte) => write!(f, "UNKNOWN({})", byte),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const KNOWN: [HandshakeMessage; 7] = [
        HandshakeMessage::Ok,
        HandshakeMessage::Fail,
        HandshakeMessage::FailCouldNotReachCounterparty,
        HandshakeMessage::FailCouldNotIdentifyPeer,
        HandshakeMessage::FailInvalidPublicKey,
        HandshakeMessage::FailLoopbacksAreNotAllowed,
        HandshakeMessage::FailRelayFull,
    ];

    #[test]
    fn known_codes_round_trip() {
        for message in KNOWN {
            assert_eq!(HandshakeMessage::from_byte(message.to_byte()), message);
        }
    }

    #[test]
    fn wire_ordinals_are_fixed() {
        // Cross-implementation contract: renumbering breaks the protocol.
        let bytes: Vec<u8> = KNOWN.iter().map(|m| m.to_byte()).collect();
        assert_eq!(bytes, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn unrecognized_bytes_decode_as_unknown() {
        for byte in 7u8..=255 {
            let decoded = HandshakeMessage::from_byte(byte);
            assert_eq!(decoded, HandshakeMessage::Unknown(byte));
            assert_eq!(decoded.to_byte(), byte);
            assert!(!decoded.is_ok());
        }
    }

    #[test]
    fn only_ok_is_ok() {
        assert!(HandshakeMessage::Ok.is_ok());
        for message in &KNOWN[1..] {
            assert!(!message.is_ok());
        }
    }
}
