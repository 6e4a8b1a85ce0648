//! # Duplex Streams and Message Framing
//!
//! This module provides the byte-stream foundation of the relay protocol:
//!
//! - [`Duplex`]: the abstract bidirectional byte channel the relay core
//!   operates on, with independently closable read/write directions
//! - [`BoxedDuplex`]: the owned, type-erased form that is passed between
//!   the handshake, the dialer, and the slot table
//! - [`FramedChannel`]: length-delimited message framing over a duplex
//!   stream, with a consuming `release()` that hands the raw stream back
//!
//! ## Framing Format
//!
//! One frame = `length: u32 big-endian || payload`. A zero-length frame is
//! a valid, empty message and is reported as `Ok(vec![])`, distinct from a
//! transport failure (`Err`). Frames larger than [`MAX_FRAME_SIZE`] are
//! rejected before the payload is read.
//!
//! ## Ownership
//!
//! A stream has exactly one logical owner. Constructing a `FramedChannel`
//! consumes the stream; `release(self)` consumes the channel and returns
//! the stream, so a released channel cannot be written to or read from
//! again - reuse after release is a compile error, not a runtime bug.
//! Frames are read with exact-length reads, so no buffered bytes exist to
//! be lost at release time.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload size.
///
/// Handshake payloads are a single opcode byte or a public key; anything
/// close to this limit is a protocol violation.
/// SECURITY: Bounds per-frame allocation from untrusted length prefixes.
pub const MAX_FRAME_SIZE: usize = 1024;

/// A bidirectional byte channel with independent read/write directions.
///
/// Blanket-implemented for every compatible stream type; in-memory pipes,
/// TCP streams, and QUIC stream pairs all qualify.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> Duplex for S {}

/// Owned, type-erased duplex stream.
///
/// This is the ownership currency of the relay core: dialers produce it,
/// the handshake consumes and releases it, and slot pipes own two of them.
pub type BoxedDuplex = Box<dyn Duplex>;

// ============================================================================
// FramedChannel
// ============================================================================

/// Length-delimited message framing over a duplex stream.
pub struct FramedChannel<S: Duplex> {
    stream: S,
}

impl<S: Duplex> FramedChannel<S> {
    /// Take ownership of `stream` and begin framed mode.
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Write one framed message and flush it.
    pub async fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame too large: {} bytes (max {})", payload.len(), MAX_FRAME_SIZE),
            ));
        }
        let len = payload.len() as u32;
        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await
    }

    /// Read exactly one framed message.
    ///
    /// Returns `Ok(vec![])` for a zero-length payload; transport failures
    /// and oversized length prefixes are errors.
    pub async fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE),
            ));
        }

        let mut payload = vec![0u8; len];
        if len > 0 {
            self.stream.read_exact(&mut payload).await?;
        }
        Ok(payload)
    }

    /// End framed mode and hand the raw stream back.
    ///
    /// Consumes the channel: ownership of the stream transfers to the
    /// caller and no further frames can be sent or received.
    pub fn release(self) -> S {
        self.stream
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = FramedChannel::new(a);
        let mut reader = FramedChannel::new(b);

        writer.write_frame(b"hello relay").await.unwrap();
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame, b"hello relay");
    }

    #[tokio::test]
    async fn empty_frame_is_not_an_error() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = FramedChannel::new(a);
        let mut reader = FramedChannel::new(b);

        writer.write_frame(&[]).await.unwrap();
        let frame = reader.read_frame().await.unwrap();
        assert!(frame.is_empty());
    }

    #[tokio::test]
    async fn closed_peer_is_a_read_error() {
        let (a, b) = tokio::io::duplex(4096);
        drop(a);
        let mut reader = FramedChannel::new(b);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = FramedChannel::new(a);
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(writer.write_frame(&payload).await.is_err());

        // An oversized length prefix from the peer is rejected before
        // any payload allocation.
        let (mut raw, d) = tokio::io::duplex(4096);
        raw.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        let mut reader = FramedChannel::new(d);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn release_returns_usable_raw_stream() {
        let (a, b) = tokio::io::duplex(4096);
        let mut near = FramedChannel::new(a);
        let mut far = FramedChannel::new(b);

        near.write_frame(b"framed part").await.unwrap();
        assert_eq!(far.read_frame().await.unwrap(), b"framed part");

        // After release both ends continue as raw byte streams.
        let mut near_raw = near.release();
        let mut far_raw = far.release();

        near_raw.write_all(b"raw bytes").await.unwrap();
        near_raw.flush().await.unwrap();

        let mut buf = [0u8; 9];
        far_raw.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"raw bytes");
    }

    #[tokio::test]
    async fn boxed_duplex_works_through_the_trait_object() {
        let (a, b) = tokio::io::duplex(4096);
        let boxed_a: BoxedDuplex = Box::new(a);
        let boxed_b: BoxedDuplex = Box::new(b);

        let mut writer = FramedChannel::new(boxed_a);
        let mut reader = FramedChannel::new(boxed_b);

        writer.write_frame(&[42]).await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap(), vec![42]);
    }
}
