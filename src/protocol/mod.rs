//! Wire protocol.
//!
//! This module defines how discrete messages are carried over a TCP byte stream, and the
//! blocking transport the client uses to speak it.
//!
//! # Binary Format
//!
//! Messages are framed with a fixed-size header:
//!
//! - Each frame begins with a 4-byte unsigned big-endian payload length.
//! - Exactly that many payload bytes follow.
//! - When a key is configured the payload is encrypted *before* framing, so the length
//!   describes the ciphertext.
//!
//! Frames are the only unit this layer understands; what the payload means is up to the
//! application. [`payload`] offers a bincode encoding for applications exchanging typed
//! messages.
//!
//! # Key Components
//!
//! - [`FrameDecoder`]: Turns arbitrarily chunked reads into whole payloads.
//! - [`FrameTransport`]: Blocking framed reader/writer over any `Read + Write` stream.
//!
//! # See Also
//!
//! - [`balancer`](crate::balancer): Runs one [`FrameDecoder`] per live server connection.
pub mod codec;
pub mod payload;
mod transport;

pub use codec::{DEFAULT_MAX_FRAME_SIZE, DecodeState, FrameDecoder, FrameError, HEADER_SIZE};
pub use payload::PayloadError;
pub use transport::{FrameTransport, TransportError};
