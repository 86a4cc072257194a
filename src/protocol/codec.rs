//! Length-prefixed frame codec.
//!
//! Every message on the wire is a 4-byte unsigned big-endian length followed by exactly that
//! many payload bytes. [`encode`] builds one such frame; [`FrameDecoder`] turns an arbitrarily
//! chunked byte stream back into the sequence of payloads that produced it.
//!
//! The decoder is a small state machine:
//!
//! - [`DecodeState::AwaitingHeader`]: header bytes are collected until all four have arrived.
//!   No payload byte is consumed before the header is complete.
//! - [`DecodeState::AwaitingBody`]: payload bytes are appended to the partial buffer until the
//!   declared length is reached, then the frame is yielded.
//! - [`DecodeState::Discarding`]: a header declared more than the configured maximum. The
//!   declared body is skipped without being buffered and decoding resumes at the next header.
use log::{trace, warn};
use thiserror::Error;

/// Size of the length header in bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest payload accepted unless configured otherwise (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame header declares {declared} bytes, limit is {max}")]
    TooLarge { declared: u32, max: u32 },
    #[error("payload of {len} bytes exceeds frame limit of {max}")]
    PayloadTooLarge { len: usize, max: u32 },
}

/// Result of decoding a single frame.
pub type Decoded = Result<Vec<u8>, FrameError>;

/// Prepends the length header to `payload`, producing one frame to be written as a unit.
pub fn encode(payload: &[u8], max_frame_size: u32) -> Result<Vec<u8>, FrameError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= max_frame_size)
        .ok_or(FrameError::PayloadTooLarge {
            len: payload.len(),
            max: max_frame_size,
        })?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    AwaitingHeader,
    AwaitingBody(u32),
    Discarding(u32),
}

/// Per-connection decoding state.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    header: [u8; HEADER_SIZE],
    header_len: usize,
    body: Vec<u8>,
    max_frame_size: u32,
}

impl FrameDecoder {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            state: DecodeState::AwaitingHeader,
            header: [0; HEADER_SIZE],
            header_len: 0,
            body: Vec::new(),
            max_frame_size,
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Number of bytes held for the frame currently being assembled.
    pub fn buffered(&self) -> usize {
        self.header_len + self.body.len()
    }

    /// Drops any partial header or body and returns to [`DecodeState::AwaitingHeader`].
    pub fn reset(&mut self) {
        self.state = DecodeState::AwaitingHeader;
        self.header_len = 0;
        self.body = Vec::new();
    }

    /// Feeds a chunk of the stream to the decoder, returning every frame completed by it in
    /// stream order. Bytes belonging to an unfinished frame are kept for the next call.
    pub fn decode(&mut self, mut input: &[u8]) -> Vec<Decoded> {
        let mut frames = Vec::new();

        while !input.is_empty() {
            match self.state {
                DecodeState::AwaitingHeader => {
                    let take = (HEADER_SIZE - self.header_len).min(input.len());
                    self.header[self.header_len..self.header_len + take]
                        .copy_from_slice(&input[..take]);
                    self.header_len += take;
                    input = &input[take..];

                    if self.header_len < HEADER_SIZE {
                        break;
                    }
                    self.header_len = 0;

                    let declared = u32::from_be_bytes(self.header);
                    if declared == 0 {
                        trace!("decoded empty frame");
                        frames.push(Ok(Vec::new()));
                    } else if declared > self.max_frame_size {
                        warn!(
                            "frame header declares {declared} bytes, over the {} byte limit",
                            self.max_frame_size
                        );
                        frames.push(Err(FrameError::TooLarge {
                            declared,
                            max: self.max_frame_size,
                        }));
                        self.state = DecodeState::Discarding(declared);
                    } else {
                        self.state = DecodeState::AwaitingBody(declared);
                    }
                }
                DecodeState::AwaitingBody(remaining) => {
                    let take = input.len().min(remaining as usize);
                    self.body.extend_from_slice(&input[..take]);
                    input = &input[take..];

                    let remaining = remaining - take as u32;
                    if remaining == 0 {
                        let frame = std::mem::take(&mut self.body);
                        trace!("decoded frame of {} bytes", frame.len());
                        frames.push(Ok(frame));
                        self.state = DecodeState::AwaitingHeader;
                    } else {
                        self.state = DecodeState::AwaitingBody(remaining);
                    }
                }
                DecodeState::Discarding(remaining) => {
                    let take = input.len().min(remaining as usize);
                    input = &input[take..];

                    let remaining = remaining - take as u32;
                    self.state = if remaining == 0 {
                        DecodeState::AwaitingHeader
                    } else {
                        DecodeState::Discarding(remaining)
                    };
                }
            }
        }

        frames
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}
