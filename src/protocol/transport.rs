use std::{
    collections::VecDeque,
    io::{self, ErrorKind, Read, Write},
    sync::Arc,
};

use bincode::{Decode, Encode};
use thiserror::Error;

use crate::crypto::{self, Cipher, CipherError, XChaCha};

use super::{
    codec::{self, Decoded, FrameDecoder, FrameError},
    payload::{self, PayloadError},
};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed by peer")]
    Closed,
}

impl TransportError {
    /// Whether the error is a read timeout rather than a failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Io(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut))
    }
}

/// Blocking framed transport over any bidirectional byte stream.
pub struct FrameTransport<T: Read + Write> {
    stream: T,
    decoder: FrameDecoder,
    ready: VecDeque<Decoded>,
    cipher: Arc<dyn Cipher>,
    key: Vec<u8>,
}

impl<T: Read + Write> FrameTransport<T> {
    pub fn new(stream: T, max_frame_size: u32) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(max_frame_size),
            ready: VecDeque::new(),
            cipher: Arc::new(XChaCha),
            key: Vec::new(),
        }
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = cipher;
        self
    }

    /// Sets the key used for both directions; an empty key disables encryption.
    pub fn set_key(&mut self, key: Vec<u8>) {
        self.key = key;
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let sealed = crypto::seal(self.cipher.as_ref(), &self.key, payload)?;
        let frame = codec::encode(&sealed, self.decoder.max_frame_size())?;
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Blocks until a whole frame is available. Frames that fail to decode are reported one at
    /// a time; the stream stays usable afterwards.
    pub fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if let Some(decoded) = self.ready.pop_front() {
                return Ok(crypto::open(self.cipher.as_ref(), &self.key, decoded?)?);
            }

            let n = match self.stream.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                self.decoder.reset();
                return Err(TransportError::Closed);
            }
            self.ready.extend(self.decoder.decode(&buf[..n]));
        }
    }

    pub fn write_message<M: Encode>(&mut self, message: &M) -> Result<(), TransportError> {
        let bytes = payload::encode(message)?;
        self.write_frame(&bytes)
    }

    pub fn read_message<M: Decode<()>>(&mut self) -> Result<M, TransportError> {
        let bytes = self.read_frame()?;
        Ok(payload::decode(&bytes)?)
    }
}
