//! Blocking client for a framewire server.
//!
//! The client speaks the same framing and encryption as the server, one frame per
//! [`Client::send`] and one per [`Client::recv`]. It does not reconnect: once the server goes
//! away every call fails with [`TransportError::Closed`] or an I/O error.
use std::{
    io,
    net::{Shutdown, SocketAddr, TcpStream},
    sync::Arc,
    time::Duration,
};

use bincode::{Decode, Encode};
use log::{debug, info};
use thiserror::Error;

use crate::{
    crypto::Cipher,
    protocol::{DEFAULT_MAX_FRAME_SIZE, FrameTransport, TransportError},
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct Client {
    transport: FrameTransport<TcpStream>,
    peer: SocketAddr,
}

impl Client {
    /// Connects to `addr`, giving up after `timeout`.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, ClientError> {
        Self::connect_with(addr, timeout, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Like [`Client::connect`], accepting frames of up to `max_frame_size` bytes.
    pub fn connect_with(
        addr: SocketAddr,
        timeout: Duration,
        max_frame_size: u32,
    ) -> Result<Self, ClientError> {
        let connect = || -> io::Result<TcpStream> {
            let stream = TcpStream::connect_timeout(&addr, timeout)?;
            stream.set_nodelay(true)?;
            Ok(stream)
        };
        let stream = connect().map_err(|source| ClientError::Connect { addr, source })?;

        info!("connected to {addr}");
        Ok(Self {
            transport: FrameTransport::new(stream, max_frame_size),
            peer: addr,
        })
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.transport = self.transport.with_cipher(cipher);
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self
            .transport
            .get_ref()
            .local_addr()
            .map_err(TransportError::from)?)
    }

    /// Key for both directions. An empty key sends and expects plaintext.
    pub fn set_key(&mut self, key: impl Into<Vec<u8>>) {
        self.transport.set_key(key.into());
    }

    pub fn send(&mut self, data: &[u8]) -> Result<(), ClientError> {
        self.transport.write_frame(data)?;
        debug!("sent {} bytes to {}", data.len(), self.peer);
        Ok(())
    }

    pub fn send_message<M: Encode>(&mut self, message: &M) -> Result<(), ClientError> {
        Ok(self.transport.write_message(message)?)
    }

    /// Blocks until the next frame arrives.
    pub fn recv(&mut self) -> Result<Vec<u8>, ClientError> {
        self.read_timeout(None)?;
        Ok(self.transport.read_frame()?)
    }

    /// Waits up to `timeout` for the next frame. `Ok(None)` when none arrived in time; a frame
    /// cut off by the timeout is kept and completed by the next call.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ClientError> {
        // A zero read timeout is rejected by the socket.
        self.read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match self.transport.read_frame() {
            Ok(frame) => Ok(Some(frame)),
            Err(e) if e.is_timeout() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn recv_message<M: Decode<()>>(&mut self) -> Result<M, ClientError> {
        self.read_timeout(None)?;
        Ok(self.transport.read_message()?)
    }

    /// Shuts the connection down in both directions.
    pub fn close(self) -> Result<(), ClientError> {
        match self.transport.get_ref().shutdown(Shutdown::Both) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
            Err(e) => return Err(TransportError::from(e).into()),
        }
        info!("disconnected from {}", self.peer);
        Ok(())
    }

    fn read_timeout(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        self.transport
            .get_ref()
            .set_read_timeout(timeout)
            .map_err(|e| TransportError::from(e).into())
    }
}
