//! Connection balancing.
//!
//! A balancer takes freshly accepted TCP streams, gives each one a [`ConnectionId`] and hands it
//! to an execution context: the thread that from then on owns the socket, its partial-frame
//! buffer and its key. Nothing else ever touches that state. Requests addressed to a connection
//! (write, disconnect, key changes) travel as commands over the owning context's bounded queue,
//! and everything a context observes comes back as a [`BalancerEvent`].
//!
//! # Strategies
//!
//! - [`DirectBalancer`]: one context, driven by whoever owns the balancer through
//!   [`Balancer::poll`]. No extra threads.
//! - [`PerConnectionBalancer`]: one dedicated thread per connection, living exactly as long as
//!   the connection.
//! - [`FixedPoolBalancer`]: `N` threads started up front; each new connection goes to the
//!   context owning the fewest connections, the earliest one on ties.
//!
//! The strategy is picked once, when the balancer is built, and never changes.
//!
//! # Ordering
//!
//! A context reports `Disconnected(id)` and returns `id` to the [`IdAllocator`] under the
//! allocator's lock, so when ids are reused the old holder's disconnect is always seen before the
//! new holder's connect, and anyone who has seen the disconnect can get the id back.
//!
//! Ids are reused, so every adoption also gets a [`Serial`] that never is. Requests carrying a
//! serial only reach the connection it was issued to; once that connection is gone they are
//! dropped, even when its id already belongs to someone else.
//! `Closed` is reported once, after every context has released its sockets.
use std::{
    io,
    net::{SocketAddr, TcpStream},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        mpsc::Sender,
    },
    time::Duration,
};

use log::{info, trace, warn};
use thiserror::Error;

use crate::{
    config::{BalancerKind, ServerConfig},
    crypto::{Cipher, CipherError},
    protocol::FrameError,
};

mod context;
mod direct;
mod dispatcher;
mod id;
mod pool;
mod worker;

pub use direct::DirectBalancer;
pub use dispatcher::Dispatcher;
pub use id::{IdAllocator, IdPolicy};
pub use pool::FixedPoolBalancer;
pub use worker::PerConnectionBalancer;

pub(crate) use context::Command;

pub type ConnectionId = u64;

/// Identifies one adopted connection. Unlike its id, a serial is never handed out twice.
pub type Serial = u64;

/// Everything a balancer reports about its connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalancerEvent {
    Connected {
        id: ConnectionId,
        addr: SocketAddr,
        serial: Serial,
    },
    Message { id: ConnectionId, data: Vec<u8> },
    Disconnected { id: ConnectionId },
    Error { id: ConnectionId, error: ConnectionError },
    Closed,
}

/// Per-connection failures. None of them are fatal to the balancer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection {0} not found")]
    NotFound(ConnectionId),
    #[error("connection cannot keep up, request dropped")]
    Overloaded,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("socket error ({kind:?}): {message}")]
    Io {
        kind: io::ErrorKind,
        message: String,
    },
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        Self::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("failed to adopt accepted socket: {0}")]
    AdoptionFailed(#[source] io::Error),
    #[error("failed to start execution context: {0}")]
    Spawn(#[source] io::Error),
    #[error("execution context is no longer running")]
    ContextUnavailable,
    #[error("balancer is closed")]
    Closed,
}

/// Uniform, id-addressed API over the balancing strategies.
pub trait Balancer: Send {
    /// Adopts an accepted stream and assigns it to an execution context. A stream that cannot
    /// be adopted is dropped and no connection is created for it.
    fn balance(&mut self, stream: TcpStream) -> Result<ConnectionId, BalancerError>;

    fn dispatcher(&self) -> &Dispatcher;

    fn write(&self, id: ConnectionId, data: Vec<u8>) {
        self.dispatcher().write(id, data)
    }

    fn write_all(&self, data: Vec<u8>) {
        self.dispatcher().write_all(data)
    }

    fn disconnect(&self, id: ConnectionId) {
        self.dispatcher().disconnect(id)
    }

    /// Asks every context to drop its connections and stop. Idempotent; `Closed` is reported
    /// once every context has finished.
    fn close(&mut self);

    fn is_running(&self) -> bool;

    /// Waits up to `timeout` for every context to finish. Returns whether the balancer is
    /// closed.
    fn wait(&self, timeout: Duration) -> bool;

    /// Drives contexts that run on the caller's thread. A no-op for threaded strategies.
    fn poll(&mut self) {}

    /// Connections owned by each context, in creation order.
    fn loads(&self) -> Vec<usize> {
        self.dispatcher().loads()
    }
}

/// Builds the balancer selected by `config`.
pub fn build(
    config: &ServerConfig,
    events: Sender<BalancerEvent>,
) -> Result<Box<dyn Balancer>, BalancerError> {
    Ok(match config.balancer {
        BalancerKind::Direct => Box::new(DirectBalancer::new(config, events)),
        BalancerKind::PerConnection => Box::new(PerConnectionBalancer::new(config, events)),
        BalancerKind::FixedPool => Box::new(FixedPoolBalancer::new(config, events)?),
    })
}

/// State shared by a balancer and all of its contexts.
pub(crate) struct Shared {
    pub(crate) max_frame_size: u32,
    pub(crate) default_key: Vec<u8>,
    pub(crate) cipher: Arc<dyn Cipher>,
    pub(crate) tick: Duration,
    pub(crate) read_chunk: usize,
    pub(crate) queue_capacity: usize,
    pub(crate) close_on_frame_error: bool,
    pub(crate) max_outbox: usize,
    ids: Mutex<IdAllocator>,
    serials: AtomicU64,
    events: Sender<BalancerEvent>,
    alive: AtomicUsize,
    closing: AtomicBool,
    announced: AtomicBool,
}

impl Shared {
    pub(crate) fn new(config: &ServerConfig, events: Sender<BalancerEvent>) -> Arc<Self> {
        Arc::new(Self {
            max_frame_size: config.max_frame_size,
            default_key: config.default_key.clone(),
            cipher: Arc::clone(&config.cipher),
            tick: config.tick,
            read_chunk: config.read_chunk,
            queue_capacity: config.queue_capacity,
            close_on_frame_error: config.close_on_frame_error,
            max_outbox: config.max_outbox,
            ids: Mutex::new(IdAllocator::new(config.id_policy)),
            serials: AtomicU64::new(1),
            events,
            alive: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            announced: AtomicBool::new(false),
        })
    }

    pub(crate) fn emit(&self, event: BalancerEvent) {
        if self.events.send(event).is_err() {
            trace!("no receiver for balancer event");
        }
    }

    pub(crate) fn events(&self) -> Sender<BalancerEvent> {
        self.events.clone()
    }

    /// Allocates an id and the serial of the adoption that will use it.
    pub(crate) fn allocate(&self) -> (ConnectionId, Serial) {
        let id = self
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocate();
        (id, self.serials.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn release(&self, id: ConnectionId) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(id);
    }

    /// Reports `id` as disconnected and frees it in one step.
    pub(crate) fn retire(&self, id: ConnectionId) {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        self.emit(BalancerEvent::Disconnected { id });
        ids.release(id);
    }

    pub(crate) fn context_started(&self) {
        self.alive.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn context_finished(&self) {
        if self.alive.fetch_sub(1, Ordering::SeqCst) == 1 && self.closing.load(Ordering::SeqCst) {
            self.announce();
        }
    }

    /// Marks the balancer as closing. Returns `false` when it already was.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Reports `Closed` right away when no context is left to wait for.
    pub(crate) fn settle(&self) {
        if self.alive.load(Ordering::SeqCst) == 0 {
            self.announce();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.announced.load(Ordering::SeqCst)
    }

    fn announce(&self) {
        if !self.announced.swap(true, Ordering::SeqCst) {
            info!("balancer closed");
            self.emit(BalancerEvent::Closed);
        }
    }
}

/// Readies an accepted stream for a context: non-blocking, no delay, known peer.
pub(crate) fn prepare(stream: TcpStream) -> Result<(TcpStream, SocketAddr), BalancerError> {
    let setup = |stream: &TcpStream| -> io::Result<SocketAddr> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        stream.peer_addr()
    };

    match setup(&stream) {
        Ok(addr) => Ok((stream, addr)),
        Err(e) => {
            warn!("dropping accepted socket that could not be adopted: {e}");
            Err(BalancerError::AdoptionFailed(e))
        }
    }
}
