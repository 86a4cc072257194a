use std::{
    collections::BTreeMap,
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError,
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError},
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use log::{debug, error, info, trace, warn};

use crate::{
    crypto,
    protocol::{FrameDecoder, codec},
};

use super::{BalancerError, BalancerEvent, ConnectionError, ConnectionId, Serial, Shared};

/// How long an idle context sleeps on its queue before looking around again.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Reads taken from one socket per turn, so a chatty peer cannot starve the others.
const READS_PER_TURN: usize = 16;

/// Requests delivered into a context's queue.
///
/// A request with a `serial` only applies to the adoption it names; without one it applies to
/// whichever connection holds `id` when the request runs.
#[derive(Debug)]
pub(crate) enum Command {
    Adopt {
        id: ConnectionId,
        serial: Serial,
        stream: TcpStream,
        addr: SocketAddr,
    },
    Write {
        id: ConnectionId,
        serial: Option<Serial>,
        data: Vec<u8>,
    },
    WriteAll {
        data: Vec<u8>,
    },
    Disconnect {
        id: ConnectionId,
        serial: Option<Serial>,
    },
    SetKey {
        id: ConnectionId,
        serial: Option<Serial>,
        key: Option<Vec<u8>>,
    },
    ClearKeys,
    Close,
}

/// Why a command could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejected {
    Overloaded,
    Gone,
}

/// One-shot completion flag that can be waited on with a timeout.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub(crate) fn complete(&self) {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_complete(&self) -> bool {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let guard = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Ids owned by one context, with the serial of their adoption. Its size is the context's load.
#[derive(Debug, Default)]
pub(crate) struct Ownership {
    ids: Mutex<BTreeMap<ConnectionId, Serial>>,
    released: Condvar,
}

/// Whether the adoption `held` is the one `serial` names. No serial names any.
fn names(serial: Option<Serial>, held: Serial) -> bool {
    serial.is_none_or(|serial| serial == held)
}

impl Ownership {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, Serial>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: ConnectionId, serial: Serial) {
        self.lock().insert(id, serial);
    }

    fn remove(&self, id: ConnectionId) {
        self.lock().remove(&id);
        self.released.notify_all();
    }

    fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn wait_released(&self, id: ConnectionId, serial: Option<Serial>, timeout: Duration) -> bool {
        let held = |ids: &BTreeMap<ConnectionId, Serial>| {
            ids.get(&id).is_some_and(|held| names(serial, *held))
        };
        let guard = self.lock();
        let (guard, _) = self
            .released
            .wait_timeout_while(guard, timeout, |ids| held(ids))
            .unwrap_or_else(PoisonError::into_inner);
        !held(&*guard)
    }
}

/// The balancer's view of a context: its queue and what it owns.
#[derive(Debug, Clone)]
pub(crate) struct ContextHandle {
    index: usize,
    sender: SyncSender<Command>,
    owned: Arc<Ownership>,
    finished: Arc<Completion>,
    driver: Arc<OnceLock<ThreadId>>,
}

impl ContextHandle {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn owns(&self, id: ConnectionId) -> bool {
        self.owned.contains(id)
    }

    pub(crate) fn load(&self) -> usize {
        self.owned.len()
    }

    /// Counts `id` against this context before the context has adopted it.
    pub(crate) fn reserve(&self, id: ConnectionId, serial: Serial) {
        self.owned.insert(id, serial);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.is_complete()
    }

    pub(crate) fn wait_finished(&self, timeout: Duration) -> bool {
        self.finished.wait(timeout)
    }

    pub(crate) fn wait_released(
        &self,
        id: ConnectionId,
        serial: Option<Serial>,
        timeout: Duration,
    ) -> bool {
        self.owned.wait_released(id, serial, timeout)
    }

    /// Queues `command`. Blocks while the queue is full, except on the thread driving the
    /// context, which would otherwise wait on itself.
    pub(crate) fn send(&self, command: Command) -> Result<(), Rejected> {
        if self.driver.get() == Some(&thread::current().id()) {
            self.sender.try_send(command).map_err(|e| match e {
                TrySendError::Full(_) => Rejected::Overloaded,
                TrySendError::Disconnected(_) => Rejected::Gone,
            })
        } else {
            self.sender.send(command).map_err(|_| Rejected::Gone)
        }
    }

    /// Allocates an id and hands `stream` to this context under it.
    pub(crate) fn assign(
        &self,
        shared: &Shared,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<ConnectionId, BalancerError> {
        let (id, serial) = shared.allocate();
        self.reserve(id, serial);

        let adopt = Command::Adopt {
            id,
            serial,
            stream,
            addr,
        };
        if self.send(adopt).is_err() {
            self.owned.remove(id);
            shared.release(id);
            warn!("context {} is gone, dropping connection from {addr}", self.index);
            return Err(BalancerError::ContextUnavailable);
        }

        debug!("connection {id} from {addr} assigned to context {}", self.index);
        Ok(id)
    }
}

/// A live connection as seen by its owning context.
#[derive(Debug)]
struct Link {
    serial: Serial,
    stream: TcpStream,
    addr: SocketAddr,
    decoder: FrameDecoder,
    key: Option<Vec<u8>>,
    outbox: Vec<u8>,
}

/// Execution context: the only place a connection's socket and buffers are touched.
pub(crate) struct Context {
    index: usize,
    shared: Arc<Shared>,
    receiver: Receiver<Command>,
    owned: Arc<Ownership>,
    finished: Arc<Completion>,
    driver: Arc<OnceLock<ThreadId>>,
    links: BTreeMap<ConnectionId, Link>,
    buf: Vec<u8>,
    single_use: bool,
    adopted: bool,
    closing: bool,
    done: bool,
}

/// Creates a context and the handle used to reach it. A `single_use` context finishes once
/// its first connection is gone.
pub(crate) fn pair(index: usize, shared: &Arc<Shared>, single_use: bool) -> (ContextHandle, Context) {
    let (sender, receiver) = mpsc::sync_channel(shared.queue_capacity);
    let owned = Arc::new(Ownership::default());
    let finished = Arc::new(Completion::default());
    let driver = Arc::new(OnceLock::new());
    shared.context_started();

    let handle = ContextHandle {
        index,
        sender,
        owned: Arc::clone(&owned),
        finished: Arc::clone(&finished),
        driver: Arc::clone(&driver),
    };
    let context = Context {
        index,
        shared: Arc::clone(shared),
        receiver,
        owned,
        finished,
        driver,
        links: BTreeMap::new(),
        buf: vec![0; shared.read_chunk],
        single_use,
        adopted: false,
        closing: false,
        done: false,
    };
    (handle, context)
}

impl Context {
    /// Thread body for threaded strategies.
    pub(crate) fn run(mut self) {
        debug!("context {} started", self.index);
        loop {
            let wait = if self.links.is_empty() {
                IDLE_WAIT
            } else {
                self.shared.tick
            };
            if !self.turn(wait) {
                break;
            }
        }
    }

    /// Waits up to `wait` for commands, runs every queued one, then services all sockets.
    /// Returns `false` once the context has nothing left to do.
    pub(crate) fn turn(&mut self, wait: Duration) -> bool {
        self.driver.get_or_init(|| thread::current().id());

        match self.receiver.recv_timeout(wait) {
            Ok(command) => self.execute(command),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => self.closing = true,
        }
        while let Ok(command) = self.receiver.try_recv() {
            self.execute(command);
        }

        if !self.closing {
            self.service();
        }
        if self.single_use && self.adopted && self.links.is_empty() {
            self.closing = true;
        }
        !self.closing
    }

    pub(crate) fn execute(&mut self, command: Command) {
        match command {
            Command::Adopt {
                id,
                serial,
                stream,
                addr,
            } => self.adopt(id, serial, stream, addr),
            Command::Write { id, serial, data } => self.write(id, serial, &data),
            Command::WriteAll { data } => {
                let ids: Vec<ConnectionId> = self.links.keys().copied().collect();
                for id in ids {
                    self.write(id, None, &data);
                }
            }
            Command::Disconnect { id, serial } => {
                if self.link(id, serial).is_some() {
                    self.destroy(id, None);
                } else {
                    debug!("connection {id} already closed");
                }
            }
            Command::SetKey { id, serial, key } => match self.link(id, serial) {
                Some(link) => link.key = key,
                None => debug!("ignoring key change for closed connection {id}"),
            },
            Command::ClearKeys => {
                for link in self.links.values_mut() {
                    link.key = None;
                }
            }
            Command::Close => self.closing = true,
        }
    }

    /// The live connection under `id`, provided it is the adoption `serial` names.
    fn link(&mut self, id: ConnectionId, serial: Option<Serial>) -> Option<&mut Link> {
        self.links
            .get_mut(&id)
            .filter(|link| names(serial, link.serial))
    }

    fn adopt(&mut self, id: ConnectionId, serial: Serial, stream: TcpStream, addr: SocketAddr) {
        if self.closing {
            self.reject(Command::Adopt {
                id,
                serial,
                stream,
                addr,
            });
            return;
        }

        self.owned.insert(id, serial);
        self.links.insert(
            id,
            Link {
                serial,
                stream,
                addr,
                decoder: FrameDecoder::new(self.shared.max_frame_size),
                key: None,
                outbox: Vec::new(),
            },
        );
        self.adopted = true;

        info!("connection {id} from {addr} adopted by context {}", self.index);
        self.shared.emit(BalancerEvent::Connected { id, addr, serial });
    }

    fn write(&mut self, id: ConnectionId, serial: Option<Serial>, data: &[u8]) {
        let shared = Arc::clone(&self.shared);
        let Some(link) = self.link(id, serial) else {
            debug!("dropping write for closed connection {id}");
            return;
        };

        let key = link.key.as_deref().unwrap_or(&shared.default_key);
        let frame = crypto::seal(shared.cipher.as_ref(), key, data)
            .map_err(ConnectionError::from)
            .and_then(|sealed| {
                codec::encode(&sealed, shared.max_frame_size).map_err(ConnectionError::from)
            });

        match frame {
            // A single frame always fits; beyond that the peer has to drain what is queued.
            Ok(frame)
                if !link.outbox.is_empty()
                    && link.outbox.len() + frame.len() > shared.max_outbox =>
            {
                warn!(
                    "connection {id} has {} unsent bytes, dropping a {} byte frame",
                    link.outbox.len(),
                    frame.len()
                );
                shared.emit(BalancerEvent::Error {
                    id,
                    error: ConnectionError::Overloaded,
                });
            }
            Ok(frame) => {
                trace!("queued {} bytes for connection {id}", frame.len());
                link.outbox.extend_from_slice(&frame);
                if let Err(e) = flush(link) {
                    self.destroy(id, Some(e.into()));
                }
            }
            Err(error) => {
                warn!("failed to write to connection {id}: {error}");
                shared.emit(BalancerEvent::Error { id, error });
            }
        }
    }

    fn service(&mut self) {
        let ids: Vec<ConnectionId> = self.links.keys().copied().collect();
        for id in ids {
            match self.pump(id) {
                Ok(true) => {}
                Ok(false) => self.destroy(id, None),
                Err(error) => self.destroy(id, Some(error)),
            }
        }
    }

    /// Reads what `id` has available, reports every completed frame and flushes pending
    /// output. `Ok(false)` means the connection should be dropped.
    fn pump(&mut self, id: ConnectionId) -> Result<bool, ConnectionError> {
        let Some(link) = self.links.get_mut(&id) else {
            return Ok(true);
        };

        for _ in 0..READS_PER_TURN {
            let n = match link.stream.read(&mut self.buf) {
                Ok(0) => return Ok(false),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            for decoded in link.decoder.decode(&self.buf[..n]) {
                let key = link.key.as_deref().unwrap_or(&self.shared.default_key);
                let payload = decoded.map_err(ConnectionError::from).and_then(|frame| {
                    crypto::open(self.shared.cipher.as_ref(), key, frame)
                        .map_err(ConnectionError::from)
                });

                match payload {
                    Ok(data) => self.shared.emit(BalancerEvent::Message { id, data }),
                    Err(error) => {
                        warn!("connection {id}: {error}");
                        let fatal =
                            matches!(error, ConnectionError::Frame(_)) && self.shared.close_on_frame_error;
                        self.shared.emit(BalancerEvent::Error { id, error });
                        if fatal {
                            return Ok(false);
                        }
                    }
                }
            }
        }

        flush(link)?;
        Ok(true)
    }

    /// Tears down `id`. Runs at most once per connection: the link is gone afterwards.
    fn destroy(&mut self, id: ConnectionId, error: Option<ConnectionError>) {
        let Some(link) = self.links.remove(&id) else {
            return;
        };

        if let Some(error) = error {
            error!("connection {id} failed: {error}");
            self.shared.emit(BalancerEvent::Error { id, error });
        }
        if link.decoder.buffered() > 0 {
            debug!(
                "discarding {} bytes of partial frame from connection {id}",
                link.decoder.buffered()
            );
        }
        if !link.outbox.is_empty() {
            debug!("dropping {} unsent bytes for connection {id}", link.outbox.len());
        }
        if let Err(e) = link.stream.shutdown(Shutdown::Both) {
            trace!("shutdown of connection {id}: {e}");
        }
        let addr = link.addr;
        drop(link);

        self.owned.remove(id);
        self.shared.retire(id);
        info!("connection {id} from {addr} closed");
    }

    fn reject(&mut self, command: Command) {
        match command {
            Command::Adopt { id, addr, .. } => {
                self.owned.remove(id);
                self.shared.release(id);
                warn!(
                    "context {} closed before adopting connection {id} from {addr}",
                    self.index
                );
            }
            other => trace!("context {} discarding {other:?}", self.index),
        }
    }

    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.closing = true;

        let ids: Vec<ConnectionId> = self.links.keys().copied().collect();
        for id in ids {
            self.destroy(id, None);
        }
        while let Ok(command) = self.receiver.try_recv() {
            self.reject(command);
        }

        self.shared.context_finished();
        self.finished.complete();
        debug!("context {} finished", self.index);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Writes as much of the outbox as the socket takes without blocking.
fn flush(link: &mut Link) -> io::Result<()> {
    while !link.outbox.is_empty() {
        match link.stream.write(&link.outbox) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => {
                link.outbox.drain(..n);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// A context running on its own thread.
#[derive(Debug)]
pub(crate) struct Worker {
    handle: ContextHandle,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn(
        index: usize,
        shared: &Arc<Shared>,
        single_use: bool,
    ) -> Result<Self, BalancerError> {
        let (handle, context) = pair(index, shared, single_use);
        let thread = thread::Builder::new()
            .name(format!("framewire-ctx-{index}"))
            .spawn(move || context.run())
            .map_err(BalancerError::Spawn)?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub(crate) fn handle(&self) -> &ContextHandle {
        &self.handle
    }

    pub(crate) fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            debug!("joining context {}", self.handle.index);
            if thread.join().is_err() {
                error!("context {} panicked", self.handle.index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn completion_wait_times_out() {
        let completion = Completion::default();
        let started = Instant::now();

        assert!(!completion.wait(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));

        completion.complete();
        assert!(completion.wait(Duration::from_millis(20)));
        assert!(completion.is_complete());
    }

    #[test]
    fn ownership_release_wakes_waiter() {
        let owned = Arc::new(Ownership::default());
        owned.insert(7, 1);

        let waiter = {
            let owned = Arc::clone(&owned);
            thread::spawn(move || owned.wait_released(7, Some(1), Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        owned.remove(7);

        assert!(waiter.join().unwrap());
        assert_eq!(owned.len(), 0);
    }

    #[test]
    fn ownership_wait_times_out() {
        let owned = Ownership::default();
        owned.insert(1, 1);
        assert!(!owned.wait_released(1, None, Duration::from_millis(10)));
        assert!(owned.wait_released(2, None, Duration::from_millis(10)));
    }

    #[test]
    fn later_adoption_does_not_hold_an_earlier_serial() {
        let owned = Ownership::default();
        owned.insert(1, 5);

        assert!(owned.wait_released(1, Some(4), Duration::ZERO));
        assert!(!owned.wait_released(1, Some(5), Duration::ZERO));
        assert!(owned.contains(1));
    }
}
