use std::{
    sync::{Arc, PoisonError, RwLock, mpsc::Sender},
    time::{Duration, Instant},
};

use log::{debug, trace, warn};

use super::{
    BalancerEvent, ConnectionError, ConnectionId, Serial,
    context::{Command, ContextHandle, Rejected},
};

/// Cloneable, thread-safe entry point for id-addressed requests.
///
/// Requests are routed to the context currently owning the id and run there; the caller never
/// touches a socket. Failures are reported as [`BalancerEvent::Error`], never returned.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    contexts: Arc<RwLock<Vec<ContextHandle>>>,
    events: Sender<BalancerEvent>,
}

impl Dispatcher {
    pub(crate) fn new(events: Sender<BalancerEvent>) -> Self {
        Self {
            contexts: Arc::new(RwLock::new(Vec::new())),
            events,
        }
    }

    pub(crate) fn register(&self, handle: ContextHandle) {
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Forgets contexts that have finished.
    pub(crate) fn prune(&self) {
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|handle| !handle.is_finished());
    }

    pub(crate) fn handles(&self) -> Vec<ContextHandle> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn owner(&self, id: ConnectionId) -> Option<ContextHandle> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|handle| handle.owns(id))
            .cloned()
    }

    /// Whether some context currently owns `id`.
    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.owner(id).is_some()
    }

    pub fn write(&self, id: ConnectionId, data: Vec<u8>) {
        self.route(Command::Write {
            id,
            serial: None,
            data,
        });
    }

    pub fn write_all(&self, data: Vec<u8>) {
        for handle in self.handles() {
            if handle.is_finished() {
                continue;
            }
            if let Err(rejected) = handle.send(Command::WriteAll { data: data.clone() }) {
                warn!("broadcast skipped context {}: {rejected:?}", handle.index());
            }
        }
    }

    /// Requests the connection be dropped. Returns immediately.
    pub fn disconnect(&self, id: ConnectionId) {
        self.route(Command::Disconnect { id, serial: None });
    }

    /// Requests the connection be dropped and waits up to `timeout` for the owning context to
    /// release the socket. Returns whether it did.
    ///
    /// Calling this from the thread that drives a direct balancer waits out the full timeout.
    pub fn disconnect_wait(&self, id: ConnectionId, timeout: Duration) -> bool {
        self.disconnect_serial_wait(id, None, timeout)
    }

    /// Like [`Dispatcher::disconnect_wait`], limited to the adoption `serial` names. Returns
    /// `true` right away when that one is already gone.
    pub(crate) fn disconnect_serial_wait(
        &self,
        id: ConnectionId,
        serial: Option<Serial>,
        timeout: Duration,
    ) -> bool {
        let Some(owner) = self.owner(id) else {
            if serial.is_some() {
                return true;
            }
            self.report(id, ConnectionError::NotFound(id));
            return false;
        };
        match owner.send(Command::Disconnect { id, serial }) {
            Ok(()) => owner.wait_released(id, serial, timeout),
            Err(rejected) => {
                self.rejected(id, rejected);
                false
            }
        }
    }

    /// Overrides the key for one connection. An empty key disables encryption for it.
    pub fn set_key(&self, id: ConnectionId, key: Vec<u8>) {
        self.route(Command::SetKey {
            id,
            serial: None,
            key: Some(key),
        });
    }

    /// Reverts one connection to the server-wide key.
    pub fn clear_key(&self, id: ConnectionId) {
        self.route(Command::SetKey {
            id,
            serial: None,
            key: None,
        });
    }

    /// Reverts every connection to the server-wide key.
    pub fn clear_keys(&self) {
        for handle in self.handles() {
            if !handle.is_finished() && handle.send(Command::ClearKeys).is_err() {
                trace!("context {} gone while clearing keys", handle.index());
            }
        }
    }

    /// Connections owned by each live context, in creation order.
    pub fn loads(&self) -> Vec<usize> {
        self.handles()
            .iter()
            .filter(|handle| !handle.is_finished())
            .map(ContextHandle::load)
            .collect()
    }

    /// Waits up to `timeout` for every registered context to finish.
    pub(crate) fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.handles().iter().all(|handle| {
            handle.wait_finished(deadline.saturating_duration_since(Instant::now()))
        })
    }

    /// Queues an id-addressed `command` to the context owning its id.
    ///
    /// A command for an adoption that is gone is dropped without an error event: its id may
    /// already name another connection.
    pub(crate) fn route(&self, command: Command) {
        let (id, serial) = match &command {
            Command::Write { id, serial, .. }
            | Command::Disconnect { id, serial }
            | Command::SetKey { id, serial, .. } => (*id, *serial),
            Command::Adopt { .. } | Command::WriteAll { .. } | Command::ClearKeys | Command::Close => {
                trace!("not routing {command:?}");
                return;
            }
        };
        match self.owner(id) {
            Some(owner) => {
                if let Err(rejected) = owner.send(command) {
                    self.rejected(id, rejected);
                }
            }
            None if serial.is_some() => debug!("dropping request for closed connection {id}"),
            None => self.report(id, ConnectionError::NotFound(id)),
        }
    }

    fn rejected(&self, id: ConnectionId, rejected: Rejected) {
        let error = match rejected {
            Rejected::Overloaded => ConnectionError::Overloaded,
            Rejected::Gone => ConnectionError::NotFound(id),
        };
        self.report(id, error);
    }

    fn report(&self, id: ConnectionId, error: ConnectionError) {
        warn!("request for connection {id} failed: {error}");
        if self.events.send(BalancerEvent::Error { id, error }).is_err() {
            trace!("no receiver for balancer event");
        }
    }
}
