//! Application-side handle for one connection.
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::debug;

use crate::balancer::{Command, ConnectionId, Dispatcher, Serial};

/// A connection as the application sees it.
///
/// Created by the server when a balancer reports the connection and marked disconnected when it
/// reports the disconnect. Every operation is queued to the context owning the connection;
/// failures arrive later as error events. Clones share the connectivity flag.
///
/// A handle only ever reaches the connection it was created for. Once that connection is gone
/// its operations do nothing, even after the id has been given to a new connection.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    serial: Serial,
    addr: SocketAddr,
    connected: Arc<AtomicBool>,
    dispatcher: Dispatcher,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        serial: Serial,
        addr: SocketAddr,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            id,
            serial,
            addr,
            connected: Arc::new(AtomicBool::new(true)),
            dispatcher,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queues `data` as one frame. Returns immediately.
    pub fn write(&self, data: impl Into<Vec<u8>>) {
        if self.closed("write") {
            return;
        }
        self.dispatcher.route(Command::Write {
            id: self.id,
            serial: Some(self.serial),
            data: data.into(),
        });
    }

    /// Requests the connection be dropped. Returns immediately.
    pub fn disconnect(&self) {
        if self.closed("disconnect") {
            return;
        }
        self.dispatcher.route(Command::Disconnect {
            id: self.id,
            serial: Some(self.serial),
        });
    }

    /// Requests the connection be dropped and waits up to `timeout` for its socket to be
    /// released. A connection that is already gone returns `true` at once.
    pub fn disconnect_wait(&self, timeout: Duration) -> bool {
        if self.closed("disconnect") {
            return true;
        }
        self.dispatcher
            .disconnect_serial_wait(self.id, Some(self.serial), timeout)
    }

    /// Uses `key` for this connection only. An empty key turns encryption off for it.
    pub fn set_key(&self, key: impl Into<Vec<u8>>) {
        self.change_key(Some(key.into()));
    }

    /// Goes back to the server-wide key.
    pub fn clear_key(&self) {
        self.change_key(None);
    }

    fn change_key(&self, key: Option<Vec<u8>>) {
        if self.closed("key change") {
            return;
        }
        self.dispatcher.route(Command::SetKey {
            id: self.id,
            serial: Some(self.serial),
            key,
        });
    }

    fn closed(&self, operation: &str) -> bool {
        let closed = !self.is_connected();
        if closed {
            debug!("ignoring {operation} on closed connection {self}");
        }
        closed
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.id, self.addr)
    }
}

/// Handles are equal when they belong to the same adoption.
impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.serial == other.serial && self.addr == other.addr
    }
}

impl Eq for Connection {}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use crate::balancer::{BalancerEvent, ConnectionError};

    use super::*;

    fn detached(id: ConnectionId) -> (Connection, mpsc::Receiver<BalancerEvent>) {
        let (tx, rx) = mpsc::channel();
        let addr = "127.0.0.1:4000".parse().unwrap();
        (Connection::new(id, 1, addr, Dispatcher::new(tx)), rx)
    }

    #[test]
    fn exposes_peer() {
        let (connection, _events) = detached(3);

        assert_eq!(connection.id(), 3);
        assert_eq!(connection.ip(), IpAddr::from([127, 0, 0, 1]));
        assert_eq!(connection.port(), 4000);
        assert_eq!(connection.to_string(), "#3 (127.0.0.1:4000)");
    }

    #[test]
    fn clones_share_connectivity() {
        let (connection, _events) = detached(1);
        let clone = connection.clone();
        assert!(clone.is_connected());

        connection.mark_disconnected();
        assert!(!clone.is_connected());
        assert_eq!(clone, connection);
    }

    #[test]
    fn gone_connection_reports_nothing() {
        let (connection, events) = detached(9);
        connection.write("hi");
        connection.set_key(vec![1; 32]);
        connection.disconnect();
        assert!(connection.disconnect_wait(Duration::ZERO));

        connection.mark_disconnected();
        connection.write("hi");
        assert!(connection.disconnect_wait(Duration::ZERO));

        assert!(events.try_recv().is_err());
    }

    #[test]
    fn id_addressed_write_reports_not_found() {
        let (connection, events) = detached(9);
        connection.dispatcher.write(connection.id(), b"hi".to_vec());

        assert_eq!(
            events.try_recv().unwrap(),
            BalancerEvent::Error {
                id: 9,
                error: ConnectionError::NotFound(9)
            }
        );
    }
}
