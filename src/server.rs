//! Server orchestration.
//!
//! A [`Server`] binds a listener, hands every accepted stream to the balancer selected in its
//! [`ServerConfig`] and turns the balancer's id-keyed events into [`Connection`] handles for the
//! application's [`Handler`]. All of this happens on one service thread, which also drives the
//! context of a direct balancer.
//!
//! # Lifecycle
//!
//! ```text
//! Stopped -> Starting -> Listening -> Closing -> Closed
//!               |
//!               +-> Stopped (bind failed)
//! ```
//!
//! A closed server can be started again; it keeps its handler.
//!
//! # Example
//!
//! ```no_run
//! use framewire::{Connection, Handler, Server, ServerConfig};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&mut self, connection: &Connection, data: Vec<u8>) {
//!         connection.write(data);
//!     }
//! }
//!
//! let mut server = Server::new(ServerConfig::default());
//! server.set_handler(Echo).unwrap();
//! let addr = server.start("127.0.0.1", 0).unwrap();
//! println!("listening on {addr}");
//! ```
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    net::{SocketAddr, TcpListener},
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, trace, warn};
use thiserror::Error;

use crate::{
    balancer::{self, Balancer, BalancerError, BalancerEvent, ConnectionError, ConnectionId, Dispatcher},
    config::{ConfigError, ServerConfig},
    connection::Connection,
};

/// How long dropping a running server waits for it to close.
const DROP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Listening,
    Closing,
    Closed,
}

impl ServerState {
    pub fn is_running(self) -> bool {
        matches!(self, Self::Starting | Self::Listening | Self::Closing)
    }
}

/// Events as delivered through a channel, see the [`Handler`] impl for [`Sender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected(Connection),
    Message(Connection, Vec<u8>),
    Disconnected(Connection),
    Error(Connection, ConnectionError),
    Closed,
}

/// Receives a server's events on its service thread.
///
/// Handlers must not block for long: while one runs, no other event is delivered and, with a
/// direct balancer, no socket is serviced.
pub trait Handler: Send + 'static {
    fn on_connected(&mut self, _connection: &Connection) {}

    fn on_message(&mut self, connection: &Connection, data: Vec<u8>);

    fn on_disconnected(&mut self, _connection: &Connection) {}

    fn on_error(&mut self, connection: &Connection, error: ConnectionError) {
        warn!("connection {connection}: {error}");
    }

    fn on_closed(&mut self) {}
}

impl Handler for Sender<ServerEvent> {
    fn on_connected(&mut self, connection: &Connection) {
        forward(self, ServerEvent::Connected(connection.clone()));
    }

    fn on_message(&mut self, connection: &Connection, data: Vec<u8>) {
        forward(self, ServerEvent::Message(connection.clone(), data));
    }

    fn on_disconnected(&mut self, connection: &Connection) {
        forward(self, ServerEvent::Disconnected(connection.clone()));
    }

    fn on_error(&mut self, connection: &Connection, error: ConnectionError) {
        forward(self, ServerEvent::Error(connection.clone(), error));
    }

    fn on_closed(&mut self) {
        forward(self, ServerEvent::Closed);
    }
}

fn forward(sender: &Sender<ServerEvent>, event: ServerEvent) {
    if sender.send(event).is_err() {
        trace!("server event receiver is gone");
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no handler configured")]
    HandlerNotConfigured,
    #[error("server is already running")]
    AlreadyRunning,
    #[error("server is not running")]
    NotRunning,
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("failed to listen: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to start server thread: {0}")]
    Spawn(#[source] io::Error),
    #[error(transparent)]
    Balancer(#[from] BalancerError),
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),
}

type Registry = Arc<Mutex<HashMap<ConnectionId, Connection>>>;

fn registry(registry: &Registry) -> MutexGuard<'_, HashMap<ConnectionId, Connection>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Server state that can be waited on.
#[derive(Debug)]
struct Status {
    state: Mutex<ServerState>,
    changed: Condvar,
}

impl Status {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState::Stopped),
            changed: Condvar::new(),
        })
    }

    fn get(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: ServerState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!("server {:?} -> {state:?}", *current);
        *current = state;
        self.changed.notify_all();
    }

    /// Waits up to `timeout` for the server to stop running.
    fn wait_stopped(&self, timeout: Duration) -> bool {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| state.is_running())
            .unwrap_or_else(PoisonError::into_inner);
        !guard.is_running()
    }
}

enum Control {
    Close,
}

/// Cloneable, thread-safe access to a running server.
///
/// Requests for an id that is not currently connected fail with
/// [`ServerError::ConnectionNotFound`] right away. Everything else is reported to the handler.
#[derive(Clone)]
pub struct ServerHandle {
    dispatcher: Dispatcher,
    registry: Registry,
    control: Sender<Control>,
    status: Arc<Status>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        self.status.get()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        registry(&self.registry).get(&id).cloned()
    }

    /// Connected connections, ordered by id.
    pub fn connections(&self) -> Vec<Connection> {
        let mut connections: Vec<Connection> =
            registry(&self.registry).values().cloned().collect();
        connections.sort_by_key(Connection::id);
        connections
    }

    pub fn write(&self, id: ConnectionId, data: impl Into<Vec<u8>>) -> Result<(), ServerError> {
        self.known(id)?;
        self.dispatcher.write(id, data.into());
        Ok(())
    }

    pub fn write_all(&self, data: impl Into<Vec<u8>>) {
        self.dispatcher.write_all(data.into());
    }

    pub fn disconnect(&self, id: ConnectionId) -> Result<(), ServerError> {
        self.known(id)?;
        self.dispatcher.disconnect(id);
        Ok(())
    }

    /// Disconnects `id` and waits up to `timeout` for its socket to be released.
    pub fn disconnect_wait(&self, id: ConnectionId, timeout: Duration) -> Result<bool, ServerError> {
        self.known(id)?;
        Ok(self.dispatcher.disconnect_wait(id, timeout))
    }

    pub fn set_key(&self, id: ConnectionId, key: impl Into<Vec<u8>>) -> Result<(), ServerError> {
        self.known(id)?;
        self.dispatcher.set_key(id, key.into());
        Ok(())
    }

    pub fn clear_key(&self, id: ConnectionId) -> Result<(), ServerError> {
        self.known(id)?;
        self.dispatcher.clear_key(id);
        Ok(())
    }

    /// Reverts every connection to the server-wide key.
    pub fn clear_keys(&self) {
        self.dispatcher.clear_keys();
    }

    /// Stops accepting and closes every connection. Returns immediately and may be called any
    /// number of times; use [`ServerHandle::wait`] to wait for the close to finish.
    pub fn close(&self) {
        if self.control.send(Control::Close).is_err() {
            trace!("server already stopped");
        }
    }

    /// Waits up to `timeout` for the server to stop. Returns whether it has.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.status.wait_stopped(timeout)
    }

    fn known(&self, id: ConnectionId) -> Result<(), ServerError> {
        if registry(&self.registry).contains_key(&id) {
            Ok(())
        } else {
            Err(ServerError::ConnectionNotFound(id))
        }
    }
}

pub struct Server {
    config: ServerConfig,
    handler: Option<Box<dyn Handler>>,
    status: Arc<Status>,
    handle: Option<ServerHandle>,
    thread: Option<JoinHandle<Box<dyn Handler>>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            handler: None,
            status: Status::new(),
            handle: None,
            thread: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn set_handler(&mut self, handler: impl Handler) -> Result<(), ServerError> {
        if self.status.get().is_running() {
            return Err(ServerError::AlreadyRunning);
        }
        self.reclaim();
        self.handler = Some(Box::new(handler));
        Ok(())
    }

    /// Binds `address:port` and starts serving. Port `0` picks a free port; the bound address
    /// is returned.
    pub fn start(&mut self, address: &str, port: u16) -> Result<SocketAddr, ServerError> {
        if self.status.get().is_running() {
            return Err(ServerError::AlreadyRunning);
        }
        self.reclaim();
        if self.handler.is_none() {
            return Err(ServerError::HandlerNotConfigured);
        }
        self.config.validate()?;

        self.status.set(ServerState::Starting);
        let (listener, local_addr) = match listen(address, port) {
            Ok(bound) => bound,
            Err(e) => {
                error!("failed to listen on {address}:{port}: {e}");
                self.status.set(ServerState::Stopped);
                return Err(ServerError::Bind(e));
            }
        };

        let (events_tx, events) = mpsc::channel();
        let balancer = match balancer::build(&self.config, events_tx) {
            Ok(balancer) => balancer,
            Err(e) => {
                self.status.set(ServerState::Stopped);
                return Err(e.into());
            }
        };

        let (control_tx, control) = mpsc::channel();
        let registry = Registry::default();
        let handle = ServerHandle {
            dispatcher: balancer.dispatcher().clone(),
            registry: Arc::clone(&registry),
            control: control_tx,
            status: Arc::clone(&self.status),
            local_addr,
        };
        let Some(handler) = self.handler.take() else {
            self.status.set(ServerState::Stopped);
            return Err(ServerError::HandlerNotConfigured);
        };

        let service = Service {
            listener: Some(listener),
            dispatcher: balancer.dispatcher().clone(),
            balancer: Some(balancer),
            events,
            control,
            handler,
            registry,
            status: Arc::clone(&self.status),
            tick: self.config.tick,
        };
        // The status has to be set before the thread can observe `Closed` and overwrite it.
        self.status.set(ServerState::Listening);
        let thread = thread::Builder::new()
            .name("framewire-server".into())
            .spawn(move || service.run())
            .map_err(|e| {
                self.status.set(ServerState::Stopped);
                ServerError::Spawn(e)
            })?;

        info!("listening on {local_addr} ({:?} balancer)", self.config.balancer);
        self.thread = Some(thread);
        self.handle = Some(handle.clone());
        Ok(local_addr)
    }

    pub fn state(&self) -> ServerState {
        self.status.get()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Handle to the server started last.
    pub fn handle(&self) -> Result<ServerHandle, ServerError> {
        self.handle.clone().ok_or(ServerError::NotRunning)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.as_ref().map(ServerHandle::local_addr)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.handle.as_ref().and_then(|handle| handle.connection(id))
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.handle
            .as_ref()
            .map(ServerHandle::connections)
            .unwrap_or_default()
    }

    pub fn write(&self, id: ConnectionId, data: impl Into<Vec<u8>>) -> Result<(), ServerError> {
        self.handle()?.write(id, data)
    }

    pub fn write_all(&self, data: impl Into<Vec<u8>>) -> Result<(), ServerError> {
        self.handle()?.write_all(data);
        Ok(())
    }

    pub fn disconnect(&self, id: ConnectionId) -> Result<(), ServerError> {
        self.handle()?.disconnect(id)
    }

    pub fn disconnect_wait(&self, id: ConnectionId, timeout: Duration) -> Result<bool, ServerError> {
        self.handle()?.disconnect_wait(id, timeout)
    }

    pub fn set_key(&self, id: ConnectionId, key: impl Into<Vec<u8>>) -> Result<(), ServerError> {
        self.handle()?.set_key(id, key)
    }

    pub fn clear_key(&self, id: ConnectionId) -> Result<(), ServerError> {
        self.handle()?.clear_key(id)
    }

    pub fn clear_keys(&self) -> Result<(), ServerError> {
        self.handle()?.clear_keys();
        Ok(())
    }

    /// See [`ServerHandle::close`]. A server that never started is left as is.
    pub fn close(&self) {
        if let Some(handle) = &self.handle {
            handle.close();
        }
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        self.status.wait_stopped(timeout)
    }

    /// Joins the service thread of a server that has stopped and takes its handler back.
    fn reclaim(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        match thread.join() {
            Ok(handler) => {
                if self.handler.is_none() {
                    self.handler = Some(handler);
                }
            }
            Err(_) => error!("server thread panicked"),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if !self.is_running() {
            self.reclaim();
            return;
        }
        self.close();
        if self.wait(DROP_TIMEOUT) {
            self.reclaim();
        } else {
            warn!("server did not close within {DROP_TIMEOUT:?}, detaching its thread");
        }
    }
}

fn listen(address: &str, port: u16) -> io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind((address, port))?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    Ok((listener, local_addr))
}

/// The service thread: accepts, drives the balancer and delivers its events.
struct Service {
    listener: Option<TcpListener>,
    dispatcher: Dispatcher,
    /// Dropped, and its threads joined, as soon as it has closed.
    balancer: Option<Box<dyn Balancer>>,
    events: Receiver<BalancerEvent>,
    control: Receiver<Control>,
    handler: Box<dyn Handler>,
    registry: Registry,
    status: Arc<Status>,
    tick: Duration,
}

impl Service {
    fn run(mut self) -> Box<dyn Handler> {
        loop {
            self.accept();
            if let Some(balancer) = self.balancer.as_mut() {
                balancer.poll();
            }

            match self.control.try_recv() {
                Ok(Control::Close) => self.begin_close(),
                Err(TryRecvError::Disconnected) => {
                    debug!("every server handle is gone, closing");
                    self.begin_close();
                }
                Err(TryRecvError::Empty) => {}
            }

            let event = match self.events.recv_timeout(self.tick) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    error!("balancer event channel closed unexpectedly");
                    self.finish();
                    break;
                }
            };
            if self.deliver(event) {
                break;
            }
            // Deliver what else is pending before accepting more.
            let mut closed = false;
            while let Ok(event) = self.events.try_recv() {
                if self.deliver(event) {
                    closed = true;
                    break;
                }
            }
            if closed {
                break;
            }
        }
        info!("server closed");
        self.handler
    }

    fn accept(&mut self) {
        let (Some(listener), Some(balancer)) = (&self.listener, self.balancer.as_mut()) else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, addr)) => match balancer.balance(stream) {
                    Ok(id) => debug!("accepted {addr} as connection {id}"),
                    Err(e) => warn!("dropped connection from {addr}: {e}"),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn begin_close(&mut self) {
        if self.listener.take().is_none() {
            return;
        }
        info!("closing server");
        self.status.set(ServerState::Closing);
        if let Some(balancer) = self.balancer.as_mut() {
            balancer.close();
        }
    }

    fn connection(&self, id: ConnectionId) -> Option<Connection> {
        registry(&self.registry).get(&id).cloned()
    }

    /// Hands one event to the handler. Returns `true` once the balancer has closed.
    fn deliver(&mut self, event: BalancerEvent) -> bool {
        match event {
            BalancerEvent::Connected { id, addr, serial } => {
                let connection = Connection::new(id, serial, addr, self.dispatcher.clone());
                if let Some(stale) = registry(&self.registry).insert(id, connection.clone()) {
                    warn!("connection {id} registered twice, replacing {stale}");
                    stale.mark_disconnected();
                }
                info!("connection {connection} established");
                self.handler.on_connected(&connection);
            }
            BalancerEvent::Message { id, data } => match self.connection(id) {
                Some(connection) => {
                    trace!("{} bytes from connection {id}", data.len());
                    self.handler.on_message(&connection, data);
                }
                None => warn!("dropping message for unknown connection {id}"),
            },
            BalancerEvent::Error { id, error } => match self.connection(id) {
                Some(connection) => self.handler.on_error(&connection, error),
                None => warn!("dropping error for unknown connection {id}: {error}"),
            },
            BalancerEvent::Disconnected { id } => {
                let removed = registry(&self.registry).remove(&id);
                match removed {
                    Some(connection) => {
                        connection.mark_disconnected();
                        info!("connection {connection} closed");
                        self.handler.on_disconnected(&connection);
                    }
                    None => warn!("disconnect for unknown connection {id}"),
                }
            }
            BalancerEvent::Closed => {
                self.finish();
                return true;
            }
        }
        false
    }

    fn finish(&mut self) {
        for (_, connection) in registry(&self.registry).drain() {
            connection.mark_disconnected();
        }
        self.listener = None;
        if let Some(balancer) = self.balancer.take() {
            debug!("joining balancer");
            drop(balancer);
        }
        self.status.set(ServerState::Closed);
        self.handler.on_closed();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use crate::{
        client::{Client, ClientError},
        config::BalancerKind,
        crypto::{Cipher, CipherError, XChaCha, generate_key},
        protocol::TransportError,
    };

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn serve(config: ServerConfig) -> (Server, Receiver<ServerEvent>, SocketAddr) {
        let (tx, rx) = mpsc::channel();
        let mut server = Server::new(config);
        server.set_handler(tx).unwrap();
        let addr = server.start("127.0.0.1", 0).unwrap();
        (server, rx, addr)
    }

    fn next(events: &Receiver<ServerEvent>, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
        let deadline = Instant::now() + TIMEOUT;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match events.recv_timeout(left) {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        panic!("expected server event did not arrive");
    }

    fn connected(events: &Receiver<ServerEvent>) -> Connection {
        match next(events, |e| matches!(e, ServerEvent::Connected(_))) {
            ServerEvent::Connected(connection) => connection,
            _ => unreachable!(),
        }
    }

    fn message(events: &Receiver<ServerEvent>) -> (Connection, Vec<u8>) {
        match next(events, |e| matches!(e, ServerEvent::Message(..))) {
            ServerEvent::Message(connection, data) => (connection, data),
            _ => unreachable!(),
        }
    }

    fn connect(addr: SocketAddr) -> Client {
        Client::connect(addr, TIMEOUT).unwrap()
    }

    #[test]
    fn echo_with_every_balancer() {
        for kind in [
            BalancerKind::Direct,
            BalancerKind::PerConnection,
            BalancerKind::FixedPool,
        ] {
            let (server, events, addr) = serve(ServerConfig::default().with_balancer(kind));
            assert_eq!(server.state(), ServerState::Listening);

            let mut client = connect(addr);
            let connection = connected(&events);
            assert_eq!(connection.id(), 1);
            assert_eq!(Some(connection.addr()), client.local_addr().ok());

            client.send(b"hello").unwrap();
            let (from, data) = message(&events);
            assert_eq!(from, connection);
            assert_eq!(data, b"hello");

            from.write(data);
            assert_eq!(client.recv().unwrap(), b"hello", "{kind:?}");

            client.send(b"").unwrap();
            assert_eq!(message(&events).1, b"");

            server.close();
            assert!(server.wait(TIMEOUT));
            assert_eq!(server.state(), ServerState::Closed);
        }
    }

    #[test]
    fn start_without_handler() {
        let mut server = Server::new(ServerConfig::default());

        assert!(matches!(
            server.start("127.0.0.1", 0),
            Err(ServerError::HandlerNotConfigured)
        ));
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(matches!(server.handle(), Err(ServerError::NotRunning)));
    }

    #[test]
    fn start_while_running() {
        let (mut server, _events, _) = serve(ServerConfig::default());

        assert!(matches!(
            server.start("127.0.0.1", 0),
            Err(ServerError::AlreadyRunning)
        ));
        let (tx, _rx) = mpsc::channel();
        assert!(matches!(
            server.set_handler(tx),
            Err(ServerError::AlreadyRunning)
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (tx, _rx) = mpsc::channel::<ServerEvent>();
        let mut server = Server::new(ServerConfig::default().with_max_frame_size(0));
        server.set_handler(tx).unwrap();

        assert!(matches!(
            server.start("127.0.0.1", 0),
            Err(ServerError::InvalidConfig(ConfigError::Zero(_)))
        ));
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn bind_failure_returns_to_stopped() {
        let (_first, _events, addr) = serve(ServerConfig::default());

        let (tx, _rx) = mpsc::channel();
        let mut second = Server::new(ServerConfig::default());
        second.set_handler(tx).unwrap();
        assert!(matches!(
            second.start("127.0.0.1", addr.port()),
            Err(ServerError::Bind(_))
        ));
        assert_eq!(second.state(), ServerState::Stopped);
    }

    #[test]
    fn close_twice_reports_closed_once() {
        let (server, events, addr) = serve(ServerConfig::default().with_threads(2));
        let mut client = connect(addr);
        let connection = connected(&events);

        server.close();
        server.close();
        assert!(server.wait(TIMEOUT));
        server.close();

        let mut seen = Vec::new();
        while let Ok(event) = events.recv_timeout(Duration::from_millis(200)) {
            seen.push(event);
        }
        assert!(seen.contains(&ServerEvent::Disconnected(connection.clone())));
        assert_eq!(
            seen.iter().filter(|e| **e == ServerEvent::Closed).count(),
            1
        );
        assert!(!connection.is_connected());
        assert!(server.connections().is_empty());
        assert!(matches!(
            client.recv(),
            Err(ClientError::Transport(TransportError::Closed))
        ));
    }

    #[test]
    fn restart_after_close() {
        let (mut server, events, _) = serve(ServerConfig::default().with_threads(1));
        server.close();
        assert!(server.wait(TIMEOUT));
        next(&events, |e| *e == ServerEvent::Closed);

        let addr = server.start("127.0.0.1", 0).unwrap();
        let _client = connect(addr);
        assert_eq!(connected(&events).id(), 1);
    }

    #[test]
    fn write_after_disconnect_is_not_found() {
        let (server, events, addr) = serve(ServerConfig::default());
        let client = connect(addr);
        let connection = connected(&events);
        let id = connection.id();

        client.close().unwrap();
        next(&events, |e| matches!(e, ServerEvent::Disconnected(_)));

        assert!(!connection.is_connected());
        assert!(server.connection(id).is_none());
        assert!(matches!(
            server.write(id, "late"),
            Err(ServerError::ConnectionNotFound(got)) if got == id
        ));
        assert!(matches!(
            server.disconnect(id),
            Err(ServerError::ConnectionNotFound(_))
        ));
    }

    #[test]
    fn server_side_disconnect() {
        let (server, events, addr) = serve(ServerConfig::default());
        let mut client = connect(addr);
        let id = connected(&events).id();

        assert!(server.disconnect_wait(id, TIMEOUT).unwrap());
        next(&events, |e| matches!(e, ServerEvent::Disconnected(c) if c.id() == id));
        assert!(matches!(
            client.recv(),
            Err(ClientError::Transport(TransportError::Closed))
        ));
    }

    #[test]
    fn registry_tracks_connections() {
        let (server, events, addr) = serve(ServerConfig::default().with_threads(2));
        let _a = connect(addr);
        connected(&events);
        let _b = connect(addr);
        connected(&events);

        let ids: Vec<ConnectionId> = server.connections().iter().map(Connection::id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(server.connection(2).is_some_and(|c| c.is_connected()));
        assert!(server.connection(3).is_none());
    }

    #[test]
    fn broadcast_reaches_everyone() {
        let (server, events, addr) = serve(ServerConfig::default().with_threads(2));
        let mut clients: Vec<Client> = (0..3).map(|_| connect(addr)).collect();
        for _ in 0..3 {
            connected(&events);
        }

        server.write_all("news").unwrap();
        for client in &mut clients {
            assert_eq!(client.recv().unwrap(), b"news");
        }
    }

    #[test]
    fn key_override_stays_on_its_connection() {
        let shared = generate_key();
        let private = generate_key();
        let (server, events, addr) =
            serve(ServerConfig::default().with_default_key(shared.clone()));

        let mut a = connect(addr);
        let a_id = connected(&events).id();
        let mut b = connect(addr);
        let b_id = connected(&events).id();
        a.set_key(shared.clone());
        b.set_key(shared.clone());

        server.set_key(a_id, private.clone()).unwrap();
        server.write(a_id, "secret").unwrap();
        server.write(b_id, "public").unwrap();
        a.set_key(private.clone());
        assert_eq!(a.recv().unwrap(), b"secret");
        assert_eq!(b.recv().unwrap(), b"public");

        a.send(b"private reply").unwrap();
        let (from, data) = message(&events);
        assert_eq!(from.id(), a_id);
        assert_eq!(data, b"private reply");

        server.clear_key(a_id).unwrap();
        server.write(a_id, "back to shared").unwrap();
        a.set_key(shared);
        assert_eq!(a.recv().unwrap(), b"back to shared");
    }

    #[test]
    fn wrong_key_is_reported_and_connection_survives() {
        let key = generate_key();
        let (_server, events, addr) = serve(ServerConfig::default().with_default_key(key.clone()));
        let mut client = connect(addr);
        let connection = connected(&events);

        client.set_key(generate_key());
        client.send(b"garbled").unwrap();
        let event = next(&events, |e| matches!(e, ServerEvent::Error(..)));
        assert_eq!(
            event,
            ServerEvent::Error(connection.clone(), CipherError::Decrypt.into())
        );

        client.set_key(key);
        client.send(b"clear").unwrap();
        let (from, data) = message(&events);
        assert_eq!(from, connection);
        assert_eq!(data, b"clear");
        assert!(connection.is_connected());
    }

    #[test]
    fn clear_keys_reverts_to_plaintext() {
        let (server, events, addr) = serve(ServerConfig::default());
        let mut client = connect(addr);
        let id = connected(&events).id();

        server.set_key(id, generate_key()).unwrap();
        server.clear_keys().unwrap();
        server.write(id, "plain").unwrap();
        assert_eq!(client.recv().unwrap(), b"plain");
    }

    struct Echo;

    impl Handler for Echo {
        fn on_message(&mut self, connection: &Connection, data: Vec<u8>) {
            connection.write(data);
        }
    }

    #[test]
    fn handler_writes_from_the_service_thread() {
        for kind in [BalancerKind::Direct, BalancerKind::FixedPool] {
            let mut server = Server::new(ServerConfig::default().with_balancer(kind));
            server.set_handler(Echo).unwrap();
            let addr = server.start("127.0.0.1", 0).unwrap();

            let mut client = connect(addr);
            for payload in [b"one".as_slice(), b"two", b"three"] {
                client.send(payload).unwrap();
                assert_eq!(client.recv().unwrap(), payload);
            }
        }
    }

    #[test]
    fn old_handle_cannot_reach_reused_id() {
        let (_server, events, addr) = serve(ServerConfig::default().with_threads(1));
        let first = connect(addr);
        let old = connected(&events);
        first.close().unwrap();
        next(&events, |e| *e == ServerEvent::Disconnected(old.clone()));
        assert!(!old.is_connected());

        let mut second = connect(addr);
        let current = connected(&events);
        assert_eq!(current.id(), old.id());
        assert_ne!(current, old);

        old.write("for the first peer only");
        old.set_key(generate_key());
        old.disconnect();
        assert!(old.disconnect_wait(TIMEOUT));

        current.write("for the second peer");
        assert_eq!(second.recv().unwrap(), b"for the second peer");
        assert!(current.is_connected());
    }

    #[test]
    fn closed_means_balancer_threads_are_gone() {
        let cipher: Arc<dyn Cipher> = Arc::new(XChaCha);
        for kind in [BalancerKind::PerConnection, BalancerKind::FixedPool] {
            let config = ServerConfig::default()
                .with_balancer(kind)
                .with_threads(2)
                .with_cipher(Arc::clone(&cipher));
            let (server, events, addr) = serve(config);
            let _client = connect(addr);
            connected(&events);
            assert!(Arc::strong_count(&cipher) > 2);

            server.close();
            assert!(server.wait(TIMEOUT));
            // Left with this test's reference and the one in the server's configuration.
            assert_eq!(Arc::strong_count(&cipher), 2, "{kind:?}");
        }
    }
}
