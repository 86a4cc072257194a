use std::{
    net::TcpStream,
    sync::{Arc, mpsc::Sender},
    time::Duration,
};

use log::info;

use crate::config::ServerConfig;

use super::{
    Balancer, BalancerError, BalancerEvent, ConnectionId, Dispatcher, Shared,
    context::{self, Command, Context, ContextHandle},
    prepare,
};

/// Serves every connection from the thread that owns the balancer.
///
/// Nothing happens unless [`Balancer::poll`] is called regularly; the server does this from its
/// own loop.
pub struct DirectBalancer {
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    handle: ContextHandle,
    context: Option<Context>,
}

impl DirectBalancer {
    pub fn new(config: &ServerConfig, events: Sender<BalancerEvent>) -> Self {
        let shared = Shared::new(config, events);
        let dispatcher = Dispatcher::new(shared.events());
        let (handle, context) = context::pair(0, &shared, false);
        dispatcher.register(handle.clone());

        Self {
            shared,
            dispatcher,
            handle,
            context: Some(context),
        }
    }
}

impl Balancer for DirectBalancer {
    fn balance(&mut self, stream: TcpStream) -> Result<ConnectionId, BalancerError> {
        let Some(context) = self.context.as_mut() else {
            return Err(BalancerError::Closed);
        };
        let (stream, addr) = prepare(stream)?;

        let (id, serial) = self.shared.allocate();
        self.handle.reserve(id, serial);
        context.execute(Command::Adopt {
            id,
            serial,
            stream,
            addr,
        });
        Ok(id)
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn close(&mut self) {
        if !self.shared.begin_close() {
            return;
        }
        info!("closing direct balancer");
        drop(self.context.take());
        self.shared.settle();
    }

    fn is_running(&self) -> bool {
        !self.shared.is_closed()
    }

    /// Never waits: `close` drops the context, and with it every socket, before returning.
    fn wait(&self, _timeout: Duration) -> bool {
        self.shared.is_closed()
    }

    fn poll(&mut self) {
        if let Some(context) = self.context.as_mut() {
            if !context.turn(Duration::ZERO) {
                self.context = None;
            }
        }
    }
}

impl Drop for DirectBalancer {
    fn drop(&mut self) {
        self.close();
    }
}
