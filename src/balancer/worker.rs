use std::{
    net::TcpStream,
    sync::{Arc, mpsc::Sender},
    time::Duration,
};

use log::{info, trace};

use crate::config::ServerConfig;

use super::{
    Balancer, BalancerError, BalancerEvent, ConnectionId, Dispatcher, Shared,
    context::{Command, Worker},
    prepare,
};

/// Gives every connection a dedicated thread that lives exactly as long as the connection.
pub struct PerConnectionBalancer {
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    workers: Vec<Worker>,
    next_index: usize,
}

impl PerConnectionBalancer {
    pub fn new(config: &ServerConfig, events: Sender<BalancerEvent>) -> Self {
        let shared = Shared::new(config, events);
        let dispatcher = Dispatcher::new(shared.events());

        Self {
            shared,
            dispatcher,
            workers: Vec::new(),
            next_index: 0,
        }
    }

    /// Joins the threads of connections that are gone.
    fn reap(&mut self) {
        let (finished, live): (Vec<Worker>, Vec<Worker>) = self
            .workers
            .drain(..)
            .partition(|worker| worker.handle().is_finished());
        self.workers = live;

        for mut worker in finished {
            worker.join();
        }
        self.dispatcher.prune();
    }
}

impl Balancer for PerConnectionBalancer {
    fn balance(&mut self, stream: TcpStream) -> Result<ConnectionId, BalancerError> {
        if self.shared.is_closing() {
            return Err(BalancerError::Closed);
        }
        let (stream, addr) = prepare(stream)?;
        self.reap();

        let index = self.next_index;
        self.next_index += 1;
        let worker = Worker::spawn(index, &self.shared, true)?;
        self.dispatcher.register(worker.handle().clone());

        let assigned = worker.handle().assign(&self.shared, stream, addr);
        self.workers.push(worker);
        assigned
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn close(&mut self) {
        if !self.shared.begin_close() {
            return;
        }
        info!("closing {} connection threads", self.workers.len());
        for worker in &self.workers {
            if worker.handle().send(Command::Close).is_err() {
                trace!("context {} already finished", worker.handle().index());
            }
        }
        self.shared.settle();
    }

    fn is_running(&self) -> bool {
        !self.shared.is_closed()
    }

    fn wait(&self, timeout: Duration) -> bool {
        self.dispatcher.wait_finished(timeout) && self.shared.is_closed()
    }

    fn poll(&mut self) {
        self.reap();
    }
}

impl Drop for PerConnectionBalancer {
    fn drop(&mut self) {
        self.close();
        for worker in &mut self.workers {
            worker.join();
        }
    }
}
