use std::{
    net::TcpStream,
    sync::{Arc, mpsc::Sender},
    time::Duration,
};

use log::{debug, info, trace};

use crate::config::ServerConfig;

use super::{
    Balancer, BalancerError, BalancerEvent, ConnectionId, Dispatcher, Shared,
    context::{Command, Worker},
    prepare,
};

/// A fixed set of context threads started up front. New connections go to the context that
/// owns the fewest of them.
pub struct FixedPoolBalancer {
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    workers: Vec<Worker>,
}

impl FixedPoolBalancer {
    pub fn new(config: &ServerConfig, events: Sender<BalancerEvent>) -> Result<Self, BalancerError> {
        let size = config.pool_size();
        let shared = Shared::new(config, events);
        let dispatcher = Dispatcher::new(shared.events());

        let mut pool = Self {
            shared,
            dispatcher,
            workers: Vec::with_capacity(size),
        };
        for index in 0..size {
            // On failure the contexts started so far are closed by `Drop`.
            let worker = Worker::spawn(index, &pool.shared, false)?;
            pool.dispatcher.register(worker.handle().clone());
            pool.workers.push(worker);
        }

        info!("started pool of {size} contexts");
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// The least-loaded context, the earliest one among equals.
    fn pick(&self) -> Option<&Worker> {
        self.workers
            .iter()
            .filter(|worker| !worker.handle().is_finished())
            .min_by_key(|worker| worker.handle().load())
    }
}

impl Balancer for FixedPoolBalancer {
    fn balance(&mut self, stream: TcpStream) -> Result<ConnectionId, BalancerError> {
        if self.shared.is_closing() {
            return Err(BalancerError::Closed);
        }
        let (stream, addr) = prepare(stream)?;

        let Some(worker) = self.pick() else {
            return Err(BalancerError::ContextUnavailable);
        };
        debug!(
            "context {} has the lowest load ({})",
            worker.handle().index(),
            worker.handle().load()
        );
        worker.handle().assign(&self.shared, stream, addr)
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn close(&mut self) {
        if !self.shared.begin_close() {
            return;
        }
        info!("closing pool of {} contexts", self.workers.len());
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
}

impl Drop for FixedPoolBalancer {
    fn drop(&mut self) {
        self.close();
        for worker in &mut self.workers {
            worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        net::{Shutdown, TcpStream},
        sync::mpsc::{self, Receiver},
        time::Instant,
    };

    use crate::{
        balancer::testing::{expect_event, listener, socket_pair},
        protocol::{DEFAULT_MAX_FRAME_SIZE, FrameTransport},
    };

    use super::*;

    fn pool(threads: usize) -> (FixedPoolBalancer, Receiver<BalancerEvent>) {
        let (tx, rx) = mpsc::channel();
        let config = ServerConfig::default().with_threads(threads);
        (FixedPoolBalancer::new(&config, tx).unwrap(), rx)
    }

    #[test]
    fn spreads_connections_over_two_threads() {
        let (mut balancer, _events) = pool(2);
        let listener = listener();
        let mut clients = Vec::new();

        for _ in 0..3 {
            let (client, server) = socket_pair(&listener);
            balancer.balance(server).unwrap();
            clients.push(client);
        }
        assert_eq!(balancer.loads(), vec![2, 1]);
    }

    #[test]
    fn load_stays_level() {
        let (mut balancer, _events) = pool(3);
        let listener = listener();
        let mut clients = Vec::new();
        let mut ids = HashSet::new();

        for _ in 0..10 {
            let (client, server) = socket_pair(&listener);
            assert!(ids.insert(balancer.balance(server).unwrap()));
            clients.push(client);

            let loads = balancer.loads();
            let max = loads.iter().max().unwrap();
            let min = loads.iter().min().unwrap();
            assert!(max - min <= 1, "uneven loads {loads:?}");
        }
        assert_eq!(balancer.loads(), vec![4, 3, 3]);
    }

    #[test]
    fn freed_slot_is_refilled_first() {
        let (mut balancer, events) = pool(2);
        let listener = listener();
        let mut clients: Vec<TcpStream> = Vec::new();

        for _ in 0..4 {
            let (client, server) = socket_pair(&listener);
            balancer.balance(server).unwrap();
            clients.push(client);
        }
        assert_eq!(balancer.loads(), vec![2, 2]);

        // Connection 2 went to the second context.
        clients[1].shutdown(Shutdown::Both).unwrap();
        expect_event(&mut balancer, &events, |e| {
            *e == BalancerEvent::Disconnected { id: 2 }
        });
        assert_eq!(balancer.loads(), vec![2, 1]);

        let (_client, server) = socket_pair(&listener);
        balancer.balance(server).unwrap();
        assert_eq!(balancer.loads(), vec![2, 2]);
    }

    #[test]
    fn echoes_through_the_pool() {
        let (mut balancer, events) = pool(2);
        let listener = listener();
        let mut transports = Vec::new();

        for _ in 0..2 {
            let (client, server) = socket_pair(&listener);
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            balancer.balance(server).unwrap();
            transports.push(FrameTransport::new(client, DEFAULT_MAX_FRAME_SIZE));
        }

        transports[1].write_frame(b"second").unwrap();
        let event = expect_event(&mut balancer, &events, |e| {
            matches!(e, BalancerEvent::Message { .. })
        });
        let BalancerEvent::Message { id, data } = event else {
            unreachable!()
        };
        assert_eq!(id, 2);
        assert_eq!(data, b"second");

        balancer.write(id, data);
        assert_eq!(transports[1].read_frame().unwrap(), b"second");

        balancer.write_all(b"all".to_vec());
        for transport in &mut transports {
            assert_eq!(transport.read_frame().unwrap(), b"all");
        }
    }

    #[cfg(unix)]
    #[test]
    fn failed_adoption_leaves_pool_untouched() {
        use std::os::fd::OwnedFd;

        let (mut balancer, events) = pool(2);
        let unconnected = TcpStream::from(OwnedFd::from(listener()));

        assert!(matches!(
            balancer.balance(unconnected),
            Err(BalancerError::AdoptionFailed(_))
        ));
        assert_eq!(balancer.loads(), vec![0, 0]);
        assert!(events.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn close_reports_closed_once() {
        let (mut balancer, events) = pool(4);
        let listener = listener();
        let (_client, server) = socket_pair(&listener);
        balancer.balance(server).unwrap();

        balancer.close();
        balancer.close();
        assert!(balancer.wait(Duration::from_secs(5)));

        let deadline = Instant::now() + Duration::from_secs(1);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            match events.recv_timeout(Duration::from_millis(50)) {
                Ok(event) => seen.push(event),
                Err(_) => break,
            }
        }
        assert!(seen.contains(&BalancerEvent::Disconnected { id: 1 }));
        assert_eq!(
            seen.iter().filter(|e| **e == BalancerEvent::Closed).count(),
            1
        );

        let (_client, server) = socket_pair(&listener);
        assert!(matches!(
            balancer.balance(server),
            Err(BalancerError::Closed)
        ));
    }
}
