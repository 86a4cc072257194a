//! Server configuration.
use std::{num::NonZeroUsize, sync::Arc, thread, time::Duration};

use clap::ValueEnum;
use thiserror::Error;

use crate::{
    balancer::IdPolicy,
    crypto::{Cipher, XChaCha},
    protocol::DEFAULT_MAX_FRAME_SIZE,
};

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_TICK: Duration = Duration::from_millis(5);
const DEFAULT_READ_CHUNK: usize = 16 * 1024;
const DEFAULT_MAX_OUTBOX: usize = 4 * DEFAULT_MAX_FRAME_SIZE as usize;

/// How accepted connections are spread over execution contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum BalancerKind {
    /// Every connection is served by the server's own thread.
    Direct,
    /// Every connection gets a dedicated thread.
    PerConnection,
    /// A fixed number of threads; new connections go to the least loaded one.
    #[default]
    FixedPool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("default key of {0} bytes is not valid for the configured cipher")]
    InvalidKey(usize),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub balancer: BalancerKind,
    /// Pool size for [`BalancerKind::FixedPool`]; the host's parallelism when unset.
    pub threads: Option<usize>,
    pub id_policy: IdPolicy,
    pub max_frame_size: u32,
    /// Server-wide key. Empty disables encryption.
    pub default_key: Vec<u8>,
    pub cipher: Arc<dyn Cipher>,
    /// Bound of every execution context's command queue.
    pub queue_capacity: usize,
    pub tick: Duration,
    pub read_chunk: usize,
    /// Close a connection when its stream carries an oversize frame.
    pub close_on_frame_error: bool,
    /// Bytes that may wait for a slow peer. Writes beyond it are dropped and reported as
    /// [`ConnectionError::Overloaded`](crate::balancer::ConnectionError::Overloaded); a single
    /// frame is always accepted.
    pub max_outbox: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            balancer: BalancerKind::default(),
            threads: None,
            id_policy: IdPolicy::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            default_key: Vec::new(),
            cipher: Arc::new(XChaCha),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            tick: DEFAULT_TICK,
            read_chunk: DEFAULT_READ_CHUNK,
            close_on_frame_error: false,
            max_outbox: DEFAULT_MAX_OUTBOX,
        }
    }
}

impl ServerConfig {
    pub fn with_balancer(mut self, balancer: BalancerKind) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_id_policy(mut self, policy: IdPolicy) -> Self {
        self.id_policy = policy;
        self
    }

    pub fn with_max_frame_size(mut self, max: u32) -> Self {
        self.max_frame_size = max;
        self
    }

    pub fn with_default_key(mut self, key: Vec<u8>) -> Self {
        self.default_key = key;
        self
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_close_on_frame_error(mut self, close: bool) -> Self {
        self.close_on_frame_error = close;
        self
    }

    pub fn with_max_outbox(mut self, max: usize) -> Self {
        self.max_outbox = max;
        self
    }

    /// Number of contexts a fixed pool starts with.
    pub fn pool_size(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size == 0 {
            return Err(ConfigError::Zero("max_frame_size"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity"));
        }
        if self.tick.is_zero() {
            return Err(ConfigError::Zero("tick"));
        }
        if self.read_chunk == 0 {
            return Err(ConfigError::Zero("read_chunk"));
        }
        if self.max_outbox == 0 {
            return Err(ConfigError::Zero("max_outbox"));
        }
        if self.threads == Some(0) {
            return Err(ConfigError::Zero("threads"));
        }
        if !self.default_key.is_empty() && !self.cipher.validate_key(&self.default_key) {
            return Err(ConfigError::InvalidKey(self.default_key.len()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::generate_key;

    use super::*;

    #[test]
    fn default_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.balancer, BalancerKind::FixedPool);
        assert!(config.pool_size() >= 1);
    }

    #[test]
    fn zero_values_are_rejected() {
        let config = ServerConfig::default().with_threads(0);
        assert_eq!(config.validate(), Err(ConfigError::Zero("threads")));

        let config = ServerConfig::default().with_max_frame_size(0);
        assert_eq!(config.validate(), Err(ConfigError::Zero("max_frame_size")));

        let config = ServerConfig::default().with_max_outbox(0);
        assert_eq!(config.validate(), Err(ConfigError::Zero("max_outbox")));
    }

    #[test]
    fn default_key_must_fit_cipher() {
        let config = ServerConfig::default().with_default_key(b"short".to_vec());
        assert_eq!(config.validate(), Err(ConfigError::InvalidKey(5)));

        let config = ServerConfig::default().with_default_key(generate_key());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn explicit_pool_size() {
        assert_eq!(ServerConfig::default().with_threads(3).pool_size(), 3);
    }
}
