use std::collections::BTreeSet;

use clap::ValueEnum;
use log::trace;

use super::ConnectionId;

/// How connection ids are handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum IdPolicy {
    /// A counter that never hands out the same id twice.
    Monotonic,
    /// The lowest id not held by a live connection.
    #[default]
    ReuseLowest,
}

/// Assigns ids to connections and takes them back once the connection is gone.
#[derive(Debug)]
pub struct IdAllocator {
    policy: IdPolicy,
    last: ConnectionId,
    in_use: BTreeSet<ConnectionId>,
}

impl IdAllocator {
    pub fn new(policy: IdPolicy) -> Self {
        Self {
            policy,
            last: 0,
            in_use: BTreeSet::new(),
        }
    }

    pub fn policy(&self) -> IdPolicy {
        self.policy
    }

    pub fn allocate(&mut self) -> ConnectionId {
        let id = match self.policy {
            IdPolicy::Monotonic => {
                self.last += 1;
                self.last
            }
            IdPolicy::ReuseLowest => {
                // First gap in the sorted ids, otherwise one past the largest.
                let mut candidate = 1;
                for id in &self.in_use {
                    if *id != candidate {
                        break;
                    }
                    candidate += 1;
                }
                candidate
            }
        };
        self.in_use.insert(id);
        trace!("allocated connection id {id}");
        id
    }

    /// Returns `id` to the allocator. Returns `false` when it was not allocated.
    pub fn release(&mut self, id: ConnectionId) -> bool {
        self.in_use.remove(&id)
    }

    pub fn is_allocated(&self, id: ConnectionId) -> bool {
        self.in_use.contains(&id)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }
}
