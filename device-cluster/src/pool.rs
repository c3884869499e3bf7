//! Named dispatch pools backed by actix arbiters.
//!
//! Entity actors, the session manager and inbound session callbacks each get
//! their own pool so device traffic cannot starve cluster control messages.

use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use actix::{Arbiter, ArbiterHandle};
use fnv::FnvHasher;
use log::{debug, warn};

/// Fixed set of arbiters, each a single-threaded event loop
pub struct DispatchPool {
    name: &'static str,
    arbiters: Vec<Arbiter>,
    next: AtomicUsize,
}

impl DispatchPool {
    /// Start `size` arbiters (at least one); must run inside an actix system
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        let arbiters = (0..size).map(|_| Arbiter::new()).collect();
        debug!("Started dispatch pool {} with {} arbiter(s)", name, size);
        DispatchPool {
            name,
            arbiters,
            next: AtomicUsize::new(0),
        }
    }

    /// Pool name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of arbiters
    pub fn size(&self) -> usize {
        self.arbiters.len()
    }

    /// Next arbiter in round-robin order
    pub fn next_handle(&self) -> ArbiterHandle {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.arbiters.len();
        self.arbiters[idx].handle()
    }

    /// Arbiter pinned to `key`; the same key always maps to the same arbiter,
    /// which keeps work for one key in submission order
    pub fn handle_for<K: Hash + ?Sized>(&self, key: &K) -> ArbiterHandle {
        let mut hasher = FnvHasher::default();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.arbiters.len() as u64) as usize;
        self.arbiters[idx].handle()
    }

    /// Run `future` on the arbiter pinned to `key`
    pub fn spawn_keyed<K, F>(&self, key: &K, future: F)
    where
        K: Hash + ?Sized,
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.handle_for(key).spawn(future) {
            warn!("Dispatch pool {} is stopped, task dropped", self.name);
        }
    }

    /// Run `future` on the next arbiter
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.next_handle().spawn(future) {
            warn!("Dispatch pool {} is stopped, task dropped", self.name);
        }
    }

    /// Stop every arbiter in the pool
    pub fn stop(&self) {
        for arbiter in &self.arbiters {
            arbiter.stop();
        }
        debug!("Stopped dispatch pool {}", self.name);
    }
}

impl fmt::Debug for DispatchPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPool")
            .field("name", &self.name)
            .field("size", &self.arbiters.len())
            .finish()
    }
}
