// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A registry of descriptors for all live connections, guarded by a single
//! mutex. The hot path never touches it: workers register on accept and
//! deregister on teardown, and only admin operations (stats dump, trace
//! toggling) walk it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub peer: String,
    pub agent: String,
    pub worker: usize,
    pub bucket: usize,
    pub trace: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<u64, ConnectionInfo>>,
    next_id: AtomicU64,
    /// Bumped whenever the authentication configuration changes; privilege
    /// contexts created against an older epoch are stale.
    auth_epoch: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Allocate an id and register the connection, returning the id and the
    /// shared trace flag.
    pub fn register(&self, peer: String, worker: usize) -> (u64, Arc<AtomicBool>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let trace = Arc::new(AtomicBool::new(false));
        let info = ConnectionInfo {
            id,
            peer,
            agent: String::new(),
            worker,
            bucket: 0,
            trace: trace.clone(),
        };
        self.connections.lock().unwrap().insert(id, info);
        (id, trace)
    }

    pub fn deregister(&self, id: u64) {
        self.connections.lock().unwrap().remove(&id);
    }

    pub fn set_agent(&self, id: u64, agent: &str) {
        if let Some(info) = self.connections.lock().unwrap().get_mut(&id) {
            info.agent = agent.to_string();
        }
    }

    pub fn set_bucket(&self, id: u64, bucket: usize) {
        if let Some(info) = self.connections.lock().unwrap().get_mut(&id) {
            info.bucket = bucket;
        }
    }

    /// Enable or disable tracing for a connection. Returns false if the id
    /// is unknown.
    pub fn set_trace(&self, id: u64, enabled: bool) -> bool {
        if let Some(info) = self.connections.lock().unwrap().get(&id) {
            info.trace.store(enabled, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.connections.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn auth_epoch(&self) -> u64 {
        self.auth_epoch.load(Ordering::Acquire)
    }

    pub fn bump_auth_epoch(&self) {
        self.auth_epoch.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_trace() {
        let registry = ConnectionRegistry::new();
        let (id, trace) = registry.register("127.0.0.1:1234".to_string(), 0);
        assert_eq!(registry.len(), 1);

        assert!(registry.set_trace(id, true));
        assert!(trace.load(Ordering::Relaxed));

        registry.deregister(id);
        assert!(registry.is_empty());
        assert!(!registry.set_trace(id, true));
    }

    #[test]
    fn ids_are_unique() {
        let registry = ConnectionRegistry::new();
        let (a, _) = registry.register("p1".to_string(), 0);
        let (b, _) = registry.register("p2".to_string(), 1);
        assert_ne!(a, b);
    }
}
