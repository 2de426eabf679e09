// Copyright 2020 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

// constants to define default values
const WORKER_THREADS: usize = 1;
const WORKER_TIMEOUT: usize = 100;
const WORKER_NEVENT: usize = 1024;
const WORKER_MAX_REQS_PER_EVENT: usize = 20;

// helper functions for default values
fn threads() -> usize {
    WORKER_THREADS
}

fn timeout() -> usize {
    WORKER_TIMEOUT
}

fn nevent() -> usize {
    WORKER_NEVENT
}

fn max_reqs_per_event() -> usize {
    WORKER_MAX_REQS_PER_EVENT
}

// definitions
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Worker {
    #[serde(default = "threads")]
    threads: usize,
    #[serde(default = "timeout")]
    timeout: usize,
    #[serde(default = "nevent")]
    nevent: usize,
    #[serde(default = "max_reqs_per_event")]
    max_reqs_per_event: usize,
}

// implementation
impl Worker {
    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn timeout(&self) -> usize {
        self.timeout
    }

    pub fn nevent(&self) -> usize {
        self.nevent
    }

    /// The maximum number of requests a connection may execute in a single
    /// worker timeslice before it must yield to other connections.
    pub fn max_reqs_per_event(&self) -> usize {
        self.max_reqs_per_event
    }
}

// trait implementations
impl Default for Worker {
    fn default() -> Self {
        Self {
            threads: threads(),
            timeout: timeout(),
            nevent: nevent(),
            max_reqs_per_event: max_reqs_per_event(),
        }
    }
}

pub trait WorkerConfig {
    fn worker(&self) -> &Worker;

    fn worker_mut(&mut self) -> &mut Worker;
}
