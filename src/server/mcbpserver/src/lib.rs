// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Mcbpserver is a key/value server speaking the binary protocol. Clients
//! negotiate features on connect, dispatch data commands against a selected
//! bucket, and may open a change-feed channel over the same connection.
//! The default build serves a single in-memory bucket.
//!
//! Running this binary is the primary way of using the server.

use config::McbpserverConfig;
use engine::MemoryEngine;
use logger::{File, LogBuilder, Output, Stdout};
use server::{Bucket, Process, ProcessBuilder};

use std::io::Result;
use std::sync::Arc;

pub struct Mcbpserver {
    process: Process,
    listen_addr: std::net::SocketAddr,
}

impl Mcbpserver {
    /// Launch all server threads from the provided config.
    pub fn new(config: McbpserverConfig) -> Result<Self> {
        use config::DebugConfig;

        let debug = config.debug();
        let output: Box<dyn Output> = if let Some(file) = debug.log_file() {
            Box::new(File::open(&file)?)
        } else {
            Box::new(Stdout::new())
        };

        let log = LogBuilder::new()
            .output(output)
            .level(debug.log_level())
            .queue_depth(debug.log_queue_depth())
            .message_size(debug.log_single_message_size())
            .build()?;
        let log_drain = log.start();

        let buckets = vec![Bucket::new("default", Arc::new(MemoryEngine::new()))];

        let builder = ProcessBuilder::new(&config, log_drain, buckets)?
            .version(env!("CARGO_PKG_VERSION"));
        let listen_addr = builder.listen_addr()?;
        let process = builder.spawn();

        Ok(Self {
            process,
            listen_addr,
        })
    }

    /// The address the data port is bound to.
    pub fn listen_addr(&self) -> std::net::SocketAddr {
        self.listen_addr
    }

    /// Wait for the server threads to terminate.
    pub fn wait(self) {
        self.process.wait()
    }

    /// Trigger a graceful shutdown and wait for the threads to join.
    pub fn shutdown(self) {
        self.process.shutdown()
    }
}
