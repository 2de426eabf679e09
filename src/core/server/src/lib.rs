// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The server core: a listener thread accepting (and TLS-handshaking) new
//! streams, N worker threads each running an independent event loop over a
//! disjoint set of connections, and an admin thread serving the text admin
//! protocol and draining the log.
//!
//! A connection is pinned to one worker for its whole life. The worker
//! drives it through an explicit state machine on every readiness event;
//! engine operations which cannot complete immediately park the command and
//! complete it later through the worker's pending-io list.

#[macro_use]
extern crate log;

use ::net::event::Source;
use ::net::*;
use common::signal::Signal;
use common::ssl::tls_acceptor;
use config::*;
use core::time::Duration;
use crossbeam_channel::{bounded, Receiver, Sender};
use engine::Engine;
use logger::Drain;
use queues::Queues;
use slab::Slab;
use std::io::{Error, ErrorKind, Read, Result, Write};
use std::sync::Arc;

mod admin;
mod bufpool;
mod connection;
mod cookie;
mod dcp;
mod dispatch;
mod event;
mod listener;
mod process;
mod registry;
mod rbac;
mod statemachine;
mod worker;

pub use admin::AdminBuilder;
pub use bufpool::{BufferLoan, BufferPool};
pub use connection::{Connection, Priority, ResponseValue, TransmitResult, TryReadResult};
pub use cookie::Cookie;
pub use event::ServerEvent;
pub use listener::ListenerBuilder;
pub use process::{Process, ProcessBuilder};
pub use registry::{ConnectionInfo, ConnectionRegistry};
pub use rbac::{Privilege, PrivilegeAccess, PrivilegeContext};
pub use statemachine::{run_event_loop, State};
pub use worker::{PendingIo, Worker, WorkerBuilder, WorkerCtx};

pub use connection::ConnectionInit;

const QUEUE_CAPACITY: usize = 64 * 1024;

const LISTENER_TOKEN: Token = Token(usize::MAX - 1);
const WAKER_TOKEN: Token = Token(usize::MAX);

const THREAD_PREFIX: &str = "mcbp";

/// A named storage namespace served by one engine instance. Every
/// connection has exactly one bucket selected; new connections start on
/// bucket zero.
pub struct Bucket {
    name: String,
    engine: Arc<dyn Engine>,
}

impl Bucket {
    pub fn new<T: Into<String>>(name: T, engine: Arc<dyn Engine>) -> Self {
        Self {
            name: name.into(),
            engine,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }
}

