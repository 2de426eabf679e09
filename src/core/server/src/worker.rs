// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! One event loop per worker thread, each owning a disjoint set of
//! connections. A connection's work is never stolen by another worker;
//! cross-thread interaction is limited to the session hand-off queue, the
//! signal queue, and the pending-io list an engine uses to wake parked
//! commands.

use crate::bufpool::{BufferLoan, BufferPool};
use crate::connection::{Connection, ConnectionInit};
use crate::dispatch;
use crate::registry::ConnectionRegistry;
use crate::statemachine::{self, State};
use crate::{Bucket, Signal, THREAD_PREFIX, WAKER_TOKEN};

use config::{BufConfig, WorkerConfig};
use engine::{CookieId, CookieRef, EngineResult, NotifyIoComplete};
use metrics::{Histogram, Stat};
use queues::Queues;
use slab::Slab;

use ::net::{Events, Poll, Registry, Token, Waker};

use std::io::Result;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The per-worker list of engine completions waiting to be replayed.
/// Engines push from arbitrary threads; the owning worker drains it on
/// every loop iteration.
pub struct PendingIo {
    queue: Mutex<Vec<(CookieId, EngineResult<()>)>>,
    waker: Arc<Waker>,
}

impl PendingIo {
    fn new(waker: Arc<Waker>) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            waker,
        }
    }

    fn drain(&self, into: &mut Vec<(CookieId, EngineResult<()>)>) {
        let mut queue = self.queue.lock().unwrap();
        into.append(&mut queue);
    }
}

impl NotifyIoComplete for PendingIo {
    fn notify_io_complete(&self, cookie: CookieId, status: EngineResult<()>) {
        self.queue.lock().unwrap().push((cookie, status));
        let _ = self.waker.wake();
    }
}

/// Everything a state callback needs from its worker.
pub struct WorkerCtx<'a> {
    pub registry: &'a Registry,
    pub pool: &'a mut BufferPool,
    pub notify: Arc<dyn NotifyIoComplete>,
    pub buckets: &'a [Bucket],
    pub connections: &'a ConnectionRegistry,
    pub worker_id: usize,
}

impl<'a> WorkerCtx<'a> {
    pub(crate) fn count_loan(&self, loan: BufferLoan, read: bool) {
        let stat = match (loan, read) {
            (BufferLoan::Existing, true) => Stat::RbufExisting,
            (BufferLoan::Loaned, true) => Stat::RbufLoaned,
            (BufferLoan::Allocated, true) => Stat::RbufAllocated,
            (BufferLoan::Existing, false) => Stat::WbufExisting,
            (BufferLoan::Loaned, false) => Stat::WbufLoaned,
            (BufferLoan::Allocated, false) => Stat::WbufAllocated,
        };
        metrics::increment_counter!(&stat);
    }
}

pub struct Worker {
    id: usize,
    nevent: usize,
    timeout: Duration,
    max_reqs_per_event: usize,
    poll: Poll,
    waker: Arc<Waker>,
    connections: Slab<Connection>,
    session_queue: Queues<ConnectionInit, ConnectionInit>,
    signal_queue: Queues<(), Signal>,
    pending: Arc<PendingIo>,
    notify: Arc<dyn NotifyIoComplete>,
    pool: BufferPool,
    buckets: Arc<Vec<Bucket>>,
    registry: Arc<ConnectionRegistry>,
    scheduler: Arc<Histogram>,
}

pub struct WorkerBuilder {
    id: usize,
    nevent: usize,
    timeout: Duration,
    max_reqs_per_event: usize,
    poll: Poll,
    waker: Arc<Waker>,
    pending: Arc<PendingIo>,
    pool: BufferPool,
    buckets: Arc<Vec<Bucket>>,
    registry: Arc<ConnectionRegistry>,
    scheduler: Arc<Histogram>,
}

impl WorkerBuilder {
    pub fn new<T: WorkerConfig + BufConfig>(
        config: &T,
        id: usize,
        buckets: Arc<Vec<Bucket>>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let pending = Arc::new(PendingIo::new(waker.clone()));

        let worker = config.worker();

        Ok(Self {
            id,
            nevent: worker.nevent(),
            timeout: Duration::from_millis(worker.timeout() as u64),
            max_reqs_per_event: worker.max_reqs_per_event(),
            poll,
            waker,
            pending,
            pool: BufferPool::new(config.buf().size()),
            buckets,
            registry,
            scheduler: Arc::new(Histogram::new()),
        })
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn scheduler_histogram(&self) -> Arc<Histogram> {
        self.scheduler.clone()
    }

    /// The handle engines use to complete parked operations on this worker.
    pub fn pending_io(&self) -> Arc<PendingIo> {
        self.pending.clone()
    }

    pub fn build(
        self,
        session_queue: Queues<ConnectionInit, ConnectionInit>,
        signal_queue: Queues<(), Signal>,
    ) -> Worker {
        let notify: Arc<dyn NotifyIoComplete> = self.pending.clone();
        Worker {
            id: self.id,
            nevent: self.nevent,
            timeout: self.timeout,
            max_reqs_per_event: self.max_reqs_per_event,
            poll: self.poll,
            waker: self.waker,
            connections: Slab::new(),
            session_queue,
            signal_queue,
            pending: self.pending,
            notify,
            pool: self.pool,
            buckets: self.buckets,
            registry: self.registry,
            scheduler: self.scheduler,
        }
    }
}

impl Worker {
    /// Run the worker in a loop, servicing reactor events, new sessions,
    /// signals, and engine completions.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(self.nevent);
        let mut completions = Vec::new();

        loop {
            metrics::increment_counter!(&Stat::WorkerEventLoop);

            // engine completions are drained on every iteration, not only
            // when the waker fires, so a wakeup lost to a race cannot
            // strand a parked command
            self.drain_pending_io(&mut completions);

            if self.poll.poll(&mut events, Some(self.timeout)).is_err() {
                error!("{}_worker_{}: error polling", THREAD_PREFIX, self.id);
            }

            metrics::increment_counter_by!(&Stat::WorkerEventTotal, events.iter().count() as u64);

            for event in events.iter() {
                let token = event.token();
                match token {
                    WAKER_TOKEN => {
                        self.accept_sessions();
                        self.drain_pending_io(&mut completions);
                        if self.handle_signals() {
                            return;
                        }
                    }
                    _ => {
                        if event.is_error() {
                            metrics::increment_counter!(&Stat::WorkerEventError);
                        }
                        if event.is_readable() {
                            metrics::increment_counter!(&Stat::WorkerEventRead);
                        }
                        if event.is_writable() {
                            metrics::increment_counter!(&Stat::WorkerEventWrite);
                        }
                        self.service(
                            token,
                            event.is_readable(),
                            event.is_writable(),
                            event.is_error(),
                        );
                    }
                }
            }
        }
    }

    /// Register sessions handed over by the listener.
    fn accept_sessions(&mut self) {
        while let Some(item) = self.session_queue.try_recv() {
            let init = item.into_inner();

            let peer = init
                .stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            let (id, trace) = self.registry.register(peer, self.id);

            let engine = self.buckets[0].engine().clone();
            let mut connection =
                Connection::new(init, id, trace, engine, self.max_reqs_per_event);

            let entry = self.connections.vacant_entry();
            let token = Token(entry.key());

            match connection.register(self.poll.registry(), token) {
                Ok(()) => {
                    entry.insert(connection);
                    metrics::increment_gauge!(&Stat::ConnCurr);
                    // run the machine once to loan buffers and pick the
                    // initial waiting state
                    self.service(token, false, false, false);
                }
                Err(e) => {
                    warn!(
                        "{}_worker_{}: failed to register new connection: {}",
                        THREAD_PREFIX, self.id, e
                    );
                    self.registry.deregister(id);
                }
            }
        }
    }

    /// Process control-plane signals. Returns true on shutdown.
    fn handle_signals(&mut self) -> bool {
        while let Some(signal) = self.signal_queue.try_recv().map(|v| v.into_inner()) {
            match signal {
                Signal::Shutdown => {
                    return true;
                }
                Signal::FlushAll => {
                    warn!("{}_worker_{}: received flush_all", THREAD_PREFIX, self.id);
                    for bucket in self.buckets.iter() {
                        let cookie_ref = CookieRef {
                            id: CookieId::MAX,
                            notify: &self.notify,
                        };
                        if let Err(e) = bucket.engine().flush(&cookie_ref) {
                            warn!(
                                "{}_worker_{}: flush of bucket {} failed: {:?}",
                                THREAD_PREFIX,
                                self.id,
                                bucket.name(),
                                e
                            );
                        }
                    }
                }
                Signal::SignalIdle(bucket) => {
                    self.signal_idle_connections(bucket);
                }
            }
        }
        false
    }

    /// Walk the owned connections and push the idle ones (optionally
    /// restricted to one bucket) into their shutdown sequence.
    fn signal_idle_connections(&mut self, bucket: Option<usize>) {
        let tokens: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, c)| bucket.map(|b| c.bucket_index() == b).unwrap_or(true))
            .map(|(token, _)| token)
            .collect();

        for token in tokens {
            let signalled = self
                .connections
                .get_mut(token)
                .map(|c| c.signal_if_idle())
                .unwrap_or(false);
            if signalled {
                self.service(Token(token), false, false, false);
            }
        }
    }

    /// Replay engine completions.
    fn drain_pending_io(&mut self, completions: &mut Vec<(CookieId, EngineResult<()>)>) {
        self.pending.drain(completions);

        for (cookie_id, status) in completions.drain(..) {
            metrics::increment_counter!(&Stat::PendingIoServed);

            let token = (cookie_id >> 16) as usize;
            let serial = cookie_id & 0xffff;

            let connection = match self.connections.get_mut(token) {
                Some(connection) => connection,
                None => continue,
            };

            // the engine's reference is returned whether or not the command
            // still exists, so a teardown parked on the refcount can finish
            connection.decrement_refcount();

            if matches!(
                connection.state(),
                State::Closing | State::PendingClose | State::ImmediateClose | State::Destroyed
            ) {
                self.service(Token(token), false, false, false);
                continue;
            }

            let slot = match connection.find_slot_by_serial(serial) {
                Some(slot) => slot,
                None => {
                    self.service(Token(token), false, false, false);
                    continue;
                }
            };

            if slot == 0 {
                let cookie = connection.cookie_mut(0);
                cookie.set_aiostat(status);
                cookie.set_ewouldblock(false);
                self.service(Token(token), false, false, false);
            } else {
                let cookie = connection.cookie_mut(slot);
                cookie.set_aiostat(status);
                cookie.set_ewouldblock(false);

                let mut ctx = WorkerCtx {
                    registry: self.poll.registry(),
                    pool: &mut self.pool,
                    notify: self.notify.clone(),
                    buckets: &self.buckets,
                    connections: &self.registry,
                    worker_id: self.id,
                };
                dispatch::execute_packet(connection, &mut ctx, slot);

                if connection.cookie(slot).is_ewouldblock() {
                    // parked again
                    connection.increment_refcount();
                } else if matches!(
                    connection.state(),
                    State::NewCmd | State::Waiting | State::ReadHeader | State::ReadBody
                ) {
                    if connection.drain_ordered_responses() {
                        connection.set_write_and_go(State::NewCmd);
                        connection.set_state(State::SendData);
                    }
                    self.service(Token(token), false, false, false);
                }
            }
        }
    }

    /// Drive one connection's state machine and account the time spent.
    fn service(&mut self, token: Token, readable: bool, writable: bool, error: bool) {
        let start = Instant::now();

        let connection = match self.connections.get_mut(token.0) {
            Some(connection) => connection,
            None => return,
        };

        if error {
            connection.set_state(State::Closing);
        }

        let mut ctx = WorkerCtx {
            registry: self.poll.registry(),
            pool: &mut self.pool,
            notify: self.notify.clone(),
            buckets: &self.buckets,
            connections: &self.registry,
            worker_id: self.id,
        };

        statemachine::run_event_loop(connection, &mut ctx, readable, writable);

        let elapsed = start.elapsed();
        connection.add_sched_time(elapsed);
        self.scheduler.increment(elapsed.as_nanos() as u64);

        if connection.state() == State::Destroyed {
            let connection = self.connections.remove(token.0);
            self.registry.deregister(connection.id());
            metrics::decrement_gauge!(&Stat::ConnCurr);
        }
    }
}
