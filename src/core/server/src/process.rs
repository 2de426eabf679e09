// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

use crate::admin::AdminBuilder;
use crate::listener::ListenerBuilder;
use crate::worker::WorkerBuilder;

use std::thread::JoinHandle;

pub struct ProcessBuilder {
    admin: AdminBuilder,
    listener: ListenerBuilder,
    log_drain: Box<dyn Drain>,
    registry: Arc<ConnectionRegistry>,
    workers: Vec<WorkerBuilder>,
}

impl ProcessBuilder {
    pub fn new<T: AdminConfig + ServerConfig + TlsConfig + WorkerConfig + BufConfig>(
        config: &T,
        log_drain: Box<dyn Drain>,
        buckets: Vec<Bucket>,
    ) -> Result<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let buckets = Arc::new(buckets);

        if buckets.is_empty() {
            return Err(Error::new(ErrorKind::Other, "no buckets configured"));
        }

        let admin = AdminBuilder::new(config)?;
        let listener = ListenerBuilder::new(config)?;

        let threads = config.worker().threads().max(1);
        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            workers.push(WorkerBuilder::new(
                config,
                id,
                buckets.clone(),
                registry.clone(),
            )?);
        }

        Ok(Self {
            admin,
            listener,
            log_drain,
            registry,
            workers,
        })
    }

    pub fn version(mut self, version: &str) -> Self {
        self.admin.version(version);
        self
    }

    /// The address the data listener is bound to. Useful with an ephemeral
    /// port in tests.
    pub fn listen_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// The address the admin listener is bound to.
    pub fn admin_addr(&self) -> Result<std::net::SocketAddr> {
        self.admin.local_addr()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn spawn(self) -> Process {
        let mut thread_wakers = vec![self.listener.waker()];
        for worker in &self.workers {
            thread_wakers.push(worker.waker());
        }

        // channel for the parent `Process` to send signals to the admin
        // thread
        let (signal_tx, signal_rx) = bounded(QUEUE_CAPACITY);

        // queues for the admin thread to broadcast signals to all sibling
        // threads
        let (mut signal_queue_tx, mut signal_queue_rx) =
            Queues::new(vec![self.admin.waker()], thread_wakers, QUEUE_CAPACITY);

        // queues for the listener to hand sessions to the worker threads
        let worker_wakers: Vec<Arc<Waker>> = self.workers.iter().map(|w| w.waker()).collect();
        let (mut listener_session_queues, mut worker_session_queues) =
            Queues::new(vec![self.listener.waker()], worker_wakers, QUEUE_CAPACITY);

        let mut admin = self.admin.build(
            self.log_drain,
            signal_rx,
            signal_queue_tx.remove(0),
            self.registry.clone(),
        );

        let mut listener = self
            .listener
            .build(signal_queue_rx.remove(0), listener_session_queues.remove(0));

        let mut workers = Vec::new();
        for worker in self.workers {
            workers.push(worker.build(
                worker_session_queues.remove(0),
                signal_queue_rx.remove(0),
            ));
        }

        let admin = std::thread::Builder::new()
            .name(format!("{}_admin", THREAD_PREFIX))
            .spawn(move || admin.run())
            .unwrap();

        let listener = std::thread::Builder::new()
            .name(format!("{}_listener", THREAD_PREFIX))
            .spawn(move || listener.run())
            .unwrap();

        let mut worker_handles = Vec::new();
        for (id, mut worker) in workers.drain(..).enumerate() {
            worker_handles.push(
                std::thread::Builder::new()
                    .name(format!("{}_worker_{}", THREAD_PREFIX, id))
                    .spawn(move || worker.run())
                    .unwrap(),
            );
        }

        Process {
            admin,
            listener,
            signal_tx,
            workers: worker_handles,
        }
    }
}

pub struct Process {
    admin: JoinHandle<()>,
    listener: JoinHandle<()>,
    signal_tx: Sender<Signal>,
    workers: Vec<JoinHandle<()>>,
}

impl Process {
    /// Send a control-plane signal into the process. The admin thread
    /// relays it to every sibling thread.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        self.signal_tx
            .try_send(signal)
            .map_err(|_| Error::new(ErrorKind::Other, "failed to send signal"))
    }

    /// Attempts to gracefully shutdown the `Process` by sending a shutdown
    /// to each thread and then waiting to join those threads.
    ///
    /// This function will block until all threads have terminated.
    pub fn shutdown(self) {
        if self.signal_tx.try_send(Signal::Shutdown).is_err() {
            error!("error sending shutdown signal to thread");
        }

        self.wait()
    }

    /// Will block until all threads terminate. This should be used to keep
    /// the process alive while the child threads run.
    pub fn wait(self) {
        for thread in self.workers {
            let _ = thread.join();
        }
        let _ = self.listener.join();
        let _ = self.admin.join();
    }
}
