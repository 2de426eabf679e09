// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The admin thread: serves the text admin protocol, owns the log drain,
//! and relays control-plane signals to every sibling thread.

use crate::*;

use buffer::Pipe;
use protocol_admin::{AdminRequest, AdminRequestParser, AdminResponse};
use protocol_common::{Compose, Parse};

const ADMIN_BUFFER_SIZE: usize = 16 * 1024;

struct AdminSession {
    stream: Stream,
    read: Pipe,
    write: Pipe,
}

pub struct Admin {
    listener: ::net::Listener,
    log_drain: Box<dyn Drain>,
    parser: AdminRequestParser,
    poll: Poll,
    sessions: Slab<AdminSession>,
    signal_rx: Receiver<Signal>,
    signal_queue_tx: Queues<Signal, ()>,
    registry: Arc<ConnectionRegistry>,
    timeout: Duration,
    version: String,
    waker: Arc<Waker>,
}

pub struct AdminBuilder {
    listener: ::net::Listener,
    poll: Poll,
    timeout: Duration,
    version: String,
    waker: Arc<Waker>,
}

impl AdminBuilder {
    pub fn new<T: AdminConfig + TlsConfig>(config: &T) -> Result<Self> {
        let tls_config = config.tls();
        let config = config.admin();

        let addr = config.socket_addr().map_err(|e| {
            error!("{}", e);
            Error::new(ErrorKind::Other, "bad admin listen address")
        })?;

        let tcp_listener = TcpListener::bind(addr)?;

        let mut listener = match (config.use_tls(), tls_acceptor(tls_config)?) {
            (true, Some(tls_acceptor)) => ::net::Listener::from((tcp_listener, tls_acceptor)),
            _ => ::net::Listener::from(tcp_listener),
        };

        let poll = Poll::new()?;
        listener.register(poll.registry(), LISTENER_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let timeout = Duration::from_millis(config.timeout() as u64);

        Ok(Self {
            listener,
            poll,
            timeout,
            version: env!("CARGO_PKG_VERSION").to_string(),
            waker,
        })
    }

    pub fn version(&mut self, version: &str) {
        self.version = version.to_string();
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn build(
        self,
        log_drain: Box<dyn Drain>,
        signal_rx: Receiver<Signal>,
        signal_queue_tx: Queues<Signal, ()>,
        registry: Arc<ConnectionRegistry>,
    ) -> Admin {
        Admin {
            listener: self.listener,
            log_drain,
            parser: AdminRequestParser::new(),
            poll: self.poll,
            sessions: Slab::new(),
            signal_rx,
            signal_queue_tx,
            registry,
            timeout: self.timeout,
            version: self.version,
            waker: self.waker,
        }
    }
}

impl Admin {
    fn accept(&mut self) {
        if let Ok(mut stream) = self.listener.accept() {
            let entry = self.sessions.vacant_entry();
            let token = Token(entry.key());
            if stream
                .register(self.poll.registry(), token, Interest::READABLE)
                .is_ok()
            {
                entry.insert(AdminSession {
                    stream,
                    read: Pipe::new(ADMIN_BUFFER_SIZE),
                    write: Pipe::new(ADMIN_BUFFER_SIZE),
                });
            }

            let _ = self
                .listener
                .reregister(self.poll.registry(), LISTENER_TOKEN, Interest::READABLE);
        }
    }

    fn close(&mut self, token: Token) {
        if self.sessions.contains(token.0) {
            let mut session = self.sessions.remove(token.0);
            let _ = session.stream.deregister(self.poll.registry());
            let _ = session.stream.shutdown();
        }
    }

    fn respond(&self, request: AdminRequest) -> AdminResponse {
        match request {
            AdminRequest::Stats => {
                let mut stats = metrics::snapshot();
                stats.push(("admin_curr_connections", self.registry.len() as u64));
                AdminResponse::Stats(stats)
            }
            AdminRequest::Version => AdminResponse::Version(self.version.clone()),
            AdminRequest::Quit => AdminResponse::Hangup,
        }
    }

    /// Read, parse and answer requests on one admin session. Returns false
    /// if the session should be closed.
    fn handle_data(&mut self, token: Token) -> bool {
        // fill the session's read pipe
        loop {
            let session = match self.sessions.get_mut(token.0) {
                Some(session) => session,
                None => return true,
            };
            if session.read.wsize() < 1024 {
                session.read.reserve(4096);
            }
            let chunk = session.read.wdata();
            match session.stream.read(chunk) {
                Ok(0) => return false,
                Ok(n) => {
                    session.read.produced(n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return false,
            }
        }

        // handle complete requests
        loop {
            let parsed = {
                let session = match self.sessions.get(token.0) {
                    Some(session) => session,
                    None => return true,
                };
                self.parser.parse(session.read.rdata())
            };

            match parsed {
                Ok(ok) => {
                    let consumed = ok.consumed();
                    let request = ok.into_inner();
                    let response = self.respond(request);
                    let hangup = response.should_hangup();

                    let session = match self.sessions.get_mut(token.0) {
                        Some(session) => session,
                        None => return true,
                    };
                    session.read.consumed(consumed);
                    response.compose(&mut session.write);

                    if hangup {
                        let _ = Self::flush(session);
                        return false;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => return false,
            }
        }

        let session = match self.sessions.get_mut(token.0) {
            Some(session) => session,
            None => return true,
        };
        Self::flush(session).is_ok()
    }

    fn flush(session: &mut AdminSession) -> Result<()> {
        while !session.write.is_empty() {
            match session.stream.write(session.write.rdata()) {
                Ok(0) => return Err(Error::new(ErrorKind::Other, "failed to flush")),
                Ok(n) => session.write.consumed(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn run(&mut self) {
        let mut events = Events::with_capacity(1024);

        loop {
            let _ = self.log_drain.flush();

            if self.poll.poll(&mut events, Some(self.timeout)).is_err() {
                error!("error polling admin");
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => {
                        self.accept();
                    }
                    WAKER_TOKEN => {}
                    token => {
                        if event.is_error() || !self.handle_data(token) {
                            self.close(token);
                        }
                    }
                }
            }

            // relay signals from the process to every sibling thread
            while let Ok(signal) = self.signal_rx.try_recv() {
                info!("relaying signal: {:?}", signal);
                let shutdown = signal == Signal::Shutdown;
                let _ = self.signal_queue_tx.try_send_all(signal);
                let _ = self.signal_queue_tx.wake();
                if shutdown {
                    let _ = self.log_drain.flush();
                    return;
                }
            }
        }
    }
}
