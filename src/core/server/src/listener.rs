// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The listener thread accepts new streams, finishes TLS handshakes, and
//! hands established streams to the workers. Sessions stuck mid-handshake
//! are parked on the listener's own poller so slow TLS clients never touch
//! a worker.

use crate::*;

use metrics::Stat;

use std::sync::atomic::AtomicI64;

pub struct Listener {
    listener: ::net::Listener,
    poll: Poll,
    sessions: Slab<Stream>,
    session_queue: Queues<ConnectionInit, ConnectionInit>,
    signal_queue: Queues<(), Signal>,
    timeout: Duration,
    waker: Arc<Waker>,
    port_conns: Arc<AtomicI64>,
}

pub struct ListenerBuilder {
    listener: ::net::Listener,
    poll: Poll,
    sessions: Slab<Stream>,
    timeout: Duration,
    waker: Arc<Waker>,
    port_conns: Arc<AtomicI64>,
}

impl ListenerBuilder {
    pub fn new<T: ServerConfig + TlsConfig>(config: &T) -> Result<Self> {
        let tls_config = config.tls();
        let config = config.server();

        let addr = config.socket_addr().map_err(|e| {
            error!("{}", e);
            Error::new(ErrorKind::Other, "bad listen address")
        })?;

        let tcp_listener = TcpListener::bind(addr)?;

        let mut listener = if let Some(tls_acceptor) = tls_acceptor(tls_config)? {
            ::net::Listener::from((tcp_listener, tls_acceptor))
        } else {
            ::net::Listener::from(tcp_listener)
        };

        let poll = Poll::new()?;
        listener.register(poll.registry(), LISTENER_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let timeout = Duration::from_millis(config.timeout() as u64);

        Ok(Self {
            listener,
            poll,
            sessions: Slab::new(),
            timeout,
            waker,
            port_conns: Arc::new(AtomicI64::new(0)),
        })
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn build(
        self,
        signal_queue: Queues<(), Signal>,
        session_queue: Queues<ConnectionInit, ConnectionInit>,
    ) -> Listener {
        Listener {
            listener: self.listener,
            poll: self.poll,
            sessions: self.sessions,
            session_queue,
            signal_queue,
            timeout: self.timeout,
            waker: self.waker,
            port_conns: self.port_conns,
        }
    }
}

impl Listener {
    /// Hand an established stream to one of the workers.
    fn dispatch(&mut self, stream: Stream) {
        metrics::increment_counter!(&Stat::ConnAccept);
        self.port_conns.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let init = ConnectionInit {
            stream,
            port_conns: self.port_conns.clone(),
        };
        if self.session_queue.try_send_any(init).is_err() {
            metrics::increment_counter!(&Stat::ConnAcceptEx);
            self.port_conns.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            warn!("session queue full, dropping new connection");
        }
        let _ = self.session_queue.wake();
    }

    /// Call accept one time.
    fn accept(&mut self) {
        match self.listener.accept() {
            Ok(mut stream) => {
                if stream.is_handshaking() {
                    let entry = self.sessions.vacant_entry();
                    let token = Token(entry.key());
                    if stream
                        .register(self.poll.registry(), token, stream.interest())
                        .is_ok()
                    {
                        entry.insert(stream);
                    } else {
                        metrics::increment_counter!(&Stat::ConnAcceptEx);
                    }
                } else {
                    self.dispatch(stream);
                }

                // reregister so accept is called again if there is a backlog
                let _ = self.listener.reregister(
                    self.poll.registry(),
                    LISTENER_TOKEN,
                    Interest::READABLE,
                );
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(_) => {
                metrics::increment_counter!(&Stat::ConnAcceptEx);
            }
        }
    }

    /// Drive a parked session's TLS handshake.
    fn handshake(&mut self, token: Token) {
        let done = match self.sessions.get_mut(token.0) {
            Some(stream) => match stream.do_handshake() {
                Ok(()) => true,
                Err(e) if e.kind() == ErrorKind::WouldBlock => false,
                Err(_) => {
                    let mut stream = self.sessions.remove(token.0);
                    let _ = stream.deregister(self.poll.registry());
                    return;
                }
            },
            None => return,
        };

        if done {
            let mut stream = self.sessions.remove(token.0);
            let _ = stream.deregister(self.poll.registry());
            self.dispatch(stream);
        }
    }

    pub fn run(&mut self) {
        let mut events = Events::with_capacity(1024);

        loop {
            if self.poll.poll(&mut events, Some(self.timeout)).is_err() {
                error!("error polling listener");
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => {
                        self.accept();
                    }
                    WAKER_TOKEN => {
                        // check if we received any signals from the admin
                        // thread
                        while let Some(signal) =
                            self.signal_queue.try_recv().map(|v| v.into_inner())
                        {
                            match signal {
                                Signal::Shutdown => {
                                    return;
                                }
                                Signal::FlushAll | Signal::SignalIdle(_) => {}
                            }
                        }
                    }
                    token => {
                        self.handshake(token);
                    }
                }
            }

            let _ = self.session_queue.wake();
        }
    }
}
