// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

/// A wrapper type that unifies types which represent a stream. Plaintext TCP
/// streams and TLS/SSL over TCP are both wrapped by this type, which allows
/// enabling TLS/SSL through configuration.
pub struct Stream {
    inner: StreamType,
}

/// Concrete types for the stream variants. The number of variants is small,
/// so dispatch through enum variants is preferred over a trait object.
enum StreamType {
    Tcp(TcpStream),
    TlsTcp(TlsTcpStream),
}

impl Stream {
    pub fn interest(&self) -> Interest {
        match &self.inner {
            StreamType::Tcp(s) => {
                if !s.is_established() {
                    Interest::READABLE.add(Interest::WRITABLE)
                } else {
                    Interest::READABLE
                }
            }
            StreamType::TlsTcp(s) => s.interest(),
        }
    }

    pub fn is_established(&self) -> bool {
        match &self.inner {
            StreamType::Tcp(s) => s.is_established(),
            StreamType::TlsTcp(s) => !s.is_handshaking(),
        }
    }

    pub fn is_handshaking(&self) -> bool {
        match &self.inner {
            StreamType::Tcp(_) => false,
            StreamType::TlsTcp(s) => s.is_handshaking(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.inner, StreamType::TlsTcp(_))
    }

    pub fn do_handshake(&mut self) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(_) => Ok(()),
            StreamType::TlsTcp(s) => s.do_handshake(),
        }
    }

    pub fn set_nodelay(&mut self, nodelay: bool) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.set_nodelay(nodelay),
            StreamType::TlsTcp(s) => s.set_nodelay(nodelay),
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        match &self.inner {
            StreamType::Tcp(s) => s.peer_addr(),
            StreamType::TlsTcp(s) => s.peer_addr(),
        }
    }

    pub fn shutdown(&mut self) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.shutdown(Shutdown::Both),
            StreamType::TlsTcp(s) => s.shutdown(),
        }
    }
}

impl Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        match &self.inner {
            StreamType::Tcp(s) => write!(f, "{:?}", s),
            StreamType::TlsTcp(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<TcpStream> for Stream {
    fn from(other: TcpStream) -> Self {
        Self {
            inner: StreamType::Tcp(other),
        }
    }
}

impl From<TlsTcpStream> for Stream {
    fn from(other: TlsTcpStream) -> Self {
        Self {
            inner: StreamType::TlsTcp(other),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.read(buf),
            StreamType::TlsTcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.write(buf),
            StreamType::TlsTcp(s) => s.write(buf),
        }
    }

    fn write_vectored(&mut self, bufs: &[std::io::IoSlice<'_>]) -> Result<usize> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.write_vectored(bufs),
            // boring does not expose a vectored write, fall back to the
            // first non-empty slice
            StreamType::TlsTcp(s) => match bufs.iter().find(|b| !b.is_empty()) {
                Some(buf) => s.write(buf),
                None => Ok(0),
            },
        }
    }

    fn flush(&mut self) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.flush(),
            StreamType::TlsTcp(s) => s.flush(),
        }
    }
}

impl event::Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.register(registry, token, interest),
            StreamType::TlsTcp(s) => s.register(registry, token, interest),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.reregister(registry, token, interest),
            StreamType::TlsTcp(s) => s.reregister(registry, token, interest),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> Result<()> {
        match &mut self.inner {
            StreamType::Tcp(s) => s.deregister(registry),
            StreamType::TlsTcp(s) => s.deregister(registry),
        }
    }
}
