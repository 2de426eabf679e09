// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use boring::ssl::{
    HandshakeError, MidHandshakeSslStream, SslAcceptor, SslFiletype, SslMethod, SslStream,
};
use boring::x509::X509;

use crate::*;

/// Polymorphism via enum so that negotiated and handshaking TLS/SSL streams
/// are represented by a single type.
enum TlsState {
    Handshaking(MidHandshakeSslStream<TcpStream>),
    Negotiated(SslStream<TcpStream>),
}

/// Wraps a TLS/SSL stream so that negotiated and handshaking sessions have a
/// uniform type.
pub struct TlsTcpStream {
    state: Option<TlsState>,
}

impl TlsTcpStream {
    pub fn is_handshaking(&self) -> bool {
        matches!(self.state, Some(TlsState::Handshaking(_)))
    }

    pub fn interest(&self) -> Interest {
        if self.is_handshaking() {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        }
    }

    pub fn set_nodelay(&mut self, nodelay: bool) -> Result<()> {
        match &mut self.state {
            Some(TlsState::Handshaking(s)) => s.get_mut().set_nodelay(nodelay),
            Some(TlsState::Negotiated(s)) => s.get_mut().set_nodelay(nodelay),
            None => Err(Error::new(ErrorKind::Other, "stream is closed")),
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        match &self.state {
            Some(TlsState::Handshaking(s)) => s.get_ref().peer_addr(),
            Some(TlsState::Negotiated(s)) => s.get_ref().peer_addr(),
            None => Err(Error::new(ErrorKind::Other, "stream is closed")),
        }
    }

    /// Attempts to drive the TLS/SSL handshake to completion. An `Ok` return
    /// indicates the handshake is complete. `WouldBlock` indicates that the
    /// handshake may complete in the future. Any other error indicates a
    /// failure with no possible recovery and the connection should be closed.
    pub fn do_handshake(&mut self) -> Result<()> {
        match self.state.take() {
            Some(TlsState::Handshaking(stream)) => match stream.handshake() {
                Ok(negotiated) => {
                    self.state = Some(TlsState::Negotiated(negotiated));
                    Ok(())
                }
                Err(HandshakeError::WouldBlock(handshaking)) => {
                    self.state = Some(TlsState::Handshaking(handshaking));
                    Err(Error::from(ErrorKind::WouldBlock))
                }
                Err(_) => Err(Error::new(ErrorKind::Other, "handshake failed")),
            },
            Some(TlsState::Negotiated(stream)) => {
                self.state = Some(TlsState::Negotiated(stream));
                Ok(())
            }
            None => Err(Error::new(ErrorKind::Other, "stream is closed")),
        }
    }

    pub fn shutdown(&mut self) -> Result<()> {
        if let Some(TlsState::Negotiated(s)) = &mut self.state {
            s.shutdown()
                .map(|_| ())
                .map_err(|e| Error::new(ErrorKind::Other, e.to_string()))
        } else {
            Ok(())
        }
    }
}

impl Debug for TlsTcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        match &self.state {
            Some(TlsState::Handshaking(s)) => write!(f, "{:?} (handshaking)", s.get_ref()),
            Some(TlsState::Negotiated(s)) => write!(f, "{:?}", s.get_ref()),
            None => write!(f, "closed tls stream"),
        }
    }
}

impl Read for TlsTcpStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.state {
            Some(TlsState::Negotiated(s)) => s.read(buf),
            Some(TlsState::Handshaking(_)) => Err(Error::new(
                ErrorKind::WouldBlock,
                "read on handshaking session would block",
            )),
            None => Err(Error::new(ErrorKind::Other, "stream is closed")),
        }
    }
}

impl Write for TlsTcpStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match &mut self.state {
            Some(TlsState::Negotiated(s)) => s.write(buf),
            Some(TlsState::Handshaking(_)) => Err(Error::new(
                ErrorKind::WouldBlock,
                "write on handshaking session would block",
            )),
            None => Err(Error::new(ErrorKind::Other, "stream is closed")),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match &mut self.state {
            Some(TlsState::Negotiated(s)) => s.flush(),
            Some(TlsState::Handshaking(_)) => Err(Error::new(
                ErrorKind::WouldBlock,
                "flush on handshaking session would block",
            )),
            None => Err(Error::new(ErrorKind::Other, "stream is closed")),
        }
    }
}

impl event::Source for TlsTcpStream {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        match &mut self.state {
            Some(TlsState::Handshaking(s)) => s.get_mut().register(registry, token, interest),
            Some(TlsState::Negotiated(s)) => s.get_mut().register(registry, token, interest),
            None => Err(Error::new(ErrorKind::Other, "stream is closed")),
        }
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<()> {
        match &mut self.state {
            Some(TlsState::Handshaking(s)) => s.get_mut().reregister(registry, token, interest),
            Some(TlsState::Negotiated(s)) => s.get_mut().reregister(registry, token, interest),
            None => Err(Error::new(ErrorKind::Other, "stream is closed")),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> Result<()> {
        match &mut self.state {
            Some(TlsState::Handshaking(s)) => s.get_mut().deregister(registry),
            Some(TlsState::Negotiated(s)) => s.get_mut().deregister(registry),
            None => Err(Error::new(ErrorKind::Other, "stream is closed")),
        }
    }
}

/// Provides a wrapped acceptor for server-side TLS, producing our wrapped
/// `TlsTcpStream` type so that handshaking and negotiated streams share a
/// uniform type.
pub struct TlsTcpAcceptor {
    inner: SslAcceptor,
}

impl TlsTcpAcceptor {
    pub fn mozilla_intermediate_v5() -> Result<TlsTcpAcceptorBuilder> {
        let inner = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
            .map_err(|e| Error::new(ErrorKind::Other, e.to_string()))?;

        Ok(TlsTcpAcceptorBuilder {
            inner,
            ca_file: None,
            certificate_file: None,
            certificate_chain_file: None,
            private_key_file: None,
        })
    }

    pub fn accept(&self, stream: TcpStream) -> Result<TlsTcpStream> {
        match self.inner.accept(stream) {
            Ok(negotiated) => Ok(TlsTcpStream {
                state: Some(TlsState::Negotiated(negotiated)),
            }),
            Err(HandshakeError::WouldBlock(handshaking)) => Ok(TlsTcpStream {
                state: Some(TlsState::Handshaking(handshaking)),
            }),
            Err(_) => Err(Error::new(ErrorKind::Other, "handshake failed")),
        }
    }
}

/// Builder for a `TlsTcpAcceptor` with file-based key and certificate
/// loading.
pub struct TlsTcpAcceptorBuilder {
    inner: boring::ssl::SslAcceptorBuilder,
    ca_file: Option<PathBuf>,
    certificate_file: Option<PathBuf>,
    certificate_chain_file: Option<PathBuf>,
    private_key_file: Option<PathBuf>,
}

impl TlsTcpAcceptorBuilder {
    pub fn build(mut self) -> Result<TlsTcpAcceptor> {
        if let Some(f) = self.ca_file {
            self.inner.set_ca_file(f).map_err(|e| {
                Error::new(ErrorKind::Other, format!("failed to load CA file: {}", e))
            })?;
        }

        if let Some(f) = self.private_key_file {
            self.inner
                .set_private_key_file(f, SslFiletype::PEM)
                .map_err(|e| {
                    Error::new(
                        ErrorKind::Other,
                        format!("failed to load private key file: {}", e),
                    )
                })?;
        } else {
            return Err(Error::new(ErrorKind::Other, "no private key file provided"));
        }

        match (self.certificate_chain_file, self.certificate_file) {
            (Some(chain), Some(cert)) => {
                // leaf in a standalone file, intermediates + root in another
                self.inner
                    .set_certificate_file(cert, SslFiletype::PEM)
                    .map_err(|e| {
                        Error::new(
                            ErrorKind::Other,
                            format!("failed to load certificate file: {}", e),
                        )
                    })?;
                let pem = std::fs::read(chain).map_err(|e| {
                    Error::new(
                        ErrorKind::Other,
                        format!("failed to load certificate chain file: {}", e),
                    )
                })?;
                let chain = X509::stack_from_pem(&pem).map_err(|e| {
                    Error::new(
                        ErrorKind::Other,
                        format!("failed to load certificate chain file: {}", e),
                    )
                })?;
                for cert in chain {
                    self.inner.add_extra_chain_cert(cert).map_err(|e| {
                        Error::new(
                            ErrorKind::Other,
                            format!("bad certificate in certificate chain file: {}", e),
                        )
                    })?;
                }
            }
            (Some(chain), None) => {
                // complete chain: leaf + intermediates + root in one file
                self.inner.set_certificate_chain_file(chain).map_err(|e| {
                    Error::new(
                        ErrorKind::Other,
                        format!("failed to load certificate chain file: {}", e),
                    )
                })?;
            }
            (None, Some(cert)) => {
                self.inner
                    .set_certificate_file(cert, SslFiletype::PEM)
                    .map_err(|e| {
                        Error::new(
                            ErrorKind::Other,
                            format!("failed to load certificate file: {}", e),
                        )
                    })?;
            }
            (None, None) => {
                return Err(Error::new(
                    ErrorKind::Other,
                    "no certificate file or certificate chain file provided",
                ));
            }
        }

        Ok(TlsTcpAcceptor {
            inner: self.inner.build(),
        })
    }

    /// Load trusted root certificates from a PEM-formatted file.
    pub fn ca_file<P: AsRef<Path>>(mut self, file: P) -> Self {
        self.ca_file = Some(file.as_ref().to_path_buf());
        self
    }

    /// Load a leaf certificate from a PEM-formatted file.
    pub fn certificate_file<P: AsRef<Path>>(mut self, file: P) -> Self {
        self.certificate_file = Some(file.as_ref().to_path_buf());
        self
    }

    /// Load a certificate chain from a PEM-formatted file.
    pub fn certificate_chain_file<P: AsRef<Path>>(mut self, file: P) -> Self {
        self.certificate_chain_file = Some(file.as_ref().to_path_buf());
        self
    }

    /// Load the private key from a PEM-formatted file.
    pub fn private_key_file<P: AsRef<Path>>(mut self, file: P) -> Self {
        self.private_key_file = Some(file.as_ref().to_path_buf());
        self
    }
}
