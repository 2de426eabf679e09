// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Network types which unify plaintext TCP and TLS/SSL over TCP behind a
//! single `Stream` type, so that enabling TLS is purely a matter of
//! configuration.

pub use mio::*;

pub mod event {
    pub use mio::event::*;
}

mod listener;
mod stream;
mod tcp;
mod tls_tcp;

pub use listener::*;
pub use stream::*;
pub use tcp::*;
pub use tls_tcp::*;

use core::fmt::Debug;
use core::ops::Deref;
use std::io::{Error, ErrorKind, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

type Result<T> = std::io::Result<T>;
