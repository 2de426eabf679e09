// Copyright 2020 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

#[macro_use]
extern crate log;

mod admin;
mod buf;
mod debug;
mod mcbpserver;
mod server;
mod tcp;
mod tls;
mod units;
mod worker;

pub use admin::{Admin, AdminConfig};
pub use buf::{Buf, BufConfig};
pub use debug::{Debug, DebugConfig};
pub use mcbpserver::McbpserverConfig;
pub use server::{Server, ServerConfig};
pub use tcp::{Tcp, TcpConfig};
pub use tls::{Tls, TlsConfig};
pub use worker::{Worker, WorkerConfig};
