// Copyright 2020 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

use serde::{Deserialize, Serialize};

use std::io::Read;

// constants to define default values
const DAEMONIZE: bool = false;
const PID_FILENAME: Option<String> = None;

// helper functions
fn daemonize() -> bool {
    DAEMONIZE
}

fn pid_filename() -> Option<String> {
    PID_FILENAME
}

// struct definitions
#[derive(Serialize, Deserialize, Debug)]
pub struct McbpserverConfig {
    // top-level
    #[serde(default = "daemonize")]
    daemonize: bool,
    #[serde(default = "pid_filename")]
    pid_filename: Option<String>,

    // application modules
    #[serde(default)]
    admin: Admin,
    #[serde(default)]
    server: Server,
    #[serde(default)]
    worker: Worker,
    #[serde(default)]
    tls: Tls,

    #[serde(default)]
    buf: Buf,
    #[serde(default)]
    debug: Debug,
    #[serde(default)]
    tcp: Tcp,
}

impl AdminConfig for McbpserverConfig {
    fn admin(&self) -> &Admin {
        &self.admin
    }
}

impl BufConfig for McbpserverConfig {
    fn buf(&self) -> &Buf {
        &self.buf
    }
}

impl DebugConfig for McbpserverConfig {
    fn debug(&self) -> &Debug {
        &self.debug
    }
}

impl ServerConfig for McbpserverConfig {
    fn server(&self) -> &Server {
        &self.server
    }
}

impl TcpConfig for McbpserverConfig {
    fn tcp(&self) -> &Tcp {
        &self.tcp
    }
}

impl TlsConfig for McbpserverConfig {
    fn tls(&self) -> &Tls {
        &self.tls
    }
}

impl WorkerConfig for McbpserverConfig {
    fn worker(&self) -> &Worker {
        &self.worker
    }

    fn worker_mut(&mut self) -> &mut Worker {
        &mut self.worker
    }
}

// implementation
impl McbpserverConfig {
    pub fn load(file: &str) -> Result<Self, std::io::Error> {
        let mut file = std::fs::File::open(file)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        match toml::from_str(&content) {
            Ok(t) => Ok(t),
            Err(e) => {
                error!("{}", e);
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "Error parsing config",
                ))
            }
        }
    }

    pub fn print(&self) {
        match toml::to_string_pretty(self) {
            Ok(s) => println!("{}", s),
            Err(e) => error!("{}", e),
        }
    }

    pub fn daemonize(&self) -> bool {
        self.daemonize
    }

    pub fn pid_filename(&self) -> Option<String> {
        self.pid_filename.clone()
    }
}

// trait implementations
impl Default for McbpserverConfig {
    fn default() -> Self {
        Self {
            daemonize: daemonize(),
            pid_filename: pid_filename(),

            admin: Default::default(),
            server: Default::default(),
            worker: Default::default(),
            tls: Default::default(),

            buf: Default::default(),
            debug: Default::default(),
            tcp: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let config: McbpserverConfig = toml::from_str("").expect("failed to parse");
        assert!(!config.daemonize());
        assert_eq!(config.worker().threads(), 1);
        assert!(config.server().socket_addr().is_ok());
    }

    #[test]
    fn partial_override() {
        let config: McbpserverConfig = toml::from_str(
            "[worker]\nthreads = 4\nmax_reqs_per_event = 8\n[server]\nport = \"12345\"\n",
        )
        .expect("failed to parse");
        assert_eq!(config.worker().threads(), 4);
        assert_eq!(config.worker().max_reqs_per_event(), 8);
        assert_eq!(config.server().port(), "12345");
    }
}
