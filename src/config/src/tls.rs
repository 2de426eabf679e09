// Copyright 2020 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

// constants to define default values
const CERTIFICATE_CHAIN: Option<String> = None;
const CERTIFICATE: Option<String> = None;
const PRIVATE_KEY: Option<String> = None;
const CA_FILE: Option<String> = None;

// helper functions
fn certificate_chain() -> Option<String> {
    CERTIFICATE_CHAIN
}

fn certificate() -> Option<String> {
    CERTIFICATE
}

fn private_key() -> Option<String> {
    PRIVATE_KEY
}

fn ca_file() -> Option<String> {
    CA_FILE
}

// definitions
#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct Tls {
    #[serde(default = "certificate_chain")]
    certificate_chain: Option<String>,
    #[serde(default = "certificate")]
    certificate: Option<String>,
    #[serde(default = "private_key")]
    private_key: Option<String>,
    #[serde(default = "ca_file")]
    ca_file: Option<String>,
}

// implementation
impl Tls {
    pub fn certificate_chain(&self) -> Option<String> {
        self.certificate_chain.clone()
    }

    pub fn certificate(&self) -> Option<String> {
        self.certificate.clone()
    }

    pub fn private_key(&self) -> Option<String> {
        self.private_key.clone()
    }

    pub fn ca_file(&self) -> Option<String> {
        self.ca_file.clone()
    }
}

// trait definitions
pub trait TlsConfig {
    fn tls(&self) -> &Tls;
}

impl common::ssl::TlsConfig for Tls {
    fn certificate_chain(&self) -> Option<String> {
        self.certificate_chain.clone()
    }

    fn private_key(&self) -> Option<String> {
        self.private_key.clone()
    }

    fn certificate(&self) -> Option<String> {
        self.certificate.clone()
    }

    fn ca_file(&self) -> Option<String> {
        self.ca_file.clone()
    }
}
