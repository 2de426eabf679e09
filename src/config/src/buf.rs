// Copyright 2020 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::units::KB;

use serde::{Deserialize, Serialize};

// constants to define default values
const BUF_DEFAULT_SIZE: usize = 16 * KB;

// helper functions
fn size() -> usize {
    BUF_DEFAULT_SIZE
}

// struct definitions
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Buf {
    #[serde(default = "size")]
    size: usize,
}

// implementation
impl Buf {
    /// Target size for the pooled read and write pipes.
    pub fn size(&self) -> usize {
        self.size
    }
}

// trait implementations
impl Default for Buf {
    fn default() -> Self {
        Self { size: size() }
    }
}

// trait definitions
pub trait BufConfig {
    fn buf(&self) -> &Buf;
}
