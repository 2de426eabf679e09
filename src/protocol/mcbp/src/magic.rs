// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

/// First byte of every frame, identifying its direction and kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Magic {
    ClientRequest = 0x80,
    ClientResponse = 0x81,
    ServerRequest = 0x82,
    ServerResponse = 0x83,
}

impl Magic {
    pub fn is_request(&self) -> bool {
        matches!(self, Magic::ClientRequest | Magic::ServerRequest)
    }

    pub fn is_response(&self) -> bool {
        !self.is_request()
    }
}

impl TryFrom<u8> for Magic {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x80 => Ok(Magic::ClientRequest),
            0x81 => Ok(Magic::ClientResponse),
            0x82 => Ok(Magic::ServerRequest),
            0x83 => Ok(Magic::ServerResponse),
            _ => Err(()),
        }
    }
}
