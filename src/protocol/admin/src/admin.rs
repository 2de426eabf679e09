// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use metrics::Stat;
use protocol_common::*;

use std::io::{Error, ErrorKind, Result};

#[derive(PartialEq, Eq, Debug)]
pub enum AdminRequest {
    Stats,
    Version,
    Quit,
}

#[derive(Default, Copy, Clone)]
pub struct AdminRequestParser {}

impl AdminRequestParser {
    pub fn new() -> Self {
        Self {}
    }
}

fn trim(buffer: &[u8]) -> &[u8] {
    let start = buffer
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(buffer.len());
    let end = buffer
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|p| p + 1)
        .unwrap_or(start);
    &buffer[start..end]
}

impl Parse<AdminRequest> for AdminRequestParser {
    fn parse(&self, buffer: &[u8]) -> Result<ParseOk<AdminRequest>> {
        // wait for a complete line
        if let Some(command_end) = buffer
            .windows(CRLF.len())
            .position(|w| w == CRLF.as_bytes())
        {
            metrics::increment_counter!(&Stat::AdminRequestParse);

            let consumed = command_end + CRLF.len();
            let request = match trim(&buffer[0..command_end]) {
                b"stats" => AdminRequest::Stats,
                b"version" => AdminRequest::Version,
                b"quit" => AdminRequest::Quit,
                _ => {
                    return Err(Error::from(ErrorKind::InvalidInput));
                }
            };
            Ok(ParseOk::new(request, consumed))
        } else {
            Err(Error::from(ErrorKind::WouldBlock))
        }
    }
}

pub enum AdminResponse {
    Stats(Vec<(&'static str, u64)>),
    Version(String),
    Hangup,
}

impl Compose for AdminResponse {
    fn compose(&self, dst: &mut dyn BufMut) -> usize {
        metrics::increment_counter!(&Stat::AdminResponseCompose);

        match self {
            Self::Stats(stats) => {
                let mut size = 0;
                for (name, value) in stats {
                    let line = format!("STAT {} {}{}", name, value, CRLF);
                    dst.put_slice(line.as_bytes());
                    size += line.len();
                }
                dst.put_slice(b"END\r\n");
                size + 5
            }
            Self::Version(version) => {
                let line = format!("VERSION {}{}", version, CRLF);
                dst.put_slice(line.as_bytes());
                line.len()
            }
            Self::Hangup => 0,
        }
    }

    fn should_hangup(&self) -> bool {
        matches!(self, Self::Hangup)
    }
}
