// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Per-in-flight-command context. A connection normally reuses one cookie
//! for every command; when unordered execution was negotiated, a parked
//! command is detached into its own slot (taking a copy of the request
//! bytes with it) so the connection can keep parsing.

use engine::EngineResult;
use protocol_mcbp::RequestHeader;

/// Opaque state for commands which span engine invocations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandContext {
    Flush(FlushState),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlushState {
    Flushing,
    Done,
}

pub struct Cookie {
    /// Header of the request currently bound to this cookie.
    header: Option<RequestHeader>,
    /// Owned copy of the full request, present only when the cookie was
    /// detached from the read pipe for unordered execution.
    packet: Option<Box<[u8]>>,
    /// Position in arrival order, used to serialize responses.
    seq: u64,
    error_context: Option<String>,
    event_id: Option<String>,
    cas: u64,
    /// Status delivered by an engine wakeup; read (and reset) before the
    /// engine is re-invoked.
    aiostat: EngineResult<()>,
    ewouldblock: bool,
    /// Response bytes staged out-of-band: either a dynamically built
    /// response (stats, failover log) or, for detached cookies, the
    /// complete response awaiting ordered drain.
    dynamic_buffer: Vec<u8>,
    /// Set once a detached cookie's response is complete and waiting in the
    /// dynamic buffer.
    response_ready: bool,
    context: Option<CommandContext>,
}

impl Cookie {
    pub fn new() -> Self {
        Self {
            header: None,
            packet: None,
            seq: 0,
            error_context: None,
            event_id: None,
            cas: 0,
            aiostat: Ok(()),
            ewouldblock: false,
            dynamic_buffer: Vec::new(),
            response_ready: false,
            context: None,
        }
    }

    /// Reset for the next command. The cookie keeps its allocations.
    pub fn reset(&mut self) {
        self.header = None;
        self.packet = None;
        self.seq = 0;
        self.error_context = None;
        self.event_id = None;
        self.cas = 0;
        self.aiostat = Ok(());
        self.ewouldblock = false;
        self.dynamic_buffer.clear();
        self.response_ready = false;
        self.context = None;
    }

    pub fn bind(&mut self, header: RequestHeader, seq: u64) {
        self.reset();
        self.header = Some(header);
        self.seq = seq;
    }

    pub fn header(&self) -> &RequestHeader {
        self.header
            .as_ref()
            .expect("cookie has no request bound to it")
    }

    pub fn has_request(&self) -> bool {
        self.header.is_some()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Detach from the read pipe by taking an owned copy of the frame.
    pub fn detach(&mut self, packet: &[u8]) {
        self.packet = Some(packet.to_vec().into_boxed_slice());
    }

    pub fn detached_packet(&self) -> Option<&[u8]> {
        self.packet.as_deref()
    }

    pub fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn aiostat(&self) -> EngineResult<()> {
        self.aiostat
    }

    pub fn set_aiostat(&mut self, status: EngineResult<()>) {
        self.aiostat = status;
    }

    pub fn is_ewouldblock(&self) -> bool {
        self.ewouldblock
    }

    pub fn set_ewouldblock(&mut self, ewouldblock: bool) {
        self.ewouldblock = ewouldblock;
    }

    pub fn context(&self) -> Option<CommandContext> {
        self.context
    }

    pub fn set_context(&mut self, context: Option<CommandContext>) {
        self.context = context;
    }

    pub fn set_error_context<T: Into<String>>(&mut self, context: T) {
        self.error_context = Some(context.into());
        if self.event_id.is_none() {
            self.event_id = Some(new_event_id());
        }
    }

    pub fn error_context(&self) -> Option<&str> {
        self.error_context.as_deref()
    }

    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref()
    }

    /// The JSON error envelope, or `None` when there is no context to
    /// report.
    pub fn error_json(&self) -> Option<String> {
        if self.error_context.is_none() && self.event_id.is_none() {
            return None;
        }

        let mut error = serde_json::Map::new();
        if let Some(context) = &self.error_context {
            error.insert("context".to_string(), context.clone().into());
        }
        if let Some(ref_id) = &self.event_id {
            error.insert("ref".to_string(), ref_id.clone().into());
        }

        let mut root = serde_json::Map::new();
        root.insert("error".to_string(), error.into());
        Some(serde_json::Value::Object(root).to_string())
    }

    pub fn dynamic_buffer(&mut self) -> &mut Vec<u8> {
        &mut self.dynamic_buffer
    }

    pub fn take_dynamic_buffer(&mut self) -> Vec<u8> {
        self.response_ready = false;
        std::mem::take(&mut self.dynamic_buffer)
    }

    pub fn response_ready(&self) -> bool {
        self.response_ready
    }

    pub fn set_response_ready(&mut self) {
        self.response_ready = true;
    }
}

impl Default for Cookie {
    fn default() -> Self {
        Self::new()
    }
}

/// Random identifier attached to error responses and logged alongside them,
/// letting an operator tie a client-visible error back to the log.
fn new_event_id() -> String {
    let id: u128 = rand::random();
    format!("{:032x}", id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::ErrorCode;

    #[test]
    fn error_json_envelope() {
        let mut cookie = Cookie::new();
        assert!(cookie.error_json().is_none());

        cookie.set_error_context("invalid frame");
        let json = cookie.error_json().expect("no error json");
        let parsed: serde_json::Value = serde_json::from_str(&json).expect("invalid json");

        assert_eq!(parsed["error"]["context"], "invalid frame");
        let reference = parsed["error"]["ref"].as_str().expect("missing ref");
        assert_eq!(reference.len(), 32);
    }

    #[test]
    fn reset_clears_state() {
        let mut cookie = Cookie::new();
        cookie.set_cas(42);
        cookie.set_error_context("oops");
        cookie.set_ewouldblock(true);
        cookie.set_aiostat(Err(ErrorCode::TmpFail));
        cookie.dynamic_buffer().extend_from_slice(b"data");

        cookie.reset();
        assert_eq!(cookie.cas(), 0);
        assert!(cookie.error_json().is_none());
        assert!(!cookie.is_ewouldblock());
        assert_eq!(cookie.aiostat(), Ok(()));
        assert!(cookie.dynamic_buffer().is_empty());
    }
}
