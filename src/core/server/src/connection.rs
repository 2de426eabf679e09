// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! One socket, one peer. The connection owns the stream, the loaned read
//! and write pipes, the in-flight command cookies, and the scatter-send
//! state (message headers of io-vector entries). It is driven exclusively
//! by its owning worker through the state machine.

use crate::cookie::Cookie;
use crate::event::ServerEvent;
use crate::rbac::PrivilegeContext;
use crate::statemachine::State;

use buffer::Pipe;
use bytes::Bytes;
use engine::{Engine, ItemHandle};
use metrics::Stat;
use protocol_mcbp::*;

use ::net::event::Source;
use ::net::{Interest, Registry, Stream, Token};

use std::collections::VecDeque;
use std::io::{ErrorKind, IoSlice, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// if the read pipe has less free space than this before a read, grow it
const BUFFER_MIN_FREE: usize = 4 * 1024;

// target size for read operations, the upper bound on a TLS fragment
const TARGET_READ_SIZE: usize = 16 * 1024;

// io-vector entries per message header before a new header is opened
const IOV_MAX: usize = 128;

// upper bound on detached commands when unordered execution is negotiated
const MAX_INFLIGHT_COMMANDS: usize = 16;

// agent names and client-chosen connection ids are preserved truncated
const MAX_AGENT_NAME: usize = 32;
const MAX_CONNECTION_ID: usize = 33;

/// Result of draining the socket into the read pipe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TryReadResult {
    /// Data was received and is ready to parse.
    DataReceived,
    /// Nothing was available on the socket.
    NoDataReceived,
    /// The peer closed the connection.
    SocketClosed,
    /// A hard error occurred on the socket.
    SocketError,
    /// The read pipe could not be provisioned.
    MemoryError,
}

/// Result of one transmit step over the message list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransmitResult {
    /// All message headers are fully sent.
    Complete,
    /// Some bytes were sent; more remain.
    Incomplete,
    /// The kernel would block; wait for writability.
    SoftError,
    /// The socket failed; the connection must close.
    HardError,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Priority {
    High,
    Medium,
    Low,
}

/// One entry of a message header's io-vector: either a range of the write
/// pipe (by absolute offset, stable across pipe growth) or a refcounted
/// slice of an engine item value.
#[derive(Clone, Debug)]
pub enum IoVec {
    Pipe { offset: usize, len: usize },
    Bytes { data: Bytes, offset: usize },
}

impl IoVec {
    fn remaining(&self) -> usize {
        match self {
            IoVec::Pipe { len, .. } => *len,
            IoVec::Bytes { data, offset } => data.len() - offset,
        }
    }

    fn advance(&mut self, amt: usize) {
        match self {
            IoVec::Pipe { offset, len } => {
                *offset += amt;
                *len -= amt;
            }
            IoVec::Bytes { offset, .. } => {
                *offset += amt;
            }
        }
    }

    fn is_pipe(&self) -> bool {
        matches!(self, IoVec::Pipe { .. })
    }
}

#[derive(Default)]
pub struct MsgHdr {
    iovs: VecDeque<IoVec>,
}

impl MsgHdr {
    fn remaining(&self) -> usize {
        self.iovs.iter().map(|iov| iov.remaining()).sum()
    }

    fn is_empty(&self) -> bool {
        self.iovs.is_empty()
    }
}

/// Where a response should be materialized.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ResponseDest {
    /// Straight into the write pipe and io-vector list.
    Direct,
    /// Into the cookie's dynamic buffer, to be drained in arrival order.
    Buffered,
}

/// The value portion of a response.
pub enum ResponseValue<'a> {
    None,
    Slice(&'a [u8]),
    Bytes(Bytes),
}

/// An accepted stream on its way from the listener to a worker.
pub struct ConnectionInit {
    pub stream: Stream,
    pub port_conns: Arc<AtomicI64>,
}

pub struct Connection {
    stream: Stream,
    token: Token,
    id: u64,
    peer: String,
    description: String,
    socket_closed: bool,
    registered: bool,

    state: State,
    write_and_go: State,

    pub(crate) read: Option<Pipe>,
    pub(crate) write: Option<Pipe>,

    // slot 0 is the inline cookie; higher slots hold detached commands
    cookies: Vec<Option<Cookie>>,
    arrival_seq: u64,
    next_response_seq: u64,

    // negotiated features
    xerror: bool,
    collections: bool,
    duplex: bool,
    cccp: bool,
    mutation_extras: bool,
    tracing_negotiated: bool,
    unordered_execution: bool,
    datatypes: DatatypeSet,

    // change-feed channel flags
    dcp: bool,
    dcp_xattr_aware: bool,
    dcp_no_value: bool,
    dcp_collection_aware: bool,
    dcp_delete_time: bool,

    authenticated: bool,
    username: String,
    privilege_context: PrivilegeContext,

    bucket_index: usize,
    engine: Option<Arc<dyn Engine>>,

    refcount: u8,
    num_events: i64,
    base_reqs_per_event: usize,
    priority: Priority,

    read_event: bool,
    write_event: bool,

    msglist: Vec<MsgHdr>,
    msgcurr: usize,
    reserved_items: Vec<ItemHandle>,

    server_events: VecDeque<ServerEvent>,
    disconnect_propagated: bool,

    total_sched_time: Duration,
    min_sched_time: Duration,
    max_sched_time: Duration,

    agent_name: String,
    connection_id: String,
    trace: Arc<AtomicBool>,
    start: Option<Instant>,

    port_conns: Arc<AtomicI64>,
    port_decremented: bool,
}

impl Connection {
    pub fn new(
        init: ConnectionInit,
        id: u64,
        trace: Arc<AtomicBool>,
        engine: Arc<dyn Engine>,
        base_reqs_per_event: usize,
    ) -> Self {
        let peer = init
            .stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let description = format!("[ {} ]", peer);

        Self {
            stream: init.stream,
            token: Token(0),
            id,
            peer,
            description,
            socket_closed: false,
            registered: false,
            state: State::NewCmd,
            write_and_go: State::NewCmd,
            read: None,
            write: None,
            cookies: vec![Some(Cookie::new())],
            arrival_seq: 0,
            next_response_seq: 0,
            xerror: false,
            collections: false,
            duplex: false,
            cccp: false,
            mutation_extras: false,
            tracing_negotiated: false,
            unordered_execution: false,
            datatypes: DatatypeSet::new(),
            dcp: false,
            dcp_xattr_aware: false,
            dcp_no_value: false,
            dcp_collection_aware: false,
            dcp_delete_time: false,
            authenticated: false,
            username: "unknown".to_string(),
            privilege_context: PrivilegeContext::empty(),
            bucket_index: 0,
            engine: Some(engine),
            refcount: 1,
            num_events: 0,
            base_reqs_per_event,
            priority: Priority::Medium,
            read_event: false,
            write_event: false,
            msglist: Vec::new(),
            msgcurr: 0,
            reserved_items: Vec::new(),
            server_events: VecDeque::new(),
            disconnect_propagated: false,
            total_sched_time: Duration::ZERO,
            min_sched_time: Duration::MAX,
            max_sched_time: Duration::ZERO,
            agent_name: String::new(),
            connection_id: String::new(),
            trace,
            start: None,
            port_conns: init.port_conns,
            port_decremented: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn set_token(&mut self, token: Token) {
        self.token = token;
    }

    // ------------------------------------------------------------------
    // state

    pub fn state(&self) -> State {
        self.state
    }

    /// Move to the next state. DCP connections redirect `Waiting` into the
    /// full-duplex ship state, and reset their command timer when they go
    /// back to reading.
    pub fn set_state(&mut self, next: State) {
        let mut next = next;
        if next == self.state {
            return;
        }

        if self.dcp {
            if next == State::Waiting {
                self.write_event = true;
                next = State::ShipLog;
            }
            if next == State::ReadHeader {
                self.start = None;
            }
        }

        if next == State::Closing {
            trace!("{}: going from {:?} to {:?}", self.id, self.state, next);
        }

        if next == State::ShipLog {
            self.start = Some(Instant::now());
        }

        self.state = next;
    }

    pub fn write_and_go(&self) -> State {
        self.write_and_go
    }

    pub fn set_write_and_go(&mut self, state: State) {
        self.write_and_go = state;
    }

    pub fn is_idle(&self) -> bool {
        matches!(
            self.state,
            State::NewCmd | State::Waiting | State::ReadHeader
        )
    }

    /// Initiate shutdown if the connection is idle. Used by bucket deletion
    /// to evict clients.
    pub fn signal_if_idle(&mut self) -> bool {
        if self.is_idle() {
            self.set_state(State::Closing);
            true
        } else {
            false
        }
    }

    pub fn is_socket_closed(&self) -> bool {
        self.socket_closed
    }

    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    pub fn close_socket(&mut self) {
        if !self.socket_closed {
            let _ = self.stream.shutdown();
            self.socket_closed = true;
            metrics::increment_counter!(&Stat::ConnClose);
        }
    }

    pub fn start(&self) -> Option<Instant> {
        self.start
    }

    pub fn set_start(&mut self, start: Option<Instant>) {
        self.start = start;
    }

    // ------------------------------------------------------------------
    // reactor registration

    pub fn register(&mut self, registry: &Registry, token: Token) -> std::io::Result<()> {
        self.token = token;
        self.stream
            .register(registry, token, Interest::READABLE)
            .map(|_| {
                self.registered = true;
            })
    }

    /// Update the interest set. Returns false if the registration failed,
    /// in which case the caller must close the connection.
    pub fn update_event(&mut self, registry: &Registry, interest: Interest) -> bool {
        if self.socket_closed {
            return false;
        }
        if !self.registered {
            let result = self.stream.register(registry, self.token, interest);
            self.registered = result.is_ok();
            return result.is_ok();
        }
        self.stream.reregister(registry, self.token, interest).is_ok()
    }

    pub fn unregister_event(&mut self, registry: &Registry) {
        if self.registered {
            let _ = self.stream.deregister(registry);
            self.registered = false;
        }
    }

    pub fn set_current_event(&mut self, readable: bool, writable: bool) {
        self.read_event = readable;
        self.write_event = writable;
    }

    pub fn is_read_event(&self) -> bool {
        self.read_event
    }

    pub fn is_write_event(&self) -> bool {
        self.write_event
    }

    // ------------------------------------------------------------------
    // command yielding

    pub fn max_reqs_per_event(&self) -> usize {
        match self.priority {
            Priority::High => self.base_reqs_per_event * 10,
            Priority::Medium => self.base_reqs_per_event,
            Priority::Low => (self.base_reqs_per_event / 4).max(1),
        }
    }

    pub fn reset_num_events(&mut self) {
        self.num_events = self.max_reqs_per_event() as i64;
    }

    pub fn decrement_num_events(&mut self) -> i64 {
        self.num_events -= 1;
        self.num_events
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    // ------------------------------------------------------------------
    // negotiated features

    pub fn is_xerror_support(&self) -> bool {
        self.xerror
    }

    pub fn set_xerror_support(&mut self, enabled: bool) {
        self.xerror = enabled;
    }

    pub fn is_collections_supported(&self) -> bool {
        self.collections
    }

    pub fn set_collections_supported(&mut self, enabled: bool) {
        self.collections = enabled;
    }

    pub fn is_duplex_supported(&self) -> bool {
        self.duplex
    }

    pub fn set_duplex_supported(&mut self, enabled: bool) {
        self.duplex = enabled;
    }

    pub fn is_clustermap_notification_supported(&self) -> bool {
        self.cccp
    }

    pub fn set_clustermap_notification_supported(&mut self, enabled: bool) {
        self.cccp = enabled;
    }

    pub fn supports_mutation_extras(&self) -> bool {
        self.mutation_extras
    }

    pub fn set_supports_mutation_extras(&mut self, enabled: bool) {
        self.mutation_extras = enabled;
    }

    pub fn is_tracing_negotiated(&self) -> bool {
        self.tracing_negotiated
    }

    pub fn set_tracing_negotiated(&mut self, enabled: bool) {
        self.tracing_negotiated = enabled;
    }

    pub fn allow_unordered_execution(&self) -> bool {
        self.unordered_execution
    }

    pub fn set_allow_unordered_execution(&mut self, enabled: bool) {
        self.unordered_execution = enabled;
    }

    pub fn datatypes(&self) -> &DatatypeSet {
        &self.datatypes
    }

    pub fn enable_datatype(&mut self, feature: Feature) {
        self.datatypes.enable(feature);
    }

    pub fn doc_namespace(&self) -> engine::DocNamespace {
        if self.collections {
            engine::DocNamespace::Collections
        } else {
            engine::DocNamespace::DefaultCollection
        }
    }

    // ------------------------------------------------------------------
    // change-feed channel flags

    pub fn is_dcp(&self) -> bool {
        self.dcp
    }

    pub fn set_dcp(&mut self, dcp: bool) {
        self.dcp = dcp;
    }

    pub fn is_dcp_xattr_aware(&self) -> bool {
        self.dcp_xattr_aware
    }

    pub fn set_dcp_xattr_aware(&mut self, enabled: bool) {
        self.dcp_xattr_aware = enabled;
    }

    pub fn is_dcp_no_value(&self) -> bool {
        self.dcp_no_value
    }

    pub fn set_dcp_no_value(&mut self, enabled: bool) {
        self.dcp_no_value = enabled;
    }

    pub fn is_dcp_collection_aware(&self) -> bool {
        self.dcp_collection_aware
    }

    pub fn set_dcp_collection_aware(&mut self, enabled: bool) {
        self.dcp_collection_aware = enabled;
    }

    pub fn is_dcp_delete_time_enabled(&self) -> bool {
        self.dcp_delete_time
    }

    pub fn set_dcp_delete_time_enabled(&mut self, enabled: bool) {
        self.dcp_delete_time = enabled;
    }

    // ------------------------------------------------------------------
    // identity

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn set_authenticated(
        &mut self,
        authenticated: bool,
        username: &str,
        context: PrivilegeContext,
    ) {
        self.authenticated = authenticated;
        self.username = username.to_string();
        self.privilege_context = context;
        self.description = format!("[ {} - {} ]", self.peer, self.username);
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn privilege_context(&self) -> &PrivilegeContext {
        &self.privilege_context
    }

    pub fn set_privilege_context(&mut self, context: PrivilegeContext) {
        self.privilege_context = context;
    }

    pub fn set_agent_name(&mut self, name: &[u8]) {
        let name = String::from_utf8_lossy(name);
        self.agent_name = name.chars().take(MAX_AGENT_NAME).collect();
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn set_connection_id(&mut self, id: &[u8]) {
        let id = String::from_utf8_lossy(id);
        self.connection_id = id.chars().take(MAX_CONNECTION_ID).collect();
    }

    pub fn connection_id_string(&self) -> &str {
        &self.connection_id
    }

    pub fn is_trace_enabled(&self) -> bool {
        self.trace.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // bucket selection

    pub fn bucket_index(&self) -> usize {
        self.bucket_index
    }

    /// Select a bucket. Index and engine handle change together, so command
    /// dispatch on this connection never sees a torn pair.
    pub fn set_bucket(&mut self, index: usize, engine: Arc<dyn Engine>) {
        self.bucket_index = index;
        self.engine = Some(engine);
    }

    pub fn bucket_engine(&self) -> Option<&Arc<dyn Engine>> {
        self.engine.as_ref()
    }

    pub fn dissociate_bucket(&mut self) {
        self.engine = None;
    }

    // ------------------------------------------------------------------
    // reference counting

    pub fn refcount(&self) -> u8 {
        self.refcount
    }

    pub fn increment_refcount(&mut self) {
        self.refcount += 1;
    }

    pub fn decrement_refcount(&mut self) {
        debug_assert!(self.refcount > 0);
        self.refcount -= 1;
    }

    // ------------------------------------------------------------------
    // cookies

    pub fn cookie(&self, slot: usize) -> &Cookie {
        self.cookies[slot].as_ref().expect("empty cookie slot")
    }

    pub fn cookie_mut(&mut self, slot: usize) -> &mut Cookie {
        self.cookies[slot].as_mut().expect("empty cookie slot")
    }

    pub fn number_of_cookies(&self) -> usize {
        self.cookies.iter().filter(|c| c.is_some()).count()
    }

    pub fn next_arrival_seq(&mut self) -> u64 {
        let seq = self.arrival_seq;
        self.arrival_seq += 1;
        seq
    }

    /// Whether any detached commands exist (outstanding or awaiting drain).
    pub fn has_detached_cookies(&self) -> bool {
        self.cookies.iter().skip(1).any(|c| c.is_some())
    }

    pub fn detached_capacity_left(&self) -> bool {
        self.cookies.iter().skip(1).filter(|c| c.is_some()).count() < MAX_INFLIGHT_COMMANDS
    }

    /// Move the inline cookie into a free detached slot, leaving a fresh
    /// inline cookie behind. Returns the slot.
    pub fn detach_inline_cookie(&mut self) -> usize {
        let cookie = self.cookies[0].take().expect("inline cookie missing");
        self.cookies[0] = Some(Cookie::new());

        for slot in 1..self.cookies.len() {
            if self.cookies[slot].is_none() {
                self.cookies[slot] = Some(cookie);
                return slot;
            }
        }
        self.cookies.push(Some(cookie));
        self.cookies.len() - 1
    }

    pub fn free_slot(&mut self, slot: usize) {
        debug_assert!(slot != 0);
        self.cookies[slot] = None;
    }

    pub fn slot_occupied(&self, slot: usize) -> bool {
        slot < self.cookies.len() && self.cookies[slot].is_some()
    }

    /// The request bytes for the given slot: detached slots carry their own
    /// copy, the inline slot views the front of the read pipe.
    pub fn packet(&self, slot: usize) -> &[u8] {
        let cookie = self.cookie(slot);
        if let Some(packet) = cookie.detached_packet() {
            return packet;
        }
        let total = cookie.header().total_len();
        let read = self.read.as_ref().expect("read pipe missing");
        &read.rdata()[0..total]
    }

    /// The opaque id the engine sees for the command in `slot`. The low
    /// bits carry the command's arrival serial rather than its slot, so the
    /// id stays valid when an unordered command is detached into a
    /// different slot while the engine holds it.
    pub fn cookie_id(&self, slot: usize) -> engine::CookieId {
        ((self.token.0 as u64) << 16) | (self.cookie(slot).seq() & 0xffff)
    }

    /// Find the slot currently holding the command with the given serial.
    pub fn find_slot_by_serial(&self, serial: u64) -> Option<usize> {
        self.cookies.iter().position(|cookie| {
            cookie
                .as_ref()
                .map(|c| c.has_request() && c.seq() & 0xffff == serial)
                .unwrap_or(false)
        })
    }

    // ------------------------------------------------------------------
    // read path

    pub fn have_pending_input_data(&self) -> bool {
        self.read.as_ref().map(|p| !p.is_empty()).unwrap_or(false)
    }

    /// Whether the next frame is completely buffered in the read pipe.
    pub fn is_packet_available(&self) -> bool {
        let read = match self.read.as_ref() {
            Some(pipe) => pipe,
            None => return false,
        };
        match RequestHeader::parse(read.rdata()) {
            Ok(header) => read.rsize() >= header.total_len(),
            Err(_) => false,
        }
    }

    pub fn read_buffered(&self) -> usize {
        self.read.as_ref().map(|p| p.rsize()).unwrap_or(0)
    }

    /// Read from the socket into the read pipe until the kernel would
    /// block. Readability is edge-triggered, so the pending read event is
    /// considered consumed whatever the outcome.
    pub fn try_read_network(&mut self) -> TryReadResult {
        self.read_event = false;

        if self.read.is_none() {
            return TryReadResult::MemoryError;
        }

        let mut total = 0;

        loop {
            let read = self.read.as_mut().expect("read pipe missing");
            if read.wsize() < BUFFER_MIN_FREE {
                read.reserve(TARGET_READ_SIZE);
            }

            let chunk = read.wdata();
            let chunk_len = chunk.len();
            match self.stream.read(chunk) {
                Ok(0) => {
                    return TryReadResult::SocketClosed;
                }
                Ok(n) => {
                    read.produced(n);
                    total += n;
                    metrics::increment_counter_by!(&Stat::TcpRecvByte, n as u64);
                    if n < chunk_len {
                        return TryReadResult::DataReceived;
                    }
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => {
                        return if total > 0 {
                            TryReadResult::DataReceived
                        } else {
                            TryReadResult::NoDataReceived
                        };
                    }
                    ErrorKind::Interrupted => {}
                    _ => {
                        return TryReadResult::SocketError;
                    }
                },
            }
        }
    }

    /// Shrink oversized pipes. Only called between commands, when no
    /// io-vector entries reference the write pipe.
    pub fn shrink_buffers(&mut self) {
        debug_assert!(self.msglist.iter().all(|m| m.is_empty()));
        if let Some(read) = self.read.as_mut() {
            read.shrink();
        }
        if let Some(write) = self.write.as_mut() {
            write.shrink();
        }
    }

    // ------------------------------------------------------------------
    // send path

    /// Append a message header. `reset` discards all previous headers and
    /// entries, which is only legal between transmissions.
    pub fn add_msg_hdr(&mut self, reset: bool) {
        if reset {
            self.msglist.clear();
            self.msgcurr = 0;
        }
        self.msglist.push(MsgHdr::default());
    }

    fn ensure_msghdr(&mut self) {
        let needs_new = match self.msglist.last() {
            Some(hdr) => hdr.iovs.len() >= IOV_MAX,
            None => true,
        };
        if needs_new {
            self.add_msg_hdr(false);
        }
    }

    /// Append an io-vector entry to the current message header, coalescing
    /// adjacent write-pipe ranges.
    pub fn add_iov(&mut self, entry: IoVec) {
        if entry.remaining() == 0 {
            return;
        }
        self.ensure_msghdr();
        let hdr = self.msglist.last_mut().expect("no message header");

        if let (Some(IoVec::Pipe { offset, len }), IoVec::Pipe { offset: new_offset, len: new_len }) =
            (hdr.iovs.back_mut(), &entry)
        {
            if *offset + *len == *new_offset {
                *len += *new_len;
                return;
            }
        }

        hdr.iovs.push_back(entry);
    }

    /// Copy bytes into the write pipe and reference them from the current
    /// message header.
    pub fn put_iov(&mut self, bytes: &[u8]) {
        let write = self.write.as_mut().expect("write pipe missing");
        let offset = write.write_offset();
        use buffer::BufMut;
        write.put_slice(bytes);
        self.add_iov(IoVec::Pipe {
            offset,
            len: bytes.len(),
        });
    }

    /// Reference refcounted bytes (an engine value) without copying.
    pub fn put_bytes_iov(&mut self, data: Bytes) {
        self.add_iov(IoVec::Bytes { data, offset: 0 });
    }

    pub fn has_pending_output(&self) -> bool {
        self.msglist[self.msgcurr..].iter().any(|m| !m.is_empty())
    }

    /// Trim the current message header by the byte count the kernel
    /// accepted. Fully consumed entries are dropped, the next entry is
    /// advanced in place, and the number of write-pipe bytes consumed is
    /// returned so the pipe's read cursor can be moved by the same amount.
    fn adjust_msghdr(hdr: &mut MsgHdr, mut nbytes: usize) -> usize {
        let mut pipe_consumed = 0;
        while nbytes > 0 {
            let front = match hdr.iovs.front_mut() {
                Some(iov) => iov,
                None => break,
            };
            let remaining = front.remaining();
            if nbytes >= remaining {
                if front.is_pipe() {
                    pipe_consumed += remaining;
                }
                nbytes -= remaining;
                hdr.iovs.pop_front();
            } else {
                if front.is_pipe() {
                    pipe_consumed += nbytes;
                }
                front.advance(nbytes);
                nbytes = 0;
            }
        }
        pipe_consumed
    }

    /// Transmit the next chunk of data from the message list. One scatter
    /// write per call; the caller re-enters until `Complete`.
    pub fn transmit(&mut self) -> TransmitResult {
        loop {
            while self.msgcurr < self.msglist.len() && self.msglist[self.msgcurr].is_empty() {
                self.msgcurr += 1;
            }
            if self.msgcurr == self.msglist.len() {
                self.msglist.clear();
                self.msgcurr = 0;
                return TransmitResult::Complete;
            }

            let write = self.write.as_ref().expect("write pipe missing");
            let hdr = &self.msglist[self.msgcurr];
            let total = hdr.remaining();

            let mut slices: Vec<IoSlice> = Vec::with_capacity(hdr.iovs.len());
            for iov in &hdr.iovs {
                match iov {
                    IoVec::Pipe { offset, len } => {
                        slices.push(IoSlice::new(write.range(*offset, *len)));
                    }
                    IoVec::Bytes { data, offset } => {
                        slices.push(IoSlice::new(&data[*offset..]));
                    }
                }
            }

            let result = self.stream.write_vectored(&slices);
            drop(slices);

            match result {
                Ok(0) => {
                    return TransmitResult::HardError;
                }
                Ok(n) => {
                    metrics::increment_counter_by!(&Stat::TcpSendByte, n as u64);
                    if n < total {
                        metrics::increment_counter!(&Stat::TcpSendPartial);
                    }
                    let pipe_consumed = Self::adjust_msghdr(&mut self.msglist[self.msgcurr], n);
                    if pipe_consumed > 0 {
                        self.write
                            .as_mut()
                            .expect("write pipe missing")
                            .consumed(pipe_consumed);
                    }
                    if self.msglist[self.msgcurr].is_empty() {
                        self.msgcurr += 1;
                    }
                    return TransmitResult::Incomplete;
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => {
                        // the write readiness edge is spent
                        self.write_event = false;
                        return TransmitResult::SoftError;
                    }
                    ErrorKind::Interrupted => {}
                    _ => {
                        return TransmitResult::HardError;
                    }
                },
            }
        }
    }

    // ------------------------------------------------------------------
    // reserved items

    /// Keep an engine item alive until the in-flight response has been
    /// transmitted.
    pub fn reserve_item(&mut self, item: ItemHandle) {
        metrics::increment_counter!(&Stat::ReservedItem);
        self.reserved_items.push(item);
    }

    /// Release every reserved item back to the engine.
    pub fn release_reserved_items(&mut self) {
        if self.reserved_items.is_empty() {
            return;
        }
        if let Some(engine) = self.engine.as_ref() {
            for item in self.reserved_items.drain(..) {
                metrics::increment_counter!(&Stat::ReleasedItem);
                engine.item_release(item);
            }
        } else {
            // bucket already dissociated; handles can only be dropped
            self.reserved_items.clear();
        }
    }

    /// Drop scratch send state which is not engine-owned: message headers
    /// release their refcounted values when cleared.
    pub fn release_temp_alloc(&mut self) {
        self.msglist.clear();
        self.msgcurr = 0;
    }

    // ------------------------------------------------------------------
    // server events

    pub fn enqueue_server_event(&mut self, event: ServerEvent) {
        self.server_events.push_back(event);
    }

    pub(crate) fn pop_server_event(&mut self) -> Option<ServerEvent> {
        self.server_events.pop_front()
    }

    pub fn has_server_events(&self) -> bool {
        !self.server_events.is_empty()
    }

    pub fn disconnect_propagated(&mut self) -> bool {
        let was = self.disconnect_propagated;
        self.disconnect_propagated = true;
        was
    }

    // ------------------------------------------------------------------
    // scheduling accounting

    pub fn add_sched_time(&mut self, elapsed: Duration) {
        self.total_sched_time += elapsed;
        self.min_sched_time = self.min_sched_time.min(elapsed);
        self.max_sched_time = self.max_sched_time.max(elapsed);
    }

    pub fn total_sched_time(&self) -> Duration {
        self.total_sched_time
    }

    // ------------------------------------------------------------------
    // listening-port accounting

    /// Drop this connection from its listening port's connection count.
    /// Idempotent; called once during final teardown.
    pub fn drop_port_count(&mut self) {
        if !self.port_decremented {
            self.port_conns.fetch_sub(1, Ordering::Relaxed);
            self.port_decremented = true;
        }
    }

    // ------------------------------------------------------------------
    // responses

    fn response_dest(&self, slot: usize) -> ResponseDest {
        if slot != 0 || self.has_detached_cookies() {
            ResponseDest::Buffered
        } else {
            ResponseDest::Direct
        }
    }

    /// Advance arrival-order accounting for a command which produces no
    /// response bytes (quiet variants).
    pub fn suppress_response(&mut self, slot: usize) {
        match self.response_dest(slot) {
            ResponseDest::Direct => {
                self.next_response_seq = self.cookie(slot).seq() + 1;
            }
            ResponseDest::Buffered => {
                self.cookie_mut(slot).set_response_ready();
            }
        }
    }

    /// Remap an engine status for this connection. Statuses which need the
    /// extended-error feature are downgraded when the client did not
    /// negotiate it.
    pub fn remap_error_code(&self, code: engine::ErrorCode) -> engine::ErrorCode {
        use engine::ErrorCode;

        if self.xerror || !code.requires_xerror() {
            return code;
        }
        match code {
            ErrorCode::Locked => ErrorCode::KeyExists,
            ErrorCode::AuthStale | ErrorCode::Eaccess | ErrorCode::NoBucket => {
                ErrorCode::Disconnect
            }
            other => other,
        }
    }

    /// Write a complete response for the command in `slot`. Directs it to
    /// the wire for the common case, or stages it in the cookie for
    /// arrival-order serialization when detached commands are in flight.
    pub fn send_response(
        &mut self,
        slot: usize,
        status: Status,
        extras: &[u8],
        key: &[u8],
        value: ResponseValue,
        datatype: Datatype,
    ) {
        let header = *self.cookie(slot).header();

        // on error the payload is replaced by the error envelope; a
        // not-my-vbucket response carries status only so the client can go
        // consult its cluster map
        let error_json;
        let (extras, key, value, datatype) = if status.is_success() {
            let datatype = self.datatypes.intersection(datatype);
            (extras, key, value, datatype)
        } else if status == Status::NotMyVbucket {
            (&[][..], &[][..], ResponseValue::None, Datatype::RAW)
        } else {
            error_json = self.cookie(slot).error_json();
            match (&error_json, self.xerror) {
                (Some(json), true) => {
                    let value = Bytes::copy_from_slice(json.as_bytes());
                    let datatype = self.datatypes.intersection(Datatype::JSON);
                    (&[][..], &[][..], ResponseValue::Bytes(value), datatype)
                }
                _ => (&[][..], &[][..], ResponseValue::None, Datatype::RAW),
            }
        };

        let cas = if status.is_success() {
            self.cookie(slot).cas()
        } else {
            0
        };

        let value_len = match &value {
            ResponseValue::None => 0,
            ResponseValue::Slice(v) => v.len(),
            ResponseValue::Bytes(v) => v.len(),
        };

        let response = ResponseHeader {
            magic: Magic::ClientResponse,
            opcode: header.opcode,
            keylen: key.len() as u16,
            extlen: extras.len() as u8,
            datatype: datatype.bits(),
            status,
            bodylen: (extras.len() + key.len() + value_len) as u32,
            opaque: header.opaque,
            cas,
        };

        match self.response_dest(slot) {
            ResponseDest::Direct => {
                let mut composed = [0u8; HEADER_LEN];
                response.compose(&mut &mut composed[..]);

                self.add_msg_hdr(false);
                self.put_iov(&composed);
                if !extras.is_empty() {
                    self.put_iov(extras);
                }
                if !key.is_empty() {
                    self.put_iov(key);
                }
                match value {
                    ResponseValue::None => {}
                    ResponseValue::Slice(v) => self.put_iov(v),
                    ResponseValue::Bytes(v) => self.put_bytes_iov(v),
                }

                self.next_response_seq = self.cookie(slot).seq() + 1;
                self.set_state(State::SendData);
                self.set_write_and_go(State::NewCmd);
            }
            ResponseDest::Buffered => {
                let cookie = self.cookie_mut(slot);
                let buffer = cookie.dynamic_buffer();
                response.compose(buffer);
                buffer.extend_from_slice(extras);
                buffer.extend_from_slice(key);
                match value {
                    ResponseValue::None => {}
                    ResponseValue::Slice(v) => buffer.extend_from_slice(v),
                    ResponseValue::Bytes(v) => buffer.extend_from_slice(&v),
                }
                cookie.set_response_ready();
            }
        }
    }

    pub fn send_status(&mut self, slot: usize, status: Status) {
        self.send_response(slot, status, &[], &[], ResponseValue::None, Datatype::RAW);
    }

    /// Push the cookie's dynamically built response (already complete
    /// frames) into the send path.
    pub fn send_dynamic_buffer(&mut self, slot: usize) {
        match self.response_dest(slot) {
            ResponseDest::Direct => {
                let buffer = self.cookie_mut(slot).take_dynamic_buffer();
                if buffer.is_empty() {
                    panic!("send_dynamic_buffer: dynamic buffer not created");
                }
                self.add_msg_hdr(false);
                self.put_bytes_iov(Bytes::from(buffer));
                self.next_response_seq = self.cookie(slot).seq() + 1;
                self.set_state(State::SendData);
                self.set_write_and_go(State::NewCmd);
            }
            ResponseDest::Buffered => {
                self.cookie_mut(slot).set_response_ready();
            }
        }
    }

    /// Append ready detached responses in arrival order to the send path.
    /// Returns true if anything was staged for transmission.
    pub fn drain_ordered_responses(&mut self) -> bool {
        let mut drained = false;
        loop {
            let mut advanced = false;
            for slot in 1..self.cookies.len() {
                let ready = match &self.cookies[slot] {
                    Some(cookie) => {
                        cookie.has_request()
                            && cookie.seq() == self.next_response_seq
                            && cookie.response_ready()
                    }
                    None => false,
                };
                if ready {
                    let buffer = self.cookie_mut(slot).take_dynamic_buffer();
                    if !buffer.is_empty() {
                        self.add_msg_hdr(false);
                        self.put_bytes_iov(Bytes::from(buffer));
                        drained = true;
                    }
                    self.free_slot(slot);
                    self.next_response_seq += 1;
                    advanced = true;
                    break;
                }
            }
            if !advanced {
                break;
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_hdr(entries: &[(usize, usize)]) -> MsgHdr {
        let mut hdr = MsgHdr::default();
        for (offset, len) in entries {
            hdr.iovs.push_back(IoVec::Pipe {
                offset: *offset,
                len: *len,
            });
        }
        hdr
    }

    fn flatten(hdr: &MsgHdr) -> Vec<(usize, usize)> {
        hdr.iovs
            .iter()
            .map(|iov| match iov {
                IoVec::Pipe { offset, len } => (*offset, *len),
                IoVec::Bytes { .. } => panic!("unexpected bytes entry"),
            })
            .collect()
    }

    #[test]
    fn adjust_consumes_prefix() {
        // for any k, the adjusted io-vector equals the original with its
        // first k bytes removed
        let entries = [(0usize, 10usize), (10, 5), (20, 7)];
        let total: usize = entries.iter().map(|(_, len)| len).sum();

        for k in 0..=total {
            let mut hdr = pipe_hdr(&entries);
            let consumed = Connection::adjust_msghdr(&mut hdr, k);
            assert_eq!(consumed, k, "pipe bytes consumed must equal k");
            assert_eq!(hdr.remaining(), total - k);

            // remaining entries must describe exactly the suffix
            let mut expected = Vec::new();
            let mut skip = k;
            for (offset, len) in entries {
                if skip >= len {
                    skip -= len;
                } else {
                    expected.push((offset + skip, len - skip));
                    skip = 0;
                }
            }
            assert_eq!(flatten(&hdr), expected);
        }
    }

    #[test]
    fn adjust_mixed_entries_counts_only_pipe_bytes() {
        let mut hdr = MsgHdr::default();
        hdr.iovs.push_back(IoVec::Pipe { offset: 0, len: 4 });
        hdr.iovs.push_back(IoVec::Bytes {
            data: Bytes::from_static(b"valuebytes"),
            offset: 0,
        });
        hdr.iovs.push_back(IoVec::Pipe { offset: 4, len: 4 });

        // consume the first pipe entry, all of the bytes entry, and half of
        // the trailing pipe entry
        let consumed = Connection::adjust_msghdr(&mut hdr, 4 + 10 + 2);
        assert_eq!(consumed, 6);
        assert_eq!(hdr.remaining(), 2);
        match hdr.iovs.front().unwrap() {
            IoVec::Pipe { offset, len } => {
                assert_eq!((*offset, *len), (6, 2));
            }
            _ => panic!("expected pipe entry"),
        }
    }
}
