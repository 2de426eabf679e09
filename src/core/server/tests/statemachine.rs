// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Drives a single connection through the state machine over a real
//! loopback socket, with scripted engines standing in for storage.

use server::{
    run_event_loop, Bucket, BufferPool, Connection, ConnectionInit, ConnectionRegistry, State,
    WorkerCtx,
};

use bytes::Bytes;
use engine::{
    CookieId, CookieRef, Dcp, DcpMessageProducers, DcpStep, DocKey, Engine, EngineResult,
    ErrorCode, ItemHandle, ItemInfo, MemoryEngine, MutationDescr, NotifyIoComplete,
    StoreOperation,
};
use net::{Poll, Stream, Token};
use protocol_mcbp::{
    DcpDeletion, Magic, Opcode, RequestHeader, ResponseHeader, Status, HEADER_LEN,
};

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ----------------------------------------------------------------------
// harness

struct TestNotify {
    notifications: Mutex<Vec<(CookieId, EngineResult<()>)>>,
}

impl TestNotify {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            notifications: Mutex::new(Vec::new()),
        })
    }
}

impl NotifyIoComplete for TestNotify {
    fn notify_io_complete(&self, cookie: CookieId, status: EngineResult<()>) {
        self.notifications.lock().unwrap().push((cookie, status));
    }
}

struct Harness {
    poll: Poll,
    pool: BufferPool,
    registry: ConnectionRegistry,
    notify: Arc<dyn NotifyIoComplete>,
    buckets: Vec<Bucket>,
    connection: Connection,
    client: std::net::TcpStream,
    port_conns: Arc<AtomicI64>,
}

impl Harness {
    fn new(engine: Arc<dyn Engine>) -> Self {
        Self::with_max_reqs(engine, 20)
    }

    fn with_pool(engine: Arc<dyn Engine>, pool: BufferPool) -> Self {
        let mut harness = Self::with_max_reqs(engine, 20);
        harness.pool = pool;
        harness
    }

    fn with_max_reqs(engine: Arc<dyn Engine>, max_reqs: usize) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind");
        let addr = listener.local_addr().expect("no local addr");
        let client = std::net::TcpStream::connect(addr).expect("failed to connect");
        client
            .set_read_timeout(Some(Duration::from_millis(2000)))
            .expect("failed to set read timeout");
        let (accepted, _) = listener.accept().expect("failed to accept");
        accepted
            .set_nonblocking(true)
            .expect("failed to set nonblocking");

        let poll = Poll::new().expect("failed to create poll");
        let registry = ConnectionRegistry::new();
        let (id, trace) = registry.register("127.0.0.1:0".to_string(), 0);
        let port_conns = Arc::new(AtomicI64::new(1));

        let init = ConnectionInit {
            stream: Stream::from(net::TcpStream::from_std(accepted)),
            port_conns: port_conns.clone(),
        };
        let mut connection = Connection::new(init, id, trace, engine.clone(), max_reqs);
        connection
            .register(poll.registry(), Token(1))
            .expect("failed to register");

        Self {
            poll,
            pool: BufferPool::new(16 * 1024),
            registry,
            notify: TestNotify::new(),
            buckets: vec![Bucket::new("default", engine)],
            connection,
            client,
            port_conns,
        }
    }

    fn run(&mut self, readable: bool, writable: bool) {
        let mut ctx = WorkerCtx {
            registry: self.poll.registry(),
            pool: &mut self.pool,
            notify: self.notify.clone(),
            buckets: &self.buckets,
            connections: &self.registry,
            worker_id: 0,
        };
        run_event_loop(&mut self.connection, &mut ctx, readable, writable);
    }

    fn read_response(&mut self) -> (ResponseHeader, Vec<u8>) {
        let mut header = [0u8; HEADER_LEN];
        self.client
            .read_exact(&mut header)
            .expect("failed to read response header");
        let header = ResponseHeader::parse(&header).expect("invalid response header");
        let mut body = vec![0u8; header.bodylen as usize];
        self.client
            .read_exact(&mut body)
            .expect("failed to read response body");
        (header, body)
    }
}

fn request(opcode: Opcode, extras: &[u8], key: &[u8], value: &[u8]) -> Vec<u8> {
    request_opaque(opcode, extras, key, value, 0xa5a5)
}

fn request_opaque(opcode: Opcode, extras: &[u8], key: &[u8], value: &[u8], opaque: u32) -> Vec<u8> {
    let header = RequestHeader {
        magic: Magic::ClientRequest,
        opcode: opcode as u8,
        keylen: key.len() as u16,
        extlen: extras.len() as u8,
        datatype: 0,
        vbucket: 0,
        bodylen: (extras.len() + key.len() + value.len()) as u32,
        opaque,
        cas: 0,
    };
    let mut buf = Vec::new();
    header.compose(&mut buf);
    buf.extend_from_slice(extras);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

fn seed(engine: &MemoryEngine, key: &[u8], value: &[u8], flags: u32) -> u64 {
    let notify: Arc<dyn NotifyIoComplete> = TestNotify::new();
    let cookie = CookieRef {
        id: 0,
        notify: &notify,
    };
    engine
        .store(
            &cookie,
            StoreOperation::Set,
            &DocKey::new(engine::DocNamespace::DefaultCollection, key),
            value,
            flags,
            0,
            0,
            0,
            0,
        )
        .expect("failed to seed engine")
        .cas
}

// ----------------------------------------------------------------------
// scripted engines

/// Delegates to a memory engine, but fails the first `blocks` mutations
/// with a would-block park, recording what is needed to complete them.
struct BlockingEngine {
    inner: MemoryEngine,
    blocks: AtomicUsize,
    parked: Mutex<Vec<(CookieId, Arc<dyn NotifyIoComplete>)>>,
}

impl BlockingEngine {
    fn new(blocks: usize) -> Self {
        Self {
            inner: MemoryEngine::new(),
            blocks: AtomicUsize::new(blocks),
            parked: Mutex::new(Vec::new()),
        }
    }

    fn complete_parked(&self) {
        for (cookie, notify) in self.parked.lock().unwrap().drain(..) {
            notify.notify_io_complete(cookie, Ok(()));
        }
    }
}

impl Engine for BlockingEngine {
    fn get(&self, cookie: &CookieRef, key: &DocKey, vbucket: u16) -> EngineResult<ItemHandle> {
        self.inner.get(cookie, key, vbucket)
    }

    fn get_locked(
        &self,
        cookie: &CookieRef,
        key: &DocKey,
        vbucket: u16,
        lock_timeout: u32,
    ) -> EngineResult<ItemHandle> {
        self.inner.get_locked(cookie, key, vbucket, lock_timeout)
    }

    fn unlock(
        &self,
        cookie: &CookieRef,
        key: &DocKey,
        vbucket: u16,
        cas: u64,
    ) -> EngineResult<()> {
        self.inner.unlock(cookie, key, vbucket, cas)
    }

    #[allow(clippy::too_many_arguments)]
    fn store(
        &self,
        cookie: &CookieRef,
        operation: StoreOperation,
        key: &DocKey,
        value: &[u8],
        flags: u32,
        exptime: u32,
        datatype: u8,
        cas: u64,
        vbucket: u16,
    ) -> EngineResult<MutationDescr> {
        if self
            .blocks
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .is_ok()
        {
            self.parked
                .lock()
                .unwrap()
                .push((cookie.id, cookie.notify.clone()));
            return Err(ErrorCode::WouldBlock);
        }
        self.inner.store(
            cookie, operation, key, value, flags, exptime, datatype, cas, vbucket,
        )
    }

    fn remove(
        &self,
        cookie: &CookieRef,
        key: &DocKey,
        vbucket: u16,
        cas: u64,
    ) -> EngineResult<MutationDescr> {
        self.inner.remove(cookie, key, vbucket, cas)
    }

    fn flush(&self, cookie: &CookieRef) -> EngineResult<()> {
        self.inner.flush(cookie)
    }

    fn get_item_info(&self, item: &ItemHandle) -> Option<ItemInfo> {
        self.inner.get_item_info(item)
    }

    fn item_release(&self, item: ItemHandle) {
        self.inner.item_release(item)
    }
}

/// A producer-only change feed which ships one collection-scoped deletion
/// and then idles.
struct ScriptedDcpEngine {
    handles: Mutex<HashMap<u64, ItemInfo>>,
    next_handle: AtomicU64,
    released: AtomicUsize,
    shipped: AtomicBool,
}

impl ScriptedDcpEngine {
    fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            released: AtomicUsize::new(0),
            shipped: AtomicBool::new(false),
        }
    }
}

impl Engine for ScriptedDcpEngine {
    fn get(&self, _: &CookieRef, _: &DocKey, _: u16) -> EngineResult<ItemHandle> {
        Err(ErrorCode::NotSupported)
    }

    fn get_locked(&self, _: &CookieRef, _: &DocKey, _: u16, _: u32) -> EngineResult<ItemHandle> {
        Err(ErrorCode::NotSupported)
    }

    fn unlock(&self, _: &CookieRef, _: &DocKey, _: u16, _: u64) -> EngineResult<()> {
        Err(ErrorCode::NotSupported)
    }

    #[allow(clippy::too_many_arguments)]
    fn store(
        &self,
        _: &CookieRef,
        _: StoreOperation,
        _: &DocKey,
        _: &[u8],
        _: u32,
        _: u32,
        _: u8,
        _: u64,
        _: u16,
    ) -> EngineResult<MutationDescr> {
        Err(ErrorCode::NotSupported)
    }

    fn remove(&self, _: &CookieRef, _: &DocKey, _: u16, _: u64) -> EngineResult<MutationDescr> {
        Err(ErrorCode::NotSupported)
    }

    fn flush(&self, _: &CookieRef) -> EngineResult<()> {
        Err(ErrorCode::NotSupported)
    }

    fn get_item_info(&self, item: &ItemHandle) -> Option<ItemInfo> {
        self.handles.lock().unwrap().get(&item.token()).cloned()
    }

    fn item_release(&self, item: ItemHandle) {
        self.released.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().unwrap().remove(&item.token());
    }

    fn dcp(&self) -> Option<&dyn Dcp> {
        Some(self)
    }
}

impl Dcp for ScriptedDcpEngine {
    fn open(&self, _: &CookieRef, _: u32, _: u32, _: u32, _: &[u8]) -> EngineResult<()> {
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn mutation(
        &self,
        _: &CookieRef,
        _: u32,
        _: &DocKey,
        _: &[u8],
        _: u8,
        _: u64,
        _: u16,
        _: u64,
        _: u64,
        _: &[u8],
    ) -> EngineResult<()> {
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn deletion(
        &self,
        _: &CookieRef,
        _: u32,
        _: &DocKey,
        _: &[u8],
        _: u8,
        _: u64,
        _: u16,
        _: u64,
        _: u64,
        _: &[u8],
    ) -> EngineResult<()> {
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn expiration(
        &self,
        _: &CookieRef,
        _: u32,
        _: &DocKey,
        _: u64,
        _: u16,
        _: u64,
        _: u64,
        _: &[u8],
    ) -> EngineResult<()> {
        Ok(())
    }

    fn stream_end(&self, _: &CookieRef, _: u32, _: u16, _: u32) -> EngineResult<()> {
        Ok(())
    }

    fn get_failover_log(&self, _: &CookieRef, _: u32, _: u16) -> EngineResult<Vec<(u64, u64)>> {
        Ok(vec![(0x1111, 0)])
    }

    fn buffer_acknowledgement(&self, _: &CookieRef, _: u32, _: u16, _: u32) -> EngineResult<()> {
        Ok(())
    }

    fn control(&self, _: &CookieRef, _: &[u8], _: &[u8]) -> EngineResult<()> {
        Ok(())
    }

    fn step(
        &self,
        _cookie: &CookieRef,
        producers: &mut dyn DcpMessageProducers,
    ) -> EngineResult<DcpStep> {
        if self.shipped.swap(true, Ordering::Relaxed) {
            return Ok(DcpStep::Idle);
        }

        let token = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().unwrap().insert(
            token,
            ItemInfo {
                key: Bytes::from_static(b"\x09user"),
                value: Bytes::new(),
                flags: 0,
                cas: 0xbeef,
                datatype: 0,
                exptime: 0,
                vbucket_uuid: 0,
                seqno: 42,
            },
        );
        producers.deletion(7, ItemHandle::new(token), 3, 42, 1, &[], 1)?;
        Ok(DcpStep::Continue)
    }
}

// ----------------------------------------------------------------------
// scenarios

#[test]
fn get_hit_round_trip() {
    let engine = Arc::new(MemoryEngine::new());
    let cas = seed(&engine, b"abc", b"xyz", 0x12345678);

    let mut harness = Harness::new(engine);
    harness
        .client
        .write_all(&request(Opcode::Get, &[], b"abc", &[]))
        .expect("failed to write");

    harness.run(true, false);

    let (header, body) = harness.read_response();
    assert_eq!(header.status, Status::Success);
    assert_eq!(header.extlen, 4);
    assert_eq!(header.cas, cas);
    assert_eq!(&body[0..4], &0x12345678u32.to_be_bytes());
    assert_eq!(&body[4..], b"xyz");
}

#[test]
fn framing_one_byte_at_a_time() {
    let engine = Arc::new(MemoryEngine::new());
    seed(&engine, b"abc", b"xyz", 0);

    let mut harness = Harness::new(engine);
    let frame = request(Opcode::Get, &[], b"abc", &[]);

    // feeding the stream byte by byte yields exactly one dispatched frame
    for byte in frame {
        harness.client.write_all(&[byte]).expect("failed to write");
        std::thread::sleep(Duration::from_millis(1));
        harness.run(true, false);
    }

    let (header, body) = harness.read_response();
    assert_eq!(header.status, Status::Success);
    assert_eq!(&body[4..], b"xyz");

    // and nothing more
    harness
        .client
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();
    let mut excess = [0u8; 1];
    assert!(harness.client.read_exact(&mut excess).is_err());
}

#[test]
fn get_miss_and_quiet_miss() {
    let engine = Arc::new(MemoryEngine::new());
    let mut harness = Harness::new(engine);

    // a quiet get swallows the miss, a plain get reports it
    let mut stream = request(Opcode::GetQ, &[], b"first", &[]);
    stream.extend_from_slice(&request(Opcode::Get, &[], b"second", &[]));
    harness.client.write_all(&stream).expect("failed to write");

    harness.run(true, false);

    let (header, _body) = harness.read_response();
    assert_eq!(header.status, Status::KeyEnoent);
    assert_eq!(header.opcode, Opcode::Get as u8);
}

#[test]
fn set_then_get() {
    let engine = Arc::new(MemoryEngine::new());
    let mut harness = Harness::new(engine);

    let mut extras = Vec::new();
    extras.extend_from_slice(&0x0102u32.to_be_bytes()); // flags
    extras.extend_from_slice(&0u32.to_be_bytes()); // exptime
    harness
        .client
        .write_all(&request(Opcode::Set, &extras, b"k", b"v"))
        .expect("failed to write");
    harness.run(true, false);

    let (header, _) = harness.read_response();
    assert_eq!(header.status, Status::Success);
    assert!(header.cas != 0);

    harness
        .client
        .write_all(&request(Opcode::Get, &[], b"k", &[]))
        .expect("failed to write");
    harness.run(true, false);

    let (header, body) = harness.read_response();
    assert_eq!(header.status, Status::Success);
    assert_eq!(&body[0..4], &0x0102u32.to_be_bytes());
    assert_eq!(&body[4..], b"v");
}

#[test]
fn ewouldblock_then_success() {
    let engine = Arc::new(BlockingEngine::new(1));
    let mut harness = Harness::new(engine.clone());

    let mut extras = Vec::new();
    extras.extend_from_slice(&0u32.to_be_bytes());
    extras.extend_from_slice(&0u32.to_be_bytes());
    harness
        .client
        .write_all(&request(Opcode::Set, &extras, b"k", b"v"))
        .expect("failed to write");

    harness.run(true, false);

    // the command is parked: no response, the engine holds a reference
    assert_eq!(harness.connection.state(), State::Execute);
    assert_eq!(harness.connection.refcount(), 2);
    assert_eq!(engine.parked.lock().unwrap().len(), 1);

    // the engine completes and notifies; replay the execute phase the way
    // the worker's pending-io drain would
    engine.complete_parked();
    harness.connection.decrement_refcount();
    harness.connection.cookie_mut(0).set_aiostat(Ok(()));
    harness.connection.cookie_mut(0).set_ewouldblock(false);
    harness.run(false, false);

    let (header, _) = harness.read_response();
    assert_eq!(header.status, Status::Success);
}

#[test]
fn yield_bound_between_reactor_callbacks() {
    let engine = Arc::new(MemoryEngine::new());
    let mut harness = Harness::with_max_reqs(engine, 2);

    // five pipelined commands, budget of two per timeslice
    let mut stream = Vec::new();
    for i in 0..5u32 {
        stream.extend_from_slice(&request_opaque(Opcode::Noop, &[], &[], &[], i));
    }
    harness.client.write_all(&stream).expect("failed to write");
    std::thread::sleep(Duration::from_millis(50));

    harness.run(true, false);

    // exactly two responses may be produced before the yield
    harness
        .client
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let mut received = Vec::new();
    let mut buf = [0u8; HEADER_LEN];
    while harness.client.read_exact(&mut buf).is_ok() {
        let header = ResponseHeader::parse(&buf).expect("invalid response");
        received.push(header.opaque);
    }
    assert_eq!(received, vec![0, 1]);

    // the next timeslices drain the rest
    harness.run(false, true);
    harness.run(false, true);
    let mut received = Vec::new();
    while harness.client.read_exact(&mut buf).is_ok() {
        let header = ResponseHeader::parse(&buf).expect("invalid response");
        received.push(header.opaque);
    }
    assert_eq!(received, vec![2, 3, 4]);
}

#[test]
fn pending_close_waits_for_refcount() {
    let engine = Arc::new(BlockingEngine::new(usize::MAX));
    let mut harness = Harness::new(engine);

    let mut extras = Vec::new();
    extras.extend_from_slice(&0u32.to_be_bytes());
    extras.extend_from_slice(&0u32.to_be_bytes());
    harness
        .client
        .write_all(&request(Opcode::Set, &extras, b"k", b"v"))
        .expect("failed to write");
    harness.run(true, false);
    assert_eq!(harness.connection.refcount(), 2);

    // the client goes away while the engine still holds the command
    harness.connection.set_state(State::Closing);
    harness.run(false, false);
    assert_eq!(harness.connection.state(), State::PendingClose);

    // spurious wakeups do not finalize the connection
    harness.run(false, false);
    assert_eq!(harness.connection.state(), State::PendingClose);

    // once the engine releases its reference the teardown completes
    harness.connection.decrement_refcount();
    harness.connection.cookie_mut(0).set_ewouldblock(false);
    harness.run(false, false);
    assert_eq!(harness.connection.state(), State::Destroyed);

    // the listening-port count dropped and the bucket was dissociated
    assert_eq!(harness.port_conns.load(Ordering::Relaxed), 0);
    assert!(harness.connection.bucket_engine().is_none());
}

#[test]
fn reserved_items_released_after_transmit() {
    let engine = Arc::new(MemoryEngine::new());
    seed(&engine, b"abc", b"xyz", 0);

    let mut harness = Harness::new(engine.clone());
    harness
        .client
        .write_all(&request(Opcode::Get, &[], b"abc", &[]))
        .expect("failed to write");
    harness.run(true, false);

    let (header, _) = harness.read_response();
    assert_eq!(header.status, Status::Success);

    // the engine item reserved for the response was returned
    assert_eq!(engine.outstanding_items(), 0);
}

#[test]
fn reserved_items_released_when_closing() {
    let engine = Arc::new(MemoryEngine::new());

    // a value far larger than the socket buffers, so the response cannot
    // finish transmitting while the client refuses to read
    let big = vec![0x5au8; 8 * 1024 * 1024];
    seed(&engine, b"big", &big, 0);

    let mut harness = Harness::new(engine.clone());
    harness
        .client
        .write_all(&request(Opcode::Get, &[], b"big", &[]))
        .expect("failed to write");
    harness.run(true, false);

    // mid-send, the engine item is still reserved
    assert_eq!(harness.connection.state(), State::SendData);
    assert_eq!(engine.outstanding_items(), 1);

    // a teardown mid-send must hand the item back
    harness.connection.set_state(State::Closing);
    harness.run(false, false);
    assert_eq!(harness.connection.state(), State::Destroyed);
    assert_eq!(engine.outstanding_items(), 0);
}

#[test]
fn error_envelope_requires_xerror() {
    // with the extended-error feature, the body carries the json envelope
    let engine = Arc::new(MemoryEngine::new());
    let mut harness = Harness::new(engine);
    harness.connection.set_xerror_support(true);

    // a store with a missing extras section is a protocol error
    harness
        .client
        .write_all(&request(Opcode::Set, &[], b"k", b"v"))
        .expect("failed to write");
    harness.run(true, false);

    let (header, body) = harness.read_response();
    assert_eq!(header.status, Status::Einval);
    let parsed: serde_json::Value = serde_json::from_slice(&body).expect("body is not json");
    assert!(parsed["error"]["context"].is_string());
    assert_eq!(parsed["error"]["ref"].as_str().unwrap().len(), 32);

    // protocol errors hang up after the response
    let mut probe = [0u8; 1];
    assert_eq!(harness.client.read(&mut probe).unwrap_or(0), 0);

    // without the feature the body is empty
    let engine = Arc::new(MemoryEngine::new());
    let mut harness = Harness::new(engine);
    harness
        .client
        .write_all(&request(Opcode::Set, &[], b"k", b"v"))
        .expect("failed to write");
    harness.run(true, false);

    let (header, body) = harness.read_response();
    assert_eq!(header.status, Status::Einval);
    assert!(body.is_empty());
}

#[test]
fn hello_negotiates_features() {
    let engine = Arc::new(MemoryEngine::new());
    let mut harness = Harness::new(engine);

    let mut features = Vec::new();
    for feature in [0x07u16, 0x0b, 0x04, 0x0e] {
        features.extend_from_slice(&feature.to_be_bytes());
    }
    harness
        .client
        .write_all(&request(Opcode::Hello, &[], b"test-agent/1234", &features))
        .expect("failed to write");
    harness.run(true, false);

    let (header, body) = harness.read_response();
    assert_eq!(header.status, Status::Success);

    let mut enabled = Vec::new();
    for pair in body.chunks_exact(2) {
        enabled.push(u16::from_be_bytes([pair[0], pair[1]]));
    }
    assert!(enabled.contains(&0x07)); // xerror
    assert!(enabled.contains(&0x0b)); // json
    assert!(enabled.contains(&0x04)); // mutation seqno
    assert!(enabled.contains(&0x0e)); // unordered execution

    assert!(harness.connection.is_xerror_support());
    assert!(harness.connection.supports_mutation_extras());
    assert!(harness.connection.allow_unordered_execution());
    assert_eq!(harness.connection.agent_name(), "test-agent");
}

#[test]
fn mutation_extras_in_responses() {
    let engine = Arc::new(MemoryEngine::new());
    let mut harness = Harness::new(engine);
    harness.connection.set_supports_mutation_extras(true);

    let mut extras = Vec::new();
    extras.extend_from_slice(&0u32.to_be_bytes());
    extras.extend_from_slice(&0u32.to_be_bytes());
    harness
        .client
        .write_all(&request(Opcode::Set, &extras, b"k", b"v"))
        .expect("failed to write");
    harness.run(true, false);

    let (header, body) = harness.read_response();
    assert_eq!(header.status, Status::Success);
    assert_eq!(header.extlen, 16);
    let uuid = u64::from_be_bytes(body[0..8].try_into().unwrap());
    let seqno = u64::from_be_bytes(body[8..16].try_into().unwrap());
    assert!(uuid != 0);
    assert!(seqno != 0);
}

#[test]
fn clustermap_notification_pushed_between_commands() {
    let engine = Arc::new(MemoryEngine::new());
    let mut harness = Harness::new(engine);
    harness.connection.set_duplex_supported(true);
    harness
        .connection
        .set_clustermap_notification_supported(true);

    harness
        .connection
        .enqueue_server_event(server::ServerEvent::ClustermapNotification {
            revision: 7,
            payload: Bytes::from_static(b"{\"rev\":7}"),
        });
    harness.run(false, false);

    // an unsolicited server request carrying the map arrives
    let mut header = [0u8; HEADER_LEN];
    harness
        .client
        .read_exact(&mut header)
        .expect("failed to read frame header");
    let header = RequestHeader::parse(&header).expect("invalid frame");
    assert_eq!(header.magic, Magic::ServerRequest);
    assert_eq!(header.opcode, 0x01);
    assert_eq!(header.extlen, 4);

    let mut body = vec![0u8; header.bodylen as usize];
    harness
        .client
        .read_exact(&mut body)
        .expect("failed to read frame body");
    assert_eq!(&body[0..4], &7i32.to_be_bytes());
    assert_eq!(&body[4..], b"{\"rev\":7}");
}

#[test]
fn buffer_exhaustion_closes_connection() {
    // a pool with no allocation budget cannot provision the pipes, which
    // must cost the connection in the very same callback
    let engine = Arc::new(MemoryEngine::new());
    let mut harness = Harness::with_pool(engine, BufferPool::with_budget(16 * 1024, 0));

    harness.run(false, false);
    assert_eq!(harness.connection.state(), State::Destroyed);
}

#[test]
fn invalid_magic_closes_without_response() {
    let engine = Arc::new(MemoryEngine::new());
    let mut harness = Harness::new(engine);

    let mut garbage = request(Opcode::Noop, &[], &[], &[]);
    garbage[0] = 0x42;
    harness.client.write_all(&garbage).expect("failed to write");
    harness.run(true, false);

    assert_eq!(harness.connection.state(), State::Destroyed);
    let mut probe = [0u8; 1];
    assert_eq!(harness.client.read(&mut probe).unwrap_or(0), 0);
}

#[test]
fn dcp_producer_ships_collection_deletion() {
    let engine = Arc::new(ScriptedDcpEngine::new());
    let mut harness = Harness::new(engine.clone());

    harness.connection.set_dcp(true);
    harness.connection.set_dcp_collection_aware(true);
    harness.connection.set_state(State::ShipLog);

    harness.run(false, true);

    // one deletion frame was shipped
    let mut header = [0u8; HEADER_LEN];
    harness
        .client
        .read_exact(&mut header)
        .expect("failed to read frame header");
    let header = RequestHeader::parse(&header).expect("invalid frame");
    assert_eq!(header.opcode, Opcode::DcpDeletion as u8);
    assert_eq!(header.vbucket, 3);
    assert_eq!(header.cas, 0xbeef);
    assert_eq!(header.extlen, DcpDeletion::extlen(true));
    assert_eq!(header.keylen, 5);

    let mut body = vec![0u8; header.bodylen as usize];
    harness
        .client
        .read_exact(&mut body)
        .expect("failed to read frame body");

    let extras = &body[0..header.extlen as usize];
    let deletion = DcpDeletion::decode(extras, true).expect("invalid extras");
    assert_eq!(deletion.by_seqno, 42);
    assert_eq!(deletion.rev_seqno, 1);
    assert_eq!(deletion.collection_len, 1);

    // the key section carries the collection prefix
    let key = &body[header.extlen as usize..];
    assert_eq!(key, b"\x09user");
    assert_eq!(
        engine::DocKey::dcp_namespace(true, deletion.collection_len),
        engine::DocNamespace::Collections
    );
    assert_eq!(&key[deletion.collection_len as usize..], b"user");

    // the engine item was released once transmission finished
    assert_eq!(engine.released.load(Ordering::Relaxed), 1);
    assert!(engine.handles.lock().unwrap().is_empty());
}

#[test]
fn dcp_deletion_rejected_without_collection_negotiation() {
    let engine = Arc::new(ScriptedDcpEngine::new());
    let mut harness = Harness::new(engine);

    // channel did not negotiate collections, frame sized as if it had
    harness.connection.set_dcp(true);

    let deletion = DcpDeletion {
        by_seqno: 1,
        rev_seqno: 1,
        nmeta: 0,
        collection_len: 1,
    };
    let mut extras = Vec::new();
    deletion.compose_extras(&mut extras, true);
    harness
        .client
        .write_all(&request(Opcode::DcpDeletion, &extras, b"\x09user", &[]))
        .expect("failed to write");
    harness.run(true, false);

    let (header, _) = harness.read_response();
    assert_eq!(header.status, Status::Einval);

    // the violation costs the connection
    let mut probe = [0u8; 1];
    assert_eq!(harness.client.read(&mut probe).unwrap_or(0), 0);
}
