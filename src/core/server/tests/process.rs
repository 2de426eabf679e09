// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Tests against a fully spawned process: listener, workers and admin
//! threads with real cross-thread wakeups.

use server::{Bucket, ProcessBuilder};

use common::signal::Signal;
use config::McbpserverConfig;
use engine::{
    CookieId, CookieRef, DocKey, Engine, EngineResult, ErrorCode, ItemHandle, ItemInfo,
    MemoryEngine, MutationDescr, NotifyIoComplete, StoreOperation,
};
use logger::{LogBuilder, Stdout};
use protocol_mcbp::{Magic, Opcode, RequestHeader, ResponseHeader, Status, HEADER_LEN};

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn test_config() -> McbpserverConfig {
    toml::from_str(
        "[server]\nhost = \"127.0.0.1\"\nport = \"0\"\n\
         [admin]\nhost = \"127.0.0.1\"\nport = \"0\"\n\
         [worker]\nthreads = 2\n",
    )
    .expect("failed to build test config")
}

fn log_drain() -> Box<dyn logger::Drain> {
    LogBuilder::new()
        .output(Box::new(Stdout::new()))
        .build()
        .expect("failed to build log")
        .start()
}

fn request(opcode: Opcode, extras: &[u8], key: &[u8], value: &[u8], opaque: u32) -> Vec<u8> {
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

fn read_response(stream: &mut TcpStream) -> (ResponseHeader, Vec<u8>) {
    let mut header = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut header)
        .expect("failed to read response header");
    let header = ResponseHeader::parse(&header).expect("invalid response header");
    let mut body = vec![0u8; header.bodylen as usize];
    stream
        .read_exact(&mut body)
        .expect("failed to read response body");
    (header, body)
}

fn set_extras() -> Vec<u8> {
    let mut extras = Vec::new();
    extras.extend_from_slice(&0u32.to_be_bytes());
    extras.extend_from_slice(&0u32.to_be_bytes());
    extras
}

/// Delegates to a memory engine but parks the first `blocks` mutations,
/// completing them only when the test asks for it.
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

    fn parked_count(&self) -> usize {
        self.parked.lock().unwrap().len()
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

#[test]
fn parked_command_completes_through_pending_io() {
    let engine = Arc::new(BlockingEngine::new(1));
    let builder = ProcessBuilder::new(
        &test_config(),
        log_drain(),
        vec![Bucket::new("default", engine.clone())],
    )
    .expect("failed to build process");
    let addr = builder.listen_addr().expect("no listen address");
    let process = builder.spawn();

    let mut client = TcpStream::connect(addr).expect("failed to connect");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    client
        .write_all(&request(Opcode::Set, &set_extras(), b"k", b"v", 1))
        .expect("failed to write");

    // wait for the worker to park the command, then complete it from this
    // thread the way an engine's io thread would
    for _ in 0..100 {
        if engine.parked_count() == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(engine.parked_count(), 1);
    engine.complete_parked();

    let (header, _) = read_response(&mut client);
    assert_eq!(header.status, Status::Success);
    assert_eq!(header.opaque, 1);

    // the stored value is visible afterwards
    client
        .write_all(&request(Opcode::Get, &[], b"k", &[], 2))
        .expect("failed to write");
    let (header, body) = read_response(&mut client);
    assert_eq!(header.status, Status::Success);
    assert_eq!(&body[4..], b"v");

    process.shutdown();
}

#[test]
fn unordered_execution_serializes_responses_in_arrival_order() {
    let engine = Arc::new(BlockingEngine::new(1));
    let builder = ProcessBuilder::new(
        &test_config(),
        log_drain(),
        vec![Bucket::new("default", engine.clone())],
    )
    .expect("failed to build process");
    let addr = builder.listen_addr().expect("no listen address");
    let process = builder.spawn();

    let mut client = TcpStream::connect(addr).expect("failed to connect");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // negotiate unordered execution
    let feature = 0x0eu16.to_be_bytes();
    client
        .write_all(&request(Opcode::Hello, &[], b"test", &feature, 1))
        .expect("failed to write");
    let (header, body) = read_response(&mut client);
    assert_eq!(header.status, Status::Success);
    assert_eq!(body, feature);

    // the first store parks, the second completes immediately
    client
        .write_all(&request(Opcode::Set, &set_extras(), b"a", b"1", 2))
        .expect("failed to write");
    client
        .write_all(&request(Opcode::Set, &set_extras(), b"b", b"2", 3))
        .expect("failed to write");

    for _ in 0..100 {
        if engine.parked_count() == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(engine.parked_count(), 1);

    // no response may arrive while the earlier command is in flight
    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut probe = [0u8; 1];
    assert!(client.read(&mut probe).is_err());

    engine.complete_parked();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // responses arrive in arrival order even though completion inverted it
    let (header, _) = read_response(&mut client);
    assert_eq!(header.opaque, 2);
    assert_eq!(header.status, Status::Success);
    let (header, _) = read_response(&mut client);
    assert_eq!(header.opaque, 3);
    assert_eq!(header.status, Status::Success);

    process.shutdown();
}

#[test]
fn admin_protocol_round_trip() {
    let builder = ProcessBuilder::new(
        &test_config(),
        log_drain(),
        vec![Bucket::new("default", Arc::new(MemoryEngine::new()))],
    )
    .expect("failed to build process");
    let admin_addr = builder.admin_addr().expect("no admin address");
    let process = builder.spawn();

    let mut admin = TcpStream::connect(admin_addr).expect("failed to connect to admin");
    admin
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    admin.write_all(b"version\r\n").expect("failed to write");
    let mut buf = [0u8; 4096];
    let n = admin.read(&mut buf).expect("failed to read");
    let response = String::from_utf8_lossy(&buf[0..n]).to_string();
    assert!(response.starts_with("VERSION "));

    admin.write_all(b"stats\r\n").expect("failed to write");
    let mut collected = String::new();
    loop {
        let n = admin.read(&mut buf).expect("failed to read stats");
        collected.push_str(&String::from_utf8_lossy(&buf[0..n]));
        if collected.contains("END\r\n") {
            break;
        }
    }
    assert!(collected.contains("STAT conn_accept"));

    admin.write_all(b"quit\r\n").expect("failed to write");
    let n = admin.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0);

    process.shutdown();
}

#[test]
fn signal_idle_evicts_connections() {
    let builder = ProcessBuilder::new(
        &test_config(),
        log_drain(),
        vec![Bucket::new("default", Arc::new(MemoryEngine::new()))],
    )
    .expect("failed to build process");
    let addr = builder.listen_addr().expect("no listen address");
    let registry = builder.registry();
    let process = builder.spawn();

    let mut client = TcpStream::connect(addr).expect("failed to connect");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // an exchange proves the connection is established and idle afterwards
    client
        .write_all(&request(Opcode::Noop, &[], &[], &[], 1))
        .expect("failed to write");
    let (header, _) = read_response(&mut client);
    assert_eq!(header.status, Status::Success);
    assert_eq!(registry.len(), 1);

    process
        .signal(Signal::SignalIdle(None))
        .expect("failed to signal");

    // the worker closes the idle connection
    let mut probe = [0u8; 1];
    assert_eq!(client.read(&mut probe).unwrap_or(0), 0);

    for _ in 0..100 {
        if registry.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(registry.is_empty());

    process.shutdown();
}
