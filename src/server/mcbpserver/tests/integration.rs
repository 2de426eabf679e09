// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! End-to-end smoke test: launches a full server and speaks the binary
//! protocol to it over a fresh connection per scenario.

use config::McbpserverConfig;
use mcbpserver::Mcbpserver;
use protocol_mcbp::{Magic, Opcode, RequestHeader, ResponseHeader, Status, HEADER_LEN};

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

fn request(opcode: Opcode, extras: &[u8], key: &[u8], value: &[u8]) -> Vec<u8> {
    request_cas(opcode, extras, key, value, 0)
}

fn request_cas(opcode: Opcode, extras: &[u8], key: &[u8], value: &[u8], cas: u64) -> Vec<u8> {
    let header = RequestHeader {
        magic: Magic::ClientRequest,
        opcode: opcode as u8,
        keylen: key.len() as u16,
        extlen: extras.len() as u8,
        datatype: 0,
        vbucket: 0,
        bodylen: (extras.len() + key.len() + value.len()) as u32,
        opaque: 0x1234,
        cas,
    };
    let mut buf = Vec::new();
    header.compose(&mut buf);
    buf.extend_from_slice(extras);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

fn set_extras(flags: u32) -> Vec<u8> {
    let mut extras = Vec::new();
    extras.extend_from_slice(&flags.to_be_bytes());
    extras.extend_from_slice(&0u32.to_be_bytes());
    extras
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("failed to connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("failed to set read timeout");
    stream
}

fn exchange(stream: &mut TcpStream, frame: &[u8]) -> (ResponseHeader, Vec<u8>) {
    stream.write_all(frame).expect("failed to write");
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

#[test]
fn smoke() {
    let config: McbpserverConfig = toml::from_str(
        "[server]\nhost = \"127.0.0.1\"\nport = \"0\"\n\
         [admin]\nhost = \"127.0.0.1\"\nport = \"0\"\n",
    )
    .expect("failed to build config");
    let server = Mcbpserver::new(config).expect("failed to launch server");
    let addr = server.listen_addr();

    let mut stream = connect(addr);

    // miss before the key exists
    let (header, _) = exchange(&mut stream, &request(Opcode::Get, &[], b"key", &[]));
    assert_eq!(header.status, Status::KeyEnoent);

    // store it, read it back
    let (header, _) = exchange(
        &mut stream,
        &request(Opcode::Set, &set_extras(42), b"key", b"value"),
    );
    assert_eq!(header.status, Status::Success);
    let cas = header.cas;
    assert!(cas != 0);

    let (header, body) = exchange(&mut stream, &request(Opcode::Get, &[], b"key", &[]));
    assert_eq!(header.status, Status::Success);
    assert_eq!(header.cas, cas);
    assert_eq!(&body[0..4], &42u32.to_be_bytes());
    assert_eq!(&body[4..], b"value");

    // add fails on an existing key
    let (header, _) = exchange(
        &mut stream,
        &request(Opcode::Add, &set_extras(0), b"key", b"other"),
    );
    assert_eq!(header.status, Status::KeyEexists);

    // compare-and-swap: stale cas rejected, fresh cas accepted
    let (header, _) = exchange(
        &mut stream,
        &request_cas(Opcode::Set, &set_extras(0), b"key", b"new", cas + 100),
    );
    assert_eq!(header.status, Status::KeyEexists);
    let (header, _) = exchange(
        &mut stream,
        &request_cas(Opcode::Set, &set_extras(0), b"key", b"new", cas),
    );
    assert_eq!(header.status, Status::Success);

    // append grows the value
    let (header, _) = exchange(
        &mut stream,
        &request(Opcode::Append, &[], b"key", b"-tail"),
    );
    assert_eq!(header.status, Status::Success);
    let (_, body) = exchange(&mut stream, &request(Opcode::Get, &[], b"key", &[]));
    assert_eq!(&body[4..], b"new-tail");

    // delete removes it
    let (header, _) = exchange(&mut stream, &request(Opcode::Delete, &[], b"key", &[]));
    assert_eq!(header.status, Status::Success);
    let (header, _) = exchange(&mut stream, &request(Opcode::Get, &[], b"key", &[]));
    assert_eq!(header.status, Status::KeyEnoent);

    // noop and version still answer
    let (header, _) = exchange(&mut stream, &request(Opcode::Noop, &[], &[], &[]));
    assert_eq!(header.status, Status::Success);
    let (header, body) = exchange(&mut stream, &request(Opcode::Version, &[], &[], &[]));
    assert_eq!(header.status, Status::Success);
    assert!(!body.is_empty());

    // select an unknown bucket
    let (header, _) = exchange(
        &mut stream,
        &request(Opcode::SelectBucket, &[], b"nope", &[]),
    );
    assert_eq!(header.status, Status::KeyEnoent);

    // quit answers then hangs up
    let (header, _) = exchange(&mut stream, &request(Opcode::Quit, &[], &[], &[]));
    assert_eq!(header.status, Status::Success);
    let mut probe = [0u8; 1];
    assert_eq!(stream.read(&mut probe).unwrap_or(0), 0);

    server.shutdown();
}
