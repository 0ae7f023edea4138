// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! End-to-end tests driving the broker over real TCP sockets, the way
//! the teacher's own `test/test.rs` exercises whole socket pairs
//! rather than mocking the transport.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use psmb::worker::Broker;

fn start_broker(max_threads: usize, keep_alive: i64) -> SocketAddr {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let broker = Broker::new(max_threads, keep_alive);
        broker.accept_loop(listener);
    });
    thread::sleep(Duration::from_millis(50));
    addr
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
}

fn cstring(s: &str) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

fn send_handshake(stream: &mut TcpStream, version: u32) {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"PSMB");
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&[0, 0, 0, 0]);
    stream.write_all(&buf).unwrap();
}

fn read_exact_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn expect_handshake_ok(stream: &mut TcpStream) {
    assert_eq!(read_exact_n(stream, 7), b"OK\x00\x00\x00\x00\x00");
}

fn subscribe(stream: &mut TcpStream, pattern: &str) {
    send_handshake(stream, 1);
    expect_handshake_ok(stream);
    stream.write_all(b"SUB").unwrap();
    stream.write_all(&0u32.to_be_bytes()).unwrap();
    stream.write_all(&cstring(pattern)).unwrap();
    assert_eq!(read_exact_n(stream, 3), b"OK\x00");
}

fn publish_connect(stream: &mut TcpStream, topic: &str) {
    send_handshake(stream, 1);
    expect_handshake_ok(stream);
    stream.write_all(b"PUB").unwrap();
    stream.write_all(&cstring(topic)).unwrap();
    assert_eq!(read_exact_n(stream, 3), b"OK\x00");
}

fn publish_message(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(b"MSG").unwrap();
    stream.write_all(&(payload.len() as u64).to_be_bytes()).unwrap();
    stream.write_all(payload).unwrap();
}

fn expect_message(stream: &mut TcpStream, payload: &[u8]) {
    assert_eq!(read_exact_n(stream, 3), b"MSG");
    let len_bytes = read_exact_n(stream, 8);
    let len = u64::from_be_bytes(len_bytes.try_into().unwrap());
    assert_eq!(len as usize, payload.len());
    assert_eq!(read_exact_n(stream, payload.len()), payload);
}

fn expect_timeout(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    let err = stream.read_exact(&mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
}

#[test]
fn exact_match_delivery() {
    let addr = start_broker(8, -1);

    let mut sub = connect(addr);
    subscribe(&mut sub, r"chat\.en");

    let mut publisher = connect(addr);
    publish_connect(&mut publisher, "chat.en");
    publish_message(&mut publisher, b"hello");

    expect_message(&mut sub, b"hello");
}

#[test]
fn non_match_suppression() {
    let addr = start_broker(8, -1);

    let mut sub = connect(addr);
    subscribe(&mut sub, r"chat\.en");

    let mut publisher = connect(addr);
    publish_connect(&mut publisher, "chat.de");
    publish_message(&mut publisher, b"hello");

    sub.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
    expect_timeout(&mut sub);
}

#[test]
fn regex_group_selects_branches_in_order() {
    let addr = start_broker(8, -1);

    let mut sub = connect(addr);
    subscribe(&mut sub, r"chat\.(en|de)");

    let mut publisher = connect(addr);
    publish_connect(&mut publisher, "chat.en");
    publish_message(&mut publisher, b"a");

    let mut publisher2 = connect(addr);
    publish_connect(&mut publisher2, "chat.de");
    publish_message(&mut publisher2, b"b");

    let mut publisher3 = connect(addr);
    publish_connect(&mut publisher3, "chat.fr");
    publish_message(&mut publisher3, b"c");

    expect_message(&mut sub, b"a");
    expect_message(&mut sub, b"b");

    sub.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
    expect_timeout(&mut sub);
}

#[test]
fn handshake_rejects_bad_magic_and_unsupported_version() {
    let addr = start_broker(8, -1);

    let mut bad_magic = connect(addr);
    bad_magic.write_all(b"PSMX").unwrap();
    bad_magic.write_all(&1u32.to_le_bytes()).unwrap();
    bad_magic.write_all(&[0, 0, 0, 0]).unwrap();
    let mut buf = [0u8; 1];
    let read = bad_magic.read(&mut buf).unwrap();
    assert_eq!(read, 0, "server must close without writing on bad magic");

    let mut bad_version = connect(addr);
    send_handshake(&mut bad_version, 3);
    assert_eq!(read_exact_n(&mut bad_version, 22), b"UNSUPPORTED PROTOCOL\0");
}

#[test]
fn bad_pattern_recovers_then_succeeds() {
    let addr = start_broker(8, -1);

    let mut sub = connect(addr);
    send_handshake(&mut sub, 1);
    expect_handshake_ok(&mut sub);

    sub.write_all(b"SUB").unwrap();
    sub.write_all(&0u32.to_be_bytes()).unwrap();
    sub.write_all(&cstring("[")).unwrap();
    let mut expected = b"FAILED\0".to_vec();
    expected.extend_from_slice(b"Invalid pattern string.\0");
    assert_eq!(read_exact_n(&mut sub, expected.len()), expected);

    sub.write_all(b"SUB").unwrap();
    sub.write_all(&0u32.to_be_bytes()).unwrap();
    sub.write_all(&cstring(".*")).unwrap();
    assert_eq!(read_exact_n(&mut sub, 3), b"OK\x00");
}

#[test]
fn v2_keepalive_nop_then_disconnect_after_three_misses() {
    let addr = start_broker(8, 1);

    let mut sub = connect(addr);
    send_handshake(&mut sub, 2);
    expect_handshake_ok(&mut sub);
    sub.write_all(b"SUB").unwrap();
    sub.write_all(&0u32.to_be_bytes()).unwrap();
    sub.write_all(&cstring(".*")).unwrap();
    assert_eq!(read_exact_n(&mut sub, 3), b"OK\x00");

    sub.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    assert_eq!(read_exact_n(&mut sub, 3), b"NOP");
    assert_eq!(read_exact_n(&mut sub, 3), b"NOP");
    assert_eq!(read_exact_n(&mut sub, 3), b"NOP");

    let mut buf = [0u8; 1];
    let read = sub.read(&mut buf).unwrap();
    assert_eq!(read, 0, "insensible client must be disconnected");
}

#[test]
fn v2_keepalive_stays_open_when_client_answers() {
    let addr = start_broker(8, 1);

    let mut sub = connect(addr);
    send_handshake(&mut sub, 2);
    expect_handshake_ok(&mut sub);
    sub.write_all(b"SUB").unwrap();
    sub.write_all(&0u32.to_be_bytes()).unwrap();
    sub.write_all(&cstring(".*")).unwrap();
    assert_eq!(read_exact_n(&mut sub, 3), b"OK\x00");

    sub.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
    for _ in 0..3 {
        assert_eq!(read_exact_n(&mut sub, 3), b"NOP");
        sub.write_all(b"NIL").unwrap();
    }

    // still alive: a publisher on the matching topic gets delivered.
    let mut publisher = connect(addr);
    publish_connect(&mut publisher, "anything");
    publish_message(&mut publisher, b"still here");
    expect_message(&mut sub, b"still here");
}
