// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Per-connection state machine: handshake, PUB/SUB mode selection,
//! publish loop, subscribe loop, teardown.
//!
//! Each session owns a private `mio::Poll` and uses it for every
//! suspension point, including the keepalive timeout and the
//! client-socket/notify-pipe dual wait in the subscribe loop. This is
//! the generalization of the teacher's `mio`-registered pipe state
//! machine (`examples/kpcyrd-scaproust/src/pipe.rs`) from a single
//! shared event loop driving many pipes to one `Poll` per
//! thread-per-connection worker.
//!
//! `mio::Poll` is edge-triggered: an event is reported once per
//! transition to "ready", not once per `poll()` call while data sits
//! unread. A session therefore tracks sticky readiness flags per
//! source (`client_readable`, `client_writable`, `notify_readable`)
//! that are set by `refresh_readiness` on any reported event and
//! cleared only when a later read/write against that source genuinely
//! returns `WouldBlock` — emulating level-triggered semantics on top
//! of mio without risking a missed wakeup.
//!
//! A sticky flag is trustworthy only between the poll that set it and
//! the next read attempt against that source; it must never be read
//! back across a suspension point (a prior phase's reads, a prior
//! loop iteration) without independent confirmation, because a read
//! that happens to drain the socket exactly does not generate the
//! `WouldBlock` that would otherwise clear it. `client_readable` is
//! therefore never trusted as a readiness decision on its own: the
//! socket is only ever known to hold more client bytes when
//! `read_buf` is non-empty (bytes already pulled off the wire and
//! sitting in memory) or the flag was just set by a `refresh_readiness`
//! call made within the same wait. `BlockingIo::read` always drains a
//! whole socket buffer's worth of bytes into `read_buf` on every
//! successful read, so "no bytes buffered" really does mean "nothing
//! to read right now" rather than "we happened to stop early".

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use crate::dispatcher::{Dispatcher, SubscriberId};
use crate::error::{Error, Result};
use crate::notify::NotifyReceiver;
use crate::pattern::Pattern;
use crate::wire;

const CLIENT: Token = Token(0);
const NOTIFY: Token = Token(1);

/// Number of consecutive missed keepalive probes that marks a client
/// "insensible" and ends the session.
const MAX_MISSED_KEEPALIVES: u32 = 3;

enum Role {
    Publisher { topic: String },
    Subscriber { id: SubscriberId, rx: NotifyReceiver },
}

pub struct Session {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    keep_alive: i64,
    protocol_version: u32,
    missed_keepalives: u32,
    client_readable: bool,
    client_writable: bool,
    notify_readable: bool,
    notify_registered: bool,
    /// Bytes already pulled off the client socket and not yet consumed
    /// by the codec. The only source of truth for "does the client
    /// have unread data right now" across a suspension point.
    read_buf: VecDeque<u8>,
    client_eof: bool,
}

impl Session {
    /// `keep_alive` mirrors spec §5/§6.2: `<= 0` disables keepalive
    /// (infinite wait), a positive value is the probe interval in
    /// seconds. Values in `1..=3` are rejected by the caller before a
    /// `Session` is ever constructed (see `config::Config::validate`).
    pub fn new(stream: std::net::TcpStream, dispatcher: Arc<Dispatcher>, keep_alive: i64) -> io::Result<Session> {
        stream.set_nonblocking(true)?;
        let peer = stream.peer_addr()?;
        let mut stream = TcpStream::from_std(stream);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, CLIENT, Interest::READABLE | Interest::WRITABLE)?;

        Ok(Session {
            stream,
            poll,
            events: Events::with_capacity(8),
            peer,
            dispatcher,
            keep_alive,
            protocol_version: 0,
            missed_keepalives: 0,
            client_readable: false,
            client_writable: false,
            notify_readable: false,
            notify_registered: false,
            read_buf: VecDeque::new(),
            client_eof: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Drives the session to completion: handshake, role selection,
    /// the appropriate loop, then unconditional teardown (spec
    /// §4.4.3). Never panics out to the caller; any fault is logged
    /// and swallowed so one session's failure cannot take down the
    /// worker pool.
    pub fn run(mut self) {
        let peer = self.peer;
        let outcome = self.handshake_and_select_role();

        let (role_tag, id, result) = match outcome {
            Ok(Role::Publisher { topic }) => ("publisher", None, self.publish_loop(&topic)),
            Ok(Role::Subscriber { id, mut rx }) => {
                let result = self.subscribe_loop(id, &mut rx);
                ("subscriber", Some(id), result)
            }
            Err(e) => ("unestablished", None, Err(e)),
        };

        if let Some(id) = id {
            self.dispatcher.unsubscribe(id);
        }

        match &result {
            Ok(()) => log::info!("[{} {}] session closed", role_tag, peer),
            Err(e) => log::error!("[{} {}] session terminated: {}", role_tag, peer, e),
        }
    }

    fn io(&mut self) -> BlockingIo<'_> {
        BlockingIo { session: self }
    }

    // ---- readiness plumbing -------------------------------------------------

    /// Polls once and folds any reported events into the sticky flags.
    /// Returns `true` if the call returned with no events (a timeout).
    fn refresh_readiness(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        self.poll.poll(&mut self.events, timeout)?;
        if self.events.is_empty() {
            return Ok(true);
        }
        for ev in self.events.iter() {
            match ev.token() {
                CLIENT => {
                    if ev.is_readable() {
                        self.client_readable = true;
                    }
                    if ev.is_writable() {
                        self.client_writable = true;
                    }
                }
                NOTIFY => {
                    if ev.is_readable() {
                        self.notify_readable = true;
                    }
                }
                _ => {}
            }
        }
        Ok(false)
    }

    fn wait_client_readable_blocking(&mut self) -> io::Result<()> {
        while !self.client_readable {
            self.refresh_readiness(None)?;
        }
        Ok(())
    }

    fn wait_client_writable_blocking(&mut self) -> io::Result<()> {
        while !self.client_writable {
            self.refresh_readiness(None)?;
        }
        Ok(())
    }

    /// True iff the client side is known, right now, to have something
    /// to read: bytes already buffered in memory, or a seen EOF. Unlike
    /// `client_readable` this is never stale — it is not set by a poll
    /// event but by an actual prior read, so it cannot outlive its own
    /// truth across a suspension point.
    fn client_has_buffered_data(&self) -> bool {
        !self.read_buf.is_empty() || self.client_eof
    }

    /// Waits up to `timeout` for the client socket to become readable.
    /// Returns `Ok(true)` if it did, `Ok(false)` on timeout.
    fn wait_client_readable_timeout(&mut self, timeout: Duration) -> io::Result<bool> {
        if self.client_has_buffered_data() {
            return Ok(true);
        }
        // No buffered data: any stale `client_readable` left over from
        // an earlier phase's reads is not proof of anything now, so it
        // is discarded until a fresh poll sets it again.
        self.client_readable = false;
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.refresh_readiness(Some(deadline - now))?;
            if self.client_readable {
                return Ok(true);
            }
        }
    }

    /// Waits for the client socket OR the notify pipe, up to `timeout`.
    /// Returns `(client_ready, notify_ready)`; both false means timeout.
    fn wait_client_or_notify(&mut self, timeout: Option<Duration>) -> io::Result<(bool, bool)> {
        if self.client_has_buffered_data() {
            return Ok((true, self.notify_readable));
        }
        self.client_readable = false;
        if self.notify_readable {
            return Ok((false, true));
        }
        match timeout {
            None => {
                while !self.client_readable && !self.notify_readable {
                    self.refresh_readiness(None)?;
                }
                Ok((self.client_readable, self.notify_readable))
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if self.client_readable || self.notify_readable {
                        return Ok((self.client_readable, self.notify_readable));
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok((false, false));
                    }
                    self.refresh_readiness(Some(deadline - now))?;
                }
            }
        }
    }

    fn register_notify(&mut self, rx: &mut NotifyReceiver) -> io::Result<()> {
        self.poll
            .registry()
            .register(rx.inner_mut(), NOTIFY, Interest::READABLE)?;
        self.notify_registered = true;
        Ok(())
    }

    // ---- handshake & mode selection -----------------------------------------

    fn handshake_and_select_role(&mut self) -> Result<Role> {
        self.read_handshake()?;
        self.select_role()
    }

    fn read_handshake(&mut self) -> Result<()> {
        let magic = { let mut io = self.io(); wire::read_exact(&mut io, 4)? };
        if magic != b"PSMB" {
            return Err(Error::ProtocolViolation("bad magic"));
        }

        let version_bytes = { let mut io = self.io(); wire::read_exact(&mut io, 4)? };
        let version_bytes: [u8; 4] = version_bytes
            .try_into()
            .map_err(|_| Error::InternalFault("short version field".into()))?;
        let version = wire::decode_protocol_version(&version_bytes);
        if version != 1 && version != 2 {
            let mut io = self.io();
            wire::write_all(&mut io, b"UNSUPPORTED PROTOCOL\0")?;
            return Err(Error::ProtocolViolation("unsupported protocol version"));
        }

        let options = { let mut io = self.io(); wire::read_exact(&mut io, 4)? };
        if options != [0, 0, 0, 0] {
            return Err(Error::ProtocolViolation("bad handshake options"));
        }

        self.protocol_version = version;
        let mut io = self.io();
        wire::write_all(&mut io, b"OK\0\x00\x00\x00\x00")
    }

    fn send_failed(&mut self, reason: &str) -> Result<()> {
        let mut io = self.io();
        wire::write_all(&mut io, b"FAILED\0")?;
        wire::write_all(&mut io, reason.as_bytes())?;
        wire::write_all(&mut io, b"\0")
    }

    fn select_role(&mut self) -> Result<Role> {
        loop {
            let token = { let mut io = self.io(); wire::read_exact(&mut io, 3)? };
            match token.as_slice() {
                b"PUB" => {
                    let topic_bytes = { let mut io = self.io(); wire::read_cstring(&mut io, None)? };
                    match wire::decode_ascii(topic_bytes) {
                        Ok(topic) => {
                            let mut io = self.io();
                            wire::write_all(&mut io, b"OK\0")?;
                            return Ok(Role::Publisher { topic });
                        }
                        Err(e) if e.is_recoverable_handshake_error() => {
                            self.send_failed("Invalid topic string.")?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                b"SUB" => {
                    let options = { let mut io = self.io(); wire::read_u32_be(&mut io)? };
                    let pattern_bytes = { let mut io = self.io(); wire::read_cstring(&mut io, None)? };
                    let identity = if options & 1 != 0 {
                        Some({ let mut io = self.io(); wire::read_u64_be(&mut io)? })
                    } else {
                        None
                    };

                    let pattern_src = match wire::decode_ascii(pattern_bytes) {
                        Ok(p) => p,
                        Err(e) if e.is_recoverable_handshake_error() => {
                            self.send_failed("Invalid pattern string.")?;
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    let pattern = match Pattern::compile(&pattern_src) {
                        Ok(p) => p,
                        Err(e) if e.is_recoverable_handshake_error() => {
                            self.send_failed("Invalid pattern string.")?;
                            continue;
                        }
                        Err(e) => return Err(e),
                    };

                    match self.dispatcher.subscribe(identity, pattern) {
                        Ok((id, mut rx)) => {
                            self.register_notify(&mut rx)?;
                            let mut io = self.io();
                            wire::write_all(&mut io, b"OK\0")?;
                            return Ok(Role::Subscriber { id, rx });
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ => {
                    let mut io = self.io();
                    wire::write_all(&mut io, b"BAD COMMAND\0")?;
                    return Err(Error::InvalidMessage);
                }
            }
        }
    }

    // ---- loops ----------------------------------------------------------------

    fn publish_loop(&mut self, topic: &str) -> Result<()> {
        loop {
            let ready = if self.keep_alive > 0 {
                self.wait_client_readable_timeout(Duration::from_secs(self.keep_alive as u64))?
            } else {
                self.wait_client_readable_blocking()?;
                true
            };

            if !ready {
                if self.protocol_version == 1 {
                    // v1 never originates NOP; an idle v1 publisher waits forever (spec §9).
                    continue;
                }
                self.missed_keepalives += 1;
                if self.missed_keepalives >= MAX_MISSED_KEEPALIVES {
                    return Err(Error::InsensibleClient);
                }
                let mut io = self.io();
                wire::write_all(&mut io, b"NOP")?;
                continue;
            }

            let mut io = self.io();
            let token = wire::read_exact(&mut io, 3)?;
            match token.as_slice() {
                b"NOP" => {
                    wire::write_all(&mut io, b"NIL")?;
                }
                b"NIL" => {
                    self.missed_keepalives = 0;
                }
                b"BYE" => return Ok(()),
                b"MSG" => {
                    let len = wire::read_u64_be(&mut io)?;
                    let payload = wire::read_exact(&mut io, len as usize)?;
                    drop(io);
                    self.dispatcher.publish(&payload, topic);
                }
                _ => return Err(Error::InvalidMessage),
            }
        }
    }

    fn subscribe_loop(&mut self, id: SubscriberId, rx: &mut NotifyReceiver) -> Result<()> {
        loop {
            let timeout = if self.keep_alive > 0 {
                Some(Duration::from_secs(self.keep_alive as u64))
            } else {
                None
            };
            let (client_ready, notify_ready) = self.wait_client_or_notify(timeout)?;

            if !client_ready && !notify_ready {
                self.missed_keepalives += 1;
                if self.missed_keepalives >= MAX_MISSED_KEEPALIVES {
                    return Err(Error::InsensibleClient);
                }
                let mut io = self.io();
                wire::write_all(&mut io, b"NOP")?;
                continue;
            }

            if client_ready {
                let mut io = self.io();
                let token = wire::read_exact(&mut io, 3)?;
                match token.as_slice() {
                    b"NIL" => self.missed_keepalives = 0,
                    b"NOP" => wire::write_all(&mut io, b"NIL")?,
                    b"BYE" => return Ok(()),
                    _ => return Err(Error::InvalidMessage),
                }
            }

            if notify_ready {
                self.notify_readable = false;
                let _ = rx.consume_one().map_err(Error::Io)?;
                for (message, _topic) in self.dispatcher.drain_inbox(id) {
                    let mut io = self.io();
                    wire::write_all(&mut io, b"MSG")?;
                    wire::write_u64_be(&mut io, message.len() as u64)?;
                    wire::write_all(&mut io, &message)?;
                }
            }
        }
    }
}

/// Adapts a live `Session`'s nonblocking socket to `Read`/`Write` so
/// `wire`'s generic codec functions, already exercised against
/// `Cursor` in unit tests, run unchanged against the real connection.
/// A `WouldBlock` is not an error here: it clears the relevant sticky
/// flag and blocks on the next readiness event before retrying.
struct BlockingIo<'a> {
    session: &'a mut Session,
}

impl Read for BlockingIo<'_> {
    /// Never serves a short read out of a stale sticky flag: bytes only
    /// ever come from `read_buf`, which is only ever refilled by a raw
    /// socket read that either hands back real data or a genuine
    /// `WouldBlock`. A single caller-sized read from the kernel could
    /// leave more unread and never clear the readiness flag, so every
    /// refill keeps pulling into `read_buf` until the socket actually
    /// blocks, exactly draining the edge that was reported.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.session.read_buf.is_empty() {
                let n = buf.len().min(self.session.read_buf.len());
                for slot in buf[..n].iter_mut() {
                    *slot = self.session.read_buf.pop_front().unwrap();
                }
                return Ok(n);
            }
            if self.session.client_eof {
                return Ok(0);
            }

            let mut scratch = [0u8; 4096];
            match self.session.stream.read(&mut scratch) {
                Ok(0) => {
                    self.session.client_eof = true;
                    return Ok(0);
                }
                Ok(n) => {
                    self.session.read_buf.extend(scratch[..n].iter().copied());
                }
                Err(e) if wire::would_block(&e) => {
                    self.session.client_readable = false;
                    self.session.wait_client_readable_blocking()?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Write for BlockingIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.session.stream.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if wire::would_block(&e) => {
                    self.session.client_writable = false;
                    self.session.wait_client_writable_blocking()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.session.stream.flush()
    }
}
