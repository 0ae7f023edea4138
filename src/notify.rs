// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The per-subscription "mail waiting" signal.
//!
//! A subscription owns a half-duplex pipe: `publish` writes one byte to
//! the `Sender` half per matching subscriber, and the owning session
//! waits on the `Receiver` half concurrently with its client socket
//! using `mio::Poll`. This is the direct generalization of the
//! teacher's `mio`-registered pipe endpoints (`src/pipe.rs`) and of the
//! reference implementation's `socket.socketpair()` notification
//! (`pypsmb/mb/message_dispatcher.py`).

use std::io::{self, Read, Write};

use mio::unix::pipe;

/// The write half, owned by the dispatcher's `Subscription`.
pub struct NotifySender(pipe::Sender);

/// The read half, owned by the subscribing session.
pub struct NotifyReceiver(pipe::Receiver);

/// Creates a fresh notification pair.
pub fn pair() -> io::Result<(NotifySender, NotifyReceiver)> {
    let (tx, rx) = pipe::new()?;
    Ok((NotifySender(tx), NotifyReceiver(rx)))
}

impl NotifySender {
    /// Raises the signal. A single byte is written per call; the reader
    /// only cares that *something* arrived, not how many bytes or how
    /// many separate raises occurred (spec §3: "the notification signal
    /// is level-independent of inbox non-emptiness").
    pub fn raise(&mut self) -> io::Result<()> {
        match self.0.write(&[0u8]) {
            Ok(_) => Ok(()),
            // The pipe buffer is already full of pending wake-ups; the
            // reader will drain the inbox regardless, so this is not an error.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl NotifyReceiver {
    pub(crate) fn inner_mut(&mut self) -> &mut pipe::Receiver {
        &mut self.0
    }

    /// Consumes one pending signal byte, if any, without blocking.
    /// Returns `Ok(true)` if a byte was consumed, `Ok(false)` if the
    /// pipe had nothing to read (spurious wakeup).
    pub fn consume_one(&mut self) -> io::Result<bool> {
        let mut byte = [0u8; 1];
        match self.0.read(&mut byte) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}
