// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::io;

use thiserror::Error;

/// Errors surfaced by the wire codec, the dispatcher and the session state machine.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer closed the connection before a complete frame arrived.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// A `read_cstring` call ran past its byte cap without finding a NUL.
    #[error("NUL-terminated string exceeded the {0} byte cap")]
    StringTooLong(usize),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// An unrecognised 3-byte command token was received.
    #[error("invalid command from client")]
    InvalidMessage,

    /// Bad magic, bad options, or some other handshake-level rule violation.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A subscriber-supplied pattern failed to compile.
    #[error("invalid pattern string: {0}")]
    PatternError(String),

    /// A topic or pattern string was not valid ASCII.
    #[error("string is not valid ASCII")]
    EncodingError,

    /// A SUB handshake named an explicit identity that is already registered.
    #[error("subscriber already exists")]
    SubscriberAlreadyExists,

    /// The session missed too many consecutive keepalive probes.
    #[error("insensible client: too many missed keepalives")]
    InsensibleClient,

    /// Something that should be structurally impossible happened.
    #[error("internal fault: {0}")]
    InternalFault(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the errors that leave a SUB/PUB mode-selection handshake
    /// recoverable: the session replies `FAILED\0...\0` and loops back to
    /// read another mode token instead of terminating.
    pub fn is_recoverable_handshake_error(&self) -> bool {
        matches!(self, Error::PatternError(_) | Error::EncodingError)
    }
}
