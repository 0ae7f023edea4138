// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! Fixed-width big-endian integers, length-prefixed blobs and
//! NUL-terminated ASCII strings, read from and written to a byte stream.
//!
//! These functions are generic over `Read`/`Write` so the same codec is
//! exercised by unit tests against an in-memory buffer and by live
//! sessions against a socket (see `session::BlockingIo`).

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Default cap on `read_cstring`, per spec §4.1/§9: unbounded allocation
/// from a malicious or broken peer is not acceptable.
pub const DEFAULT_MAX_CSTRING_LEN: usize = 64 * 1024;

/// Reads exactly `n` bytes or fails with `Error::UnexpectedEof`.
///
/// A partial read never escapes this function: on short-read EOF the
/// bytes already read are discarded along with the error.
pub fn read_exact<R: Read>(r: &mut R, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        let read = r.read(&mut buf[filled..])?;
        if read == 0 {
            return Err(Error::UnexpectedEof);
        }
        filled += read;
    }
    Ok(buf)
}

/// Reads bytes up to a NUL terminator (excluded from the result) or the
/// given byte cap, whichever comes first. `max_bytes = None` disables
/// the cap.
pub fn read_cstring<R: Read>(r: &mut R, max_bytes: Option<usize>) -> Result<Vec<u8>> {
    let cap = max_bytes.unwrap_or(DEFAULT_MAX_CSTRING_LEN);
    let mut out = Vec::new();
    loop {
        let byte = read_exact(r, 1)?[0];
        if byte == 0 {
            return Ok(out);
        }
        out.push(byte);
        if out.len() >= cap {
            return Err(Error::StringTooLong(cap));
        }
    }
}

/// Writes the full buffer or fails with `Error::Io`.
pub fn write_all<W: Write>(w: &mut W, bytes: &[u8]) -> Result<()> {
    w.write_all(bytes).map_err(Error::Io)
}

pub fn read_u32_be<R: Read>(r: &mut R) -> Result<u32> {
    let bytes = read_exact(r, 4)?;
    Ok((&bytes[..]).read_u32::<BigEndian>()?)
}

pub fn read_u64_be<R: Read>(r: &mut R) -> Result<u64> {
    let bytes = read_exact(r, 8)?;
    Ok((&bytes[..]).read_u64::<BigEndian>()?)
}

pub fn write_u64_be<W: Write>(w: &mut W, value: u64) -> Result<()> {
    let mut buf = [0u8; 8];
    (&mut buf[..]).write_u64::<BigEndian>(value)?;
    write_all(w, &buf)
}

/// Decodes an ASCII string, mapping any non-ASCII content to
/// `Error::EncodingError` per spec §6.1.
pub fn decode_ascii(bytes: Vec<u8>) -> Result<String> {
    if !bytes.is_ascii() {
        return Err(Error::EncodingError);
    }
    // SAFETY-free: `is_ascii` already guarantees valid UTF-8 content.
    Ok(String::from_utf8(bytes).map_err(|_| Error::EncodingError)?)
}

/// Produces the wire bytes for the 32-bit protocol version field: the
/// sender's host-to-network transform of the integer value. On a
/// little-endian host this yields the literal bytes for `1` as
/// `{0x01,0x00,0x00,0x00}`, matching spec §4.1.
pub fn encode_protocol_version(version: u32) -> [u8; 4] {
    version.to_le_bytes()
}

/// Inverse of [`encode_protocol_version`]: interprets the four raw wire
/// bytes the same way the sender produced them (host order on a
/// little-endian host).
pub fn decode_protocol_version(bytes: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*bytes)
}

pub(crate) fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}
