// src/iiod/codec.rs
//
// Copyright (c) 2023, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! Line framing for the IIOD wire protocol (§4.4): request-line builders
//! and the handful of reply shapes (bare integer, version, length-prefixed
//! payload) every command reduces to.

use std::io::{BufRead, Read, Write};

use crate::error::{Error, Result};
use crate::mask::ChannelsMask;

/// Builds a request line: `<cmd>[ <args>]\r\n`.
fn request(cmd: &str, args: &[&str]) -> String {
    if args.is_empty() {
        format!("{cmd}\r\n")
    }
    else {
        format!("{cmd} {}\r\n", args.join(" "))
    }
}

pub fn version() -> String {
    request("VERSION", &[])
}

pub fn print() -> String {
    request("PRINT", &[])
}

pub fn timeout(ms: u64) -> String {
    let ms = ms.to_string();
    request("TIMEOUT", &[&ms])
}

pub fn open(dev_id: &str, mask: &ChannelsMask, cyclic: bool) -> String {
    let cnt = mask.width().to_string();
    let hex = mask.to_hex();
    let cyclic = if cyclic { "1" } else { "0" };
    request("OPEN", &[dev_id, &cnt, &hex, cyclic])
}

pub fn close(dev_id: &str) -> String {
    request("CLOSE", &[dev_id])
}

pub fn readbuf(dev_id: &str, nbytes: usize) -> String {
    let n = nbytes.to_string();
    request("READBUF", &[dev_id, &n])
}

pub fn writebuf(dev_id: &str, nbytes: usize) -> String {
    let n = nbytes.to_string();
    request("WRITEBUF", &[dev_id, &n])
}

/// Which entity a `READ`/`WRITE` command addresses, as the four argument
/// shapes the protocol distinguishes.
pub enum AttrAddr<'a> {
    Device { dev_id: &'a str },
    Debug { dev_id: &'a str },
    Buffer { dev_id: &'a str, buf_id: u32 },
    Channel { dev_id: &'a str, channel_id: &'a str, is_output: bool },
}

fn addr_args(addr: &AttrAddr, attr_name: &str) -> Vec<String> {
    match addr {
        AttrAddr::Device { dev_id } => vec![dev_id.to_string(), attr_name.to_string()],
        AttrAddr::Debug { dev_id } => vec![dev_id.to_string(), "debug".to_string(), attr_name.to_string()],
        AttrAddr::Buffer { dev_id, buf_id } => {
            vec![dev_id.to_string(), "buffer".to_string(), buf_id.to_string(), attr_name.to_string()]
        }
        AttrAddr::Channel { dev_id, channel_id, is_output } => {
            let dir = if *is_output { "OUTPUT" } else { "INPUT" };
            vec![dev_id.to_string(), dir.to_string(), channel_id.to_string(), attr_name.to_string()]
        }
    }
}

pub fn read_attr(addr: &AttrAddr, attr_name: &str) -> String {
    let args = addr_args(addr, attr_name);
    let refs: Vec<&str> = args.iter().map(String::as_str).collect();
    request("READ", &refs)
}

/// Builds the `WRITE` request line; the attribute payload follows as raw
/// bytes with no extra framing (the line's trailing arg is its length).
pub fn write_attr(addr: &AttrAddr, attr_name: &str, data: &[u8]) -> String {
    let mut args = addr_args(addr, attr_name);
    args.push(data.len().to_string());
    let refs: Vec<&str> = args.iter().map(String::as_str).collect();
    request("WRITE", &refs)
}

pub fn gettrig(dev_id: &str) -> String {
    request("GETTRIG", &[dev_id])
}

pub fn settrig(dev_id: &str, trigger_id: Option<&str>) -> String {
    match trigger_id {
        Some(id) => request("SETTRIG", &[dev_id, id]),
        None => request("SETTRIG", &[dev_id]),
    }
}

pub fn set_buffers_count(dev_id: &str, n: u32) -> String {
    let n = n.to_string();
    request("SET BUFFERS_COUNT", &[dev_id, &n])
}

pub fn exit() -> String {
    request("EXIT", &[])
}

/// Reads one reply line, tolerating a run of empty lines ahead of it — the
/// permissiveness the original client's integer-reply reader keeps for
/// servers that send stray newlines (§9 Open Questions).
fn read_nonblank_line<R: BufRead>(r: &mut R) -> Result<String> {
    loop {
        let mut line = String::new();
        let n = r.read_line(&mut line)?;
        if n == 0 {
            return Err(Error::Broken);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
}

/// Reads a bare integer reply line (every command's primary ack/result).
pub fn read_integer_reply<R: BufRead>(r: &mut R) -> Result<i64> {
    let line = read_nonblank_line(r)?;
    line.split_whitespace()
        .next()
        .and_then(|tok| tok.parse::<i64>().ok())
        .ok_or_else(|| Error::Malformed(format!("expected integer reply, got {line:?}")))
}

/// Checks an integer reply for the negative-errno convention, returning the
/// non-negative value on success.
pub fn check_reply(n: i64) -> Result<i64> {
    if n < 0 {
        Err(Error::from_errno(n as i32))
    }
    else {
        Ok(n)
    }
}

/// Parses the `VERSION` reply: `major.minor <8-hex git-tag>`.
pub fn parse_version_reply(line: &str) -> Result<(u32, u32, String)> {
    let bad = || Error::Malformed(format!("bad VERSION reply {line:?}"));
    let mut parts = line.split_whitespace();
    let ver = parts.next().ok_or_else(bad)?;
    let tag = parts.next().ok_or_else(bad)?;
    let (major, minor) = ver.split_once('.').ok_or_else(bad)?;
    Ok((
        major.parse().map_err(|_| bad())?,
        minor.parse().map_err(|_| bad())?,
        tag.to_string(),
    ))
}

pub fn read_version_reply<R: BufRead>(r: &mut R) -> Result<(u32, u32, String)> {
    let line = read_nonblank_line(r)?;
    parse_version_reply(&line)
}

/// Reads exactly `n` bytes of a length-prefixed payload (XML dump, attribute
/// value, sample data).
pub fn read_payload<R: Read>(r: &mut R, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Reads a fixed-width hex channel mask, as sent once at the start of every
/// non-empty `READBUF` reply.
pub fn read_mask<R: Read>(r: &mut R, width: usize) -> Result<ChannelsMask> {
    let nwords = if width == 0 { 0 } else { (width + 31) / 32 };
    let mut buf = vec![0u8; nwords * 8];
    r.read_exact(&mut buf)?;
    let s = String::from_utf8(buf).map_err(|_| Error::Malformed("non-UTF8 mask".into()))?;
    ChannelsMask::from_hex(&s, width)
}

pub fn write_request<W: Write>(w: &mut W, line: &str) -> Result<()> {
    w.write_all(line.as_bytes())?;
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_request_embeds_hex_mask() {
        let mut mask = ChannelsMask::new(33);
        mask.set(0);
        mask.set(32);
        let line = open("iio:device0", &mask, false);
        assert_eq!(line, "OPEN iio:device0 33 0000000100000001 0\r\n");
    }

    #[test]
    fn integer_reply_skips_blank_lines() {
        let data = b"\n\n42\n";
        let mut cursor = std::io::Cursor::new(&data[..]);
        assert_eq!(read_integer_reply(&mut cursor).unwrap(), 42);
    }

    #[test]
    fn negative_reply_maps_to_typed_error() {
        assert!(check_reply(-2).is_err());
        assert_eq!(check_reply(7).unwrap(), 7);
    }

    #[test]
    fn version_reply_parses_tag() {
        assert_eq!(
            parse_version_reply("0.32 deadbeef").unwrap(),
            (0, 32, "deadbeef".to_string())
        );
    }

    #[test]
    fn read_attr_channel_request_shape() {
        let line = read_attr(
            &AttrAddr::Channel { dev_id: "iio:device0", channel_id: "voltage0", is_output: false },
            "raw",
        );
        assert_eq!(line, "READ iio:device0 INPUT voltage0 raw\r\n");
    }
}
