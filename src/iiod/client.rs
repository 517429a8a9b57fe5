// src/iiod/client.rs
//
// Copyright (c) 2023, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! The IIOD client state machine (§4.4): one request at a time over a
//! duplex byte stream, with the `WRITEBUF` deferred-ack flag the protocol
//! requires (the second integer of a write may be read lazily, at the
//! start of the connection's next I/O, to halve round-trip latency).

use std::io::{BufReader, Read, Write};

use super::codec::{self, AttrAddr};
use crate::error::{Error, Result};
use crate::mask::ChannelsMask;

/// Wraps a duplex stream (TCP socket, USB control pipe, serial port) in the
/// IIOD request/reply protocol. Not `Sync` by itself — callers serialize
/// access with their own mutex, exactly as the object model's Context
/// mutex serializes control-plane calls (§5).
pub struct IiodClient<S> {
    reader: BufReader<S>,
    /// Bytes-written count from a prior `WRITEBUF`, not yet read because the
    /// caller moved on to the next command (§4.4 deferred-ack).
    pending_write_ack: Option<i64>,
}

impl<S: Read + Write> IiodClient<S> {
    pub fn new(stream: S) -> Self {
        IiodClient { reader: BufReader::new(stream), pending_write_ack: None }
    }

    fn send(&mut self, line: &str) -> Result<()> {
        self.drain_pending_ack()?;
        codec::write_request(self.reader.get_mut(), line)
    }

    /// Reads off a deferred `WRITEBUF` ack left over from a previous call,
    /// if any, before issuing a new command on the same sub-stream.
    fn drain_pending_ack(&mut self) -> Result<()> {
        if let Some(n) = self.pending_write_ack.take() {
            codec::check_reply(n)?;
        }
        Ok(())
    }

    pub fn version(&mut self) -> Result<(u32, u32, String)> {
        self.send(&codec::version())?;
        codec::read_version_reply(&mut self.reader)
    }

    pub fn print_xml(&mut self) -> Result<String> {
        self.send(&codec::print())?;
        let n = codec::check_reply(codec::read_integer_reply(&mut self.reader)?)?;
        let bytes = codec::read_payload(&mut self.reader, n as usize)?;
        String::from_utf8(bytes).map_err(|_| Error::Malformed("PRINT reply was not valid UTF-8".into()))
    }

    pub fn set_timeout(&mut self, ms: u64) -> Result<()> {
        self.send(&codec::timeout(ms))?;
        codec::check_reply(codec::read_integer_reply(&mut self.reader)?)?;
        Ok(())
    }

    pub fn open(&mut self, dev_id: &str, mask: &ChannelsMask, cyclic: bool) -> Result<()> {
        self.send(&codec::open(dev_id, mask, cyclic))?;
        codec::check_reply(codec::read_integer_reply(&mut self.reader)?)?;
        Ok(())
    }

    pub fn close(&mut self, dev_id: &str) -> Result<()> {
        self.send(&codec::close(dev_id))?;
        codec::check_reply(codec::read_integer_reply(&mut self.reader)?)?;
        Ok(())
    }

    pub fn read_attr(&mut self, addr: &AttrAddr, attr_name: &str, dst: &mut [u8]) -> Result<usize> {
        self.send(&codec::read_attr(addr, attr_name))?;
        let n = codec::check_reply(codec::read_integer_reply(&mut self.reader)?)? as usize;
        let bytes = codec::read_payload(&mut self.reader, n)?;
        if bytes.len() > dst.len() {
            return Err(Error::BadArgument("attribute value too large for buffer".into()));
        }
        dst[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    pub fn write_attr(&mut self, addr: &AttrAddr, attr_name: &str, data: &[u8]) -> Result<usize> {
        self.send(&codec::write_attr(addr, attr_name, data))?;
        self.reader.get_mut().write_all(data)?;
        self.reader.get_mut().flush()?;
        let n = codec::check_reply(codec::read_integer_reply(&mut self.reader)?)?;
        Ok(n as usize)
    }

    pub fn get_trigger(&mut self, dev_id: &str) -> Result<Option<String>> {
        self.send(&codec::gettrig(dev_id))?;
        let n = codec::check_reply(codec::read_integer_reply(&mut self.reader)?)?;
        if n == 0 {
            return Ok(None);
        }
        let bytes = codec::read_payload(&mut self.reader, n as usize)?;
        Ok(Some(String::from_utf8(bytes).map_err(|_| Error::Malformed("GETTRIG reply was not valid UTF-8".into()))?))
    }

    pub fn set_trigger(&mut self, dev_id: &str, trigger_id: Option<&str>) -> Result<()> {
        self.send(&codec::settrig(dev_id, trigger_id))?;
        codec::check_reply(codec::read_integer_reply(&mut self.reader)?)?;
        Ok(())
    }

    pub fn set_buffers_count(&mut self, dev_id: &str, n: u32) -> Result<()> {
        self.send(&codec::set_buffers_count(dev_id, n))?;
        codec::check_reply(codec::read_integer_reply(&mut self.reader)?)?;
        Ok(())
    }

    /// `mask_width` is the device's channel count, needed to size the fixed
    /// hex mask the server sends ahead of the sample payload.
    pub fn read_buf(&mut self, dev_id: &str, nbytes: usize, mask_width: usize) -> Result<(ChannelsMask, Vec<u8>)> {
        self.send(&codec::readbuf(dev_id, nbytes))?;
        let n = codec::check_reply(codec::read_integer_reply(&mut self.reader)?)?;
        if n == 0 {
            return Ok((ChannelsMask::new(mask_width), Vec::new()));
        }
        let mask = codec::read_mask(&mut self.reader, mask_width)?;
        let data = codec::read_payload(&mut self.reader, n as usize)?;
        Ok((mask, data))
    }

    /// Issues `WRITEBUF`, reads the open ack, writes the payload, then
    /// defers reading the bytes-written ack until the next call on this
    /// client drains it (§4.4's latency-halving optimisation).
    pub fn write_buf(&mut self, dev_id: &str, data: &[u8]) -> Result<()> {
        self.send(&codec::writebuf(dev_id, data.len()))?;
        codec::check_reply(codec::read_integer_reply(&mut self.reader)?)?;
        self.reader.get_mut().write_all(data)?;
        self.reader.get_mut().flush()?;
        let n = codec::read_integer_reply(&mut self.reader)?;
        self.pending_write_ack = Some(n);
        Ok(())
    }

    pub fn exit(&mut self) -> Result<()> {
        codec::write_request(self.reader.get_mut(), &codec::exit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// An in-memory duplex stream: writes go nowhere, reads come from a
    /// canned server-reply script. Enough to exercise the client's framing
    /// without a real socket.
    struct ScriptedStream {
        replies: Cursor<Vec<u8>>,
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.replies.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn version_round_trips_through_the_wire_format() {
        let stream = ScriptedStream { replies: Cursor::new(b"0.32 deadbeef\n".to_vec()) };
        let mut client = IiodClient::new(stream);
        assert_eq!(client.version().unwrap(), (0, 32, "deadbeef".to_string()));
    }

    #[test]
    fn read_attr_parses_length_prefixed_payload() {
        let stream = ScriptedStream { replies: Cursor::new(b"2\n42\n".to_vec()) };
        let mut client = IiodClient::new(stream);
        let mut dst = [0u8; 16];
        let n = client
            .read_attr(&AttrAddr::Device { dev_id: "iio:device0" }, "foo", &mut dst)
            .unwrap();
        assert_eq!(&dst[..n], b"42");
    }

    #[test]
    fn write_buf_defers_the_second_ack_until_next_call() {
        // WRITEBUF ack (0), then bytes-written ack (4), then a TIMEOUT ack.
        let stream = ScriptedStream { replies: Cursor::new(b"0\n4\n0\n".to_vec()) };
        let mut client = IiodClient::new(stream);
        client.write_buf("iio:device0", &[1, 2, 3, 4]).unwrap();
        assert!(client.pending_write_ack.is_some());
        client.set_timeout(1000).unwrap();
        assert!(client.pending_write_ack.is_none());
    }

    #[test]
    fn negative_reply_surfaces_as_typed_error() {
        let stream = ScriptedStream { replies: Cursor::new(b"-2\n".to_vec()) };
        let mut client = IiodClient::new(stream);
        assert!(client.close("iio:device0").is_err());
    }
}
