// src/stream.rs
//
// Copyright (c) 2023, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! [`Stream`]: a convenience iterator that automates block rotation around
//! a Buffer, keeping a ring of `nb_blocks` in flight (§4.5).

use crate::buffer::{Block, Buffer};
use crate::error::Result;

/// Drives a fixed ring of Blocks around a Buffer. On RX, `next_block`
/// hands back a filled block each call; on TX, it hands back an empty one
/// to fill before the next call sends it.
pub struct Stream {
    buffer: Buffer,
    blocks: Vec<Block>,
    current: usize,
    started: bool,
    buf_enabled: bool,
    all_enqueued: bool,
}

impl Stream {
    /// Creates `nb_blocks` blocks of `block_size` bytes on `buffer`. The
    /// buffer is not enabled yet — that happens lazily on the first
    /// [`next_block`](Stream::next_block) call that needs it.
    pub fn new(buffer: &Buffer, nb_blocks: usize, block_size: usize) -> Result<Stream> {
        let mut blocks = Vec::with_capacity(nb_blocks);
        for _ in 0..nb_blocks {
            blocks.push(buffer.create_block(block_size)?);
        }
        Ok(Stream {
            buffer: buffer.clone(),
            blocks,
            current: 0,
            started: false,
            buf_enabled: false,
            all_enqueued: false,
        })
    }

    pub fn nb_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Advances the ring by one step, returning the block the application
    /// should now read from (RX) or fill and hand back next time (TX).
    pub fn next_block(&mut self) -> Result<&Block> {
        let n = self.blocks.len();

        if !self.started {
            self.started = true;
            if self.buffer.is_tx() {
                // The application fills block 0 itself; nothing to enqueue
                // or enable until it comes back on the next call.
                return Ok(&self.blocks[0]);
            }
            // Prime the ring: every block but the one about to be handed
            // out starts in flight.
            for block in &self.blocks[1..n] {
                block.enqueue(0, false)?;
            }
            self.all_enqueued = true;
        }

        self.blocks[self.current].enqueue(0, false)?;
        if !self.buf_enabled {
            self.buffer.enable()?;
            self.buf_enabled = true;
        }

        self.current = (self.current + 1) % n;
        if self.all_enqueued {
            self.blocks[self.current].dequeue(false)?;
        }
        else if self.current == 0 {
            self.all_enqueued = true;
        }
        Ok(&self.blocks[self.current])
    }

    /// Stops the buffer's worker and unblocks any in-flight I/O. Dropping
    /// the Stream without calling this still tears down cleanly via the
    /// Buffer/Task's own `Drop` impls, but an explicit cancel lets the
    /// caller observe completion synchronously.
    pub fn cancel(&mut self) -> Result<()> {
        self.buffer.cancel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::{Attr, AttrKind};
    use crate::backend::{AttrTarget, Backend, BufferHandle};
    use crate::channel::{Channel, DataFormat, Direction, Endian, Sign};
    use crate::context::{Context, ContextDescriptor, Version};
    use crate::device::{reorder_channels, Device};
    use crate::error::Error;
    use crate::mask::ChannelsMask;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// A backend that hands back an incrementing byte pattern on every
    /// `readbuf`, just enough to drive a Stream end to end without any
    /// real hardware or transport underneath.
    struct FakeRxBackend {
        sample_size: usize,
        next_fill: AtomicU64,
        seen: Mutex<Vec<Vec<u8>>>,
    }

    impl Backend for FakeRxBackend {
        fn backend_name(&self) -> &str {
            "fake-rx"
        }

        fn describe(&self) -> crate::error::Result<ContextDescriptor> {
            let mut dev = Device::new("iio:device0");
            for (i, id) in ["voltage0", "voltage1"].into_iter().enumerate() {
                let mut chan = Channel::new(id, Direction::Input);
                chan.is_scan_element = true;
                chan.scan_index = i as i32;
                chan.format = DataFormat {
                    endian: Endian::Little,
                    sign: Sign::SignedFull,
                    bits: 16,
                    length: 16,
                    repeat: 1,
                    shift: 0,
                    with_scale: false,
                    scale: 1.0,
                };
                dev.channels.push(chan);
            }
            reorder_channels(&mut dev);
            Ok(ContextDescriptor {
                name: "fake".into(),
                description: String::new(),
                version: Version { major: 0, minor: 1, git_tag: String::new() },
                attrs: Vec::new(),
                devices: vec![dev],
            })
        }

        fn read_attr(&self, _target: &AttrTarget, _attr: &Attr, _dst: &mut [u8]) -> crate::error::Result<usize> {
            Err(Error::Unsupported)
        }

        fn write_attr(&self, _target: &AttrTarget, _attr: &Attr, _data: &[u8]) -> crate::error::Result<usize> {
            Err(Error::Unsupported)
        }

        fn create_buffer(&self, _device_id: &str, _index: u32, _mask: &ChannelsMask) -> crate::error::Result<BufferHandle> {
            Ok(BufferHandle(1))
        }

        fn enable_buffer(&self, _handle: BufferHandle, _nb_samples: usize, _on: bool) -> crate::error::Result<()> {
            Ok(())
        }

        fn cancel_buffer(&self, _handle: BufferHandle) -> crate::error::Result<()> {
            Ok(())
        }

        fn readbuf(&self, _handle: BufferHandle, data: &mut [u8]) -> crate::error::Result<usize> {
            let fill = self.next_fill.fetch_add(1, Ordering::SeqCst) as u8;
            data.fill(fill);
            self.seen.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }
    }

    #[test]
    fn drives_ten_next_block_calls_on_a_four_block_ring() {
        let backend = FakeRxBackend { sample_size: 4, next_fill: AtomicU64::new(0), seen: Mutex::new(Vec::new()) };
        let ctx = Context::from_backend(Box::new(backend)).unwrap();
        let device = ctx.find_device("iio:device0").unwrap();
        let mut mask = ChannelsMask::new(device.channels.len());
        mask.set(0);
        mask.set(1);

        let buffer = ctx.create_buffer("iio:device0", 0, mask).unwrap();
        assert_eq!(buffer.sample_size(), 4);

        let mut stream = Stream::new(&buffer, 4, 1024).unwrap();
        for _ in 0..10 {
            let block = stream.next_block().unwrap();
            assert_eq!(block.size(), 1024);
        }
        stream.cancel().unwrap();
        assert!(!buffer.is_enabled());
    }
}
