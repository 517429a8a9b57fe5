// src/buffer.rs
//
// Copyright (c) 2018, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! Buffers and Blocks (§3, §4.5): a Buffer is a streaming endpoint bound to
//! a Device and a channel mask; a Block is a fixed-size region of it, fed
//! to or filled by the backend through the buffer's worker [`Task`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{BufferHandle, MappedBlockHandle};
use crate::channel::{Channel, Direction};
use crate::context::Context;
use crate::device::sample_size;
use crate::error::{Error, Result};
use crate::mask::ChannelsMask;
use crate::task::{Outcome, Task, Token};

/// One unit of work for a buffer's worker task: a heap-block read or write.
/// Carries everything `block_io` needs rather than borrowing the `Buffer`,
/// since the task function only ever sees `&BlockJob`.
enum BlockJob {
    Rx { ctx: Context, handle: BufferHandle, block: Block },
    Tx { ctx: Context, handle: BufferHandle, block: Block },
}

/// The worker function every Buffer's [`Task`] runs. Heap-block path only —
/// mapped blocks are serviced directly by the backend's native
/// enqueue/dequeue and never reach the task queue.
fn block_io(job: &BlockJob) -> i32 {
    match job {
        BlockJob::Rx { ctx, handle, block } => {
            let mut data = block.inner.data.lock().unwrap();
            match ctx.backend().readbuf(*handle, &mut data) {
                Ok(n) => n as i32,
                Err(e) => e.to_errno(),
            }
        }
        BlockJob::Tx { ctx, handle, block } => {
            let bytes_used = block.inner.bytes_used.load(Ordering::SeqCst);
            let result = {
                let data = block.inner.data.lock().unwrap();
                ctx.backend().writebuf(*handle, &data[..bytes_used])
            };
            // Cyclic TX: the ring must stay primed, so re-arm the same
            // block for another round as soon as this write lands.
            if block.inner.cyclic.load(Ordering::SeqCst) {
                block.resubmit_cyclic();
            }
            match result {
                Ok(n) => n as i32,
                Err(e) => e.to_errno(),
            }
        }
    }
}

struct BufferInner {
    ctx: Context,
    device_id: String,
    index: u32,
    mask: ChannelsMask,
    sample_size: usize,
    is_tx: bool,
    handle: BufferHandle,
    block_size: Mutex<usize>,
    nb_blocks: AtomicUsize,
    enabled: AtomicBool,
    task: Task<BlockJob, fn(&BlockJob) -> i32>,
}

/// A streaming endpoint on a Device, parameterised by a channel mask.
/// Cheaply cloned: clones share the same worker task and backend handle.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    pub(crate) fn create(ctx: &Context, device_id: &str, index: u32, mask: ChannelsMask) -> Result<Buffer> {
        let device = ctx
            .find_device(device_id)
            .ok_or_else(|| Error::NotFound(device_id.to_string()))?;
        let size = sample_size(device, &mask)?;
        if size == 0 {
            return Err(Error::BadArgument("zero-channel device has no sample size".into()));
        }
        let is_tx = device
            .channels
            .iter()
            .any(|c| mask.is_set(c.number) && c.direction == Direction::Output);

        let handle = ctx.backend().create_buffer(device_id, index, &mask)?;
        let task = Task::new(block_io as fn(&BlockJob) -> i32, false);

        Ok(Buffer {
            inner: Arc::new(BufferInner {
                ctx: ctx.clone(),
                device_id: device_id.to_string(),
                index,
                mask,
                sample_size: size,
                is_tx,
                handle,
                block_size: Mutex::new(0),
                nb_blocks: AtomicUsize::new(0),
                enabled: AtomicBool::new(false),
                task,
            }),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn index(&self) -> u32 {
        self.inner.index
    }

    pub fn mask(&self) -> &ChannelsMask {
        &self.inner.mask
    }

    pub fn sample_size(&self) -> usize {
        self.inner.sample_size
    }

    pub fn is_tx(&self) -> bool {
        self.inner.is_tx
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn ctx(&self) -> &Context {
        &self.inner.ctx
    }

    pub(crate) fn handle(&self) -> BufferHandle {
        self.inner.handle
    }

    pub(crate) fn task(&self) -> &Task<BlockJob, fn(&BlockJob) -> i32> {
        &self.inner.task
    }

    /// Requests a block of `size` bytes: a mapped block if the backend
    /// implements the fast path, else a heap-allocated one serviced by the
    /// worker task. `block_size` (used by [`enable`](Buffer::enable) to
    /// compute `nb_samples`) grows to the largest block ever created.
    pub fn create_block(&self, size: usize) -> Result<Block> {
        match self.inner.ctx.backend().create_block(self.inner.handle, size) {
            Ok(mapped) => {
                self.grow_block_size(size);
                Ok(Block::new(self.clone(), size, Some(mapped.handle)))
            }
            Err(Error::Unsupported) => {
                self.grow_block_size(size);
                Ok(Block::new(self.clone(), size, None))
            }
            Err(e) => Err(e),
        }
    }

    fn grow_block_size(&self, size: usize) {
        let mut bs = self.inner.block_size.lock().unwrap();
        *bs = (*bs).max(size);
        self.inner.nb_blocks.fetch_add(1, Ordering::SeqCst);
    }

    /// Enables streaming: computes `nb_samples = block_size / sample_size`,
    /// tells the backend, and starts the worker task. `EINVAL` if no block
    /// has been created yet.
    pub fn enable(&self) -> Result<()> {
        if self.inner.nb_blocks.load(Ordering::SeqCst) == 0 {
            return Err(Error::BadArgument("cannot enable a buffer with no blocks".into()));
        }
        if self.inner.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let block_size = *self.inner.block_size.lock().unwrap();
        let nb_samples = block_size / self.inner.sample_size;
        self.inner.ctx.backend().enable_buffer(self.inner.handle, nb_samples, true)?;
        self.inner.task.start();
        self.inner.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Disables streaming; a no-op on an already-quiescent buffer.
    pub fn disable(&self) -> Result<()> {
        if !self.inner.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.ctx.backend().enable_buffer(self.inner.handle, 0, false)?;
        self.inner.task.stop();
        self.inner.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stops the worker, tells the backend to unblock any in-flight I/O,
    /// and flushes pending tokens. A no-op on a never-enabled buffer.
    pub fn cancel(&self) -> Result<()> {
        if !self.inner.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.ctx.backend().cancel_buffer(self.inner.handle)?;
        self.inner.task.stop();
        self.inner.task.flush();
        self.inner.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct BlockInner {
    buffer: Buffer,
    data: Mutex<Vec<u8>>,
    size: usize,
    bytes_used: AtomicUsize,
    cyclic: AtomicBool,
    token: Mutex<Option<Token>>,
    mapped: Option<MappedBlockHandle>,
}

/// A fixed-size byte region bound to exactly one Buffer. Cheaply cloned:
/// clones share the same backing memory and outstanding token.
#[derive(Clone)]
pub struct Block {
    inner: Arc<BlockInner>,
}

impl Block {
    fn new(buffer: Buffer, size: usize, mapped: Option<MappedBlockHandle>) -> Self {
        Block {
            inner: Arc::new(BlockInner {
                buffer,
                data: Mutex::new(vec![0u8; size]),
                size,
                bytes_used: AtomicUsize::new(size),
                cyclic: AtomicBool::new(false),
                token: Mutex::new(None),
                mapped,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn bytes_used(&self) -> usize {
        self.inner.bytes_used.load(Ordering::SeqCst)
    }

    pub fn is_cyclic(&self) -> bool {
        self.inner.cyclic.load(Ordering::SeqCst)
    }

    /// Copies `src` into the block's backing memory ahead of a TX enqueue.
    /// Panics if `src` is longer than the block.
    pub fn fill(&self, src: &[u8]) {
        let mut data = self.inner.data.lock().unwrap();
        data[..src.len()].copy_from_slice(src);
    }

    /// Reads the filled portion of an RX block.
    pub fn data(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.inner.data.lock().unwrap()
    }

    /// Submits the block for I/O. `bytes_used == 0` means "the whole
    /// block". Fails [`Error::Busy`] if a token is already outstanding.
    pub fn enqueue(&self, bytes_used: usize, cyclic: bool) -> Result<()> {
        if !self.inner.buffer.is_tx() && cyclic {
            // Cyclic is a TX-only mode; on RX it's Permission, matching
            // the reference crate's write-protection error for misused
            // direction flags.
            return Err(Error::Permission);
        }

        let mut token_guard = self.inner.token.lock().unwrap();
        if token_guard.is_some() {
            return Err(Error::Busy);
        }
        let bytes_used = if bytes_used == 0 { self.inner.size } else { bytes_used };
        self.inner.bytes_used.store(bytes_used, Ordering::SeqCst);
        self.inner.cyclic.store(cyclic, Ordering::SeqCst);

        if let Some(mapped) = self.inner.mapped {
            self.inner.buffer.ctx().backend().enqueue_block(mapped, bytes_used, cyclic)?;
            return Ok(());
        }

        let job = self.job();
        let token = self.inner.buffer.task().enqueue(job)?;
        *token_guard = Some(token);
        Ok(())
    }

    fn job(&self) -> BlockJob {
        let buffer = &self.inner.buffer;
        if buffer.is_tx() {
            BlockJob::Tx { ctx: buffer.ctx().clone(), handle: buffer.handle(), block: self.clone() }
        }
        else {
            BlockJob::Rx { ctx: buffer.ctx().clone(), handle: buffer.handle(), block: self.clone() }
        }
    }

    /// Re-arms the same block for another cyclic round without going
    /// through the application-facing busy check in [`enqueue`](Block::enqueue):
    /// this is the worker re-priming its own ring, not a second caller.
    fn resubmit_cyclic(&self) {
        let job = self.job();
        if let Ok(token) = self.inner.buffer.task().enqueue_autoclear(job) {
            *self.inner.token.lock().unwrap() = Some(token);
        }
    }

    /// Waits for the outstanding token. `nonblock` polls for completion
    /// without consuming the token: a not-yet-done job surfaces
    /// [`Error::Busy`] but stays queued, untouched, for a later `dequeue`.
    pub fn dequeue(&self, nonblock: bool) -> Result<usize> {
        if let Some(mapped) = self.inner.mapped {
            return self.inner.buffer.ctx().backend().dequeue_block(mapped, nonblock);
        }

        let outcome = if nonblock {
            let mut guard = self.inner.token.lock().unwrap();
            let token = guard.ok_or(Error::Permission)?;
            match self.inner.buffer.task().poll(token) {
                Some(outcome) => {
                    *guard = None;
                    outcome
                }
                None => return Err(Error::Busy),
            }
        }
        else {
            let token = {
                let mut guard = self.inner.token.lock().unwrap();
                guard.take().ok_or(Error::Permission)?
            };
            self.inner.buffer.task().sync(token, None)?
        };
        match outcome {
            Outcome::Done(n) if n >= 0 => Ok(n as usize),
            Outcome::Done(n) => Err(Error::from_errno(n)),
            Outcome::Cancelled | Outcome::Interrupted => Err(Error::Cancelled),
        }
    }

    /// Walks the block's filled window, invoking `cb(channel, bytes)` for
    /// every channel present in both the buffer's mask and `user_mask`
    /// (§4.5 `block_foreach_sample`).
    pub fn foreach_sample<F>(&self, user_mask: &ChannelsMask, mut cb: F) -> Result<i32>
    where
        F: FnMut(&Channel, &[u8]) -> i32,
    {
        let ctx = self.inner.buffer.ctx();
        let device = ctx
            .find_device(self.inner.buffer.device_id())
            .ok_or_else(|| Error::NotFound(self.inner.buffer.device_id().to_string()))?;
        let data = self.inner.data.lock().unwrap();
        let hw_mask = self.inner.buffer.mask();
        Ok(crate::device::foreach_sample(device, hw_mask, user_mask, |chan, offset, len| {
            cb(chan, &data[offset..offset + len])
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AttrTarget, Backend};
    use crate::channel::{DataFormat, Direction, Endian, Sign};
    use crate::context::{Context, ContextDescriptor, Version};
    use crate::device::{reorder_channels, Device};
    use std::sync::Condvar;

    /// Shared gate a `GatedRxBackend`'s `readbuf` blocks on, kept outside
    /// the backend itself so the test retains a handle to it after the
    /// backend is boxed into a `Context`.
    struct Gate {
        gate: Mutex<bool>,
        started: Mutex<bool>,
        cv: Condvar,
    }

    impl Gate {
        fn new() -> Arc<Self> {
            Arc::new(Gate { gate: Mutex::new(false), started: Mutex::new(false), cv: Condvar::new() })
        }

        fn wait_until_started(&self) {
            let mut started = self.started.lock().unwrap();
            while !*started {
                started = self.cv.wait(started).unwrap();
            }
        }

        fn release(&self) {
            *self.gate.lock().unwrap() = true;
            self.cv.notify_all();
        }
    }

    /// A backend whose `readbuf` blocks until the test releases its `Gate`,
    /// so a `dequeue(true)` can be observed against a job that is
    /// deliberately still in flight.
    struct GatedRxBackend {
        gate: Arc<Gate>,
    }

    impl Backend for GatedRxBackend {
        fn backend_name(&self) -> &str {
            "gated-rx"
        }

        fn describe(&self) -> Result<ContextDescriptor> {
            let mut dev = Device::new("iio:device0");
            let mut chan = Channel::new("voltage0", Direction::Input);
            chan.is_scan_element = true;
            chan.scan_index = 0;
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
            reorder_channels(&mut dev);
            Ok(ContextDescriptor {
                name: "fake".into(),
                description: String::new(),
                version: Version { major: 0, minor: 1, git_tag: String::new() },
                attrs: Vec::new(),
                devices: vec![dev],
            })
        }

        fn read_attr(&self, _target: &AttrTarget, _attr: &crate::attr::Attr, _dst: &mut [u8]) -> Result<usize> {
            Err(Error::Unsupported)
        }

        fn write_attr(&self, _target: &AttrTarget, _attr: &crate::attr::Attr, _data: &[u8]) -> Result<usize> {
            Err(Error::Unsupported)
        }

        fn create_buffer(&self, _device_id: &str, _index: u32, _mask: &ChannelsMask) -> Result<BufferHandle> {
            Ok(BufferHandle(1))
        }

        fn enable_buffer(&self, _handle: BufferHandle, _nb_samples: usize, _on: bool) -> Result<()> {
            Ok(())
        }

        fn cancel_buffer(&self, _handle: BufferHandle) -> Result<()> {
            Ok(())
        }

        fn readbuf(&self, _handle: BufferHandle, data: &mut [u8]) -> Result<usize> {
            {
                let mut started = self.gate.started.lock().unwrap();
                *started = true;
                self.gate.cv.notify_all();
            }
            let mut gate = self.gate.gate.lock().unwrap();
            while !*gate {
                gate = self.gate.cv.wait(gate).unwrap();
            }
            data.fill(0xab);
            Ok(data.len())
        }
    }

    #[test]
    fn nonblock_dequeue_on_pending_job_leaves_it_queued() {
        let gate = Gate::new();
        let ctx = Context::from_backend(Box::new(GatedRxBackend { gate: Arc::clone(&gate) })).unwrap();
        let device = ctx.find_device("iio:device0").unwrap();
        let mut mask = ChannelsMask::new(device.channels.len());
        mask.set(0);

        let buffer = ctx.create_buffer("iio:device0", 0, mask).unwrap();
        let block = buffer.create_block(1024).unwrap();
        buffer.enable().unwrap();
        block.enqueue(0, false).unwrap();

        gate.wait_until_started();
        assert!(matches!(block.dequeue(true), Err(Error::Busy)));
        // Token must still be outstanding: a second nonblock poll still
        // reports Busy rather than Permission, which would mean the first
        // poll had already destroyed the token.
        assert!(matches!(block.dequeue(true), Err(Error::Busy)));

        gate.release();
        let n = block.dequeue(false).unwrap();
        assert_eq!(n, 1024);
    }
}
