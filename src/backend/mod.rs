// src/backend/mod.rs
//
// Copyright (c) 2018, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! The polymorphic operation table every backend implements. This replaces
//! C++-style inheritance: a new backend is one [`Backend`] impl plus a
//! registration in [`crate::uri::open`]; operations a backend does not
//! support simply keep the trait's default [`Error::Unsupported`].

use crate::attr::Attr;
use crate::context::ContextDescriptor;
use crate::error::{Error, Result};
use crate::event::ChannelEvent;
use crate::mask::ChannelsMask;

#[cfg(feature = "local")]
pub mod local;
#[cfg(feature = "network")]
pub mod network;
#[cfg(feature = "usb")]
pub mod usb;
#[cfg(feature = "serial")]
pub mod serial;
#[cfg(feature = "xml")]
pub mod xml;

/// Which entity an attribute operation targets.
#[derive(Debug, Clone)]
pub enum AttrTarget<'a> {
    Context,
    Device { device_id: &'a str },
    Debug { device_id: &'a str },
    Buffer { device_id: &'a str, buffer_index: u32 },
    Channel { device_id: &'a str, channel_id: &'a str, is_output: bool },
}

/// An opaque, backend-assigned handle to an open buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// An opaque, backend-assigned handle to a DMA-mapped block. Not used by
/// backends that only support the heap-block fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappedBlockHandle(pub u64);

/// A mapped block's backing memory, handed to the core by
/// [`Backend::create_block`] on the fast path.
pub struct MappedBlock {
    pub handle: MappedBlockHandle,
    pub data: *mut u8,
    pub size: usize,
}

// SAFETY: the pointer refers to a DMA region whose lifetime is owned by the
// backend and is only ever touched while the block is between enqueue and
// dequeue, per the "hand-off owned" policy in the concurrency model.
unsafe impl Send for MappedBlock {}

/// The per-backend operation table. Every method defaults to
/// [`Error::Unsupported`] (`ENOSYS`), matching the C union's "absent
/// operation" default; a backend overrides only what it implements.
pub trait Backend: Send + Sync {
    /// A short backend name ("local", "network", "usb", "serial", "xml").
    fn backend_name(&self) -> &str;

    /// Enumerates the context this backend instance was opened against.
    fn describe(&self) -> Result<ContextDescriptor>;

    /// Re-opens an equivalent backend instance (`iio_context_clone`).
    fn clone_backend(&self) -> Result<Box<dyn Backend>> {
        Err(Error::Unsupported)
    }

    fn set_timeout(&self, _ms: u64) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn get_trigger(&self, _device_id: &str) -> Result<Option<String>> {
        Err(Error::Unsupported)
    }

    fn set_trigger(&self, _device_id: &str, _trigger_id: Option<&str>) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Reads a raw attribute value. Returns the number of bytes written
    /// into `dst` (including a trailing NUL the caller should strip), or an
    /// error. A backend may report more bytes available than `dst.len()`
    /// as an overflow error; it is not required to partially fill `dst`.
    fn read_attr(&self, target: &AttrTarget, attr: &Attr, dst: &mut [u8]) -> Result<usize>;

    /// Writes a raw attribute value, returning the number of bytes
    /// consumed. Context attributes are always [`Error::Permission`].
    fn write_attr(&self, target: &AttrTarget, attr: &Attr, data: &[u8]) -> Result<usize>;

    fn set_kernel_buffers_count(&self, _device_id: &str, _n: u32) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn create_buffer(&self, _device_id: &str, _index: u32, _mask: &ChannelsMask) -> Result<BufferHandle> {
        Err(Error::Unsupported)
    }

    fn free_buffer(&self, _handle: BufferHandle) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn enable_buffer(&self, _handle: BufferHandle, _nb_samples: usize, _on: bool) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn cancel_buffer(&self, _handle: BufferHandle) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Blocking read of up to `data.len()` bytes; cancellable via
    /// [`cancel_buffer`](Backend::cancel_buffer) from another thread.
    fn readbuf(&self, _handle: BufferHandle, _data: &mut [u8]) -> Result<usize> {
        Err(Error::Unsupported)
    }

    fn writebuf(&self, _handle: BufferHandle, _data: &[u8]) -> Result<usize> {
        Err(Error::Unsupported)
    }

    /// Fast path: request a DMA-mapped block. The default returns
    /// [`Error::Unsupported`], which tells the core to fall back to a
    /// heap-allocated block serviced by [`readbuf`](Backend::readbuf)/
    /// [`writebuf`](Backend::writebuf) on the buffer's worker task.
    fn create_block(&self, _handle: BufferHandle, _size: usize) -> Result<MappedBlock> {
        Err(Error::Unsupported)
    }

    fn free_block(&self, _block: MappedBlockHandle) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn enqueue_block(&self, _block: MappedBlockHandle, _bytes_used: usize, _cyclic: bool) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn dequeue_block(&self, _block: MappedBlockHandle, _nonblock: bool) -> Result<usize> {
        Err(Error::Unsupported)
    }

    fn open_ev(&self, _device_id: &str) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn close_ev(&self, _device_id: &str) -> Result<()> {
        Err(Error::Unsupported)
    }

    fn read_ev(&self, _device_id: &str) -> Result<ChannelEvent> {
        Err(Error::Unsupported)
    }
}

/// Metadata returned by a scan: one entry per context a backend can see
/// without opening it (used by [`crate::context::ScanContext`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextInfo {
    pub uri: String,
    pub description: String,
}

/// A backend that can enumerate reachable contexts before one is opened
/// (local: always one; network: DNS-SD; usb: bus scan).
pub trait Scannable {
    fn scan(&self) -> Result<Vec<ContextInfo>>;
}
