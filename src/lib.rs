// src/lib.rs
//
// Copyright (c) 2018, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! A from-scratch, backend-pluggable implementation of the Linux
//! Industrial I/O (IIO) object model: contexts, devices, channels,
//! attributes, buffers, and triggers, addressable over a local sysfs/chardev
//! backend, the IIOD network and serial protocol, IIOD-over-USB, or a
//! static XML snapshot.
//!
//! Start from a URI with [`uri::open`]:
//!
//! ```no_run
//! # fn main() -> riio::error::Result<()> {
//! let ctx = riio::uri::open("local:")?;
//! for device in ctx.devices() {
//!     println!("{}", device.name.as_deref().unwrap_or(&device.id));
//! }
//! # Ok(()) }
//! ```

pub mod attr;
pub mod backend;
pub mod buffer;
pub mod channel;
pub mod context;
pub mod device;
#[cfg(feature = "discovery")]
pub mod discovery;
pub mod error;
pub mod event;
pub mod iiod;
pub mod mask;
pub mod stream;
pub mod task;
pub mod uri;
#[cfg(feature = "xml")]
pub mod xmlcodec;

pub use attr::{Attr, AttrKind, AttrList};
pub use buffer::{Block, Buffer};
pub use channel::{Channel, DataFormat, Direction};
pub use context::{Context, ContextDescriptor, ScanContext, Version};
pub use device::Device;
pub use error::{Error, Result};
pub use event::{ChannelEvent, EventStream};
pub use mask::ChannelsMask;
pub use stream::Stream;

/// The crate's own version, as `(major, minor, git describe)` — the same
/// triple shape the IIOD `VERSION` command and the XML context header
/// report for a remote library.
pub fn library_version() -> (u32, u32, String) {
    let major: u32 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor: u32 = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    (major, minor, option_env!("GIT_TAG").unwrap_or("unknown").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_consistent_across_calls() {
        assert_eq!(library_version(), library_version());
    }
}
