// src/event.rs
//
// Copyright (c) 2023, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! Device event channels (`open_ev`/`close_ev`/`read_ev` on the backend
//! v-table), decoding the kernel IIO ABI's packed 64-bit event code.
//!
//! Only the tag fields are decoded; no physical meaning is attached to an
//! event's kind or direction (the library does not model sensor physics).

use crate::context::Context;
use crate::error::Result;

/// The kind of condition an event reports (threshold crossed, magnitude,
/// roc, …). Kept numeric, matching [`crate::channel::ChannelKind`]'s
/// policy of not hard-coding the kernel ABI's growing constant set.
pub type EventKind = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDirection {
    Rising,
    Falling,
    Either,
    Unknown(u8),
}

/// A decoded device event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEvent {
    pub kind: EventKind,
    pub direction: EventDirection,
    pub channel: u16,
    pub channel2: u16,
    pub modifier: u8,
    pub differential: bool,
    pub timestamp_ns: i64,
}

impl ChannelEvent {
    /// Decodes the kernel IIO ABI's packed event `id` field:
    /// `type[62:56] direction[55:48] channel[47:32] channel2[33:16] modifier[23:16]`.
    pub fn from_raw(id: u64, timestamp_ns: i64) -> Self {
        let kind = ((id >> 56) & 0xff) as u8;
        let direction_raw = ((id >> 48) & 0xff) as u8;
        let channel = ((id >> 32) & 0xffff) as u16;
        let channel2 = ((id >> 16) & 0x3ffff) as u16;
        let modifier = ((id >> 16) & 0xff) as u8;
        let differential = channel2 != 0xffff;

        let direction = match direction_raw {
            0 => EventDirection::Rising,
            1 => EventDirection::Falling,
            2 => EventDirection::Either,
            other => EventDirection::Unknown(other),
        };

        ChannelEvent { kind, direction, channel, channel2, modifier, differential, timestamp_ns }
    }
}

/// An open event channel on one device, driving the backend's
/// `open_ev`/`read_ev`/`close_ev` v-table entries. Obtained via
/// [`Context::open_events`](crate::context::Context::open_events);
/// `close_ev` runs automatically on drop.
pub struct EventStream {
    ctx: Context,
    device_id: String,
}

impl EventStream {
    pub(crate) fn open(ctx: &Context, device_id: &str) -> Result<EventStream> {
        ctx.backend().open_ev(device_id)?;
        Ok(EventStream { ctx: ctx.clone(), device_id: device_id.to_string() })
    }

    /// Blocks for the device's next event.
    pub fn next_event(&self) -> Result<ChannelEvent> {
        self.ctx.backend().read_ev(&self.device_id)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        let _ = self.ctx.backend().close_ev(&self.device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AttrTarget, Backend};
    use crate::context::{Context, ContextDescriptor, Version};
    use crate::device::Device;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn decodes_direction_tag() {
        let id: u64 = 0u64 | (0u64 << 48);
        let ev = ChannelEvent::from_raw(id, 0);
        assert_eq!(ev.direction, EventDirection::Rising);

        let id2: u64 = 1u64 << 48;
        let ev2 = ChannelEvent::from_raw(id2, 0);
        assert_eq!(ev2.direction, EventDirection::Falling);
    }

    /// A backend whose event channel yields one canned event, then errors,
    /// so a test can exercise `open_ev`/`read_ev`/`close_ev` end to end
    /// through the public wrapper without any real hardware.
    struct FakeEventBackend {
        reads: AtomicUsize,
    }

    impl Backend for FakeEventBackend {
        fn backend_name(&self) -> &str {
            "fake-event"
        }

        fn describe(&self) -> Result<ContextDescriptor> {
            Ok(ContextDescriptor {
                name: "fake".into(),
                description: String::new(),
                version: Version { major: 0, minor: 1, git_tag: String::new() },
                attrs: Vec::new(),
                devices: vec![Device::new("iio:device0")],
            })
        }

        fn read_attr(&self, _target: &AttrTarget, _attr: &crate::attr::Attr, _dst: &mut [u8]) -> Result<usize> {
            Err(Error::Unsupported)
        }

        fn write_attr(&self, _target: &AttrTarget, _attr: &crate::attr::Attr, _data: &[u8]) -> Result<usize> {
            Err(Error::Unsupported)
        }

        fn open_ev(&self, device_id: &str) -> Result<()> {
            assert_eq!(device_id, "iio:device0");
            Ok(())
        }

        fn close_ev(&self, device_id: &str) -> Result<()> {
            assert_eq!(device_id, "iio:device0");
            Ok(())
        }

        fn read_ev(&self, _device_id: &str) -> Result<ChannelEvent> {
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ChannelEvent::from_raw(0, 42))
            }
            else {
                Err(Error::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "closed")))
            }
        }
    }

    #[test]
    fn event_stream_drives_open_read_close() {
        let backend = FakeEventBackend { reads: AtomicUsize::new(0) };
        let ctx = Context::from_backend(Box::new(backend)).unwrap();

        // `open_ev`/`close_ev`'s `device_id` assertions inside the backend
        // impl fire as this stream opens and, on scope exit, drops.
        let stream = ctx.open_events("iio:device0").unwrap();
        let ev = stream.next_event().unwrap();
        assert_eq!(ev.timestamp_ns, 42);
        assert!(stream.next_event().is_err());
    }

    #[test]
    fn open_events_rejects_unknown_device() {
        let backend = FakeEventBackend { reads: AtomicUsize::new(0) };
        let ctx = Context::from_backend(Box::new(backend)).unwrap();
        assert!(ctx.open_events("no-such-device").is_err());
    }
}
