// src/device.rs
//
// Copyright (c) 2018, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! Industrial I/O Devices: a unit of IIO hardware enumerated within a
//! Context, owning an ordered, canonically-sorted list of Channels.

use std::collections::HashMap;

use crate::attr::{Attr, AttrKind, AttrList};
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::mask::ChannelsMask;

/// An Industrial I/O Device. Owned by exactly one [`crate::context::Context`]
/// for its whole life.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: String,
    pub name: Option<String>,
    pub label: Option<String>,
    pub device_attrs: AttrList,
    pub debug_attrs: AttrList,
    pub buffer_attrs: AttrList,
    pub channels: Vec<Channel>,
    trigger_id: Option<String>,
}

impl Device {
    pub fn new(id: impl Into<String>) -> Self {
        Device {
            id: id.into(),
            name: None,
            label: None,
            device_attrs: AttrList::new(),
            debug_attrs: AttrList::new(),
            buffer_attrs: AttrList::new(),
            channels: Vec::new(),
            trigger_id: None,
        }
    }

    /// Matches `ctx.find_device("...")` lookup semantics: id OR name OR
    /// label, first match wins in that order (checked by the caller across
    /// the whole device list).
    pub fn matches(&self, needle: &str) -> bool {
        self.id == needle || self.name.as_deref() == Some(needle) || self.label.as_deref() == Some(needle)
    }

    /// Finds a channel by id or name; direction must also match.
    pub fn find_channel(&self, needle: &str, is_output: bool) -> Option<&Channel> {
        self.channels.iter().find(|c| {
            c.matches(needle)
                && (c.direction == crate::channel::Direction::Output) == is_output
        })
    }

    pub fn find_channel_mut(&mut self, needle: &str, is_output: bool) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| {
            c.matches(needle)
                && (c.direction == crate::channel::Direction::Output) == is_output
        })
    }

    /// A device is a trigger iff it has zero channels, a name, and an id
    /// prefixed `trigger`.
    pub fn is_trigger(&self) -> bool {
        self.channels.is_empty() && self.name.is_some() && self.id.starts_with("trigger")
    }

    pub fn is_buffer_capable(&self) -> bool {
        self.channels.iter().any(|c| c.is_scan_element)
    }

    pub fn trigger(&self) -> Option<&str> {
        self.trigger_id.as_deref()
    }

    pub fn set_trigger(&mut self, trigger_id: Option<&str>) {
        self.trigger_id = trigger_id.map(str::to_string);
    }

    pub fn push_attr(&mut self, kind: AttrKind, name: impl Into<String>) {
        let list = match kind {
            AttrKind::Device => &mut self.device_attrs,
            AttrKind::Debug => &mut self.debug_attrs,
            AttrKind::Buffer => &mut self.buffer_attrs,
            _ => panic!("channel/context attrs do not live on Device"),
        };
        list.insert(Attr::new(kind, name), None);
    }
}

/// Canonical channel ordering: by `(scan_index, shift)`, with a negative
/// `scan_index` (not a scan element) sorted last. `number` is assigned
/// post-sort and becomes the index used in a [`ChannelsMask`].
///
/// The upstream implementation does this with a bubble sort; determinism
/// (not algorithmic complexity) is the actual requirement, since tests
/// compare contexts round-tripped through XML, so any stable sort on the
/// same key satisfies it.
pub fn reorder_channels(device: &mut Device) {
    let key = |c: &Channel| -> (bool, i32, u32) {
        if c.scan_index < 0 {
            (true, i32::MAX, 0)
        }
        else {
            (false, c.scan_index, c.format.shift)
        }
    };
    device.channels.sort_by(|a, b| key(a).cmp(&key(b)));
    for (i, chan) in device.channels.iter_mut().enumerate() {
        chan.number = i;
    }
}

/// Computes the number of bytes per sample under `mask`.
///
/// Walks channels in canonical order; each scan-element channel selected by
/// `mask` whose `scan_index` differs from the previous accepted channel's
/// contributes `stride = length/8 * repeat` bytes: the cursor is aligned up
/// to `stride`, then advanced by it. Channels sharing a `scan_index` alias
/// and count once. After the loop the cursor is aligned up to the largest
/// `stride` seen (so the whole sample aligns to its widest member).
pub fn sample_size(device: &Device, mask: &ChannelsMask) -> Result<usize> {
    if mask.width() != device.channels.len() {
        return Err(Error::BadArgument(format!(
            "mask width {} does not match device channel count {}",
            mask.width(),
            device.channels.len()
        )));
    }

    let mut cursor: usize = 0;
    let mut max_stride: usize = 0;
    let mut prev_scan_index: Option<i32> = None;

    for chan in &device.channels {
        if !chan.is_scan_element || !mask.is_set(chan.number) {
            continue;
        }
        if prev_scan_index == Some(chan.scan_index) {
            continue;
        }
        let stride = chan.stride();
        if stride == 0 {
            continue;
        }
        cursor = align_up(cursor, stride);
        cursor += stride;
        max_stride = max_stride.max(stride);
        prev_scan_index = Some(chan.scan_index);
    }

    if max_stride > 0 {
        cursor = align_up(cursor, max_stride);
    }
    Ok(cursor)
}

fn align_up(cursor: usize, align: usize) -> usize {
    if align == 0 {
        return cursor;
    }
    (cursor + align - 1) / align * align
}

/// Walks one sample's byte window, invoking `cb(channel, offset, len)` for
/// every channel present both in the backend's hardware mask and the
/// user-supplied mask. Channels sharing a `scan_index` count once. Returns
/// the sum of the callback's returns, or the first negative one
/// encountered — mirroring the upstream `iio_buffer_foreach_sample`
/// contract so that a callback can signal early termination with a
/// negative value.
pub fn foreach_sample<F>(
    device: &Device,
    hw_mask: &ChannelsMask,
    user_mask: &ChannelsMask,
    mut cb: F,
) -> i32
where
    F: FnMut(&Channel, usize, usize) -> i32,
{
    let mut cursor = 0usize;
    let mut sum = 0i32;
    let mut prev_scan_index: Option<i32> = None;

    for chan in &device.channels {
        if !chan.is_scan_element {
            continue;
        }
        if !hw_mask.is_set(chan.number) || !user_mask.is_set(chan.number) {
            continue;
        }
        if prev_scan_index == Some(chan.scan_index) {
            continue;
        }
        let len = (chan.format.length / 8) as usize;
        if len == 0 {
            continue;
        }
        cursor = align_up(cursor, len);
        let ret = cb(chan, cursor, len);
        if ret < 0 {
            return ret;
        }
        sum += ret;
        cursor += len * chan.format.repeat.max(1) as usize;
        prev_scan_index = Some(chan.scan_index);
    }
    sum
}

/// Collects a device's debug/unknown sysfs `(filename, value)` pairs into
/// per-channel attributes by prefix: `{in,out}_<id>_*` and
/// `{in,out}_<id><modifier>_*`. This is the local backend's dynamic
/// attribute discovery pass (§9): run once after raw sysfs enumeration,
/// before [`reorder_channels`].
pub fn promote_channel_attrs(device: &mut Device, raw: &HashMap<String, String>) {
    // Upstream modifier suffixes; kept as data, matching the modifier list
    // convention (not one variant per kernel ABI constant).
    const MODIFIERS: &[&str] = &[
        "x", "y", "z", "sqrt(x^2+y^2)", "both", "ir", "clear", "red", "green", "blue",
    ];

    for chan in device.channels.iter_mut() {
        let dir = if chan.direction == crate::channel::Direction::Output { "out" } else { "in" };
        let mut prefixes = vec![format!("{dir}_{}_", chan.id)];
        for m in MODIFIERS {
            prefixes.push(format!("{dir}_{}{m}_", chan.id));
        }
        for (filename, _value) in raw.iter() {
            for prefix in &prefixes {
                if let Some(attr_name) = filename.strip_prefix(prefix.as_str()) {
                    chan.push_attr_with_filename(attr_name, filename.clone());
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Direction, Endian, Sign};

    fn chan(id: &str, scan_index: i32, length: u32, shift: u32) -> Channel {
        let mut c = Channel::new(id, Direction::Input);
        c.is_scan_element = scan_index >= 0;
        c.scan_index = scan_index;
        c.format = crate::channel::DataFormat {
            endian: Endian::Little,
            sign: Sign::Signed,
            bits: length,
            length,
            repeat: 1,
            shift,
            with_scale: false,
            scale: 1.0,
        };
        c
    }

    #[test]
    fn reorder_puts_non_scan_elements_last() {
        let mut dev = Device::new("iio:device0");
        dev.channels.push(chan("voltage2", 1, 16, 0));
        dev.channels.push(chan("timestamp", -1, 64, 0));
        dev.channels.push(chan("voltage0", 0, 16, 0));
        reorder_channels(&mut dev);
        let ids: Vec<_> = dev.channels.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["voltage0", "voltage2", "timestamp"]);
        assert_eq!(dev.channels[0].number, 0);
        assert_eq!(dev.channels[2].number, 2);
    }

    #[test]
    fn sample_size_is_deterministic_and_aligned() {
        let mut dev = Device::new("iio:device0");
        dev.channels.push(chan("voltage0", 0, 16, 0));
        dev.channels.push(chan("voltage1", 1, 16, 0));
        reorder_channels(&mut dev);

        let mut mask = ChannelsMask::new(dev.channels.len());
        mask.set(0);
        mask.set(1);

        let s1 = sample_size(&dev, &mask).unwrap();
        let s2 = sample_size(&dev, &mask).unwrap();
        assert_eq!(s1, s2);
        assert_eq!(s1, 4);
        assert_eq!(s1 % 2, 0);
    }

    #[test]
    fn sample_size_rejects_mismatched_mask_width() {
        let dev = Device::new("iio:device0");
        let mask = ChannelsMask::new(3);
        assert!(sample_size(&dev, &mask).is_err());
    }

    #[test]
    fn aliased_scan_index_counts_once() {
        let mut dev = Device::new("iio:device0");
        // Two channels sharing a scan_index (e.g. real/imag of one sample).
        dev.channels.push(chan("voltage0_i", 0, 16, 0));
        dev.channels.push(chan("voltage0_q", 0, 16, 0));
        reorder_channels(&mut dev);
        let mut mask = ChannelsMask::new(2);
        mask.set(0);
        mask.set(1);
        assert_eq!(sample_size(&dev, &mask).unwrap(), 2);
    }

    #[test]
    fn promote_attrs_assigns_by_prefix() {
        let mut dev = Device::new("iio:device0");
        dev.channels.push(chan("voltage0", 0, 16, 0));
        let mut raw = HashMap::new();
        raw.insert("in_voltage0_scale".to_string(), "0.001".to_string());
        raw.insert("in_voltage0_raw".to_string(), "1024".to_string());
        raw.insert("sampling_frequency".to_string(), "1000".to_string());
        promote_channel_attrs(&mut dev, &raw);
        let names: Vec<_> = dev.channels[0].attrs.iter().map(|a| a.name.as_str()).collect();
        assert!(names.contains(&"scale"));
        assert!(names.contains(&"raw"));
    }
}
