// src/channel.rs
//
// Copyright (c) 2018, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! Industrial I/O Channels: a single logical data stream of a Device.

use crate::attr::{Attr, AttrKind, AttrList};

/// The direction of data flow through a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Byte order of a channel's raw samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Signedness of a channel's raw samples. The `Full` variants mean the
/// format is "fully defined" (the upstream `S`/`U` format letters): no
/// separate `with_scale`/`scale` pair is needed to interpret raw samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    Signed,
    Unsigned,
    SignedFull,
    UnsignedFull,
}

impl Sign {
    pub fn is_fully_defined(self) -> bool {
        matches!(self, Sign::SignedFull | Sign::UnsignedFull)
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Sign::Signed | Sign::SignedFull)
    }
}

/// The scan-element data format: how a channel's raw samples are packed
/// into a buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataFormat {
    pub endian: Endian,
    pub sign: Sign,
    /// Number of significant bits.
    pub bits: u32,
    /// Storage length in bits (always a multiple of 8).
    pub length: u32,
    /// Number of times the sample repeats (for interleaved channels).
    pub repeat: u32,
    /// Right-shift applied to the raw value before masking to `bits`.
    pub shift: u32,
    pub with_scale: bool,
    pub scale: f64,
}

impl DataFormat {
    pub fn is_fully_defined(&self) -> bool {
        self.sign.is_fully_defined()
    }

    /// Parses the canonical `<scan-element format="...">` string:
    /// `"<e>:<s><bits>/<length>[X<repeat>]>><shift>"` with `e∈{b,l}` and
    /// `s∈{s,u,S,U}` (`S`/`U` imply a fully-defined format).
    pub fn parse(s: &str) -> crate::error::Result<Self> {
        use crate::error::Error;
        let bad = || Error::Malformed(format!("bad scan-element format {s:?}"));

        let (endian_str, rest) = s.split_once(':').ok_or_else(bad)?;
        let endian = match endian_str {
            "be" => Endian::Big,
            "le" => Endian::Little,
            _ => return Err(bad()),
        };

        let (bitspec, shift_str) = rest.split_once(">>").ok_or_else(bad)?;
        let shift: u32 = shift_str.parse().map_err(|_| bad())?;

        let mut chars = bitspec.chars();
        let sign_ch = chars.next().ok_or_else(bad)?;
        let sign = match sign_ch {
            's' => Sign::Signed,
            'u' => Sign::Unsigned,
            'S' => Sign::SignedFull,
            'U' => Sign::UnsignedFull,
            _ => return Err(bad()),
        };
        let numeric: String = chars.collect();
        let (bits_str, lenrep) = numeric.split_once('/').ok_or_else(bad)?;
        let bits: u32 = bits_str.parse().map_err(|_| bad())?;
        let (length_str, repeat) = match lenrep.split_once('X') {
            Some((l, r)) => (l, r.parse().map_err(|_| bad())?),
            None => (lenrep, 1),
        };
        let length: u32 = length_str.parse().map_err(|_| bad())?;

        Ok(DataFormat {
            endian,
            sign,
            bits,
            length,
            repeat,
            shift,
            with_scale: false,
            scale: 1.0,
        })
    }

    /// Inverse of [`parse`](DataFormat::parse).
    pub fn to_format_string(&self) -> String {
        let e = match self.endian {
            Endian::Big => "be",
            Endian::Little => "le",
        };
        let s = match self.sign {
            Sign::Signed => 's',
            Sign::Unsigned => 'u',
            Sign::SignedFull => 'S',
            Sign::UnsignedFull => 'U',
        };
        let rep = if self.repeat > 1 { format!("X{}", self.repeat) } else { String::new() };
        format!("{e}:{s}{}/{}{rep}>>{}", self.bits, self.length, self.shift)
    }
}

impl Default for DataFormat {
    fn default() -> Self {
        DataFormat {
            endian: Endian::Little,
            sign: Sign::Unsigned,
            bits: 0,
            length: 0,
            repeat: 1,
            shift: 0,
            with_scale: false,
            scale: 1.0,
        }
    }
}

/// A modifier further qualifying a channel's [`ChannelKind`] (e.g. the `x`
/// axis of an accelerometer, or the `red` component of a color sensor).
/// This is upstream's modifier list, kept as data rather than an enum with
/// one variant per kernel ABI constant so new modifiers don't require a
/// crate release.
pub type Modifier = String;

/// The physical quantity a channel represents (voltage, accel, anglvel,
/// …). Kept as a string for the same reason as [`Modifier`]: the kernel ABI
/// adds new channel types over time and this crate does not special-case
/// their physical meaning (spec Non-goal: no sensor physics).
pub type ChannelKind = String;

/// An Industrial I/O Device Channel: one logical data stream of a Device.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: String,
    pub name: Option<String>,
    pub direction: Direction,
    pub is_scan_element: bool,
    /// Signed scan index; `-1` if this channel is not a scan element.
    pub scan_index: i32,
    pub format: DataFormat,
    pub kind: ChannelKind,
    pub modifier: Option<Modifier>,
    pub attrs: AttrList,
    /// Assigned by [`crate::device::reorder_channels`] after canonical
    /// sort; the index used in a [`crate::mask::ChannelsMask`].
    pub number: usize,
    enabled: bool,
}

impl Channel {
    pub fn new(id: impl Into<String>, direction: Direction) -> Self {
        Channel {
            id: id.into(),
            name: None,
            direction,
            is_scan_element: false,
            scan_index: -1,
            format: DataFormat::default(),
            kind: "voltage".to_string(),
            modifier: None,
            attrs: AttrList::new(),
            number: 0,
            enabled: false,
        }
    }

    /// Matches `ctx.find("...")`/`device.find_channel("...")` lookup
    /// semantics: match id OR name.
    pub fn matches(&self, needle: &str) -> bool {
        self.id == needle || self.name.as_deref() == Some(needle)
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn push_attr(&mut self, name: impl Into<String>) {
        self.attrs.insert(Attr::new(AttrKind::Channel, name), None);
    }

    pub fn push_attr_with_filename(&mut self, name: impl Into<String>, filename: impl Into<String>) {
        self.attrs.insert(Attr::with_filename(AttrKind::Channel, name, filename), None);
    }

    /// Storage length per sample in bytes, accounting for repeats:
    /// `length/8 * repeat`. Used by [`crate::device::sample_size`] and the
    /// multiplex/demultiplex walk.
    pub fn stride(&self) -> usize {
        (self.format.length / 8) as usize * self.format.repeat.max(1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_id_or_name() {
        let mut c = Channel::new("voltage0", Direction::Input);
        c.name = Some("vccint".into());
        assert!(c.matches("voltage0"));
        assert!(c.matches("vccint"));
        assert!(!c.matches("voltage1"));
    }

    #[test]
    fn data_format_round_trips_through_string() {
        let fmt = DataFormat::parse("le:S12/16>>0").unwrap();
        assert_eq!(fmt.endian, Endian::Little);
        assert_eq!(fmt.sign, Sign::SignedFull);
        assert!(fmt.is_fully_defined());
        assert_eq!(fmt.bits, 12);
        assert_eq!(fmt.length, 16);
        assert_eq!(fmt.shift, 0);
        assert_eq!(DataFormat::parse(&fmt.to_format_string()).unwrap().length, 16);
    }

    #[test]
    fn stride_accounts_for_repeat() {
        let mut c = Channel::new("voltage0", Direction::Input);
        c.format.length = 16;
        c.format.repeat = 4;
        assert_eq!(c.stride(), 8);
    }
}
