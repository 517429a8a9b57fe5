// src/attr.rs
//
// Copyright (c) 2018, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! The ordered, name-sorted attribute store shared by contexts, devices,
//! channels, and buffers.

use crate::error::{Error, Result};

/// What kind of entity an attribute is attached to.
///
/// Context attributes carry a value inline (see [`AttrList`]); the other
/// kinds are read/written through the owning backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrKind {
    Context,
    Device,
    Debug,
    Buffer,
    Channel,
}

/// A single named attribute.
///
/// `filename` is the storage key used by a backend (e.g. the sysfs file
/// name); it defaults to `name` but may be overridden when a backend
/// promotes a differently-named file to a channel attribute (see the local
/// backend's dynamic attribute discovery pass).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub kind: AttrKind,
    pub name: String,
    pub filename: String,
}

impl Attr {
    pub fn new(kind: AttrKind, name: impl Into<String>) -> Self {
        let name = name.into();
        Attr { kind, filename: name.clone(), name }
    }

    pub fn with_filename(kind: AttrKind, name: impl Into<String>, filename: impl Into<String>) -> Self {
        Attr { kind, name: name.into(), filename: filename.into() }
    }
}

/// An ordered, name-sorted list of attributes.
///
/// Lookup is by linear scan — the count is small (tens to low hundreds) so
/// a `Vec` kept sorted by name beats a hash map in practice and preserves
/// the deterministic ordering the XML round-trip and canonical-sort tests
/// depend on.
///
/// For [`AttrKind::Context`] attributes, `values[i]` always corresponds to
/// `attrs[i]`: insertion keeps the two arrays in lockstep by recording the
/// sorted insertion index and shifting `values` to match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrList {
    attrs: Vec<Attr>,
    /// Only populated (kept parallel to `attrs`) for context attributes.
    values: Vec<String>,
}

impl AttrList {
    pub fn new() -> Self {
        AttrList::default()
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attr> {
        self.attrs.iter()
    }

    pub fn get(&self, idx: usize) -> Option<&Attr> {
        self.attrs.get(idx)
    }

    /// Finds an attribute by name (case-sensitive, exact match).
    pub fn find(&self, name: &str) -> Option<&Attr> {
        self.attrs.iter().find(|a| a.name == name)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.attrs.iter().position(|a| a.name == name)
    }

    /// Inserts an attribute, keeping the list sorted by name. Context
    /// attributes carry a value which is kept in lockstep.
    pub fn insert(&mut self, attr: Attr, value: Option<String>) {
        let idx = self.attrs.partition_point(|a| a.name.as_str() < attr.name.as_str());
        self.attrs.insert(idx, attr);
        if let Some(v) = value {
            self.values.insert(idx, v);
        }
    }

    /// Gets the value of a context attribute at `idx` (parallel to
    /// `attrs[idx]`). Only meaningful for [`AttrKind::Context`] lists.
    pub fn value_at(&self, idx: usize) -> Option<&str> {
        self.values.get(idx).map(String::as_str)
    }

    /// Sets the value of a context attribute by name, returning
    /// [`Error::NotFound`] if no such attribute exists.
    pub fn set_value(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        let idx = self.position(name).ok_or_else(|| Error::NotFound(name.to_string()))?;
        self.values[idx] = value.into();
        Ok(())
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        let idx = self.position(name)?;
        self.value_at(idx)
    }
}

/// Typed parsers and formatters layered over raw string attribute I/O.
///
/// These are free functions (rather than methods) because they apply
/// uniformly to context, device, channel, and buffer attribute values once
/// the raw string has been read from the backend; callers combine them with
/// the backend's `read_raw`/`write_raw`.
pub mod typed {
    use super::*;

    /// Parses a raw attribute value as a boolean: truthy iff the parsed
    /// integer is non-zero.
    pub fn read_bool(raw: &str) -> Result<bool> {
        let v: i64 = raw.trim().parse().map_err(|_| {
            Error::BadArgument(format!("not a boolean: {raw:?}"))
        })?;
        Ok(v != 0)
    }

    pub fn read_longlong(raw: &str) -> Result<i64> {
        raw.trim().parse::<i64>().map_err(|_| Error::BadArgument(format!("not an integer: {raw:?}")))
    }

    /// Parses a raw value in the "C" numeric locale (decimal point is
    /// always `.`) regardless of the process locale.
    pub fn read_double(raw: &str) -> Result<f64> {
        raw.trim().parse::<f64>().map_err(|_| Error::BadArgument(format!("not a float: {raw:?}")))
    }

    /// Formats a double in the "C" numeric locale.
    pub fn write_double(val: f64) -> String {
        format!("{val}")
    }

    /// A parsed `<min> <step> <max>` range, as produced by a `*_available`
    /// attribute that describes a continuous range rather than a discrete
    /// set.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Range {
        pub min: f64,
        pub step: f64,
        pub max: f64,
    }

    /// Parses a `_available` attribute value as a `[ min step max ]` range.
    ///
    /// Succeeds only if `kind` is not [`AttrKind::Buffer`] (buffers have no
    /// `range`/`available` query — `ENXIO`), `name` ends with `_available`,
    /// and `raw` matches the bracketed three-number form; a value without
    /// brackets (e.g. a discrete list) is [`Error::Unsupported`], matching
    /// the `ENXIO`/`EOPNOTSUPP` semantics of the C attribute store.
    pub fn range(kind: AttrKind, name: &str, raw: &str) -> Result<Range> {
        if kind == AttrKind::Buffer || !name.ends_with("_available") {
            return Err(Error::Unsupported);
        }
        let trimmed = raw.trim();
        let inner = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or(Error::Unsupported)?;
        let parts: Vec<&str> = inner.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(Error::Unsupported);
        }
        Ok(Range {
            min: read_double(parts[0])?,
            step: read_double(parts[1])?,
            max: read_double(parts[2])?,
        })
    }

    /// Splits a `_available` attribute value into a whitespace-separated
    /// discrete list. Same `kind`/name preconditions as [`range`].
    pub fn available_list(kind: AttrKind, name: &str, raw: &str) -> Result<Vec<String>> {
        if kind == AttrKind::Buffer || !name.ends_with("_available") {
            return Err(Error::Unsupported);
        }
        Ok(raw.split_whitespace().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_sorted() {
        let mut list = AttrList::new();
        for name in ["zeta", "alpha", "mu", "beta"] {
            list.insert(Attr::new(AttrKind::Device, name), None);
        }
        let names: Vec<_> = list.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["alpha", "beta", "mu", "zeta"]);
    }

    #[test]
    fn context_values_track_sorted_position() {
        let mut list = AttrList::new();
        list.insert(Attr::new(AttrKind::Context, "hw_model"), Some("pluto".into()));
        list.insert(Attr::new(AttrKind::Context, "fw_version"), Some("v0.32".into()));
        let names: Vec<_> = list.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["fw_version", "hw_model"]);
        assert_eq!(list.value("fw_version"), Some("v0.32"));
        assert_eq!(list.value("hw_model"), Some("pluto"));
    }

    #[test]
    fn range_requires_available_suffix_and_brackets() {
        assert_eq!(
            typed::range(AttrKind::Channel, "sampling_frequency_available", " [ 0.5 0.125 8.0 ]").unwrap(),
            typed::Range { min: 0.5, step: 0.125, max: 8.0 }
        );
        assert!(typed::range(AttrKind::Channel, "sampling_frequency_available", "0.5 1 2 3").is_err());
        assert!(typed::range(AttrKind::Channel, "sampling_frequency", "[ 0.5 0.125 8.0 ]").is_err());
    }

    #[test]
    fn range_rejects_buffer_kind() {
        assert!(matches!(
            typed::range(AttrKind::Buffer, "sampling_frequency_available", "[ 0.5 0.125 8.0 ]"),
            Err(Error::Unsupported)
        ));
        assert!(matches!(
            typed::available_list(AttrKind::Buffer, "scan_elements_available", "a b c"),
            Err(Error::Unsupported)
        ));
    }

    #[test]
    fn read_bool_is_nonzero() {
        assert!(typed::read_bool("1").unwrap());
        assert!(!typed::read_bool("0").unwrap());
        assert!(typed::read_bool("-3").unwrap());
    }
}
