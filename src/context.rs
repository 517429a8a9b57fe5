// src/context.rs
//
// Copyright (c) 2018, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! The root of the object model: a Context is a typed view over whichever
//! backend its URI selected, owning every Device for the life of the
//! process.

use std::sync::Arc;

use crate::attr::{Attr, AttrKind, AttrList};
use crate::backend::{Backend, ContextInfo};
use crate::buffer::Buffer;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::mask::ChannelsMask;
use crate::uri;

/// Semantic version of the context's data: `(major, minor, git_tag)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub git_tag: String,
}

/// What a backend's `describe()` call returns: everything needed to
/// populate a [`Context`] except the backend handle itself.
#[derive(Debug, Clone)]
pub struct ContextDescriptor {
    pub name: String,
    pub description: String,
    pub version: Version,
    /// `(name, value)` pairs, unsorted; [`Context::from_descriptor`] sorts
    /// them into the context's [`AttrList`].
    pub attrs: Vec<(String, String)>,
    pub devices: Vec<Device>,
}

/// An Industrial I/O Context: the root handle to an IIO system reachable
/// via some backend.
///
/// Immutable in structure after creation — no devices are added once
/// built — but attribute *values* may still be updated in place. Cheaply
/// cloned: clones share the same backend via [`Arc`], mirroring the
/// reference crate's reference-counted context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Box<dyn Backend>,
    name: String,
    description: String,
    version: Version,
    attrs: std::sync::Mutex<AttrList>,
    devices: Vec<Device>,
}

impl Context {
    /// Creates a default context, honoring the `IIOD_REMOTE` environment
    /// variable override (empty value ⇒ DNS-SD discovery; unset ⇒ local).
    pub fn new() -> Result<Context> {
        match std::env::var("IIOD_REMOTE") {
            Ok(host) => uri::open(&format!("ip:{host}")),
            Err(_) => uri::open("local:"),
        }
    }

    /// Creates a context from any of the URI forms in the scan & URI
    /// module: `local:`, `ip:...`, `usb:...`, `serial:...`, `xml:...`, or a
    /// raw XML document (detected by a `<?xml` prefix).
    pub fn create_from_uri(uri: &str) -> Result<Context> {
        uri::open(uri)
    }

    pub(crate) fn from_backend(backend: Box<dyn Backend>) -> Result<Context> {
        let desc = backend.describe()?;
        Ok(Context::from_descriptor(backend, desc))
    }

    pub(crate) fn from_descriptor(backend: Box<dyn Backend>, desc: ContextDescriptor) -> Context {
        let mut attrs = AttrList::new();
        let mut sorted = desc.attrs;
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in sorted {
            attrs.insert(Attr::new(AttrKind::Context, name), Some(value));
        }
        Context {
            inner: Arc::new(Inner {
                backend,
                name: desc.name,
                description: desc.description,
                version: desc.version,
                attrs: std::sync::Mutex::new(attrs),
                devices: desc.devices,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    pub fn version(&self) -> &Version {
        &self.inner.version
    }

    pub fn backend_name(&self) -> &str {
        self.inner.backend.backend_name()
    }

    pub(crate) fn backend(&self) -> &dyn Backend {
        self.inner.backend.as_ref()
    }

    pub fn devices(&self) -> &[Device] {
        &self.inner.devices
    }

    /// Finds a device by id, name, or label (first match wins, in that
    /// order).
    pub fn find_device(&self, needle: &str) -> Option<&Device> {
        self.inner.devices.iter().find(|d| d.id == needle)
            .or_else(|| self.inner.devices.iter().find(|d| d.name.as_deref() == Some(needle)))
            .or_else(|| self.inner.devices.iter().find(|d| d.label.as_deref() == Some(needle)))
    }

    pub fn context_attrs(&self) -> AttrList {
        self.inner.attrs.lock().unwrap().clone()
    }

    /// Writing a context attribute is `EPERM` on every backend; the value
    /// originates from the backend at creation time and is read-only to
    /// applications (§4.2).
    pub fn write_context_attr(&self, _name: &str, _value: &str) -> Result<()> {
        Err(Error::Permission)
    }

    /// Sets the I/O timeout, in milliseconds. Zero means "infinite wait".
    pub fn set_timeout_ms(&self, ms: u64) -> Result<()> {
        self.inner.backend.set_timeout(ms)
    }

    /// Re-opens an equivalent context through the same backend
    /// (`iio_context_clone`).
    pub fn try_clone(&self) -> Result<Context> {
        let backend = self.inner.backend.clone_backend()?;
        Context::from_backend(backend)
    }

    /// Creates a Buffer on `device_id` for the channels selected by `mask`
    /// (§4.5 `create_buffer`).
    pub fn create_buffer(&self, device_id: &str, index: u32, mask: ChannelsMask) -> Result<Buffer> {
        Buffer::create(self, device_id, index, mask)
    }

    /// Opens `device_id`'s event channel, driving the backend's
    /// `open_ev`/`read_ev`/`close_ev` entries.
    pub fn open_events(&self, device_id: &str) -> Result<crate::event::EventStream> {
        if self.find_device(device_id).is_none() {
            return Err(Error::NotFound(device_id.to_string()));
        }
        crate::event::EventStream::open(self, device_id)
    }
}

/// Two contexts are equal when their semantic content — name, description,
/// version, devices, and context attributes — matches, irrespective of the
/// backend handle each is attached to. This is what the XML round-trip
/// property (`parse(emit(c)) ≡ c`) actually compares.
impl PartialEq for Context {
    fn eq(&self, other: &Context) -> bool {
        self.name() == other.name()
            && self.description() == other.description()
            && self.version() == other.version()
            && self.devices() == other.devices()
            && self.context_attrs() == other.context_attrs()
    }
}

/// Enumerates reachable contexts for a given backend family without
/// opening any of them (`iio_create_scan_block`/`iio_info -S`).
pub struct ScanContext {
    backend_family: String,
}

impl ScanContext {
    pub fn new(backend_family: impl Into<String>) -> Self {
        ScanContext { backend_family: backend_family.into() }
    }

    pub fn scan(&self) -> Result<Vec<ContextInfo>> {
        uri::scan(&self.backend_family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{xml::XmlBackend};

    fn sample_xml() -> &'static str {
        r#"<context name="xml" version-major="0" version-minor="32" version-git="deadbeef">
            <context-attribute name="hw_model" value="pluto"/>
            <device id="iio:device0" name="ad9361-phy">
                <attribute name="foo"/>
            </device>
        </context>"#
    }

    #[test]
    fn find_device_checks_id_then_name_then_label() {
        let backend = XmlBackend::from_str(sample_xml()).unwrap();
        let ctx = Context::from_backend(Box::new(backend)).unwrap();
        assert!(ctx.find_device("iio:device0").is_some());
        assert!(ctx.find_device("ad9361-phy").is_some());
        assert!(ctx.find_device("nope").is_none());
    }

    #[test]
    fn context_attrs_are_sorted_by_name() {
        let backend = XmlBackend::from_str(sample_xml()).unwrap();
        let ctx = Context::from_backend(Box::new(backend)).unwrap();
        let attrs = ctx.context_attrs();
        let names: Vec<_> = attrs.iter().map(|a| a.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
