// src/backend/xml.rs
//
// Copyright (c) 2023, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! The `xml:` backend: a context described entirely by the canonical XML
//! form (§6), with no hardware underneath. Attribute values live in a
//! separate in-memory map, since the canonical document only ever carries
//! a `value` for context attributes — device, channel, debug, and buffer
//! attributes are just names until something writes to them.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::attr::Attr;
use crate::backend::{AttrTarget, Backend};
use crate::context::ContextDescriptor;
use crate::error::{Error, Result};
use crate::xmlcodec;

/// Key identifying one non-context attribute slot: `(device_id, owner,
/// attr_name)`, where `owner` is the channel id for a channel attribute or
/// the device id itself for a device/debug/buffer attribute.
type AttrKey = (String, String, String);

pub struct XmlBackend {
    desc: ContextDescriptor,
    values: Mutex<HashMap<AttrKey, String>>,
}

impl XmlBackend {
    /// Parses an in-memory XML document.
    pub fn from_str(xml: &str) -> Result<Self> {
        let desc = xmlcodec::parse(xml)?;
        Ok(XmlBackend { desc, values: Mutex::new(HashMap::new()) })
    }

    /// Parses a document from a file on disk.
    pub fn from_path(path: &str) -> Result<Self> {
        let xml = std::fs::read_to_string(path)?;
        Self::from_str(&xml)
    }

    /// Seeds an attribute's value, as if a prior write had set it. Used by
    /// callers that build a context purely in memory (e.g. tests) without
    /// an underlying file to persist to.
    pub fn with_value(self, device_id: &str, owner: &str, attr_name: &str, value: impl Into<String>) -> Self {
        self.values.lock().unwrap().insert(
            (device_id.to_string(), owner.to_string(), attr_name.to_string()),
            value.into(),
        );
        self
    }

    fn key_for(target: &AttrTarget, attr: &Attr) -> Option<AttrKey> {
        match target {
            AttrTarget::Context => None,
            AttrTarget::Device { device_id } => {
                Some((device_id.to_string(), device_id.to_string(), attr.name.clone()))
            }
            AttrTarget::Debug { device_id } => {
                Some((device_id.to_string(), device_id.to_string(), attr.name.clone()))
            }
            AttrTarget::Buffer { device_id, .. } => {
                Some((device_id.to_string(), device_id.to_string(), attr.name.clone()))
            }
            AttrTarget::Channel { device_id, channel_id, .. } => {
                Some((device_id.to_string(), channel_id.to_string(), attr.name.clone()))
            }
        }
    }
}

impl Backend for XmlBackend {
    fn backend_name(&self) -> &str {
        "xml"
    }

    fn describe(&self) -> Result<ContextDescriptor> {
        Ok(self.desc.clone())
    }

    fn clone_backend(&self) -> Result<Box<dyn Backend>> {
        Ok(Box::new(XmlBackend {
            desc: self.desc.clone(),
            values: Mutex::new(self.values.lock().unwrap().clone()),
        }))
    }

    fn read_attr(&self, target: &AttrTarget, attr: &Attr, dst: &mut [u8]) -> Result<usize> {
        let key = match Self::key_for(target, attr) {
            Some(k) => k,
            None => return Err(Error::Unsupported),
        };
        let values = self.values.lock().unwrap();
        let value = values.get(&key).map(String::as_str).unwrap_or("");
        let bytes = value.as_bytes();
        if bytes.len() >= dst.len() {
            return Err(Error::BadArgument("attribute value too large for buffer".into()));
        }
        dst[..bytes.len()].copy_from_slice(bytes);
        dst[bytes.len()] = 0;
        Ok(bytes.len() + 1)
    }

    fn write_attr(&self, target: &AttrTarget, attr: &Attr, data: &[u8]) -> Result<usize> {
        if matches!(target, AttrTarget::Context) {
            return Err(Error::Permission);
        }
        let key = Self::key_for(target, attr).ok_or(Error::Unsupported)?;
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::Malformed(e.to_string()))?
            .trim_end_matches('\0')
            .to_string();
        let len = text.len();
        self.values.lock().unwrap().insert(key, text);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::AttrKind;
    use crate::context::Context;

    fn sample_xml() -> &'static str {
        r#"<context name="xml" version-major="0" version-minor="32" version-git="deadbeef">
            <device id="dev0">
                <attribute name="foo"/>
            </device>
        </context>"#
    }

    #[test]
    fn reads_back_a_seeded_value_then_a_write() {
        let backend = XmlBackend::from_str(sample_xml()).unwrap().with_value("dev0", "dev0", "foo", "42");
        let ctx = Context::from_backend(Box::new(backend)).unwrap();
        let dev = ctx.find_device("dev0").unwrap();
        let attr = dev.device_attrs.find("foo").unwrap();

        let target = AttrTarget::Device { device_id: "dev0" };
        let mut buf = [0u8; 32];
        let n = ctx.backend().read_attr(&target, attr, &mut buf).unwrap();
        assert_eq!(std::str::from_utf8(&buf[..n - 1]).unwrap(), "42");

        ctx.backend().write_attr(&target, attr, b"99").unwrap();
        let n = ctx.backend().read_attr(&target, attr, &mut buf).unwrap();
        assert_eq!(std::str::from_utf8(&buf[..n - 1]).unwrap(), "99");
    }

    #[test]
    fn context_attribute_writes_are_rejected() {
        let backend = XmlBackend::from_str(sample_xml()).unwrap();
        let attr = Attr::new(AttrKind::Context, "hw_model");
        assert!(matches!(
            backend.write_attr(&AttrTarget::Context, &attr, b"x"),
            Err(Error::Permission)
        ));
    }
}
