// src/xmlcodec.rs
//
// Copyright (c) 2023, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! The canonical XML exchange format (§6): `emit` turns a [`Context`] into
//! the same document any backend would hand another implementation;
//! `parse` turns such a document back into a [`ContextDescriptor`]. Used by
//! the `xml:` backend and by [`Context::try_clone`] for cross-backend
//! transfer.

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;
use quick_xml::Writer;
use std::io::Cursor;

use crate::attr::{Attr, AttrKind};
use crate::channel::{Channel, DataFormat, Direction};
use crate::context::{Context, ContextDescriptor, Version};
use crate::device::Device;
use crate::error::{Error, Result};

/// Serializes a [`Context`] to the canonical XML form.
pub fn emit(ctx: &Context) -> Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    let mut root = BytesStart::new("context");
    root.push_attribute(("name", ctx.name()));
    root.push_attribute(("version-major", ctx.version().major.to_string().as_str()));
    root.push_attribute(("version-minor", ctx.version().minor.to_string().as_str()));
    root.push_attribute(("version-git", ctx.version().git_tag.as_str()));
    if !ctx.description().is_empty() {
        root.push_attribute(("description", ctx.description()));
    }
    writer.write_event(Event::Start(root)).map_err(io_err)?;

    for attr in ctx.context_attrs().iter() {
        let value = ctx.context_attrs().value(&attr.name).unwrap_or_default().to_string();
        let mut el = BytesStart::new("context-attribute");
        el.push_attribute(("name", attr.name.as_str()));
        el.push_attribute(("value", value.as_str()));
        writer.write_event(Event::Empty(el)).map_err(io_err)?;
    }

    for dev in ctx.devices() {
        emit_device(&mut writer, dev)?;
    }

    writer.write_event(Event::End(quick_xml::events::BytesEnd::new("context"))).map_err(io_err)?;

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).map_err(|e| Error::Malformed(e.to_string()))
}

fn emit_device<W: std::io::Write>(writer: &mut Writer<W>, dev: &Device) -> Result<()> {
    let mut el = BytesStart::new("device");
    el.push_attribute(("id", dev.id.as_str()));
    if let Some(name) = &dev.name {
        el.push_attribute(("name", name.as_str()));
    }
    if let Some(label) = &dev.label {
        el.push_attribute(("label", label.as_str()));
    }
    writer.write_event(Event::Start(el)).map_err(io_err)?;

    for chan in &dev.channels {
        emit_channel(writer, chan)?;
    }
    emit_attr_list(writer, dev.device_attrs.iter(), "attribute")?;
    emit_attr_list(writer, dev.debug_attrs.iter(), "debug-attribute")?;
    emit_attr_list(writer, dev.buffer_attrs.iter(), "buffer-attribute")?;

    writer.write_event(Event::End(quick_xml::events::BytesEnd::new("device"))).map_err(io_err)?;
    Ok(())
}

fn emit_attr_list<'a, W: std::io::Write>(
    writer: &mut Writer<W>,
    attrs: impl Iterator<Item = &'a Attr>,
    tag: &str,
) -> Result<()> {
    for attr in attrs {
        let mut el = BytesStart::new(tag);
        el.push_attribute(("name", attr.name.as_str()));
        if attr.filename != attr.name {
            el.push_attribute(("filename", attr.filename.as_str()));
        }
        writer.write_event(Event::Empty(el)).map_err(io_err)?;
    }
    Ok(())
}

fn emit_channel<W: std::io::Write>(writer: &mut Writer<W>, chan: &Channel) -> Result<()> {
    let mut el = BytesStart::new("channel");
    el.push_attribute(("id", chan.id.as_str()));
    el.push_attribute(("type", if chan.direction == Direction::Output { "output" } else { "input" }));
    if let Some(name) = &chan.name {
        el.push_attribute(("name", name.as_str()));
    }
    writer.write_event(Event::Start(el)).map_err(io_err)?;

    if chan.is_scan_element {
        let mut se = BytesStart::new("scan-element");
        se.push_attribute(("index", chan.scan_index.to_string().as_str()));
        se.push_attribute(("format", chan.format.to_format_string().as_str()));
        if chan.format.with_scale {
            se.push_attribute(("scale", chan.format.scale.to_string().as_str()));
        }
        writer.write_event(Event::Empty(se)).map_err(io_err)?;
    }
    emit_attr_list(writer, chan.attrs.iter(), "attribute")?;

    writer.write_event(Event::End(quick_xml::events::BytesEnd::new("channel"))).map_err(io_err)?;
    Ok(())
}

fn io_err(e: quick_xml::Error) -> Error {
    Error::Malformed(e.to_string())
}

/// Parses the canonical XML form back into a [`ContextDescriptor`].
pub fn parse(xml: &str) -> Result<ContextDescriptor> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut desc = ContextDescriptor {
        name: String::new(),
        description: String::new(),
        version: Version { major: 0, minor: 0, git_tag: String::new() },
        attrs: Vec::new(),
        devices: Vec::new(),
    };

    let mut cur_device: Option<Device> = None;
    let mut cur_channel: Option<Channel> = None;

    loop {
        let event = reader.read_event().map_err(|e| Error::Malformed(e.to_string()))?;
        let is_empty = matches!(event, Event::Empty(_));
        match event {
            Event::Eof => break,
            Event::Start(e) | Event::Empty(e) => {
                let name = str::from_utf8(e.name().as_ref()).unwrap_or_default().to_string();
                let attrs = read_attrs(&e)?;
                match name.as_str() {
                    "context" => {
                        desc.name = attrs.get("name").cloned().unwrap_or_default();
                        desc.description = attrs.get("description").cloned().unwrap_or_default();
                        desc.version = Version {
                            major: attrs.get("version-major").and_then(|s| s.parse().ok()).unwrap_or(0),
                            minor: attrs.get("version-minor").and_then(|s| s.parse().ok()).unwrap_or(0),
                            git_tag: attrs.get("version-git").cloned().unwrap_or_default(),
                        };
                    }
                    "context-attribute" => {
                        let n = attrs.get("name").cloned().unwrap_or_default();
                        let v = attrs.get("value").cloned().unwrap_or_default();
                        desc.attrs.push((n, v));
                    }
                    "device" => {
                        let mut dev = Device::new(attrs.get("id").cloned().unwrap_or_default());
                        dev.name = attrs.get("name").cloned();
                        dev.label = attrs.get("label").cloned();
                        cur_device = Some(dev);
                    }
                    "channel" => {
                        let id = attrs.get("id").cloned().unwrap_or_default();
                        let dir = if attrs.get("type").map(String::as_str) == Some("output") {
                            Direction::Output
                        }
                        else {
                            Direction::Input
                        };
                        let mut chan = Channel::new(id, dir);
                        chan.name = attrs.get("name").cloned();
                        cur_channel = Some(chan);
                    }
                    "scan-element" => {
                        if let Some(chan) = cur_channel.as_mut() {
                            chan.is_scan_element = true;
                            chan.scan_index = attrs
                                .get("index")
                                .and_then(|s| s.parse().ok())
                                .unwrap_or(-1);
                            if let Some(fmt) = attrs.get("format") {
                                chan.format = DataFormat::parse(fmt)?;
                            }
                            if let Some(scale) = attrs.get("scale") {
                                chan.format.with_scale = true;
                                chan.format.scale = scale.parse().unwrap_or(1.0);
                            }
                        }
                    }
                    tag @ ("attribute" | "debug-attribute" | "buffer-attribute") => {
                        let attr_name = attrs.get("name").cloned().unwrap_or_default();
                        let filename = attrs.get("filename").cloned().unwrap_or_else(|| attr_name.clone());
                        if let Some(chan) = cur_channel.as_mut() {
                            if tag == "attribute" {
                                chan.attrs.insert(Attr::with_filename(AttrKind::Channel, attr_name, filename), None);
                            }
                        }
                        else if let Some(dev) = cur_device.as_mut() {
                            let kind = match tag {
                                "debug-attribute" => AttrKind::Debug,
                                "buffer-attribute" => AttrKind::Buffer,
                                _ => AttrKind::Device,
                            };
                            let list = match kind {
                                AttrKind::Debug => &mut dev.debug_attrs,
                                AttrKind::Buffer => &mut dev.buffer_attrs,
                                _ => &mut dev.device_attrs,
                            };
                            list.insert(Attr::with_filename(kind, attr_name, filename), None);
                        }
                    }
                    _ => {}
                }
                // A self-closed <channel/> or <device/> has no matching
                // Event::End, so finalize it immediately.
                if is_empty && name == "channel" {
                    if let (Some(chan), Some(dev)) = (cur_channel.take(), cur_device.as_mut()) {
                        dev.channels.push(chan);
                    }
                }
                else if is_empty && name == "device" {
                    if let Some(dev) = cur_device.take() {
                        desc.devices.push(dev);
                    }
                }
            }
            Event::End(e) => {
                let name_buf = e.name();
                let name = str::from_utf8(name_buf.as_ref()).unwrap_or_default();
                match name {
                    "channel" => {
                        if let (Some(chan), Some(dev)) = (cur_channel.take(), cur_device.as_mut()) {
                            dev.channels.push(chan);
                        }
                    }
                    "device" => {
                        if let Some(dev) = cur_device.take() {
                            desc.devices.push(dev);
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    for dev in desc.devices.iter_mut() {
        crate::device::reorder_channels(dev);
    }

    Ok(desc)
}

fn read_attrs(e: &BytesStart) -> Result<std::collections::HashMap<String, String>> {
    let mut map = std::collections::HashMap::new();
    for a in e.attributes() {
        let a = a.map_err(|err| Error::Malformed(err.to_string()))?;
        let key = str::from_utf8(a.key.as_ref()).unwrap_or_default().to_string();
        let value = a.unescape_value().map_err(|err| Error::Malformed(err.to_string()))?.into_owned();
        map.insert(key, value);
    }
    Ok(map)
}

/// XML-escapes text content, used when a value (not an attribute) must be
/// emitted verbatim. The canonical form only ever uses attributes, so this
/// is exposed for backends that embed free text (e.g. a description).
pub fn escape_text(s: &str) -> String {
    let mut buf = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut buf));
    let _ = writer.write_event(Event::Text(BytesText::new(s)));
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::xml::XmlBackend;

    #[test]
    fn round_trips_a_minimal_context() {
        let doc = r#"<context name="xml" version-major="0" version-minor="32" version-git="deadbeef">
            <device id="iio:device0">
                <channel id="voltage0" type="input">
                    <scan-element index="0" format="le:S12/16>>0"/>
                </channel>
            </device>
        </context>"#;
        let backend = XmlBackend::from_str(doc).unwrap();
        let ctx = Context::from_backend(Box::new(backend)).unwrap();
        let xml = emit(&ctx).unwrap();

        let backend2 = XmlBackend::from_str(&xml).unwrap();
        let ctx2 = Context::from_backend(Box::new(backend2)).unwrap();

        assert_eq!(ctx, ctx2);
    }
}
