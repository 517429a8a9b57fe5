// src/backend/usb.rs
//
// Copyright (c) 2023, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! The `usb:` backend: IIOD carried over USB bulk endpoints (§4.6 USB).
//! Endpoint 1 (IN 0x81 / OUT 0x01) is reserved for the control/attribute
//! channel and runs the same [`IiodClient`] framing as the network backend.
//! Each open buffer gets its own IN/OUT endpoint pair, claimed with a
//! vendor `OPEN_PIPE` request and released with `CLOSE_PIPE`; sample data
//! moves directly over that pair rather than through the control channel.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use futures_lite::future::block_on;
use nusb::transfer::{Control, ControlType, Recipient, RequestBuffer};
use nusb::{DeviceInfo, Interface, MaybeFuture};

use crate::backend::{AttrTarget, Backend, BufferHandle};
use crate::context::{ContextDescriptor, Version};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::iiod::client::IiodClient;
use crate::iiod::codec::AttrAddr;
use crate::mask::ChannelsMask;

const CONTROL_EP_IN: u8 = 0x81;
const CONTROL_EP_OUT: u8 = 0x01;
const FIRST_DATA_ENDPOINT: u8 = 2;
const VENDOR_TIMEOUT: Duration = Duration::from_secs(5);

// Vendor control requests recognized by an IIOD-over-USB gadget. Numbers
// are a local convention of this transport, not a standard.
const USB_RESET_PIPES: u8 = 0;
const USB_OPEN_PIPE: u8 = 1;
const USB_CLOSE_PIPE: u8 = 2;

fn usb_err(e: impl std::fmt::Display) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

fn addr_target<'a>(target: &'a AttrTarget<'a>) -> AttrAddr<'a> {
    match *target {
        AttrTarget::Context => unreachable!("context attrs never reach the wire"),
        AttrTarget::Device { device_id } => AttrAddr::Device { dev_id: device_id },
        AttrTarget::Debug { device_id } => AttrAddr::Debug { dev_id: device_id },
        AttrTarget::Buffer { device_id, buffer_index } => {
            AttrAddr::Buffer { dev_id: device_id, buf_id: buffer_index }
        }
        AttrTarget::Channel { device_id, channel_id, is_output } => {
            AttrAddr::Channel { dev_id: device_id, channel_id, is_output }
        }
    }
}

/// A duplex stream over the reserved control endpoint pair, used only to
/// carry [`IiodClient`] command/reply framing.
struct ControlPipe {
    interface: Interface,
}

impl Read for ControlPipe {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let request = RequestBuffer::new(buf.len());
        let completion = block_on(self.interface.bulk_in(CONTROL_EP_IN, request));
        let data = completion
            .into_result()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }
}

impl Write for ControlPipe {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let completion = block_on(self.interface.bulk_out(CONTROL_EP_OUT, buf.to_vec()));
        completion
            .into_result()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct OpenBuffer {
    dev_id: String,
    ep_in: u8,
    ep_out: u8,
    mask_width: usize,
}

pub struct UsbBackend {
    interface: Interface,
    client: Mutex<IiodClient<ControlPipe>>,
    desc: ContextDescriptor,
    devices: Vec<Device>,
    bus: u8,
    addr: u8,
    intf: u8,
    next_data_ep: Mutex<u8>,
    buffers: Mutex<HashMap<u64, OpenBuffer>>,
    next_handle: Mutex<u64>,
}

impl UsbBackend {
    pub fn open(bus: u8, addr: u8, intf: u8) -> Result<Self> {
        let info = find_device_info(bus, addr)?;
        let device = info.open().wait().map_err(usb_err)?;
        let interface = device.claim_interface(intf).wait().map_err(usb_err)?;

        vendor_request(&interface, intf, USB_RESET_PIPES, 0)?;

        let mut client = IiodClient::new(ControlPipe { interface: interface.clone() });
        let (major, minor, git_tag) = client.version()?;
        let xml = client.print_xml()?;
        let mut desc = crate::xmlcodec::parse(&xml)?;
        desc.version = Version { major, minor, git_tag };
        desc.name = format!("usb:{bus}.{addr}.{intf}");
        let devices = desc.devices.clone();

        Ok(UsbBackend {
            interface,
            client: Mutex::new(client),
            desc,
            devices,
            bus,
            addr,
            intf,
            next_data_ep: Mutex::new(FIRST_DATA_ENDPOINT),
            buffers: Mutex::new(HashMap::new()),
            next_handle: Mutex::new(1),
        })
    }

    fn find_device(&self, id: &str) -> Result<&Device> {
        self.devices.iter().find(|d| d.id == id).ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn scan() -> Result<Vec<crate::backend::ContextInfo>> {
        let infos: Vec<DeviceInfo> = nusb::list_devices().wait().map_err(usb_err)?.collect();
        Ok(infos
            .iter()
            .map(|d| crate::backend::ContextInfo {
                uri: format!("usb:{}.{}.0", d.bus_number(), d.device_address()),
                description: format!(
                    "{:04x}:{:04x} ({}.{})",
                    d.vendor_id(),
                    d.product_id(),
                    d.bus_number(),
                    d.device_address()
                ),
            })
            .collect())
    }
}

fn find_device_info(bus: u8, addr: u8) -> Result<DeviceInfo> {
    let mut devices = nusb::list_devices().wait().map_err(usb_err)?;
    if bus == 0 && addr == 0 {
        devices.next().ok_or_else(|| Error::NotFound("no usb device present".into()))
    }
    else {
        devices
            .find(|d| d.bus_number() == bus && d.device_address() == addr)
            .ok_or_else(|| Error::NotFound(format!("usb {bus}.{addr}")))
    }
}

fn vendor_request(interface: &Interface, intf: u8, request: u8, value: u16) -> Result<()> {
    interface
        .control_out_blocking(
            Control {
                control_type: ControlType::Vendor,
                recipient: Recipient::Interface,
                request,
                value,
                index: intf as u16,
            },
            &[],
            VENDOR_TIMEOUT,
        )
        .map_err(usb_err)?;
    Ok(())
}

impl Backend for UsbBackend {
    fn backend_name(&self) -> &str {
        "usb"
    }

    fn describe(&self) -> Result<ContextDescriptor> {
        Ok(self.desc.clone())
    }

    fn clone_backend(&self) -> Result<Box<dyn Backend>> {
        Ok(Box::new(UsbBackend::open(self.bus, self.addr, self.intf)?))
    }

    fn set_timeout(&self, ms: u64) -> Result<()> {
        // Remote timeout is kept below the caller's so a local poll always
        // sees the server's reply (or its own timeout) first.
        self.client.lock().unwrap().set_timeout(ms / 2)
    }

    fn get_trigger(&self, device_id: &str) -> Result<Option<String>> {
        self.client.lock().unwrap().get_trigger(device_id)
    }

    fn set_trigger(&self, device_id: &str, trigger_id: Option<&str>) -> Result<()> {
        self.client.lock().unwrap().set_trigger(device_id, trigger_id)
    }

    fn read_attr(&self, target: &AttrTarget, attr: &crate::attr::Attr, dst: &mut [u8]) -> Result<usize> {
        if matches!(target, AttrTarget::Context) {
            return Err(Error::Unsupported);
        }
        self.client.lock().unwrap().read_attr(&addr_target(target), &attr.name, dst)
    }

    fn write_attr(&self, target: &AttrTarget, attr: &crate::attr::Attr, data: &[u8]) -> Result<usize> {
        if matches!(target, AttrTarget::Context) {
            return Err(Error::Permission);
        }
        self.client.lock().unwrap().write_attr(&addr_target(target), &attr.name, data)
    }

    fn set_kernel_buffers_count(&self, device_id: &str, n: u32) -> Result<()> {
        self.client.lock().unwrap().set_buffers_count(device_id, n)
    }

    fn create_buffer(&self, device_id: &str, _index: u32, mask: &ChannelsMask) -> Result<BufferHandle> {
        let device = self.find_device(device_id)?;
        if mask.width() != device.channels.len() {
            return Err(Error::BadArgument("mask width does not match device channel count".into()));
        }

        let mut next_ep = self.next_data_ep.lock().unwrap();
        let ep = *next_ep;
        if ep == 0 {
            return Err(Error::Busy);
        }
        let ep_in = 0x80 | ep;
        let ep_out = ep;
        vendor_request(&self.interface, self.intf, USB_OPEN_PIPE, ep as u16)?;
        *next_ep += 1;

        self.client.lock().unwrap().open(device_id, mask, false)?;

        let mut next_handle = self.next_handle.lock().unwrap();
        let id = *next_handle;
        *next_handle += 1;
        self.buffers.lock().unwrap().insert(
            id,
            OpenBuffer { dev_id: device_id.to_string(), ep_in, ep_out, mask_width: mask.width() },
        );
        Ok(BufferHandle(id))
    }

    fn enable_buffer(&self, _handle: BufferHandle, _nb_samples: usize, _on: bool) -> Result<()> {
        // IIOD has no explicit enable/disable verb: OPEN starts the stream
        // and CLOSE (in free_buffer) ends it, same as the network backend.
        Ok(())
    }

    fn free_buffer(&self, handle: BufferHandle) -> Result<()> {
        if let Some(buf) = self.buffers.lock().unwrap().remove(&handle.0) {
            self.client.lock().unwrap().close(&buf.dev_id)?;
            vendor_request(&self.interface, self.intf, USB_CLOSE_PIPE, buf.ep_out as u16)?;
        }
        Ok(())
    }

    fn cancel_buffer(&self, _handle: BufferHandle) -> Result<()> {
        // nusb transfers are synchronous from this thread's point of view;
        // there is no separate canceller thread to interrupt, so the only
        // way to abort one is the device dropping the pipe itself.
        Err(Error::Unsupported)
    }

    fn readbuf(&self, handle: BufferHandle, data: &mut [u8]) -> Result<usize> {
        let ep_in = {
            let buffers = self.buffers.lock().unwrap();
            let buf = buffers.get(&handle.0).ok_or_else(|| Error::NotFound("buffer handle".into()))?;
            let _ = buf.mask_width;
            buf.ep_in
        };
        let request = RequestBuffer::new(data.len());
        let completion = block_on(self.interface.bulk_in(ep_in, request));
        let bytes = completion.into_result().map_err(usb_err)?;
        let n = bytes.len().min(data.len());
        data[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn writebuf(&self, handle: BufferHandle, data: &[u8]) -> Result<usize> {
        let ep_out = {
            let buffers = self.buffers.lock().unwrap();
            let buf = buffers.get(&handle.0).ok_or_else(|| Error::NotFound("buffer handle".into()))?;
            buf.ep_out
        };
        let completion = block_on(self.interface.bulk_out(ep_out, data.to_vec()));
        completion.into_result().map_err(usb_err)?;
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_endpoint_addresses_match_the_reserved_pipe() {
        assert_eq!(CONTROL_EP_IN, 0x80 | 1);
        assert_eq!(CONTROL_EP_OUT, 1);
    }

    #[test]
    fn data_endpoints_start_after_the_control_pipe() {
        assert!(FIRST_DATA_ENDPOINT > 1);
    }
}
