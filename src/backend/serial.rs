// src/backend/serial.rs
//
// Copyright (c) 2023, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! The `serial:` backend: IIOD carried over a single tty, addressed as
//! `serial:DEVNODE,BAUD[,BITSPARITYSTOPFLOW]` (§4.6 Serial). One duplex
//! stream plays both control and data roles, same as the network backend,
//! so there is nothing analogous to USB's per-buffer endpoint pairs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::backend::{AttrTarget, Backend, BufferHandle};
use crate::context::{ContextDescriptor, Version};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::iiod::client::IiodClient;
use crate::iiod::codec::AttrAddr;
use crate::mask::ChannelsMask;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

struct OpenBuffer {
    dev_id: String,
    mask_width: usize,
}

pub struct SerialBackend {
    client: Mutex<IiodClient<Box<dyn SerialPort>>>,
    desc: ContextDescriptor,
    devices: Vec<Device>,
    dev: String,
    baud: u32,
    bits: u8,
    parity: char,
    stop: u8,
    flow: char,
    buffers: Mutex<HashMap<u64, OpenBuffer>>,
    next_handle: Mutex<u64>,
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

fn data_bits(bits: u8) -> Result<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(Error::BadArgument(format!("unsupported data bits {other}"))),
    }
}

fn parity(c: char) -> Result<Parity> {
    match c {
        'n' | 'N' => Ok(Parity::None),
        'o' | 'O' => Ok(Parity::Odd),
        'e' | 'E' => Ok(Parity::Even),
        other => Err(Error::BadArgument(format!("unsupported parity {other:?}"))),
    }
}

fn stop_bits(n: u8) -> Result<StopBits> {
    match n {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(Error::BadArgument(format!("unsupported stop bits {other}"))),
    }
}

fn flow_control(c: char) -> Result<FlowControl> {
    match c {
        '\0' => Ok(FlowControl::None),
        'x' | 'X' => Ok(FlowControl::Software),
        'r' | 'R' => Ok(FlowControl::Hardware),
        other => Err(Error::BadArgument(format!("unsupported flow control {other:?}"))),
    }
}

impl SerialBackend {
    pub fn open(dev: &str, baud: u32, bits: u8, parity_c: char, stop: u8, flow: char) -> Result<Self> {
        let port = serialport::new(dev, baud)
            .data_bits(data_bits(bits)?)
            .parity(parity(parity_c)?)
            .stop_bits(stop_bits(stop)?)
            .flow_control(flow_control(flow)?)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

        let mut client = IiodClient::new(port);
        let (major, minor, git_tag) = client.version()?;
        let xml = client.print_xml()?;
        let mut desc = crate::xmlcodec::parse(&xml)?;
        desc.version = Version { major, minor, git_tag };
        desc.name = dev.to_string();
        desc.description = format!("{dev} @ {baud}");
        let devices = desc.devices.clone();

        Ok(SerialBackend {
            client: Mutex::new(client),
            desc,
            devices,
            dev: dev.to_string(),
            baud,
            bits,
            parity: parity_c,
            stop,
            flow,
            buffers: Mutex::new(HashMap::new()),
            next_handle: Mutex::new(1),
        })
    }

    fn find_device(&self, id: &str) -> Result<&Device> {
        self.devices.iter().find(|d| d.id == id).ok_or_else(|| Error::NotFound(id.to_string()))
    }
}

impl Backend for SerialBackend {
    fn backend_name(&self) -> &str {
        "serial"
    }

    fn describe(&self) -> Result<ContextDescriptor> {
        Ok(self.desc.clone())
    }

    fn clone_backend(&self) -> Result<Box<dyn Backend>> {
        Ok(Box::new(SerialBackend::open(&self.dev, self.baud, self.bits, self.parity, self.stop, self.flow)?))
    }

    fn set_timeout(&self, ms: u64) -> Result<()> {
        self.client.lock().unwrap().set_timeout(ms)
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
        self.client.lock().unwrap().open(device_id, mask, false)?;

        let mut next = self.next_handle.lock().unwrap();
        let id = *next;
        *next += 1;
        self.buffers
            .lock()
            .unwrap()
            .insert(id, OpenBuffer { dev_id: device_id.to_string(), mask_width: mask.width() });
        Ok(BufferHandle(id))
    }

    fn enable_buffer(&self, _handle: BufferHandle, _nb_samples: usize, _on: bool) -> Result<()> {
        Ok(())
    }

    fn free_buffer(&self, handle: BufferHandle) -> Result<()> {
        if let Some(buf) = self.buffers.lock().unwrap().remove(&handle.0) {
            self.client.lock().unwrap().close(&buf.dev_id)?;
        }
        Ok(())
    }

    fn cancel_buffer(&self, _handle: BufferHandle) -> Result<()> {
        // A tty has no analogue of a socket shutdown or a second fd to
        // interrupt a blocking read with; the configured read timeout
        // bounds how long a stalled transfer can block instead.
        Err(Error::Unsupported)
    }

    fn readbuf(&self, handle: BufferHandle, data: &mut [u8]) -> Result<usize> {
        let buffers = self.buffers.lock().unwrap();
        let buf = buffers.get(&handle.0).ok_or_else(|| Error::NotFound("buffer handle".into()))?;
        let (_mask, bytes) = self.client.lock().unwrap().read_buf(&buf.dev_id, data.len(), buf.mask_width)?;
        let n = bytes.len().min(data.len());
        data[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn writebuf(&self, handle: BufferHandle, data: &[u8]) -> Result<usize> {
        let buffers = self.buffers.lock().unwrap();
        let buf = buffers.get(&handle.0).ok_or_else(|| Error::NotFound("buffer handle".into()))?;
        self.client.lock().unwrap().write_buf(&buf.dev_id, data)?;
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_data_bits() {
        assert!(data_bits(9).is_err());
    }

    #[test]
    fn rejects_unsupported_parity() {
        assert!(parity('z').is_err());
    }

    #[test]
    fn accepts_default_8n1() {
        assert!(data_bits(8).is_ok());
        assert!(parity('n').is_ok());
        assert!(stop_bits(1).is_ok());
        assert!(flow_control('\0').is_ok());
    }
}
