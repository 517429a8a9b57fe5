// src/backend/local.rs
//
// Copyright (c) 2023, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! The Linux sysfs/chardev backend: `local:`. Attribute I/O goes straight
//! to `/sys/bus/iio/devices/<id>/<filename>`; buffer I/O reads/writes
//! `/dev/<id>` with a self-pipe watched alongside the data fd so a buffer
//! cancel can unblock an in-flight read. Exact sysfs channel-discovery
//! heuristics and the kernel MMAP block ioctls are treated as an external
//! backend detail (§1 Non-goals) — this backend services every device
//! attribute through real files, but always reports the MMAP fast path as
//! unsupported so the core's heap-block fallback carries buffer I/O.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd;

use crate::attr::{Attr, AttrKind};
use crate::backend::{AttrTarget, Backend, BufferHandle};
use crate::context::{ContextDescriptor, Version};
use crate::device::{promote_channel_attrs, reorder_channels, Device};
use crate::error::{Error, Result};
use crate::mask::ChannelsMask;

const DEFAULT_SYSFS_ROOT: &str = "/sys/bus/iio/devices";
const DEFAULT_DEV_ROOT: &str = "/dev";

pub struct LocalBackend {
    sysfs_root: PathBuf,
    dev_root: PathBuf,
    desc: ContextDescriptor,
    /// One open chardev + cancel pipe per buffer index, keyed by the handle
    /// returned from `create_buffer`.
    buffers: Mutex<HashMap<u64, OpenBuffer>>,
    next_handle: Mutex<u64>,
}

struct OpenBuffer {
    device_id: String,
    file: fs::File,
    cancel_read: RawFd,
    cancel_write: RawFd,
}

impl LocalBackend {
    pub fn open() -> Result<Self> {
        Self::open_at(DEFAULT_SYSFS_ROOT, DEFAULT_DEV_ROOT)
    }

    fn open_at(sysfs_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Result<Self> {
        let sysfs_root = sysfs_root.into();
        let dev_root = dev_root.into();
        let desc = scan(&sysfs_root)?;
        Ok(LocalBackend {
            sysfs_root,
            dev_root,
            desc,
            buffers: Mutex::new(HashMap::new()),
            next_handle: Mutex::new(1),
        })
    }

    fn attr_path(&self, target: &AttrTarget, attr: &Attr) -> Result<PathBuf> {
        match target {
            AttrTarget::Context => Err(Error::Unsupported),
            AttrTarget::Device { device_id } => {
                Ok(self.sysfs_root.join(device_id).join(&attr.filename))
            }
            AttrTarget::Debug { device_id } => {
                Ok(self.sysfs_root.join(device_id).join("debug").join(&attr.filename))
            }
            AttrTarget::Buffer { device_id, buffer_index } => {
                let sub = if *buffer_index == 0 {
                    "buffer".to_string()
                }
                else {
                    format!("buffer{buffer_index}")
                };
                Ok(self.sysfs_root.join(device_id).join(sub).join(&attr.filename))
            }
            AttrTarget::Channel { device_id, .. } => {
                Ok(self.sysfs_root.join(device_id).join(&attr.filename))
            }
        }
    }
}

/// Opens `path` and reads it to a string, retrying on `EAGAIN`/`EINTR`
/// exactly as the propagation policy requires (§7): these never surface as
/// errors to the caller.
fn read_retrying(path: &Path) -> Result<String> {
    loop {
        match fs::read_to_string(path) {
            Ok(s) => return Ok(s),
            Err(e) => match e.raw_os_error().map(Errno::from_i32) {
                Some(Errno::EAGAIN) | Some(Errno::EINTR) => continue,
                _ => return Err(Error::from(e)),
            },
        }
    }
}

fn write_retrying(path: &Path, data: &[u8]) -> Result<usize> {
    loop {
        match fs::OpenOptions::new().write(true).open(path) {
            Ok(mut f) => match f.write(data) {
                Ok(n) => return Ok(n),
                Err(e) => match e.raw_os_error().map(Errno::from_i32) {
                    Some(Errno::EAGAIN) | Some(Errno::EINTR) => continue,
                    _ => return Err(Error::from(e)),
                },
            },
            Err(e) => match e.raw_os_error().map(Errno::from_i32) {
                Some(Errno::EAGAIN) | Some(Errno::EINTR) => continue,
                _ => return Err(Error::from(e)),
            },
        }
    }
}

impl Backend for LocalBackend {
    fn backend_name(&self) -> &str {
        "local"
    }

    fn describe(&self) -> Result<ContextDescriptor> {
        Ok(self.desc.clone())
    }

    fn clone_backend(&self) -> Result<Box<dyn Backend>> {
        Ok(Box::new(LocalBackend::open_at(self.sysfs_root.clone(), self.dev_root.clone())?))
    }

    fn set_timeout(&self, _ms: u64) -> Result<()> {
        // Local I/O is synchronous file access; no per-call timeout knob.
        Ok(())
    }

    fn read_attr(&self, target: &AttrTarget, attr: &Attr, dst: &mut [u8]) -> Result<usize> {
        let path = self.attr_path(target, attr)?;
        let value = read_retrying(&path)?;
        let bytes = value.trim_end_matches('\n').as_bytes();
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
        let path = self.attr_path(target, attr)?;
        write_retrying(&path, data)
    }

    fn create_buffer(&self, device_id: &str, _index: u32, _mask: &ChannelsMask) -> Result<BufferHandle> {
        let dev_path = self.dev_root.join(device_id);
        let file = fs::OpenOptions::new().read(true).write(true).open(&dev_path)?;
        let (cancel_read, cancel_write) = unistd::pipe().map_err(Error::from)?;

        let mut next = self.next_handle.lock().unwrap();
        let id = *next;
        *next += 1;
        self.buffers.lock().unwrap().insert(
            id,
            OpenBuffer { device_id: device_id.to_string(), file, cancel_read, cancel_write },
        );
        Ok(BufferHandle(id))
    }

    fn free_buffer(&self, handle: BufferHandle) -> Result<()> {
        if let Some(buf) = self.buffers.lock().unwrap().remove(&handle.0) {
            let _ = unistd::close(buf.cancel_read);
            let _ = unistd::close(buf.cancel_write);
        }
        Ok(())
    }

    fn enable_buffer(&self, handle: BufferHandle, nb_samples: usize, on: bool) -> Result<()> {
        let buffers = self.buffers.lock().unwrap();
        let buf = buffers.get(&handle.0).ok_or_else(|| Error::NotFound("buffer handle".into()))?;
        let dir = self.sysfs_root.join(&buf.device_id).join("buffer");
        if on {
            write_retrying(&dir.join("length"), nb_samples.to_string().as_bytes())?;
        }
        write_retrying(&dir.join("enable"), if on { b"1" } else { b"0" })?;
        Ok(())
    }

    fn cancel_buffer(&self, handle: BufferHandle) -> Result<()> {
        let buffers = self.buffers.lock().unwrap();
        let buf = buffers.get(&handle.0).ok_or_else(|| Error::NotFound("buffer handle".into()))?;
        // Wakes any poll() blocked in readbuf/writebuf below.
        let _ = unistd::write(buf.cancel_write, &[1u8]);
        Ok(())
    }

    fn readbuf(&self, handle: BufferHandle, data: &mut [u8]) -> Result<usize> {
        let buffers = self.buffers.lock().unwrap();
        let buf = buffers.get(&handle.0).ok_or_else(|| Error::NotFound("buffer handle".into()))?;
        wait_readable(&buf.file, buf.cancel_read)?;
        let fd = buf.file.as_raw_fd();
        loop {
            match unistd::read(fd, data) {
                Ok(n) => return Ok(n),
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    fn writebuf(&self, handle: BufferHandle, data: &[u8]) -> Result<usize> {
        let buffers = self.buffers.lock().unwrap();
        let buf = buffers.get(&handle.0).ok_or_else(|| Error::NotFound("buffer handle".into()))?;
        let fd = buf.file.as_raw_fd();
        loop {
            match unistd::write(fd, data) {
                Ok(n) => return Ok(n),
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::from(e)),
            }
        }
    }
}

/// Blocks until `file` is readable or `cancel_fd` becomes readable
/// (`cancel_buffer` wrote to it), returning [`Error::Cancelled`] in the
/// latter case.
fn wait_readable(file: &fs::File, cancel_fd: RawFd) -> Result<()> {
    let mut fds = [
        PollFd::new(file.as_raw_fd(), PollFlags::POLLIN),
        PollFd::new(cancel_fd, PollFlags::POLLIN),
    ];
    loop {
        match poll(&mut fds, -1) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
    if fds[1].revents().map(|r| r.contains(PollFlags::POLLIN)).unwrap_or(false) {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Enumerates `/sys/bus/iio/devices/iio:deviceN` directories into a
/// [`ContextDescriptor`]. Channel discovery walks `scan_elements/` for
/// scan-capable channels; every other file directly under the device
/// directory becomes a device attribute, then gets a chance to be
/// re-homed onto a channel by [`promote_channel_attrs`].
fn scan(sysfs_root: &Path) -> Result<ContextDescriptor> {
    let mut devices = Vec::new();
    let entries = fs::read_dir(sysfs_root).map_err(Error::from)?;
    for entry in entries {
        let entry = entry.map_err(Error::from)?;
        let id = entry.file_name().to_string_lossy().into_owned();
        if !id.starts_with("iio:device") && !id.starts_with("trigger") {
            continue;
        }
        devices.push(scan_device(&entry.path(), id)?);
    }
    devices.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(ContextDescriptor {
        name: "local".into(),
        description: "Local IIO devices".into(),
        version: Version { major: 0, minor: 1, git_tag: "unknown".into() },
        attrs: Vec::new(),
        devices,
    })
}

fn scan_device(path: &Path, id: String) -> Result<Device> {
    let mut device = Device::new(id.as_str());
    device.name = fs::read_to_string(path.join("name")).ok().map(|s| s.trim().to_string());
    device.label = fs::read_to_string(path.join("label")).ok().map(|s| s.trim().to_string());

    let mut raw = HashMap::new();
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "name" || name == "label" || name == "uevent" || name == "subsystem" || name == "power" {
                continue;
            }
            if entry.path().is_dir() {
                continue;
            }
            if let Ok(value) = fs::read_to_string(entry.path()) {
                raw.insert(name, value.trim().to_string());
            }
        }
    }

    for_each_scan_element(path, &mut device)?;

    for filename in raw.keys() {
        if filename.starts_with("in_") || filename.starts_with("out_") {
            continue; // handled by promote_channel_attrs below
        }
        device.push_attr(AttrKind::Device, filename.clone());
    }
    promote_channel_attrs(&mut device, &raw);
    reorder_channels(&mut device);
    Ok(device)
}

/// Discovers scan-element channels from `scan_elements/<dir>_<id>_en`,
/// reading the matching `_index` and `_type` files for each.
fn for_each_scan_element(device_path: &Path, device: &mut Device) -> Result<()> {
    let scan_dir = device_path.join("scan_elements");
    let Ok(entries) = fs::read_dir(&scan_dir)
    else {
        return Ok(());
    };
    for entry in entries.flatten() {
        let filename = entry.file_name().to_string_lossy().into_owned();
        let Some(base) = filename.strip_suffix("_en")
        else {
            continue;
        };
        let (dir, id) = match base.strip_prefix("in_") {
            Some(rest) => (crate::channel::Direction::Input, rest),
            None => match base.strip_prefix("out_") {
                Some(rest) => (crate::channel::Direction::Output, rest),
                None => continue,
            },
        };

        let mut chan = crate::channel::Channel::new(id, dir);
        chan.is_scan_element = true;
        chan.scan_index = fs::read_to_string(scan_dir.join(format!("{base}_index")))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(-1);
        if let Ok(fmt) = fs::read_to_string(scan_dir.join(format!("{base}_type"))) {
            if let Ok(parsed) = crate::channel::DataFormat::parse(fmt.trim()) {
                chan.format = parsed;
            }
        }
        device.channels.push(chan);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_path_routes_by_target_kind() {
        let backend = LocalBackend {
            sysfs_root: PathBuf::from("/sys/bus/iio/devices"),
            dev_root: PathBuf::from("/dev"),
            desc: ContextDescriptor {
                name: "local".into(),
                description: String::new(),
                version: Version { major: 0, minor: 0, git_tag: String::new() },
                attrs: Vec::new(),
                devices: Vec::new(),
            },
            buffers: Mutex::new(HashMap::new()),
            next_handle: Mutex::new(1),
        };
        let attr = Attr::new(AttrKind::Device, "sampling_frequency");
        let target = AttrTarget::Device { device_id: "iio:device0" };
        assert_eq!(
            backend.attr_path(&target, &attr).unwrap(),
            PathBuf::from("/sys/bus/iio/devices/iio:device0/sampling_frequency")
        );

        let debug_target = AttrTarget::Debug { device_id: "iio:device0" };
        assert_eq!(
            backend.attr_path(&debug_target, &attr).unwrap(),
            PathBuf::from("/sys/bus/iio/devices/iio:device0/debug/sampling_frequency")
        );
    }

    #[test]
    fn scanning_a_missing_root_is_not_found() {
        assert!(scan(Path::new("/nonexistent/iio/root/for/this/crate")).is_err());
    }
}
