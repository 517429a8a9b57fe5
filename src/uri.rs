// src/uri.rs
//
// Copyright (c) 2018, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! URI parsing and backend dispatch: `local:`, `ip:HOST[:PORT]`,
//! `usb:BUS.ADDR[.INTF]`, `serial:DEVNODE,BAUD[,BITS,PARITY,STOP,FLOW]`,
//! `xml:PATH`, or a raw XML document (detected by a `<?xml` prefix).

use crate::backend::{Backend, ContextInfo};
use crate::context::Context;
use crate::error::{Error, Result};

/// A parsed URI, prior to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Uri<'a> {
    Local,
    Ip { host: &'a str, port: Option<u16> },
    Usb { bus: u8, addr: u8, intf: u8 },
    Serial { dev: &'a str, baud: u32, bits: u8, parity: char, stop: u8, flow: char },
    XmlPath(&'a str),
    XmlInline(&'a str),
}

/// Parses a URI string into its structured form without opening anything.
pub fn parse(uri: &str) -> Result<Uri<'_>> {
    let uri = uri.trim();
    if uri.starts_with("<?xml") {
        return Ok(Uri::XmlInline(uri));
    }

    let (scheme, rest) = uri.split_once(':').ok_or_else(|| {
        Error::BadArgument(format!("URI {uri:?} has no scheme"))
    })?;

    match scheme {
        "local" => Ok(Uri::Local),
        "ip" => {
            let (host, port) = match rest.rsplit_once(':') {
                // IPv6 literals are bracketed; a bare second colon with no
                // closing bracket means host:port.
                Some((h, p)) if !h.contains(']') || h.ends_with(']') => {
                    match p.parse::<u16>() {
                        Ok(port) => (h, Some(port)),
                        Err(_) => (rest, None),
                    }
                }
                _ => (rest, None),
            };
            let host = host.trim_start_matches('[').trim_end_matches(']');
            Ok(Uri::Ip { host, port })
        }
        "usb" => {
            if rest.is_empty() {
                return Ok(Uri::Usb { bus: 0, addr: 0, intf: 0 });
            }
            let parts: Vec<&str> = rest.split('.').collect();
            let bad = || Error::BadArgument(format!("bad usb URI {uri:?}"));
            let bus: u8 = parts.first().ok_or_else(bad)?.parse().map_err(|_| bad())?;
            let addr: u8 = parts.get(1).ok_or_else(bad)?.parse().map_err(|_| bad())?;
            let intf: u8 = match parts.get(2) {
                Some(s) => s.parse().map_err(|_| bad())?,
                None => 0,
            };
            Ok(Uri::Usb { bus, addr, intf })
        }
        "serial" => {
            let bad = || Error::BadArgument(format!("bad serial URI {uri:?}"));
            let parts: Vec<&str> = rest.split(',').collect();
            let dev = *parts.first().ok_or_else(bad)?;
            let baud: u32 = match parts.get(1) {
                Some(s) => s.parse().map_err(|_| bad())?,
                None => 115_200,
            };
            let (bits, parity, stop, flow) = match parts.get(2) {
                Some(cfg) => parse_serial_config(cfg)?,
                None => (8, 'n', 1, '\0'),
            };
            Ok(Uri::Serial { dev, baud, bits, parity, stop, flow })
        }
        "xml" => Ok(Uri::XmlPath(rest)),
        other => Err(Error::BadArgument(format!("unknown URI scheme {other:?}"))),
    }
}

fn parse_serial_config(cfg: &str) -> Result<(u8, char, u8, char)> {
    let bad = || Error::BadArgument(format!("bad serial config {cfg:?}"));
    let mut chars = cfg.chars();
    let bits: u8 = chars.next().ok_or_else(bad)?.to_digit(10).ok_or_else(bad)? as u8;
    let parity = chars.next().unwrap_or('n');
    let stop: u8 = chars.next().and_then(|c| c.to_digit(10)).unwrap_or(1) as u8;
    let flow = chars.next().unwrap_or('\0');
    Ok((bits, parity, stop, flow))
}

/// Opens a context for `uri`, dispatching to the compiled-in backend.
pub fn open(uri_str: &str) -> Result<Context> {
    match parse(uri_str)? {
        Uri::Local => {
            #[cfg(feature = "local")]
            {
                let backend = crate::backend::local::LocalBackend::open()?;
                return Context::from_backend(Box::new(backend));
            }
            #[cfg(not(feature = "local"))]
            Err(Error::Unsupported)
        }
        Uri::Ip { host, port } => {
            #[cfg(feature = "network")]
            {
                let backend = crate::backend::network::NetworkBackend::connect(host, port)?;
                return Context::from_backend(Box::new(backend));
            }
            #[cfg(not(feature = "network"))]
            {
                let _ = (host, port);
                Err(Error::Unsupported)
            }
        }
        Uri::Usb { bus, addr, intf } => {
            #[cfg(feature = "usb")]
            {
                let backend = crate::backend::usb::UsbBackend::open(bus, addr, intf)?;
                return Context::from_backend(Box::new(backend));
            }
            #[cfg(not(feature = "usb"))]
            {
                let _ = (bus, addr, intf);
                Err(Error::Unsupported)
            }
        }
        Uri::Serial { dev, baud, bits, parity, stop, flow } => {
            #[cfg(feature = "serial")]
            {
                let backend = crate::backend::serial::SerialBackend::open(dev, baud, bits, parity, stop, flow)?;
                return Context::from_backend(Box::new(backend));
            }
            #[cfg(not(feature = "serial"))]
            {
                let _ = (dev, baud, bits, parity, stop, flow);
                Err(Error::Unsupported)
            }
        }
        Uri::XmlPath(path) => {
            #[cfg(feature = "xml")]
            {
                let backend = crate::backend::xml::XmlBackend::from_path(path)?;
                return Context::from_backend(Box::new(backend));
            }
            #[cfg(not(feature = "xml"))]
            {
                let _ = path;
                Err(Error::Unsupported)
            }
        }
        Uri::XmlInline(doc) => {
            #[cfg(feature = "xml")]
            {
                let backend = crate::backend::xml::XmlBackend::from_str(doc)?;
                return Context::from_backend(Box::new(backend));
            }
            #[cfg(not(feature = "xml"))]
            {
                let _ = doc;
                Err(Error::Unsupported)
            }
        }
    }
}

/// Scans for reachable contexts in the named backend family
/// (`"local"`, `"ip"`, `"usb"`).
pub fn scan(backend_family: &str) -> Result<Vec<ContextInfo>> {
    match backend_family {
        #[cfg(feature = "local")]
        "local" => Ok(vec![ContextInfo { uri: "local:".into(), description: "Local IIO devices".into() }]),
        #[cfg(feature = "network")]
        "ip" => crate::backend::network::NetworkBackend::scan(),
        #[cfg(feature = "usb")]
        "usb" => crate::backend::usb::UsbBackend::scan(),
        _ => Err(Error::Unsupported),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_uri_with_port() {
        assert_eq!(parse("ip:192.168.2.1:30431").unwrap(), Uri::Ip { host: "192.168.2.1", port: Some(30431) });
    }

    #[test]
    fn parses_ip_uri_host_only() {
        assert_eq!(parse("ip:pluto.local").unwrap(), Uri::Ip { host: "pluto.local", port: None });
    }

    #[test]
    fn parses_ip_uri_empty_host_for_discovery() {
        assert_eq!(parse("ip:").unwrap(), Uri::Ip { host: "", port: None });
    }

    #[test]
    fn parses_usb_uri() {
        assert_eq!(parse("usb:3.32.5").unwrap(), Uri::Usb { bus: 3, addr: 32, intf: 5 });
        assert_eq!(parse("usb:3.32").unwrap(), Uri::Usb { bus: 3, addr: 32, intf: 0 });
    }

    #[test]
    fn parses_serial_uri() {
        assert_eq!(
            parse("serial:/dev/ttyUSB0,115200,8n1").unwrap(),
            Uri::Serial { dev: "/dev/ttyUSB0", baud: 115200, bits: 8, parity: 'n', stop: 1, flow: '\0' }
        );
    }

    #[test]
    fn detects_inline_xml() {
        assert!(matches!(parse("<?xml version=\"1.0\"?><context/>").unwrap(), Uri::XmlInline(_)));
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(parse("ftp:foo").is_err());
    }
}
