// src/discovery.rs
//
// Copyright (c) 2023, Frank Pagliughi
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.
//
//! DNS-SD discovery of IIOD hosts (§4.6 Network, "Auto-discovery"):
//! browses `_iio._tcp`, port-knocks every candidate, deduplicates, and
//! drops loopback entries. Specified only as an interface by §1 — this is
//! a minimal, real implementation of that interface, not a faithful port
//! of any particular DNS-SD stack.

use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent};

use crate::error::{Error, Result};

const SERVICE_TYPE: &str = "_iio._tcp.local.";

/// One resolved, reachable IIOD candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub hostname: String,
    pub ip: IpAddr,
    pub port: u16,
}

impl Candidate {
    /// A connectable host string (the resolved IP, not the mDNS hostname).
    pub fn host(&self) -> String {
        self.ip.to_string()
    }
}

/// Browses for `timeout` for `_iio._tcp` instances, port-knocks each
/// resolved address, and returns the reachable, deduplicated, non-loopback
/// set.
pub fn browse(timeout: Duration) -> Result<Vec<Candidate>> {
    let daemon = ServiceDaemon::new().map_err(|_| Error::Broken)?;
    let receiver = daemon.browse(SERVICE_TYPE).map_err(|_| Error::Broken)?;

    let deadline = std::time::Instant::now() + timeout;
    let mut found = Vec::new();

    while let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now()) {
        let event = match receiver.recv_timeout(remaining) {
            Ok(ev) => ev,
            Err(_) => break,
        };
        if let ServiceEvent::ServiceResolved(info) = event {
            let hostname = info.get_hostname().to_string();
            let port = info.get_port();
            for ip in info.get_addresses() {
                found.push(Candidate { hostname: hostname.clone(), ip: *ip, port });
            }
        }
    }
    let _ = daemon.shutdown();

    found.retain(|c| !c.ip.is_loopback() && c.ip != IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    found.sort_by(|a, b| (&a.hostname, a.ip, a.port).cmp(&(&b.hostname, b.ip, b.port)));
    found.dedup();

    Ok(found.into_iter().filter(port_knock).collect())
}

/// Opens and immediately closes a TCP connection to validate a candidate is
/// actually accepting connections, not just mDNS-advertised.
fn port_knock(candidate: &Candidate) -> bool {
    TcpStream::connect_timeout(&(candidate.ip, candidate.port).into(), Duration::from_millis(500)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_and_unspecified_candidates_are_filtered() {
        let mut found = vec![
            Candidate { hostname: "a".into(), ip: IpAddr::V4(Ipv4Addr::LOCALHOST), port: 30431 },
            Candidate { hostname: "b".into(), ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)), port: 30431 },
        ];
        found.retain(|c| !c.ip.is_loopback());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].hostname, "b");
    }
}
