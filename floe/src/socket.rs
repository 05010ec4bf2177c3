// Copyright (C) 2024 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Socket helpers: dual-stack UDP binding, port ranges, and host address
//! enumeration.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

/// Bind the agent's single UDP socket.  A dual-stack IPv6 socket is
/// preferred so a single socket can reach both families; plain IPv4 is the
/// fallback.  When a port range is configured, ports are tried in order.
pub(crate) fn bind_udp(port_range: Option<(u16, u16)>) -> io::Result<UdpSocket> {
    let ports: Vec<u16> = match port_range {
        Some((begin, end)) if begin <= end => (begin..=end).collect(),
        _ => vec![0],
    };
    let mut last_err = None;
    for port in ports {
        match bind_dual_stack(port) {
            Ok(socket) => return Ok(socket),
            Err(e) => last_err = Some(e),
        }
        match bind_ipv4(port) {
            Ok(socket) => return Ok(socket),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no port available")))
}

fn bind_dual_stack(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    // reachable from both families through one socket where the platform
    // allows it
    if let Err(e) = socket.set_only_v6(false) {
        debug!("could not clear IPV6_V6ONLY: {e}");
    }
    let bind_addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
    socket.bind(&bind_addr.into())?;
    Ok(socket.into())
}

fn bind_ipv4(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&bind_addr.into())?;
    Ok(socket.into())
}

/// Enumerate the local addresses to advertise as host candidates, capped
/// at `max`.  Loopback addresses are only used when nothing else exists,
/// so an isolated machine can still negotiate with itself.
pub(crate) fn local_host_addresses(socket: &UdpSocket, max: usize) -> Vec<SocketAddr> {
    let port = match socket.local_addr() {
        Ok(addr) => addr.port(),
        Err(_) => return vec![],
    };
    let interfaces = match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            debug!("could not enumerate interfaces: {e}");
            vec![]
        }
    };
    let mut addrs: Vec<SocketAddr> = interfaces
        .iter()
        .map(|interface| interface.ip())
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified() && !ip.is_multicast())
        .filter(|ip| match ip {
            IpAddr::V4(_) => true,
            // link-local v6 requires scope ids this agent does not signal
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
        })
        .map(|ip| SocketAddr::new(ip, port))
        .collect();
    addrs.dedup();
    if addrs.is_empty() {
        addrs.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
        if socket.local_addr().map_or(false, |a| a.is_ipv6()) {
            addrs.push(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port));
        }
    }
    addrs.truncate(max);
    trace!("local host addresses: {addrs:?}");
    addrs
}

/// Rewrite a destination for the socket's family: a dual-stack IPv6
/// socket sends to IPv4 destinations through the mapped form.
pub(crate) fn map_for_socket(socket_is_v6: bool, addr: SocketAddr) -> SocketAddr {
    match (socket_is_v6, addr) {
        (true, SocketAddr::V4(v4)) => {
            SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
        }
        _ => addr,
    }
}

/// Undo the v6 mapping on a received source address so it compares equal
/// to signalled IPv4 candidates.
pub(crate) fn unmap_source(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_any_port() {
        let socket = bind_udp(None).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn bind_in_range() {
        // a wide range somewhere unlikely to be fully occupied
        let socket = bind_udp(Some((40000, 40100))).unwrap();
        let port = socket.local_addr().unwrap().port();
        assert!((40000..=40100).contains(&port));
    }

    #[test]
    fn host_addresses_never_empty() {
        let socket = bind_udp(None).unwrap();
        let addrs = local_host_addresses(&socket, 7);
        assert!(!addrs.is_empty());
        assert!(addrs.len() <= 7);
        for addr in addrs {
            assert_eq!(addr.port(), socket.local_addr().unwrap().port());
        }
    }

    #[test]
    fn v4_mapping_roundtrip() {
        let v4: SocketAddr = "192.0.2.1:4242".parse().unwrap();
        let mapped = map_for_socket(true, v4);
        assert!(mapped.is_ipv6());
        assert_eq!(unmap_source(mapped), v4);
        // v6 destinations are untouched
        let v6: SocketAddr = "[2001:db8::1]:4242".parse().unwrap();
        assert_eq!(map_for_socket(true, v6), v6);
        assert_eq!(unmap_source(v6), v6);
    }
}
