//! Host address helpers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

/// First non-loopback IPv4 address of this host, the one members should
/// be told to join.
///
/// Routes a UDP socket toward a public address and reads back the local end.
/// Nothing is sent. `None` when the host has no usable IPv4 route.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// `host` with `port` appended unless it already carries one.
///
/// Accepts `1.2.3.4`, `1.2.3.4:9000`, `name`, `name:9000`, bare IPv6 and
/// bracketed IPv6 with a port.
pub fn with_default_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.parse::<SocketAddr>().is_ok() {
        return host.to_string();
    }
    if let Ok(v6) = host.parse::<Ipv6Addr>() {
        return SocketAddr::from((v6, port)).to_string();
    }
    if let Some((name, suffix)) = host.rsplit_once(':') {
        if !name.contains(':') && suffix.parse::<u16>().is_ok() {
            return host.to_string();
        }
    }
    format!("{host}:{port}")
}
