//! Outbound address discovery.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tracing::debug;

/// Any routable address works: a UDP connect only selects a route, nothing is sent.
pub const PROBE_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 1);
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Local address of the default outbound route, or `127.0.0.1` when there is none.
pub fn outbound_ip() -> IpAddr { outbound_ip_via(PROBE_ADDR) }

pub fn outbound_ip_via(probe: SocketAddr) -> IpAddr {
    let probe_once = || -> std::io::Result<IpAddr> {
        let sock = UdpSocket::bind(("0.0.0.0", 0))?;
        sock.connect(probe)?;
        Ok(sock.local_addr()?.ip())
    };
    match probe_once() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) => LOOPBACK,
        Err(e) => { debug!(error = %e, "outbound ip probe failed, using loopback"); LOOPBACK }
    }
}
