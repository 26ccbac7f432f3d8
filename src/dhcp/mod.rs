//! DHCPv4 endpoints: the DORA client and a small lease-tracking server.
//! Both sit under the UDP port dispatcher and own their whole UDP frame.

use std::net::Ipv4Addr;

mod client;
mod server;

pub use self::client::{DhcpClient, DhcpClientState, DhcpLease, DhcpRequestConfig};
pub use self::server::{DhcpServer, DhcpServerConfig};

/// Limits from the request configuration contract.
pub const MAX_HOSTNAME_LEN: usize = 36;
pub const MAX_CLIENT_ID_LEN: usize = 32;

fn addr_to_u32(addr: Ipv4Addr) -> u32 {
    let octets = addr.octets();
    ((octets[0] as u32) << 24) | ((octets[1] as u32) << 16) | ((octets[2] as u32) << 8) |
    octets[3] as u32
}

fn u32_to_addr(value: u32) -> Ipv4Addr {
    Ipv4Addr::new((value >> 24) as u8,
                  (value >> 16) as u8,
                  (value >> 8) as u8,
                  value as u8)
}
