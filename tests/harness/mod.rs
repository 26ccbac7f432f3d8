//! Shared plumbing for the end-to-end tests: builds a complete host stack
//! (Ethernet, IPv4, TCP and UDP port dispatchers) and shuttles frames
//! between two of them through an in-memory carrier.

// Not every test crate uses every helper.
#![allow(dead_code)]

use ripstack::ethernet::{EthernetConfig, EthernetStack};
use ripstack::ipv4::IpStack;
use ripstack::port::PortStack;
use ripstack::wire::MacAddr;
use ripstack::wire::ipv4::{PROTOCOL_TCP, PROTOCOL_UDP};

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

pub struct Host {
    pub ethernet: EthernetStack,
    pub ip: Arc<Mutex<IpStack>>,
    pub tcp: Arc<Mutex<PortStack>>,
    pub udp: Arc<Mutex<PortStack>>,
}

/// Builds one complete host. The gateway MAC is the peer's address so two
/// hosts form a point to point segment.
pub fn host(mac: MacAddr, gateway: MacAddr, addr: Ipv4Addr) -> Host {
    let mut ethernet = EthernetStack::new(EthernetConfig::new(mac, gateway));
    let ip = Arc::new(Mutex::new(IpStack::new(addr, 4)));
    let tcp = Arc::new(Mutex::new(PortStack::new(PROTOCOL_TCP, 8)));
    let udp = Arc::new(Mutex::new(PortStack::new(PROTOCOL_UDP, 8)));
    ip.lock().unwrap().register(tcp.clone()).unwrap();
    ip.lock().unwrap().register(udp.clone()).unwrap();
    ethernet.register(ip.clone()).unwrap();
    Host {
        ethernet: ethernet,
        ip: ip,
        tcp: tcp,
        udp: udp,
    }
}

/// Moves frames between the two hosts until both are idle. Returns how
/// many frames travelled.
pub fn pump(a: &mut Host, b: &mut Host) -> usize {
    let mut carrier = vec![0u8; 1600];
    let mut moved = 0;
    loop {
        let mut progressed = false;
        let n = a.ethernet.poll(&mut carrier).expect("a.poll");
        if n > 0 {
            let _ = b.ethernet.recv(&mut carrier[..n]);
            progressed = true;
            moved += 1;
        }
        let n = b.ethernet.poll(&mut carrier).expect("b.poll");
        if n > 0 {
            let _ = a.ethernet.recv(&mut carrier[..n]);
            progressed = true;
            moved += 1;
        }
        if !progressed {
            return moved;
        }
        assert!(moved < 500, "the hosts never went idle");
    }
}

/// Pulls one frame out of `from` and drops it on the floor. Returns true
/// when a frame was actually produced.
pub fn drop_one_frame(from: &mut Host) -> bool {
    let mut carrier = vec![0u8; 1600];
    from.ethernet.poll(&mut carrier).expect("poll") > 0
}
