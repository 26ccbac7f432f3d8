//! End-to-end DORA exchanges between a DHCP client stack and a server
//! stack.

extern crate ipnetwork;
extern crate ripstack;

mod harness;

use harness::{host, pump, Host};

use ipnetwork::Ipv4Network;
use ripstack::dhcp::{DhcpClient, DhcpClientState, DhcpRequestConfig, DhcpServer,
                     DhcpServerConfig};
use ripstack::wire::MacAddr;

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

fn server_host() -> (Host, Arc<Mutex<DhcpServer>>) {
    let host = host(MacAddr::new(2, 0, 0, 0, 0, 0xfe),
                    MacAddr::broadcast(),
                    Ipv4Addr::new(192, 168, 1, 1));
    let server = Arc::new(Mutex::new(DhcpServer::new(DhcpServerConfig {
        server_addr: Ipv4Addr::new(192, 168, 1, 1),
        network: Ipv4Network::new(Ipv4Addr::new(192, 168, 1, 0), 24).unwrap(),
        lease_secs: 3600,
        router: None,
        dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8)],
    })));
    host.udp.lock().unwrap().register(server.clone()).unwrap();
    (host, server)
}

fn client_host(hw: [u8; 6]) -> (Host, Arc<Mutex<DhcpClient>>) {
    let host = host(MacAddr::from_slice(&hw),
                    MacAddr::broadcast(),
                    Ipv4Addr::new(0, 0, 0, 0));
    let client = Arc::new(Mutex::new(DhcpClient::new()));
    host.udp.lock().unwrap().register(client.clone()).unwrap();
    (host, client)
}

fn begin(client: &Arc<Mutex<DhcpClient>>, hw: [u8; 6], xid: u32, requested: Ipv4Addr) {
    client.lock()
        .unwrap()
        .begin_request(xid,
                       DhcpRequestConfig {
                           requested_addr: requested,
                           client_hw_addr: hw,
                           hostname: "ripstack".to_owned(),
                           client_id: hw.to_vec(),
                       })
        .unwrap();
}

#[test]
fn full_dora_binds_requested_address() {
    let (mut server_stack, server) = server_host();
    let hw = [0, 0, 0, 0, 0, 1];
    let (mut client_stack, client) = client_host(hw);
    begin(&client, hw, 123, Ipv4Addr::new(192, 168, 1, 2));

    pump(&mut client_stack, &mut server_stack);

    let guard = client.lock().unwrap();
    assert_eq!(DhcpClientState::Bound, guard.state());
    let lease = guard.lease().expect("no lease");
    assert_eq!(Ipv4Addr::new(192, 168, 1, 2), lease.addr);
    assert_eq!(Ipv4Addr::new(192, 168, 1, 1), lease.server_id);
    assert_eq!(Some(3600), lease.lease_secs);
    assert_eq!(Some(1800), lease.renew_secs);
    assert_eq!(Some(3150), lease.rebind_secs);
    assert_eq!(Some(Ipv4Addr::new(255, 255, 255, 0)), lease.subnet_mask);
    assert_eq!(vec![Ipv4Addr::new(8, 8, 8, 8)], lease.dns_servers);
    assert!(server.lock().unwrap().is_bound(&hw));

    // The lease address can now re-point the IP layer.
    client_stack.ip.lock().unwrap().set_addr(lease.addr);
    assert_eq!(lease.addr, client_stack.ip.lock().unwrap().addr());
}

#[test]
fn concurrent_clients_get_distinct_addresses() {
    let (mut server_stack, server) = server_host();
    let mut leased = Vec::new();
    for i in 1..5u8 {
        let hw = [0, 0, 0, 0, 0, i];
        let (mut client_stack, client) = client_host(hw);
        begin(&client, hw, i as u32, Ipv4Addr::new(0, 0, 0, 0));
        pump(&mut client_stack, &mut server_stack);
        let guard = client.lock().unwrap();
        assert_eq!(DhcpClientState::Bound, guard.state());
        let addr = guard.lease().unwrap().addr;
        assert!(!leased.contains(&addr), "duplicate lease {}", addr);
        assert!(addr != Ipv4Addr::new(192, 168, 1, 1));
        leased.push(addr);
    }
    assert_eq!(4, server.lock().unwrap().binding_count());
}
