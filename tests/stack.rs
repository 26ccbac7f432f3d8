//! Whole-stack conversations that are not TCP or DHCP: DNS and NTP
//! lookups against tiny responders mounted on a peer stack, and node
//! lifecycle behaviour across the tree.

extern crate ripstack;

mod harness;

use harness::{host, pump, Host};

use ripstack::dns::DnsClient;
use ripstack::errors::{RxError, RxResult, TxResult};
use ripstack::node::StackNode;
use ripstack::ntp::NtpClient;
use ripstack::tcp::{TcpConfig, TcpSocket};
use ripstack::wire::MacAddr;
use ripstack::wire::dns::{DnsPacket, PORT as DNS_PORT};
use ripstack::wire::ipv4::{MutableIpv4Packet, PROTOCOL_UDP};
use ripstack::wire::ntp::{MutableNtpPacket, NtpPacket, MODE_CLIENT, MODE_SERVER, PORT as
                          NTP_PORT, VERSION};
use ripstack::wire::udp::{MutableUdpPacket, UdpPacket};
use ripstack::wire::set_u16;

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

fn client_host() -> Host {
    host(MacAddr::new(2, 0, 0, 0, 0, 1),
         MacAddr::new(2, 0, 0, 0, 0, 2),
         Ipv4Addr::new(10, 0, 0, 1))
}

fn server_host() -> Host {
    host(MacAddr::new(2, 0, 0, 0, 0, 2),
         MacAddr::new(2, 0, 0, 0, 0, 1),
         Ipv4Addr::new(10, 0, 0, 2))
}

/// A one-answer DNS server: stores the question it saw and answers it with
/// a fixed A record.
struct DnsResponder {
    answer: Ipv4Addr,
    pending: Option<(Ipv4Addr, u16, Vec<u8>)>,
}

impl StackNode for DnsResponder {
    fn demux(&mut self, carrier: &mut [u8], offset: usize) -> RxResult {
        let client_addr = Ipv4Addr::new(carrier[offset - 8],
                                        carrier[offset - 7],
                                        carrier[offset - 6],
                                        carrier[offset - 5]);
        let udp = UdpPacket::new(&carrier[offset..])?;
        if udp.get_destination() != DNS_PORT {
            return Err(RxError::PacketDrop("not a DNS query".to_owned()));
        }
        let query = DnsPacket::new(udp.payload())?;
        if query.is_response() || query.get_question_count() != 1 {
            return Err(RxError::PacketDrop("not a single-question query".to_owned()));
        }
        self.pending = Some((client_addr, udp.get_source(), udp.payload().to_vec()));
        Ok(())
    }

    fn encapsulate(&mut self,
                   carrier: &mut [u8],
                   parent_offset: usize,
                   offset: usize)
                   -> TxResult<usize> {
        let (client_addr, client_port, query) = match self.pending.take() {
            Some(pending) => pending,
            None => return Ok(0),
        };
        // Copy the query back and graft one answer on the end.
        let mut pos = offset + 8;
        carrier[pos..pos + query.len()].copy_from_slice(&query);
        set_u16(carrier, pos + 2, 0x8000);
        set_u16(carrier, pos + 6, 1);
        pos += query.len();
        carrier[pos] = 0xc0;
        carrier[pos + 1] = 12;
        set_u16(carrier, pos + 2, 1);
        set_u16(carrier, pos + 4, 1);
        set_u16(carrier, pos + 6, 0);
        set_u16(carrier, pos + 8, 60);
        set_u16(carrier, pos + 10, 4);
        carrier[pos + 12..pos + 16].copy_from_slice(&self.answer.octets());
        pos += 16;
        let total = pos - offset;
        {
            let mut udp = MutableUdpPacket::new(&mut carrier[offset..pos]).unwrap();
            udp.set_source(DNS_PORT);
            udp.set_destination(client_port);
            udp.set_length(total as u16);
            udp.set_checksum(0);
        }
        MutableIpv4Packet::new(&mut carrier[parent_offset..])
            .map(|mut ip| ip.set_destination(client_addr))
            .unwrap_or(());
        Ok(total)
    }

    fn local_port(&self) -> u16 {
        DNS_PORT
    }

    fn protocol(&self) -> u16 {
        PROTOCOL_UDP as u16
    }

    fn connection_id(&self) -> u64 {
        1
    }
}

#[test]
fn dns_lookup_end_to_end() {
    let mut client_stack = client_host();
    let mut server_stack = server_host();
    let responder = Arc::new(Mutex::new(DnsResponder {
        answer: Ipv4Addr::new(93, 184, 216, 34),
        pending: None,
    }));
    server_stack.udp.lock().unwrap().register(responder).unwrap();

    let resolver = Arc::new(Mutex::new(DnsClient::new(40000, Ipv4Addr::new(10, 0, 0, 2))));
    client_stack.udp.lock().unwrap().register(resolver.clone()).unwrap();
    resolver.lock().unwrap().lookup("example.com").unwrap();

    pump(&mut client_stack, &mut server_stack);

    let resolver = resolver.lock().unwrap();
    assert_eq!(Some(&[Ipv4Addr::new(93, 184, 216, 34)][..]), resolver.result());
}

/// Echoes NTP client requests with a fixed server clock.
struct NtpResponder {
    server_time: u64,
    pending: Option<(Ipv4Addr, u16, u64)>,
}

impl StackNode for NtpResponder {
    fn demux(&mut self, carrier: &mut [u8], offset: usize) -> RxResult {
        let client_addr = Ipv4Addr::new(carrier[offset - 8],
                                        carrier[offset - 7],
                                        carrier[offset - 6],
                                        carrier[offset - 5]);
        let udp = UdpPacket::new(&carrier[offset..])?;
        let request = NtpPacket::new(udp.payload())?;
        if request.get_mode() != MODE_CLIENT {
            return Err(RxError::PacketDrop("not a client request".to_owned()));
        }
        self.pending = Some((client_addr, udp.get_source(), request.get_transmit_timestamp()));
        Ok(())
    }

    fn encapsulate(&mut self,
                   carrier: &mut [u8],
                   parent_offset: usize,
                   offset: usize)
                   -> TxResult<usize> {
        let (client_addr, client_port, origin) = match self.pending.take() {
            Some(pending) => pending,
            None => return Ok(0),
        };
        let total = 8 + 48;
        for byte in carrier[offset..offset + total].iter_mut() {
            *byte = 0;
        }
        {
            let mut udp = MutableUdpPacket::new(&mut carrier[offset..offset + total]).unwrap();
            udp.set_source(NTP_PORT);
            udp.set_destination(client_port);
            udp.set_length(total as u16);
        }
        {
            let start = offset + 8;
            let mut reply = MutableNtpPacket::new(&mut carrier[start..start + 48]).unwrap();
            reply.set_leap_vn_mode(0, VERSION, MODE_SERVER);
            reply.set_stratum(1);
            reply.set_origin_timestamp(origin);
            reply.set_receive_timestamp(self.server_time);
            reply.set_transmit_timestamp(self.server_time + 1);
        }
        MutableIpv4Packet::new(&mut carrier[parent_offset..])
            .map(|mut ip| ip.set_destination(client_addr))
            .unwrap_or(());
        Ok(total)
    }

    fn local_port(&self) -> u16 {
        NTP_PORT
    }

    fn protocol(&self) -> u16 {
        PROTOCOL_UDP as u16
    }

    fn connection_id(&self) -> u64 {
        1
    }
}

#[test]
fn ntp_exchange_end_to_end() {
    let mut client_stack = client_host();
    let mut server_stack = server_host();
    let responder = Arc::new(Mutex::new(NtpResponder {
        server_time: 0x2000_0000_0000_0000,
        pending: None,
    }));
    server_stack.udp.lock().unwrap().register(responder).unwrap();

    let sntp = Arc::new(Mutex::new(NtpClient::new(41000, Ipv4Addr::new(10, 0, 0, 2))));
    client_stack.udp.lock().unwrap().register(sntp.clone()).unwrap();
    sntp.lock().unwrap().request(0x1111_2222_3333_4444).unwrap();

    pump(&mut client_stack, &mut server_stack);

    let sample = sntp.lock().unwrap().sample().expect("no sample");
    assert_eq!(0x1111_2222_3333_4444, sample.origin);
    assert_eq!(0x2000_0000_0000_0000, sample.receive);
    assert_eq!(0x2000_0000_0000_0001, sample.transmit);
    assert_eq!(1, sample.stratum);
}

#[test]
fn aborted_connection_disappears_from_the_tree() {
    let mut client_stack = client_host();
    let mut server_stack = server_host();
    let socket = Arc::new(Mutex::new(TcpSocket::new(TcpConfig::with_buffer_sizes(1024,
                                                                                 1024,
                                                                                 4))));
    socket.lock()
        .unwrap()
        .open_active(5000, Ipv4Addr::new(10, 0, 0, 2), 80, 1)
        .unwrap();
    client_stack.tcp.lock().unwrap().register(socket.clone()).unwrap();
    assert_eq!(1, client_stack.tcp.lock().unwrap().node_count());

    // Abort before anything was exchanged: no peer to reset, the id is
    // invalidated immediately.
    socket.lock().unwrap().abort();
    pump(&mut client_stack, &mut server_stack);
    client_stack.tcp.lock().unwrap().maintain();
    assert_eq!(0, client_stack.tcp.lock().unwrap().node_count());
}
