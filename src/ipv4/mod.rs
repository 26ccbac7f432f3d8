//! Network layer: IPv4 validation, dispatch by protocol number, and header
//! composition including the transport checksums.

use errors::{RxError, RxResult, TxError, TxResult, Validator};
use node::{NodeHandle, NodeTable, StackNode};

use rand::{self, Rng};

use std::net::Ipv4Addr;

use wire::Checksum;
use wire::ethernet::ETHERTYPE_IPV4;
use wire::ipv4::{Ipv4Packet, MutableIpv4Packet, DONT_FRAGMENT, PROTOCOL_TCP, PROTOCOL_UDP};
use wire::tcp::TcpPacket;
use wire::udp::UdpPacket;

const HEADER_LEN: usize = 20;
const DEFAULT_TTL: u8 = 64;

/// Offsets of the transport checksum fields relative to the transport
/// header.
const TCP_CHECKSUM_OFF: usize = 16;
const UDP_CHECKSUM_OFF: usize = 6;

/// The IPv4 node. Children are keyed by IP protocol number.
pub struct IpStack {
    addr: Ipv4Addr,
    table: NodeTable,
    next_ident: u16,
    conn_id: u64,
}

impl IpStack {
    /// Creates the node. `addr` may be the unspecified address while DHCP
    /// is still negotiating; destination filtering admits broadcasts
    /// either way.
    pub fn new(addr: Ipv4Addr, max_nodes: usize) -> IpStack {
        IpStack {
            addr: addr,
            table: NodeTable::new(max_nodes),
            next_ident: rand::thread_rng().gen::<u16>(),
            conn_id: 1,
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    /// Re-points the stack at a new local address, typically once a DHCP
    /// lease lands.
    pub fn set_addr(&mut self, addr: Ipv4Addr) {
        debug!("ipv4 address {} -> {}", self.addr, addr);
        self.addr = addr;
    }

    pub fn register(&mut self, node: NodeHandle) -> Result<(), RxError> {
        self.table.register(node)
    }

    pub fn maintain(&mut self) {
        self.table.sweep();
        self.table.compact();
    }

    fn accepts_destination(&self, dst: Ipv4Addr) -> bool {
        dst == self.addr || dst == Ipv4Addr::new(255, 255, 255, 255) ||
        self.addr == Ipv4Addr::new(0, 0, 0, 0)
    }

    fn verify_transport_checksum(&self, packet: &Ipv4Packet) -> RxResult {
        let mut csum = Checksum::new();
        match packet.get_protocol() {
            PROTOCOL_TCP => packet.checksum_write_tcp_pseudo(&mut csum),
            PROTOCOL_UDP => {
                let udp = UdpPacket::new(packet.payload())?;
                let mut v = Validator::new();
                udp.validate_size(&mut v);
                v.result()?;
                // A zero UDP checksum means the sender skipped it.
                if udp.get_checksum() == 0 {
                    return Ok(());
                }
                packet.checksum_write_udp_pseudo(&mut csum);
            }
            _ => return Ok(()),
        }
        csum.write(packet.payload());
        if csum.finish() != 0 {
            return Err(RxError::ChecksumMismatch);
        }
        Ok(())
    }

    fn next_identification(&mut self, salt: u64) -> u16 {
        // A small linear congruence walks the identification space in a
        // hard to predict order, salted per producing child.
        self.next_ident = self.next_ident.wrapping_mul(25173).wrapping_add(13849);
        self.next_ident ^ salt as u16
    }
}

impl StackNode for IpStack {
    fn demux(&mut self, carrier: &mut [u8], offset: usize) -> RxResult {
        let (protocol, header_len) = {
            let packet = Ipv4Packet::new(&carrier[offset..])?;
            let mut v = Validator::new();
            packet.validate_size(&mut v);
            v.result()?;
            if packet.get_version() != 4 {
                return Err(RxError::Unsupported);
            }
            if !self.accepts_destination(packet.get_destination()) {
                return Err(RxError::PacketDrop(format!("datagram for {}",
                                                       packet.get_destination())));
            }
            if !packet.verify_header_checksum() {
                return Err(RxError::ChecksumMismatch);
            }
            if packet.is_fragment() {
                // Reassembly is out of scope; over-MTU datagrams drop.
                return Err(RxError::PacketDrop("fragmented datagram".to_owned()));
            }
            if packet.get_source() == Ipv4Addr::new(0, 0, 0, 0) &&
               packet.get_protocol() != PROTOCOL_UDP {
                return Err(RxError::ZeroSource);
            }
            let protocol = packet.get_protocol();
            if (protocol == PROTOCOL_TCP || protocol == PROTOCOL_UDP) &&
               packet.header_len() != HEADER_LEN {
                // Transport children rely on the fixed twenty byte gap to
                // the pseudo header fields.
                return Err(RxError::Unsupported);
            }
            self.verify_transport_checksum(&packet)?;
            (protocol, packet.header_len())
        };
        trace!("ipv4 datagram, protocol {}", protocol);
        self.table.demux_by(|proto, _| proto == protocol as u16,
                            carrier,
                            offset + header_len)
    }

    fn encapsulate(&mut self,
                   carrier: &mut [u8],
                   parent_offset: usize,
                   offset: usize)
                   -> TxResult<usize> {
        if carrier.len() < offset + HEADER_LEN {
            return Err(TxError::ShortBuffer);
        }
        // Children steer the destination address; zero it first.
        for byte in carrier[offset + 16..offset + 20].iter_mut() {
            *byte = 0;
        }
        let (n, protocol, _) = self.table
            .encapsulate_round_robin(|node, _, _| {
                node.encapsulate(&mut carrier[..], offset, offset + HEADER_LEN)
            })?;
        if n == 0 {
            return Ok(0);
        }
        let total = HEADER_LEN + n;
        let src = self.addr;
        let ident = self.next_identification(protocol as u64);
        {
            let mut packet =
                MutableIpv4Packet::new(&mut carrier[offset..offset + total]).unwrap();
            packet.set_version(4);
            packet.set_header_length(5);
            packet.set_tos(0);
            packet.set_total_length(total as u16);
            packet.set_identification(ident);
            packet.set_flags(DONT_FRAGMENT);
            packet.set_fragment_offset(0);
            packet.set_ttl(DEFAULT_TTL);
            packet.set_protocol(protocol as u8);
            packet.set_source(src);
            let csum = packet.to_immutable().calculate_header_checksum();
            packet.set_checksum(csum);
        }
        // Transport checksum over pseudo header, transport header and
        // payload.
        let checksum_off = match protocol as u8 {
            PROTOCOL_TCP => Some(TCP_CHECKSUM_OFF),
            PROTOCOL_UDP => Some(UDP_CHECKSUM_OFF),
            _ => None,
        };
        if let Some(field_off) = checksum_off {
            let csum = {
                let packet = Ipv4Packet::new(&carrier[offset..offset + total]).unwrap();
                let mut csum = Checksum::new();
                if protocol as u8 == PROTOCOL_TCP {
                    packet.checksum_write_tcp_pseudo(&mut csum);
                    TcpPacket::new(packet.payload())
                        .map_err(|_| TxError::ShortBuffer)?
                        .calculate_checksum(csum)
                } else {
                    packet.checksum_write_udp_pseudo(&mut csum);
                    UdpPacket::new(packet.payload())
                        .map_err(|_| TxError::ShortBuffer)?
                        .calculate_checksum(csum)
                }
            };
            let field = offset + HEADER_LEN + field_off;
            carrier[field] = (csum >> 8) as u8;
            carrier[field + 1] = csum as u8;
        }
        // A broadcast datagram must also ride a broadcast frame; steer the
        // link layer destination.
        let dst = Ipv4Packet::new(&carrier[offset..offset + total]).unwrap().get_destination();
        if dst == Ipv4Addr::new(255, 255, 255, 255) && parent_offset + 6 <= offset {
            for byte in carrier[parent_offset..parent_offset + 6].iter_mut() {
                *byte = 0xff;
            }
        }
        Ok(total)
    }

    fn protocol(&self) -> u16 {
        ETHERTYPE_IPV4
    }

    fn connection_id(&self) -> u64 {
        self.conn_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use errors::{RxError, RxResult, TxResult};
    use node::{NodeHandle, StackNode};
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};
    use wire::Checksum;
    use wire::ipv4::{Ipv4Packet, MutableIpv4Packet, PROTOCOL_TCP, PROTOCOL_UDP};
    use wire::udp::MutableUdpPacket;

    struct Recorder {
        proto: u16,
        offsets: Vec<usize>,
        udp_payload: Vec<u8>,
        dst: Ipv4Addr,
    }

    impl StackNode for Recorder {
        fn demux(&mut self, _carrier: &mut [u8], offset: usize) -> RxResult {
            self.offsets.push(offset);
            Ok(())
        }

        fn encapsulate(&mut self,
                       carrier: &mut [u8],
                       parent_offset: usize,
                       offset: usize)
                       -> TxResult<usize> {
            let n = 8 + self.udp_payload.len();
            {
                let mut udp = MutableUdpPacket::new(&mut carrier[offset..offset + n]).unwrap();
                udp.set_source(1000);
                udp.set_destination(2000);
                udp.set_length(n as u16);
                udp.set_checksum(0);
                udp.payload_mut().copy_from_slice(&self.udp_payload);
            }
            let mut ip = MutableIpv4Packet::new(&mut carrier[parent_offset..]).unwrap();
            ip.set_destination(self.dst);
            Ok(n)
        }

        fn protocol(&self) -> u16 {
            self.proto
        }

        fn connection_id(&self) -> u64 {
            1
        }
    }

    fn local() -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, 1)
    }

    fn stack_with_udp_child(dst: Ipv4Addr) -> (IpStack, Arc<Mutex<Recorder>>) {
        let mut stack = IpStack::new(local(), 4);
        let recorder = Arc::new(Mutex::new(Recorder {
            proto: PROTOCOL_UDP as u16,
            offsets: Vec::new(),
            udp_payload: b"ping".to_vec(),
            dst: dst,
        }));
        let handle: NodeHandle = recorder.clone();
        stack.register(handle).unwrap();
        (stack, recorder)
    }

    /// A valid UDP-in-IPv4 datagram towards `dst`.
    fn datagram(dst: Ipv4Addr) -> Vec<u8> {
        let payload = b"ping";
        let total = 20 + 8 + payload.len();
        let mut buf = vec![0u8; total];
        {
            let mut ip = MutableIpv4Packet::new(&mut buf).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length(total as u16);
            ip.set_ttl(64);
            ip.set_protocol(PROTOCOL_UDP);
            ip.set_source(Ipv4Addr::new(10, 0, 0, 2));
            ip.set_destination(dst);
            let csum = ip.to_immutable().calculate_header_checksum();
            ip.set_checksum(csum);
        }
        {
            let mut udp = MutableUdpPacket::new(&mut buf[20..]).unwrap();
            udp.set_source(2000);
            udp.set_destination(1000);
            udp.set_length((8 + payload.len()) as u16);
            udp.payload_mut()[..payload.len()].copy_from_slice(payload);
        }
        let csum = {
            let ip = Ipv4Packet::new(&buf).unwrap();
            let mut csum = Checksum::new();
            ip.checksum_write_udp_pseudo(&mut csum);
            ::wire::udp::UdpPacket::new(ip.payload()).unwrap().calculate_checksum(csum)
        };
        buf[20 + 6] = (csum >> 8) as u8;
        buf[20 + 7] = csum as u8;
        buf
    }

    #[test]
    fn dispatch_by_protocol() {
        let (mut stack, recorder) = stack_with_udp_child(local());
        let mut buf = datagram(local());
        stack.demux(&mut buf, 0).unwrap();
        assert_eq!(vec![20], recorder.lock().unwrap().offsets);
    }

    #[test]
    fn wrong_destination_dropped() {
        let (mut stack, recorder) = stack_with_udp_child(local());
        let mut buf = datagram(Ipv4Addr::new(10, 0, 0, 77));
        assert!(stack.demux(&mut buf, 0).is_err());
        assert!(recorder.lock().unwrap().offsets.is_empty());
    }

    #[test]
    fn broadcast_accepted() {
        let (mut stack, recorder) = stack_with_udp_child(local());
        let mut buf = datagram(Ipv4Addr::new(255, 255, 255, 255));
        stack.demux(&mut buf, 0).unwrap();
        assert_eq!(1, recorder.lock().unwrap().offsets.len());
    }

    #[test]
    fn header_checksum_mismatch() {
        let (mut stack, _) = stack_with_udp_child(local());
        let mut buf = datagram(local());
        buf[8] = buf[8].wrapping_add(1);
        assert_eq!(Err(RxError::ChecksumMismatch), stack.demux(&mut buf, 0));
    }

    #[test]
    fn transport_checksum_mismatch() {
        let (mut stack, _) = stack_with_udp_child(local());
        let mut buf = datagram(local());
        let last = buf.len() - 1;
        buf[last] = buf[last].wrapping_add(1);
        assert_eq!(Err(RxError::ChecksumMismatch), stack.demux(&mut buf, 0));
    }

    #[test]
    fn unknown_protocol_dropped() {
        let mut stack = IpStack::new(local(), 4);
        let mut buf = datagram(local());
        match stack.demux(&mut buf, 0) {
            Err(RxError::PacketDrop(..)) => {}
            other => panic!("expected drop, got {:?}", other),
        }
    }

    #[test]
    fn encapsulate_builds_valid_datagram() {
        let (mut stack, _) = stack_with_udp_child(Ipv4Addr::new(10, 0, 0, 2));
        let mut carrier = vec![0u8; 200];
        let n = stack.encapsulate(&mut carrier, 0, 14).unwrap();
        assert_eq!(20 + 8 + 4, n);
        let packet = Ipv4Packet::new(&carrier[14..14 + n]).unwrap();
        assert_eq!(4, packet.get_version());
        assert_eq!(64, packet.get_ttl());
        assert_eq!(PROTOCOL_UDP, packet.get_protocol());
        assert_eq!(local(), packet.get_source());
        assert_eq!(Ipv4Addr::new(10, 0, 0, 2), packet.get_destination());
        assert!(packet.verify_header_checksum());
        // The filled-in UDP checksum verifies to zero.
        let mut csum = Checksum::new();
        packet.checksum_write_udp_pseudo(&mut csum);
        csum.write(packet.payload());
        assert_eq!(0, csum.finish());
    }

    #[test]
    fn broadcast_datagram_steers_link_broadcast() {
        let (mut stack, _) = stack_with_udp_child(Ipv4Addr::new(255, 255, 255, 255));
        let mut carrier = vec![0u8; 200];
        let n = stack.encapsulate(&mut carrier, 0, 14).unwrap();
        assert!(n > 0);
        assert_eq!(&[0xff; 6], &carrier[..6]);
    }

    #[test]
    fn fragment_dropped() {
        let (mut stack, _) = stack_with_udp_child(local());
        let mut buf = datagram(local());
        {
            let mut ip = MutableIpv4Packet::new(&mut buf).unwrap();
            ip.set_flags(::wire::ipv4::MORE_FRAGMENTS);
            let csum = ip.to_immutable().calculate_header_checksum();
            ip.set_checksum(csum);
        }
        match stack.demux(&mut buf, 0) {
            Err(RxError::PacketDrop(..)) => {}
            other => panic!("expected drop, got {:?}", other),
        }
    }
}
