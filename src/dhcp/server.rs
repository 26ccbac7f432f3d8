//! A small DHCPv4 server: sequential address allocation and per-client
//! lease bookkeeping, enough to boot a segment of embedded peers.

use errors::{RxError, RxResult, TxError, TxResult, Validator};
use node::StackNode;

use ipnetwork::Ipv4Network;

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use dhcp::{addr_to_u32, u32_to_addr};
use wire::dhcp::{self, DhcpPacket, MessageType, MutableDhcpPacket};
use wire::ipv4::{self, PROTOCOL_UDP};
use wire::udp::{MutableUdpPacket, UdpPacket};

const UDP_HEADER_LEN: usize = 8;

/// Clients are keyed by their client identifier option (or hardware
/// address), zero padded to a fixed width.
const CLIENT_KEY_LEN: usize = 36;
type ClientKey = [u8; CLIENT_KEY_LEN];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BindingState {
    Selecting,
    Bound,
}

struct Binding {
    hwaddr: [u8; 16],
    hwlen: u8,
    xid: u32,
    assigned: Ipv4Addr,
    state: BindingState,
    hostname: Option<String>,
}

/// A reply waiting for the next `encapsulate`, snapshotted so it survives
/// the binding being dropped (a NAK removes it immediately).
struct PendingReply {
    kind: MessageType,
    xid: u32,
    hwaddr: [u8; 16],
    hwlen: u8,
    assigned: Ipv4Addr,
}

pub struct DhcpServerConfig {
    pub server_addr: Ipv4Addr,
    /// The subnet leases are allocated from.
    pub network: Ipv4Network,
    pub lease_secs: u32,
    /// Defaults to the server address when absent.
    pub router: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
}

pub struct DhcpServer {
    server_addr: Ipv4Addr,
    network: Ipv4Network,
    lease_secs: u32,
    router: Ipv4Addr,
    dns_servers: Vec<Ipv4Addr>,
    bindings: HashMap<ClientKey, Binding>,
    next_addr: Ipv4Addr,
    pending: VecDeque<PendingReply>,
    conn_id: u64,
}

impl DhcpServer {
    pub fn new(config: DhcpServerConfig) -> DhcpServer {
        let router = config.router.unwrap_or(config.server_addr);
        // Allocation starts just past the server's own address.
        let next_addr = u32_to_addr(addr_to_u32(config.server_addr).wrapping_add(1));
        DhcpServer {
            server_addr: config.server_addr,
            network: config.network,
            lease_secs: config.lease_secs,
            router: router,
            dns_servers: config.dns_servers,
            bindings: HashMap::new(),
            next_addr: next_addr,
            pending: VecDeque::new(),
            conn_id: 1,
        }
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// The address currently assigned to the given client identifier.
    pub fn assigned_addr(&self, client_id: &[u8]) -> Option<Ipv4Addr> {
        let key = Self::pad_key(client_id);
        self.bindings.get(&key).map(|binding| binding.assigned)
    }

    /// True once the client has confirmed its lease.
    pub fn is_bound(&self, client_id: &[u8]) -> bool {
        let key = Self::pad_key(client_id);
        self.bindings
            .get(&key)
            .map(|binding| binding.state == BindingState::Bound)
            .unwrap_or(false)
    }

    /// The hostname the client announced, if any.
    pub fn client_hostname(&self, client_id: &[u8]) -> Option<String> {
        let key = Self::pad_key(client_id);
        self.bindings.get(&key).and_then(|binding| binding.hostname.clone())
    }

    fn pad_key(id: &[u8]) -> ClientKey {
        let mut key = [0u8; CLIENT_KEY_LEN];
        let n = ::std::cmp::min(id.len(), CLIENT_KEY_LEN);
        key[..n].copy_from_slice(&id[..n]);
        key
    }

    fn key_for(pkg: &DhcpPacket) -> ClientKey {
        match pkg.find_option(dhcp::OPTION_CLIENT_ID) {
            Some(id) if !id.is_empty() => Self::pad_key(id),
            _ => {
                let hwlen = ::std::cmp::min(pkg.get_hardware_len() as usize, 16);
                Self::pad_key(&pkg.get_chaddr()[..hwlen])
            }
        }
    }

    fn addr_in_use(&self, addr: Ipv4Addr) -> bool {
        addr == self.server_addr ||
        self.bindings.values().any(|binding| binding.assigned == addr)
    }

    /// Sequentially allocates the next free host address in the subnet.
    fn allocate(&mut self) -> Option<Ipv4Addr> {
        let prefix = self.network.prefix();
        let mask = addr_to_u32(self.subnet_mask());
        let base = addr_to_u32(self.network.ip()) & mask;
        let broadcast = base | !mask;
        let size = 1u64 << (32 - prefix);
        for _ in 0..size {
            let candidate = self.next_addr;
            self.next_addr = u32_to_addr(addr_to_u32(candidate).wrapping_add(1));
            let raw = addr_to_u32(candidate);
            if !self.network.contains(candidate) || raw == base || raw == broadcast {
                continue;
            }
            if !self.addr_in_use(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn handle_discover(&mut self, pkg: &DhcpPacket, key: ClientKey) -> RxResult {
        let existing = self.bindings.get(&key).map(|binding| binding.assigned);
        let assigned = match existing {
            Some(addr) => addr,
            None => {
                let requested = pkg.find_option(dhcp::OPTION_REQUESTED_IP)
                    .and_then(|data| if data.len() == 4 {
                        Some(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
                    } else {
                        None
                    });
                match requested {
                    Some(addr) if self.network.contains(addr) && !self.addr_in_use(addr) => addr,
                    _ => self.allocate().ok_or(RxError::BufferFull)?,
                }
            }
        };
        let mut hwaddr = [0u8; 16];
        hwaddr.copy_from_slice(pkg.get_chaddr());
        let hostname = pkg.find_option(dhcp::OPTION_HOST_NAME)
            .and_then(|data| String::from_utf8(data.to_vec()).ok());
        debug!("dhcp server: offering {}", assigned);
        self.bindings.insert(key,
                             Binding {
                                 hwaddr: hwaddr,
                                 hwlen: pkg.get_hardware_len(),
                                 xid: pkg.get_xid(),
                                 assigned: assigned,
                                 state: BindingState::Selecting,
                                 hostname: hostname,
                             });
        self.pending.push_back(PendingReply {
            kind: MessageType::Offer,
            xid: pkg.get_xid(),
            hwaddr: hwaddr,
            hwlen: pkg.get_hardware_len(),
            assigned: assigned,
        });
        Ok(())
    }

    fn handle_request(&mut self, pkg: &DhcpPacket, key: ClientKey) -> RxResult {
        let acceptable = {
            let binding = match self.bindings.get(&key) {
                Some(binding) => binding,
                None => {
                    return Err(RxError::PacketDrop("request from unknown client".to_owned()))
                }
            };
            match pkg.find_option(dhcp::OPTION_REQUESTED_IP) {
                Some(data) if data.len() == 4 => {
                    Ipv4Addr::new(data[0], data[1], data[2], data[3]) == binding.assigned
                }
                _ => pkg.get_ciaddr() == binding.assigned,
            }
        };
        let kind = if acceptable {
            MessageType::Ack
        } else {
            MessageType::Nak
        };
        let reply = {
            let binding = self.bindings.get_mut(&key).unwrap();
            binding.xid = pkg.get_xid();
            if acceptable {
                debug!("dhcp server: {} bound", binding.assigned);
                binding.state = BindingState::Bound;
            }
            PendingReply {
                kind: kind,
                xid: binding.xid,
                hwaddr: binding.hwaddr,
                hwlen: binding.hwlen,
                assigned: binding.assigned,
            }
        };
        self.pending.push_back(reply);
        if !acceptable {
            self.bindings.remove(&key);
        }
        Ok(())
    }

    fn build_reply(&self, buffer: &mut [u8], reply: &PendingReply) -> TxResult<usize> {
        let kind = reply.kind;
        let mut pkg = MutableDhcpPacket::new(buffer).map_err(|_| TxError::ShortBuffer)?;
        pkg.prepare();
        pkg.set_op(dhcp::OP_BOOTREPLY);
        pkg.set_hardware_type(1);
        pkg.set_hardware_len(reply.hwlen);
        pkg.set_xid(reply.xid);
        pkg.set_flags(dhcp::FLAG_BROADCAST);
        if kind != MessageType::Nak {
            pkg.set_yiaddr(reply.assigned);
        }
        pkg.set_siaddr(self.server_addr);
        pkg.set_chaddr(&reply.hwaddr[..reply.hwlen as usize]);
        let mut options = pkg.options_writer();
        let full = |_| TxError::ShortBuffer;
        options.write_message_type(kind).map_err(&full)?;
        options.write_addr(dhcp::OPTION_SERVER_ID, self.server_addr).map_err(&full)?;
        if kind != MessageType::Nak {
            options.write_addr(dhcp::OPTION_SUBNET_MASK, self.subnet_mask()).map_err(&full)?;
            options.write_addr(dhcp::OPTION_ROUTER, self.router).map_err(&full)?;
            if !self.dns_servers.is_empty() {
                let mut list = Vec::with_capacity(self.dns_servers.len() * 4);
                for addr in &self.dns_servers {
                    list.extend_from_slice(&addr.octets());
                }
                options.write(dhcp::OPTION_DNS_SERVERS, &list).map_err(&full)?;
            }
            options.write_u32(dhcp::OPTION_LEASE_TIME, self.lease_secs).map_err(&full)?;
            options.write_u32(dhcp::OPTION_RENEWAL_TIME, self.lease_secs / 2).map_err(&full)?;
            options.write_u32(dhcp::OPTION_REBINDING_TIME, self.lease_secs / 8 * 7)
                .map_err(&full)?;
        }
        Ok(options.finish())
    }

    fn subnet_mask(&self) -> Ipv4Addr {
        let prefix = self.network.prefix();
        let mask = if prefix == 0 {
            0
        } else {
            !0u32 << (32 - prefix)
        };
        u32_to_addr(mask)
    }
}

impl StackNode for DhcpServer {
    fn demux(&mut self, carrier: &mut [u8], offset: usize) -> RxResult {
        let data = &carrier[offset..];
        let udp = UdpPacket::new(data)?;
        let mut v = Validator::new();
        udp.validate_size(&mut v);
        v.result()?;
        if udp.get_destination() != dhcp::SERVER_PORT {
            return Err(RxError::PacketDrop("not for the DHCP server".to_owned()));
        }
        let pkg = DhcpPacket::new(udp.payload())?;
        pkg.validate_size(&mut v);
        v.result()?;
        if pkg.get_op() != dhcp::OP_BOOTREQUEST {
            return Err(RxError::PacketDrop("not a BOOTP request".to_owned()));
        }
        let key = Self::key_for(&pkg);
        match pkg.get_message_type() {
            Some(MessageType::Discover) => self.handle_discover(&pkg, key),
            Some(MessageType::Request) => self.handle_request(&pkg, key),
            Some(MessageType::Release) | Some(MessageType::Decline) => {
                self.bindings.remove(&key);
                Ok(())
            }
            _ => Err(RxError::PacketDrop("unsupported DHCP message".to_owned())),
        }
    }

    fn encapsulate(&mut self,
                   carrier: &mut [u8],
                   parent_offset: usize,
                   offset: usize)
                   -> TxResult<usize> {
        let reply = match self.pending.pop_front() {
            Some(reply) => reply,
            None => return Ok(0),
        };
        if carrier.len() < offset + UDP_HEADER_LEN {
            return Err(TxError::ShortBuffer);
        }
        let dhcp_len = {
            let (_, rest) = carrier.split_at_mut(offset + UDP_HEADER_LEN);
            self.build_reply(rest, &reply)?
        };
        let total = UDP_HEADER_LEN + dhcp_len;
        {
            let mut udp =
                MutableUdpPacket::new(&mut carrier[offset..offset + total]).unwrap();
            udp.set_source(dhcp::SERVER_PORT);
            udp.set_destination(dhcp::CLIENT_PORT);
            udp.set_length(total as u16);
            udp.set_checksum(0);
        }
        ipv4::MutableIpv4Packet::new(&mut carrier[parent_offset..])
            .map(|mut ip| ip.set_destination(Ipv4Addr::new(255, 255, 255, 255)))
            .unwrap_or(());
        Ok(total)
    }

    fn local_port(&self) -> u16 {
        dhcp::SERVER_PORT
    }

    fn protocol(&self) -> u16 {
        PROTOCOL_UDP as u16
    }

    fn connection_id(&self) -> u64 {
        self.conn_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipnetwork::Ipv4Network;
    use node::StackNode;
    use std::net::Ipv4Addr;
    use wire::dhcp::{self, DhcpPacket, MessageType, MutableDhcpPacket};
    use wire::udp::{MutableUdpPacket, UdpPacket};

    fn server() -> DhcpServer {
        DhcpServer::new(DhcpServerConfig {
            server_addr: Ipv4Addr::new(192, 168, 1, 1),
            network: Ipv4Network::new(Ipv4Addr::new(192, 168, 1, 0), 24).unwrap(),
            lease_secs: 3600,
            router: None,
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8)],
        })
    }

    fn request_frame(xid: u32, hw: &[u8], kind: MessageType, requested: Ipv4Addr) -> Vec<u8> {
        let mut buf = vec![0u8; 400];
        let dhcp_len = {
            let mut pkg = MutableDhcpPacket::new(&mut buf[8..]).unwrap();
            pkg.prepare();
            pkg.set_op(dhcp::OP_BOOTREQUEST);
            pkg.set_hardware_type(1);
            pkg.set_hardware_len(hw.len() as u8);
            pkg.set_xid(xid);
            pkg.set_chaddr(hw);
            let mut options = pkg.options_writer();
            options.write_message_type(kind).unwrap();
            if requested != Ipv4Addr::new(0, 0, 0, 0) {
                options.write_addr(dhcp::OPTION_REQUESTED_IP, requested).unwrap();
            }
            options.finish()
        };
        let total = 8 + dhcp_len;
        {
            let mut udp = MutableUdpPacket::new(&mut buf[..total]).unwrap();
            udp.set_source(dhcp::CLIENT_PORT);
            udp.set_destination(dhcp::SERVER_PORT);
            udp.set_length(total as u16);
        }
        buf.truncate(total);
        buf
    }

    fn parse_reply(carrier: &[u8], n: usize) -> (MessageType, Ipv4Addr, u32) {
        let udp = UdpPacket::new(&carrier[20..20 + n]).unwrap();
        let pkg = DhcpPacket::new(udp.payload()).unwrap();
        (pkg.get_message_type().unwrap(), pkg.get_yiaddr(), pkg.get_xid())
    }

    #[test]
    fn discover_request_ack() {
        let mut s = server();
        let hw = [0, 0, 0, 0, 0, 1];
        let mut discover = request_frame(123,
                                         &hw,
                                         MessageType::Discover,
                                         Ipv4Addr::new(192, 168, 1, 2));
        s.demux(&mut discover, 0).unwrap();
        let mut carrier = vec![0u8; 600];
        let n = s.encapsulate(&mut carrier, 0, 20).unwrap();
        let (kind, yiaddr, xid) = parse_reply(&carrier, n);
        assert_eq!(MessageType::Offer, kind);
        assert_eq!(Ipv4Addr::new(192, 168, 1, 2), yiaddr);
        assert_eq!(123, xid);

        let mut request = request_frame(123,
                                        &hw,
                                        MessageType::Request,
                                        Ipv4Addr::new(192, 168, 1, 2));
        s.demux(&mut request, 0).unwrap();
        let n = s.encapsulate(&mut carrier, 0, 20).unwrap();
        let (kind, yiaddr, _) = parse_reply(&carrier, n);
        assert_eq!(MessageType::Ack, kind);
        assert_eq!(Ipv4Addr::new(192, 168, 1, 2), yiaddr);
        assert_eq!(Some(Ipv4Addr::new(192, 168, 1, 2)), s.assigned_addr(&hw));
    }

    #[test]
    fn sequential_allocation_distinct_addresses() {
        let mut s = server();
        let mut seen = Vec::new();
        for i in 1..5u8 {
            let hw = [0, 0, 0, 0, 0, i];
            let mut discover =
                request_frame(i as u32, &hw, MessageType::Discover, Ipv4Addr::new(0, 0, 0, 0));
            s.demux(&mut discover, 0).unwrap();
            let mut carrier = vec![0u8; 600];
            let n = s.encapsulate(&mut carrier, 0, 20).unwrap();
            let (_, yiaddr, _) = parse_reply(&carrier, n);
            assert!(!seen.contains(&yiaddr));
            assert!(yiaddr != s.server_addr);
            seen.push(yiaddr);
        }
        assert_eq!(4, s.binding_count());
    }

    #[test]
    fn request_for_wrong_addr_nacked() {
        let mut s = server();
        let hw = [0, 0, 0, 0, 0, 7];
        let mut discover =
            request_frame(9, &hw, MessageType::Discover, Ipv4Addr::new(0, 0, 0, 0));
        s.demux(&mut discover, 0).unwrap();
        let mut carrier = vec![0u8; 600];
        s.encapsulate(&mut carrier, 0, 20).unwrap();
        let mut request = request_frame(9,
                                        &hw,
                                        MessageType::Request,
                                        Ipv4Addr::new(192, 168, 1, 200));
        s.demux(&mut request, 0).unwrap();
        let n = s.encapsulate(&mut carrier, 0, 20).unwrap();
        let (kind, _, _) = parse_reply(&carrier, n);
        assert_eq!(MessageType::Nak, kind);
        assert_eq!(None, s.assigned_addr(&hw));
    }

    #[test]
    fn lease_times_follow_lease() {
        let mut s = server();
        let hw = [0, 0, 0, 0, 0, 2];
        let mut discover =
            request_frame(5, &hw, MessageType::Discover, Ipv4Addr::new(0, 0, 0, 0));
        s.demux(&mut discover, 0).unwrap();
        let mut carrier = vec![0u8; 600];
        let n = s.encapsulate(&mut carrier, 0, 20).unwrap();
        let udp = UdpPacket::new(&carrier[20..20 + n]).unwrap();
        let pkg = DhcpPacket::new(udp.payload()).unwrap();
        let lease = pkg.find_option(dhcp::OPTION_LEASE_TIME).unwrap();
        let renew = pkg.find_option(dhcp::OPTION_RENEWAL_TIME).unwrap();
        let rebind = pkg.find_option(dhcp::OPTION_REBINDING_TIME).unwrap();
        assert_eq!(&[0, 0, 0x0e, 0x10], lease);
        assert_eq!(&[0, 0, 0x07, 0x08], renew);
        assert_eq!(&[0, 0, 0x0c, 0x4e], rebind);
    }
}
