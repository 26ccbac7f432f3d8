//! The DHCPv4 client state machine: Discover, Offer, Request, Ack.

use errors::{RxError, RxResult, TxError, TxResult, Validator};
use node::StackNode;

use std::net::Ipv4Addr;

use dhcp::{MAX_CLIENT_ID_LEN, MAX_HOSTNAME_LEN};
use wire::dhcp::{self, DhcpPacket, MessageType, MutableDhcpPacket};
use wire::ipv4::{self, PROTOCOL_UDP};
use wire::udp::{MutableUdpPacket, UdpPacket};

const UDP_HEADER_LEN: usize = 8;

/// What the client asks the server to include in its replies.
const PARAMETER_REQUEST_LIST: [u8; 9] = [dhcp::OPTION_SUBNET_MASK,
                                         dhcp::OPTION_ROUTER,
                                         dhcp::OPTION_DNS_SERVERS,
                                         dhcp::OPTION_HOST_NAME,
                                         dhcp::OPTION_BROADCAST_ADDR,
                                         dhcp::OPTION_NTP_SERVERS,
                                         dhcp::OPTION_LEASE_TIME,
                                         dhcp::OPTION_RENEWAL_TIME,
                                         dhcp::OPTION_REBINDING_TIME];

const MAX_MESSAGE_SIZE: u16 = 1500;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DhcpClientState {
    Init,
    Selecting,
    Requesting,
    Bound,
}

pub struct DhcpRequestConfig {
    pub requested_addr: Ipv4Addr,
    pub client_hw_addr: [u8; 6],
    /// At most 36 bytes.
    pub hostname: String,
    /// At most 32 bytes; empty means the option is omitted.
    pub client_id: Vec<u8>,
}

/// Everything learnt from the server's acknowledgement.
#[derive(Clone, Debug)]
pub struct DhcpLease {
    pub addr: Ipv4Addr,
    pub server_id: Ipv4Addr,
    pub router: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub broadcast: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub ntp_servers: Vec<Ipv4Addr>,
    pub lease_secs: Option<u32>,
    pub renew_secs: Option<u32>,
    pub rebind_secs: Option<u32>,
    pub hostname: Option<String>,
}

impl Default for DhcpLease {
    fn default() -> DhcpLease {
        DhcpLease {
            addr: Ipv4Addr::new(0, 0, 0, 0),
            server_id: Ipv4Addr::new(0, 0, 0, 0),
            router: None,
            subnet_mask: None,
            broadcast: None,
            dns_servers: Vec::new(),
            ntp_servers: Vec::new(),
            lease_secs: None,
            renew_secs: None,
            rebind_secs: None,
            hostname: None,
        }
    }
}

pub struct DhcpClient {
    state: DhcpClientState,
    xid: u32,
    config: Option<DhcpRequestConfig>,
    /// Server id and offered address from the accepted offer.
    offer: Option<(Ipv4Addr, Ipv4Addr)>,
    needs_tx: bool,
    lease: Option<DhcpLease>,
    conn_id: u64,
}

impl DhcpClient {
    pub fn new() -> DhcpClient {
        DhcpClient {
            state: DhcpClientState::Init,
            xid: 0,
            config: None,
            offer: None,
            needs_tx: false,
            lease: None,
            conn_id: 1,
        }
    }

    /// Seeds a new DORA exchange. The discover goes out on the next
    /// `encapsulate`.
    pub fn begin_request(&mut self, xid: u32, config: DhcpRequestConfig) -> TxResult<()> {
        if config.hostname.len() > MAX_HOSTNAME_LEN {
            return Err(TxError::IllegalArgument);
        }
        if config.client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(TxError::IllegalArgument);
        }
        self.state = DhcpClientState::Init;
        self.xid = xid;
        self.config = Some(config);
        self.offer = None;
        self.lease = None;
        self.needs_tx = true;
        Ok(())
    }

    pub fn state(&self) -> DhcpClientState {
        self.state
    }

    /// The negotiated lease, once Bound.
    pub fn lease(&self) -> Option<&DhcpLease> {
        self.lease.as_ref()
    }

    fn build_message(&self, buffer: &mut [u8], kind: MessageType) -> TxResult<usize> {
        let config = self.config.as_ref().ok_or(TxError::IllegalArgument)?;
        let mut pkg = MutableDhcpPacket::new(buffer).map_err(|_| TxError::ShortBuffer)?;
        pkg.prepare();
        pkg.set_op(dhcp::OP_BOOTREQUEST);
        pkg.set_hardware_type(1);
        pkg.set_hardware_len(6);
        pkg.set_xid(self.xid);
        pkg.set_flags(dhcp::FLAG_BROADCAST);
        pkg.set_chaddr(&config.client_hw_addr);
        let mut options = pkg.options_writer();
        let full = |_| TxError::ShortBuffer;
        options.write_message_type(kind).map_err(&full)?;
        let requested = match (kind, self.offer) {
            (MessageType::Request, Some((_, offered))) => offered,
            _ => config.requested_addr,
        };
        if requested != Ipv4Addr::new(0, 0, 0, 0) {
            options.write_addr(dhcp::OPTION_REQUESTED_IP, requested).map_err(&full)?;
        }
        if let (MessageType::Request, Some((server, _))) = (kind, self.offer) {
            options.write_addr(dhcp::OPTION_SERVER_ID, server).map_err(&full)?;
        }
        options.write(dhcp::OPTION_PARAMETER_REQUEST_LIST, &PARAMETER_REQUEST_LIST)
            .map_err(&full)?;
        if !config.hostname.is_empty() {
            options.write(dhcp::OPTION_HOST_NAME, config.hostname.as_bytes()).map_err(&full)?;
        }
        if !config.client_id.is_empty() {
            options.write(dhcp::OPTION_CLIENT_ID, &config.client_id).map_err(&full)?;
        }
        let mut size = [0u8; 2];
        size[0] = (MAX_MESSAGE_SIZE >> 8) as u8;
        size[1] = MAX_MESSAGE_SIZE as u8;
        options.write(dhcp::OPTION_MAX_MESSAGE_SIZE, &size).map_err(&full)?;
        Ok(options.finish())
    }

    fn parse_lease(&self, pkg: &DhcpPacket) -> DhcpLease {
        let mut lease = DhcpLease::default();
        lease.addr = pkg.get_yiaddr();
        for option in pkg.options_iter() {
            match option.code {
                dhcp::OPTION_SERVER_ID => {
                    if let Some(addr) = option.as_addr() {
                        lease.server_id = addr;
                    }
                }
                dhcp::OPTION_ROUTER => lease.router = option.as_addr(),
                dhcp::OPTION_SUBNET_MASK => lease.subnet_mask = option.as_addr(),
                dhcp::OPTION_BROADCAST_ADDR => lease.broadcast = option.as_addr(),
                dhcp::OPTION_DNS_SERVERS => lease.dns_servers = option.addr_list(),
                dhcp::OPTION_NTP_SERVERS => lease.ntp_servers = option.addr_list(),
                dhcp::OPTION_LEASE_TIME => lease.lease_secs = option.as_u32(),
                dhcp::OPTION_RENEWAL_TIME => lease.renew_secs = option.as_u32(),
                dhcp::OPTION_REBINDING_TIME => lease.rebind_secs = option.as_u32(),
                dhcp::OPTION_HOST_NAME => {
                    lease.hostname = String::from_utf8(option.data.to_vec()).ok();
                }
                _ => {}
            }
        }
        lease
    }
}

impl StackNode for DhcpClient {
    fn demux(&mut self, carrier: &mut [u8], offset: usize) -> RxResult {
        let data = &carrier[offset..];
        let udp = UdpPacket::new(data)?;
        let mut v = Validator::new();
        udp.validate_size(&mut v);
        v.result()?;
        if udp.get_destination() != dhcp::CLIENT_PORT || udp.get_source() != dhcp::SERVER_PORT {
            return Err(RxError::PacketDrop("not a DHCP server reply".to_owned()));
        }
        let pkg = DhcpPacket::new(udp.payload())?;
        pkg.validate_size(&mut v);
        v.result()?;
        if pkg.get_op() != dhcp::OP_BOOTREPLY || pkg.get_xid() != self.xid {
            return Err(RxError::PacketDrop("reply for someone else".to_owned()));
        }
        let kind = match pkg.get_message_type() {
            Some(kind) => kind,
            None => return Err(RxError::PacketDrop("reply without message type".to_owned())),
        };
        match (self.state, kind) {
            (DhcpClientState::Selecting, MessageType::Offer) => {
                let server = pkg.find_option(dhcp::OPTION_SERVER_ID)
                    .and_then(|data| if data.len() == 4 {
                        Some(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
                    } else {
                        None
                    });
                match server {
                    Some(server) => {
                        debug!("dhcp offer {} from {}", pkg.get_yiaddr(), server);
                        self.offer = Some((server, pkg.get_yiaddr()));
                        self.state = DhcpClientState::Requesting;
                        self.needs_tx = true;
                        Ok(())
                    }
                    None => Err(RxError::PacketDrop("offer without server id".to_owned())),
                }
            }
            (DhcpClientState::Requesting, MessageType::Ack) => {
                let lease = self.parse_lease(&pkg);
                debug!("dhcp bound to {}", lease.addr);
                self.lease = Some(lease);
                self.state = DhcpClientState::Bound;
                Ok(())
            }
            (_, MessageType::Nak) => {
                debug!("dhcp nak, restarting");
                self.state = DhcpClientState::Init;
                self.offer = None;
                self.needs_tx = true;
                Ok(())
            }
            _ => Err(RxError::PacketDrop("unexpected DHCP message".to_owned())),
        }
    }

    fn encapsulate(&mut self,
                   carrier: &mut [u8],
                   parent_offset: usize,
                   offset: usize)
                   -> TxResult<usize> {
        if !self.needs_tx {
            return Ok(0);
        }
        let kind = match self.state {
            DhcpClientState::Init => MessageType::Discover,
            DhcpClientState::Requesting => MessageType::Request,
            _ => return Ok(0),
        };
        if carrier.len() < offset + UDP_HEADER_LEN {
            return Err(TxError::ShortBuffer);
        }
        let dhcp_len = {
            let (_, rest) = carrier.split_at_mut(offset + UDP_HEADER_LEN);
            self.build_message(rest, kind)?
        };
        let total = UDP_HEADER_LEN + dhcp_len;
        {
            let mut udp =
                MutableUdpPacket::new(&mut carrier[offset..offset + total]).unwrap();
            udp.set_source(dhcp::CLIENT_PORT);
            udp.set_destination(dhcp::SERVER_PORT);
            udp.set_length(total as u16);
            // The IP parent fills the checksum in.
            udp.set_checksum(0);
        }
        ipv4::MutableIpv4Packet::new(&mut carrier[parent_offset..])
            .map(|mut ip| ip.set_destination(Ipv4Addr::new(255, 255, 255, 255)))
            .unwrap_or(());
        match self.state {
            DhcpClientState::Init => {
                self.state = DhcpClientState::Selecting;
                debug!("dhcp discover sent, xid {}", self.xid);
            }
            DhcpClientState::Requesting => {
                debug!("dhcp request sent, xid {}", self.xid);
            }
            _ => {}
        }
        self.needs_tx = false;
        Ok(total)
    }

    fn local_port(&self) -> u16 {
        dhcp::CLIENT_PORT
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
    use node::StackNode;
    use std::net::Ipv4Addr;
    use wire::dhcp::{self, DhcpPacket, MessageType, MutableDhcpPacket};
    use wire::udp::{MutableUdpPacket, UdpPacket};

    fn config() -> DhcpRequestConfig {
        DhcpRequestConfig {
            requested_addr: Ipv4Addr::new(192, 168, 1, 2),
            client_hw_addr: [0, 0, 0, 0, 0, 1],
            hostname: "ripstack".to_owned(),
            client_id: vec![1, 0, 0, 0, 0, 0, 1],
        }
    }

    /// Builds a server reply in a full UDP frame.
    fn reply(xid: u32, kind: MessageType, yiaddr: Ipv4Addr, server: Ipv4Addr) -> Vec<u8> {
        let mut buf = vec![0u8; 400];
        let dhcp_len = {
            let mut pkg = MutableDhcpPacket::new(&mut buf[8..]).unwrap();
            pkg.prepare();
            pkg.set_op(dhcp::OP_BOOTREPLY);
            pkg.set_xid(xid);
            pkg.set_yiaddr(yiaddr);
            let mut options = pkg.options_writer();
            options.write_message_type(kind).unwrap();
            options.write_addr(dhcp::OPTION_SERVER_ID, server).unwrap();
            options.write_u32(dhcp::OPTION_LEASE_TIME, 3600).unwrap();
            options.write_addr(dhcp::OPTION_ROUTER, server).unwrap();
            options.write_addr(dhcp::OPTION_SUBNET_MASK, Ipv4Addr::new(255, 255, 255, 0))
                .unwrap();
            options.finish()
        };
        let total = 8 + dhcp_len;
        {
            let mut udp = MutableUdpPacket::new(&mut buf[..total]).unwrap();
            udp.set_source(dhcp::SERVER_PORT);
            udp.set_destination(dhcp::CLIENT_PORT);
            udp.set_length(total as u16);
        }
        buf.truncate(total);
        buf
    }

    #[test]
    fn full_dora_exchange() {
        let mut client = DhcpClient::new();
        client.begin_request(123, config()).unwrap();
        assert_eq!(DhcpClientState::Init, client.state());

        // Discover.
        let mut carrier = vec![0u8; 600];
        let n = client.encapsulate(&mut carrier, 0, 20).unwrap();
        assert!(n > 0);
        assert_eq!(DhcpClientState::Selecting, client.state());
        {
            let udp = UdpPacket::new(&carrier[20..20 + n]).unwrap();
            assert_eq!(dhcp::CLIENT_PORT, udp.get_source());
            assert_eq!(dhcp::SERVER_PORT, udp.get_destination());
            let pkg = DhcpPacket::new(udp.payload()).unwrap();
            assert_eq!(Some(MessageType::Discover), pkg.get_message_type());
            assert_eq!(123, pkg.get_xid());
            assert_eq!(dhcp::MAGIC_COOKIE, pkg.get_magic_cookie());
        }
        // The IP destination was steered to broadcast.
        assert_eq!(&[255, 255, 255, 255], &carrier[16..20]);

        // Offer.
        let server = Ipv4Addr::new(192, 168, 1, 1);
        let mut offer = reply(123, MessageType::Offer, Ipv4Addr::new(192, 168, 1, 2), server);
        client.demux(&mut offer, 0).unwrap();
        assert_eq!(DhcpClientState::Requesting, client.state());

        // Request.
        let n = client.encapsulate(&mut carrier, 0, 20).unwrap();
        assert!(n > 0);
        {
            let udp = UdpPacket::new(&carrier[20..20 + n]).unwrap();
            let pkg = DhcpPacket::new(udp.payload()).unwrap();
            assert_eq!(Some(MessageType::Request), pkg.get_message_type());
            assert_eq!(Some(&[192, 168, 1, 1][..]),
                       pkg.find_option(dhcp::OPTION_SERVER_ID));
            assert_eq!(Some(&[192, 168, 1, 2][..]),
                       pkg.find_option(dhcp::OPTION_REQUESTED_IP));
        }

        // Ack.
        let mut ack = reply(123, MessageType::Ack, Ipv4Addr::new(192, 168, 1, 2), server);
        client.demux(&mut ack, 0).unwrap();
        assert_eq!(DhcpClientState::Bound, client.state());
        let lease = client.lease().unwrap();
        assert_eq!(Ipv4Addr::new(192, 168, 1, 2), lease.addr);
        assert_eq!(server, lease.server_id);
        assert_eq!(Some(3600), lease.lease_secs);
        assert_eq!(Some(server), lease.router);
        assert_eq!(Some(Ipv4Addr::new(255, 255, 255, 0)), lease.subnet_mask);
    }

    #[test]
    fn wrong_xid_ignored() {
        let mut client = DhcpClient::new();
        client.begin_request(123, config()).unwrap();
        let mut carrier = vec![0u8; 600];
        client.encapsulate(&mut carrier, 0, 20).unwrap();
        let mut offer = reply(999,
                              MessageType::Offer,
                              Ipv4Addr::new(192, 168, 1, 2),
                              Ipv4Addr::new(192, 168, 1, 1));
        assert!(client.demux(&mut offer, 0).is_err());
        assert_eq!(DhcpClientState::Selecting, client.state());
    }

    #[test]
    fn nak_restarts() {
        let mut client = DhcpClient::new();
        client.begin_request(123, config()).unwrap();
        let mut carrier = vec![0u8; 600];
        client.encapsulate(&mut carrier, 0, 20).unwrap();
        let mut offer = reply(123,
                              MessageType::Offer,
                              Ipv4Addr::new(192, 168, 1, 2),
                              Ipv4Addr::new(192, 168, 1, 1));
        client.demux(&mut offer, 0).unwrap();
        let mut nak = reply(123,
                            MessageType::Nak,
                            Ipv4Addr::new(0, 0, 0, 0),
                            Ipv4Addr::new(192, 168, 1, 1));
        client.demux(&mut nak, 0).unwrap();
        assert_eq!(DhcpClientState::Init, client.state());
        // A fresh discover goes out.
        let n = client.encapsulate(&mut carrier, 0, 20).unwrap();
        assert!(n > 0);
        assert_eq!(DhcpClientState::Selecting, client.state());
    }

    #[test]
    fn oversized_hostname_rejected() {
        let mut client = DhcpClient::new();
        let mut bad = config();
        bad.hostname = "x".repeat(37);
        assert!(client.begin_request(1, bad).is_err());
    }
}
