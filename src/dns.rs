//! A one-shot DNS resolver client over the UDP port dispatcher.

use errors::{RxError, RxResult, TxError, TxResult};
use node::StackNode;

use rand::{self, Rng};

use std::net::Ipv4Addr;

use wire::dns;
use wire::ipv4::{self, PROTOCOL_UDP};
use wire::udp::{MutableUdpPacket, UdpPacket};

const UDP_HEADER_LEN: usize = 8;

/// Issues A record queries towards a configured server and keeps the
/// resolved addresses of the last lookup.
pub struct DnsClient {
    local_port: u16,
    server: Ipv4Addr,
    xid: u16,
    hostname: Option<String>,
    needs_tx: bool,
    addrs: Option<Vec<Ipv4Addr>>,
    conn_id: u64,
}

impl DnsClient {
    pub fn new(local_port: u16, server: Ipv4Addr) -> DnsClient {
        assert!(local_port != 0);
        DnsClient {
            local_port: local_port,
            server: server,
            xid: 0,
            hostname: None,
            needs_tx: false,
            addrs: None,
            conn_id: 1,
        }
    }

    pub fn set_server(&mut self, server: Ipv4Addr) {
        self.server = server;
    }

    /// Starts a lookup; the query goes out on the next `encapsulate` and
    /// any previous result is discarded.
    pub fn lookup(&mut self, hostname: &str) -> TxResult<()> {
        if hostname.is_empty() || hostname.len() > 253 {
            return Err(TxError::IllegalArgument);
        }
        self.xid = rand::thread_rng().gen::<u16>();
        self.hostname = Some(hostname.to_owned());
        self.addrs = None;
        self.needs_tx = true;
        Ok(())
    }

    /// The addresses from the last completed lookup.
    pub fn result(&self) -> Option<&[Ipv4Addr]> {
        self.addrs.as_ref().map(|addrs| &addrs[..])
    }
}

impl StackNode for DnsClient {
    fn demux(&mut self, carrier: &mut [u8], offset: usize) -> RxResult {
        let data = &carrier[offset..];
        let udp = UdpPacket::new(data)?;
        if udp.get_destination() != self.local_port || udp.get_source() != dns::PORT {
            return Err(RxError::PacketDrop("not a DNS answer".to_owned()));
        }
        let pkg = dns::DnsPacket::new(udp.payload())?;
        if pkg.get_id() != self.xid || !pkg.is_response() {
            return Err(RxError::PacketDrop("answer for someone else".to_owned()));
        }
        if pkg.get_rcode() != 0 {
            debug!("dns lookup failed, rcode {}", pkg.get_rcode());
            self.addrs = Some(Vec::new());
            return Ok(());
        }
        let mut addrs = Vec::new();
        for record in pkg.answers()? {
            let record = record?;
            if let Some(addr) = record.addr {
                addrs.push(addr);
            }
        }
        debug!("dns resolved {:?} -> {:?}", self.hostname, addrs);
        self.addrs = Some(addrs);
        Ok(())
    }

    fn encapsulate(&mut self,
                   carrier: &mut [u8],
                   parent_offset: usize,
                   offset: usize)
                   -> TxResult<usize> {
        if !self.needs_tx {
            return Ok(0);
        }
        let hostname = match self.hostname {
            Some(ref hostname) => hostname.clone(),
            None => return Ok(0),
        };
        if carrier.len() < offset + UDP_HEADER_LEN {
            return Err(TxError::ShortBuffer);
        }
        let dns_len = {
            let (_, rest) = carrier.split_at_mut(offset + UDP_HEADER_LEN);
            dns::write_query(rest, self.xid, &hostname).map_err(|_| TxError::ShortBuffer)?
        };
        let total = UDP_HEADER_LEN + dns_len;
        {
            let mut udp =
                MutableUdpPacket::new(&mut carrier[offset..offset + total]).unwrap();
            udp.set_source(self.local_port);
            udp.set_destination(dns::PORT);
            udp.set_length(total as u16);
            udp.set_checksum(0);
        }
        ipv4::MutableIpv4Packet::new(&mut carrier[parent_offset..])
            .map(|mut ip| ip.set_destination(self.server))
            .unwrap_or(());
        self.needs_tx = false;
        trace!("dns query {} sent to {}", hostname, self.server);
        Ok(total)
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn protocol(&self) -> u16 {
        PROTOCOL_UDP as u16
    }

    fn connection_id(&self) -> u64 {
        self.conn_id
    }
}
