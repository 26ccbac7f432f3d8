//! A minimal SNTP client over the UDP port dispatcher: one request, one
//! server timestamp back.

use errors::{RxError, RxResult, TxError, TxResult};
use node::StackNode;

use std::net::Ipv4Addr;

use wire::ipv4::{self, PROTOCOL_UDP};
use wire::ntp::{self, MutableNtpPacket, NtpPacket};
use wire::udp::{MutableUdpPacket, UdpPacket};

const UDP_HEADER_LEN: usize = 8;

/// What the server told us, paired with the originate timestamp so the
/// caller can compute offset and delay.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NtpSample {
    pub origin: u64,
    pub receive: u64,
    pub transmit: u64,
    pub stratum: u8,
}

pub struct NtpClient {
    local_port: u16,
    server: Ipv4Addr,
    origin: u64,
    needs_tx: bool,
    sample: Option<NtpSample>,
    conn_id: u64,
}

impl NtpClient {
    pub fn new(local_port: u16, server: Ipv4Addr) -> NtpClient {
        assert!(local_port != 0);
        NtpClient {
            local_port: local_port,
            server: server,
            origin: 0,
            needs_tx: false,
            sample: None,
            conn_id: 1,
        }
    }

    /// Starts one exchange. `origin` is the caller's clock in NTP 64 bit
    /// fixed point form; it is echoed by the server and used to pair the
    /// answer with the request.
    pub fn request(&mut self, origin: u64) -> TxResult<()> {
        if origin == 0 {
            return Err(TxError::IllegalArgument);
        }
        self.origin = origin;
        self.sample = None;
        self.needs_tx = true;
        Ok(())
    }

    pub fn sample(&self) -> Option<NtpSample> {
        self.sample
    }
}

impl StackNode for NtpClient {
    fn demux(&mut self, carrier: &mut [u8], offset: usize) -> RxResult {
        let data = &carrier[offset..];
        let udp = UdpPacket::new(data)?;
        if udp.get_destination() != self.local_port || udp.get_source() != ntp::PORT {
            return Err(RxError::PacketDrop("not an NTP answer".to_owned()));
        }
        let pkg = NtpPacket::new(udp.payload())?;
        if pkg.get_mode() != ntp::MODE_SERVER {
            return Err(RxError::PacketDrop("unexpected NTP mode".to_owned()));
        }
        if self.origin == 0 || pkg.get_origin_timestamp() != self.origin {
            return Err(RxError::PacketDrop("answer to someone else's request".to_owned()));
        }
        let sample = NtpSample {
            origin: self.origin,
            receive: pkg.get_receive_timestamp(),
            transmit: pkg.get_transmit_timestamp(),
            stratum: pkg.get_stratum(),
        };
        debug!("ntp sample from {}: stratum {}", self.server, sample.stratum);
        self.sample = Some(sample);
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
        let total = UDP_HEADER_LEN + NtpPacket::minimum_packet_size();
        if carrier.len() < offset + total {
            return Err(TxError::ShortBuffer);
        }
        for byte in carrier[offset..offset + total].iter_mut() {
            *byte = 0;
        }
        {
            let mut udp =
                MutableUdpPacket::new(&mut carrier[offset..offset + total]).unwrap();
            udp.set_source(self.local_port);
            udp.set_destination(ntp::PORT);
            udp.set_length(total as u16);
            udp.set_checksum(0);
        }
        {
            let start = offset + UDP_HEADER_LEN;
            let mut pkg = MutableNtpPacket::new(&mut carrier[start..start + 48]).unwrap();
            pkg.set_leap_vn_mode(0, ntp::VERSION, ntp::MODE_CLIENT);
            pkg.set_transmit_timestamp(self.origin);
        }
        ipv4::MutableIpv4Packet::new(&mut carrier[parent_offset..])
            .map(|mut ip| ip.set_destination(self.server))
            .unwrap_or(());
        self.needs_tx = false;
        trace!("ntp request sent to {}", self.server);
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
