//! Link layer: EtherType demultiplexing and frame composition, the root of
//! the node tree.

use errors::{RxError, RxResult, TxError, TxResult, Validator};
use node::{NodeHandle, NodeTable, StackNode};
use util;
use wire::MacAddr;
use wire::ethernet::{EthernetFrame, MutableEthernetFrame};

/// Rolling CRC32 update callback used for the optional frame check
/// sequence.
pub type Crc32Update = fn(u32, &[u8]) -> u32;

const HEADER_LEN: usize = 14;
const FCS_LEN: usize = 4;

pub struct EthernetConfig {
    /// Clip for the carrier handed to children, 256..=65535.
    pub mtu: usize,
    pub max_nodes: usize,
    pub mac: MacAddr,
    pub gateway_mac: MacAddr,
    /// Append a frame check sequence to composed frames.
    pub append_crc32: bool,
    /// Override for the CRC32 implementation; the bundled software one is
    /// used otherwise.
    pub crc32_update: Option<Crc32Update>,
}

impl EthernetConfig {
    pub fn new(mac: MacAddr, gateway_mac: MacAddr) -> EthernetConfig {
        EthernetConfig {
            mtu: 1500,
            max_nodes: 8,
            mac: mac,
            gateway_mac: gateway_mac,
            append_crc32: false,
            crc32_update: None,
        }
    }
}

/// The link layer node. Owns the child table keyed by EtherType.
pub struct EthernetStack {
    mtu: usize,
    mac: MacAddr,
    gateway_mac: MacAddr,
    append_crc32: bool,
    crc32_update: Crc32Update,
    table: NodeTable,
    conn_id: u64,
}

impl EthernetStack {
    pub fn new(config: EthernetConfig) -> EthernetStack {
        assert!(config.mtu >= 256 && config.mtu <= 65535);
        assert!(config.max_nodes > 0);
        EthernetStack {
            mtu: config.mtu,
            mac: config.mac,
            gateway_mac: config.gateway_mac,
            append_crc32: config.append_crc32,
            crc32_update: config.crc32_update.unwrap_or(util::crc32_ieee_update),
            table: NodeTable::new(config.max_nodes),
            conn_id: 1,
        }
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn set_gateway_mac(&mut self, mac: MacAddr) {
        self.gateway_mac = mac;
    }

    pub fn register(&mut self, node: NodeHandle) -> Result<(), RxError> {
        self.table.register(node)
    }

    /// Entry point for the receive loop: one raw frame in `carrier`.
    pub fn recv(&mut self, carrier: &mut [u8]) -> RxResult {
        self.demux(carrier, 0)
    }

    /// Entry point for the transmit loop: composes at most one frame into
    /// `carrier` and returns its length, zero when the stack is idle.
    pub fn poll(&mut self, carrier: &mut [u8]) -> TxResult<usize> {
        self.encapsulate(carrier, 0, 0)
    }

    /// Housekeeping: drop invalidated children and close the holes.
    pub fn maintain(&mut self) {
        self.table.sweep();
        self.table.compact();
    }
}

impl StackNode for EthernetStack {
    fn demux(&mut self, carrier: &mut [u8], offset: usize) -> RxResult {
        let (ethertype, header_len) = {
            let frame = EthernetFrame::new(&carrier[offset..])?;
            let mut v = Validator::new();
            frame.validate_size(&mut v);
            v.result()?;
            let destination = frame.get_destination();
            if destination != self.mac && !destination.is_broadcast() {
                return Err(RxError::PacketDrop(format!("frame for {}", destination)));
            }
            if frame.is_length_field() {
                return Err(RxError::Unsupported);
            }
            (frame.get_ethertype(), frame.header_len())
        };
        trace!("ethernet frame, ethertype {:04x}", ethertype);
        self.table.demux_by(|proto, _| proto == ethertype, carrier, offset + header_len)
    }

    fn encapsulate(&mut self,
                   carrier: &mut [u8],
                   _parent_offset: usize,
                   offset: usize)
                   -> TxResult<usize> {
        if carrier.len() < offset + HEADER_LEN {
            return Err(TxError::ShortBuffer);
        }
        // Children may steer the destination; zero it so an untouched
        // field is recognisable.
        for byte in carrier[offset..offset + 6].iter_mut() {
            *byte = 0;
        }
        let clip = ::std::cmp::min(carrier.len(), offset + self.mtu);
        let (n, ethertype, _) = {
            let clipped = &mut carrier[..clip];
            self.table
                .encapsulate_round_robin(|node, _, _| {
                    node.encapsulate(&mut clipped[..], offset, offset + HEADER_LEN)
                })?
        };
        if n == 0 {
            return Ok(0);
        }
        let mut total = HEADER_LEN + n;
        {
            let mut frame =
                MutableEthernetFrame::new(&mut carrier[offset..offset + total]).unwrap();
            if frame.get_destination().is_zero() {
                frame.set_destination(self.gateway_mac);
            }
            frame.set_source(self.mac);
            frame.set_ethertype(ethertype);
        }
        if self.append_crc32 {
            if carrier.len() < offset + total + FCS_LEN {
                return Err(TxError::ShortBuffer);
            }
            let crc = !(self.crc32_update)(0xffff_ffff, &carrier[offset..offset + total]);
            // The FCS goes on the wire least significant byte first.
            carrier[offset + total] = crc as u8;
            carrier[offset + total + 1] = (crc >> 8) as u8;
            carrier[offset + total + 2] = (crc >> 16) as u8;
            carrier[offset + total + 3] = (crc >> 24) as u8;
            total += FCS_LEN;
        }
        Ok(total)
    }

    fn protocol(&self) -> u16 {
        0
    }

    fn connection_id(&self) -> u64 {
        self.conn_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use node::{NodeHandle, StackNode};
    use errors::{RxError, RxResult, TxResult};
    use std::sync::{Arc, Mutex};
    use wire::MacAddr;
    use wire::ethernet::{EthernetFrame, MutableEthernetFrame, ETHERTYPE_ARP, ETHERTYPE_IPV4};

    struct Recorder {
        proto: u16,
        offsets: Vec<usize>,
        produce: Vec<u8>,
    }

    impl StackNode for Recorder {
        fn demux(&mut self, _carrier: &mut [u8], offset: usize) -> RxResult {
            self.offsets.push(offset);
            Ok(())
        }

        fn encapsulate(&mut self,
                       carrier: &mut [u8],
                       _parent_offset: usize,
                       offset: usize)
                       -> TxResult<usize> {
            let n = self.produce.len();
            carrier[offset..offset + n].copy_from_slice(&self.produce);
            Ok(n)
        }

        fn protocol(&self) -> u16 {
            self.proto
        }

        fn connection_id(&self) -> u64 {
            1
        }
    }

    fn our_mac() -> MacAddr {
        MacAddr::new(1, 2, 3, 4, 5, 6)
    }

    fn gateway() -> MacAddr {
        MacAddr::new(9, 9, 9, 9, 9, 9)
    }

    fn stack() -> (EthernetStack, Arc<Mutex<Recorder>>) {
        let mut stack = EthernetStack::new(EthernetConfig::new(our_mac(), gateway()));
        let recorder = Arc::new(Mutex::new(Recorder {
            proto: ETHERTYPE_IPV4,
            offsets: Vec::new(),
            produce: vec![0xab; 30],
        }));
        let handle: NodeHandle = recorder.clone();
        stack.register(handle).unwrap();
        (stack, recorder)
    }

    fn frame(dst: MacAddr, ethertype: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 60];
        {
            let mut frame = MutableEthernetFrame::new(&mut buf).unwrap();
            frame.set_destination(dst);
            frame.set_source(MacAddr::new(8, 8, 8, 8, 8, 8));
            frame.set_ethertype(ethertype);
        }
        buf
    }

    #[test]
    fn dispatch_by_ethertype() {
        let (mut stack, recorder) = stack();
        let mut buf = frame(our_mac(), ETHERTYPE_IPV4);
        stack.recv(&mut buf).unwrap();
        assert_eq!(vec![14], recorder.lock().unwrap().offsets);
    }

    #[test]
    fn broadcast_accepted() {
        let (mut stack, recorder) = stack();
        let mut buf = frame(MacAddr::broadcast(), ETHERTYPE_IPV4);
        stack.recv(&mut buf).unwrap();
        assert_eq!(1, recorder.lock().unwrap().offsets.len());
    }

    #[test]
    fn wrong_mac_dropped() {
        let (mut stack, recorder) = stack();
        let mut buf = frame(MacAddr::new(0, 0, 0, 0, 0, 7), ETHERTYPE_IPV4);
        assert!(stack.recv(&mut buf).is_err());
        assert!(recorder.lock().unwrap().offsets.is_empty());
    }

    #[test]
    fn unknown_ethertype_dropped() {
        let (mut stack, _) = stack();
        let mut buf = frame(our_mac(), ETHERTYPE_ARP);
        match stack.recv(&mut buf) {
            Err(RxError::PacketDrop(..)) => {}
            other => panic!("expected drop, got {:?}", other),
        }
    }

    #[test]
    fn encapsulate_fills_header() {
        let (mut stack, _) = stack();
        let mut carrier = vec![0u8; 100];
        let n = stack.poll(&mut carrier).unwrap();
        assert_eq!(14 + 30, n);
        let frame = EthernetFrame::new(&carrier[..n]).unwrap();
        assert_eq!(gateway(), frame.get_destination());
        assert_eq!(our_mac(), frame.get_source());
        assert_eq!(ETHERTYPE_IPV4, frame.get_ethertype());
        assert_eq!(&vec![0xab; 30][..], frame.payload());
    }

    #[test]
    fn fcs_appended_when_enabled() {
        let mut config = EthernetConfig::new(our_mac(), gateway());
        config.append_crc32 = true;
        let mut stack = EthernetStack::new(config);
        let recorder = Arc::new(Mutex::new(Recorder {
            proto: ETHERTYPE_IPV4,
            offsets: Vec::new(),
            produce: vec![1, 2, 3, 4],
        }));
        let handle: NodeHandle = recorder.clone();
        stack.register(handle).unwrap();
        let mut carrier = vec![0u8; 100];
        let n = stack.poll(&mut carrier).unwrap();
        assert_eq!(14 + 4 + 4, n);
        let expected = ::util::crc32_ieee(&carrier[..14 + 4]);
        let stored = (carrier[18] as u32) | ((carrier[19] as u32) << 8) |
                     ((carrier[20] as u32) << 16) |
                     ((carrier[21] as u32) << 24);
        assert_eq!(expected, stored);
    }

    #[test]
    fn idle_children_produce_nothing() {
        let mut stack = EthernetStack::new(EthernetConfig::new(our_mac(), gateway()));
        let mut carrier = vec![0u8; 100];
        assert_eq!(0, stack.poll(&mut carrier).unwrap());
    }
}
