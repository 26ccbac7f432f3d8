//! Generic per-port dispatcher sitting between the IP layer and the
//! transport endpoints. Adds no header of its own: children own the whole
//! transport frame. The TCP flavour answers segments towards unbound ports
//! with a reset.

use errors::{RxError, RxResult, TxResult};
use node::{NodeHandle, NodeTable, StackNode};

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use tcp;
use wire::get_u16;
use wire::ipv4::{Ipv4Packet, PROTOCOL_TCP};
use wire::tcp::{FLAG_ACK, FLAG_RST, TcpPacket};

/// Offset of the destination port within both the TCP and the UDP header.
pub const DST_PORT_OFFSET: usize = 2;

/// Bound on queued resets for unbound ports.
const MAX_PENDING_RSTS: usize = 16;

struct UnboundRst {
    remote_addr: Ipv4Addr,
    remote_port: u16,
    local_port: u16,
    seq: u32,
    ack: u32,
    ack_flag: bool,
}

pub struct PortStack {
    /// The IP protocol number this dispatcher answers for (6 or 17).
    protocol: u8,
    /// Where in the transport header the destination port lives.
    port_offset: usize,
    table: NodeTable,
    /// TCP answers segments to unbound ports with a reset; UDP silently
    /// drops them.
    pending_rsts: VecDeque<UnboundRst>,
    conn_id: u64,
}

impl PortStack {
    pub fn new(protocol: u8, max_nodes: usize) -> PortStack {
        Self::with_port_offset(protocol, DST_PORT_OFFSET, max_nodes)
    }

    /// For transports whose destination port does not sit at the usual
    /// offset.
    pub fn with_port_offset(protocol: u8, port_offset: usize, max_nodes: usize) -> PortStack {
        PortStack {
            protocol: protocol,
            port_offset: port_offset,
            table: NodeTable::new(max_nodes),
            pending_rsts: VecDeque::new(),
            conn_id: 1,
        }
    }

    pub fn register(&mut self, node: NodeHandle) -> Result<(), RxError> {
        self.table.register(node)
    }

    pub fn maintain(&mut self) {
        self.table.sweep();
        self.table.compact();
    }

    pub fn node_count(&self) -> usize {
        self.table.len()
    }

    /// Answers a segment nobody was bound for, per the RFC 9293 rules for
    /// the fictional Closed connection.
    fn queue_rst_for_unbound(&mut self, carrier: &[u8], offset: usize) {
        if self.protocol != PROTOCOL_TCP || self.pending_rsts.len() >= MAX_PENDING_RSTS {
            return;
        }
        if offset < Ipv4Packet::minimum_packet_size() {
            return;
        }
        let remote_addr = Ipv4Addr::new(carrier[offset - 8],
                                        carrier[offset - 7],
                                        carrier[offset - 6],
                                        carrier[offset - 5]);
        let pkg = match TcpPacket::new(&carrier[offset..]) {
            Ok(pkg) => pkg,
            Err(..) => return,
        };
        if pkg.get_flags() & FLAG_RST != 0 {
            return;
        }
        let rst = if pkg.get_flags() & FLAG_ACK != 0 {
            UnboundRst {
                remote_addr: remote_addr,
                remote_port: pkg.get_source(),
                local_port: pkg.get_destination(),
                seq: pkg.get_acknowledgement(),
                ack: 0,
                ack_flag: false,
            }
        } else {
            UnboundRst {
                remote_addr: remote_addr,
                remote_port: pkg.get_source(),
                local_port: pkg.get_destination(),
                seq: 0,
                ack: tcp::seq::add(pkg.get_sequence(), pkg.sequence_len()),
                ack_flag: true,
            }
        };
        debug!("tcp :{} unbound, queueing RST for {}:{}",
               rst.local_port,
               rst.remote_addr,
               rst.remote_port);
        self.pending_rsts.push_back(rst);
    }
}

impl StackNode for PortStack {
    fn demux(&mut self, carrier: &mut [u8], offset: usize) -> RxResult {
        if carrier.len() < offset + self.port_offset + 2 {
            return Err(RxError::ShortBuffer);
        }
        let port = get_u16(carrier, offset + self.port_offset);
        trace!("port dispatch to :{}", port);
        if !self.table.contains(|_, local_port| local_port == port) {
            self.queue_rst_for_unbound(carrier, offset);
            return Err(RxError::PacketDrop(format!("no node bound to :{}", port)));
        }
        // The child parses the transport header itself, the offset is
        // passed through untouched.
        self.table.demux_by(|_, local_port| local_port == port, carrier, offset)
    }

    fn encapsulate(&mut self,
                   carrier: &mut [u8],
                   parent_offset: usize,
                   offset: usize)
                   -> TxResult<usize> {
        // No header of our own: children write their frame at our offset
        // and steer the same parent header we would.
        let (n, _, _) = self.table
            .encapsulate_round_robin(|node, _, _| {
                node.encapsulate(&mut carrier[..], parent_offset, offset)
            })?;
        if n > 0 {
            return Ok(n);
        }
        if let Some(rst) = self.pending_rsts.pop_front() {
            return tcp::write_rst(carrier,
                                  parent_offset,
                                  offset,
                                  rst.local_port,
                                  rst.remote_addr,
                                  rst.remote_port,
                                  rst.seq,
                                  rst.ack,
                                  rst.ack_flag);
        }
        Ok(0)
    }

    fn protocol(&self) -> u16 {
        self.protocol as u16
    }

    fn connection_id(&self) -> u64 {
        self.conn_id
    }
}
