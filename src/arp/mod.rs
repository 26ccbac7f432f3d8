//! Address resolution (RFC 826). Tracks outstanding queries, answers
//! requests aimed at the local protocol address, and hands resolved
//! hardware addresses back through shared write-to cells.

use errors::{RxError, RxResult, TxError, TxResult, Validator};
use node::StackNode;

use std::sync::{Arc, Mutex};

use wire::arp::{ArpPacket, MutableArpPacket, OP_REPLY, OP_REQUEST};
use wire::ethernet::ETHERTYPE_ARP;

/// A caller-owned cell the handler writes a resolved hardware address
/// into. Shared so the caller can keep reading it while the handler stays
/// registered in the stack.
pub type HwAddrCell = Arc<Mutex<Vec<u8>>>;

/// Why `query_result` has no address to return.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueryError {
    /// The query exists but has not been transmitted yet.
    NotSent,
    /// The query went out but no reply has arrived.
    NoResponse,
    /// No query was ever started for this protocol address.
    NotFound,
}

pub struct ArpConfig {
    pub hw_addr: Vec<u8>,
    pub proto_addr: Vec<u8>,
    pub hardware_type: u16,
    pub protocol_type: u16,
    pub max_queries: usize,
    pub max_pending: usize,
}

struct QueryEntry {
    /// Empty marks the entry invalidated; compaction removes it.
    proto_addr: Vec<u8>,
    /// Empty until a reply resolves it.
    hw_addr: Vec<u8>,
    dst_hw: Option<HwAddrCell>,
    query_sent: bool,
}

struct PendingReply {
    target_hw: Vec<u8>,
    target_proto: Vec<u8>,
}

pub struct ArpHandler {
    hw_addr: Vec<u8>,
    proto_addr: Vec<u8>,
    hardware_type: u16,
    protocol_type: u16,
    max_queries: usize,
    max_pending: usize,
    queries: Vec<QueryEntry>,
    pending_replies: Vec<PendingReply>,
    conn_id: u64,
}

impl ArpHandler {
    pub fn new(config: ArpConfig) -> ArpHandler {
        assert!(!config.hw_addr.is_empty() && config.hw_addr.len() <= 255);
        assert!(!config.proto_addr.is_empty() && config.proto_addr.len() <= 255);
        assert!(config.max_queries > 0);
        assert!(config.max_pending > 0);
        ArpHandler {
            hw_addr: config.hw_addr,
            proto_addr: config.proto_addr,
            hardware_type: config.hardware_type,
            protocol_type: config.protocol_type,
            max_queries: config.max_queries,
            max_pending: config.max_pending,
            queries: Vec::with_capacity(config.max_queries),
            pending_replies: Vec::with_capacity(config.max_pending),
            conn_id: 1,
        }
    }

    /// Starts resolving `proto_addr`. The request goes out on the next
    /// `encapsulate`. `dst_hw`, if given, must hold a zeroed buffer of
    /// hardware address length; the resolved address is written there when
    /// the reply arrives.
    pub fn start_query(&mut self, proto_addr: &[u8], dst_hw: Option<HwAddrCell>) -> TxResult<()> {
        if proto_addr.len() != self.proto_addr.len() {
            return Err(TxError::IllegalArgument);
        }
        if let Some(ref cell) = dst_hw {
            let cell = cell.lock().unwrap();
            if cell.len() != self.hw_addr.len() || cell.iter().any(|b| *b != 0) {
                return Err(TxError::IllegalArgument);
            }
        }
        if self.queries.len() >= self.max_queries {
            self.compact();
            if self.queries.len() >= self.max_queries {
                return Err(TxError::BufferFull);
            }
        }
        self.queries.push(QueryEntry {
            proto_addr: proto_addr.to_vec(),
            hw_addr: Vec::new(),
            dst_hw: dst_hw,
            query_sent: false,
        });
        Ok(())
    }

    /// Invalidates the query for `proto_addr`; the next compaction removes
    /// it.
    pub fn discard_query(&mut self, proto_addr: &[u8]) {
        for query in self.queries.iter_mut() {
            if query.proto_addr == proto_addr {
                query.proto_addr.clear();
            }
        }
    }

    /// The resolved hardware address for `proto_addr`, or why there is
    /// none yet.
    pub fn query_result(&self, proto_addr: &[u8]) -> Result<Vec<u8>, QueryError> {
        for query in self.queries.iter() {
            if query.proto_addr.is_empty() || query.proto_addr != proto_addr {
                continue;
            }
            if !query.query_sent {
                return Err(QueryError::NotSent);
            }
            if query.hw_addr.is_empty() {
                return Err(QueryError::NoResponse);
            }
            return Ok(query.hw_addr.clone());
        }
        Err(QueryError::NotFound)
    }

    /// Removes invalidated entries in place. Capacity stays untouched.
    pub fn compact(&mut self) {
        self.queries.retain(|query| !query.proto_addr.is_empty());
    }

    /// The protocol addresses of all live queries, in insertion order.
    pub fn pending_queries(&self) -> Vec<Vec<u8>> {
        self.queries
            .iter()
            .filter(|query| !query.proto_addr.is_empty())
            .map(|query| query.proto_addr.clone())
            .collect()
    }

    fn addr_lens_match(&self, pkg: &ArpPacket) -> bool {
        pkg.get_hardware_type() == self.hardware_type &&
        pkg.get_protocol_type() == self.protocol_type &&
        pkg.get_hw_addr_len() as usize == self.hw_addr.len() &&
        pkg.get_proto_addr_len() as usize == self.proto_addr.len()
    }

    /// Writes the destination field of the parent Ethernet header.
    fn steer_parent(&self, carrier: &mut [u8], parent_offset: usize, dst: &[u8]) {
        let end = parent_offset + dst.len();
        if carrier.len() >= end {
            carrier[parent_offset..end].copy_from_slice(dst);
        }
    }

    fn packet_size(&self) -> usize {
        ArpPacket::packet_size(self.hw_addr.len() as u8, self.proto_addr.len() as u8)
    }

    fn build(&self,
             buffer: &mut [u8],
             operation: u16,
             target_hw: &[u8],
             target_proto: &[u8])
             -> TxResult<()> {
        let mut pkg = MutableArpPacket::new(buffer).map_err(|_| TxError::ShortBuffer)?;
        pkg.set_hardware_type(self.hardware_type);
        pkg.set_protocol_type(self.protocol_type);
        pkg.set_hw_addr_len(self.hw_addr.len() as u8);
        pkg.set_proto_addr_len(self.proto_addr.len() as u8);
        pkg.set_operation(operation);
        pkg.set_sender_hw_addr(&self.hw_addr);
        pkg.set_sender_proto_addr(&self.proto_addr);
        pkg.set_target_hw_addr(target_hw);
        pkg.set_target_proto_addr(target_proto);
        Ok(())
    }
}

impl StackNode for ArpHandler {
    fn demux(&mut self, carrier: &mut [u8], offset: usize) -> RxResult {
        let (operation, sender_hw, sender_proto, target_proto) = {
            let pkg = ArpPacket::new(&carrier[offset..])?;
            let mut v = Validator::new();
            pkg.validate_size(&mut v);
            v.result()?;
            if !self.addr_lens_match(&pkg) {
                return Err(RxError::Unsupported);
            }
            (pkg.get_operation(),
             pkg.get_sender_hw_addr().to_vec(),
             pkg.get_sender_proto_addr().to_vec(),
             pkg.get_target_proto_addr().to_vec())
        };
        if sender_proto.iter().all(|b| *b == 0) {
            return Err(RxError::ZeroSource);
        }
        match operation {
            OP_REQUEST => {
                if target_proto != self.proto_addr {
                    return Err(RxError::PacketDrop("request for someone else".to_owned()));
                }
                if self.pending_replies.len() >= self.max_pending {
                    return Err(RxError::BufferFull);
                }
                trace!("arp request from {:?}", sender_proto);
                self.pending_replies.push(PendingReply {
                    target_hw: sender_hw,
                    target_proto: sender_proto,
                });
                Ok(())
            }
            OP_REPLY => {
                let mut matched = false;
                for query in self.queries.iter_mut() {
                    if query.proto_addr.is_empty() || query.proto_addr != sender_proto {
                        continue;
                    }
                    debug!("arp resolved {:?} -> {:?}", sender_proto, sender_hw);
                    query.hw_addr = sender_hw.clone();
                    if let Some(ref cell) = query.dst_hw {
                        let mut cell = cell.lock().unwrap();
                        cell.copy_from_slice(&sender_hw);
                    }
                    matched = true;
                }
                if matched {
                    Ok(())
                } else {
                    Err(RxError::PacketDrop("reply to no pending query".to_owned()))
                }
            }
            _ => Err(RxError::Unsupported),
        }
    }

    fn encapsulate(&mut self,
                   carrier: &mut [u8],
                   parent_offset: usize,
                   offset: usize)
                   -> TxResult<usize> {
        let size = self.packet_size();
        // Pending replies go out before our own requests.
        if !self.pending_replies.is_empty() {
            let reply = self.pending_replies.remove(0);
            if carrier.len() < offset + size {
                return Err(TxError::ShortBuffer);
            }
            self.build(&mut carrier[offset..offset + size],
                       OP_REPLY,
                       &reply.target_hw,
                       &reply.target_proto)?;
            self.steer_parent(carrier, parent_offset, &reply.target_hw);
            return Ok(size);
        }
        let pending = self.queries
            .iter()
            .position(|query| !query.proto_addr.is_empty() && !query.query_sent);
        if let Some(idx) = pending {
            if carrier.len() < offset + size {
                return Err(TxError::ShortBuffer);
            }
            let zero_hw = vec![0; self.hw_addr.len()];
            let target_proto = self.queries[idx].proto_addr.clone();
            self.build(&mut carrier[offset..offset + size],
                       OP_REQUEST,
                       &zero_hw,
                       &target_proto)?;
            let broadcast = vec![0xff; self.hw_addr.len()];
            self.steer_parent(carrier, parent_offset, &broadcast);
            self.queries[idx].query_sent = true;
            trace!("arp request for {:?} sent", target_proto);
            return Ok(size);
        }
        Ok(0)
    }

    fn protocol(&self) -> u16 {
        ETHERTYPE_ARP
    }

    fn connection_id(&self) -> u64 {
        self.conn_id
    }
}
