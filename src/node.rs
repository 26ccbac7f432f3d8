//! The stack node capability interface and the registration table every
//! dispatching layer embeds.

use errors::{RxError, RxResult, TxError, TxResult};

use std::sync::{Arc, Mutex};

/// The uniform interface every protocol layer implements. A node parses its
/// own frame on the way in and composes it on the way out; parents wire
/// nodes together through `NodeTable` without knowing their concrete types.
pub trait StackNode: Send {
    /// Inbound dispatch. `carrier[offset..]` holds this node's frame, with
    /// all parent headers still present in front of it for pseudo header
    /// consultation.
    fn demux(&mut self, carrier: &mut [u8], offset: usize) -> RxResult;

    /// Outbound framing. Writes this node's frame (or nothing) to
    /// `carrier[offset..]` and returns the number of bytes written. The
    /// parent's own frame starts at `parent_offset`; a node that needs to
    /// steer parent header fields (destination MAC, destination IP) writes
    /// them there before returning.
    fn encapsulate(&mut self,
                   carrier: &mut [u8],
                   parent_offset: usize,
                   offset: usize)
                   -> TxResult<usize>;

    /// The local port this node answers to, or zero for nodes that are not
    /// port addressed.
    fn local_port(&self) -> u16 {
        0
    }

    /// The dispatch key of this node at its parent: an EtherType below an
    /// `EthernetStack`, an IP protocol number below an `IpStack`.
    fn protocol(&self) -> u16;

    /// The node's current generation. Bumped by the node whenever it is
    /// re-initialised for a new logical life; a parent holding a stale
    /// snapshot treats the node as gone.
    fn connection_id(&self) -> u64;
}

/// Shared handle to a registered node.
pub type NodeHandle = Arc<Mutex<StackNode>>;

struct NodeEntry {
    node: NodeHandle,
    protocol: u16,
    port: u16,
    conn_id: u64,
}

/// Fixed-capacity table of child nodes with round-robin outbound
/// iteration. Slots of nodes that report `Closed` or whose connection id
/// moved on are zeroed, and compaction removes the holes.
pub struct NodeTable {
    slots: Vec<Option<NodeEntry>>,
    max_nodes: usize,
    cursor: usize,
}

impl NodeTable {
    pub fn new(max_nodes: usize) -> NodeTable {
        assert!(max_nodes > 0);
        NodeTable {
            slots: Vec::with_capacity(max_nodes),
            max_nodes: max_nodes,
            cursor: 0,
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a node, caching its dispatch keys and connection id
    /// snapshot. Fails when the table is at capacity.
    pub fn register(&mut self, node: NodeHandle) -> Result<(), RxError> {
        let entry = {
            let guard = node.lock().unwrap();
            NodeEntry {
                node: node.clone(),
                protocol: guard.protocol(),
                port: guard.local_port(),
                conn_id: guard.connection_id(),
            }
        };
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(entry);
            return Ok(());
        }
        if self.slots.len() >= self.max_nodes {
            return Err(RxError::BufferFull);
        }
        self.slots.push(Some(entry));
        Ok(())
    }

    /// True when the slot still points at the same logical node.
    fn slot_valid(slot: &NodeEntry) -> bool {
        slot.node.lock().unwrap().connection_id() == slot.conn_id
    }

    /// Looks at slot `idx` and, when it is occupied, returns the handle,
    /// its cached dispatch keys and whether the snapshot is still valid.
    fn inspect(&self, idx: usize) -> Option<(NodeHandle, u16, u16, bool)> {
        match self.slots[idx] {
            Some(ref entry) => {
                Some((entry.node.clone(), entry.protocol, entry.port, Self::slot_valid(entry)))
            }
            None => None,
        }
    }

    /// True when some occupied slot matches the predicate over
    /// `(protocol, port)`. Does not check staleness.
    pub fn contains<P>(&self, pred: P) -> bool
        where P: Fn(u16, u16) -> bool
    {
        self.slots.iter().any(|slot| match *slot {
            Some(ref entry) => pred(entry.protocol, entry.port),
            None => false,
        })
    }

    /// Delivers `carrier[offset..]` to the first valid node matching the
    /// predicate over `(protocol, port)`. Stale and closed nodes are
    /// deregistered on contact.
    pub fn demux_by<P>(&mut self, pred: P, carrier: &mut [u8], offset: usize) -> RxResult
        where P: Fn(u16, u16) -> bool
    {
        for idx in 0..self.slots.len() {
            let (handle, valid) = match self.inspect(idx) {
                Some((handle, protocol, port, valid)) => {
                    if !pred(protocol, port) {
                        continue;
                    }
                    (handle, valid)
                }
                None => continue,
            };
            if !valid {
                trace!("Deregistering stale node in slot {}", idx);
                self.slots[idx] = None;
                continue;
            }
            let result = handle.lock().unwrap().demux(carrier, offset);
            return match result {
                Err(RxError::Closed) => {
                    self.slots[idx] = None;
                    Err(RxError::PacketDrop("delivered to closed node".to_owned()))
                }
                other => other,
            };
        }
        Err(RxError::PacketDrop("no matching node".to_owned()))
    }

    /// Asks every child in round-robin order to produce an outbound frame
    /// until one returns a nonzero length. The callback receives the node
    /// and its registered dispatch keys and returns the frame length.
    /// Children reporting `Closed` are deregistered and iteration
    /// continues.
    pub fn encapsulate_round_robin<F>(&mut self, mut f: F) -> TxResult<(usize, u16, u16)>
        where F: FnMut(&mut StackNode, u16, u16) -> TxResult<usize>
    {
        let count = self.slots.len();
        for step in 0..count {
            let idx = (self.cursor + step) % count;
            let (handle, protocol, port, valid) = match self.inspect(idx) {
                Some(info) => info,
                None => continue,
            };
            if !valid {
                trace!("Deregistering stale node in slot {}", idx);
                self.slots[idx] = None;
                continue;
            }
            let result = {
                let mut guard = handle.lock().unwrap();
                f(&mut *guard, protocol, port)
            };
            match result {
                Ok(0) => continue,
                Ok(n) => {
                    self.cursor = (idx + 1) % count;
                    return Ok((n, protocol, port));
                }
                Err(TxError::Closed) => {
                    self.slots[idx] = None;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok((0, 0, 0))
    }

    /// Removes zeroed slots, preserving registration order.
    pub fn compact(&mut self) {
        self.slots.retain(|slot| slot.is_some());
        self.cursor = 0;
    }

    /// Zeroes every slot whose node is stale. Does not shift capacity.
    pub fn sweep(&mut self) {
        for slot in self.slots.iter_mut() {
            let stale = match *slot {
                Some(ref entry) => !Self::slot_valid(entry),
                None => false,
            };
            if stale {
                *slot = None;
            }
        }
    }
}
