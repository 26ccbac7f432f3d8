//! Passive TCP endpoint: admits SYNs into pooled connections and answers
//! everything it cannot match with a reset.

use errors::{RxError, RxResult, TxError, TxResult};
use node::StackNode;

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tcp::seq;
use tcp::{SharedTcpSocket, TcpConn, TcpPool, TcpState};
use wire::ipv4;
use wire::tcp::{FLAG_ACK, FLAG_FIN, FLAG_RST, FLAG_SYN, TcpPacket};

/// Upper bound on queued outbound resets; beyond it they are dropped, the
/// peer will retry.
const MAX_PENDING_RSTS: usize = 16;

/// One queued outbound reset. Both reset causes (a rejected or unmatched
/// segment, and pool exhaustion on SYN) travel through the same queue.
#[derive(Clone, Copy, Debug)]
struct PendingRst {
    remote_addr: Ipv4Addr,
    remote_port: u16,
    seq: u32,
    ack: u32,
    ack_flag: bool,
}

/// Listening endpoint for one local port. Connections that completed the
/// handshake sit in `ready` until `try_accept` moves them to `accepted`.
pub struct TcpListener {
    local_port: u16,
    pool: Arc<TcpPool>,
    ready: Vec<SharedTcpSocket>,
    accepted: Vec<SharedTcpSocket>,
    pending_rsts: VecDeque<PendingRst>,
    conn_id: u64,
}

impl TcpListener {
    /// Creates a listener bound to `local_port`, drawing connections from
    /// `pool`.
    pub fn new(local_port: u16, pool: Arc<TcpPool>) -> TcpListener {
        assert!(local_port != 0);
        TcpListener {
            local_port: local_port,
            pool: pool,
            ready: Vec::new(),
            accepted: Vec::new(),
            pending_rsts: VecDeque::new(),
            conn_id: 1,
        }
    }

    /// Returns the next connection that has completed its handshake, or
    /// `Ok(None)` when nothing is ready yet.
    pub fn try_accept(&mut self) -> TxResult<Option<TcpConn>> {
        if self.local_port == 0 {
            return Err(TxError::Closed);
        }
        let mut idx = 0;
        while idx < self.ready.len() {
            let established = self.ready[idx].lock().unwrap().state() == TcpState::Established;
            if established {
                let socket = self.ready.remove(idx);
                self.accepted.push(socket.clone());
                return Ok(Some(TcpConn::new(socket)));
            }
            idx += 1;
        }
        Ok(None)
    }

    /// Closes the listener. Pending not-yet-accepted connections go back to
    /// the pool; accepted connections stay with their owners.
    pub fn close(&mut self) {
        for socket in self.ready.drain(..) {
            socket.lock().unwrap().abort();
            self.pool.put(&socket);
        }
        self.local_port = 0;
        self.conn_id = self.conn_id.wrapping_add(1);
    }

    pub fn is_closed(&self) -> bool {
        self.local_port == 0
    }

    fn queue_rst(&mut self, rst: PendingRst) {
        if self.pending_rsts.len() < MAX_PENDING_RSTS {
            self.pending_rsts.push_back(rst);
        } else {
            trace!("listener :{} reset queue full, dropping", self.local_port);
        }
    }

    /// Sends Closed connections whose receive stream has been drained back
    /// to the pool.
    fn reclaim(&mut self) {
        let pool = self.pool.clone();
        self.ready.retain(|socket| {
            let done = socket.lock().unwrap().state() == TcpState::Closed;
            if done {
                pool.put(socket);
            }
            !done
        });
        self.accepted.retain(|socket| {
            let done = {
                let guard = socket.lock().unwrap();
                guard.state() == TcpState::Closed && guard.recv_stream_empty()
            };
            if done {
                pool.put(socket);
            }
            !done
        });
    }

    fn find_connection(&self,
                       remote_addr: Ipv4Addr,
                       remote_port: u16)
                       -> Option<SharedTcpSocket> {
        for socket in self.accepted.iter().chain(self.ready.iter()) {
            if socket.lock().unwrap().matches(remote_addr, remote_port, self.local_port) {
                return Some(socket.clone());
            }
        }
        None
    }

    /// Builds one reset segment into the carrier.
    fn emit_rst(&mut self,
                carrier: &mut [u8],
                parent_offset: usize,
                offset: usize,
                rst: PendingRst)
                -> TxResult<usize> {
        debug!("listener :{} RST to {}:{}",
               self.local_port,
               rst.remote_addr,
               rst.remote_port);
        ::tcp::write_rst(carrier,
                         parent_offset,
                         offset,
                         self.local_port,
                         rst.remote_addr,
                         rst.remote_port,
                         rst.seq,
                         rst.ack,
                         rst.ack_flag)
    }
}

impl StackNode for TcpListener {
    fn demux(&mut self, carrier: &mut [u8], offset: usize) -> RxResult {
        if self.local_port == 0 {
            return Err(RxError::Closed);
        }
        if offset < ipv4::Ipv4Packet::minimum_packet_size() {
            return Err(RxError::ShortBuffer);
        }
        let remote_addr = Ipv4Addr::new(carrier[offset - 8],
                                        carrier[offset - 7],
                                        carrier[offset - 6],
                                        carrier[offset - 5]);
        let (remote_port, seg_seq, seg_len, flags, seg_ack) = {
            let pkg = TcpPacket::new(&carrier[offset..])?;
            if pkg.get_destination() != self.local_port {
                return Err(RxError::PacketDrop("wrong destination port".to_owned()));
            }
            (pkg.get_source(),
             pkg.get_sequence(),
             pkg.sequence_len(),
             pkg.get_flags(),
             pkg.get_acknowledgement())
        };

        // 1. An existing connection owns this four-tuple.
        if let Some(socket) = self.find_connection(remote_addr, remote_port) {
            return socket.lock().unwrap().demux(carrier, offset);
        }

        // 2. A fresh SYN. ECN negotiation bits (ECE+CWR) may ride along.
        if flags & (FLAG_SYN | FLAG_ACK | FLAG_RST | FLAG_FIN) == FLAG_SYN {
            match self.pool.get() {
                Some((socket, iss)) => {
                    let admitted = {
                        let mut guard = socket.lock().unwrap();
                        guard.open_listen(self.local_port, iss)
                            .map_err(|_| {
                                RxError::PacketDrop("pool socket not reusable".to_owned())
                            })
                            .and_then(|_| guard.demux(carrier, offset))
                    };
                    return match admitted {
                        Ok(()) => {
                            debug!("listener :{} admitted {}:{}",
                                   self.local_port,
                                   remote_addr,
                                   remote_port);
                            self.ready.push(socket);
                            Ok(())
                        }
                        Err(e) => {
                            self.pool.put(&socket);
                            Err(e)
                        }
                    };
                }
                None => {
                    debug!("listener :{} pool exhausted, resetting {}:{}",
                           self.local_port,
                           remote_addr,
                           remote_port);
                    self.queue_rst(PendingRst {
                        remote_addr: remote_addr,
                        remote_port: remote_port,
                        seq: 0,
                        ack: seq::add(seg_seq, seg_len),
                        ack_flag: true,
                    });
                    return Err(RxError::PacketDrop("pool exhausted".to_owned()));
                }
            }
        }

        // 3. Anything else aimed at this port is answered with a reset:
        // stale ACK/FIN carries its own acknowledgement to mirror, a bare
        // segment gets the seq=0 form.
        if flags & FLAG_RST == 0 {
            let rst = if flags & FLAG_ACK != 0 {
                PendingRst {
                    remote_addr: remote_addr,
                    remote_port: remote_port,
                    seq: seg_ack,
                    ack: 0,
                    ack_flag: false,
                }
            } else {
                PendingRst {
                    remote_addr: remote_addr,
                    remote_port: remote_port,
                    seq: 0,
                    ack: seq::add(seg_seq, seg_len),
                    ack_flag: true,
                }
            };
            self.queue_rst(rst);
        }
        Err(RxError::PacketDrop("no matching connection".to_owned()))
    }

    fn encapsulate(&mut self,
                   carrier: &mut [u8],
                   parent_offset: usize,
                   offset: usize)
                   -> TxResult<usize> {
        if self.local_port == 0 {
            return Err(TxError::Closed);
        }
        self.pool.check_timeouts();
        self.reclaim();

        let sockets: Vec<SharedTcpSocket> = self.accepted
            .iter()
            .chain(self.ready.iter())
            .cloned()
            .collect();
        for socket in sockets {
            let n = socket.lock().unwrap().encapsulate(carrier, parent_offset, offset)?;
            if n > 0 {
                return Ok(n);
            }
        }

        if let Some(rst) = self.pending_rsts.pop_front() {
            return self.emit_rst(carrier, parent_offset, offset, rst);
        }
        Ok(0)
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn protocol(&self) -> u16 {
        ipv4::PROTOCOL_TCP as u16
    }

    fn connection_id(&self) -> u64 {
        self.conn_id
    }
}
