//! The per-connection TCP protocol engine.

use errors::{RxError, RxResult, TxError, TxResult, Validator};
use node::StackNode;

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tcp::seq;
use tcp::{TcpConfig, TcpState};
use util::Ring;
use wire::ipv4;
use wire::tcp::{FLAG_ACK, FLAG_FIN, FLAG_PSH, FLAG_RST, FLAG_SYN, MutableTcpPacket, TcpPacket,
                OPTION_MSS, OPTION_NOP, OPTION_SACK_PERMITTED};

/// The segment size we announce and the ceiling for the effective send
/// segment size.
pub const DEFAULT_MSS: u16 = 1460;

/// Peers that announce nothing get the RFC 1122 default.
const FALLBACK_MSS: u16 = 536;

const TCP_HEADER_LEN: usize = 20;
/// MSS + SACK permitted + two padding NOPs.
const SYN_OPTIONS_LEN: usize = 8;

fn rto_initial() -> Duration {
    Duration::new(1, 0)
}

fn rto_min() -> Duration {
    Duration::from_millis(200)
}

fn rto_max() -> Duration {
    Duration::new(60, 0)
}

/// How long a connection lingers in TimeWait: two maximum segment
/// lifetimes.
fn time_wait_duration() -> Duration {
    Duration::new(60, 0)
}

/// Descriptor of one transmitted, not yet fully acknowledged segment.
#[derive(Clone, Copy, Debug)]
struct TxSegment {
    seq: u32,
    payload_len: u16,
    flags: u8,
    sent_at: Instant,
    retransmitted: bool,
}

impl TxSegment {
    /// Sequence space this segment occupies, SYN/FIN phantom bytes
    /// included.
    fn seq_len(&self) -> u32 {
        let mut len = self.payload_len as u32;
        if self.flags & FLAG_SYN != 0 {
            len += 1;
        }
        if self.flags & FLAG_FIN != 0 {
            len += 1;
        }
        len
    }

    fn end_seq(&self) -> u32 {
        seq::add(self.seq, self.seq_len())
    }
}

/// Fixed-capacity circular queue of in-flight segment descriptors, oldest
/// first.
struct TxQueue {
    segs: ::std::collections::VecDeque<TxSegment>,
    capacity: usize,
}

impl TxQueue {
    fn new(capacity: usize) -> TxQueue {
        assert!(capacity >= 2);
        TxQueue {
            segs: ::std::collections::VecDeque::with_capacity(capacity),
            capacity: capacity,
        }
    }

    fn push(&mut self, seg: TxSegment) -> TxResult<()> {
        if self.segs.len() >= self.capacity {
            return Err(TxError::BufferFull);
        }
        self.segs.push_back(seg);
        Ok(())
    }

    fn oldest_mut(&mut self) -> Option<&mut TxSegment> {
        self.segs.front_mut()
    }

    fn len(&self) -> usize {
        self.segs.len()
    }

    fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    fn is_full(&self) -> bool {
        self.segs.len() >= self.capacity
    }

    fn clear(&mut self) {
        self.segs.clear();
    }

    /// Drops every segment fully covered by `ack`. Returns an RTT sample
    /// from a segment that was never retransmitted, if one was acked
    /// (Karn's algorithm).
    fn ack_update(&mut self, ack: u32, now: Instant) -> Option<Duration> {
        let mut sample = None;
        while let Some(covered) = self.segs
            .front()
            .map(|seg| seq::le(seg.end_seq(), ack)) {
            if !covered {
                break;
            }
            let seg = self.segs.pop_front().unwrap();
            if !seg.retransmitted {
                sample = Some(now.duration_since(seg.sent_at));
            }
        }
        sample
    }
}

/// One pending outbound reset.
#[derive(Clone, Copy, Debug)]
struct PendingRst {
    seq: u32,
    ack: u32,
    ack_flag: bool,
}

/// The TCP connection engine. Driven entirely by `demux` (segment arrival)
/// and `encapsulate` (the scheduler asking for one outbound segment);
/// timers are derived from the transmit timestamps on each `encapsulate`
/// call, there is no callback scheduler.
pub struct TcpSocket {
    state: TcpState,
    conn_id: u64,

    local_port: u16,
    remote_port: u16,
    remote_addr: Ipv4Addr,

    iss: u32,
    irs: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u16,
    snd_wl1: u32,
    snd_wl2: u32,
    rcv_nxt: u32,
    mss: u16,

    buf_rx: Ring,
    buf_tx: Ring,
    tx_queue: TxQueue,

    syn_sent: bool,
    syn_acked: bool,
    fin_pending: bool,
    fin_seq: Option<u32>,
    fin_acked: bool,
    send_ack: bool,
    pending_rst: Option<PendingRst>,
    /// Set by `abort` so the connection id is bumped once the RST leaves.
    invalidate_after_rst: bool,

    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    last_tx: Instant,
    last_rx: Instant,
    time_wait_since: Option<Instant>,

    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl TcpSocket {
    /// Creates a closed socket with its buffers installed. The buffers live
    /// for the lifetime of the socket across any number of connections.
    pub fn new(config: TcpConfig) -> TcpSocket {
        let now = Instant::now();
        TcpSocket {
            state: TcpState::Closed,
            conn_id: 1,
            local_port: 0,
            remote_port: 0,
            remote_addr: Ipv4Addr::new(0, 0, 0, 0),
            iss: 0,
            irs: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            rcv_nxt: 0,
            mss: FALLBACK_MSS,
            buf_rx: Ring::new(config.rx_buf),
            buf_tx: Ring::new(config.tx_buf),
            tx_queue: TxQueue::new(config.queue_size),
            syn_sent: false,
            syn_acked: false,
            fin_pending: false,
            fin_seq: None,
            fin_acked: false,
            send_ack: false,
            pending_rst: None,
            invalidate_after_rst: false,
            srtt: None,
            rttvar: Duration::new(0, 0),
            rto: rto_initial(),
            last_tx: now,
            last_rx: now,
            time_wait_since: None,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Re-initialises the socket for a new connection life, bumping the
    /// connection id so parents drop any registration of the previous life.
    pub fn reinit(&mut self) {
        self.conn_id = self.conn_id.wrapping_add(1);
        self.state = TcpState::Closed;
        self.local_port = 0;
        self.remote_port = 0;
        self.remote_addr = Ipv4Addr::new(0, 0, 0, 0);
        self.iss = 0;
        self.irs = 0;
        self.snd_una = 0;
        self.snd_nxt = 0;
        self.snd_wnd = 0;
        self.snd_wl1 = 0;
        self.snd_wl2 = 0;
        self.rcv_nxt = 0;
        self.mss = FALLBACK_MSS;
        self.buf_rx.reset();
        self.buf_tx.reset();
        self.tx_queue.clear();
        self.syn_sent = false;
        self.syn_acked = false;
        self.fin_pending = false;
        self.fin_seq = None;
        self.fin_acked = false;
        self.send_ack = false;
        self.pending_rst = None;
        self.invalidate_after_rst = false;
        self.srtt = None;
        self.rttvar = Duration::new(0, 0);
        self.rto = rto_initial();
        self.time_wait_since = None;
        self.read_deadline = None;
        self.write_deadline = None;
    }

    /// Active open towards `remote`. Queues the SYN.
    pub fn open_active(&mut self,
                       local_port: u16,
                       remote_addr: Ipv4Addr,
                       remote_port: u16,
                       iss: u32)
                       -> TxResult<()> {
        if self.state != TcpState::Closed {
            return Err(TxError::IllegalArgument);
        }
        if local_port == 0 || remote_port == 0 {
            return Err(TxError::IllegalArgument);
        }
        self.local_port = local_port;
        self.remote_addr = remote_addr;
        self.remote_port = remote_port;
        self.iss = iss;
        self.snd_una = iss;
        self.snd_nxt = iss;
        self.state = TcpState::SynSent;
        debug!("tcp :{} -> {}:{} open, iss {}",
               local_port,
               remote_addr,
               remote_port,
               iss);
        Ok(())
    }

    /// Passive open. The socket binds to the remote end of the first SYN it
    /// sees.
    pub fn open_listen(&mut self, local_port: u16, iss: u32) -> TxResult<()> {
        if self.state != TcpState::Closed {
            return Err(TxError::IllegalArgument);
        }
        if local_port == 0 {
            return Err(TxError::IllegalArgument);
        }
        self.local_port = local_port;
        self.iss = iss;
        self.snd_una = iss;
        self.snd_nxt = iss;
        self.state = TcpState::Listen;
        Ok(())
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn remote_addr(&self) -> Ipv4Addr {
        self.remote_addr
    }

    pub fn iss(&self) -> u32 {
        self.iss
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.read_deadline
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        self.write_deadline
    }

    /// When the last segment left, for idle tracking.
    pub fn last_tx(&self) -> Instant {
        self.last_tx
    }

    /// When the last segment arrived.
    pub fn last_rx(&self) -> Instant {
        self.last_rx
    }

    /// True when every written byte has been transmitted and acknowledged.
    pub fn send_stream_empty(&self) -> bool {
        self.buf_tx.is_empty() && self.tx_queue.is_empty()
    }

    /// True when no received data is waiting to be read.
    pub fn recv_stream_empty(&self) -> bool {
        self.buf_rx.is_empty()
    }

    /// True when this socket matches an incoming segment's addressing.
    pub fn matches(&self, remote_addr: Ipv4Addr, remote_port: u16, local_port: u16) -> bool {
        self.local_port == local_port && self.remote_port == remote_port &&
        self.remote_addr == remote_addr
    }

    /// Non-blocking write into the send stream. Returns how many bytes
    /// fitted.
    pub fn write(&mut self, b: &[u8]) -> TxResult<usize> {
        if self.state.is_closing() || self.fin_pending {
            return Err(TxError::Closed);
        }
        if !(self.state == TcpState::Established || self.state == TcpState::CloseWait ||
             self.state == TcpState::SynSent ||
             self.state == TcpState::SynRcvd) {
            return Err(TxError::Closed);
        }
        Ok(self.buf_tx.write(b))
    }

    /// Non-blocking read from the receive stream. `Ok(0)` means no data
    /// right now; `Err(Closed)` means the stream is drained and the
    /// connection is finished.
    pub fn read(&mut self, b: &mut [u8]) -> TxResult<usize> {
        let n = self.buf_rx.read(b);
        if n > 0 {
            return Ok(n);
        }
        match self.state {
            TcpState::Closed | TcpState::CloseWait | TcpState::LastAck | TcpState::Closing |
            TcpState::TimeWait => Err(TxError::Closed),
            _ => Ok(0),
        }
    }

    /// Starts an orderly close: a FIN is queued after any buffered data.
    /// The receive stream is untouched, data already received stays
    /// readable.
    pub fn close(&mut self) {
        match self.state {
            TcpState::SynSent | TcpState::Listen => {
                self.state = TcpState::Closed;
            }
            TcpState::Established | TcpState::SynRcvd => {
                self.fin_pending = true;
                self.state = TcpState::FinWait1;
            }
            TcpState::CloseWait => {
                self.fin_pending = true;
                self.state = TcpState::LastAck;
            }
            _ => {}
        }
        debug!("tcp :{} close -> {:?}", self.local_port, self.state);
    }

    /// Immediate teardown. Queues a RST when the connection ever reached a
    /// state where the peer is addressable.
    pub fn abort(&mut self) {
        if self.state.is_synchronized() || self.state == TcpState::SynRcvd {
            self.pending_rst = Some(PendingRst {
                seq: self.snd_nxt,
                ack: self.rcv_nxt,
                ack_flag: true,
            });
            self.invalidate_after_rst = true;
        } else {
            self.conn_id = self.conn_id.wrapping_add(1);
        }
        self.buf_tx.reset();
        self.tx_queue.clear();
        self.fin_pending = false;
        self.state = TcpState::Closed;
        debug!("tcp :{} aborted", self.local_port);
    }

    /// Sequence number of the first byte held in `buf_tx`.
    fn data_base(&self) -> u32 {
        if !self.syn_acked {
            seq::add(self.iss, 1)
        } else {
            self.snd_una
        }
    }

    /// Data bytes transmitted at least once and still unacknowledged, plus
    /// untransmitted data, has to equal `buf_tx.buffered()`.
    fn sent_data(&self) -> u32 {
        if !self.syn_sent {
            return 0;
        }
        let mut sent = seq::diff(self.snd_nxt, self.data_base());
        if self.fin_seq.is_some() && !self.fin_acked {
            sent -= 1;
        }
        sent
    }

    fn unsent_data(&self) -> u32 {
        self.buf_tx.buffered() as u32 - self.sent_data()
    }

    fn in_flight(&self) -> u32 {
        seq::diff(self.snd_nxt, self.snd_una)
    }

    fn receive_window(&self) -> u16 {
        ::std::cmp::min(self.buf_rx.free(), 0xffff) as u16
    }

    fn update_rtt(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let delta = if srtt > sample {
                    srtt - sample
                } else {
                    sample - srtt
                };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + sample) / 8);
            }
        }
        let srtt = self.srtt.unwrap();
        let rto = srtt + self.rttvar * 4;
        self.rto = ::std::cmp::min(::std::cmp::max(rto, rto_min()), rto_max());
        trace!("tcp :{} rtt sample {:?}, rto now {:?}",
               self.local_port,
               sample,
               self.rto);
    }

    fn queue_rst_for(&mut self, pkg: &TcpPacket) {
        if pkg.get_flags() & FLAG_RST != 0 {
            return;
        }
        if pkg.get_flags() & FLAG_ACK != 0 {
            self.pending_rst = Some(PendingRst {
                seq: pkg.get_acknowledgement(),
                ack: 0,
                ack_flag: false,
            });
        } else {
            self.pending_rst = Some(PendingRst {
                seq: 0,
                ack: seq::add(pkg.get_sequence(), pkg.sequence_len()),
                ack_flag: true,
            });
        }
    }

    /// Handles a segment for a socket in Listen.
    fn demux_listen(&mut self, pkg: &TcpPacket, remote_addr: Ipv4Addr) -> RxResult {
        let flags = pkg.get_flags();
        if flags & FLAG_RST != 0 {
            return Ok(());
        }
        if flags & FLAG_ACK != 0 {
            self.queue_rst_for(pkg);
            return Ok(());
        }
        if flags & FLAG_SYN == 0 {
            return Err(RxError::PacketDrop("no SYN towards listening socket".to_owned()));
        }
        self.remote_addr = remote_addr;
        self.remote_port = pkg.get_source();
        self.irs = pkg.get_sequence();
        self.rcv_nxt = seq::add(self.irs, 1);
        self.snd_wnd = pkg.get_window();
        self.snd_wl1 = self.irs;
        self.snd_wl2 = self.iss;
        if let Some(peer_mss) = pkg.get_mss_option() {
            self.mss = ::std::cmp::min(peer_mss, DEFAULT_MSS);
        }
        self.state = TcpState::SynRcvd;
        debug!("tcp :{} SYN from {}:{}, irs {}",
               self.local_port,
               remote_addr,
               self.remote_port,
               self.irs);
        Ok(())
    }

    /// Handles a segment for a socket in SynSent.
    fn demux_syn_sent(&mut self, pkg: &TcpPacket) -> RxResult {
        let flags = pkg.get_flags();
        let ack = pkg.get_acknowledgement();
        if flags & FLAG_ACK != 0 {
            if seq::le(ack, self.iss) || seq::gt(ack, self.snd_nxt) {
                self.queue_rst_for(pkg);
                return Ok(());
            }
        }
        if flags & FLAG_RST != 0 {
            if flags & FLAG_ACK != 0 {
                debug!("tcp :{} connection refused", self.local_port);
                self.state = TcpState::Closed;
                self.tx_queue.clear();
                self.buf_tx.reset();
            }
            return Ok(());
        }
        if flags & FLAG_SYN == 0 {
            return Ok(());
        }
        self.irs = pkg.get_sequence();
        self.rcv_nxt = seq::add(self.irs, 1);
        if let Some(peer_mss) = pkg.get_mss_option() {
            self.mss = ::std::cmp::min(peer_mss, DEFAULT_MSS);
        }
        if flags & FLAG_ACK != 0 {
            let now = Instant::now();
            if let Some(sample) = self.tx_queue.ack_update(ack, now) {
                self.update_rtt(sample);
            }
            self.snd_una = ack;
            self.syn_acked = true;
            self.snd_wnd = pkg.get_window();
            self.snd_wl1 = self.irs;
            self.snd_wl2 = ack;
            self.state = TcpState::Established;
            self.send_ack = true;
            debug!("tcp :{} established with {}:{}",
                   self.local_port,
                   self.remote_addr,
                   self.remote_port);
        } else {
            // Simultaneous open: answer with SYN+ACK.
            self.syn_sent = false;
            self.tx_queue.clear();
            self.snd_nxt = self.iss;
            self.state = TcpState::SynRcvd;
        }
        Ok(())
    }

    /// The sequence window test of RFC 9293 §3.10.7.4.
    fn segment_acceptable(&self, pkg: &TcpPacket) -> bool {
        let seg_seq = pkg.get_sequence();
        let seg_len = pkg.sequence_len();
        let wnd = self.receive_window() as u32;
        let wnd_end = seq::add(self.rcv_nxt, wnd);
        if seg_len == 0 {
            if wnd == 0 {
                seg_seq == self.rcv_nxt
            } else {
                seq::between(self.rcv_nxt, seg_seq, wnd_end)
            }
        } else if wnd == 0 {
            false
        } else {
            seq::between(self.rcv_nxt, seg_seq, wnd_end) ||
            seq::between(self.rcv_nxt,
                         seq::add(seg_seq, seg_len - 1),
                         wnd_end)
        }
    }

    fn handle_ack(&mut self, pkg: &TcpPacket) -> RxResult {
        let ack = pkg.get_acknowledgement();
        if self.state == TcpState::SynRcvd {
            if seq::lt(self.snd_una, ack) && seq::le(ack, self.snd_nxt) {
                self.state = TcpState::Established;
                debug!("tcp :{} established with {}:{}",
                       self.local_port,
                       self.remote_addr,
                       self.remote_port);
            } else {
                self.pending_rst = Some(PendingRst {
                    seq: ack,
                    ack: 0,
                    ack_flag: false,
                });
                return Ok(());
            }
        }
        if seq::gt(ack, self.snd_nxt) {
            // Acknowledgement of data never sent.
            self.send_ack = true;
            return Ok(());
        }
        if seq::lt(self.snd_una, ack) {
            let now = Instant::now();
            if let Some(sample) = self.tx_queue.ack_update(ack, now) {
                self.update_rtt(sample);
            }
            let acked_total = seq::diff(ack, self.snd_una);
            let mut phantom = 0;
            if !self.syn_acked && seq::gt(ack, self.iss) {
                self.syn_acked = true;
                phantom += 1;
            }
            if let Some(fin_seq) = self.fin_seq {
                if !self.fin_acked && seq::ge(ack, seq::add(fin_seq, 1)) {
                    self.fin_acked = true;
                    phantom += 1;
                }
            }
            let data_acked = (acked_total - phantom) as usize;
            self.buf_tx.read_discard(data_acked);
            self.snd_una = ack;
            if self.fin_acked {
                match self.state {
                    TcpState::FinWait1 => self.state = TcpState::FinWait2,
                    TcpState::Closing => {
                        self.state = TcpState::TimeWait;
                        self.time_wait_since = Some(now);
                    }
                    TcpState::LastAck => {
                        debug!("tcp :{} closed", self.local_port);
                        self.state = TcpState::Closed;
                        self.tx_queue.clear();
                    }
                    _ => {}
                }
            }
        }
        // Window update per RFC 793 SND.WL1/WL2 bookkeeping.
        let seg_seq = pkg.get_sequence();
        if seq::lt(self.snd_wl1, seg_seq) ||
           (self.snd_wl1 == seg_seq && seq::le(self.snd_wl2, ack)) {
            self.snd_wnd = pkg.get_window();
            self.snd_wl1 = seg_seq;
            self.snd_wl2 = ack;
        }
        Ok(())
    }

    fn ingest_data(&mut self, pkg: &TcpPacket) {
        let payload = pkg.payload();
        if payload.is_empty() {
            return;
        }
        match self.state {
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {}
            _ => return,
        }
        let seg_seq = pkg.get_sequence();
        if seq::gt(seg_seq, self.rcv_nxt) {
            // A hole; drop and let the retransmission replay it in order.
            self.send_ack = true;
            return;
        }
        let trim = seq::diff(self.rcv_nxt, seg_seq) as usize;
        if trim < payload.len() {
            let wrote = self.buf_rx.write(&payload[trim..]);
            self.rcv_nxt = seq::add(self.rcv_nxt, wrote as u32);
            if wrote < payload.len() - trim {
                trace!("tcp :{} receive buffer full, dropped {} bytes",
                       self.local_port,
                       payload.len() - trim - wrote);
            }
        }
        self.send_ack = true;
    }

    fn handle_fin(&mut self, pkg: &TcpPacket) {
        if pkg.get_flags() & FLAG_FIN == 0 {
            return;
        }
        let fin_seq = seq::add(pkg.get_sequence(), pkg.payload().len() as u32);
        if fin_seq != self.rcv_nxt {
            // FIN beyond a hole, ignore until the data is replayed.
            return;
        }
        self.rcv_nxt = seq::add(self.rcv_nxt, 1);
        self.send_ack = true;
        let now = Instant::now();
        match self.state {
            TcpState::Established => self.state = TcpState::CloseWait,
            TcpState::FinWait1 => {
                if self.fin_acked {
                    self.state = TcpState::TimeWait;
                    self.time_wait_since = Some(now);
                } else {
                    self.state = TcpState::Closing;
                }
            }
            TcpState::FinWait2 => {
                self.state = TcpState::TimeWait;
                self.time_wait_since = Some(now);
            }
            _ => {}
        }
        debug!("tcp :{} FIN received -> {:?}", self.local_port, self.state);
    }

    /// Builds one segment into `carrier[offset..]` and steers the parent's
    /// destination address field.
    fn emit(&mut self,
            carrier: &mut [u8],
            parent_offset: usize,
            offset: usize,
            seq_num: u32,
            flags: u8,
            options: &[u8],
            payload_skip: usize,
            payload_len: usize)
            -> TxResult<usize> {
        let header_len = TCP_HEADER_LEN + options.len();
        let total = header_len + payload_len;
        if carrier.len() < offset + total {
            return Err(TxError::ShortBuffer);
        }
        let ack_num = if flags & FLAG_ACK != 0 { self.rcv_nxt } else { 0 };
        let window = self.receive_window();
        {
            let mut pkg = MutableTcpPacket::new(&mut carrier[offset..offset + total]).unwrap();
            pkg.set_source(self.local_port);
            pkg.set_destination(self.remote_port);
            pkg.set_sequence(seq_num);
            pkg.set_acknowledgement(ack_num);
            pkg.set_data_offset((header_len / 4) as u8);
            pkg.set_flags(flags);
            pkg.set_window(window);
            pkg.set_urgent_pointer(0);
            // The parent IP layer computes and fills the checksum.
            pkg.set_checksum(0);
            if !options.is_empty() {
                pkg.set_options_raw(options);
            }
        }
        if payload_len > 0 {
            let n = self.buf_tx.read_at(&mut carrier[offset + header_len..offset + total],
                                        payload_skip);
            debug_assert_eq!(payload_len, n);
        }
        // Steer the IP destination for the parent.
        ipv4::MutableIpv4Packet::new(&mut carrier[parent_offset..])
            .map(|mut ip| ip.set_destination(self.remote_addr))
            .unwrap_or(());
        self.last_tx = Instant::now();
        Ok(total)
    }

    fn syn_options(&self) -> [u8; SYN_OPTIONS_LEN] {
        [OPTION_MSS,
         4,
         (DEFAULT_MSS >> 8) as u8,
         DEFAULT_MSS as u8,
         OPTION_SACK_PERMITTED,
         2,
         OPTION_NOP,
         OPTION_NOP]
    }
}

impl StackNode for TcpSocket {
    fn demux(&mut self, carrier: &mut [u8], offset: usize) -> RxResult {
        // The IPv4 header directly precedes the segment; the stack keeps
        // its header at twenty bytes so the source address sits at a fixed
        // distance.
        if offset < ipv4::Ipv4Packet::minimum_packet_size() {
            return Err(RxError::ShortBuffer);
        }
        let remote_addr = Ipv4Addr::new(carrier[offset - 8],
                                        carrier[offset - 7],
                                        carrier[offset - 6],
                                        carrier[offset - 5]);
        let data = &carrier[offset..];
        let pkg = TcpPacket::new(data)?;
        let mut v = Validator::new();
        pkg.validate_size(&mut v);
        v.result()?;

        if pkg.get_destination() != self.local_port {
            return Err(RxError::PacketDrop("wrong destination port".to_owned()));
        }
        if self.state != TcpState::Listen && self.state != TcpState::Closed &&
           !(pkg.get_source() == self.remote_port && remote_addr == self.remote_addr) {
            return Err(RxError::PacketDrop("segment from wrong peer".to_owned()));
        }
        self.last_rx = Instant::now();

        match self.state {
            TcpState::Closed => {
                // Mirror the segment's addressing so the reset can be
                // routed back.
                self.remote_addr = remote_addr;
                self.remote_port = pkg.get_source();
                self.queue_rst_for(&pkg);
                Ok(())
            }
            TcpState::Listen => self.demux_listen(&pkg, remote_addr),
            TcpState::SynSent => self.demux_syn_sent(&pkg),
            _ => {
                if !self.segment_acceptable(&pkg) {
                    if pkg.get_flags() & FLAG_RST == 0 {
                        self.send_ack = true;
                    }
                    return Ok(());
                }
                let flags = pkg.get_flags();
                if flags & FLAG_RST != 0 {
                    debug!("tcp :{} reset by peer", self.local_port);
                    self.state = TcpState::Closed;
                    self.tx_queue.clear();
                    self.buf_tx.reset();
                    self.fin_pending = false;
                    return Ok(());
                }
                if flags & FLAG_SYN != 0 {
                    // A SYN inside the window is fatal.
                    self.pending_rst = Some(PendingRst {
                        seq: self.snd_nxt,
                        ack: self.rcv_nxt,
                        ack_flag: true,
                    });
                    self.state = TcpState::Closed;
                    self.tx_queue.clear();
                    return Ok(());
                }
                if flags & FLAG_ACK == 0 {
                    return Ok(());
                }
                self.handle_ack(&pkg)?;
                if self.state == TcpState::Closed {
                    return Ok(());
                }
                self.ingest_data(&pkg);
                self.handle_fin(&pkg);
                Ok(())
            }
        }
    }

    fn encapsulate(&mut self,
                   carrier: &mut [u8],
                   parent_offset: usize,
                   offset: usize)
                   -> TxResult<usize> {
        let now = Instant::now();

        // TimeWait expiry is timestamp driven, checked whenever the
        // scheduler polls.
        if self.state == TcpState::TimeWait {
            if let Some(since) = self.time_wait_since {
                if now.duration_since(since) >= time_wait_duration() {
                    debug!("tcp :{} TimeWait expired", self.local_port);
                    self.state = TcpState::Closed;
                    self.time_wait_since = None;
                }
            }
        }

        // 1. Pending reset.
        if let Some(rst) = self.pending_rst.take() {
            let flags = if rst.ack_flag {
                FLAG_RST | FLAG_ACK
            } else {
                FLAG_RST
            };
            let saved_rcv_nxt = self.rcv_nxt;
            if rst.ack_flag {
                self.rcv_nxt = rst.ack;
            }
            let result = self.emit(carrier, parent_offset, offset, rst.seq, flags, &[], 0, 0);
            self.rcv_nxt = saved_rcv_nxt;
            if self.invalidate_after_rst {
                self.invalidate_after_rst = false;
                self.conn_id = self.conn_id.wrapping_add(1);
            }
            return result;
        }

        // 2. Initial SYN or SYN+ACK.
        if !self.syn_sent &&
           (self.state == TcpState::SynSent || self.state == TcpState::SynRcvd) {
            let flags = if self.state == TcpState::SynSent {
                FLAG_SYN
            } else {
                FLAG_SYN | FLAG_ACK
            };
            let options = self.syn_options();
            let n = self.emit(carrier,
                              parent_offset,
                              offset,
                              self.iss,
                              flags,
                              &options,
                              0,
                              0)?;
            self.syn_sent = true;
            self.snd_nxt = seq::add(self.iss, 1);
            self.tx_queue
                .push(TxSegment {
                    seq: self.iss,
                    payload_len: 0,
                    flags: flags,
                    sent_at: now,
                    retransmitted: false,
                })
                .unwrap_or(());
            return Ok(n);
        }

        // 3. Retransmission of the oldest unacknowledged segment.
        let rto = self.rto;
        let retransmit = match self.tx_queue.oldest_mut() {
            Some(seg) => {
                if now.duration_since(seg.sent_at) >= rto {
                    seg.sent_at = now;
                    seg.retransmitted = true;
                    Some(*seg)
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(seg) = retransmit {
            // Exponential backoff, capped.
            self.rto = ::std::cmp::min(rto * 2, rto_max());
            debug!("tcp :{} retransmit seq {}, rto doubled to {:?}",
                   self.local_port,
                   seg.seq,
                   self.rto);
            let mut flags = seg.flags;
            if self.state != TcpState::SynSent {
                flags |= FLAG_ACK;
            }
            let options;
            let options_slice: &[u8] = if flags & FLAG_SYN != 0 {
                options = self.syn_options();
                &options
            } else {
                &[]
            };
            let skip = if flags & FLAG_SYN != 0 {
                0
            } else {
                seq::diff(seg.seq, self.data_base()) as usize
            };
            let n = self.emit(carrier,
                              parent_offset,
                              offset,
                              seg.seq,
                              flags,
                              options_slice,
                              skip,
                              seg.payload_len as usize)?;
            self.send_ack = false;
            return Ok(n);
        }

        // 4. FIN once the send stream has been fully transmitted.
        if self.fin_pending && self.fin_seq.is_none() && self.syn_sent &&
           self.unsent_data() == 0 {
            let fin_seq = self.snd_nxt;
            let flags = FLAG_FIN | FLAG_ACK;
            let n = self.emit(carrier, parent_offset, offset, fin_seq, flags, &[], 0, 0)?;
            self.fin_seq = Some(fin_seq);
            self.snd_nxt = seq::add(fin_seq, 1);
            self.tx_queue
                .push(TxSegment {
                    seq: fin_seq,
                    payload_len: 0,
                    flags: flags,
                    sent_at: now,
                    retransmitted: false,
                })
                .unwrap_or(());
            self.send_ack = false;
            debug!("tcp :{} FIN sent, seq {}", self.local_port, fin_seq);
            return Ok(n);
        }

        // 5. New data, clamped by the peer window, the segment size and the
        // carrier space the parent clipped for us. Buffered data still
        // drains in FinWait1 since the FIN waits for it; once the FIN is
        // out no data follows.
        if self.syn_acked && self.state != TcpState::Closed &&
           self.state != TcpState::TimeWait && !self.tx_queue.is_full() {
            let unsent = self.unsent_data();
            if unsent > 0 && self.fin_seq.is_none() {
                let window_room = (self.snd_wnd as u32).saturating_sub(self.in_flight());
                let carrier_room = carrier.len()
                    .saturating_sub(offset + TCP_HEADER_LEN) as u32;
                let len = ::std::cmp::min(::std::cmp::min(unsent, self.mss as u32),
                                          ::std::cmp::min(window_room, carrier_room));
                if len > 0 {
                    let mut flags = FLAG_ACK;
                    if len == unsent {
                        flags |= FLAG_PSH;
                    }
                    let skip = self.sent_data() as usize;
                    let seq_num = self.snd_nxt;
                    let n = self.emit(carrier,
                                      parent_offset,
                                      offset,
                                      seq_num,
                                      flags,
                                      &[],
                                      skip,
                                      len as usize)?;
                    self.snd_nxt = seq::add(seq_num, len);
                    self.tx_queue
                        .push(TxSegment {
                            seq: seq_num,
                            payload_len: len as u16,
                            flags: flags,
                            sent_at: now,
                            retransmitted: false,
                        })
                        .unwrap_or(());
                    self.send_ack = false;
                    return Ok(n);
                }
            }
        }

        // 6. Pure acknowledgement.
        if self.send_ack && self.state.is_synchronized() {
            self.send_ack = false;
            let seq_num = self.snd_nxt;
            let n = self.emit(carrier, parent_offset, offset, seq_num, FLAG_ACK, &[], 0, 0)?;
            return Ok(n);
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
