//! TCP: connection state machine, listener and connection pool.
//!
//! `TcpSocket` is the protocol engine and implements `StackNode`; it never
//! blocks. `TcpConn` is the user-facing handle over a shared socket and
//! provides the blocking `read`/`write` calls, polling the engine with
//! cooperative backoff the way the rest of the stack expects to be driven:
//! one thread pumping `demux`, one pumping `encapsulate`, user threads
//! sleeping in between.

use errors::{TxError, TxResult};

use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use wire::ipv4;
use wire::tcp::{FLAG_ACK, FLAG_RST, MutableTcpPacket, TcpPacket};

pub mod seq;

mod socket;
mod listener;
mod pool;

pub use self::listener::TcpListener;
pub use self::pool::{TcpPool, TcpPoolConfig};
pub use self::socket::TcpSocket;

/// The connection states of RFC 9293 §3.3.2.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// True once the three way handshake has completed at least once.
    pub fn is_synchronized(&self) -> bool {
        use self::TcpState::*;
        match *self {
            Established | FinWait1 | FinWait2 | CloseWait | Closing | LastAck | TimeWait => true,
            _ => false,
        }
    }

    /// True in every state where the local side has started closing and no
    /// new bytes may enter the send stream.
    pub fn is_closing(&self) -> bool {
        use self::TcpState::*;
        match *self {
            FinWait1 | FinWait2 | Closing | LastAck | TimeWait | Closed => true,
            _ => false,
        }
    }
}

/// Buffer and queue configuration for one connection, installed once.
pub struct TcpConfig {
    pub rx_buf: Vec<u8>,
    pub tx_buf: Vec<u8>,
    /// Capacity of the in-flight segment descriptor queue. At least 2 so a
    /// retransmittable segment and a FIN can coexist.
    pub queue_size: usize,
}

impl TcpConfig {
    pub fn with_buffer_sizes(rx: usize, tx: usize, queue_size: usize) -> TcpConfig {
        TcpConfig {
            rx_buf: vec![0; rx],
            tx_buf: vec![0; tx],
            queue_size: queue_size,
        }
    }
}

/// Shared ownership of a socket between the dispatching parent and the
/// user handle.
pub type SharedTcpSocket = Arc<Mutex<TcpSocket>>;

/// Writes a bare reset segment into `carrier[offset..]` and steers the
/// parent IP destination. Shared by the listener and the port dispatcher,
/// the two places that answer segments no connection wants.
pub fn write_rst(carrier: &mut [u8],
                 parent_offset: usize,
                 offset: usize,
                 local_port: u16,
                 remote_addr: Ipv4Addr,
                 remote_port: u16,
                 seq: u32,
                 ack: u32,
                 ack_flag: bool)
                 -> TxResult<usize> {
    let total = TcpPacket::minimum_packet_size();
    if carrier.len() < offset + total {
        return Err(TxError::ShortBuffer);
    }
    {
        let mut pkg = MutableTcpPacket::new(&mut carrier[offset..offset + total]).unwrap();
        pkg.set_source(local_port);
        pkg.set_destination(remote_port);
        pkg.set_sequence(seq);
        pkg.set_acknowledgement(if ack_flag { ack } else { 0 });
        pkg.set_data_offset(5);
        pkg.set_flags(if ack_flag { FLAG_RST | FLAG_ACK } else { FLAG_RST });
        pkg.set_window(0);
        pkg.set_checksum(0);
        pkg.set_urgent_pointer(0);
    }
    ipv4::MutableIpv4Packet::new(&mut carrier[parent_offset..])
        .map(|mut ip| ip.set_destination(remote_addr))
        .unwrap_or(());
    Ok(total)
}

fn poll_start() -> Duration {
    Duration::new(0, 1_000)
}

fn poll_cap() -> Duration {
    Duration::from_millis(5)
}

/// User handle to one TCP connection. Blocking calls release the socket
/// lock between polls so the packet pump threads can keep the engine
/// moving.
pub struct TcpConn {
    socket: SharedTcpSocket,
}

impl TcpConn {
    pub fn new(socket: SharedTcpSocket) -> TcpConn {
        TcpConn { socket: socket }
    }

    /// The shared engine behind this handle, for registering with a parent
    /// dispatcher.
    pub fn socket(&self) -> SharedTcpSocket {
        self.socket.clone()
    }

    pub fn state(&self) -> TcpState {
        self.socket.lock().unwrap().state()
    }

    pub fn remote(&self) -> (Ipv4Addr, u16) {
        let socket = self.socket.lock().unwrap();
        (socket.remote_addr(), socket.remote_port())
    }

    pub fn local_port(&self) -> u16 {
        self.socket.lock().unwrap().local_port()
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.socket.lock().unwrap().set_read_deadline(deadline);
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.socket.lock().unwrap().set_write_deadline(deadline);
    }

    /// Writes all of `b` into the send stream, blocking cooperatively while
    /// the buffer is full. Honours the write deadline.
    pub fn write(&self, b: &[u8]) -> TxResult<usize> {
        let mut written = 0;
        let mut delay = poll_start();
        while written < b.len() {
            let deadline = {
                let mut socket = self.socket.lock().unwrap();
                written += socket.write(&b[written..])?;
                if written == b.len() {
                    break;
                }
                socket.write_deadline()
            };
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(TxError::DeadlineExceeded);
                }
            }
            delay = backoff!(delay, poll_cap());
        }
        Ok(written)
    }

    /// Reads at least one byte into `b`, blocking cooperatively while the
    /// receive stream is empty. Returns `TxError::Closed` once the
    /// connection is done and all received data has been drained.
    pub fn read(&self, b: &mut [u8]) -> TxResult<usize> {
        if b.is_empty() {
            return Ok(0);
        }
        let mut delay = poll_start();
        loop {
            let deadline = {
                let mut socket = self.socket.lock().unwrap();
                match socket.read(b) {
                    Ok(0) => socket.read_deadline(),
                    other => return other,
                }
            };
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(TxError::DeadlineExceeded);
                }
            }
            delay = backoff!(delay, poll_cap());
        }
    }

    /// Starts an orderly close. Never blocks; already received data remains
    /// readable.
    pub fn close(&self) {
        self.socket.lock().unwrap().close();
    }

    /// Tears the connection down immediately, queueing a RST for the peer
    /// if one can still be addressed.
    pub fn abort(&self) {
        self.socket.lock().unwrap().abort();
    }
}

impl io::Read for TcpConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match TcpConn::read(self, buf) {
            Ok(n) => Ok(n),
            // A drained, cleanly closed stream is end of file.
            Err(TxError::Closed) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl io::Write for TcpConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TcpConn::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut delay = poll_start();
        loop {
            {
                let socket = self.socket.lock().unwrap();
                if socket.send_stream_empty() {
                    return Ok(());
                }
                if socket.state() == TcpState::Closed {
                    return Err(TxError::Closed.into());
                }
            }
            delay = backoff!(delay, poll_cap());
        }
    }
}
