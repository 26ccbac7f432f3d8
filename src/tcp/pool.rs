//! Pool of preconfigured TCP sockets handed out to a listener as
//! connections arrive.

use rand::{self, Rng};

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tcp::{SharedTcpSocket, TcpConfig, TcpSocket, TcpState};

pub struct TcpPoolConfig {
    pub pool_size: usize,
    /// Segment descriptor queue capacity per connection.
    pub queue_size: usize,
    pub rx_buf_size: usize,
    pub tx_buf_size: usize,
    /// How long an acquired connection may take to reach Established
    /// before it is torn down.
    pub established_timeout: Duration,
    /// How long a connection may linger in the closing states before it is
    /// aborted.
    pub closing_timeout: Duration,
}

impl TcpPoolConfig {
    pub fn new(pool_size: usize) -> TcpPoolConfig {
        TcpPoolConfig {
            pool_size: pool_size,
            queue_size: 8,
            rx_buf_size: 4096,
            tx_buf_size: 4096,
            established_timeout: Duration::new(10, 0),
            closing_timeout: Duration::new(10, 0),
        }
    }
}

struct PoolSlot {
    socket: SharedTcpSocket,
    acquired: bool,
    acquired_at: Instant,
    closing_since: Option<Instant>,
}

/// Fixed set of sockets with their buffers allocated up front. `get` and
/// `put` run in constant time over a slot table behind the pool's own
/// mutex.
pub struct TcpPool {
    slots: Mutex<Vec<PoolSlot>>,
    established_timeout: Duration,
    closing_timeout: Duration,
}

impl TcpPool {
    pub fn new(config: TcpPoolConfig) -> TcpPool {
        assert!(config.pool_size > 0);
        assert!(config.established_timeout > Duration::new(0, 0));
        assert!(config.closing_timeout > Duration::new(0, 0));
        let mut slots = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            let socket = TcpSocket::new(TcpConfig::with_buffer_sizes(config.rx_buf_size,
                                                                     config.tx_buf_size,
                                                                     config.queue_size));
            slots.push(PoolSlot {
                socket: Arc::new(Mutex::new(socket)),
                acquired: false,
                acquired_at: Instant::now(),
                closing_since: None,
            });
        }
        TcpPool {
            slots: Mutex::new(slots),
            established_timeout: config.established_timeout,
            closing_timeout: config.closing_timeout,
        }
    }

    /// Acquires a free socket together with a fresh initial send sequence
    /// number. Returns `None` when every slot is taken.
    pub fn get(&self) -> Option<(SharedTcpSocket, u32)> {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if !slot.acquired {
                slot.acquired = true;
                slot.acquired_at = Instant::now();
                slot.closing_since = None;
                let iss = rand::thread_rng().gen::<u32>();
                return Some((slot.socket.clone(), iss));
            }
        }
        None
    }

    /// Returns a socket to the pool, re-initialising it for its next life.
    pub fn put(&self, socket: &SharedTcpSocket) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if Arc::ptr_eq(&slot.socket, socket) {
                slot.socket.lock().unwrap().reinit();
                slot.acquired = false;
                slot.closing_since = None;
                return;
            }
        }
        warn!("put of a socket that does not belong to this pool");
    }

    pub fn size(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.lock().unwrap().iter().filter(|slot| !slot.acquired).count()
    }

    /// Tears down acquired connections that are stuck: never reached
    /// Established within the configured window, or hanging in the closing
    /// states too long.
    pub fn check_timeouts(&self) {
        let now = Instant::now();
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if !slot.acquired {
                continue;
            }
            let mut socket = slot.socket.lock().unwrap();
            let state = socket.state();
            match state {
                TcpState::Listen | TcpState::SynSent | TcpState::SynRcvd => {
                    if now.duration_since(slot.acquired_at) > self.established_timeout {
                        debug!("pool: aborting connection stuck in {:?}", state);
                        socket.abort();
                    }
                }
                TcpState::FinWait1 | TcpState::FinWait2 | TcpState::Closing |
                TcpState::LastAck | TcpState::TimeWait => {
                    match slot.closing_since {
                        None => slot.closing_since = Some(now),
                        Some(since) => {
                            if now.duration_since(since) > self.closing_timeout {
                                debug!("pool: aborting connection stuck closing in {:?}", state);
                                socket.abort();
                            }
                        }
                    }
                }
                _ => slot.closing_since = None,
            }
        }
    }
}
