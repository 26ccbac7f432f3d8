// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Ripstack - a user-space layered TCP/IP stack
//!
//! `ripstack` parses, validates, composes and dispatches internetwork
//! packets from the link layer up through TCP, in a buffer-oriented style
//! with no allocation on the hot path. It takes raw Ethernet frames from
//! whatever lower transport you have (a TAP device, a driver DMA buffer, a
//! test vector) and delivers application payloads to registered endpoints;
//! outbound, it pulls endpoint data and wraps it in correctly checksummed
//! headers. The raw frame access itself is out of scope: you bring the
//! wires, this crate brings the protocols.
//!
//! ## Features
//!
//! What works today:
//!
//! - [x] Ethernet II frames, VLAN tags on receive, optional FCS on send
//! - [x] Arp
//!   - [x] Query tracking with external write-to cells
//!   - [x] Answering requests for the local address
//!   - [x] In-place compaction of discarded queries
//! - [x] IPv4
//!   - [x] Header and transport checksum validation on receive
//!   - [x] Header composition with checksum fill on send
//!   - [ ] Fragment reassembly (over-MTU datagrams are dropped)
//!   - [ ] Header options beyond validation
//! - [x] IPv6 header parsing (receive path only)
//! - [x] Udp framing under a generic per-port dispatcher
//! - [x] Tcp
//!   - [x] Full RFC 9293 state machine
//!   - [x] Retransmission with Jacobson/Karels RTO
//!   - [x] Listener with pooled connections and RST-on-reject
//!   - [ ] Fast retransmit on duplicate ACKs (timer based recovery only)
//!   - [ ] SACK beyond option parsing
//! - [x] DHCPv4 client (DORA) and a lease-tracking server
//! - [x] DNS and NTP client framing
//!
//! ## Architecture and terminology
//!
//! The stack is a strict tree of *nodes*. Every layer implements the
//! [`StackNode`](node/trait.StackNode.html) capability set and the tree is
//! wired through registration tables, so no layer knows the concrete type
//! of another.
//!
//! Two control paths exist. **Demux** is the inbound path: a node parses
//! its frame at the offset it is given, peels its header, and hands the
//! payload offset to the child registered for the dispatch key (EtherType,
//! IP protocol, destination port). **Encapsulate** is the outbound path: a
//! node asks its children round-robin for pending data, and the first
//! child that writes a frame gets it wrapped in this node's header. The
//! same carrier buffer threads through every layer by reference; payloads
//! are never copied between layers.
//!
//! Parents never hold strong references to child state. A registration
//! caches the child's *connection id*, a generation counter the child
//! bumps whenever it is re-initialised; a mismatch tells the parent the
//! node it knew is gone and the slot is dropped. This keeps the tree free
//! of cycles and lets connections die unilaterally.
//!
//! The whole stack is single-threaded cooperative: one loop feeds received
//! frames into [`EthernetStack::recv`](ethernet/struct.EthernetStack.html),
//! one polls [`EthernetStack::poll`](ethernet/struct.EthernetStack.html)
//! for outbound frames, and user-facing socket calls sleep-poll with
//! exponential backoff in between. No node yields internally.
//!
//! ## Usage
//!
//! ```rust,ignore
//! extern crate ripstack;
//!
//! let mut ethernet = ripstack::ethernet::EthernetStack::new(config);
//! ethernet.register(ip_stack_handle)?;
//! // feed frames: ethernet.recv(&mut carrier)?;
//! // drain frames: let n = ethernet.poll(&mut carrier)?;
//! ```
//!
//! ### Tests
//!
//! Unit tests live in `#[cfg(test)]` modules next to the code they cover.
//! The integration tests under `tests/` wire two complete stacks together
//! through an in-memory carrier and run the protocol conversations end to
//! end: ARP resolution, a DORA exchange, TCP handshake, data transfer,
//! retransmission after loss, and the close sequences.

#[macro_use]
extern crate log;
extern crate ipnetwork;
extern crate rand;

#[macro_use]
mod macros;

pub mod errors;
pub mod wire;
pub mod util;
pub mod node;

pub mod ethernet;

/// Module containing everything related to the address resolution
/// protocol (Arp)
pub mod arp;

/// Module containing IPv4 functionality
pub mod ipv4;

/// Module containing the generic per-port transport dispatcher.
pub mod port;

/// Module containing Tcp functionality.
pub mod tcp;

/// Module containing the Dhcp client and server.
pub mod dhcp;

/// Module containing the Dns resolver client.
pub mod dns;

/// Module containing the Ntp client.
pub mod ntp;

pub use errors::{RxError, RxResult, TxError, TxResult, Validator};
pub use node::{NodeHandle, StackNode};
pub use wire::MacAddr;

/// A sensible default carrier size: a full Ethernet frame plus the
/// optional frame check sequence.
pub static DEFAULT_CARRIER_SIZE: usize = 1518;
