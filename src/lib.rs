//! # Multi-hop routing for ALOHA-style sensor meshes
//!
//! This crate implements two cooperative routing protocols for small wireless
//! sensor networks in which every node carries a one-byte address and all
//! frames travel over a shared single-hop MAC radio:
//!
//! - **STRP** (`strp::Strp`) — tree routing. Every non-sink node keeps a
//!   single *parent* neighbour selected by a configurable strategy and
//!   forwards all traffic to it until it reaches the sink. The tree is
//!   repaired on neighbour timeouts and on detected forwarding loops, and
//!   data frames carry sequence numbers for duplicate suppression.
//! - **SMRP** (`smrp::Smrp`) — stochastic multipath routing. Every node keeps
//!   the same neighbour table but forwards each frame to a randomly chosen
//!   active neighbour, bounded by a retry budget with a sink fallback.
//!
//! Both protocols share beacon-driven neighbour discovery, bounded packet
//! queues between the application and the radio workers, a compact wire
//! codec, and CSV metric/topology reporters consumed by an external
//! monitoring layer.
//!
//! ## Architecture
//!
//! An engine value owns all protocol state behind a cheaply clonable handle.
//! [`Strp::run`](strp::Strp::run) / [`Smrp::run`](smrp::Smrp::run) return a
//! single future that the caller spawns on an executor; internally it drives
//! the receive worker, neighbour discovery, the send worker (non-sink nodes
//! only) and the periodic beacon worker. The MAC radio is consumed through
//! the [`mac::Mac`] trait; [`mac::sim`] provides a channel-backed in-process
//! medium used by the tests and the `meshsim` demo binary.

pub mod config;
pub mod error;
pub mod mac;
pub mod metrics;
pub mod neighbours;
pub mod queue;
pub mod smrp;
pub mod strp;
pub mod wire;

use embassy_time::Duration;

pub use config::{ParentStrategy, SmrpConfig, StrpConfig};
pub use error::RoutingError;

/// Node address. `0xFF` broadcasts, `0x00` doubles as the "unassigned"
/// sentinel in advertised-parent fields.
pub type Addr = u8;

/// Broadcast address understood by the MAC layer.
pub const ADDR_BROADCAST: Addr = 0xFF;

/// Default sink address; overridable per node via configuration.
pub const DEFAULT_SINK_ADDR: Addr = 0x0D;

/// Capacity of the address-indexed neighbour table. Valid unicast addresses
/// are `0..MAX_NODES`; anything larger (except broadcast) is ignored.
pub const MAX_NODES: usize = 32;

/// Largest frame the MAC layer will carry.
pub const MAX_FRAME_LEN: usize = 240;

/// Largest application payload accepted by [`RoutingTransport::send`].
pub const MAX_PAYLOAD_LEN: usize = 120;

/// Floor value for signal strength, used before any frame has been heard.
pub const MIN_RSSI: i16 = -128;

/// Receive-side metadata handed to the application along with each packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteHeader {
    /// Originating node.
    pub src: Addr,
    /// Destination carried in the frame (normally self).
    pub dst: Addr,
    /// Neighbour the frame was heard from.
    pub prev: Addr,
    /// Signal strength of the last hop.
    pub rssi: i16,
}

/// Result of a bounded-wait receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// A packet was copied into the caller's buffer.
    Received { header: RouteHeader, len: usize },
    /// The timeout elapsed without a packet arriving.
    TimedOut,
    /// The engine has been shut down; no more packets will arrive.
    Closed,
}

/// The operations a routing protocol exposes to applications and to the
/// monitoring layer. Implemented by [`strp::Strp`] and [`smrp::Smrp`]; the
/// caller constructs one engine at startup and shares the handle with
/// whoever needs it.
#[allow(async_fn_in_trait)]
pub trait RoutingTransport {
    /// Queue `payload` for delivery to `dest`. Blocks while the send queue
    /// is full and returns `false` only for payloads the protocol can never
    /// carry (empty, oversized, or an unroutable destination). Delivery is
    /// not guaranteed.
    async fn send(&self, dest: Addr, payload: &[u8]) -> bool;

    /// Wait for the next packet addressed to this node and copy its payload
    /// into `buf`. Returns the receive metadata and the payload length.
    async fn recv(&self, buf: &mut [u8]) -> (RouteHeader, usize);

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    async fn timed_recv(&self, buf: &mut [u8], timeout: Duration) -> RecvOutcome;

    /// Size of this protocol's data-frame header on the wire.
    fn header_size(&self) -> usize;

    /// CSV column names matching [`metrics_row`](Self::metrics_row).
    fn metrics_header(&self) -> &'static str;

    /// One CSV row of counters attributed to `addr`. Counters tied to the
    /// row (and the shared aggregate slots) are reset atomically with the
    /// read.
    fn metrics_row(&self, addr: Addr) -> String;

    /// CSV column names matching [`topology_rows`](Self::topology_rows).
    fn topology_header(&self) -> &'static str;

    /// Write one CSV row per known neighbour into `buf`, returning the
    /// number of bytes written. Rows that would overflow `buf` are dropped.
    fn topology_rows(&self, buf: &mut [u8]) -> usize;
}
