//! The MAC contract consumed by the routing engines.
//!
//! The MAC layer is a black box that delivers whole frames with an exclusive
//! hold on the radio. Every received frame carries the previous-hop address
//! and the received signal strength alongside the bytes, so no mutable
//! "last frame" state survives between calls.

use embassy_time::Duration;

use crate::Addr;

pub mod sim;

/// Metadata for one received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacRx {
    /// Bytes copied into the caller's buffer.
    pub len: usize,
    /// Address of the transmitting neighbour.
    pub src: Addr,
    /// Signal strength of that transmission.
    pub rssi: i16,
}

/// A single-hop frame transport.
#[allow(async_fn_in_trait)]
pub trait Mac {
    /// Transmit `frame` to `dest` (or everyone, for [`crate::ADDR_BROADCAST`]).
    /// Returns `false` on a transient radio failure; the engines log and
    /// carry on.
    async fn send(&self, dest: Addr, frame: &[u8]) -> bool;

    /// Wait for the next frame addressed to this node and copy it into
    /// `buf`.
    async fn recv(&self, buf: &mut [u8]) -> MacRx;

    /// Like [`recv`](Self::recv) but gives up after `timeout`, returning
    /// `None`.
    async fn timed_recv(&self, buf: &mut [u8], timeout: Duration) -> Option<MacRx>;
}
