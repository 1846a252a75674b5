//! Bounded FIFO packet queues between the application and the radio workers.
//!
//! A thin wrapper over [`embassy_sync::channel::Channel`], which already
//! provides the classic bounded-buffer guarantees: strict FIFO across all
//! producers and consumers, a blocking enqueue that waits for a free slot,
//! and a dequeue that releases the slot it drained.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, TryReceiveError, TrySendError};
use embassy_time::{with_timeout, Duration};

use crate::{Addr, RouteHeader};

/// Depth of the STRP send/receive queues.
pub const STRP_QUEUE_DEPTH: usize = 32;
/// Depth of the SMRP send/receive queues.
pub const SMRP_QUEUE_DEPTH: usize = 16;

/// An application payload waiting for the send worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub dest: Addr,
    pub payload: Vec<u8>,
}

/// A decoded packet addressed to this node, waiting for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub header: RouteHeader,
    pub payload: Vec<u8>,
}

/// Fixed-capacity FIFO with blocking, try and timed dequeue.
pub struct PacketQueue<T, const N: usize> {
    ch: Channel<CriticalSectionRawMutex, T, N>,
}

impl<T, const N: usize> PacketQueue<T, N> {
    pub fn new() -> Self {
        Self { ch: Channel::new() }
    }

    /// Enqueue, waiting for a free slot when the queue is full.
    pub async fn enqueue(&self, item: T) {
        self.ch.send(item).await;
    }

    /// Enqueue without blocking; hands the item back when the queue is full.
    pub fn try_enqueue(&self, item: T) -> Result<(), T> {
        self.ch.try_send(item).map_err(|TrySendError::Full(item)| item)
    }

    /// Dequeue, waiting for an item when the queue is empty.
    pub async fn dequeue(&self) -> T {
        self.ch.receive().await
    }

    /// Dequeue without blocking.
    pub fn try_dequeue(&self) -> Option<T> {
        match self.ch.try_receive() {
            Ok(item) => Some(item),
            Err(TryReceiveError::Empty) => None,
        }
    }

    /// Dequeue, giving up after `timeout`. `None` means the deadline passed.
    pub async fn timed_dequeue(&self, timeout: Duration) -> Option<T> {
        with_timeout(timeout, self.ch.receive()).await.ok()
    }

    pub fn len(&self) -> usize {
        self.ch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Slots currently available to producers.
    pub fn free(&self) -> usize {
        N - self.len()
    }
}

impl<T, const N: usize> Default for PacketQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
