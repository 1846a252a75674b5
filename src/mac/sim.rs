//! In-process simulated radio medium.
//!
//! [`SimMedium`] is a hub of per-node inbound frame queues plus a per-link
//! reachability/RSSI map; [`SimMedium::attach`] hands out [`SimMac`]
//! endpoints implementing [`Mac`]. Delivery is synchronous into the
//! receivers' bounded queues — a full queue drops the frame, which is as
//! lossy as the real channel. There is no airtime or collision model.
//!
//! The tests and the `meshsim` demo binary run entire meshes over one
//! medium.

use core::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_time::{with_timeout, Duration};

use crate::mac::{Mac, MacRx};
use crate::{Addr, ADDR_BROADCAST};

/// Frames a node can buffer before the medium starts dropping.
pub const PORT_QUEUE_DEPTH: usize = 16;

/// Signal strength reported for links without an explicit override.
pub const DEFAULT_LINK_RSSI: i16 = -60;

type PortQueue = Channel<CriticalSectionRawMutex, SimFrame, PORT_QUEUE_DEPTH>;

struct SimFrame {
    src: Addr,
    rssi: i16,
    data: Vec<u8>,
}

struct MediumInner {
    ports: HashMap<Addr, Arc<PortQueue>>,
    /// Directional link override; `None` severs the link.
    links: HashMap<(Addr, Addr), Option<i16>>,
}

/// Shared radio medium; clones refer to the same mesh.
#[derive(Clone)]
pub struct SimMedium {
    inner: Arc<Mutex<CriticalSectionRawMutex, RefCell<MediumInner>>>,
}

impl SimMedium {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RefCell::new(MediumInner {
                ports: HashMap::new(),
                links: HashMap::new(),
            }))),
        }
    }

    /// Join the medium as `addr`, replacing any previous endpoint for that
    /// address.
    pub fn attach(&self, addr: Addr) -> SimMac {
        let port = Arc::new(PortQueue::new());
        self.inner.lock(|cell| {
            cell.borrow_mut().ports.insert(addr, port.clone());
        });
        SimMac {
            addr,
            port,
            medium: self.clone(),
        }
    }

    /// Override the link between `a` and `b` in both directions:
    /// `Some(rssi)` sets the reported signal strength, `None` makes the
    /// nodes unable to hear each other.
    pub fn set_link(&self, a: Addr, b: Addr, rssi: Option<i16>) {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            inner.links.insert((a, b), rssi);
            inner.links.insert((b, a), rssi);
        });
    }

    /// Receiver queues that can hear a transmission from `from` to `dest`,
    /// with the RSSI each would observe. The transmitter never hears its
    /// own frame (the radio is half-duplex).
    fn deliveries(&self, from: Addr, dest: Addr) -> Vec<(Arc<PortQueue>, i16)> {
        self.inner.lock(|cell| {
            let inner = cell.borrow();
            inner
                .ports
                .iter()
                .filter(|(addr, _)| **addr != from)
                .filter(|(addr, _)| dest == ADDR_BROADCAST || **addr == dest)
                .filter_map(|(addr, port)| {
                    let rssi = inner
                        .links
                        .get(&(from, *addr))
                        .copied()
                        .unwrap_or(Some(DEFAULT_LINK_RSSI))?;
                    Some((port.clone(), rssi))
                })
                .collect()
        })
    }
}

impl Default for SimMedium {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's endpoint on a [`SimMedium`].
pub struct SimMac {
    addr: Addr,
    port: Arc<PortQueue>,
    medium: SimMedium,
}

impl SimMac {
    pub fn addr(&self) -> Addr {
        self.addr
    }

    fn deliver(frame: SimFrame, buf: &mut [u8]) -> MacRx {
        let len = frame.data.len().min(buf.len());
        buf[..len].copy_from_slice(&frame.data[..len]);
        MacRx {
            len,
            src: frame.src,
            rssi: frame.rssi,
        }
    }
}

impl Mac for SimMac {
    async fn send(&self, dest: Addr, frame: &[u8]) -> bool {
        for (port, rssi) in self.medium.deliveries(self.addr, dest) {
            // a full receiver queue is channel loss, not a send failure
            let _ = port.try_send(SimFrame {
                src: self.addr,
                rssi,
                data: frame.to_vec(),
            });
        }
        true
    }

    async fn recv(&self, buf: &mut [u8]) -> MacRx {
        Self::deliver(self.port.receive().await, buf)
    }

    async fn timed_recv(&self, buf: &mut [u8], timeout: Duration) -> Option<MacRx> {
        with_timeout(timeout, self.port.receive())
            .await
            .ok()
            .map(|frame| Self::deliver(frame, buf))
    }
}
