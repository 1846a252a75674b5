//! SMRP — stochastic multipath routing.
//!
//! No tree, no sequence numbers, no loop detection: every node discovers its
//! neighbours with the same beacon machinery as the tree protocol and then
//! forwards each frame to a randomly drawn active neighbour. The draw runs
//! over the `[min_addr, max_addr]` address range rather than the active set,
//! so a strict retry budget bounds it; when the budget is exhausted the
//! frame goes straight toward its destination (or the sink).

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use embassy_futures::join::join;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Instant, Timer};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::{LogGate, SmrpConfig};
use crate::error::RoutingError;
use crate::mac::Mac;
use crate::metrics::MetricsStore;
use crate::neighbours::{NeighbourTable, NodeState};
use crate::queue::{InboundPacket, OutboundPacket, PacketQueue, SMRP_QUEUE_DEPTH};
use crate::wire::{self, SMRP_HEADER_LEN};
use crate::{Addr, RecvOutcome, RouteHeader, RoutingTransport, MAX_FRAME_LEN, MAX_NODES, MAX_PAYLOAD_LEN};

/// Send-queue poll timeout, so the send worker observes shutdown.
const SEND_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-slot counters; slot 0 carries the aggregate.
#[derive(Debug, Clone, Copy, Default)]
struct SmrpCounters {
    beacons_sent: u16,
    beacons_recv: u16,
}

/// Worker-shared mutable state.
struct HopState {
    forwarded: [u32; MAX_NODES],
    rng: SmallRng,
}

struct Shared<M: Mac> {
    mac: M,
    config: SmrpConfig,
    neighbours: NeighbourTable,
    metrics: MetricsStore<SmrpCounters>,
    send_q: PacketQueue<OutboundPacket, SMRP_QUEUE_DEPTH>,
    recv_q: PacketQueue<InboundPacket, SMRP_QUEUE_DEPTH>,
    state: Mutex<CriticalSectionRawMutex, RefCell<HopState>>,
    shutdown: AtomicBool,
}

/// Multipath-routing engine handle. Clones share one engine.
pub struct Smrp<M: Mac> {
    shared: Arc<Shared<M>>,
}

impl<M: Mac> Clone for Smrp<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: Mac> Smrp<M> {
    /// Validate the configuration and build an idle engine; nothing runs
    /// until [`run`](Self::run) is awaited.
    pub fn new(config: SmrpConfig, mac: M) -> Result<Self, RoutingError> {
        let config = config.normalized()?;
        let node_timeout = Duration::from_secs(config.node_timeout_s as u64);
        let neighbours = NeighbourTable::new(config.self_addr, node_timeout);
        Ok(Self {
            shared: Arc::new(Shared {
                mac,
                neighbours,
                metrics: MetricsStore::new(),
                send_q: PacketQueue::new(),
                recv_q: PacketQueue::new(),
                state: Mutex::new(RefCell::new(HopState {
                    forwarded: [0; MAX_NODES],
                    rng: SmallRng::from_entropy(),
                })),
                shutdown: AtomicBool::new(false),
                config,
            }),
        })
    }

    /// Drive the engine: receive worker from the start, then discovery,
    /// then the send (non-sink) and beacon workers.
    pub async fn run(&self) -> Result<(), RoutingError> {
        let s = &self.shared;
        log::info!(
            "node {:02} starting, sink {:02}",
            s.config.self_addr,
            s.config.sink_addr
        );
        let workers = async {
            self.sense_neighbours().await;
            if self.is_sink() {
                self.beacon_worker().await;
            } else {
                join(self.send_worker(), self.beacon_worker()).await;
            }
            Ok(())
        };
        match select(self.receive_worker(), workers).await {
            Either::First(()) => Ok(()),
            Either::Second(result) => result,
        }
    }

    /// Ask all workers to wind down at their next suspension point.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
    }

    fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Relaxed)
    }

    fn is_sink(&self) -> bool {
        self.shared.config.self_addr == self.shared.config.sink_addr
    }

    /// This node's own address.
    pub fn self_addr(&self) -> Addr {
        self.shared.config.self_addr
    }

    /// Number of neighbours currently considered alive.
    pub fn active_neighbours(&self) -> u8 {
        self.shared.neighbours.num_active()
    }

    /// Queue `payload` for `dest`; see [`RoutingTransport::send`].
    pub async fn send(&self, dest: Addr, payload: &[u8]) -> bool {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_LEN || dest as usize >= MAX_NODES {
            return false;
        }
        self.shared
            .send_q
            .enqueue(OutboundPacket {
                dest,
                payload: payload.to_vec(),
            })
            .await;
        true
    }

    /// Blocking receive; see [`RoutingTransport::recv`].
    pub async fn recv(&self, buf: &mut [u8]) -> (RouteHeader, usize) {
        let pkt = self.shared.recv_q.dequeue().await;
        let len = pkt.payload.len().min(buf.len());
        buf[..len].copy_from_slice(&pkt.payload[..len]);
        (pkt.header, len)
    }

    /// Bounded-wait receive; see [`RoutingTransport::timed_recv`].
    pub async fn timed_recv(&self, buf: &mut [u8], timeout: Duration) -> RecvOutcome {
        if self.is_shutdown() {
            return RecvOutcome::Closed;
        }
        match self.shared.recv_q.timed_dequeue(timeout).await {
            Some(pkt) => {
                let len = pkt.payload.len().min(buf.len());
                buf[..len].copy_from_slice(&pkt.payload[..len]);
                RecvOutcome::Received {
                    header: pkt.header,
                    len,
                }
            }
            None if self.is_shutdown() => RecvOutcome::Closed,
            None => RecvOutcome::TimedOut,
        }
    }

    /// Draw a random next hop: up to `max_tries` uniform samples over the
    /// known address range, accepting the first active neighbour that is
    /// neither the originator nor the previous hop. On exhaustion the frame
    /// heads for `dest` (or the sink when `dest` is unknown).
    pub fn next_hop(
        &self,
        src: Addr,
        prev: Option<Addr>,
        dest: Option<Addr>,
        max_tries: u8,
    ) -> Addr {
        let s = &self.shared;
        let snap = s.neighbours.snapshot();
        let fallback = dest.filter(|d| *d != 0).unwrap_or(s.config.sink_addr);
        if snap.num_active == 0 || snap.min_addr > snap.max_addr {
            return fallback;
        }
        s.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            for _ in 0..max_tries {
                let addr = state.rng.gen_range(snap.min_addr..=snap.max_addr);
                let node = snap.nodes[addr as usize];
                if node.state == NodeState::Active && addr != src && prev != Some(addr) {
                    return addr;
                }
            }
            fallback
        })
    }

    /// Beacon until at least one neighbour is active.
    async fn sense_neighbours(&self) {
        let s = &self.shared;
        let window = Duration::from_secs(s.config.sense_duration_s as u64);
        let mut rng = SmallRng::from_entropy();
        loop {
            let start = Instant::now();
            let mut count = 0u16;
            log::debug!("sending discovery beacons");
            while Instant::now().duration_since(start) < window {
                self.send_beacon().await;
                count += 1;
                Timer::after(Duration::from_millis(rng.gen_range(500..=1200))).await;
            }
            log::debug!("sent {count} discovery beacons");
            if s.neighbours.num_active() > 0 {
                break;
            }
            log::info!("no neighbours detected, sensing again");
        }
        log::info!("active neighbours: {}", s.neighbours.num_active());
    }

    /// Poll the MAC and dispatch frames.
    async fn receive_worker(&self) {
        let s = &self.shared;
        let poll = Duration::from_millis(s.config.recv_timeout_ms as u64);
        let mut buf = [0u8; MAX_FRAME_LEN];
        let mut rng = SmallRng::from_entropy();
        while !self.is_shutdown() {
            let Some(rx) = s.mac.timed_recv(&mut buf, poll).await else {
                continue;
            };
            self.handle_frame(&buf[..rx.len], rx.src, rx.rssi).await;
            Timer::after(Duration::from_millis(rng.gen_range(700..=800))).await;
        }
    }

    async fn handle_frame(&self, frame: &[u8], prev_hop: Addr, rssi: i16) {
        let s = &self.shared;
        let Some(&ctrl) = frame.first() else {
            return;
        };
        if wire::is_data_frame(ctrl) {
            let decoded = match wire::parse_data_smrp(frame) {
                Ok(decoded) => decoded,
                Err(err) => {
                    log::debug!("dropping malformed data frame from {prev_hop:02}: {err}");
                    return;
                }
            };
            s.neighbours.observe_candidate(prev_hop, rssi);
            if s.config.log_gate >= LogGate::Trace {
                log::trace!("RX {}", wire::hex_dump(frame, SMRP_HEADER_LEN));
            }
            if decoded.dest == s.config.self_addr {
                if decoded.payload.is_empty() {
                    return;
                }
                let pkt = InboundPacket {
                    header: RouteHeader {
                        src: decoded.src,
                        dst: decoded.dest,
                        prev: prev_hop,
                        rssi,
                    },
                    payload: decoded.payload.to_vec(),
                };
                if s.recv_q.try_enqueue(pkt).is_err() {
                    log::debug!("receive queue full, dropping packet from {:02}", decoded.src);
                }
            } else {
                self.forward(frame, decoded.src, decoded.dest, prev_hop).await;
            }
        } else if ctrl == wire::CTRL_BEACON {
            log::debug!("beacon src: {prev_hop:02} ({rssi})");
            if (prev_hop as usize) < MAX_NODES {
                s.metrics.with(|data| data[prev_hop as usize].beacons_recv += 1);
            }
            s.neighbours.observe_candidate(prev_hop, rssi);
        } else {
            log::debug!("unknown control flag {ctrl:#04x}");
        }
    }

    /// Relay a frame for someone else through a freshly drawn next hop,
    /// transmitting the original bytes.
    async fn forward(&self, frame: &[u8], src: Addr, dest: Addr, prev_hop: Addr) {
        let s = &self.shared;
        let hop = self.next_hop(src, Some(prev_hop), Some(dest), s.config.max_tries);
        if s.mac.send(hop, frame).await {
            let total = s.state.lock(|cell| {
                let mut state = cell.borrow_mut();
                let slot = &mut state.forwarded[(src as usize).min(MAX_NODES - 1)];
                *slot += 1;
                *slot
            });
            log::info!("FWD: {src:02} -> {hop:02} total: {total:02}");
        } else {
            log::error!("forward failed: {src:02} -> {hop:02}");
        }
    }

    /// Drain the send queue one packet at a time through random next hops.
    async fn send_worker(&self) {
        let s = &self.shared;
        let mut rng = SmallRng::from_entropy();
        while !self.is_shutdown() {
            let Some(pkt) = s.send_q.timed_dequeue(SEND_POLL_TIMEOUT).await else {
                continue;
            };
            let frame = wire::encode_data_smrp(pkt.dest, s.config.self_addr, &pkt.payload);
            let hop = self.next_hop(s.config.self_addr, None, Some(pkt.dest), s.config.max_tries);
            if s.mac.send(hop, &frame).await {
                if s.config.log_gate >= LogGate::Trace {
                    log::trace!("TX {}", wire::hex_dump(&frame, SMRP_HEADER_LEN));
                }
            } else {
                log::error!("MAC send to {hop:02} failed");
            }
            Timer::after(Duration::from_millis(rng.gen_range(500..=1200))).await;
        }
    }

    /// Periodic beacon plus timeout-driven neighbour cleanup.
    async fn beacon_worker(&self) {
        let s = &self.shared;
        let interval = Duration::from_secs(s.config.beacon_interval_s as u64);
        let mut rng = SmallRng::from_entropy();
        Timer::after(interval).await;
        while !self.is_shutdown() {
            Timer::after(Duration::from_millis(rng.gen_range(500..=1200))).await;
            self.send_beacon().await;
            log::info!("sent beacon");
            let now = Instant::now();
            if s.neighbours.cleanup_due(now) {
                s.neighbours.cleanup(now, None);
                log::debug!("active neighbour count: {}", s.neighbours.num_active());
            }
            Timer::after(interval).await;
        }
    }

    async fn send_beacon(&self) {
        let s = &self.shared;
        let frame = wire::encode_smrp_beacon();
        if s.mac.send(crate::ADDR_BROADCAST, &frame).await {
            s.metrics.with(|data| data[0].beacons_sent += 1);
        } else {
            log::error!("beacon transmission failed");
        }
    }
}

impl<M: Mac> RoutingTransport for Smrp<M> {
    async fn send(&self, dest: Addr, payload: &[u8]) -> bool {
        Smrp::send(self, dest, payload).await
    }

    async fn recv(&self, buf: &mut [u8]) -> (RouteHeader, usize) {
        Smrp::recv(self, buf).await
    }

    async fn timed_recv(&self, buf: &mut [u8], timeout: Duration) -> RecvOutcome {
        Smrp::timed_recv(self, buf, timeout).await
    }

    fn header_size(&self) -> usize {
        SMRP_HEADER_LEN
    }

    fn metrics_header(&self) -> &'static str {
        "AggBeaconsSent,TotalBeaconsRecv"
    }

    fn metrics_row(&self, addr: Addr) -> String {
        let idx = (addr as usize).min(MAX_NODES - 1);
        self.shared.metrics.with(|data| {
            let row = format!("{},{}", data[0].beacons_sent, data[idx].beacons_recv);
            data[idx] = SmrpCounters::default();
            data[0].beacons_sent = 0;
            row
        })
    }

    fn topology_header(&self) -> &'static str {
        "Timestamp,Source,Address,State,LinkType,RSSI"
    }

    fn topology_rows(&self, buf: &mut [u8]) -> usize {
        let s = &self.shared;
        let snap = s.neighbours.snapshot();
        let src = s.config.self_addr;
        let mut timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let mut offset = 0;
        for node in snap.known() {
            let row = format!(
                "{},{},{},{},{},{}\n",
                timestamp,
                src,
                node.addr,
                node.state.csv_code(),
                node.link.csv_code(),
                node.rssi
            );
            if offset + row.len() > buf.len() {
                log::debug!("topology buffer overflow");
                break;
            }
            buf[offset..offset + row.len()].copy_from_slice(row.as_bytes());
            offset += row.len();
            timestamp = 0;
        }
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::sim::{SimMedium, DEFAULT_LINK_RSSI};
    use futures::executor::block_on;

    fn node(medium: &SimMedium, addr: Addr) -> Smrp<crate::mac::sim::SimMac> {
        Smrp::new(
            SmrpConfig {
                self_addr: addr,
                ..Default::default()
            },
            medium.attach(addr),
        )
        .unwrap()
    }

    #[test]
    fn retry_budget_exhaustion_falls_back_to_dest() {
        let medium = SimMedium::new();
        let n = node(&medium, 0x09);
        // 0x05 active, 0x08 known but inactive
        n.shared.neighbours.observe_candidate(0x05, -60).unwrap();
        n.shared.neighbours.observe_candidate(0x08, -70).unwrap();
        n.shared
            .neighbours
            .cleanup(Instant::now() + Duration::from_secs(120), None);
        n.shared.neighbours.observe_candidate(0x05, -60).unwrap();

        // every draw lands in [0x05, 0x08]: 0x05 is the previous hop, the
        // rest are unknown or inactive, so the budget always runs out
        for _ in 0..32 {
            let hop = n.next_hop(0x09, Some(0x05), Some(0x0D), 2);
            assert_eq!(hop, 0x0D);
        }
    }

    #[test]
    fn unknown_dest_falls_back_to_sink() {
        let medium = SimMedium::new();
        let n = node(&medium, 0x09);
        assert_eq!(n.next_hop(0x09, None, None, 2), 0x0D);
        assert_eq!(n.next_hop(0x09, None, Some(0), 2), 0x0D);
        assert_eq!(n.next_hop(0x09, None, Some(0x07), 2), 0x07);
    }

    #[test]
    fn single_candidate_is_always_drawn() {
        let medium = SimMedium::new();
        let n = node(&medium, 0x05);
        n.shared.neighbours.observe_candidate(0x0D, -60).unwrap();
        for _ in 0..16 {
            assert_eq!(n.next_hop(0x05, None, Some(0x0D), 2), 0x0D);
        }
    }

    #[test]
    fn forwarding_relays_the_original_bytes() {
        block_on(async {
            let medium = SimMedium::new();
            let n = node(&medium, 0x07);
            let sink_mac = medium.attach(0x0D);
            n.shared.neighbours.observe_candidate(0x0D, -60).unwrap();

            let frame = wire::encode_data_smrp(0x0D, 0x05, b"abcd");
            n.handle_frame(&frame, 0x05, -60).await;

            let mut buf = [0u8; MAX_FRAME_LEN];
            let rx = sink_mac
                .timed_recv(&mut buf, Duration::from_millis(100))
                .await
                .expect("forwarded frame");
            assert_eq!(&buf[..rx.len], &frame[..]);
            assert_eq!(rx.src, 0x07);
            assert_eq!(rx.rssi, DEFAULT_LINK_RSSI);
        });
    }

    #[test]
    fn frames_for_self_reach_the_application() {
        block_on(async {
            let medium = SimMedium::new();
            let n = node(&medium, 0x0D);
            let frame = wire::encode_data_smrp(0x0D, 0x05, b"hello");
            n.handle_frame(&frame, 0x07, -55).await;

            let mut buf = [0u8; 64];
            let outcome = n.timed_recv(&mut buf, Duration::from_millis(100)).await;
            let RecvOutcome::Received { header, len } = outcome else {
                panic!("expected a packet, got {outcome:?}");
            };
            assert_eq!(len, 5);
            assert_eq!(&buf[..len], b"hello");
            assert_eq!(header.src, 0x05);
            assert_eq!(header.prev, 0x07);
            assert_eq!(header.rssi, -55);
        });
    }

    #[test]
    fn metrics_row_resets_on_read() {
        block_on(async {
            let medium = SimMedium::new();
            let n = node(&medium, 0x0D);
            n.handle_frame(&wire::encode_smrp_beacon(), 0x05, -60).await;
            n.handle_frame(&wire::encode_smrp_beacon(), 0x05, -60).await;
            n.send_beacon().await;

            assert_eq!(n.metrics_row(0x05), "1,2");
            assert_eq!(n.metrics_row(0x05), "0,0");
        });
    }
}
