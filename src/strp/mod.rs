//! STRP — tree routing over a shared neighbour table.
//!
//! Every non-sink node keeps exactly one parent neighbour and forwards all
//! application traffic to it; the sink terminates traffic. The engine drives
//! three workers inside one [`Strp::run`] future:
//!
//! 1. the receive worker: polls the MAC, keeps frames addressed to self
//!    (after duplicate suppression), forwards everything else to the parent
//!    as the original bytes, and watches for forwarding loops,
//! 2. the send worker (non-sink only): drains the send queue, stamps the
//!    per-destination sequence number and transmits to the parent,
//! 3. the beacon worker: periodic jittered beacons plus neighbour cleanup,
//!    repairing the tree when the parent times out.
//!
//! Before the send and beacon workers start, discovery beacons are emitted
//! until a parent is acquired (or the configured fixed parent is heard).

mod parent;

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

use crate::config::{LogGate, ParentStrategy, StrpConfig};
use crate::error::RoutingError;
use crate::mac::Mac;
use crate::metrics::MetricsStore;
use crate::neighbours::{NeighbourTable, NodeState};
use crate::queue::{InboundPacket, OutboundPacket, PacketQueue, STRP_QUEUE_DEPTH};
use crate::wire::{self, STRP_HEADER_LEN};
use crate::{Addr, RecvOutcome, RouteHeader, RoutingTransport, MAX_FRAME_LEN, MAX_NODES, MAX_PAYLOAD_LEN, MIN_RSSI};

/// MAC receive-poll timeout; bounds how long the receive worker can sit in
/// the radio between shutdown checks.
const RECV_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Send-queue poll timeout, so the send worker observes shutdown.
const SEND_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-slot counters; slot 0 carries the aggregates.
#[derive(Debug, Clone, Copy, Default)]
struct StrpCounters {
    parent_changes: u16,
    beacons_sent: u16,
    beacons_recv: u16,
}

/// Mutable routing state owned by the engine workers.
struct RouteState {
    parent: Option<Addr>,
    /// Previous hop most recently implicated in a forwarding loop; caches
    /// the last reaction so one cycle triggers one parent change.
    loopy_parent: Option<Addr>,
    send_seq: [u16; MAX_NODES],
    recv_seq: [u16; MAX_NODES],
    forwarded: [u32; MAX_NODES],
    rng: SmallRng,
}

struct Shared<M: Mac> {
    mac: M,
    config: StrpConfig,
    neighbours: NeighbourTable,
    metrics: MetricsStore<StrpCounters>,
    send_q: PacketQueue<OutboundPacket, STRP_QUEUE_DEPTH>,
    recv_q: PacketQueue<InboundPacket, STRP_QUEUE_DEPTH>,
    route: Mutex<CriticalSectionRawMutex, RefCell<RouteState>>,
    shutdown: AtomicBool,
}

/// Tree-routing engine handle. Clones share one engine.
pub struct Strp<M: Mac> {
    shared: Arc<Shared<M>>,
}

impl<M: Mac> Clone for Strp<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<M: Mac> Strp<M> {
    /// Validate the configuration and build an idle engine; nothing runs
    /// until [`run`](Self::run) is awaited.
    pub fn new(config: StrpConfig, mac: M) -> Result<Self, RoutingError> {
        let config = config.normalized()?;
        let parent = match config.strategy {
            ParentStrategy::Fixed if config.self_addr != config.sink_addr => config.fixed_parent,
            _ => None,
        };
        let node_timeout = Duration::from_secs(config.node_timeout_s as u64);
        let neighbours = NeighbourTable::new(config.self_addr, node_timeout);
        Ok(Self {
            shared: Arc::new(Shared {
                mac,
                neighbours,
                metrics: MetricsStore::new(),
                send_q: PacketQueue::new(),
                recv_q: PacketQueue::new(),
                route: Mutex::new(RefCell::new(RouteState {
                    parent,
                    loopy_parent: None,
                    send_seq: [0; MAX_NODES],
                    recv_seq: [0; MAX_NODES],
                    forwarded: [0; MAX_NODES],
                    rng: SmallRng::from_entropy(),
                })),
                shutdown: AtomicBool::new(false),
                config,
            }),
        })
    }

    /// Drive the engine: receive worker from the start, then discovery,
    /// then the send (non-sink) and beacon workers. Resolves only on a
    /// fatal startup error or after [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), RoutingError> {
        let s = &self.shared;
        log::info!(
            "node {:02} starting, strategy {:?}, sink {:02}",
            s.config.self_addr,
            s.config.strategy,
            s.config.sink_addr
        );
        let workers = async {
            self.sense_neighbours().await?;
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

    /// Current parent; `None` while discovering.
    pub fn parent(&self) -> Option<Addr> {
        self.shared.route.lock(|cell| cell.borrow().parent)
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

    /// Beacon until a parent exists (sink: one window). The loop repeats
    /// indefinitely for the adaptive strategies; a `Fixed` parent must be
    /// heard within the first window.
    async fn sense_neighbours(&self) -> Result<(), RoutingError> {
        let s = &self.shared;
        let window = Duration::from_secs(s.config.sense_duration_s as u64);
        let mut rng = SmallRng::from_entropy();
        loop {
            let start = Instant::now();
            let mut count = 0u16;
            log::debug!("sending discovery beacons");
            while Instant::now().duration_since(start) < window {
                Timer::after(Duration::from_millis(rng.gen_range(500..=1200))).await;
                self.send_beacon().await;
                count += 1;
            }
            log::debug!("sent {count} discovery beacons");

            if self.is_sink() {
                break;
            }
            if s.config.strategy == ParentStrategy::Fixed {
                let fixed = s
                    .config
                    .fixed_parent
                    .ok_or(RoutingError::FixedParentWithoutAddress)?;
                let heard = s
                    .neighbours
                    .get(fixed)
                    .is_some_and(|n| n.state == NodeState::Active);
                if !heard {
                    log::error!("fixed parent {fixed:02} not a neighbour");
                    return Err(RoutingError::FixedParentNotNeighbour(fixed));
                }
                break;
            }
            if let Some(parent) = self.parent() {
                let rssi = s.neighbours.get(parent).map_or(MIN_RSSI, |n| n.rssi);
                log::info!("parent: {parent:02} ({rssi})");
                break;
            }
            log::info!("no suitable parent detected, sensing again");
        }

        let snap = s.neighbours.snapshot();
        log::debug!("active neighbours: {}", snap.num_active);
        for n in snap.known() {
            log::debug!("  {:02} ({})", n.addr, n.rssi);
        }
        Ok(())
    }

    /// Poll the MAC and dispatch frames; paces itself after each processed
    /// frame to keep off the channel.
    async fn receive_worker(&self) {
        let s = &self.shared;
        let mut buf = [0u8; MAX_FRAME_LEN];
        let mut rng = SmallRng::from_entropy();
        while !self.is_shutdown() {
            let Some(rx) = s.mac.timed_recv(&mut buf, RECV_POLL_TIMEOUT).await else {
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
            let decoded = match wire::parse_data_strp(frame) {
                Ok(decoded) => decoded,
                Err(err) => {
                    log::debug!("dropping malformed data frame from {prev_hop:02}: {err}");
                    return;
                }
            };
            self.observe_and_react(prev_hop, rssi, None).await;
            if s.config.log_gate >= LogGate::Trace {
                log::trace!("RX {}", wire::hex_dump(frame, STRP_HEADER_LEN));
            }
            if decoded.dest == s.config.self_addr {
                self.keep(decoded.src, decoded.dest, decoded.seq, decoded.payload, prev_hop, rssi);
            } else {
                self.forward(frame, decoded.src, prev_hop).await;
            }
        } else if ctrl == wire::CTRL_BEACON {
            match wire::parse_strp_beacon(frame) {
                Ok(beacon) => {
                    log::debug!(
                        "beacon src: {prev_hop:02} ({rssi}) parent: {:02} ({})",
                        beacon.parent,
                        beacon.parent_rssi
                    );
                    if (prev_hop as usize) < MAX_NODES {
                        s.metrics.with(|data| data[prev_hop as usize].beacons_recv += 1);
                    }
                    self.observe_and_react(prev_hop, rssi, Some((beacon.parent, beacon.parent_rssi)))
                        .await;
                }
                Err(err) => log::debug!("dropping malformed beacon from {prev_hop:02}: {err}"),
            }
        } else {
            log::debug!("unknown control flag {ctrl:#04x}");
        }
    }

    /// Deliver a frame addressed to self: suppress duplicates by sequence
    /// number, then hand it to the application, dropping when it is not
    /// draining fast enough.
    fn keep(&self, src: Addr, dst: Addr, seq: u16, payload: &[u8], prev_hop: Addr, rssi: i16) {
        let s = &self.shared;
        if src as usize >= MAX_NODES {
            log::debug!("dropping packet from unaddressable source {src:02}");
            return;
        }
        let duplicate = s.route.lock(|cell| {
            let mut route = cell.borrow_mut();
            let seen = &mut route.recv_seq[src as usize];
            if seq <= *seen && *seen != 0 {
                true
            } else {
                *seen = seq;
                false
            }
        });
        if duplicate || payload.is_empty() {
            return;
        }
        let pkt = InboundPacket {
            header: RouteHeader {
                src,
                dst,
                prev: prev_hop,
                rssi,
            },
            payload: payload.to_vec(),
        };
        if s.recv_q.try_enqueue(pkt).is_err() {
            log::debug!("receive queue full, dropping packet from {src:02}");
        }
    }

    /// Relay a frame for someone else: detect routing loops, then transmit
    /// the original bytes to the current parent.
    async fn forward(&self, frame: &[u8], src: Addr, prev_hop: Addr) {
        let s = &self.shared;
        let looped = s.route.lock(|cell| {
            let mut route = cell.borrow_mut();
            let own = src == s.config.self_addr;
            if (own || route.parent == Some(src)) && route.loopy_parent != Some(prev_hop) {
                route.loopy_parent = Some(if own { prev_hop } else { src });
                route.loopy_parent
            } else {
                None
            }
        });
        if let Some(culprit) = looped {
            log::info!("loop detected via {culprit:02}");
            self.change_parent().await;
        }
        match self.parent() {
            Some(parent) => {
                if s.mac.send(parent, frame).await {
                    let total = s.route.lock(|cell| {
                        let mut route = cell.borrow_mut();
                        let slot = &mut route.forwarded[(src as usize).min(MAX_NODES - 1)];
                        *slot += 1;
                        *slot
                    });
                    log::info!("FWD: {src:02} -> {parent:02} total: {total:02}");
                } else {
                    log::error!("forward failed: {src:02} -> {parent:02}");
                }
            }
            None => log::debug!("no parent, dropping forward from {src:02}"),
        }
    }

    /// Fold an observed frame into the neighbour table and react: direct
    /// loops force a parent change, and a brand-new neighbour may displace
    /// the current parent under the configured strategy.
    async fn observe_and_react(&self, addr: Addr, rssi: i16, advert: Option<(Addr, i16)>) {
        let s = &self.shared;
        let parent = self.parent();
        let Some(outcome) = s.neighbours.observe(addr, rssi, advert, parent) else {
            return;
        };

        // a lower-addressed child that is simultaneously our parent is a
        // two-node cycle; break it immediately
        if outcome.is_child && parent == Some(addr) && addr < s.config.self_addr {
            log::info!("direct loop with {addr:02}");
            self.change_parent().await;
            return;
        }

        if !outcome.is_new {
            return;
        }
        log::debug!(
            "new {}: {addr:02} ({rssi}), active neighbours: {}",
            if outcome.is_child { "child" } else { "neighbour" },
            outcome.num_active
        );

        if s.config.strategy == ParentStrategy::Fixed
            || self.is_sink()
            || outcome.is_child
            || parent == Some(addr)
        {
            return;
        }

        let parent_rssi = parent
            .and_then(|p| s.neighbours.get(p))
            .map_or(MIN_RSSI, |n| n.rssi);
        let adopted = s.route.lock(|cell| {
            let mut route = cell.borrow_mut();
            if route.parent == Some(addr) {
                return None;
            }
            let current = route.parent;
            if parent::adopt_new_neighbour(
                s.config.strategy,
                s.config.self_addr,
                addr,
                rssi,
                current,
                parent_rssi,
                &mut route.rng,
            ) {
                Some(route.parent.replace(addr))
            } else {
                None
            }
        });
        if let Some(prev) = adopted {
            s.neighbours.apply_parent_links(prev, addr);
            s.metrics.with(|data| data[0].parent_changes += 1);
            if let Some(prev) = prev {
                log::debug!("changing parent, prev: {prev:02}");
            }
            log::info!("parent: {addr:02} ({rssi})");
            // advertise the new tree edge right away
            self.send_beacon().await;
        }
    }

    /// Reselect the parent from the current table under the configured
    /// strategy.
    async fn change_parent(&self) {
        let s = &self.shared;
        let snap = s.neighbours.snapshot();
        let (prev, new_parent) = s.route.lock(|cell| {
            let mut route = cell.borrow_mut();
            let prev = route.parent;
            let new_parent = parent::reselect(
                s.config.strategy,
                &snap,
                s.config.self_addr,
                s.config.sink_addr,
                prev,
                s.config.fixed_parent,
                &mut route.rng,
            );
            route.parent = Some(new_parent);
            (prev, new_parent)
        });
        s.neighbours.apply_parent_links(prev, new_parent);
        s.metrics.with(|data| data[0].parent_changes += 1);
        let rssi = s.neighbours.get(new_parent).map_or(MIN_RSSI, |n| n.rssi);
        log::info!("new parent: {new_parent:02} ({rssi})");
    }

    /// Drain the send queue one packet at a time, stamping the sequence
    /// number at serialisation so retried queue entries never reuse one.
    async fn send_worker(&self) {
        let s = &self.shared;
        let mut rng = SmallRng::from_entropy();
        while !self.is_shutdown() {
            let Some(pkt) = s.send_q.timed_dequeue(SEND_POLL_TIMEOUT).await else {
                continue;
            };
            let (frame, parent) = s.route.lock(|cell| {
                let mut route = cell.borrow_mut();
                let slot = &mut route.send_seq[pkt.dest as usize];
                *slot = slot.wrapping_add(1);
                let seq = *slot;
                (
                    wire::encode_data_strp(pkt.dest, s.config.self_addr, seq, &pkt.payload),
                    route.parent,
                )
            });
            match parent {
                Some(parent) => {
                    if s.mac.send(parent, &frame).await {
                        if s.config.log_gate >= LogGate::Trace {
                            log::trace!("TX {}", wire::hex_dump(&frame, STRP_HEADER_LEN));
                        }
                    } else {
                        log::error!("MAC send to {parent:02} failed");
                    }
                }
                None => log::error!("no parent, dropping packet for {:02}", pkt.dest),
            }
            Timer::after(Duration::from_millis(rng.gen_range(500..=1200))).await;
        }
    }

    /// Periodic beacon plus timeout-driven neighbour cleanup and tree
    /// repair.
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
                self.cleanup(now).await;
            }
            Timer::after(interval).await;
        }
    }

    async fn cleanup(&self, now: Instant) {
        let s = &self.shared;
        let parent = self.parent();
        let parent_lost = s.neighbours.cleanup(now, parent);
        if !parent_lost {
            log::debug!("active neighbour count: {}", s.neighbours.num_active());
            return;
        }
        if let Some(parent) = parent {
            log::info!("parent inactive: {parent:02}");
        }
        if !self.is_sink()
            && s.config.strategy != ParentStrategy::Fixed
            && s.neighbours.num_active() == 0
        {
            // nothing left to choose from: drop back to discovery
            s.route.lock(|cell| cell.borrow_mut().parent = None);
            log::info!("all neighbours lost, sensing again");
            if let Err(err) = self.sense_neighbours().await {
                log::error!("re-discovery failed: {err}");
            }
        } else {
            self.change_parent().await;
        }
    }

    /// Broadcast a beacon advertising the current parent and its link
    /// quality.
    async fn send_beacon(&self) {
        let s = &self.shared;
        let parent = self.parent();
        let parent_rssi = parent
            .and_then(|p| s.neighbours.get(p))
            .map_or(MIN_RSSI, |n| n.rssi);
        let frame = wire::encode_strp_beacon(parent, parent_rssi);
        if s.mac.send(crate::ADDR_BROADCAST, &frame).await {
            s.metrics.with(|data| data[0].beacons_sent += 1);
        } else {
            log::error!("beacon transmission failed");
        }
    }
}

impl<M: Mac> RoutingTransport for Strp<M> {
    async fn send(&self, dest: Addr, payload: &[u8]) -> bool {
        Strp::send(self, dest, payload).await
    }

    async fn recv(&self, buf: &mut [u8]) -> (RouteHeader, usize) {
        Strp::recv(self, buf).await
    }

    async fn timed_recv(&self, buf: &mut [u8], timeout: Duration) -> RecvOutcome {
        Strp::timed_recv(self, buf, timeout).await
    }

    fn header_size(&self) -> usize {
        STRP_HEADER_LEN
    }

    fn metrics_header(&self) -> &'static str {
        "AggParentChanges,AggBeaconsSent,TotalBeaconsRecv"
    }

    fn metrics_row(&self, addr: Addr) -> String {
        let idx = (addr as usize).min(MAX_NODES - 1);
        self.shared.metrics.with(|data| {
            let row = format!(
                "{},{},{}",
                data[0].parent_changes, data[0].beacons_sent, data[idx].beacons_recv
            );
            data[idx] = StrpCounters::default();
            data[0].beacons_sent = 0;
            data[0].parent_changes = 0;
            row
        })
    }

    fn topology_header(&self) -> &'static str {
        "Timestamp,Source,Address,State,LinkType,RSSI,Parent,ParentRSSI"
    }

    fn topology_rows(&self, buf: &mut [u8]) -> usize {
        let s = &self.shared;
        let snap = s.neighbours.snapshot();
        let parent = self.parent();
        let src = s.config.self_addr;
        let mut timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let mut offset = 0;

        // parent first, then the rest; only the first row carries the
        // timestamp
        let order = parent
            .map(|p| snap.nodes[p as usize])
            .into_iter()
            .chain(snap.known().copied().filter(|n| Some(n.addr) != parent));
        for node in order {
            let row = format!(
                "{},{},{},{},{},{},{},{}\n",
                timestamp,
                src,
                node.addr,
                node.state.csv_code(),
                node.link.csv_code(),
                node.rssi,
                node.parent,
                node.parent_rssi
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
    use crate::mac::sim::SimMedium;
    use futures::executor::block_on;

    fn node(medium: &SimMedium, addr: Addr, strategy: ParentStrategy) -> Strp<crate::mac::sim::SimMac> {
        Strp::new(
            StrpConfig {
                self_addr: addr,
                strategy,
                ..Default::default()
            },
            medium.attach(addr),
        )
        .unwrap()
    }

    #[test]
    fn duplicate_frames_are_dropped_silently() {
        block_on(async {
            let medium = SimMedium::new();
            let sink = node(&medium, 0x0D, ParentStrategy::Closest);

            let frame = wire::encode_data_strp(0x0D, 0x05, 1, b"hello");
            sink.handle_frame(&frame, 0x05, -60).await;
            sink.handle_frame(&frame, 0x05, -60).await;
            assert_eq!(sink.shared.recv_q.len(), 1);

            // a later sequence number is accepted again
            let frame = wire::encode_data_strp(0x0D, 0x05, 2, b"again");
            sink.handle_frame(&frame, 0x05, -60).await;
            assert_eq!(sink.shared.recv_q.len(), 2);

            // and a stale one is not
            let frame = wire::encode_data_strp(0x0D, 0x05, 1, b"stale");
            sink.handle_frame(&frame, 0x05, -60).await;
            assert_eq!(sink.shared.recv_q.len(), 2);
        });
    }

    #[test]
    fn first_beacon_becomes_parent_and_refines_by_rssi() {
        block_on(async {
            let medium = SimMedium::new();
            let n = node(&medium, 0x07, ParentStrategy::Closest);

            n.observe_and_react(0x05, -50, Some((0x00, MIN_RSSI))).await;
            assert_eq!(n.parent(), Some(0x05));

            // weaker signal does not displace the parent
            n.observe_and_react(0x0D, -70, Some((0x00, MIN_RSSI))).await;
            assert_eq!(n.parent(), Some(0x05));

            // stronger does
            n.observe_and_react(0x03, -40, Some((0x00, MIN_RSSI))).await;
            assert_eq!(n.parent(), Some(0x03));
        });
    }

    #[test]
    fn looping_frame_triggers_one_parent_change() {
        block_on(async {
            let medium = SimMedium::new();
            let n = node(&medium, 0x07, ParentStrategy::Closest);
            n.observe_and_react(0x05, -50, Some((0x00, MIN_RSSI))).await;
            n.observe_and_react(0x0D, -70, Some((0x00, MIN_RSSI))).await;
            assert_eq!(n.parent(), Some(0x05));

            // a frame we originated comes back from our parent
            let frame = wire::encode_data_strp(0x0D, 0x07, 1, b"x");
            n.handle_frame(&frame, 0x05, -50).await;
            assert_eq!(n.parent(), Some(0x0D));
            assert_eq!(
                n.shared.route.lock(|cell| cell.borrow().loopy_parent),
                Some(0x05)
            );

            // the cached loopy parent suppresses a second reaction
            let frame = wire::encode_data_strp(0x0D, 0x07, 2, b"x");
            n.handle_frame(&frame, 0x05, -50).await;
            assert_eq!(n.parent(), Some(0x0D));
        });
    }

    #[test]
    fn lower_addressed_child_claiming_us_breaks_the_cycle() {
        block_on(async {
            let medium = SimMedium::new();
            let n = node(&medium, 0x07, ParentStrategy::Closest);
            n.observe_and_react(0x05, -50, Some((0x00, MIN_RSSI))).await;
            n.observe_and_react(0x0D, -70, Some((0x00, MIN_RSSI))).await;
            assert_eq!(n.parent(), Some(0x05));

            // 0x05 now advertises us as its parent: direct loop
            n.observe_and_react(0x05, -50, Some((0x07, -50))).await;
            assert_eq!(n.parent(), Some(0x0D));
        });
    }

    #[test]
    fn sink_never_selects_a_parent() {
        block_on(async {
            let medium = SimMedium::new();
            let sink = node(&medium, 0x0D, ParentStrategy::Closest);
            sink.observe_and_react(0x05, -50, Some((0x00, MIN_RSSI))).await;
            assert_eq!(sink.parent(), None);
        });
    }

    #[test]
    fn outbound_link_is_unique_after_changes() {
        block_on(async {
            let medium = SimMedium::new();
            let n = node(&medium, 0x09, ParentStrategy::Closest);
            n.observe_and_react(0x03, -60, Some((0x00, MIN_RSSI))).await;
            n.observe_and_react(0x05, -40, Some((0x00, MIN_RSSI))).await;
            n.observe_and_react(0x07, -30, Some((0x00, MIN_RSSI))).await;
            assert_eq!(n.parent(), Some(0x07));

            let snap = n.shared.neighbours.snapshot();
            let outbound: Vec<Addr> = snap
                .known()
                .filter(|e| e.link == crate::neighbours::LinkType::Outbound)
                .map(|e| e.addr)
                .collect();
            assert_eq!(outbound, vec![0x07]);
        });
    }

    #[test]
    fn metrics_row_resets_on_read() {
        block_on(async {
            let medium = SimMedium::new();
            let n = node(&medium, 0x07, ParentStrategy::Closest);
            n.observe_and_react(0x05, -50, Some((0x00, MIN_RSSI))).await;

            let beacon = wire::encode_strp_beacon(Some(0x0D), -70);
            n.handle_frame(&beacon, 0x05, -50).await;
            n.handle_frame(&beacon, 0x05, -50).await;

            // one parent adoption, two beacons from 0x05; the adoption
            // beacon went out over a medium with no listeners
            let row = n.metrics_row(0x05);
            assert_eq!(row, "1,1,2");
            let row = n.metrics_row(0x05);
            assert_eq!(row, "0,0,0");
        });
    }

    #[test]
    fn topology_rows_put_parent_first_and_blank_later_timestamps() {
        block_on(async {
            let medium = SimMedium::new();
            let n = node(&medium, 0x07, ParentStrategy::Closest);
            n.observe_and_react(0x05, -50, Some((0x0D, -55))).await;
            n.observe_and_react(0x0D, -70, Some((0x00, MIN_RSSI))).await;
            assert_eq!(n.parent(), Some(0x05));

            let mut buf = [0u8; 512];
            let len = n.topology_rows(&mut buf);
            let text = core::str::from_utf8(&buf[..len]).unwrap();
            let rows: Vec<&str> = text.lines().collect();
            assert_eq!(rows.len(), 2);

            let parent_row: Vec<&str> = rows[0].split(',').collect();
            assert_ne!(parent_row[0], "0");
            assert_eq!(parent_row[1], "7"); // source is self
            assert_eq!(parent_row[2], "5"); // parent address first
            assert_eq!(parent_row[4], "2"); // outbound link

            let other_row: Vec<&str> = rows[1].split(',').collect();
            assert_eq!(other_row[0], "0"); // timestamp only once
            assert_eq!(other_row[2], "13");
        });
    }

    #[test]
    fn oversized_and_empty_payloads_rejected() {
        block_on(async {
            let medium = SimMedium::new();
            let n = node(&medium, 0x07, ParentStrategy::Closest);
            assert!(!n.send(0x0D, &[]).await);
            assert!(!n.send(0x0D, &[0u8; MAX_PAYLOAD_LEN + 1]).await);
            assert!(!n.send(0xFF, b"x").await);
            assert!(n.send(0x0D, b"x").await);
        });
    }
}
