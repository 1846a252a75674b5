//! Address-indexed neighbour table shared by both routing engines.
//!
//! The table is a fixed 32-slot array indexed directly by node address, with
//! `min_addr`/`max_addr` bracketing every address ever observed so that scans
//! touch only the populated range. Entries are created on the first frame
//! heard from an address and are never removed, only marked [`NodeState::Inactive`]
//! once the keepalive timeout lapses.
//!
//! Mutations run inside a blocking mutex; readers grab a [`TableSnapshot`]
//! and run selection policy on the copy so the lock is never held across an
//! await point.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Instant};

use crate::{Addr, MAX_NODES, MIN_RSSI};

/// Liveness of a neighbour. CSV codes follow the monitoring contract:
/// `Unknown = -1`, `Inactive = 0`, `Active = 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Unknown,
    Inactive,
    Active,
}

impl NodeState {
    pub fn csv_code(self) -> i8 {
        match self {
            NodeState::Unknown => -1,
            NodeState::Inactive => 0,
            NodeState::Active => 1,
        }
    }
}

/// Role of a neighbour relative to self. CSV codes: `Idle = 0`,
/// `Inbound = 1` (that neighbour treats self as its parent), `Outbound = 2`
/// (self treats that neighbour as its parent / next hop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkType {
    #[default]
    Idle,
    Inbound,
    Outbound,
}

impl LinkType {
    pub fn csv_code(self) -> u8 {
        match self {
            LinkType::Idle => 0,
            LinkType::Inbound => 1,
            LinkType::Outbound => 2,
        }
    }
}

/// One neighbour record.
#[derive(Debug, Clone, Copy)]
pub struct Neighbour {
    pub addr: Addr,
    pub state: NodeState,
    pub link: LinkType,
    pub rssi: i16,
    pub last_seen: Instant,
    /// Parent the neighbour advertised in its last beacon; `0` = unassigned.
    pub parent: Addr,
    /// The neighbour's link quality to its advertised parent.
    pub parent_rssi: i16,
}

impl Neighbour {
    fn unknown(addr: Addr) -> Self {
        Self {
            addr,
            state: NodeState::Unknown,
            link: LinkType::Idle,
            rssi: MIN_RSSI,
            last_seen: Instant::MIN,
            parent: 0,
            parent_rssi: MIN_RSSI,
        }
    }
}

/// What [`NeighbourTable::observe`] learned, for the engine to react to.
#[derive(Debug, Clone, Copy)]
pub struct ObserveOutcome {
    /// First time this address was ever heard.
    pub is_new: bool,
    /// The neighbour advertised self as its parent.
    pub is_child: bool,
    /// Active count after the observation.
    pub num_active: u8,
}

/// Consistent copy of the table for lock-free iteration.
#[derive(Debug, Clone, Copy)]
pub struct TableSnapshot {
    pub nodes: [Neighbour; MAX_NODES],
    pub num_active: u8,
    pub num_nodes: u8,
    pub min_addr: Addr,
    pub max_addr: Addr,
}

impl TableSnapshot {
    /// Iterate the known (non-`Unknown`) entries within `[min_addr, max_addr]`.
    pub fn known(&self) -> impl Iterator<Item = &Neighbour> {
        self.nodes[self.min_addr as usize..=(self.max_addr as usize).max(self.min_addr as usize)]
            .iter()
            .filter(|n| n.state != NodeState::Unknown)
    }
}

struct TableInner {
    nodes: [Neighbour; MAX_NODES],
    num_active: u8,
    num_nodes: u8,
    min_addr: Addr,
    max_addr: Addr,
    last_cleanup: Instant,
}

/// Thread-safe neighbour table.
pub struct NeighbourTable {
    self_addr: Addr,
    node_timeout: Duration,
    inner: Mutex<CriticalSectionRawMutex, RefCell<TableInner>>,
}

impl NeighbourTable {
    pub fn new(self_addr: Addr, node_timeout: Duration) -> Self {
        Self {
            self_addr,
            node_timeout,
            inner: Mutex::new(RefCell::new(TableInner {
                nodes: core::array::from_fn(|addr| Neighbour::unknown(addr as Addr)),
                num_active: 0,
                num_nodes: 0,
                min_addr: (MAX_NODES - 1) as Addr,
                max_addr: 0,
                last_cleanup: Instant::now(),
            })),
        }
    }

    /// Record a frame heard from `addr`. `advert` carries the sender's
    /// advertised parent when the frame was a tree beacon; `current_parent`
    /// is this node's own parent, used to tag the outbound link.
    ///
    /// Returns `None` for addresses the table cannot hold.
    pub fn observe(
        &self,
        addr: Addr,
        rssi: i16,
        advert: Option<(Addr, i16)>,
        current_parent: Option<Addr>,
    ) -> Option<ObserveOutcome> {
        if addr as usize >= MAX_NODES {
            log::debug!("ignoring unaddressable neighbour {addr:#04x}");
            return None;
        }
        Some(self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let outcome = inner.refresh(addr, rssi);
            let node = &mut inner.nodes[addr as usize];
            let is_child = advert.is_some_and(|(parent, _)| parent == self.self_addr);
            node.link = if current_parent == Some(addr) {
                LinkType::Outbound
            } else if is_child {
                LinkType::Inbound
            } else {
                LinkType::Idle
            };
            if let Some((parent, parent_rssi)) = advert {
                node.parent = parent;
                node.parent_rssi = parent_rssi;
            }
            ObserveOutcome {
                is_child,
                ..outcome
            }
        }))
    }

    /// Record a frame heard from `addr` for a protocol without parent links:
    /// every discovered neighbour is a candidate next hop.
    pub fn observe_candidate(&self, addr: Addr, rssi: i16) -> Option<ObserveOutcome> {
        if addr as usize >= MAX_NODES {
            log::debug!("ignoring unaddressable neighbour {addr:#04x}");
            return None;
        }
        Some(self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let outcome = inner.refresh(addr, rssi);
            if outcome.is_new {
                inner.nodes[addr as usize].link = LinkType::Outbound;
            }
            outcome
        }))
    }

    /// Mark entries unheard for the keepalive timeout as inactive. Returns
    /// whether `current_parent` was among them.
    pub fn cleanup(&self, now: Instant, current_parent: Option<Addr>) -> bool {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let mut parent_inactive = false;
            let (min, max) = (inner.min_addr as usize, inner.max_addr as usize);
            for addr in min..=max.max(min) {
                let node = &mut inner.nodes[addr];
                if node.state != NodeState::Active {
                    continue;
                }
                let timed_out = now
                    .checked_duration_since(node.last_seen)
                    .is_some_and(|idle| idle >= self.node_timeout);
                if timed_out {
                    node.state = NodeState::Inactive;
                    node.link = LinkType::Idle;
                    inner.num_active -= 1;
                    if current_parent == Some(addr as Addr) {
                        parent_inactive = true;
                    }
                    log::info!("node {addr:02} inactive");
                }
            }
            inner.last_cleanup = now;
            parent_inactive
        })
    }

    /// Whether enough time has passed since the last cleanup to run another.
    pub fn cleanup_due(&self, now: Instant) -> bool {
        self.inner.lock(|cell| {
            now.checked_duration_since(cell.borrow().last_cleanup)
                .is_some_and(|idle| idle >= self.node_timeout)
        })
    }

    pub fn snapshot(&self) -> TableSnapshot {
        self.inner.lock(|cell| {
            let inner = cell.borrow();
            TableSnapshot {
                nodes: inner.nodes,
                num_active: inner.num_active,
                num_nodes: inner.num_nodes,
                min_addr: inner.min_addr,
                max_addr: inner.max_addr,
            }
        })
    }

    pub fn get(&self, addr: Addr) -> Option<Neighbour> {
        if addr as usize >= MAX_NODES {
            return None;
        }
        self.inner.lock(|cell| Some(cell.borrow().nodes[addr as usize]))
    }

    pub fn num_active(&self) -> u8 {
        self.inner.lock(|cell| cell.borrow().num_active)
    }

    /// Re-tag links after a parent change: the old parent returns to `Idle`,
    /// the new one becomes `Outbound`.
    pub fn apply_parent_links(&self, prev: Option<Addr>, new: Addr) {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            if let Some(prev) = prev {
                if (prev as usize) < MAX_NODES && prev != new {
                    inner.nodes[prev as usize].link = LinkType::Idle;
                }
            }
            if (new as usize) < MAX_NODES {
                inner.nodes[new as usize].link = LinkType::Outbound;
            }
        });
    }
}

impl TableInner {
    /// Shared part of every observation: liveness, counters, address
    /// bracket, RSSI and the last-seen stamp.
    fn refresh(&mut self, addr: Addr, rssi: i16) -> ObserveOutcome {
        let is_new = self.nodes[addr as usize].state == NodeState::Unknown;
        if is_new {
            self.num_active += 1;
            self.num_nodes += 1;
            if addr > self.max_addr {
                self.max_addr = addr;
            }
            if addr < self.min_addr {
                self.min_addr = addr;
            }
        } else if self.nodes[addr as usize].state == NodeState::Inactive {
            self.num_active += 1;
        }
        let node = &mut self.nodes[addr as usize];
        node.state = NodeState::Active;
        node.rssi = rssi;
        node.last_seen = Instant::now();
        ObserveOutcome {
            is_new,
            is_child: false,
            num_active: self.num_active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> NeighbourTable {
        NeighbourTable::new(0x09, Duration::from_secs(60))
    }

    #[test]
    fn observe_tracks_counts_and_bracket() {
        let t = table();
        t.observe(0x05, -60, None, None).unwrap();
        t.observe(0x0D, -70, None, None).unwrap();
        let snap = t.snapshot();
        assert_eq!(snap.num_active, 2);
        assert_eq!(snap.num_nodes, 2);
        assert_eq!(snap.min_addr, 0x05);
        assert_eq!(snap.max_addr, 0x0D);
        assert_eq!(
            snap.num_active as usize,
            snap.known().filter(|n| n.state == NodeState::Active).count()
        );
        for n in snap.known() {
            assert!(n.addr >= snap.min_addr && n.addr <= snap.max_addr);
        }

        // re-observing an existing neighbour changes no counters
        t.observe(0x05, -55, None, None).unwrap();
        assert_eq!(t.num_active(), 2);
        assert_eq!(t.get(0x05).unwrap().rssi, -55);
    }

    #[test]
    fn unaddressable_neighbour_ignored() {
        let t = table();
        assert!(t.observe(0x40, -60, None, None).is_none());
        assert!(t.observe_candidate(0xFF, -60).is_none());
        assert_eq!(t.snapshot().num_nodes, 0);
    }

    #[test]
    fn link_assignment_follows_parent_and_advert() {
        let t = table();
        // neighbour advertising self as its parent is a child
        let out = t.observe(0x05, -60, Some((0x09, -61)), None).unwrap();
        assert!(out.is_child);
        assert_eq!(t.get(0x05).unwrap().link, LinkType::Inbound);

        // the current parent is tagged outbound
        t.observe(0x0D, -70, Some((0x00, MIN_RSSI)), Some(0x0D)).unwrap();
        assert_eq!(t.get(0x0D).unwrap().link, LinkType::Outbound);

        // anyone else is idle, and the advertised parent is retained
        let out = t.observe(0x07, -50, Some((0x05, -52)), Some(0x0D)).unwrap();
        assert!(!out.is_child);
        let n = t.get(0x07).unwrap();
        assert_eq!(n.link, LinkType::Idle);
        assert_eq!(n.parent, 0x05);
        assert_eq!(n.parent_rssi, -52);
    }

    #[test]
    fn cleanup_marks_stale_entries_and_reports_parent_loss() {
        let t = NeighbourTable::new(0x09, Duration::from_secs(0));
        t.observe(0x05, -60, None, Some(0x05)).unwrap();
        t.observe(0x07, -62, None, Some(0x05)).unwrap();

        // zero timeout: everything is immediately stale
        let parent_lost = t.cleanup(Instant::now(), Some(0x05));
        assert!(parent_lost);
        assert_eq!(t.num_active(), 0);
        assert_eq!(t.get(0x05).unwrap().state, NodeState::Inactive);
        assert_eq!(t.get(0x05).unwrap().link, LinkType::Idle);

        // a second cleanup with no intervening observe is a no-op
        let parent_lost = t.cleanup(Instant::now(), Some(0x05));
        assert!(!parent_lost);
        assert_eq!(t.num_active(), 0);

        // reactivation on the next frame
        let out = t.observe(0x05, -61, None, None).unwrap();
        assert!(!out.is_new);
        assert_eq!(out.num_active, 1);
        assert_eq!(t.get(0x05).unwrap().state, NodeState::Active);
    }

    #[test]
    fn fresh_entries_survive_cleanup() {
        let t = table();
        t.observe(0x05, -60, None, None).unwrap();
        let parent_lost = t.cleanup(Instant::now(), None);
        assert!(!parent_lost);
        assert_eq!(t.get(0x05).unwrap().state, NodeState::Active);
    }

    #[test]
    fn parent_link_handover() {
        let t = table();
        t.observe(0x05, -60, None, Some(0x05)).unwrap();
        t.observe(0x07, -62, None, Some(0x05)).unwrap();
        t.apply_parent_links(Some(0x05), 0x07);
        assert_eq!(t.get(0x05).unwrap().link, LinkType::Idle);
        assert_eq!(t.get(0x07).unwrap().link, LinkType::Outbound);
        let outbound = t
            .snapshot()
            .known()
            .filter(|n| n.link == LinkType::Outbound)
            .count();
        assert_eq!(outbound, 1);
    }

    #[test]
    fn candidate_observation_marks_next_hops() {
        let t = table();
        t.observe_candidate(0x05, -60).unwrap();
        assert_eq!(t.get(0x05).unwrap().link, LinkType::Outbound);
        assert_eq!(t.num_active(), 1);
    }
}
