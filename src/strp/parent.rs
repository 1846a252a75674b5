//! Parent-selection policy.
//!
//! Two entry points: [`adopt_new_neighbour`] decides on the fly whether a
//! freshly discovered neighbour displaces the current parent, and
//! [`reselect`] picks a replacement from a table snapshot after a timeout or
//! a detected loop. Both run on copies of the table so no lock is held while
//! deciding; the sink is the fallback whenever no candidate qualifies.

use rand::Rng;

use crate::config::ParentStrategy;
use crate::neighbours::{LinkType, NodeState, TableSnapshot};
use crate::{Addr, MIN_RSSI};

/// Whether a newly discovered neighbour should become the parent right away.
/// With no parent yet, the first qualifying neighbour is adopted
/// unconditionally; afterwards each strategy applies its own refinement
/// rule. Children and the current parent are filtered out by the caller.
pub(crate) fn adopt_new_neighbour(
    strategy: ParentStrategy,
    self_addr: Addr,
    addr: Addr,
    rssi: i16,
    parent: Option<Addr>,
    parent_rssi: i16,
    rng: &mut impl Rng,
) -> bool {
    let Some(parent) = parent else {
        return match strategy {
            ParentStrategy::NextLower
            | ParentStrategy::RandomLower
            | ParentStrategy::ClosestLower => addr < self_addr,
            ParentStrategy::Random | ParentStrategy::Closest => true,
            ParentStrategy::Fixed => false,
        };
    };
    match strategy {
        ParentStrategy::NextLower => addr > parent && addr < self_addr,
        ParentStrategy::Random => rng.gen_bool(0.5),
        ParentStrategy::RandomLower => addr < self_addr && rng.gen_bool(0.5),
        ParentStrategy::Closest => rssi > parent_rssi,
        ParentStrategy::ClosestLower => rssi > parent_rssi && addr < self_addr,
        ParentStrategy::Fixed => false,
    }
}

/// Pick a new parent from `snap`, excluding the current one so a change
/// always moves somewhere else. Falls back to `sink` when nothing qualifies.
pub(crate) fn reselect(
    strategy: ParentStrategy,
    snap: &TableSnapshot,
    self_addr: Addr,
    sink: Addr,
    current: Option<Addr>,
    fixed: Option<Addr>,
    rng: &mut impl Rng,
) -> Addr {
    match strategy {
        ParentStrategy::NextLower => next_lower(snap, self_addr, sink, current),
        ParentStrategy::Random => random(snap, sink, current, rng),
        ParentStrategy::RandomLower => random_lower(snap, self_addr, sink, current, rng),
        ParentStrategy::Closest => closest(snap, sink, current),
        ParentStrategy::ClosestLower => closest_lower(snap, self_addr, sink, current),
        ParentStrategy::Fixed => fixed.unwrap_or(sink),
    }
}

fn is_candidate(n: &crate::neighbours::Neighbour, current: Option<Addr>) -> bool {
    n.state == NodeState::Active && n.link != LinkType::Inbound && current != Some(n.addr)
}

fn next_lower(snap: &TableSnapshot, self_addr: Addr, sink: Addr, current: Option<Addr>) -> Addr {
    snap.known()
        .filter(|n| n.addr < self_addr && is_candidate(n, current))
        .map(|n| n.addr)
        .max()
        .unwrap_or(sink)
}

fn closest(snap: &TableSnapshot, sink: Addr, current: Option<Addr>) -> Addr {
    let mut best = (sink, MIN_RSSI);
    for n in snap.known().filter(|n| is_candidate(n, current)) {
        if n.rssi > best.1 {
            best = (n.addr, n.rssi);
        }
    }
    best.0
}

fn closest_lower(snap: &TableSnapshot, self_addr: Addr, sink: Addr, current: Option<Addr>) -> Addr {
    let mut best = (sink, MIN_RSSI);
    for n in snap
        .known()
        .filter(|n| n.addr < self_addr && is_candidate(n, current))
    {
        if n.rssi >= best.1 {
            best = (n.addr, n.rssi);
        }
    }
    best.0
}

fn random(snap: &TableSnapshot, sink: Addr, current: Option<Addr>, rng: &mut impl Rng) -> Addr {
    let pool: Vec<Addr> = snap
        .known()
        .filter(|n| n.addr != sink && is_candidate(n, current))
        .map(|n| n.addr)
        .collect();
    pick(&pool, rng).unwrap_or(sink)
}

fn random_lower(
    snap: &TableSnapshot,
    self_addr: Addr,
    sink: Addr,
    current: Option<Addr>,
    rng: &mut impl Rng,
) -> Addr {
    let pool: Vec<Addr> = snap
        .known()
        .filter(|n| {
            n.addr < self_addr
                && n.addr != sink
                && current.is_some_and(|c| n.addr < c)
                && is_candidate(n, current)
        })
        .map(|n| n.addr)
        .collect();
    pick(&pool, rng).unwrap_or(sink)
}

fn pick(pool: &[Addr], rng: &mut impl Rng) -> Option<Addr> {
    if pool.is_empty() {
        None
    } else {
        Some(pool[rng.gen_range(0..pool.len())])
    }
}
