//! Engine configuration.
//!
//! Interval fields are plain seconds and `0` means "use the default", so a
//! TOML scenario file can set only what it cares about.

use serde::Deserialize;

use crate::{error::RoutingError, Addr, DEFAULT_SINK_ADDR, MAX_NODES};

/// How a non-sink STRP node picks its parent neighbour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParentStrategy {
    /// The active neighbour with the largest address strictly below self.
    NextLower,
    /// A random active neighbour below self (and below the current parent
    /// while reselecting).
    RandomLower,
    /// Any active non-child neighbour, accepted on a coin flip.
    Random,
    /// The active non-child neighbour with the strongest signal.
    #[default]
    Closest,
    /// Like `Closest`, restricted to addresses below self.
    ClosestLower,
    /// An operator-supplied parent; fatal if it is never heard.
    Fixed,
}

/// Gate for the expensive frame hex dumps; everything else goes through the
/// `log` facade and is filtered by the consumer's logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogGate {
    Error,
    #[default]
    Info,
    Debug,
    Trace,
}

/// STRP engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StrpConfig {
    /// This node's address.
    pub self_addr: Addr,
    /// Address all application traffic flows toward.
    pub sink_addr: Addr,
    /// Parent-selection strategy.
    pub strategy: ParentStrategy,
    /// Parent address, required by [`ParentStrategy::Fixed`].
    pub fixed_parent: Option<Addr>,
    /// Length of one neighbour-sensing window.
    pub sense_duration_s: u32,
    /// Interval between periodic beacons.
    pub beacon_interval_s: u32,
    /// Neighbour keepalive timeout.
    pub node_timeout_s: u32,
    /// Frame hex-dump gate.
    pub log_gate: LogGate,
}

impl Default for StrpConfig {
    fn default() -> Self {
        Self {
            self_addr: 0,
            sink_addr: DEFAULT_SINK_ADDR,
            strategy: ParentStrategy::default(),
            fixed_parent: None,
            sense_duration_s: 0,
            beacon_interval_s: 0,
            node_timeout_s: 0,
            log_gate: LogGate::default(),
        }
    }
}

impl StrpConfig {
    /// Fill zeroed interval fields with the protocol defaults and validate
    /// the addressing.
    pub fn normalized(mut self) -> Result<Self, RoutingError> {
        if self.self_addr as usize >= MAX_NODES {
            return Err(RoutingError::InvalidSelfAddress(self.self_addr));
        }
        if self.sink_addr as usize >= MAX_NODES {
            return Err(RoutingError::InvalidSinkAddress(self.sink_addr));
        }
        if self.strategy == ParentStrategy::Fixed
            && self.self_addr != self.sink_addr
            && self.fixed_parent.is_none()
        {
            return Err(RoutingError::FixedParentWithoutAddress);
        }
        if let Some(parent) = self.fixed_parent {
            if parent as usize >= MAX_NODES {
                return Err(RoutingError::InvalidParentAddress(parent));
            }
        }
        if self.beacon_interval_s == 0 {
            self.beacon_interval_s = 30;
        }
        if self.sense_duration_s == 0 {
            self.sense_duration_s = 15;
        }
        if self.node_timeout_s == 0 {
            self.node_timeout_s = 60;
        }
        Ok(self)
    }
}

/// SMRP engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SmrpConfig {
    /// This node's address.
    pub self_addr: Addr,
    /// Fallback destination when next-hop selection exhausts its budget.
    pub sink_addr: Addr,
    /// Length of one neighbour-sensing window.
    pub sense_duration_s: u32,
    /// Interval between periodic beacons.
    pub beacon_interval_s: u32,
    /// Neighbour keepalive timeout.
    pub node_timeout_s: u32,
    /// MAC receive-poll timeout in milliseconds.
    pub recv_timeout_ms: u32,
    /// Retry budget for random next-hop selection.
    pub max_tries: u8,
    /// Frame hex-dump gate.
    pub log_gate: LogGate,
}

impl Default for SmrpConfig {
    fn default() -> Self {
        Self {
            self_addr: 0,
            sink_addr: DEFAULT_SINK_ADDR,
            sense_duration_s: 0,
            beacon_interval_s: 0,
            node_timeout_s: 0,
            recv_timeout_ms: 0,
            max_tries: 0,
            log_gate: LogGate::default(),
        }
    }
}

impl SmrpConfig {
    /// Fill zeroed fields with the protocol defaults and validate the
    /// addressing.
    pub fn normalized(mut self) -> Result<Self, RoutingError> {
        if self.self_addr as usize >= MAX_NODES {
            return Err(RoutingError::InvalidSelfAddress(self.self_addr));
        }
        if self.sink_addr as usize >= MAX_NODES {
            return Err(RoutingError::InvalidSinkAddress(self.sink_addr));
        }
        if self.beacon_interval_s == 0 {
            self.beacon_interval_s = 30;
        }
        if self.sense_duration_s == 0 {
            self.sense_duration_s = 15;
        }
        if self.node_timeout_s == 0 {
            self.node_timeout_s = 60;
        }
        if self.recv_timeout_ms == 0 {
            self.recv_timeout_ms = 1000;
        }
        if self.max_tries == 0 {
            self.max_tries = 2;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_fields_take_defaults() {
        let cfg = StrpConfig {
            self_addr: 0x05,
            ..Default::default()
        }
        .normalized()
        .unwrap();
        assert_eq!(cfg.beacon_interval_s, 30);
        assert_eq!(cfg.sense_duration_s, 15);
        assert_eq!(cfg.node_timeout_s, 60);
        assert_eq!(cfg.strategy, ParentStrategy::Closest);
        assert_eq!(cfg.sink_addr, DEFAULT_SINK_ADDR);

        let cfg = SmrpConfig {
            self_addr: 0x05,
            ..Default::default()
        }
        .normalized()
        .unwrap();
        assert_eq!(cfg.max_tries, 2);
        assert_eq!(cfg.recv_timeout_ms, 1000);
    }

    #[test]
    fn fixed_strategy_requires_parent() {
        let err = StrpConfig {
            self_addr: 0x05,
            strategy: ParentStrategy::Fixed,
            ..Default::default()
        }
        .normalized()
        .unwrap_err();
        assert!(matches!(err, RoutingError::FixedParentWithoutAddress));

        // The sink never selects a parent, so Fixed without one is fine there.
        assert!(
            StrpConfig {
                self_addr: DEFAULT_SINK_ADDR,
                strategy: ParentStrategy::Fixed,
                ..Default::default()
            }
            .normalized()
            .is_ok()
        );
    }

    #[test]
    fn out_of_range_addresses_rejected() {
        let err = StrpConfig {
            self_addr: 0x20,
            ..Default::default()
        }
        .normalized()
        .unwrap_err();
        assert!(matches!(err, RoutingError::InvalidSelfAddress(0x20)));

        let err = StrpConfig {
            self_addr: 0x05,
            sink_addr: 0x40,
            ..Default::default()
        }
        .normalized()
        .unwrap_err();
        assert!(matches!(err, RoutingError::InvalidSinkAddress(0x40)));

        let err = StrpConfig {
            self_addr: 0x05,
            strategy: ParentStrategy::Fixed,
            fixed_parent: Some(0x21),
            ..Default::default()
        }
        .normalized()
        .unwrap_err();
        assert!(matches!(err, RoutingError::InvalidParentAddress(0x21)));
    }

    #[test]
    fn deserializes_from_toml() {
        let cfg: StrpConfig = toml::from_str(
            r#"
            self-addr = 5
            strategy = "closest-lower"
            beacon-interval-s = 7
            "#,
        )
        .unwrap();
        assert_eq!(cfg.self_addr, 5);
        assert_eq!(cfg.strategy, ParentStrategy::ClosestLower);
        assert_eq!(cfg.beacon_interval_s, 7);
        assert_eq!(cfg.node_timeout_s, 0);
    }
}
