use crate::protocol::{DEFAULT_INBOUND_FRAME_CAP, DEFAULT_OUTBOUND_FRAME_CAP, DEFAULT_OUTBOUND_NOTICE_CAP};

pub const DEFAULT_INBOUND_QUEUE_CAP: usize = 256;

pub const INBOUND_FRAME_CAP_VAR: &str = "BRIDGE_INBOUND_FRAME_CAP";
pub const OUTBOUND_FRAME_CAP_VAR: &str = "BRIDGE_OUTBOUND_FRAME_CAP";
pub const INBOUND_QUEUE_CAP_VAR: &str = "BRIDGE_INBOUND_QUEUE_CAP";
pub const OUTBOUND_QUEUE_CAP_VAR: &str = "BRIDGE_OUTBOUND_QUEUE_CAP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Largest inbound frame body accepted before the reader gives up.
    pub inbound_frame_cap: usize,
    pub outbound_frame_cap: usize,
    /// Frames the reader may queue ahead of the owning thread.
    pub inbound_queue_cap: usize,
    /// Readiness notices that may wait for the writer before new ones are
    /// dropped.
    pub outbound_notice_cap: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            inbound_frame_cap: DEFAULT_INBOUND_FRAME_CAP,
            outbound_frame_cap: DEFAULT_OUTBOUND_FRAME_CAP,
            inbound_queue_cap: DEFAULT_INBOUND_QUEUE_CAP,
            outbound_notice_cap: DEFAULT_OUTBOUND_NOTICE_CAP,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            inbound_frame_cap: parse_capacity(&lookup, INBOUND_FRAME_CAP_VAR, defaults.inbound_frame_cap),
            outbound_frame_cap: parse_capacity(&lookup, OUTBOUND_FRAME_CAP_VAR, defaults.outbound_frame_cap),
            inbound_queue_cap: parse_capacity(&lookup, INBOUND_QUEUE_CAP_VAR, defaults.inbound_queue_cap),
            outbound_notice_cap: parse_capacity(&lookup, OUTBOUND_QUEUE_CAP_VAR, defaults.outbound_notice_cap),
        }
    }
}

/// Positive integer from `key`, or `default` when unset or invalid.
pub fn parse_capacity(lookup: impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
