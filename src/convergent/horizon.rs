//! Causal context of a replica

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identifies one replica of a document.
pub type DeviceId = String;

/// Position of a change in its author's stream, starting at 1.
pub type SeqNum = u64;

/// The highest sequence number seen from every known device.
///
/// Two replicas with equal horizons hold the same set of changes, so a
/// horizon doubles as the document's heads.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Horizon {
    seen: BTreeMap<DeviceId, SeqNum>,
}

impl Horizon {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device: &str) -> SeqNum {
        self.seen.get(device).copied().unwrap_or(0)
    }

    pub fn observe(&mut self, device: &str, seq: SeqNum) {
        if seq > self.get(device) {
            self.seen.insert(device.to_string(), seq);
        }
    }

    pub fn merge(&mut self, other: &Horizon) {
        for (device, seq) in &other.seen {
            self.observe(device, *seq);
        }
    }

    pub fn has_seen(&self, device: &str, seq: SeqNum) -> bool {
        self.get(device) >= seq
    }

    /// Whether everything `other` has seen is also seen here.
    pub fn dominates(&self, other: &Horizon) -> bool {
        other.seen.iter().all(|(device, seq)| self.get(device) >= *seq)
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_never_goes_backwards() {
        let mut h = Horizon::new();
        assert_eq!(h.get("A"), 0);
        h.observe("A", 5);
        h.observe("A", 3);
        assert_eq!(h.get("A"), 5);
        assert!(h.has_seen("A", 4));
        assert!(!h.has_seen("B", 1));
    }

    #[test]
    fn test_merge_and_dominates() {
        let mut a = Horizon::new();
        a.observe("A", 5);
        a.observe("B", 2);
        let mut b = Horizon::new();
        b.observe("A", 3);
        b.observe("B", 4);
        assert!(!a.dominates(&b) && !b.dominates(&a));

        a.merge(&b);
        assert!(a.dominates(&b));
        assert_eq!(a.get("B"), 4);
    }
}
