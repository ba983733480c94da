//! Unique-object counting by tracking id.
//!
//! An id seen in two consecutive cycles is the same object and is counted
//! once, when it first appears. There is no re-identification: an id that
//! drops out for a cycle and comes back is counted again, and a cycle with
//! no ids at all resets continuity.

use std::collections::BTreeSet;

#[derive(Debug, Default)]
pub struct TrackedIdRegistry {
    previous: BTreeSet<u64>,
}

impl TrackedIdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record this cycle's ids and return how many were not in the last one.
    pub fn observe(&mut self, current: BTreeSet<u64>) -> u64 {
        let new = current.difference(&self.previous).count() as u64;
        self.previous = current;
        new
    }

    pub fn previous(&self) -> &BTreeSet<u64> {
        &self.previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[u64]) -> BTreeSet<u64> {
        values.iter().copied().collect()
    }

    #[test]
    fn counts_only_ids_missing_from_previous_cycle() {
        let mut registry = TrackedIdRegistry::new();
        assert_eq!(registry.observe(ids(&[1, 2])), 2);
        assert_eq!(registry.observe(ids(&[1, 2, 3])), 1);
        assert_eq!(registry.observe(ids(&[3, 4])), 1);
        assert_eq!(registry.previous(), &ids(&[3, 4]));
    }

    #[test]
    fn empty_cycle_resets_continuity() {
        let mut registry = TrackedIdRegistry::new();
        assert_eq!(registry.observe(ids(&[7])), 1);
        assert_eq!(registry.observe(BTreeSet::new()), 0);
        assert_eq!(registry.observe(ids(&[7])), 1);
    }
}
