//! Rotation policies: when the active file should be sealed and a new one
//! opened. A closed set of tagged variants, grounded on `rotation.py`'s
//! `RotationStrategy` hierarchy.

/// Decides whether the active file should be rotated, given its current
/// size, entry count, and the timestamp of the write that just happened.
///
/// `Time` carries mutable state (`last_rotation_time_ms`) because it must
/// remember when it last fired; `should_rotate` therefore takes `&mut self`.
#[derive(Debug, Clone)]
pub enum RotationPolicy {
    /// Never rotates. The default.
    None,
    /// Rotates once the active file reaches `max_bytes`.
    Size { max_bytes: u64 },
    /// Rotates once the active file holds `max_entries` records.
    EntryCount { max_entries: u64 },
    /// Rotates once `interval_ms` has elapsed since the last rotation.
    /// Uninitialized on construction: the first observation only seeds the
    /// clock and never itself triggers.
    Time { interval_ms: u64, last_rotation_time_ms: Option<u64> },
    /// Rotates if any member policy would rotate. Short-circuits like `any()`,
    /// so a later member's side effects (e.g. a `Time` policy's clock) are
    /// only observed if evaluation reaches it.
    Composite(Vec<RotationPolicy>),
}

impl RotationPolicy {
    pub fn time(interval_ms: u64) -> RotationPolicy {
        RotationPolicy::Time { interval_ms, last_rotation_time_ms: None }
    }

    pub fn should_rotate(
        &mut self,
        current_size_bytes: u64,
        current_entry_count: u64,
        last_write_time_ms: u64,
    ) -> bool {
        match self {
            RotationPolicy::None => false,
            RotationPolicy::Size { max_bytes } => current_size_bytes >= *max_bytes,
            RotationPolicy::EntryCount { max_entries } => current_entry_count >= *max_entries,
            RotationPolicy::Time { interval_ms, last_rotation_time_ms } => {
                match *last_rotation_time_ms {
                    None => {
                        *last_rotation_time_ms = Some(last_write_time_ms);
                        false
                    }
                    Some(last) => {
                        if last_write_time_ms.saturating_sub(last) >= *interval_ms {
                            *last_rotation_time_ms = Some(last_write_time_ms);
                            true
                        } else {
                            false
                        }
                    }
                }
            }
            RotationPolicy::Composite(policies) => policies
                .iter_mut()
                .any(|p| p.should_rotate(current_size_bytes, current_entry_count, last_write_time_ms)),
        }
    }
}

impl Default for RotationPolicy {
    fn default() -> Self {
        RotationPolicy::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_never_rotates() {
        let mut p = RotationPolicy::None;
        assert!(!p.should_rotate(u64::MAX, u64::MAX, u64::MAX));
    }

    #[test]
    fn size_triggers_at_threshold() {
        let mut p = RotationPolicy::Size { max_bytes: 100 };
        assert!(!p.should_rotate(99, 0, 0));
        assert!(p.should_rotate(100, 0, 0));
        assert!(p.should_rotate(101, 0, 0));
    }

    #[test]
    fn entry_count_triggers_at_threshold() {
        let mut p = RotationPolicy::EntryCount { max_entries: 5 };
        assert!(!p.should_rotate(0, 4, 0));
        assert!(p.should_rotate(0, 5, 0));
    }

    #[test]
    fn time_initializes_then_triggers_on_interval() {
        let mut p = RotationPolicy::time(1000);
        // First observation only seeds the clock.
        assert!(!p.should_rotate(0, 0, 10_000));
        assert!(!p.should_rotate(0, 0, 10_500));
        assert!(p.should_rotate(0, 0, 11_001));
        // Resets after triggering.
        assert!(!p.should_rotate(0, 0, 11_500));
        assert!(p.should_rotate(0, 0, 12_002));
    }

    #[test]
    fn composite_triggers_if_any_member_triggers() {
        let mut p = RotationPolicy::Composite(vec![
            RotationPolicy::Size { max_bytes: 1_000_000 },
            RotationPolicy::EntryCount { max_entries: 3 },
        ]);
        assert!(!p.should_rotate(10, 1, 0));
        assert!(p.should_rotate(10, 3, 0));
    }

    #[test]
    fn composite_of_none_never_rotates() {
        let mut p = RotationPolicy::Composite(vec![]);
        assert!(!p.should_rotate(u64::MAX, u64::MAX, u64::MAX));
    }
}
