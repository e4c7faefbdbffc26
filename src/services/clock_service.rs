/// Edit clocks for visual fields
///
/// Local edits carry a hybrid logical clock; server records only have a
/// modification time, which becomes a clock owned by [`SERVER_DEVICE`].
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Tie-breaker for clocks built from server timestamps
pub const SERVER_DEVICE: &str = "server";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HybridLogicalClock {
    pub ts: i64,              // Wall-clock timestamp (milliseconds since epoch)
    pub logical_counter: u32, // Orders edits within one millisecond
    pub device_id: String,    // Tie-breaker for deterministic ordering
}

impl HybridLogicalClock {
    pub fn new(device_id: String) -> Self {
        Self::at(chrono::Utc::now().timestamp_millis(), device_id)
    }

    pub fn at(ts: i64, device_id: String) -> Self {
        Self {
            ts,
            logical_counter: 0,
            device_id,
        }
    }

    /// Clock for a server record modified at `ts`
    pub fn from_server(ts: i64) -> Self {
        Self::at(ts, SERVER_DEVICE.to_string())
    }

    /// Moves to the wall clock, or one logical step if it has not advanced
    pub fn tick(&mut self) {
        let now = chrono::Utc::now().timestamp_millis();
        if now > self.ts {
            self.ts = now;
            self.logical_counter = 0;
        } else {
            self.logical_counter += 1;
        }
    }
}

impl PartialOrd for HybridLogicalClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HybridLogicalClock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ts
            .cmp(&other.ts)
            .then_with(|| self.logical_counter.cmp(&other.logical_counter))
            .then_with(|| self.device_id.cmp(&other.device_id))
    }
}

/// Clock for the next local edit of a record, never behind `previous`
pub fn next_local_clock(previous: Option<&HybridLogicalClock>, device_id: &str) -> HybridLogicalClock {
    let mut clock = match previous {
        Some(prev) => {
            let mut c = prev.clone();
            c.device_id = device_id.to_string();
            c
        }
        None => HybridLogicalClock::new(device_id.to_string()),
    };
    clock.tick();
    clock
}

/// Clock of a stored row; rows written before clocks existed fall back to
/// their update time
pub fn row_clock(clock: Option<&HybridLogicalClock>, updated_at: i64) -> HybridLogicalClock {
    clock
        .cloned()
        .unwrap_or_else(|| HybridLogicalClock::at(updated_at, String::new()))
}

/// Last writer wins; a tie keeps the local edit
pub fn server_wins(local: &HybridLogicalClock, server: &HybridLogicalClock) -> bool {
    server > local
}

/// The later of two clocks, for a row that merged both
pub fn latest(a: Option<HybridLogicalClock>, b: HybridLogicalClock) -> HybridLogicalClock {
    match a {
        Some(a) if a > b => a,
        _ => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_local_clock_is_monotonic() {
        let future = HybridLogicalClock {
            ts: chrono::Utc::now().timestamp_millis() + 60_000,
            logical_counter: 2,
            device_id: "other".to_string(),
        };

        let next = next_local_clock(Some(&future), "device1");
        assert!(next > future);
        assert_eq!(next.logical_counter, 3);
        assert_eq!(next.device_id, "device1");
    }

    #[test]
    fn test_server_wins_only_when_newer() {
        let local = HybridLogicalClock::at(1000, "device1".to_string());

        assert!(server_wins(&local, &HybridLogicalClock::from_server(2000)));
        assert!(!server_wins(&local, &HybridLogicalClock::from_server(500)));
        // Same millisecond: "server" sorts after "device1"
        assert!(server_wins(&local, &HybridLogicalClock::from_server(1000)));
    }

    #[test]
    fn test_row_clock_falls_back_to_update_time() {
        let clock = row_clock(None, 4242);
        assert_eq!(clock.ts, 4242);
        assert!(clock < HybridLogicalClock::from_server(4242));

        let stored = HybridLogicalClock::at(10, "d".to_string());
        assert_eq!(row_clock(Some(&stored), 4242), stored);
    }

    #[test]
    fn test_latest() {
        let old = HybridLogicalClock::from_server(1);
        let new = HybridLogicalClock::from_server(2);
        assert_eq!(latest(Some(new.clone()), old.clone()), new);
        assert_eq!(latest(None, old.clone()), old);
    }
}
