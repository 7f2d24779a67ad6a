//! Role scheduler: collision-free placement of role events on the ticker.
//!
//! The "advanced placement" pass (`SCHED_ADVANCED` in the reference controller) is modeled as
//! a pure function over a snapshot of scheduled slots rather than as a live iteration over
//! ticker callbacks, per the crate's Design Notes on replacing closures with explicit data.

use crate::ticker::Slot;
use crate::time::{Duration, Instant};

/// Outcome of [`find_free_slot`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Placement {
    /// The anchor point to use for the new event, guaranteed not to overlap any slot in
    /// `existing`.
    pub anchor: Instant,

    /// Whether the requested anchor had to be pushed back to avoid a collision.
    pub moved: bool,
}

/// Finds a free slot of length `want_slot` starting no earlier than `want_anchor`, given a set
/// of already-scheduled `existing` slots.
///
/// This implements the reference controller's `SCHED_ADVANCED` collision search: starting from
/// the desired anchor, repeatedly check whether it overlaps any existing reservation and, if
/// so, move past that reservation's end and retry.
pub fn find_free_slot(want_anchor: Instant, want_slot: Duration, existing: &[Slot]) -> Placement {
    let mut anchor = want_anchor;
    let mut moved = false;

    // Existing has at most a handful of connections (bounded by ControllerConfig::max_connections),
    // so a fixed number of passes over it is enough to converge.
    for _ in 0..existing.len() + 1 {
        let mut collided = false;
        for slot in existing {
            let slot_end = slot.anchor + Duration::from_micros(slot.slot.as_micros());
            if overlaps(anchor, want_slot, slot.anchor, slot_end - slot.anchor) {
                anchor = slot_end;
                moved = true;
                collided = true;
            }
        }
        if !collided {
            break;
        }
    }

    Placement { anchor, moved }
}

/// Returns whether two `[start, start+len)` windows overlap, using wraparound-safe arithmetic.
fn overlaps(a_start: Instant, a_len: Duration, b_start: Instant, b_len: Duration) -> bool {
    let a_end = a_start + a_len;
    let b_end = b_start + b_len;
    // a overlaps b unless a ends before b starts or b ends before a starts.
    !(a_end.raw_micros().wrapping_sub(b_start.raw_micros()) >= (1 << 31)
        || b_end.raw_micros().wrapping_sub(a_start.raw_micros()) >= (1 << 31))
}

/// Decides whether two connections with equal `conn_interval` that have drifted into overlap
/// should have a spontaneous connection-parameter-request issued against the later one.
///
/// Returns `true` if `later` should shift its anchor away from `earlier` via a
/// connection-parameter-request (see `spec.md` §4.5.1). Only meaningful when both
/// connections share the same interval, since otherwise normal drift correction will resolve
/// the collision on its own over subsequent events.
pub fn should_request_shift(interval_a: Duration, interval_b: Duration) -> bool {
    interval_a == interval_b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticker::TickerId;

    fn slot(anchor_us: u32, len_us: u32) -> Slot {
        Slot {
            id: TickerId(0),
            anchor: Instant::from_raw_micros(anchor_us),
            period: crate::time::Ticks::from_micros(7_500),
            slot: crate::time::Ticks::from_micros(len_us),
        }
    }

    #[test]
    fn no_collision_keeps_anchor() {
        let existing = [slot(0, 1_000)];
        let placement = find_free_slot(Instant::from_raw_micros(5_000), Duration::from_micros(500), &existing);
        assert_eq!(placement.anchor.raw_micros(), 5_000);
        assert!(!placement.moved);
    }

    #[test]
    fn collision_pushes_anchor_past_existing_slot() {
        let existing = [slot(1_000, 2_000)];
        let placement = find_free_slot(Instant::from_raw_micros(1_500), Duration::from_micros(500), &existing);
        assert!(placement.moved);
        assert_eq!(placement.anchor.raw_micros(), 3_000);
    }

    #[test]
    fn equal_interval_overlap_requests_shift() {
        assert!(should_request_shift(
            Duration::from_millis(30),
            Duration::from_millis(30)
        ));
        assert!(!should_request_shift(
            Duration::from_millis(30),
            Duration::from_millis(50)
        ));
    }
}
