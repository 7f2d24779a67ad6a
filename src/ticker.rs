//! Low-jitter periodic/one-shot timer abstraction.
//!
//! Real hardware usually backs this with a 32.768 kHz RTC-derived counter; [`SoftTicker`]
//! provides a plain software fallback suitable for hosts without such a peripheral and for
//! tests.

use crate::time::{Instant, Ticks};
use heapless::consts::U8;
use heapless::Vec;

/// Identifies a single scheduled role event slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TickerId(pub u8);

/// One scheduled slot: an anchor point plus the reservation length (`slot`) needed to run the
/// role event without colliding with a neighbour.
#[derive(Debug, Copy, Clone)]
pub struct Slot {
    pub id: TickerId,
    pub anchor: Instant,
    pub period: Ticks,
    pub slot: Ticks,
}

/// A low-jitter periodic/one-shot timer.
///
/// Mirrors the reference controller's ticker API (`ticker_start`/`ticker_stop`/
/// `ticker_update`/`ticker_next_slot_get`), generalized to a plain trait so the crate can run
/// against either a hardware RTC ticker or [`SoftTicker`].
pub trait Ticker {
    /// Returns the current monotonic tick count.
    fn ticks_now(&self) -> Ticks;

    /// Schedules (or reschedules) a periodic slot.
    ///
    /// `first` is the first anchor's absolute tick; `period` is zero for a one-shot.
    fn start(&mut self, id: TickerId, first: Instant, period: Ticks, slot: Ticks);

    /// Cancels a previously scheduled slot. No-op if `id` isn't scheduled.
    fn stop(&mut self, id: TickerId);

    /// Applies a drift correction to a scheduled slot's anchor, expressed as ticks to add
    /// (`drift_plus`) and subtract (`drift_minus`), plus a number of periods to skip
    /// (`lazy`, used when slave latency causes events to be skipped).
    fn update(&mut self, id: TickerId, drift_plus: Ticks, drift_minus: Ticks, lazy: u16);

    /// Finds the next scheduled slot starting at or after `from`, used by the role scheduler's
    /// advanced-placement pass to find collisions.
    fn next_slot_get(&self, from: Instant) -> Option<Slot>;
}

/// A software [`Ticker`] implementation backed by a small fixed-capacity list of slots.
///
/// Suitable for hosts without a hardware RTC ticker peripheral, and for tests driven by a
/// [`crate::time::Timer`] mock that doesn't actually sleep.
#[derive(Debug, Default)]
pub struct SoftTicker {
    slots: Vec<Slot, U8>,
}

impl SoftTicker {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    fn find_mut(&mut self, id: TickerId) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }
}

impl Ticker for SoftTicker {
    fn ticks_now(&self) -> Ticks {
        // A software ticker has no independent clock source; callers drive time forward
        // through their own `Timer` and only use this for relative arithmetic in tests.
        Ticks(0)
    }

    fn start(&mut self, id: TickerId, first: Instant, period: Ticks, slot: Ticks) {
        self.stop(id);
        let _ = self.slots.push(Slot {
            id,
            anchor: first,
            period,
            slot,
        });
    }

    fn stop(&mut self, id: TickerId) {
        if let Some(pos) = self.slots.iter().position(|s| s.id == id) {
            self.slots.swap_remove(pos);
        }
    }

    fn update(&mut self, id: TickerId, drift_plus: Ticks, drift_minus: Ticks, lazy: u16) {
        if let Some(slot) = self.find_mut(id) {
            let delta = Ticks::from_micros(
                Ticks::as_micros(drift_plus).saturating_sub(Ticks::as_micros(drift_minus)),
            );
            slot.anchor = slot.anchor + crate::time::Duration::from_micros(delta.as_micros());
            for _ in 0..lazy {
                slot.anchor = slot.anchor
                    + crate::time::Duration::from_micros(slot.period.as_micros());
            }
        }
    }

    fn next_slot_get(&self, from: Instant) -> Option<Slot> {
        self.slots
            .iter()
            .filter(|s| s.anchor.raw_micros().wrapping_sub(from.raw_micros()) < (1 << 31))
            .min_by_key(|s| s.anchor.raw_micros().wrapping_sub(from.raw_micros()))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_and_find_next_slot() {
        let mut ticker = SoftTicker::new();
        let anchor = Instant::from_raw_micros(1_000);
        ticker.start(TickerId(0), anchor, Ticks::from_micros(7_500), Ticks::from_micros(2_000));

        let found = ticker.next_slot_get(Instant::from_raw_micros(0)).unwrap();
        assert_eq!(found.id, TickerId(0));
        assert_eq!(found.anchor, anchor);
    }

    #[test]
    fn stop_removes_slot() {
        let mut ticker = SoftTicker::new();
        ticker.start(
            TickerId(1),
            Instant::from_raw_micros(0),
            Ticks::from_micros(1_000),
            Ticks::from_micros(100),
        );
        ticker.stop(TickerId(1));
        assert!(ticker.next_slot_get(Instant::from_raw_micros(0)).is_none());
    }
}
