/*!
timing.rs - The timing wheel: deterministic countdown timers on one clock.

Overview
========
A fixed array of up to eight timer slots shares a single monotonic tick
counter. Each slot holds a signed countdown in host ticks (2 MHz: twice the
1 MHz peripheral rate), a `ticking` flag and a `firing` flag. The wheel
caches a single `countdown` equal to the minimum of all ticking+firing
timers, so the CPU engines can decrement one value per instruction and
branch on sign.

Invariant: after any mutation,
    countdown == min{ timings[i] | ticking[i] && firing[i] }
(with `i64::MAX` for the empty set).

A ticking timer whose `firing` flag is clear may decrement indefinitely
below zero (a VIA timer running with its interrupt already latched does
exactly this); readers normalize such values by computing elapsed latch
reloads.

Callback dispatch
=================
Slots carry no callback pointers. `register()` hands out a slot id and the
owner of the wheel matches fired ids against the ids its peripherals
registered. `advance_with` drives the wheel to a new countdown value and
invokes the supplied closure for every timer that reaches exactly zero;
the closure may mutate the wheel (stop, re-arm, adjust) and the minimum is
recomputed after every call.

Failure model: no errors. Misuse trips an assertion.
*/

pub type TimerId = usize;

/// Upper bound on registered timers; the machine uses six.
pub const NUM_TIMERS: usize = 8;

pub struct TimingWheel {
    tick_rate: u32,
    max_timer: usize,
    in_use: [bool; NUM_TIMERS],
    timings: [i64; NUM_TIMERS],
    ticking: [bool; NUM_TIMERS],
    firing: [bool; NUM_TIMERS],
    total_ticks: u64,
    countdown: i64,
}

impl TimingWheel {
    pub fn new(tick_rate: u32) -> TimingWheel {
        TimingWheel {
            tick_rate,
            max_timer: 0,
            in_use: [false; NUM_TIMERS],
            timings: [0; NUM_TIMERS],
            ticking: [false; NUM_TIMERS],
            firing: [false; NUM_TIMERS],
            total_ticks: 0,
            countdown: i64::MAX,
        }
    }

    #[inline]
    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    /// Total ticks ever advanced; the machine's notion of "now".
    #[inline]
    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    #[inline]
    pub fn countdown(&self) -> i64 {
        self.countdown
    }

    /// Allocate a timer slot. Slots start stopped, value 0, firing enabled.
    pub fn register(&mut self) -> TimerId {
        let id = (0..NUM_TIMERS)
            .find(|&i| !self.in_use[i])
            .expect("out of timer ids");
        self.in_use[id] = true;
        self.max_timer = self.max_timer.max(id + 1);
        self.timings[id] = 0;
        self.ticking[id] = false;
        self.firing[id] = true;
        id
    }

    fn recalculate(&mut self) {
        let mut countdown = i64::MAX;
        for i in 0..self.max_timer {
            if self.ticking[i] && self.firing[i] {
                countdown = countdown.min(self.timings[i]);
            }
        }
        self.countdown = countdown;
    }

    /// Start a stopped timer at its current value.
    pub fn start(&mut self, id: TimerId) -> i64 {
        let value = self.timings[id];
        self.start_with_value(id, value)
    }

    /// Start a stopped timer with a fresh value.
    pub fn start_with_value(&mut self, id: TimerId, value: i64) -> i64 {
        assert!(self.in_use[id]);
        assert!(!self.ticking[id]);

        self.timings[id] = value;
        self.ticking[id] = true;

        // No full recalculation needed: the new timer can only pull the
        // minimum down.
        if self.firing[id] && value < self.countdown {
            self.countdown = value;
        }
        self.countdown
    }

    pub fn stop(&mut self, id: TimerId) -> i64 {
        assert!(self.in_use[id]);
        assert!(self.ticking[id]);

        self.ticking[id] = false;
        self.recalculate();
        self.countdown
    }

    #[inline]
    pub fn is_running(&self, id: TimerId) -> bool {
        assert!(self.in_use[id]);
        self.ticking[id]
    }

    #[inline]
    pub fn value(&self, id: TimerId) -> i64 {
        assert!(self.in_use[id]);
        self.timings[id]
    }

    pub fn set_value(&mut self, id: TimerId, value: i64) -> i64 {
        assert!(self.in_use[id]);
        self.timings[id] = value;
        self.recalculate();
        self.countdown
    }

    /// Add `delta` to a timer; returns (new timer value, new countdown).
    pub fn adjust_value(&mut self, id: TimerId, delta: i64) -> (i64, i64) {
        assert!(self.in_use[id]);
        let value = self.timings[id] + delta;
        self.timings[id] = value;
        self.recalculate();
        (value, self.countdown)
    }

    #[inline]
    pub fn firing(&self, id: TimerId) -> bool {
        assert!(self.in_use[id]);
        self.firing[id]
    }

    pub fn set_firing(&mut self, id: TimerId, firing: bool) {
        assert!(self.in_use[id]);
        self.firing[id] = firing;
        self.recalculate();
    }

    /// First timer sitting at exactly zero with ticking+firing set, if any.
    fn expired(&self) -> Option<TimerId> {
        (0..self.max_timer)
            .find(|&i| self.ticking[i] && self.firing[i] && self.timings[i] == 0)
    }

    /// Decrement every ticking timer by `delta` ticks. `delta` must not
    /// step a firing timer past zero.
    fn do_advance(&mut self, delta: u64) {
        for i in 0..self.max_timer {
            if !self.ticking[i] {
                continue;
            }
            self.timings[i] -= delta as i64;
            if self.firing[i] {
                debug_assert!(self.timings[i] >= 0);
            }
        }
        self.total_ticks += delta;
        self.recalculate();
    }

    /// Advance the wheel to `new_countdown` (the caller has decremented the
    /// shared countdown externally), firing every timer that reaches zero.
    ///
    /// `fired` may mutate the wheel; it must leave the fired timer either
    /// stopped, non-firing, or re-armed to a positive value. Returns the
    /// recomputed countdown.
    pub fn advance_with(
        &mut self,
        new_countdown: i64,
        mut fired: impl FnMut(&mut TimingWheel, TimerId),
    ) -> i64 {
        assert!(new_countdown <= self.countdown);
        let mut delta = (self.countdown - new_countdown) as u64;

        loop {
            let mut fires_this_instant = 0u32;
            while let Some(id) = self.expired() {
                fired(self, id);
                self.recalculate();
                fires_this_instant += 1;
                assert!(
                    fires_this_instant < 256,
                    "timer callback failed to re-arm slot"
                );
            }
            if delta == 0 {
                break;
            }
            // Advance in chunks no larger than the next expiry.
            let step = if self.countdown == i64::MAX {
                delta
            } else {
                delta.min(self.countdown as u64)
            };
            self.do_advance(step);
            delta -= step;
        }
        self.countdown
    }

    /// Assert the cached-minimum invariant (test hook).
    #[cfg(test)]
    pub fn check_countdown_invariant(&self) {
        let mut countdown = i64::MAX;
        for i in 0..self.max_timer {
            if self.ticking[i] && self.firing[i] {
                countdown = countdown.min(self.timings[i]);
            }
        }
        assert_eq!(self.countdown, countdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_countdown() {
        let mut wheel = TimingWheel::new(2_000_000);
        assert_eq!(wheel.countdown(), i64::MAX);

        let t0 = wheel.register();
        let t1 = wheel.register();
        assert_ne!(t0, t1);

        wheel.start_with_value(t0, 100);
        assert_eq!(wheel.countdown(), 100);
        wheel.start_with_value(t1, 60);
        assert_eq!(wheel.countdown(), 60);
        wheel.check_countdown_invariant();

        wheel.stop(t1);
        assert_eq!(wheel.countdown(), 100);
        wheel.check_countdown_invariant();
    }

    #[test]
    fn advance_fires_at_zero() {
        let mut wheel = TimingWheel::new(2_000_000);
        let t0 = wheel.register();
        wheel.start_with_value(t0, 10);

        let mut fires = Vec::new();
        let countdown = wheel.countdown() - 10;
        wheel.advance_with(countdown, |w, id| {
            fires.push((id, w.total_ticks()));
            w.stop(id);
        });
        assert_eq!(fires, vec![(t0, 10)]);
        assert_eq!(wheel.countdown(), i64::MAX);
        assert_eq!(wheel.total_ticks(), 10);
    }

    #[test]
    fn fires_in_time_order_across_slots() {
        let mut wheel = TimingWheel::new(2_000_000);
        let t0 = wheel.register();
        let t1 = wheel.register();
        wheel.start_with_value(t0, 30);
        wheel.start_with_value(t1, 20);

        let mut fires = Vec::new();
        let target = wheel.countdown() - 40;
        wheel.advance_with(target, |w, id| {
            fires.push((id, w.total_ticks()));
            w.stop(id);
        });
        assert_eq!(fires, vec![(t1, 20), (t0, 30)]);
        assert_eq!(wheel.total_ticks(), 40);
    }

    #[test]
    fn callback_rearm_continues_firing() {
        let mut wheel = TimingWheel::new(2_000_000);
        let t0 = wheel.register();
        wheel.start_with_value(t0, 8);

        // Periodic re-arm every 8 ticks: expect fires at 8, 16, 24.
        let mut fires = Vec::new();
        let target = wheel.countdown() - 25;
        wheel.advance_with(target, |w, id| {
            fires.push(w.total_ticks());
            w.adjust_value(id, 8);
        });
        assert_eq!(fires, vec![8, 16, 24]);
        assert_eq!(wheel.value(t0), 7);
        wheel.check_countdown_invariant();
    }

    #[test]
    fn non_firing_timer_decrements_below_zero() {
        let mut wheel = TimingWheel::new(2_000_000);
        let t0 = wheel.register();
        let t1 = wheel.register();
        wheel.start_with_value(t0, 5);
        wheel.set_firing(t0, false);
        wheel.start_with_value(t1, 100);

        let target = wheel.countdown() - 50;
        wheel.advance_with(target, |_, _| panic!("nothing should fire"));
        assert_eq!(wheel.value(t0), -45);
        assert_eq!(wheel.value(t1), 50);
        wheel.check_countdown_invariant();
    }

    #[test]
    fn set_value_recomputes_minimum() {
        let mut wheel = TimingWheel::new(2_000_000);
        let t0 = wheel.register();
        let t1 = wheel.register();
        wheel.start_with_value(t0, 100);
        wheel.start_with_value(t1, 200);

        wheel.set_value(t1, 40);
        assert_eq!(wheel.countdown(), 40);
        let (value, countdown) = wheel.adjust_value(t1, 500);
        assert_eq!(value, 540);
        assert_eq!(countdown, 100);
        wheel.check_countdown_invariant();
    }

    #[test]
    fn disable_firing_excludes_from_minimum() {
        let mut wheel = TimingWheel::new(2_000_000);
        let t0 = wheel.register();
        let t1 = wheel.register();
        wheel.start_with_value(t0, 10);
        wheel.start_with_value(t1, 90);

        wheel.set_firing(t0, false);
        assert_eq!(wheel.countdown(), 90);
        wheel.set_firing(t0, true);
        assert_eq!(wheel.countdown(), 10);
    }
}
