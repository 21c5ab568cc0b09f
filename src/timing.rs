//! Worker clocks.
//!
//! Three clocks per worker: start time, pause start, idle start. Pauses and
//! idle periods are folded back into the start time so ticks-per-second only
//! measures active work.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct WorkerTimers {
    start: Instant,
    pause_since: Option<Instant>,
    idle_since: Option<Instant>,
    ticks: u64,
}

impl Default for WorkerTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerTimers {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            pause_since: None,
            idle_since: None,
            ticks: 0,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn add_tick(&mut self) {
        self.ticks += 1;
    }

    /// Counter adjustment after a warp, so progress never goes negative.
    pub fn add_ticks(&mut self, n: u64) {
        self.ticks += n;
    }

    pub fn on_pause(&mut self) {
        if self.pause_since.is_none() {
            self.pause_since = Some(Instant::now());
        }
    }

    /// Fold the pause into the idle clock when the worker was idling, into
    /// the start clock otherwise, so the pause never counts as active time.
    pub fn on_unpause(&mut self) {
        if let Some(paused_at) = self.pause_since.take() {
            let paused_for = paused_at.elapsed();

            match self.idle_since {
                Some(idle_at) => self.idle_since = Some(idle_at + paused_for),
                None => self.start += paused_for,
            }
        }
    }

    /// Mark the beginning of an idle period (no URLs available).
    pub fn idle_start(&mut self) {
        if self.idle_since.is_none() {
            self.idle_since = Some(Instant::now());
        }
    }

    pub fn is_idle(&self) -> bool {
        self.idle_since.is_some()
    }

    /// Idling stopped: subtract the idle period from active time.
    pub fn idle_stop(&mut self) {
        if let Some(idle_at) = self.idle_since.take() {
            self.start += idle_at.elapsed();
        }

        self.pause_since = None;
    }

    /// Account a known sleep (e.g. the HTTP rate limit) as idle time.
    pub fn add_idle(&mut self, slept: Duration) {
        self.start += slept;
    }

    /// Active seconds since start, with pauses and idling subtracted.
    pub fn active_secs(&self) -> f64 {
        let mut start = self.start;

        // fold any open pause or idle period as if it ended now
        if let Some(paused_at) = self.pause_since {
            start += paused_at.elapsed();
        }

        if let Some(idle_at) = self.idle_since {
            start += idle_at.elapsed();
        }

        start.elapsed().as_secs_f64()
    }

    /// Average ticks per second over active time.
    pub fn ticks_per_sec(&self) -> f64 {
        let secs = self.active_secs();

        if secs > 0.0 { self.ticks as f64 / secs } else { 0.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn ticks_per_second_counts_active_time_only() {
        let mut timers = WorkerTimers::new();

        timers.add_tick();
        timers.add_tick();

        sleep(Duration::from_millis(20));

        let active_before = timers.active_secs();

        timers.idle_start();
        sleep(Duration::from_millis(30));
        timers.idle_stop();

        // the idle period is subtracted
        assert!(timers.active_secs() < active_before + 0.02);
        assert!(timers.ticks_per_sec() > 0.0);
    }

    #[test]
    fn pause_during_idle_extends_the_idle_clock() {
        let mut timers = WorkerTimers::new();

        timers.idle_start();
        timers.on_pause();
        sleep(Duration::from_millis(20));
        timers.on_unpause();
        timers.idle_stop();

        assert!(timers.active_secs() < 0.02);
    }

    #[test]
    fn warp_adjusts_the_tick_counter() {
        let mut timers = WorkerTimers::new();

        timers.add_ticks(5);

        assert_eq!(timers.ticks(), 5);
    }
}
