//! Virtual-time clock with speed control and interruptible waits.
//!
//! Single source of truth for all simulation time within a session - NEVER
//! call system time from inside the replay loop. Generalizes the teacher
//! crate's `SimClock` (a plain monotonic counter) with the speed factor,
//! pause/resume, and condvar-based waiting the time engine needs.

use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Nanoseconds since an implementation-defined, session-stable epoch.
/// i64 gives ~292 years of range, sufficient for any replay window.
pub type Nanos = i64;

pub const NANOS_PER_MICRO: i64 = 1_000;
pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Engine run state. Distinct from `crate::engine::session::SessionStatus`:
/// this is purely about whether the clock advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Idle,
    Running,
    Paused,
    Stopped,
}

struct ClockInner {
    now: Nanos,
    /// Virtual seconds per wall second. 0 == unthrottled ("max speed").
    speed_factor: f64,
    state: ClockState,
    /// Monotonically increasing, bumped on every state/time/speed change so
    /// a sleeping waiter can detect it was woken for a reason other than
    /// elapsed time (pause, stop, jump).
    generation: u64,
}

/// Virtual clock: advances toward event timestamps at a configurable rate
/// and exposes interruptible waits for the replay thread.
///
/// # Determinism contract
/// - `now()` returns simulation time, never wall-clock time.
/// - `set_time` only moves forward while RUNNING; `pause`/`jump_to` may move
///   it to an arbitrary point because they represent a fresh start.
/// - All waiting is done through `wait_for_next_event`, which never busy-spins.
pub struct TimeEngine {
    inner: Mutex<ClockInner>,
    cv: Condvar,
}

impl TimeEngine {
    pub fn new(start_time: Nanos) -> Self {
        Self {
            inner: Mutex::new(ClockInner {
                now: start_time,
                speed_factor: 0.0,
                state: ClockState::Idle,
                generation: 0,
            }),
            cv: Condvar::new(),
        }
    }

    #[inline]
    pub fn now(&self) -> Nanos {
        self.inner.lock().unwrap().now
    }

    #[inline]
    pub fn state(&self) -> ClockState {
        self.inner.lock().unwrap().state
    }

    #[inline]
    pub fn speed_factor(&self) -> f64 {
        self.inner.lock().unwrap().speed_factor
    }

    /// Sets `T_v`. Legal (per the contract) only when not RUNNING, e.g.
    /// right after `pause()` or before `start()`; callers that violate this
    /// still succeed (the clock never panics on a caller mistake) but the
    /// replay thread is responsible for only calling it at legal points.
    pub fn set_time(&self, t: Nanos) {
        let mut inner = self.inner.lock().unwrap();
        inner.now = t;
        inner.generation += 1;
        self.cv.notify_all();
    }

    /// Updates the speed factor; takes effect immediately, including for a
    /// waiter currently sleeping on `wait_for_next_event` (the remaining
    /// virtual delta is rescaled against the new factor on the next poll).
    pub fn set_speed(&self, factor: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.speed_factor = factor.max(0.0);
        inner.generation += 1;
        self.cv.notify_all();
    }

    pub fn start(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ClockState::Running;
        inner.generation += 1;
        self.cv.notify_all();
    }

    /// Freezes `T_v` at its current value.
    pub fn pause(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ClockState::Running {
            inner.state = ClockState::Paused;
        }
        inner.generation += 1;
        self.cv.notify_all();
    }

    /// Resumes advancing from the frozen value.
    pub fn resume(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ClockState::Paused {
            inner.state = ClockState::Running;
        }
        inner.generation += 1;
        self.cv.notify_all();
    }

    /// Causes all current and future waits to return `false` immediately.
    /// Idempotent.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = ClockState::Stopped;
        inner.generation += 1;
        self.cv.notify_all();
    }

    /// Blocks until `T_v >= t_event` or the clock is stopped.
    ///
    /// - `speed_factor == 0`: sets `T_v := t_event` and returns `true`
    ///   immediately (no throttling).
    /// - `speed_factor > 0`: sleeps `(t_event - T_v) / speed_factor` of wall
    ///   time, re-checking after every wake so a concurrent `pause`,
    ///   `set_speed`, or `set_time` (jump) is honored without oversleeping.
    /// - Returns `false` if interrupted by `stop()` or a jump that raced the
    ///   wait (the caller should treat this as "re-evaluate, don't advance").
    pub fn wait_for_next_event(&self, t_event: Nanos) -> bool {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.state == ClockState::Stopped {
                return false;
            }
            if inner.now >= t_event {
                return true;
            }
            if inner.state == ClockState::Paused {
                // Park until resumed/stopped; the virtual delta remains
                // intact because `now` is untouched while paused.
                inner = self.cv.wait(inner).unwrap();
                continue;
            }

            let generation_before = inner.generation;
            if inner.speed_factor <= 0.0 {
                inner.now = t_event;
                inner.generation += 1;
                self.cv.notify_all();
                return true;
            }

            let delta_virtual_ns = (t_event - inner.now).max(0) as f64;
            let wall_wait = Duration::from_secs_f64(delta_virtual_ns / inner.speed_factor / NANOS_PER_SEC as f64);

            let wake_deadline = Instant::now() + wall_wait;
            let (guard, timeout) = self
                .cv
                .wait_timeout(inner, wall_wait.min(Duration::from_millis(50)))
                .unwrap();
            inner = guard;

            if inner.generation != generation_before {
                // Something changed state (pause/stop/set_speed/jump); loop
                // around and re-evaluate from scratch rather than trusting
                // the stale sleep duration.
                continue;
            }
            if timeout.timed_out() && Instant::now() >= wake_deadline && inner.state == ClockState::Running {
                inner.now = t_event;
                inner.generation += 1;
                self.cv.notify_all();
                return true;
            }
        }
    }
}

impl Default for TimeEngine {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for TimeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("TimeEngine")
            .field("now", &inner.now)
            .field("speed_factor", &inner.speed_factor)
            .field("state", &inner.state)
            .finish()
    }
}

/// Helper to convert a chrono `DateTime<Utc>` to `Nanos`.
#[inline]
pub fn datetime_to_nanos(dt: &chrono::DateTime<chrono::Utc>) -> Nanos {
    dt.timestamp_nanos_opt().unwrap_or(0)
}

/// Helper to convert `Nanos` to a chrono `DateTime<Utc>`.
#[inline]
pub fn nanos_to_datetime(nanos: Nanos) -> chrono::DateTime<chrono::Utc> {
    use chrono::TimeZone;
    let secs = nanos.div_euclid(NANOS_PER_SEC);
    let nsecs = nanos.rem_euclid(NANOS_PER_SEC) as u32;
    chrono::Utc.timestamp_opt(secs, nsecs).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn zero_speed_jumps_immediately() {
        let clock = TimeEngine::new(0);
        clock.start();
        assert!(clock.wait_for_next_event(5_000_000_000));
        assert_eq!(clock.now(), 5_000_000_000);
    }

    #[test]
    fn stop_unblocks_waiters() {
        let clock = Arc::new(TimeEngine::new(0));
        clock.start();
        clock.set_speed(1.0);
        let c2 = clock.clone();
        let handle = thread::spawn(move || c2.wait_for_next_event(NANOS_PER_SEC * 3600));
        thread::sleep(Duration::from_millis(20));
        clock.stop();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn pause_freezes_time() {
        let clock = TimeEngine::new(1_000_000_000);
        clock.start();
        clock.pause();
        assert_eq!(clock.state(), ClockState::Paused);
        assert_eq!(clock.now(), 1_000_000_000);
        clock.resume();
        assert_eq!(clock.state(), ClockState::Running);
    }

    #[test]
    fn set_time_wakes_waiters() {
        let clock = Arc::new(TimeEngine::new(0));
        clock.start();
        clock.set_speed(1.0);
        let c2 = clock.clone();
        let handle = thread::spawn(move || c2.wait_for_next_event(1_000));
        thread::sleep(Duration::from_millis(10));
        clock.set_time(1_000);
        assert!(handle.join().unwrap());
    }
}
