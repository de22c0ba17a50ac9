//! Global tick clock.
//!
//! A dedicated worker thread advances a monotonic tick counter at a fixed
//! wall-clock cadence (10 ms by default). Everything that consumes time in
//! the emulator (instruction delays, `SLEEP`, idle scheduler loops) waits
//! on clock edges rather than on wall-clock durations, so the whole system
//! runs in tick time.
//!
//! The clock is handed around as `Arc<Clock>` rather than accessed as a
//! global, so tests can drive a stopped clock deterministically with
//! [`Clock::advance`] or run a fast ticker via
//! [`Clock::start_with_period`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default wall-clock period of one tick.
pub const TICK_PERIOD: Duration = Duration::from_millis(10);

/// Monotonic tick counter with edge-wait support.
pub struct Clock {
    /// Current tick count. Reads are lock-free; increments happen under
    /// `edge_lock` so waiters cannot miss an edge.
    ticks: AtomicU64,
    /// Guards the increment and the condvar wait.
    edge_lock: Mutex<()>,
    /// Signalled on every tick edge.
    edge: Condvar,
    /// Whether the ticker thread should keep running.
    running: AtomicBool,
    /// The ticker thread, if started.
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Clock {
    /// Create a stopped clock at tick zero.
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            edge_lock: Mutex::new(()),
            edge: Condvar::new(),
            running: AtomicBool::new(false),
            ticker: Mutex::new(None),
        }
    }

    /// Start the ticker thread at the default period.
    pub fn start(self: &Arc<Self>) {
        self.start_with_period(TICK_PERIOD);
    }

    /// Start the ticker thread with a custom period. Used by tests to run
    /// the emulator in fast-forward. Starting an already running clock is
    /// a no-op.
    pub fn start_with_period(self: &Arc<Self>, period: Duration) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let clock = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("clock".into())
            .spawn(move || {
                while clock.running.load(Ordering::SeqCst) {
                    // Sleeping first keeps the ticker from burning a core;
                    // the counter only ever moves forward, one edge at a
                    // time.
                    thread::sleep(period);
                    clock.advance();
                }
            })
            .expect("failed to spawn clock thread");

        *self.ticker.lock().unwrap() = Some(handle);
    }

    /// Advance the counter by one edge and wake every waiter.
    ///
    /// Called by the ticker thread; also public so tests can step a
    /// stopped clock by hand.
    pub fn advance(&self) {
        {
            let _guard = self.edge_lock.lock().unwrap();
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
        self.edge.notify_all();
    }

    /// Current tick count.
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Block until the counter has advanced by at least `n` edges from the
    /// value observed at call entry. `wait(0)` returns immediately;
    /// `wait(n)` for `n >= 1` always sleeps through at least one edge.
    /// All waiters of the same edge wake together.
    pub fn wait(&self, n: u64) {
        if n == 0 {
            return;
        }

        let mut guard = self.edge_lock.lock().unwrap();
        for _ in 0..n {
            let current = self.now();
            while self.now() == current {
                guard = self.edge.wait(guard).unwrap();
            }
        }
    }

    /// Stop and join the ticker thread. Waiters already blocked in
    /// [`Clock::wait`] are not woken by this; the owner must stop all
    /// waiting workers before stopping their clock.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.ticker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_clock_at_zero() {
        let clock = Clock::new();
        assert_eq!(clock.now(), 0);
    }

    #[test]
    fn test_advance_increments() {
        let clock = Clock::new();
        clock.advance();
        clock.advance();
        assert_eq!(clock.now(), 2);
    }

    #[test]
    fn test_wait_zero_returns_immediately() {
        let clock = Clock::new();
        // Would deadlock if wait(0) touched the condvar.
        clock.wait(0);
        assert_eq!(clock.now(), 0);
    }

    #[test]
    fn test_wait_wakes_on_edges() {
        let clock = Arc::new(Clock::new());

        let waiter = {
            let clock = Arc::clone(&clock);
            thread::spawn(move || {
                clock.wait(3);
                clock.now()
            })
        };

        // Drive more edges than the waiter needs so a slow thread start
        // cannot strand it.
        for _ in 0..8 {
            thread::sleep(Duration::from_millis(5));
            clock.advance();
        }

        let seen = waiter.join().expect("waiter panicked");
        assert!(seen >= 3);
    }

    #[test]
    fn test_multiple_waiters_wake_on_same_edge() {
        let clock = Arc::new(Clock::new());
        let barrier = Arc::new(std::sync::Barrier::new(5));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    clock.wait(1);
                    clock.now()
                })
            })
            .collect();

        barrier.wait();
        // Give every waiter time to block on the edge before the single
        // edge fires.
        thread::sleep(Duration::from_millis(50));
        clock.advance();

        for waiter in waiters {
            assert_eq!(waiter.join().expect("waiter panicked"), 1);
        }
    }

    #[test]
    fn test_ticker_advances() {
        let clock = Arc::new(Clock::new());
        clock.start_with_period(Duration::from_millis(1));
        clock.wait(5);
        assert!(clock.now() >= 5);
        clock.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let clock = Arc::new(Clock::new());
        clock.start_with_period(Duration::from_millis(1));
        clock.stop();
        clock.stop();
    }
}
