use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counting gate capping concurrent connections. The acceptor calls
/// `count_up_or_await` before accept(2) and blocks at the limit; closing a
/// connection calls `count_down`. `release_all` lets every waiter through
/// so shutdown never deadlocks on a full endpoint.
struct LatchState {
    count: i64,
    released: bool,
}

pub struct LimitLatch {
    limit: i64,
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl LimitLatch {
    pub fn new(limit: i64) -> Self {
        Self {
            limit,
            state: Mutex::new(LatchState {
                count: 0,
                released: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Permits not currently held.
    pub fn available(&self) -> i64 {
        self.limit - self.state.lock().unwrap().count
    }

    pub fn current(&self) -> i64 {
        self.state.lock().unwrap().count
    }

    /// Acquire a permit, blocking at the limit. Returns false when the
    /// latch has been released (no permit held; caller should observe the
    /// endpoint stopping).
    pub fn count_up_or_await(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.released {
                return false;
            }
            if state.count < self.limit {
                state.count += 1;
                return true;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Return one permit.
    pub fn count_down(&self) -> i64 {
        let mut state = self.state.lock().unwrap();
        if state.count > 0 {
            state.count -= 1;
        }
        let value = state.count;
        drop(state);
        self.cond.notify_one();
        value
    }

    /// Let all current and future waiters through.
    pub fn release_all(&self) {
        self.state.lock().unwrap().released = true;
        self.cond.notify_all();
    }
}

/// One-or-more-shot countdown used to wait for the poller to exit.
pub struct StopLatch {
    count: Mutex<u32>,
    cond: Condvar,
}

impl StopLatch {
    pub fn new(count: u32) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
        }
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    /// Wait for the count to reach zero, bounded. Returns false on timeout.
    pub fn await_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.cond.wait_timeout(count, deadline - now).unwrap();
            count = guard;
            if result.timed_out() && *count > 0 {
                return false;
            }
        }
        true
    }
}

/// Boolean gate the acceptor parks on while the endpoint is paused.
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new(open: bool) -> Self {
        Self {
            open: Mutex::new(open),
            cond: Condvar::new(),
        }
    }

    pub fn set_open(&self, value: bool) {
        *self.open.lock().unwrap() = value;
        if value {
            self.cond.notify_all();
        }
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap()
    }

    /// Block until the gate opens, re-checking every 50ms so a concurrent
    /// stop (which opens the gate) is never missed.
    pub fn await_open(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            let (guard, _) = self
                .cond
                .wait_timeout(open, Duration::from_millis(50))
                .unwrap();
            open = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn latch_blocks_at_limit_and_resumes_on_count_down() {
        let latch = Arc::new(LimitLatch::new(2));
        assert!(latch.count_up_or_await());
        assert!(latch.count_up_or_await());
        assert_eq!(latch.available(), 0);

        let latch2 = latch.clone();
        let waiter = thread::spawn(move || latch2.count_up_or_await());
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        latch.count_down();
        assert!(waiter.join().unwrap());
        assert_eq!(latch.available(), 0);
    }

    #[test]
    fn release_all_unblocks_waiters_without_permits() {
        let latch = Arc::new(LimitLatch::new(1));
        assert!(latch.count_up_or_await());

        let latch2 = latch.clone();
        let waiter = thread::spawn(move || latch2.count_up_or_await());
        thread::sleep(Duration::from_millis(50));
        latch.release_all();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn stop_latch_times_out_then_succeeds() {
        let latch = Arc::new(StopLatch::new(1));
        assert!(!latch.await_for(Duration::from_millis(20)));
        let latch2 = latch.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            latch2.count_down();
        });
        assert!(latch.await_for(Duration::from_secs(2)));
    }

    #[test]
    fn gate_parks_until_opened() {
        let gate = Arc::new(Gate::new(false));
        let gate2 = gate.clone();
        let t = thread::spawn(move || gate2.await_open());
        thread::sleep(Duration::from_millis(30));
        gate.set_open(true);
        t.join().unwrap();
    }
}
