use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::error::{KilnError, KilnResult};
use crate::syscalls::{self, Epoll};

/// Interest a worker blocks on through the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Read,
    Write,
}

/// Bounded LIFO pool of secondary selectors. Workers that must block on a
/// read or write borrow one, wait for readiness with a deadline, and
/// return it. This keeps blocking worker I/O off the main poller's
/// selector.
pub struct SelectorPool {
    selectors: super::pools::SyncStack<Epoll>,
    created: AtomicUsize,
    cap: usize,
}

impl SelectorPool {
    pub fn new(cap: usize) -> Self {
        Self {
            selectors: super::pools::SyncStack::new(cap),
            created: AtomicUsize::new(0),
            cap,
        }
    }

    /// Borrow a selector, creating one while under the cap.
    pub fn get(&self) -> KilnResult<Epoll> {
        if let Some(selector) = self.selectors.pop() {
            return Ok(selector);
        }
        if self.created.fetch_add(1, Ordering::AcqRel) >= self.cap {
            self.created.fetch_sub(1, Ordering::AcqRel);
            return Err(KilnError::Rejected("selector pool exhausted"));
        }
        Epoll::new()
    }

    /// Return a selector. Overflow closes it (drop).
    pub fn put(&self, selector: Epoll) {
        if !self.selectors.push(selector) {
            self.created.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Close every pooled selector. Called on endpoint shutdown.
    pub fn close(&self) {
        self.selectors.clear();
        self.created.store(0, Ordering::Release);
    }

    /// Block until `fd` is ready for `op` or the deadline passes.
    /// Returns false on timeout. `timeout` of None blocks indefinitely.
    pub fn wait_ready(
        &self,
        fd: i32,
        op: BlockOp,
        timeout: Option<Duration>,
    ) -> KilnResult<bool> {
        let selector = self.get()?;
        let result = wait_on(&selector, fd, op, timeout);
        // The registration must not outlive the borrow.
        let _ = selector.delete(fd);
        self.put(selector);
        result
    }
}

fn wait_on(selector: &Epoll, fd: i32, op: BlockOp, timeout: Option<Duration>) -> KilnResult<bool> {
    let interest = match op {
        BlockOp::Read => syscalls::EPOLLIN,
        BlockOp::Write => syscalls::EPOLLOUT,
    };
    selector.add(fd, fd as u64, interest as i32)?;

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut events = [syscalls::epoll_event { events: 0, u64: 0 }; 2];
    loop {
        let wait_ms = match deadline {
            None => -1,
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Ok(false);
                }
                (d - now).as_millis().min(i32::MAX as u128) as i32
            }
        };
        let n = selector.wait(&mut events, wait_ms)?;
        if n > 0 {
            return Ok(true);
        }
        if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            return Ok(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscalls::{close_fd, create_pipe, wake_pipe};

    #[test]
    fn borrow_and_return_reuses_selectors() {
        let pool = SelectorPool::new(2);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert!(matches!(pool.get(), Err(KilnError::Rejected(_))));
        pool.put(a);
        pool.put(b);
        let _again = pool.get().unwrap();
    }

    #[test]
    fn wait_ready_observes_readable_fd() {
        let pool = SelectorPool::new(4);
        let (r, w) = create_pipe().unwrap();

        // Not ready yet: times out.
        let ready = pool
            .wait_ready(r, BlockOp::Read, Some(Duration::from_millis(30)))
            .unwrap();
        assert!(!ready);

        wake_pipe(w);
        let ready = pool
            .wait_ready(r, BlockOp::Read, Some(Duration::from_secs(2)))
            .unwrap();
        assert!(ready);

        close_fd(r);
        close_fd(w);
    }
}
