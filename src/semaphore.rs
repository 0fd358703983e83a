//! Counting semaphores used to bound the number of simultaneously
//! outstanding runs.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct MultiPermitState {
    available: usize,
    capacity: usize,
    queue: VecDeque<u64>,
    next_ticket: u64,
}

/// A counting semaphore that grants "up to N" permits in one shot.
///
/// A caller asking for N permits receives `min(N, available)` without blocking
/// as long as at least one permit is free, and blocks only when none are.
/// Waiters are served in FIFO order: a later arrival can never overtake an
/// earlier one, even if the earlier one asked for more permits.
///
/// The grant size is computed inside a single critical section; the blocking
/// wait happens on the condvar, outside that decision, so no lock is held
/// while a caller sleeps.
#[derive(Debug)]
pub struct FairMultiPermitSemaphore {
    state: Mutex<MultiPermitState>,
    cond: Condvar,
}

impl std::fmt::Debug for MultiPermitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiPermitState")
            .field("available", &self.available)
            .field("capacity", &self.capacity)
            .field("waiters", &self.queue.len())
            .finish()
    }
}

impl FairMultiPermitSemaphore {
    pub fn new(permits: usize) -> Self {
        FairMultiPermitSemaphore {
            state: Mutex::new(MultiPermitState {
                available: permits,
                capacity: permits,
                queue: VecDeque::new(),
                next_ticket: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Acquires between 1 and `n` permits, blocking while none are available.
    /// Returns the number actually granted. `acquire_up_to(0)` returns 0
    /// immediately without joining the queue.
    pub fn acquire_up_to(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let mut state = self.state.lock().expect("poisoned");
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);

        loop {
            if state.queue.front() == Some(&ticket) && state.available > 0 {
                let granted = n.min(state.available);
                assert!(
                    granted <= state.available,
                    "grant of {granted} exceeds {} available permits",
                    state.available
                );
                state.available -= granted;
                state.queue.pop_front();
                // the next waiter may be satisfiable with what is left
                self.cond.notify_all();
                return granted;
            }
            state = self.cond.wait(state).expect("poisoned");
        }
    }

    /// Returns `n` permits to the pool. `release(0)` is a no-op.
    pub fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut state = self.state.lock().expect("poisoned");
        state.available += n;
        assert!(
            state.available <= state.capacity,
            "released more permits ({}) than the pool capacity ({})",
            state.available,
            state.capacity
        );
        drop(state);
        self.cond.notify_all();
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.state.lock().expect("poisoned").available
    }

    /// Removes every currently-free permit from the pool and returns how many
    /// were taken.
    pub fn drain(&self) -> usize {
        let mut state = self.state.lock().expect("poisoned");
        let drained = state.available;
        state.available = 0;
        state.capacity -= drained;
        drained
    }
}

/// A counting semaphore whose capacity can be withdrawn while permits are
/// outstanding.
///
/// `reduce_permits` may drive the available count negative; acquirers then
/// block until enough releases pay the deficit back. Used to shrink the
/// in-flight run bound mid-session.
#[derive(Debug)]
pub struct ReducibleSemaphore {
    available: Mutex<i64>,
    cond: Condvar,
}

impl ReducibleSemaphore {
    pub fn new(permits: usize) -> Self {
        ReducibleSemaphore {
            available: Mutex::new(permits as i64),
            cond: Condvar::new(),
        }
    }

    /// Blocks until a permit is available, then takes it.
    pub fn acquire(&self) {
        let mut available = self.available.lock().expect("poisoned");
        while *available <= 0 {
            available = self.cond.wait(available).expect("poisoned");
        }
        *available -= 1;
    }

    /// Takes a permit if one is free right now.
    pub fn try_acquire(&self) -> bool {
        let mut available = self.available.lock().expect("poisoned");
        if *available > 0 {
            *available -= 1;
            true
        } else {
            false
        }
    }

    pub fn release(&self) {
        let mut available = self.available.lock().expect("poisoned");
        *available += 1;
        drop(available);
        self.cond.notify_one();
    }

    /// Withdraws `reduction` permits from the pool, possibly leaving it in
    /// deficit. `reduce_permits(0)` is a no-op.
    pub fn reduce_permits(&self, reduction: usize) {
        if reduction == 0 {
            return;
        }
        let mut available = self.available.lock().expect("poisoned");
        *available -= reduction as i64;
    }

    /// May be negative while the pool is in deficit.
    pub fn available(&self) -> i64 {
        *self.available.lock().expect("poisoned")
    }
}

#[cfg(test)]
mod semaphore_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn grants_whatever_is_available() {
        let sem = FairMultiPermitSemaphore::new(3);
        assert_eq!(sem.acquire_up_to(5), 3);
        assert_eq!(sem.available(), 0);
        sem.release(3);
        assert_eq!(sem.available(), 3);
        assert_eq!(sem.acquire_up_to(2), 2);
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn zero_request_never_blocks() {
        let sem = FairMultiPermitSemaphore::new(0);
        assert_eq!(sem.acquire_up_to(0), 0);
    }

    #[test]
    fn blocks_until_released() {
        let sem = Arc::new(FairMultiPermitSemaphore::new(1));
        assert_eq!(sem.acquire_up_to(1), 1);

        let sem2 = Arc::clone(&sem);
        let handle = thread::spawn(move || sem2.acquire_up_to(4));

        thread::sleep(Duration::from_millis(50));
        sem.release(1);
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let sem = Arc::new(FairMultiPermitSemaphore::new(0));
        let order = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..4 {
            let sem = Arc::clone(&sem);
            let order_thread = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                sem.acquire_up_to(1);
                order_thread.fetch_add(1, Ordering::SeqCst);
            }));
            // give each thread time to enqueue before the next one starts
            thread::sleep(Duration::from_millis(20));
            assert_eq!(order.load(Ordering::SeqCst), 0);
        }

        for _ in 0..4 {
            sem.release(1);
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(order.load(Ordering::SeqCst), 4);
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn concurrent_acquirers_never_overdraw() {
        let sem = Arc::new(FairMultiPermitSemaphore::new(4));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let sem = Arc::clone(&sem);
            let in_flight = Arc::clone(&in_flight);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    let got = sem.acquire_up_to(3);
                    let now = in_flight.fetch_add(got, Ordering::SeqCst) + got;
                    assert!(now <= 4, "{now} permits in flight");
                    in_flight.fetch_sub(got, Ordering::SeqCst);
                    sem.release(got);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sem.available(), 4);
    }

    #[test]
    fn drain_takes_every_free_permit() {
        let sem = FairMultiPermitSemaphore::new(3);
        assert_eq!(sem.acquire_up_to(1), 1);
        assert_eq!(sem.drain(), 2);
        assert_eq!(sem.available(), 0);
        // the permit acquired before the drain can still come back
        sem.release(1);
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn reducible_semaphore_goes_into_deficit() {
        let sem = ReducibleSemaphore::new(2);
        sem.acquire();
        sem.acquire();
        sem.reduce_permits(2);
        assert_eq!(sem.available(), -2);

        // one release only pays back deficit, nothing is acquirable
        sem.release();
        assert_eq!(sem.available(), -1);
        assert!(!sem.try_acquire());

        sem.release();
        sem.release();
        assert_eq!(sem.available(), 1);
        assert!(sem.try_acquire());
    }
}
