//! Central timer service and monotonic clock.
//!
//! The stack never sleeps: everything time-driven (retransmission, delayed
//! ACK, cache flushes, request timeouts) registers a callback here and the
//! event loop calls [`Timers::process`] when the next deadline passes.
//! Handles are opaque [`TimerId`]s backed by a binary heap; a stale heap
//! entry whose task was stopped is skipped on pop.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;
use std::time::Duration;

/// A monotonic nanosecond clock. `now()` is relative to an arbitrary epoch.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// Wall clock backed by `std::time::Instant`.
pub struct MonotonicClock {
    epoch: std::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            epoch: std::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, d: Duration) {
        self.now.set(self.now.get() + d);
    }

    pub fn set(&self, d: Duration) {
        self.now.set(d);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}

/// Opaque handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

type Callback = Rc<dyn Fn()>;

struct Task {
    cb: Callback,
    period: Option<Duration>,
}

struct TimersInner {
    heap: BinaryHeap<Reverse<(Duration, u64)>>,
    tasks: HashMap<u64, Task>,
    next_id: u64,
}

/// The timer service. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct Timers {
    clock: Rc<dyn Clock>,
    inner: Rc<RefCell<TimersInner>>,
}

impl Timers {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Timers {
            clock,
            inner: Rc::new(RefCell::new(TimersInner {
                heap: BinaryHeap::new(),
                tasks: HashMap::new(),
                next_id: 1,
            })),
        }
    }

    /// Current monotonic time.
    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Schedule a one-shot callback `delay` from now.
    pub fn schedule(&self, delay: Duration, cb: impl Fn() + 'static) -> TimerId {
        self.insert(delay, None, Rc::new(cb))
    }

    /// Schedule a periodic callback, first fired after `initial_delay`.
    pub fn periodic(
        &self,
        interval: Duration,
        initial_delay: Duration,
        cb: impl Fn() + 'static,
    ) -> TimerId {
        self.insert(initial_delay, Some(interval), Rc::new(cb))
    }

    fn insert(&self, delay: Duration, period: Option<Duration>, cb: Callback) -> TimerId {
        let deadline = self.clock.now() + delay;
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.tasks.insert(id, Task { cb, period });
        inner.heap.push(Reverse((deadline, id)));
        TimerId(id)
    }

    /// Cancel a timer. Cancelling an already-fired or unknown id is a no-op.
    pub fn stop(&self, id: TimerId) {
        self.inner.borrow_mut().tasks.remove(&id.0);
    }

    /// Whether the timer is still scheduled.
    pub fn is_active(&self, id: TimerId) -> bool {
        self.inner.borrow().tasks.contains_key(&id.0)
    }

    /// Number of live timers.
    pub fn pending(&self) -> usize {
        self.inner.borrow().tasks.len()
    }

    /// Deadline of the earliest live timer, if any.
    pub fn next_deadline(&self) -> Option<Duration> {
        let mut inner = self.inner.borrow_mut();
        loop {
            let &Reverse((deadline, id)) = inner.heap.peek()?;
            if inner.tasks.contains_key(&id) {
                return Some(deadline);
            }
            inner.heap.pop();
        }
    }

    /// Fire every timer whose deadline has passed. Returns the number of
    /// callbacks invoked. Callbacks run outside the internal borrow, so
    /// they may freely schedule and cancel timers.
    pub fn process(&self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        loop {
            let due = {
                let mut inner = self.inner.borrow_mut();
                match inner.heap.peek() {
                    Some(&Reverse((deadline, id))) if deadline <= now => {
                        inner.heap.pop();
                        Some(id)
                    }
                    _ => None,
                }
            };
            let Some(id) = due else { break };

            let task = {
                let mut inner = self.inner.borrow_mut();
                match inner.tasks.get(&id) {
                    Some(task) => {
                        let cb = task.cb.clone();
                        let period = task.period;
                        match period {
                            // Re-arm before the callback so it can stop() itself.
                            Some(p) => inner.heap.push(Reverse((now + p, id))),
                            None => {
                                inner.tasks.remove(&id);
                            }
                        }
                        Some(cb)
                    }
                    // Stale heap entry of a stopped timer.
                    None => None,
                }
            };
            if let Some(cb) = task {
                cb();
                fired += 1;
            }
        }
        fired
    }
}

/// A restartable single-callback timer, owned by one object (retransmission
/// timer, DACK timer, resolve timer, ...). `start` on a running timer
/// replaces the pending deadline.
pub struct Timer {
    timers: Timers,
    id: Rc<Cell<Option<TimerId>>>,
    cb: Callback,
}

impl Timer {
    pub fn new(timers: Timers, cb: impl Fn() + 'static) -> Self {
        Timer {
            timers,
            id: Rc::new(Cell::new(None)),
            cb: Rc::new(cb),
        }
    }

    pub fn start(&self, delay: Duration) {
        self.stop();
        let slot = self.id.clone();
        let cb = self.cb.clone();
        let tid = self.timers.schedule(delay, move || {
            slot.set(None);
            cb();
        });
        self.id.set(Some(tid));
    }

    pub fn restart(&self, delay: Duration) {
        self.start(delay);
    }

    pub fn stop(&self) {
        if let Some(tid) = self.id.take() {
            self.timers.stop(tid);
        }
    }

    pub fn is_active(&self) -> bool {
        self.id.get().is_some()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (ManualClock, Timers) {
        let clock = ManualClock::new();
        let timers = Timers::new(Rc::new(clock.clone()));
        (clock, timers)
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let (clock, timers) = fixture();
        let log = Rc::new(RefCell::new(Vec::new()));
        for (name, ms) in [("b", 20u64), ("a", 10), ("c", 30)] {
            let log = log.clone();
            timers.schedule(Duration::from_millis(ms), move || log.borrow_mut().push(name));
        }
        clock.advance(Duration::from_millis(25));
        assert_eq!(timers.process(), 2);
        assert_eq!(*log.borrow(), vec!["a", "b"]);
        clock.advance(Duration::from_millis(10));
        timers.process();
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_stop_cancels() {
        let (clock, timers) = fixture();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let id = timers.schedule(Duration::from_millis(5), move || h.set(h.get() + 1));
        assert!(timers.is_active(id));
        timers.stop(id);
        clock.advance(Duration::from_millis(10));
        assert_eq!(timers.process(), 0);
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn test_periodic_repeats_until_stopped() {
        let (clock, timers) = fixture();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let id = timers.periodic(
            Duration::from_millis(10),
            Duration::from_millis(10),
            move || h.set(h.get() + 1),
        );
        for _ in 0..3 {
            clock.advance(Duration::from_millis(10));
            timers.process();
        }
        assert_eq!(hits.get(), 3);
        timers.stop(id);
        clock.advance(Duration::from_millis(50));
        timers.process();
        assert_eq!(hits.get(), 3);
    }

    #[test]
    fn test_callback_can_reschedule() {
        let (clock, timers) = fixture();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let t2 = timers.clone();
        timers.schedule(Duration::from_millis(5), move || {
            h.set(h.get() + 1);
            let h2 = h.clone();
            t2.schedule(Duration::from_millis(5), move || h2.set(h2.get() + 1));
        });
        clock.advance(Duration::from_millis(6));
        timers.process();
        assert_eq!(hits.get(), 1);
        clock.advance(Duration::from_millis(6));
        timers.process();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn test_timer_wrapper_restart() {
        let (clock, timers) = fixture();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let timer = Timer::new(timers.clone(), move || h.set(h.get() + 1));
        timer.start(Duration::from_millis(10));
        clock.advance(Duration::from_millis(8));
        timers.process();
        timer.restart(Duration::from_millis(10));
        clock.advance(Duration::from_millis(8));
        timers.process();
        assert_eq!(hits.get(), 0);
        clock.advance(Duration::from_millis(3));
        timers.process();
        assert_eq!(hits.get(), 1);
        assert!(!timer.is_active());
    }

    #[test]
    fn test_next_deadline_skips_stopped() {
        let (_clock, timers) = fixture();
        let id = timers.schedule(Duration::from_millis(5), || {});
        timers.schedule(Duration::from_millis(20), || {});
        timers.stop(id);
        assert_eq!(timers.next_deadline(), Some(Duration::from_millis(20)));
    }
}
