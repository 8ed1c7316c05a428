//! Millisecond timer wheel driving the loop's timeout-bearing I/O
//! operations. `now` is sampled once per `start()`/`restart()` window
//! rather than on every access, so a burst of expiry checks within one
//! pass of the loop agree on what "now" means.

use std::time::Duration;

use crate::arena::{Arena, Key};
use crate::heap::{Heap, HeapStore};

pub type TimerId = Key;

struct TimerRecord {
    expiry_ms: u64,
    heap_index: usize,
}

struct Store {
    timers: Arena<TimerRecord>,
}

impl HeapStore<TimerId> for Store {
    fn less(&self, a: TimerId, b: TimerId) -> bool {
        self.timers.index(a).expiry_ms < self.timers.index(b).expiry_ms
    }

    fn heap_index(&self, key: TimerId) -> usize {
        self.timers.index(key).heap_index
    }

    fn set_heap_index(&mut self, key: TimerId, index: usize) {
        self.timers.index_mut(key).heap_index = index;
    }
}

pub struct IoClock {
    store: Store,
    heap: Heap<TimerId>,
    now_ms: u64,
}

impl IoClock {
    pub fn new() -> Self {
        IoClock {
            store: Store {
                timers: Arena::new(),
            },
            heap: Heap::new(),
            now_ms: 0,
        }
    }

    /// Samples the monotonic clock; call once per loop pass, before
    /// consulting `next_expiry_ms`/`drain_expired`, not per-timer.
    pub fn start(&mut self) {
        self.now_ms = monotonic_ms();
    }

    pub fn stop(&mut self) {}

    pub fn restart(&mut self) {
        self.stop();
        self.start();
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn set_timer(&mut self, delay: Duration) -> TimerId {
        let expiry_ms = self.now_ms.saturating_add(delay.as_millis() as u64);
        let key = self.store.timers.insert(TimerRecord {
            expiry_ms,
            heap_index: 0,
        });
        self.heap.push(&mut self.store, key);
        key
    }

    /// No-op if the timer already fired (and was drained) or was already
    /// cancelled; timers are one-shot and don't linger after firing.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if self.store.timers.get(id).is_some() {
            self.heap.remove(&mut self.store, id);
            self.store.timers.remove(id);
        }
    }

    /// Milliseconds until the nearest pending timer, or `None` if there
    /// are no timers at all. Callers clamp this against a caller-supplied
    /// ceiling before handing it to the poller as a wait timeout.
    pub fn next_expiry_ms(&self) -> Option<u64> {
        self.heap
            .top()
            .map(|k| self.store.timers.index(k).expiry_ms)
    }

    /// Pops every timer whose expiry is at or before `now_ms()`.
    pub fn drain_expired(&mut self) -> Vec<TimerId> {
        let mut expired = Vec::new();
        while let Some(top) = self.heap.top() {
            if self.store.timers.index(top).expiry_ms > self.now_ms {
                break;
            }
            let key = self.heap.pop(&mut self.store).unwrap();
            self.store.timers.remove(key);
            expired.push(key);
        }
        expired
    }
}

impl Default for IoClock {
    fn default() -> Self {
        Self::new()
    }
}

fn monotonic_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1000 + (ts.tv_nsec / 1_000_000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearer_timer_expires_first() {
        let mut clock = IoClock::new();
        clock.start();
        let far = clock.set_timer(Duration::from_millis(200));
        let near = clock.set_timer(Duration::from_millis(10));
        assert_eq!(clock.next_expiry_ms(), clock.store.timers.get(near).map(|t| t.expiry_ms));
        clock.cancel_timer(far);
        assert!(clock.drain_expired().is_empty());
    }

    #[test]
    fn cancelling_a_fired_timer_is_a_no_op() {
        let mut clock = IoClock::new();
        clock.start();
        let id = clock.set_timer(Duration::from_millis(0));
        clock.now_ms += 1;
        let expired = clock.drain_expired();
        assert_eq!(expired, vec![id]);
        clock.cancel_timer(id); // must not panic
    }

    #[test]
    fn next_expiry_is_never_in_the_past_once_computed_against_now() {
        let mut clock = IoClock::new();
        clock.start();
        clock.set_timer(Duration::from_millis(50));
        assert!(clock.next_expiry_ms().unwrap() >= clock.now_ms());

        let empty = IoClock::new();
        assert_eq!(empty.next_expiry_ms(), None);
    }
}
