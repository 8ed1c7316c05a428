//! A condition variable layered over [`Event`], adding the generation
//! counter that closes the classic missed-wakeup window: a waiter reads
//! the generation *before* releasing its latch, so a `notify` landing
//! between the release and the suspend still bumps a generation the
//! waiter hasn't recorded yet as "seen".

use crate::fiber::scheduler::Scheduler;
use crate::fiber::Latch;
use crate::sync::Event;

pub struct Cond {
    event: Event,
    generation: u64,
}

impl Cond {
    pub(crate) fn new(scheduler: *mut Scheduler) -> Self {
        Cond {
            event: Event::new(scheduler),
            generation: 0,
        }
    }

    /// Releases `latch`, suspends until notified, then reacquires it.
    /// Loops on the generation counter rather than trusting a single
    /// wakeup, since `wake_one` can in principle resume a fiber whose
    /// condition a third party already invalidated again.
    pub fn wait(&mut self, latch: &mut Latch) {
        let seen = self.generation;
        latch.unlock();
        while self.generation == seen {
            self.event.wait();
        }
        latch.lock();
    }

    /// Wakes exactly one waiter, if any.
    pub fn notify_one(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.event.wake_one();
    }

    /// Wakes every current waiter.
    pub fn notify_all(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.event.trigger();
    }
}
