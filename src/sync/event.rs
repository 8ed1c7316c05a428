//! A wakeable gate: fibers suspend in [`Event::wait`], [`Event::trigger`]
//! wakes every fiber currently waiting. Grounded on the original design's
//! `Event`, used both directly (the thread-pool bridge hands one to every
//! offloaded call) and as the primitive [`crate::fiber::Cond`] layers a
//! generation counter over to avoid the classic missed-wakeup race.

use std::collections::VecDeque;

use crate::fiber::scheduler::{FiberId, Scheduler};

pub struct Event {
    scheduler: *mut Scheduler,
    waiters: VecDeque<FiberId>,
}

impl Event {
    pub(crate) fn new(scheduler: *mut Scheduler) -> Self {
        Event {
            scheduler,
            waiters: VecDeque::new(),
        }
    }

    fn scheduler(&self) -> &mut Scheduler {
        unsafe { &mut *self.scheduler }
    }

    /// Suspends the current fiber until the next [`Event::trigger`].
    pub fn wait(&mut self) {
        let me = self
            .scheduler()
            .current_fiber()
            .expect("Event::wait called outside a fiber");
        self.waiters.push_back(me);
        self.scheduler().suspend_current();
    }

    /// Wakes every fiber currently blocked in `wait()`. Fibers that call
    /// `wait()` afterwards block again until the next `trigger()`; this is
    /// an edge, not a level, so a `trigger()` with nobody waiting has no
    /// lasting effect.
    pub fn trigger(&mut self) {
        while let Some(fiber) = self.waiters.pop_front() {
            self.scheduler().resume(fiber);
        }
    }

    /// Wakes a single waiting fiber, oldest first. Returns `false` if
    /// nobody was waiting.
    pub fn wake_one(&mut self) -> bool {
        match self.waiters.pop_front() {
            Some(fiber) => {
                self.scheduler().resume(fiber);
                true
            }
            None => false,
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::scheduler::Scheduler;

    #[test]
    fn trigger_with_no_waiters_is_a_no_op() {
        let mut scheduler = Scheduler::new(4096);
        let mut event = Event::new(&mut scheduler as *mut Scheduler);
        event.trigger();
        assert!(!event.has_waiters());
    }
}
