//! The fiber scheduler: stack allocation, context switching, lifecycle,
//! cooperative yielding and interruption.
//!
//! Grounded directly on the original design's `Scheduler` (runnable list +
//! idle sentinel + deferred-free of dead stacks), reworked so the pointer
//! graph (`Fiber* -> ListNode`) becomes an [`Arena`]-indexed intrusive
//! [`List`] instead, per the Design Notes' arena guidance.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};

use crate::arena::{Arena, Key};
use crate::error::Cancelled;
use crate::fiber::arch;
use crate::fiber::stack::{FiberStack, MIN_STACK_SIZE};
use crate::list::{LinkStore, Links, List};

/// A non-owning reference to a fiber, valid until it exits or is
/// interrupted to completion. Stale handles are rejected by the arena
/// rather than aliasing a reused slot.
pub type FiberId = Key;

struct FiberRecord {
    stack: FiberStack,
    sp: *mut u8,
    started: bool,
    entry: Option<Box<dyn FnOnce()>>,
    links: Links<FiberId>,
    background: bool,
    post_interrupt: bool,
    seq: u64,
}

impl LinkStore<FiberId> for Arena<FiberRecord> {
    fn links(&self, key: FiberId) -> &Links<FiberId> {
        &self.index(key).links
    }
    fn links_mut(&mut self, key: FiberId) -> &mut Links<FiberId> {
        &mut self.index_mut(key).links
    }
}

thread_local! {
    static CURRENT_SCHEDULER: Cell<*mut Scheduler> = Cell::new(std::ptr::null_mut());
}

/// The fiber scheduler. Owned by a [`crate::event_loop::Loop`]; once
/// `run()`/any switch has happened, the scheduler must not move (its
/// address is captured by in-flight fiber stacks via a thread-local).
pub struct Scheduler {
    fibers: Arena<FiberRecord>,
    runnable: List<FiberId>,
    running: Option<FiberId>,
    idle_sp: *mut u8,
    dead: Option<FiberId>,
    pending_panic: Option<Box<dyn Any + Send>>,
    foreground_count: usize,
    next_seq: u64,
    default_stack_size: usize,
}

impl Scheduler {
    pub fn new(default_stack_size: usize) -> Self {
        Scheduler {
            fibers: Arena::new(),
            runnable: List::new(),
            running: None,
            idle_sp: std::ptr::null_mut(),
            dead: None,
            pending_panic: None,
            foreground_count: 0,
            next_seq: 0,
            default_stack_size: default_stack_size.max(MIN_STACK_SIZE),
        }
    }

    pub fn number_of_foreground_fibers(&self) -> usize {
        self.foreground_count
    }

    pub fn all_fibers_have_exited(&self) -> bool {
        self.fibers.is_empty()
    }

    /// `None` denotes the idle fiber: the loop's own execution, not
    /// running any user fiber.
    pub fn current_fiber(&self) -> Option<FiberId> {
        self.running
    }

    pub fn create_fiber<F>(&mut self, entry: F, stack_size: usize, background: bool) -> FiberId
    where
        F: FnOnce() + 'static,
    {
        let size = if stack_size == 0 {
            self.default_stack_size
        } else {
            stack_size
        };
        let stack = FiberStack::new(size).expect("failed to allocate fiber stack");
        let seq = self.next_seq;
        self.next_seq += 1;
        let key = self.fibers.insert(FiberRecord {
            stack,
            sp: std::ptr::null_mut(),
            started: false,
            entry: Some(Box::new(entry)),
            links: Links::default(),
            background,
            post_interrupt: false,
            seq,
        });
        self.runnable.push_back(&mut self.fibers, key);
        if !background {
            self.foreground_count += 1;
        }
        key
    }

    /// Marks a suspended fiber runnable again. Does not switch to it
    /// immediately; it joins the tail of the runnable list like any other
    /// fiber becoming eligible to run.
    pub fn resume(&mut self, fiber: FiberId) {
        debug_assert!(self.fibers.get(fiber).is_some(), "resuming a dead fiber");
        self.runnable.push_back(&mut self.fibers, fiber);
    }

    /// Suspends the current fiber. The caller is responsible for having
    /// recorded `current_fiber()`'s handle wherever it will later be
    /// passed back to [`Scheduler::resume`].
    pub fn suspend_current(&mut self) {
        let cur = self.running.expect("suspend_current called outside a fiber");
        let next = self.runnable.pop_front(&mut self.fibers);
        self.switch_to(next);
        self.check_post_interrupt(cur);
    }

    /// Rotates the current fiber behind the rest of the runnable ring and
    /// switches to whichever fiber is now at the head. A no-op if no other
    /// fiber is runnable.
    pub fn yield_now(&mut self) {
        let cur = self.running.expect("yield_now called outside a fiber");
        if self.runnable.is_empty() {
            return;
        }
        self.runnable.push_back(&mut self.fibers, cur);
        let next = self.runnable.pop_front(&mut self.fibers);
        self.switch_to(next);
        self.check_post_interrupt(cur);
    }

    /// Switches into the runnable list's head, if any, and returns only
    /// once the runnable list has drained back to empty (every fiber
    /// either suspended on some external wait-queue or exited).
    pub fn run(&mut self) {
        if let Some(head) = self.runnable.pop_front(&mut self.fibers) {
            self.switch_to(Some(head));
        }
        if let Some(panic) = self.pending_panic.take() {
            panic::resume_unwind(panic);
        }
    }

    /// `interrupt(handle)`: delivers an asynchronous cancellation per the
    /// three cases in the fiber scheduler's documented contract.
    pub fn interrupt(&mut self, target: FiberId) {
        if Some(target) == self.running {
            // Running (can only be "itself"): flag for the next
            // scheduler re-entry to observe.
            self.fibers.index_mut(target).post_interrupt = true;
            return;
        }
        // Runnable: flagged, observed on its next post-switch check.
        // Suspended: flagged the same way, then switched into directly --
        // with the caller re-queued first so it resumes once something
        // switches back to it -- so the caller observes interruption as
        // having already happened by the time this call returns.
        let is_runnable = self.is_in_runnable_list(target);
        self.fibers.index_mut(target).post_interrupt = true;
        if !is_runnable {
            let cur = self.running;
            if let Some(c) = cur {
                self.runnable.push_back(&mut self.fibers, c);
            }
            self.switch_to(Some(target));
            if let Some(c) = cur {
                self.check_post_interrupt(c);
            }
        }
    }

    fn is_in_runnable_list(&self, target: FiberId) -> bool {
        // A fiber is "in" the runnable list iff it has list membership,
        // i.e. its links aren't the all-`None` default left by removal.
        let links = self.fibers.index(target).links;
        links.prev.is_some() || links.next.is_some() || self.runnable.head() == Some(target)
    }

    fn check_post_interrupt(&mut self, fiber: FiberId) {
        if let Some(record) = self.fibers.get_mut(fiber) {
            if record.post_interrupt {
                record.post_interrupt = false;
                panic::resume_unwind(Box::new(Cancelled));
            }
        }
    }

    /// Performs the raw context switch and reaps whatever fiber was left
    /// in the deferred-free slot once execution returns to this point
    /// (which may be much later, after many other switches elsewhere).
    fn switch_to(&mut self, target: Option<FiberId>) {
        let old_slot: *mut *mut u8 = match self.running {
            Some(k) => &mut self.fibers.index_mut(k).sp,
            None => &mut self.idle_sp,
        };
        let new_sp = match target {
            Some(k) => {
                let record = self.fibers.index_mut(k);
                if !record.started {
                    let ctx = encode_fiber_id(k);
                    record.sp = unsafe {
                        arch::init_stack(record.stack.usable_base(), record.stack.len(), ctx)
                    };
                    record.started = true;
                }
                record.sp
            }
            None => self.idle_sp,
        };

        CURRENT_SCHEDULER.with(|c| c.set(self as *mut Scheduler));
        self.running = target;
        unsafe {
            arch::weave_fiber_switch(old_slot, new_sp);
        }
        // Execution resumes here once something switches back to whatever
        // context `old_slot` belonged to. `self` is still valid: the
        // scheduler's address never changes across a switch.
        self.reap_dead();
    }

    fn reap_dead(&mut self) {
        if let Some(dead) = self.dead.take() {
            self.fibers.remove(dead);
        }
    }

    /// Called from the fiber-start trampoline on a freshly-switched-to
    /// stack. Never returns: it ends in a switch away from this stack.
    fn enter_current_fiber(&mut self, fiber: FiberId) -> ! {
        let entry = self.fibers.index_mut(fiber).entry.take();
        if let Some(entry) = entry {
            let result = panic::catch_unwind(AssertUnwindSafe(entry));
            if let Err(payload) = result {
                if payload.downcast_ref::<Cancelled>().is_none() {
                    self.pending_panic = Some(payload);
                }
            }
        }

        self.current_fiber_exits(fiber)
    }

    fn current_fiber_exits(&mut self, fiber: FiberId) -> ! {
        debug_assert_eq!(self.running, Some(fiber));
        let background = self.fibers.index(fiber).background;
        let next = self.runnable.pop_front(&mut self.fibers);
        self.dead = Some(fiber);
        if !background {
            self.foreground_count -= 1;
        }
        self.switch_to(next);
        unreachable!("a dead fiber's stack was resumed")
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        debug_assert!(
            self.all_fibers_have_exited(),
            "scheduler dropped with live fibers"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn a_fresh_fiber_is_runnable_and_becomes_reaped_once_it_exits() {
        let mut scheduler = Scheduler::new(64 * 1024);
        let ran = Rc::new(Cell::new(false));
        let ran_in_fiber = Rc::clone(&ran);
        let fiber = scheduler.create_fiber(
            move || {
                ran_in_fiber.set(true);
            },
            0,
            false,
        );

        assert!(scheduler.is_in_runnable_list(fiber));
        assert_eq!(scheduler.current_fiber(), None);
        assert_eq!(scheduler.number_of_foreground_fibers(), 1);

        scheduler.run();

        assert!(ran.get());
        assert_eq!(scheduler.number_of_foreground_fibers(), 0);
        assert!(scheduler.all_fibers_have_exited());
    }

    #[test]
    fn background_fibers_dont_count_toward_foreground_total() {
        let mut scheduler = Scheduler::new(64 * 1024);
        scheduler.create_fiber(|| {}, 0, true);
        assert_eq!(scheduler.number_of_foreground_fibers(), 0);
        // Let it run to completion so the scheduler drops with no live
        // fibers left, same as every other caller must arrange.
        scheduler.run();
    }
}

/// Gives code running inside a fiber body access to the scheduler driving
/// it, without threading a `&mut Scheduler` through every call in the
/// public API (`fiber::yield_now()`, `Event::wait()`, ...). Valid only
/// while some fiber or the idle context is actually executing; panics
/// otherwise.
pub(crate) fn with_current<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let ptr = CURRENT_SCHEDULER.with(|c| c.get());
    assert!(
        !ptr.is_null(),
        "no fiber scheduler is driving this thread right now"
    );
    f(unsafe { &mut *ptr })
}

fn encode_fiber_id(key: FiberId) -> *mut u8 {
    // The context-pointer slot in the fabricated first-entry frame is a
    // single pointer-sized carrier; `FiberId` is two `u32`s, so it's
    // packed into the pointer's bit pattern rather than dereferenced as
    // an actual pointer. `arch::init_stack` and `decode_fiber_id` are the
    // only two places that know this encoding.
    let (index, generation) = key.into_raw_parts();
    let packed = ((index as u64) << 32) | generation as u64;
    packed as usize as *mut u8
}

fn decode_fiber_id(raw: *mut u8) -> FiberId {
    let packed = raw as usize as u64;
    let index = (packed >> 32) as u32;
    let generation = packed as u32;
    FiberId::from_raw_parts(index, generation)
}

/// Entry point landed on by the architecture trampoline. Recovers the
/// scheduler from the thread-local stashed immediately before the switch
/// that brought us here, and the fiber identity from `context`.
#[no_mangle]
pub extern "C" fn weave_fiber_start(context: *mut u8) -> ! {
    let fiber = decode_fiber_id(context);
    let scheduler_ptr = CURRENT_SCHEDULER.with(|c| c.get());
    debug_assert!(!scheduler_ptr.is_null());
    let scheduler = unsafe { &mut *scheduler_ptr };
    scheduler.enter_current_fiber(fiber)
}
