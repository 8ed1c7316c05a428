//! Cooperative stackful fibers.
//!
//! A [`crate::event_loop::Loop`] owns exactly one [`scheduler::Scheduler`];
//! everything in this module that doesn't take a `Loop`/`Scheduler`
//! explicitly (`yield_now`, `current`, `interrupt`) reaches it through
//! [`scheduler::with_current`], which only works while some fiber (or the
//! loop's own idle context) is actually executing on this thread.

pub(crate) mod arch;
mod cond;
mod latch;
mod mutex;
pub(crate) mod scheduler;
pub(crate) mod stack;

pub use cond::Cond;
pub use latch::Latch;
pub use mutex::{Mutex, MutexGuard};
pub use scheduler::FiberId;

use std::any::Any;
use std::cell::{RefCell, UnsafeCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::error::Cancelled;
use crate::sync::Event;

/// Suspends the current fiber, letting any other runnable fiber take a
/// turn, then resumes once it's this fiber's turn again. A no-op if no
/// other fiber is runnable.
pub fn yield_now() {
    scheduler::with_current(|s| s.yield_now());
}

/// The handle of the fiber currently executing. Panics if called from the
/// loop's own idle context (outside any fiber).
pub fn current() -> FiberId {
    scheduler::with_current(|s| s.current_fiber())
        .expect("fiber::current() called outside a fiber")
}

/// Requests that `target` unwind at its next suspension point (or
/// immediately, if it is already suspended). See the scheduler's
/// documented three-case contract in [`scheduler::Scheduler::interrupt`].
pub fn interrupt(target: FiberId) {
    scheduler::with_current(|s| s.interrupt(target));
}

enum JoinState<T> {
    Running,
    Finished(T),
    Panicked(Box<dyn Any + Send>),
    Cancelled,
}

struct Shared<T> {
    state: RefCell<JoinState<T>>,
    // Not a `RefCell`: the fiber that finishes and the fiber joining it
    // are different native stacks, so a joiner suspended inside
    // `wait()` would still be holding a `RefMut` when the finisher's
    // drop guard calls `trigger()`, which would panic. The strictly
    // alternating, single-threaded execution model makes the raw
    // aliasing here sound, same as `fiber::Mutex`.
    done: UnsafeCell<Event>,
}

impl<T> Shared<T> {
    fn done(&self) -> &mut Event {
        unsafe { &mut *self.done.get() }
    }
}

/// The error a [`JoinHandle::join`] reports when the fiber didn't finish
/// normally.
pub enum JoinError {
    /// The fiber was interrupted before or during its run.
    Cancelled,
    /// The fiber's body panicked; the payload is whatever `panic!` was
    /// given.
    Panicked(Box<dyn Any + Send>),
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Cancelled => f.write_str("JoinError::Cancelled"),
            JoinError::Panicked(_) => f.write_str("JoinError::Panicked(..)"),
        }
    }
}

/// A typestate builder for spawning a fiber with non-default stack size
/// or background status, mirroring `std::thread::Builder`.
pub struct Builder {
    scheduler: *mut scheduler::Scheduler,
    stack_size: usize,
    background: bool,
}

impl Builder {
    pub(crate) fn new(scheduler: *mut scheduler::Scheduler) -> Self {
        Builder {
            scheduler,
            stack_size: 0,
            background: false,
        }
    }

    /// Overrides the loop's default fiber stack size.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// A background fiber doesn't keep [`crate::event_loop::Loop::run`]
    /// alive by itself; the loop exits once only background fibers
    /// remain runnable or suspended.
    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    /// Spawns `f` as a new fiber, returning a handle that can be joined
    /// for its result (or interrupted before it produces one).
    pub fn spawn<F, T>(self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let shared = Rc::new(Shared {
            state: RefCell::new(JoinState::Running),
            done: UnsafeCell::new(Event::new(self.scheduler)),
        });
        let entry_shared = Rc::clone(&shared);

        let entry = move || {
            struct Announce<T>(Rc<Shared<T>>);
            impl<T> Drop for Announce<T> {
                fn drop(&mut self) {
                    self.0.done().trigger();
                }
            }
            let _announce = Announce(Rc::clone(&entry_shared));

            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(value) => {
                    *entry_shared.state.borrow_mut() = JoinState::Finished(value);
                }
                Err(payload) => {
                    if payload.downcast_ref::<Cancelled>().is_some() {
                        *entry_shared.state.borrow_mut() = JoinState::Cancelled;
                        panic::resume_unwind(payload);
                    }
                    *entry_shared.state.borrow_mut() = JoinState::Panicked(payload);
                }
            }
        };

        let scheduler = unsafe { &mut *self.scheduler };
        let fiber = scheduler.create_fiber(entry, self.stack_size, self.background);
        JoinHandle { fiber, shared }
    }
}

/// A handle to a spawned fiber. Dropping it without joining is allowed
/// (unlike `std::thread::JoinHandle`'s native cousins, a forgotten fiber
/// keeps running; nothing here panics on drop), but its result is then
/// lost.
pub struct JoinHandle<T> {
    fiber: FiberId,
    shared: Rc<Shared<T>>,
}

impl<T> JoinHandle<T> {
    pub fn fiber_id(&self) -> FiberId {
        self.fiber
    }

    /// Interrupts the fiber if it hasn't finished yet.
    pub fn interrupt(&self) {
        interrupt(self.fiber);
    }

    /// Blocks (suspending the current fiber, not the OS thread) until the
    /// spawned fiber finishes, returning its result or why it didn't
    /// produce one.
    pub fn join(self) -> Result<T, JoinError> {
        loop {
            let is_running = matches!(*self.shared.state.borrow(), JoinState::Running);
            if !is_running {
                break;
            }
            self.shared.done().wait();
        }
        match Rc::try_unwrap(self.shared) {
            Ok(shared) => match shared.state.into_inner() {
                JoinState::Finished(value) => Ok(value),
                JoinState::Panicked(payload) => Err(JoinError::Panicked(payload)),
                JoinState::Cancelled => Err(JoinError::Cancelled),
                JoinState::Running => unreachable!("joined while still running"),
            },
            Err(_) => unreachable!("no other strong reference to a finished fiber's state"),
        }
    }
}

/// Spawns `f` on the loop currently driving this thread with default
/// stack size and foreground status. Shorthand for
/// `Builder::new(..).spawn(f)`.
pub fn start<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    let scheduler = scheduler::with_current(|s| s as *mut scheduler::Scheduler);
    Builder::new(scheduler).spawn(f)
}
