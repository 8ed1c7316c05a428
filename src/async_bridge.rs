//! Bridges the fiber scheduler to a [`ThreadPool`]: [`Async::call`] runs a
//! closure on a worker thread and suspends the calling fiber (not the
//! loop's OS thread) until it finishes.
//!
//! Grounded on the original design's `Async`/`executeTask`: a background
//! fiber owns the pool's wake pipe, waking one event per completed task
//! id rather than a single event for the whole pool, so unrelated calls
//! in flight at once don't all wake up to recheck a shared flag.

use std::any::Any;
use std::cell::{RefCell, UnsafeCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::event_loop::{LoopHandle, INFINITE};
use crate::pool::ThreadPool;
use crate::sync::Event;

// Same reasoning as `fiber::Shared::done`: the waiting fiber and the
// draining fiber are different native stacks, and the former can be
// suspended inside `wait()` while the latter calls `trigger()` on the
// very same `Event`. A `RefCell` would see that as a conflicting borrow.
struct TaskEvent(UnsafeCell<Event>);

impl TaskEvent {
    fn new(handle: &mut LoopHandle) -> Self {
        TaskEvent(UnsafeCell::new(handle.make_event()))
    }

    fn get(&self) -> &mut Event {
        unsafe { &mut *self.0.get() }
    }
}

struct Shared {
    events: RefCell<HashMap<u64, Rc<TaskEvent>>>,
}

/// Offloads blocking closures onto a fixed pool of worker threads,
/// reporting completion back into the fiber scheduler.
pub struct Async {
    loop_handle: LoopHandle,
    pool: Rc<ThreadPool>,
    shared: Rc<Shared>,
}

impl Async {
    /// Starts `num_workers` pool threads and a background fiber, on the
    /// loop behind `loop_handle`, that drains the pool's completions.
    pub fn new(mut loop_handle: LoopHandle, num_workers: usize) -> Result<Self> {
        let pool = Rc::new(ThreadPool::new(num_workers)?);
        loop_handle.register_fd(pool.wake_fd())?;

        let shared = Rc::new(Shared {
            events: RefCell::new(HashMap::new()),
        });

        let drain_pool = Rc::clone(&pool);
        let drain_shared = Rc::clone(&shared);
        let mut drain_handle = loop_handle;
        drain_handle.builder().background(true).spawn(move || {
            let wake_fd = drain_pool.wake_fd();
            let mut handle = drain_handle;
            loop {
                // `INFINITE` never reports `WouldBlock`; the only way out
                // of this loop is the wake fd itself going away.
                if handle.read(wake_fd, &mut [0u8; 64], INFINITE).is_err() {
                    break;
                }
                drain_pool.drain_wake_pipe();
                for id in drain_pool.drain_completed() {
                    if let Some(event) = drain_shared.events.borrow_mut().remove(&id) {
                        event.get().trigger();
                    }
                }
            }
        });

        Ok(Async {
            loop_handle,
            pool,
            shared,
        })
    }

    /// Runs `f` on a worker thread, suspending the calling fiber until it
    /// finishes. Interrupting the caller while this is suspended unwinds
    /// out of `call` the same way any other blocking primitive does; the
    /// task itself is pulled back out of the queue if a worker hasn't
    /// started it yet, and otherwise left to finish and its result
    /// discarded.
    pub fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let task = self.pool.execute(f);
        let id = task.id();

        let mut handle = self.loop_handle;
        let event = Rc::new(TaskEvent::new(&mut handle));
        self.shared.events.borrow_mut().insert(id, Rc::clone(&event));

        struct Cleanup<'a> {
            async_: &'a Async,
            id: u64,
        }
        impl Drop for Cleanup<'_> {
            fn drop(&mut self) {
                self.async_.shared.events.borrow_mut().remove(&self.id);
                self.async_.pool.try_cancel(self.id);
            }
        }
        let _cleanup = Cleanup { async_: self, id };

        event.get().wait();

        match task.take_result() {
            Some(Ok(value)) => Ok(value),
            Some(Err(payload)) => Err(Error::WorkerPanicked(panic_message(&payload))),
            None => unreachable!("task event fired before its result was recorded"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker thread panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::Loop;
    use std::thread;

    #[test]
    fn call_runs_on_a_worker_and_returns_its_value() {
        let mut event_loop = Loop::new().unwrap();
        let handle = event_loop.handle();
        let async_ = Async::new(handle, 2).unwrap();

        let result = Rc::new(RefCell::new(None));
        let result_in_fiber = Rc::clone(&result);
        event_loop.spawn(move || {
            let value = async_.call(|| 21 * 2).unwrap();
            *result_in_fiber.borrow_mut() = Some(value);
        });
        event_loop.run();

        assert_eq!(*result.borrow(), Some(42));
    }

    #[test]
    fn call_surfaces_a_worker_panic() {
        let mut event_loop = Loop::new().unwrap();
        let handle = event_loop.handle();
        let async_ = Async::new(handle, 1).unwrap();

        let saw_panic = Rc::new(RefCell::new(false));
        let saw_panic_in_fiber = Rc::clone(&saw_panic);
        event_loop.spawn(move || {
            let outcome = async_.call(|| -> i32 { panic!("boom") });
            *saw_panic_in_fiber.borrow_mut() = matches!(outcome, Err(Error::WorkerPanicked(_)));
        });
        event_loop.run();

        assert!(*saw_panic.borrow());
    }

    #[test]
    fn interrupting_the_caller_unwinds_the_call() {
        let mut event_loop = Loop::new().unwrap();
        let handle = event_loop.handle();
        let async_ = Rc::new(Async::new(handle, 1).unwrap());

        let ran_to_completion = Rc::new(RefCell::new(false));
        let ran_to_completion_in_fiber = Rc::clone(&ran_to_completion);
        let async_in_fiber = Rc::clone(&async_);
        let join = event_loop.spawn(move || {
            let _ = async_in_fiber.call(|| {
                thread::sleep(std::time::Duration::from_millis(50));
            });
            *ran_to_completion_in_fiber.borrow_mut() = true;
        });
        join.interrupt();
        event_loop.run();

        assert!(matches!(join.join(), Err(crate::fiber::JoinError::Cancelled)));
        assert!(!*ran_to_completion.borrow());
    }
}
