//! Top-level runtime configuration.
//!
//! Mirrors the fluent-setter/`build()` shape of [`crate::fiber::Builder`],
//! generalized to the whole runtime rather than a single fiber: pick a
//! default stack size, a worker-pool size, and a poller buffer capacity,
//! then get back a [`Runtime`] bundling the event loop with its
//! blocking-call offloader.

use std::io;

use crate::async_bridge::Async;
use crate::event_loop::{Loop, LoopHandle};
use crate::fiber::JoinHandle;

const DEFAULT_STACK_SIZE: usize = 256 * 1024;
const DEFAULT_WORKER_THREADS: usize = 4;

/// Builds a [`Runtime`]. All setters have defaults matching what
/// [`crate::event_loop::Loop::new`] and the worker pool already use on
/// their own, so `Builder::new().build()` behaves like constructing
/// those directly.
pub struct Builder {
    stack_size: usize,
    worker_threads: usize,
    event_buffer_capacity: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            stack_size: DEFAULT_STACK_SIZE,
            worker_threads: DEFAULT_WORKER_THREADS,
            event_buffer_capacity: crate::event_loop::DEFAULT_EVENT_BUFFER_CAPACITY,
        }
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default stack size for fibers spawned without an explicit
    /// [`crate::fiber::Builder::stack_size`] override.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Number of OS threads backing the blocking-call offloader.
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count.max(1);
        self
    }

    /// Initial capacity of the poller's `epoll_wait` event buffer. Only
    /// matters for tuning; the poller grows it on its own if it's ever
    /// too small.
    pub fn event_buffer_capacity(mut self, capacity: usize) -> Self {
        self.event_buffer_capacity = capacity;
        self
    }

    pub fn build(self) -> io::Result<Runtime> {
        let mut event_loop = Loop::with_config(self.stack_size, self.event_buffer_capacity)?;
        let handle = event_loop.handle();
        let offload = Async::new(handle, self.worker_threads)?;
        Ok(Runtime { event_loop, offload })
    }
}

/// An event loop paired with its blocking-call offloader, ready to have
/// fibers spawned onto it and run.
pub struct Runtime {
    event_loop: Loop,
    offload: Async,
}

impl Runtime {
    /// A runtime with every default from [`Builder`].
    pub fn new() -> io::Result<Self> {
        Builder::new().build()
    }

    /// A cheap handle usable from within spawned fiber bodies to reach
    /// this runtime's I/O methods; see [`LoopHandle`].
    pub fn handle(&mut self) -> LoopHandle {
        self.event_loop.handle()
    }

    pub fn spawn<F, T>(&mut self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        self.event_loop.spawn(f)
    }

    /// The worker-pool bridge, for offloading blocking calls from a
    /// fiber body via [`Async::call`].
    pub fn offload(&self) -> &Async {
        &self.offload
    }

    /// Drives the loop until only background fibers remain.
    pub fn run(&mut self) {
        self.event_loop.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn builder_defaults_produce_a_working_runtime() {
        let mut runtime = Builder::new().build().unwrap();
        let ran = Rc::new(RefCell::new(false));
        let ran_in_fiber = Rc::clone(&ran);
        runtime.spawn(move || {
            *ran_in_fiber.borrow_mut() = true;
        });
        runtime.run();
        assert!(*ran.borrow());
    }

    #[test]
    fn custom_stack_size_and_worker_count_are_accepted() {
        let runtime = Builder::new()
            .stack_size(64 * 1024)
            .worker_threads(1)
            .event_buffer_capacity(8)
            .build();
        assert!(runtime.is_ok());
    }
}
