//! Fiber-blocking synchronization primitives: [`Event`] and [`Semaphore`].
//!
//! Both hold a raw pointer to the owning [`crate::fiber::scheduler::Scheduler`],
//! established when a [`crate::event_loop::Loop`] constructs them (see
//! `Loop::make_event`/`Loop::make_semaphore`), mirroring the original
//! design's `Semaphore(Scheduler *, ...)` constructor rather than relying
//! on ambient/global state. A handle must not outlive the loop that made
//! it.

mod event;
mod semaphore;

pub use event::Event;
pub use semaphore::Semaphore;
