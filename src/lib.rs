//! A single-threaded, user-space concurrency runtime built on stackful
//! fibers, an epoll-based readiness poller, and a millisecond timer
//! wheel, with a thread pool for offloading genuinely blocking calls.
//!
//! Application code runs inside fibers (green threads) spawned onto a
//! [`runtime::Runtime`] and written in ordinary blocking style:
//! [`event_loop::Loop`]'s I/O methods, and the synchronization
//! primitives in [`sync`] and [`fiber`], transparently suspend the
//! calling fiber rather than the underlying OS thread. A second,
//! multi-threaded pool (wired in by [`async_bridge::Async`]) is there
//! for the calls that can't be made non-blocking at all.
//!
//! ```no_run
//! let mut runtime = weave::runtime::Runtime::new().unwrap();
//! let mut handle = runtime.handle();
//! runtime.spawn(move || {
//!     weave::fiber::yield_now();
//!     let _ = handle.read(0, &mut [0u8; 16], weave::event_loop::INFINITE);
//! });
//! runtime.run();
//! ```
//!
//! - [Arena-indexed allocation](arena) and the [intrusive list](list) and
//!   [binary heap](heap) built on top of it
//! - [Fibers: stacks, scheduling, mutexes, latches, condition variables](fiber)
//! - [Synchronization primitives not tied to a single fiber's lifetime](sync)
//! - [Non-blocking I/O and the timer wheel](io)
//! - [The event loop](event_loop)
//! - [The blocking-call worker pool](pool)
//! - [Bridging the pool into the fiber scheduler](async_bridge)
//! - [Top-level configuration](runtime)
//! - [Error handling](error)

pub mod arena;
pub mod async_bridge;
mod buffer;
pub mod error;
pub mod event_loop;
pub mod fiber;
pub mod heap;
pub mod io;
pub mod list;
pub mod pool;
pub mod runtime;
pub mod sync;

pub use error::{Error, Result};
