//! An edge-triggered, epoll-backed readiness multiplexer.
//!
//! Registrations are batched: `add_waiter`/`remove_waiter` only touch
//! this process's own bookkeeping and mark the fd's context dirty; the
//! actual `epoll_ctl` ADD/MOD/DEL calls happen in one pass at the start
//! of `wait`, mirroring the original design's dirty-list flush step.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

use crate::buffer::Buffer;
use crate::fiber::FiberId;

#[derive(Clone, Copy)]
#[repr(transparent)]
struct RawEvent(libc::epoll_event);

impl Default for RawEvent {
    fn default() -> Self {
        RawEvent(unsafe { std::mem::zeroed() })
    }
}

struct Waiter {
    mask: u32,
    fiber: FiberId,
}

struct FdContext {
    current_mask: u32,
    pending_mask: u32,
    dirty: bool,
    waiters: Vec<Waiter>,
}

impl FdContext {
    fn recompute_pending(&mut self) {
        let mask = self.waiters.iter().fold(0u32, |acc, w| acc | w.mask);
        if mask != self.pending_mask {
            self.pending_mask = mask;
            self.dirty = true;
        }
    }
}

pub struct IoPoller {
    epoll_fd: RawFd,
    contexts: HashMap<RawFd, FdContext>,
    dirty: Vec<RawFd>,
    events: Buffer<RawEvent>,
}

const INITIAL_EVENT_CAPACITY: usize = 64;

impl IoPoller {
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(INITIAL_EVENT_CAPACITY)
    }

    /// Like [`IoPoller::new`], but with a caller-chosen initial capacity
    /// for the `epoll_wait` event buffer instead of the built-in default.
    /// Still grows (doubling) if a wait ever fills it exactly.
    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut events = Buffer::new();
        events.set_length(capacity.max(1));
        Ok(IoPoller {
            epoll_fd,
            contexts: HashMap::new(),
            dirty: Vec::new(),
            events,
        })
    }

    /// Registers interest in `mask` (a bitwise-OR of `libc::EPOLLIN` /
    /// `libc::EPOLLOUT`) on `fd` on behalf of `fiber`. One-shot: the
    /// waiter is removed the moment a matching event is reported.
    pub fn add_waiter(&mut self, fd: RawFd, mask: u32, fiber: FiberId) {
        let context = self.contexts.entry(fd).or_insert_with(|| FdContext {
            current_mask: 0,
            pending_mask: 0,
            dirty: false,
            waiters: Vec::new(),
        });
        context.waiters.push(Waiter { mask, fiber });
        context.recompute_pending();
        if context.dirty && !self.dirty.contains(&fd) {
            self.dirty.push(fd);
        }
    }

    /// Cancels a specific waiter, e.g. when its fiber is interrupted
    /// before the fd ever became ready.
    pub fn remove_waiter(&mut self, fd: RawFd, fiber: FiberId) {
        if let Some(context) = self.contexts.get_mut(&fd) {
            context.waiters.retain(|w| w.fiber != fiber);
            context.recompute_pending();
            if context.dirty && !self.dirty.contains(&fd) {
                self.dirty.push(fd);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        for fd in self.dirty.drain(..) {
            let (current, pending, existed_before) = {
                let context = match self.contexts.get(&fd) {
                    Some(c) => c,
                    None => continue,
                };
                (context.current_mask, context.pending_mask, true)
            };
            let _ = existed_before;

            let op = if current == 0 && pending != 0 {
                libc::EPOLL_CTL_ADD
            } else if current != 0 && pending == 0 {
                libc::EPOLL_CTL_DEL
            } else if current != pending {
                libc::EPOLL_CTL_MOD
            } else {
                if let Some(context) = self.contexts.get_mut(&fd) {
                    context.dirty = false;
                }
                continue;
            };

            let mut event: libc::epoll_event = unsafe { std::mem::zeroed() };
            event.events = pending | libc::EPOLLET as u32;
            event.u64 = fd as u64;

            let result = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
            if result != 0 {
                let err = io::Error::last_os_error();
                if op == libc::EPOLL_CTL_ADD {
                    // Never actually registered with the kernel; drop our
                    // bookkeeping rather than leave it claiming otherwise.
                    self.contexts.remove(&fd);
                }
                return Err(err);
            }

            if op == libc::EPOLL_CTL_DEL {
                self.contexts.remove(&fd);
            } else if let Some(context) = self.contexts.get_mut(&fd) {
                context.current_mask = pending;
                context.dirty = false;
            }
        }
        Ok(())
    }

    /// Flushes pending registration changes, then blocks for up to
    /// `timeout_ms` (negative = forever) waiting for readiness. A single
    /// attempt: `Err` with `ErrorKind::Interrupted` on `EINTR` is handed
    /// straight back so the caller can recompute the timeout against a
    /// freshly-sampled clock before retrying, rather than this losing
    /// track of how much of the original wait is left. Returns the
    /// one-shot waiters that should be resumed, paired with the events
    /// each fd actually reported.
    pub fn wait(&mut self, timeout_ms: i32) -> io::Result<Vec<(FiberId, u32)>> {
        self.flush()?;

        let capacity = self.events.len();
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_slice().as_mut_ptr().cast(),
                capacity as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = n as usize;
        let mut ready = self.dispatch_ready(n);

        if n == capacity {
            // The buffer filled exactly; more may be pending right now.
            // Double it and re-poll non-blockingly rather than assume
            // we've seen everything that's ready.
            self.events.set_length(capacity * 2);
            if let Ok(mut more) = self.wait(0) {
                ready.append(&mut more);
            }
        }
        Ok(ready)
    }

    fn dispatch_ready(&mut self, n: usize) -> Vec<(FiberId, u32)> {
        let mut ready = Vec::new();
        for i in 0..n {
            let event = self.events.as_slice()[i].0;
            let fd = event.u64 as RawFd;
            let revents = event.events;
            if let Some(context) = self.contexts.get_mut(&fd) {
                // A hangup or error always wakes an interested waiter, even
                // one that only ever asked for readability or writability --
                // a half-closed fd has to be observable however it's being
                // watched.
                const ALWAYS_WAKES: u32 = (libc::EPOLLHUP | libc::EPOLLERR) as u32;
                let mut remaining = Vec::with_capacity(context.waiters.len());
                for waiter in context.waiters.drain(..) {
                    let woken_by = revents & (waiter.mask | ALWAYS_WAKES);
                    if woken_by != 0 {
                        ready.push((waiter.fiber, woken_by));
                    } else {
                        remaining.push(waiter);
                    }
                }
                context.waiters = remaining;
                context.recompute_pending();
                if context.dirty && !self.dirty.contains(&fd) {
                    self.dirty.push(fd);
                }
            }
        }
        ready
    }
}

impl Drop for IoPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_fiber(index: u32) -> FiberId {
        FiberId::from_raw_parts(index, 0)
    }

    fn set_nonblocking(fd: RawFd) {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }

    #[test]
    fn reported_readiness_never_exceeds_what_was_requested() {
        let mut poller = IoPoller::new().unwrap();
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);
        set_nonblocking(r);

        // Only ever asked about readability, never writability.
        poller.add_waiter(r, libc::EPOLLIN as u32, dummy_fiber(1));
        unsafe {
            libc::write(w, b"x".as_ptr().cast(), 1);
        }

        let ready = poller.wait(1000).unwrap();
        assert_eq!(ready.len(), 1);
        let (fiber, mask) = ready[0];
        assert_eq!(fiber, dummy_fiber(1));
        assert_eq!(
            mask & !(libc::EPOLLIN as u32),
            0,
            "reported bits outside the requested mask: {mask:#x}"
        );

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn a_one_shot_waiter_is_not_reported_twice() {
        let mut poller = IoPoller::new().unwrap();
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);
        set_nonblocking(r);

        poller.add_waiter(r, libc::EPOLLIN as u32, dummy_fiber(7));
        unsafe {
            libc::write(w, b"y".as_ptr().cast(), 1);
        }
        let first = poller.wait(1000).unwrap();
        assert_eq!(first.len(), 1);

        // Nothing registered anymore; a fresh, short wait sees nothing.
        let second = poller.wait(0).unwrap();
        assert!(second.is_empty());

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
