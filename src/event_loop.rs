//! The event loop: alternates the fiber scheduler against the I/O poller
//! and timer wheel, and is the sole owner of both, handing out
//! synchronization primitives and nonblocking I/O methods built on top of
//! them.
//!
//! Grounded on the original design's `Loop::run` (drain runnable fibers,
//! collect ready I/O watchers, collect expired timers, repeat until no
//! foreground fiber remains) and its `readFile`/`writeFile` templates
//! (attempt the syscall, register a one-shot watcher and retry on
//! `EAGAIN`, retry in place on `EINTR`, propagate anything else).

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::fiber::scheduler::Scheduler;
use crate::fiber::{Builder, Cond, FiberId, JoinHandle, Latch, Mutex};
use crate::io::clock::TimerId;
use crate::io::{IoClock, IoPoller};
use crate::sync::{Event, Semaphore};

/// Negative: wait forever. Zero: a non-blocking probe. Positive: wait up
/// to that many milliseconds before failing with [`Error::TimedOut`].
pub type Timeout = i64;

pub const INFINITE: Timeout = -1;
pub const NON_BLOCKING: Timeout = 0;

pub struct Loop {
    scheduler: Box<Scheduler>,
    poller: IoPoller,
    clock: IoClock,
    timer_waiters: HashMap<TimerId, FiberId>,
}

/// Default initial capacity of the poller's `epoll_wait` event buffer;
/// see [`Loop::with_config`] to override it.
pub const DEFAULT_EVENT_BUFFER_CAPACITY: usize = 64;

impl Loop {
    pub fn new() -> io::Result<Self> {
        Self::with_stack_size(256 * 1024)
    }

    pub fn with_stack_size(default_stack_size: usize) -> io::Result<Self> {
        Self::with_config(default_stack_size, DEFAULT_EVENT_BUFFER_CAPACITY)
    }

    /// Full constructor: default fiber stack size plus the poller's
    /// initial event-buffer capacity. Used by [`crate::runtime::Builder`]
    /// to expose both as configuration knobs.
    pub fn with_config(default_stack_size: usize, event_buffer_capacity: usize) -> io::Result<Self> {
        Ok(Loop {
            scheduler: Box::new(Scheduler::new(default_stack_size)),
            poller: IoPoller::with_capacity(event_buffer_capacity)?,
            clock: IoClock::new(),
            timer_waiters: HashMap::new(),
        })
    }

    fn scheduler_ptr(&mut self) -> *mut Scheduler {
        &mut *self.scheduler as *mut Scheduler
    }

    // -- fiber spawning ----------------------------------------------------

    pub fn builder(&mut self) -> Builder {
        Builder::new(self.scheduler_ptr())
    }

    pub fn spawn<F, T>(&mut self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        self.builder().spawn(f)
    }

    // -- synchronization primitive factories --------------------------------

    pub fn make_event(&mut self) -> Event {
        Event::new(self.scheduler_ptr())
    }

    pub fn make_semaphore(&mut self, init: i64, min: i64, max: i64) -> Semaphore {
        Semaphore::new(self.scheduler_ptr(), init, min, max)
    }

    pub fn make_latch(&mut self) -> Latch {
        Latch::new(self.scheduler_ptr())
    }

    pub fn make_cond(&mut self) -> Cond {
        Cond::new(self.scheduler_ptr())
    }

    pub fn make_mutex<T>(&mut self, value: T) -> Mutex<T> {
        Mutex::new(self.scheduler_ptr(), value)
    }

    // -- the alternation loop ------------------------------------------------

    /// Runs until only background fibers remain (or none at all). A
    /// panic raised by any foreground fiber's body propagates out of
    /// this call once the loop would otherwise have returned normally.
    pub fn run(&mut self) {
        loop {
            self.scheduler.run();
            if self.scheduler.number_of_foreground_fibers() == 0 {
                break;
            }
            self.poll_once();
        }
    }

    fn poll_once(&mut self) {
        loop {
            self.clock.restart();
            let timeout_ms = self.next_timeout_ms();
            match self.poller.wait(timeout_ms) {
                Ok(ready) => {
                    for (fiber, _revents) in ready {
                        self.scheduler.resume(fiber);
                    }
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("I/O poller wait failed: {e}");
                    break;
                }
            }
        }
        for timer in self.clock.drain_expired() {
            if let Some(fiber) = self.timer_waiters.remove(&timer) {
                self.scheduler.resume(fiber);
            }
        }
    }

    fn next_timeout_ms(&self) -> i32 {
        match self.clock.next_expiry_ms() {
            Some(expiry) => {
                let now = self.clock.now_ms();
                if expiry <= now {
                    0
                } else {
                    (expiry - now).min(i32::MAX as u64) as i32
                }
            }
            None => -1,
        }
    }

    // -- fd lifecycle --------------------------------------------------------

    /// Puts `fd` in non-blocking mode so this loop's I/O methods can use
    /// it. Pair with [`Loop::unregister_fd`] once done.
    pub fn register_fd(&mut self, fd: RawFd) -> io::Result<()> {
        set_nonblocking(fd, true)
    }

    /// Restores blocking mode. Any waiters still registered on `fd` with
    /// the poller are dropped; resuming them is the caller's
    /// responsibility if it interrupts in-flight operations first.
    pub fn unregister_fd(&mut self, fd: RawFd) -> io::Result<()> {
        set_nonblocking(fd, false)
    }

    // -- the shared nonblocking-retry contract -------------------------------

    /// Implements the attempt/suspend/retry contract every nonblocking
    /// I/O method below is built from: try `op`, and on `WouldBlock`
    /// register a one-shot watcher (plus a timer if `timeout` is
    /// positive), suspend, and retry once resumed. `EINTR` retries in
    /// place without suspending. Any other error propagates.
    fn nonblocking<F, T>(&mut self, fd: RawFd, writable: bool, timeout: Timeout, mut op: F) -> Result<T>
    where
        F: FnMut() -> io::Result<T>,
    {
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if timeout == NON_BLOCKING {
                        return Err(Error::WouldBlock);
                    }
                    self.suspend_for_readiness(fd, writable, timeout)?;
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    fn suspend_for_readiness(&mut self, fd: RawFd, writable: bool, timeout: Timeout) -> Result<()> {
        let fiber = self
            .scheduler
            .current_fiber()
            .expect("nonblocking I/O called outside a fiber");
        let mask = if writable {
            libc::EPOLLOUT as u32
        } else {
            libc::EPOLLIN as u32
        };
        self.poller.add_waiter(fd, mask, fiber);

        let timer = if timeout > 0 {
            self.clock.start();
            let id = self.clock.set_timer(Duration::from_millis(timeout as u64));
            self.timer_waiters.insert(id, fiber);
            Some(id)
        } else {
            None
        };

        // `suspend_current` unwinds straight through on an interrupt,
        // never returning control to the code that would otherwise clean
        // this waiter up, so the cleanup lives in a guard's `Drop` instead.
        let guard = ReadinessGuard {
            poller: &mut self.poller,
            clock: &mut self.clock,
            timer_waiters: &mut self.timer_waiters,
            fd,
            fiber,
            timer,
        };

        self.scheduler.suspend_current();

        let timed_out = timer.is_some_and(|id| !guard.timer_waiters.contains_key(&id));
        drop(guard);
        if timed_out {
            Err(Error::TimedOut)
        } else {
            Ok(())
        }
    }

    /// Suspends the calling fiber for `duration`, independent of any fd.
    pub fn sleep(&mut self, duration: Duration) -> Result<()> {
        let fiber = self
            .scheduler
            .current_fiber()
            .expect("sleep called outside a fiber");
        self.clock.start();
        let id = self.clock.set_timer(duration);
        self.timer_waiters.insert(id, fiber);

        let guard = SleepGuard {
            clock: &mut self.clock,
            timer_waiters: &mut self.timer_waiters,
            id,
        };
        self.scheduler.suspend_current();
        drop(guard);
        Ok(())
    }

    // -- nonblocking syscall wrappers ----------------------------------------

    pub fn read(&mut self, fd: RawFd, buf: &mut [u8], timeout: Timeout) -> Result<usize> {
        self.nonblocking(fd, false, timeout, || {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            check_isize(n)
        })
    }

    pub fn write(&mut self, fd: RawFd, buf: &[u8], timeout: Timeout) -> Result<usize> {
        self.nonblocking(fd, true, timeout, || {
            let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
            check_isize(n)
        })
    }

    pub fn recv(&mut self, fd: RawFd, buf: &mut [u8], flags: i32, timeout: Timeout) -> Result<usize> {
        self.nonblocking(fd, false, timeout, || {
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags) };
            check_isize(n)
        })
    }

    pub fn send(&mut self, fd: RawFd, buf: &[u8], flags: i32, timeout: Timeout) -> Result<usize> {
        self.nonblocking(fd, true, timeout, || {
            let n = unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), flags) };
            check_isize(n)
        })
    }

    /// Accepts one connection on `listen_fd`, putting the accepted
    /// socket in non-blocking mode before returning it (so it's usable
    /// with this loop's other methods without a separate
    /// `register_fd` call).
    pub fn accept(&mut self, listen_fd: RawFd, timeout: Timeout) -> Result<RawFd> {
        self.nonblocking(listen_fd, false, timeout, || {
            let fd = unsafe {
                libc::accept4(
                    listen_fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(fd)
            }
        })
    }

    /// Connects `fd` (already non-blocking) to `addr`, suspending until
    /// the connect completes or fails.
    pub fn connect(
        &mut self,
        fd: RawFd,
        addr: *const libc::sockaddr,
        addr_len: libc::socklen_t,
        timeout: Timeout,
    ) -> Result<()> {
        let first = unsafe { libc::connect(fd, addr, addr_len) };
        if first == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock
            && err.raw_os_error() != Some(libc::EINPROGRESS)
        {
            return Err(Error::from(err));
        }

        self.suspend_for_readiness(fd, true, timeout)?;

        let mut sockerr: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                (&mut sockerr as *mut libc::c_int).cast(),
                &mut len,
            )
        };
        if rc != 0 {
            return Err(Error::from(io::Error::last_os_error()));
        }
        if sockerr != 0 {
            return Err(Error::from(io::Error::from_raw_os_error(sockerr)));
        }
        Ok(())
    }

    /// Opens a pair of connected, non-blocking, close-on-exec pipe ends.
    pub fn pipe(&mut self) -> Result<(RawFd, RawFd)> {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(Error::from(io::Error::last_os_error()));
        }
        Ok((fds[0], fds[1]))
    }

    pub fn close(&mut self, fd: RawFd) -> Result<()> {
        let rc = unsafe { libc::close(fd) };
        if rc != 0 {
            Err(Error::from(io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }
}

/// A cheap, `Copy` handle to a [`Loop`], for fiber bodies to capture by
/// value so they can reach the loop's I/O methods without it being
/// threaded through every call (the same raw-pointer idiom
/// [`crate::sync::Event`] and friends use to reach the scheduler). The
/// loop must outlive, and never move behind, any handle still in use.
#[derive(Clone, Copy)]
pub struct LoopHandle(*mut Loop);

impl Loop {
    pub fn handle(&mut self) -> LoopHandle {
        LoopHandle(self as *mut Loop)
    }
}

impl LoopHandle {
    fn get(&mut self) -> &mut Loop {
        unsafe { &mut *self.0 }
    }

    pub fn builder(&mut self) -> Builder {
        self.get().builder()
    }

    pub fn spawn<F, T>(&mut self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        self.get().spawn(f)
    }

    pub fn make_event(&mut self) -> Event {
        self.get().make_event()
    }

    pub fn make_semaphore(&mut self, init: i64, min: i64, max: i64) -> Semaphore {
        self.get().make_semaphore(init, min, max)
    }

    pub fn make_latch(&mut self) -> Latch {
        self.get().make_latch()
    }

    pub fn make_cond(&mut self) -> Cond {
        self.get().make_cond()
    }

    pub fn make_mutex<T>(&mut self, value: T) -> Mutex<T> {
        self.get().make_mutex(value)
    }

    pub fn register_fd(&mut self, fd: RawFd) -> io::Result<()> {
        self.get().register_fd(fd)
    }

    pub fn unregister_fd(&mut self, fd: RawFd) -> io::Result<()> {
        self.get().unregister_fd(fd)
    }

    pub fn read(&mut self, fd: RawFd, buf: &mut [u8], timeout: Timeout) -> Result<usize> {
        self.get().read(fd, buf, timeout)
    }

    pub fn write(&mut self, fd: RawFd, buf: &[u8], timeout: Timeout) -> Result<usize> {
        self.get().write(fd, buf, timeout)
    }

    pub fn recv(&mut self, fd: RawFd, buf: &mut [u8], flags: i32, timeout: Timeout) -> Result<usize> {
        self.get().recv(fd, buf, flags, timeout)
    }

    pub fn send(&mut self, fd: RawFd, buf: &[u8], flags: i32, timeout: Timeout) -> Result<usize> {
        self.get().send(fd, buf, flags, timeout)
    }

    pub fn accept(&mut self, listen_fd: RawFd, timeout: Timeout) -> Result<RawFd> {
        self.get().accept(listen_fd, timeout)
    }

    pub fn connect(
        &mut self,
        fd: RawFd,
        addr: *const libc::sockaddr,
        addr_len: libc::socklen_t,
        timeout: Timeout,
    ) -> Result<()> {
        self.get().connect(fd, addr, addr_len, timeout)
    }

    pub fn pipe(&mut self) -> Result<(RawFd, RawFd)> {
        self.get().pipe()
    }

    pub fn close(&mut self, fd: RawFd) -> Result<()> {
        self.get().close(fd)
    }

    pub fn sleep(&mut self, duration: Duration) -> Result<()> {
        self.get().sleep(duration)
    }
}

struct ReadinessGuard<'a> {
    poller: &'a mut IoPoller,
    clock: &'a mut IoClock,
    timer_waiters: &'a mut HashMap<TimerId, FiberId>,
    fd: RawFd,
    fiber: FiberId,
    timer: Option<TimerId>,
}

impl Drop for ReadinessGuard<'_> {
    fn drop(&mut self) {
        self.poller.remove_waiter(self.fd, self.fiber);
        if let Some(id) = self.timer {
            self.timer_waiters.remove(&id);
            self.clock.cancel_timer(id);
        }
    }
}

struct SleepGuard<'a> {
    clock: &'a mut IoClock,
    timer_waiters: &'a mut HashMap<TimerId, FiberId>,
    id: TimerId,
}

impl Drop for SleepGuard<'_> {
    fn drop(&mut self) {
        self.timer_waiters.remove(&self.id);
        self.clock.cancel_timer(self.id);
    }
}

fn check_isize(n: isize) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let new_flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, new_flags) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn is_nonblocking(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_unregister_restores_blocking_mode() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (r, w) = (fds[0], fds[1]);
        assert!(!is_nonblocking(r));

        let mut event_loop = Loop::new().unwrap();
        event_loop.register_fd(r).unwrap();
        assert!(is_nonblocking(r));

        event_loop.unregister_fd(r).unwrap();
        assert!(!is_nonblocking(r));

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn sleep_suspends_until_the_timer_fires() {
        let mut event_loop = Loop::new().unwrap();
        let start = std::time::Instant::now();
        event_loop.spawn(move || {});
        let mut handle = event_loop.handle();
        event_loop.spawn(move || {
            handle.sleep(Duration::from_millis(20)).unwrap();
        });
        event_loop.run();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
