//! A fixed-size worker-thread pool for offloading blocking calls out of
//! the single fiber-scheduler thread. Grounded on the original design's
//! `ThreadPool`: a mutex/condvar-protected FIFO queue, a sentinel value
//! per worker to unwind them on shutdown, and a pipe the loop thread
//! polls to learn when work has completed without itself blocking.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam_queue::SegQueue;

type Job = Box<dyn FnOnce() + Send>;

enum QueueItem {
    Job(u64, Job),
    Shutdown,
}

struct Inner {
    queue: Mutex<VecDeque<QueueItem>>,
    not_empty: Condvar,
}

/// A task handed to [`ThreadPool::execute`]: an id for cancellation
/// bookkeeping plus the slot its result (or panic payload) lands in.
pub struct PendingTask<T> {
    id: u64,
    slot: Arc<Mutex<Option<thread::Result<T>>>>,
}

impl<T> PendingTask<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Takes the result if the worker has finished; `None` otherwise.
    pub fn take_result(&self) -> Option<thread::Result<T>> {
        self.slot.lock().unwrap().take()
    }
}

pub struct ThreadPool {
    inner: Arc<Inner>,
    threads: Vec<thread::JoinHandle<()>>,
    completed: Arc<SegQueue<u64>>,
    wake_reader: RawFd,
    wake_writer: RawFd,
    next_id: Mutex<u64>,
    pending_ids: Arc<Mutex<VecDeque<u64>>>,
}

impl ThreadPool {
    pub fn new(num_workers: usize) -> io::Result<Self> {
        let mut fds = [0i32; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let (wake_reader, wake_writer) = (fds[0], fds[1]);

        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        });
        let completed = Arc::new(SegQueue::new());

        let threads = (0..num_workers.max(1))
            .map(|_| {
                let inner = Arc::clone(&inner);
                let completed = Arc::clone(&completed);
                thread::spawn(move || worker_loop(inner, completed, wake_writer))
            })
            .collect();

        Ok(ThreadPool {
            inner,
            threads,
            completed,
            wake_reader,
            wake_writer,
            next_id: Mutex::new(0),
            pending_ids: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    /// The loop registers this fd with its poller; a readable byte means
    /// [`ThreadPool::drain_completed`] has work to report.
    pub fn wake_fd(&self) -> RawFd {
        self.wake_reader
    }

    /// Drains whatever wake-up bytes have accumulated on the wake pipe.
    /// Call once per readiness notification, before `drain_completed`.
    pub fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe { libc::read(self.wake_reader, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    /// Ids of tasks that have finished since the last call.
    pub fn drain_completed(&self) -> Vec<u64> {
        let mut ids = Vec::new();
        while let Some(id) = self.completed.pop() {
            ids.push(id);
        }
        ids
    }

    pub fn execute<F, T>(&self, f: F) -> PendingTask<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = {
            let mut next = self.next_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        let slot: Arc<Mutex<Option<thread::Result<T>>>> = Arc::new(Mutex::new(None));
        let slot_in_job = Arc::clone(&slot);
        let completed = Arc::clone(&self.completed);
        let wake_writer = self.wake_writer;

        self.pending_ids.lock().unwrap().push_back(id);
        let pending_ids = Arc::clone(&self.pending_ids);

        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            *slot_in_job.lock().unwrap() = Some(result);
            pending_ids.lock().unwrap().retain(|&pid| pid != id);
            completed.push(id);
            notify_wake_pipe(wake_writer);
        });

        let mut queue = self.inner.queue.lock().unwrap();
        queue.push_back(QueueItem::Job(id, job));
        self.inner.not_empty.notify_one();
        drop(queue);

        PendingTask { id, slot }
    }

    /// Removes a task from the queue before any worker picked it up.
    /// Returns `true` if it was removed this way (so it will never run);
    /// `false` means a worker already dequeued it and it must be allowed
    /// to finish normally.
    pub fn try_cancel(&self, id: u64) -> bool {
        let mut still_pending = self.pending_ids.lock().unwrap();
        if let Some(pos) = still_pending.iter().position(|&pid| pid == id) {
            still_pending.remove(pos);
            drop(still_pending);
            let mut queue = self.inner.queue.lock().unwrap();
            queue.retain(|item| !matches!(item, QueueItem::Job(pid, _) if *pid == id));
            true
        } else {
            false
        }
    }
}

fn notify_wake_pipe(fd: RawFd) {
    let byte = [1u8];
    loop {
        let n = unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
        if n >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            break;
        }
    }
}

fn worker_loop(inner: Arc<Inner>, _completed: Arc<SegQueue<u64>>, _wake_writer: RawFd) {
    loop {
        let job = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if let Some(item) = queue.pop_front() {
                    break item;
                }
                queue = inner.not_empty.wait(queue).unwrap();
            }
        };
        match job {
            QueueItem::Shutdown => break,
            QueueItem::Job(_, job) => job(),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut queue = self.inner.queue.lock().unwrap();
            for _ in 0..self.threads.len() {
                queue.push_back(QueueItem::Shutdown);
            }
            self.inner.not_empty.notify_all();
        }
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        unsafe {
            libc::close(self.wake_reader);
            libc::close(self.wake_writer);
        }
    }
}
