//! A producer and a consumer fiber share a semaphore-bounded queue: the
//! semaphore's value tracks occupied slots, so a producer reserving a
//! slot before pushing (and a consumer releasing one before popping)
//! keeps the queue from ever growing past its ceiling.

use std::cell::{RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use weave::event_loop::Loop;
use weave::sync::Semaphore;

// Same reasoning as the crate's own `UnsafeCell`-based shared state: the
// producer and consumer are different fibers that alternate through
// `up`/`down`'s suspension points, so a `RefCell` would see overlapping
// borrows that are never truly concurrent.
struct SharedSem(UnsafeCell<Semaphore>);

impl SharedSem {
    fn get(&self) -> &mut Semaphore {
        unsafe { &mut *self.0.get() }
    }
}

const CAPACITY: i64 = 11;

#[test]
fn queue_length_never_exceeds_the_semaphores_ceiling() {
    let mut event_loop = Loop::new().unwrap();
    let sem = Rc::new(SharedSem(UnsafeCell::new(
        event_loop.make_semaphore(0, 0, CAPACITY),
    )));
    let queue = Rc::new(RefCell::new(VecDeque::new()));
    let max_observed = Rc::new(RefCell::new(0usize));

    let sem_producer = Rc::clone(&sem);
    let queue_producer = Rc::clone(&queue);
    let max_observed_producer = Rc::clone(&max_observed);
    event_loop.spawn(move || {
        for item in 0..100 {
            sem_producer.get().up();
            queue_producer.borrow_mut().push_back(item);
            let len = queue_producer.borrow().len();
            let mut max_observed = max_observed_producer.borrow_mut();
            if len > *max_observed {
                *max_observed = len;
            }
        }
    });

    let sem_consumer = Rc::clone(&sem);
    let queue_consumer = Rc::clone(&queue);
    let popped = Rc::new(RefCell::new(Vec::new()));
    let popped_in_fiber = Rc::clone(&popped);
    event_loop.spawn(move || {
        for _ in 0..100 {
            sem_consumer.get().down();
            let item = queue_consumer.borrow_mut().pop_front().unwrap();
            popped_in_fiber.borrow_mut().push(item);
        }
    });

    event_loop.run();

    assert!(*max_observed.borrow() <= CAPACITY as usize);
    assert_eq!(*popped.borrow(), (0..100).collect::<Vec<_>>());
    assert!(queue.borrow().is_empty());
}
