//! A worker task's panic surfaces as a catchable [`weave::Error`] at the
//! call site rather than unwinding the calling fiber, which keeps
//! running and can submit further work afterwards.

use std::cell::Cell;
use std::rc::Rc;

use weave::async_bridge::Async;
use weave::event_loop::Loop;
use weave::Error;

#[test]
fn a_worker_panic_is_caught_and_the_fiber_continues() {
    let mut event_loop = Loop::new().unwrap();
    let handle = event_loop.handle();
    let async_ = Async::new(handle, 2).unwrap();

    let counter = Rc::new(Cell::new(100));
    let counter_in_fiber = Rc::clone(&counter);
    let saw_worker_panic = Rc::new(Cell::new(false));
    let saw_worker_panic_in_fiber = Rc::clone(&saw_worker_panic);

    event_loop.spawn(move || {
        let outcome = async_.call(|| -> i32 { panic!("239") });
        saw_worker_panic_in_fiber.set(matches!(outcome, Err(Error::WorkerPanicked(ref msg)) if msg.contains("239")));

        let current = counter_in_fiber.get();
        let decremented = async_.call(move || current - 1).unwrap();
        counter_in_fiber.set(decremented);
    });
    event_loop.run();

    assert!(saw_worker_panic.get());
    assert_eq!(counter.get(), 99);
}
