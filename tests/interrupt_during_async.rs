//! A fiber offloads a sleeping task; a second fiber interrupts it while
//! the task is still in flight. Exactly one of two outcomes is ever
//! observed — the call completing normally, or the interrupt unwinding
//! it first — never both, never neither.

use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use weave::async_bridge::Async;
use weave::event_loop::Loop;

#[test]
fn interrupting_the_caller_yields_exactly_one_outcome() {
    let mut event_loop = Loop::new().unwrap();
    let handle = event_loop.handle();
    let async_ = Rc::new(Async::new(handle, 1).unwrap());

    let x = Rc::new(Cell::new(0));

    let x_in_fiber = Rc::clone(&x);
    let async_in_fiber = Rc::clone(&async_);
    let worker = event_loop.spawn(move || {
        // `x_in_fiber.set(1)` is only reached if `call` returns normally;
        // an interrupt unwinds straight out of it.
        let _ = async_in_fiber.call(|| {
            thread::sleep(Duration::from_millis(100));
        });
        x_in_fiber.set(1);
    });
    let target = worker.fiber_id();

    event_loop.spawn(move || {
        weave::fiber::yield_now();
        weave::fiber::interrupt(target);
    });

    event_loop.run();

    match worker.join() {
        Ok(()) => {
            assert_eq!(x.get(), 1, "join succeeded but the completion branch never ran");
        }
        Err(weave::fiber::JoinError::Cancelled) => {
            assert_eq!(x.get(), 0, "cancelled but the completion branch still ran");
            x.set(2);
        }
        Err(weave::fiber::JoinError::Panicked(_)) => {
            panic!("unexpected panic other than cancellation")
        }
    }

    assert!(x.get() == 1 || x.get() == 2);
}
