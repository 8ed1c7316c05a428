//! A fiber sleeping for a fixed duration actually suspends for at least
//! that long, as measured by the host's wall clock.

use std::time::{Duration, Instant};

use weave::event_loop::Loop;

#[test]
fn sleeping_fiber_wakes_up_after_roughly_its_duration() {
    let mut event_loop = Loop::new().unwrap();
    let mut handle = event_loop.handle();

    let start = Instant::now();
    event_loop.spawn(move || {
        handle.sleep(Duration::from_millis(100)).unwrap();
    });
    event_loop.run();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(100), "elapsed = {elapsed:?}");
    assert!(elapsed < Duration::from_millis(200), "elapsed = {elapsed:?}");
}
