//! A writer fiber pushes several buffer-sized chunks through a pipe and
//! closes its end; a reader fiber drains until EOF. Every byte written
//! is accounted for on the reading side.

use std::cell::RefCell;
use std::rc::Rc;

use weave::event_loop::{Loop, INFINITE};

const CHUNK: usize = 65536;
const CHUNKS: usize = 10;

#[test]
fn reader_drains_every_byte_the_writer_sends_before_closing() {
    let mut event_loop = Loop::new().unwrap();
    let (read_fd, write_fd) = event_loop.pipe().unwrap();

    let mut reader_handle = event_loop.handle();
    let total_read = Rc::new(RefCell::new(0usize));
    let total_read_in_fiber = Rc::clone(&total_read);
    event_loop.spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            let n = reader_handle.read(read_fd, &mut buf, INFINITE).unwrap();
            if n == 0 {
                break;
            }
            *total_read_in_fiber.borrow_mut() += n;
        }
        reader_handle.close(read_fd).unwrap();
    });

    let mut writer_handle = event_loop.handle();
    event_loop.spawn(move || {
        let chunk = vec![0xABu8; CHUNK];
        for _ in 0..CHUNKS {
            let mut written = 0;
            while written < chunk.len() {
                written += writer_handle
                    .write(write_fd, &chunk[written..], INFINITE)
                    .unwrap();
            }
        }
        writer_handle.close(write_fd).unwrap();
    });

    event_loop.run();

    assert_eq!(*total_read.borrow(), CHUNK * CHUNKS);
}
