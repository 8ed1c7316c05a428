//! Two fibers trade a fixed message over a loopback TCP connection: a
//! server fiber accepts and replies, a client fiber connects and reads
//! the reply, both driven by the same single-threaded loop.

use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};

use weave::event_loop::{Loop, INFINITE};

fn sockaddr_in(addr: SocketAddr) -> libc::sockaddr_in {
    match addr {
        SocketAddr::V4(v4) => libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: v4.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            },
            sin_zero: [0; 8],
        },
        SocketAddr::V6(_) => panic!("test binds to an IPv4 loopback address"),
    }
}

fn read_exact(handle: &mut weave::event_loop::LoopHandle, fd: RawFd, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    let mut total = 0;
    while total < n {
        let read = handle.read(fd, &mut buf[total..], INFINITE).unwrap();
        assert!(read > 0, "peer closed before sending everything");
        total += read;
    }
    buf
}

#[test]
fn ping_pong_over_a_shared_listening_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let listen_fd = listener.as_raw_fd();

    let mut event_loop = Loop::new().unwrap();
    event_loop.register_fd(listen_fd).unwrap();

    let mut server_handle = event_loop.handle();
    event_loop.spawn(move || {
        let conn_fd = server_handle.accept(listen_fd, INFINITE).unwrap();
        let received = read_exact(&mut server_handle, conn_fd, 6);
        assert_eq!(&received, b"ping!\0");
        server_handle.write(conn_fd, b"pong!\0", INFINITE).unwrap();
        server_handle.close(conn_fd).unwrap();
    });

    let mut client_handle = event_loop.handle();
    event_loop.spawn(move || {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        client_handle.register_fd(fd).unwrap();

        let sockaddr = sockaddr_in(addr);
        client_handle
            .connect(
                fd,
                (&sockaddr as *const libc::sockaddr_in).cast(),
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                INFINITE,
            )
            .unwrap();

        client_handle.write(fd, b"ping!\0", INFINITE).unwrap();
        let received = read_exact(&mut client_handle, fd, 6);
        assert_eq!(&received, b"pong!\0");
        client_handle.close(fd).unwrap();
    });

    event_loop.run();
}
