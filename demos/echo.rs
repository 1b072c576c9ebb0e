//! A TCP echo server driven entirely by fibers and [`corio::IOManager`],
//! without the `hook` feature: every blocking-looking call is written
//! explicitly as "try it, and if it would block, register for readiness
//! and yield" - the same pattern [`corio::hook`] automates for unmodified
//! code.
//!
//! Run with `cargo run --example echo`, then `nc 127.0.0.1 7777`.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;

use corio::{fiber, Event, IOManager};

fn main() {
    corio::log::install(log::LevelFilter::Info);

    let listener = TcpListener::bind("127.0.0.1:7777").expect("bind 127.0.0.1:7777");
    listener.set_nonblocking(true).expect("set_nonblocking");
    log::info!("echo server listening on {}", listener.local_addr().unwrap());

    let iom = IOManager::new(4, true, "echo");
    let accept_iom = iom.clone();

    iom.scheduler().schedule(move || accept_loop(listener, accept_iom));

    iom.stop();
}

fn accept_loop(listener: TcpListener, iom: IOManager) {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                log::info!("accepted connection from {addr}");
                stream.set_nonblocking(true).expect("set_nonblocking");
                let conn_iom = iom.clone();
                iom.scheduler().schedule(move || echo_loop(stream, conn_iom));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if iom.add_event(listener.as_raw_fd(), Event::READ).is_err() {
                    log::error!("failed to register listener for readability, giving up");
                    return;
                }
                fiber::yield_to_hold();
            }
            Err(e) => {
                log::error!("accept failed: {e}");
                return;
            }
        }
    }
}

fn echo_loop(mut stream: TcpStream, iom: IOManager) {
    let fd = stream.as_raw_fd();
    let mut buf = [0u8; 4096];

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if iom.add_event(fd, Event::READ).is_err() {
                    return;
                }
                fiber::yield_to_hold();
                continue;
            }
            Err(e) => {
                log::warn!("read error on fd {fd}: {e}");
                return;
            }
        };

        let mut written = 0;
        while written < n {
            match stream.write(&buf[written..n]) {
                Ok(0) => return,
                Ok(w) => written += w,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if iom.add_event(fd, Event::WRITE).is_err() {
                        return;
                    }
                    fiber::yield_to_hold();
                }
                Err(e) => {
                    log::warn!("write error on fd {fd}: {e}");
                    return;
                }
            }
        }
    }
}
