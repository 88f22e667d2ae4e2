//! The two listeners: NBD on one port, the control plane on another, each
//! accepting in a loop and spawning one thread per connection.
//!
//! Generalized from the teacher's `Server::start`, which accepted a single
//! client at a time in its own thread; here the Backend is shared behind a
//! `Mutex` (see `backend.rs`), so concurrent sessions are safe to spawn.
#![deny(missing_docs)]

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use color_eyre::Result;
use log::{info, warn};

use crate::context::Context;
use crate::proto::{CONTROL_PORT, NBD_PORT};
use crate::{control, session};

/// How often an accept loop wakes up to check the shutdown flag when no
/// connection is pending.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Run the NBD listener until `shutdown` is set, accepting one connection
/// at a time and handling each on its own thread.
pub fn run_nbd_listener(ctx: Context, shutdown: Arc<AtomicBool>) -> Result<()> {
    let addr = ("0.0.0.0", NBD_PORT);
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    info!(target: "nbd", "listening on {}:{}", addr.0, addr.1);
    accept_loop(&listener, &shutdown, move |mut stream| {
        let ctx = ctx.clone();
        thread::spawn(move || {
            info!(target: "nbd", "client connected");
            match session::handle_client(&ctx, &mut stream) {
                Ok(()) => info!(target: "nbd", "client disconnected"),
                Err(err) => warn!(target: "nbd", "session error: {err:?}"),
            }
        });
    })
}

/// Run the control-plane listener until `shutdown` is set.
pub fn run_control_listener(ctx: Context, shutdown: Arc<AtomicBool>) -> Result<()> {
    let addr = ("0.0.0.0", CONTROL_PORT);
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    info!(target: "control", "listening on {}:{}", addr.0, addr.1);
    accept_loop(&listener, &shutdown, move |mut stream| {
        let ctx = ctx.clone();
        thread::spawn(move || {
            if let Err(err) = control::handle_client(&ctx, &mut stream) {
                warn!(target: "control", "request error: {err:?}");
            }
        });
    })
}

fn accept_loop(
    listener: &TcpListener,
    shutdown: &Arc<AtomicBool>,
    mut on_connect: impl FnMut(TcpStream),
) -> Result<()> {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nodelay(true)?;
                on_connect(stream);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use serial_test::serial;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;

    #[test]
    #[serial]
    fn nbd_listener_accepts_and_shuts_down() {
        let ctx = Context::new(Backend::zeroed(16));
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = shutdown.clone();
        let handle = thread::spawn(move || run_nbd_listener(ctx, shutdown_for_thread));

        // Give the listener a moment to bind before connecting.
        thread::sleep(Duration::from_millis(50));
        let mut stream = StdTcpStream::connect(("127.0.0.1", NBD_PORT)).unwrap();
        let mut magic = [0u8; 8];
        stream.read_exact(&mut magic).unwrap();
        assert_eq!(u64::from_be_bytes(magic), crate::proto::MAGIC);

        shutdown.store(true, Ordering::SeqCst);
        drop(stream);
        handle.join().unwrap().unwrap();
    }

    #[test]
    #[serial]
    fn control_listener_accepts_and_shuts_down() {
        let ctx = Context::new(Backend::zeroed(16));
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = shutdown.clone();
        let handle = thread::spawn(move || run_control_listener(ctx, shutdown_for_thread));

        thread::sleep(Duration::from_millis(50));
        let mut stream = StdTcpStream::connect(("127.0.0.1", CONTROL_PORT)).unwrap();
        stream.write_all(b"GET /dump HTTP/1.1\r\n\r\n").unwrap();
        let mut resp = Vec::new();
        stream.read_to_end(&mut resp).unwrap();
        assert!(resp.starts_with(b"HTTP/1.1 200"));

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
    }
}
