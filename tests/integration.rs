//! End-to-end tests against the real listeners, bound to their fixed ports.
//! Grounded on the teacher's `tests/binary.rs`, but driving the in-process
//! server via `nbd_crash::server` rather than spawning a built binary
//! against a real kernel `/dev/nbd` device (out of scope here).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use serial_test::serial;

use nbd_crash::backend::Backend;
use nbd_crash::client::Client;
use nbd_crash::context::Context;
use nbd_crash::proto::{
    ClientHandshakeFlags, Cmd, ErrorType, Opt, OptType, Request, ReplyType, SimpleReply,
    CONTROL_PORT, NBD_PORT,
};
use nbd_crash::server::{run_control_listener, run_nbd_listener};

struct Listener {
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<color_eyre::Result<()>>>,
}

impl Listener {
    fn nbd(ctx: Context) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let s = shutdown.clone();
        let handle = thread::spawn(move || run_nbd_listener(ctx, s));
        thread::sleep(Duration::from_millis(50));
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    fn control(ctx: Context) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let s = shutdown.clone();
        let handle = thread::spawn(move || run_control_listener(ctx, s));
        thread::sleep(Duration::from_millis(50));
        Self {
            shutdown,
            handle: Some(handle),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
#[serial]
fn scenario_1_newstyle_handshake() {
    let ctx = Context::new(Backend::zeroed(16 * 1024 * 1024));
    let _listener = Listener::nbd(ctx);

    let mut stream = TcpStream::connect(("127.0.0.1", NBD_PORT)).unwrap();
    let client = Client::new(&mut stream).unwrap();
    assert_eq!(client.size(), 16 * 1024 * 1024);
}

#[test]
#[serial]
fn scenario_2_unsupported_option_keeps_connection_open() {
    let ctx = Context::new(Backend::zeroed(16 * 1024 * 1024));
    let _listener = Listener::nbd(ctx);

    let mut stream = TcpStream::connect(("127.0.0.1", NBD_PORT)).unwrap();
    // Raw initial handshake, bypassing `Client::new` so we can send LIST.
    let mut magic = [0u8; 8];
    stream.read_exact(&mut magic).unwrap();
    stream.read_u64::<BE>().unwrap(); // IHAVEOPT
    stream.read_u16::<BE>().unwrap(); // handshake flags
    stream
        .write_u32::<BE>(ClientHandshakeFlags::C_FIXED_NEWSTYLE.bits())
        .unwrap();

    Opt::new(OptType::LIST, vec![]).put(&mut stream).unwrap();

    let reply_magic = stream.read_u64::<BE>().unwrap();
    let opt_id = stream.read_u32::<BE>().unwrap();
    let reply_type = stream.read_u32::<BE>().unwrap();
    let len = stream.read_u32::<BE>().unwrap();
    assert_eq!(reply_magic, 0x0003e889045565a9);
    assert_eq!(opt_id, u32::from(OptType::LIST));
    assert_eq!(reply_type, u32::from(ReplyType::ERR_UNSUP));
    assert_eq!(len, 0);

    // The connection is still open: a subsequent EXPORT_NAME should succeed.
    Opt::new(OptType::EXPORT_NAME, b"default".to_vec())
        .put(&mut stream)
        .unwrap();
    let size = stream.read_u64::<BE>().unwrap();
    assert_eq!(size, 16 * 1024 * 1024);
}

#[test]
#[serial]
fn scenario_3_write_read_round_trip() {
    let ctx = Context::new(Backend::zeroed(16 * 1024 * 1024));
    let _listener = Listener::nbd(ctx);

    let mut stream = TcpStream::connect(("127.0.0.1", NBD_PORT)).unwrap();
    let mut client = Client::new(&mut stream).unwrap();
    client.write(1024, b"hello").unwrap();
    let data = client.read(1022, 8).unwrap();
    assert_eq!(data, b"\x00\x00hello\x00");
}

#[test]
#[serial]
fn scenario_4_out_of_range_write_reports_enospc() {
    let size: u64 = 16 * 1024 * 1024;
    let ctx = Context::new(Backend::zeroed(size));
    let _listener = Listener::nbd(ctx);

    let mut stream = TcpStream::connect(("127.0.0.1", NBD_PORT)).unwrap();
    let mut client = Client::new(&mut stream).unwrap();
    let err = client.write(size - 10, b"ABCDEFGHIJ").unwrap();
    assert_eq!(err, ErrorType::ENOSPC);
    let tail = client.read(size - 10, 10).unwrap();
    assert_eq!(tail, vec![0u8; 10]);
}

#[test]
#[serial]
fn scenario_6_out_of_range_read_reports_einval_with_no_payload() {
    let size: u64 = 16 * 1024 * 1024;
    let ctx = Context::new(Backend::zeroed(size));
    let _listener = Listener::nbd(ctx);

    let mut stream = TcpStream::connect(("127.0.0.1", NBD_PORT)).unwrap();
    let _client = Client::new(&mut stream).unwrap();

    Request::new(Cmd::READ, size - 5, 10)
        .with_handle(7)
        .put(&[], &mut stream)
        .unwrap();
    let mut scratch = vec![0u8; 0];
    let (err, handle) = SimpleReply::get(&mut stream, &mut scratch).unwrap();
    assert_eq!(err, ErrorType::EINVAL);
    assert_eq!(handle, 7);

    // The reply carried no payload: a follow-up request/reply exchange on
    // the same connection still lines up.
    Request::new(Cmd::READ, 0, 4)
        .with_handle(8)
        .put(&[], &mut stream)
        .unwrap();
    let mut scratch = vec![0u8; 4];
    let (err, handle) = SimpleReply::get(&mut stream, &mut scratch).unwrap();
    assert_eq!(err, ErrorType::OK);
    assert_eq!(handle, 8);
}

#[test]
#[serial]
fn scenario_5_trim_zeroes_region() {
    let ctx = Context::new(Backend::zeroed(8));
    let _listener = Listener::nbd(ctx);

    let mut stream = TcpStream::connect(("127.0.0.1", NBD_PORT)).unwrap();
    let mut client = Client::new(&mut stream).unwrap();
    client.write(0, &[0xffu8; 8]).unwrap();
    client.trim(2, 4).unwrap();
    let data = client.read(0, 8).unwrap();
    assert_eq!(data, [0xff, 0xff, 0, 0, 0, 0, 0xff, 0xff]);
}

#[test]
#[serial]
fn scenario_7_control_plane_round_trip() {
    let ctx = Context::new(Backend::zeroed(4));
    let control_listener = Listener::control(ctx.clone());
    let nbd_listener = Listener::nbd(ctx);

    let mut control_stream = TcpStream::connect(("127.0.0.1", CONTROL_PORT)).unwrap();
    control_stream
        .write_all(b"GET /begin HTTP/1.1\r\n\r\n")
        .unwrap();
    let mut resp = Vec::new();
    control_stream.read_to_end(&mut resp).unwrap();
    assert!(resp.starts_with(b"HTTP/1.1 200"));

    let mut nbd_stream = TcpStream::connect(("127.0.0.1", NBD_PORT)).unwrap();
    let mut client = Client::new(&mut nbd_stream).unwrap();
    client.write(0, b"A").unwrap();
    drop(client);

    let mut control_stream = TcpStream::connect(("127.0.0.1", CONTROL_PORT)).unwrap();
    control_stream
        .write_all(b"GET /end HTTP/1.1\r\n\r\n")
        .unwrap();
    let mut resp = Vec::new();
    control_stream.read_to_end(&mut resp).unwrap();
    let body_start = resp.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
    let encoded = &resp[body_start..];

    let recording = nbd_crash::recorder::Recording::decode(encoded).unwrap();
    assert_eq!(recording.snapshot, vec![0u8; 4]);
    assert_eq!(recording.trace.len(), 1);

    let images = nbd_crash::enumerator::enumerate(&recording).unwrap();
    assert_eq!(images, vec![b"A\0\0\0".to_vec()]);

    drop(control_listener);
    drop(nbd_listener);
}
