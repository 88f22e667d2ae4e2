use clap::Parser;
use color_eyre::Result;

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::info;
use nix::sys::signal::{self, SigHandler, Signal};

use nbd_crash::backend::Backend;
use nbd_crash::context::Context;
use nbd_crash::server::{run_control_listener, run_nbd_listener};

const MEGABYTE: u64 = 1024 * 1024;

/// An in-memory NBD server with a write-trace recorder.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Size of the exported backend, in megabytes.
    #[clap(long, default_value_t = 16, conflicts_with = "load")]
    size: u64,

    /// Load the backend contents verbatim from this file; its length
    /// becomes the export size.
    #[clap(long)]
    load: Option<String>,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: std::os::raw::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();
    let backend = match &args.load {
        Some(path) => {
            let data = fs::read(path)?;
            info!("loaded {} bytes from {path}", data.len());
            Backend::from_bytes(data)
        }
        None => Backend::zeroed(args.size * MEGABYTE),
    };
    let ctx = Context::new(backend);

    // SAFETY: `handle_sigint` only performs an atomic store, which is
    // async-signal-safe.
    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::Handler(handle_sigint))?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let nbd_shutdown = shutdown.clone();
    let nbd_ctx = ctx.clone();
    let nbd_thread = thread::spawn(move || run_nbd_listener(nbd_ctx, nbd_shutdown));

    let control_shutdown = shutdown.clone();
    let control_ctx = ctx.clone();
    let control_thread = thread::spawn(move || run_control_listener(control_ctx, control_shutdown));

    while !SHUTDOWN.load(Ordering::SeqCst) {
        thread::sleep(std::time::Duration::from_millis(200));
    }
    info!("shutting down");
    shutdown.store(true, Ordering::SeqCst);

    nbd_thread.join().expect("nbd listener thread panicked")?;
    control_thread
        .join()
        .expect("control listener thread panicked")?;
    Ok(())
}
