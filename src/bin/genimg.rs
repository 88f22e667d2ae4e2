//! Enumerator CLI: reads a serialized Recording and writes every candidate
//! crash image next to it as `<path>.NNN`.
#![deny(missing_docs)]

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::info;

use nbd_crash::enumerator;
use nbd_crash::recorder::Recording;

/// Generate every candidate crash-consistent image implied by a recorded
/// write trace.
#[derive(Debug, Parser)]
struct Args {
    /// Path to a Recording produced by the server's `end` control operation.
    input: PathBuf,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();
    let args = Args::parse();

    let data = fs::read(&args.input)
        .wrap_err_with(|| format!("reading recording {}", args.input.display()))?;
    let recording = Recording::decode(&data).wrap_err("decoding recording")?;
    let images = enumerator::enumerate(&recording).wrap_err("enumerating crash images")?;

    info!("{} candidate images", images.len());
    for (i, image) in images.iter().enumerate() {
        let out_path = format!("{}.{:03}", args.input.display(), i);
        fs::write(&out_path, image).wrap_err_with(|| format!("writing {out_path}"))?;
    }
    Ok(())
}
