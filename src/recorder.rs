//! The recording format: a snapshot-plus-trace pair, and its self-describing
//! binary encoding. `Backend` owns the state machine that opens and closes a
//! recording window (`begin`/`end`/`echo`, guarded by its single mutex); this
//! module only defines what gets serialized, so the server (`Backend::end`)
//! and the enumerator (`genimg`) agree on a format without sharing code.

#![deny(missing_docs)]

use color_eyre::eyre::{bail, ensure};
use color_eyre::Result;
use std::io::prelude::*;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

const RECORDING_MAGIC: u64 = 0x4e42445452414345; // "NBDTRACE"-ish, 8 bytes
const RECORDING_VERSION: u8 = 1;

/// One entry in a trace: a mutation observed while Recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEntry {
    /// A write of `data` at `offset`, with the client's FUA flag.
    Write {
        /// Payload written.
        data: Vec<u8>,
        /// Byte offset the write applies to.
        offset: u64,
        /// The client's FUA flag, as a raw 0/1 word (recorded, not acted on).
        fua: u32,
    },
    /// A flush barrier.
    Flush,
    /// An out-of-band marker injected via the control plane.
    Echo {
        /// Caller-supplied payload.
        payload: Vec<u8>,
    },
}

/// A snapshot and the trace of mutations observed after it, as produced by
/// `Recorder::end` and consumed by the enumerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    /// Backend contents at the moment recording began.
    pub snapshot: Vec<u8>,
    /// Mutations observed during the recording window, in order.
    pub trace: Vec<TraceEntry>,
}

impl Recording {
    /// Encode as the self-describing binary format described in
    /// `SPEC_FULL.md` §4.4.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u64::<BE>(RECORDING_MAGIC).unwrap();
        out.write_u8(RECORDING_VERSION).unwrap();
        out.write_u64::<BE>(self.snapshot.len() as u64).unwrap();
        out.write_all(&self.snapshot).unwrap();
        out.write_u32::<BE>(self.trace.len() as u32).unwrap();
        for entry in &self.trace {
            match entry {
                TraceEntry::Write { data, offset, fua } => {
                    out.write_u8(0).unwrap();
                    out.write_u32::<BE>(data.len() as u32).unwrap();
                    out.write_all(data).unwrap();
                    out.write_u64::<BE>(*offset).unwrap();
                    out.write_u32::<BE>(*fua).unwrap();
                }
                TraceEntry::Flush => {
                    out.write_u8(1).unwrap();
                }
                TraceEntry::Echo { payload } => {
                    out.write_u8(2).unwrap();
                    out.write_u32::<BE>(payload.len() as u32).unwrap();
                    out.write_all(payload).unwrap();
                }
            }
        }
        out
    }

    /// Decode a recording previously produced by [`Recording::encode`].
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let magic = data.read_u64::<BE>()?;
        ensure!(magic == RECORDING_MAGIC, "bad recording magic {magic:#x}");
        let version = data.read_u8()?;
        ensure!(
            version == RECORDING_VERSION,
            "unsupported recording version {version}"
        );
        let snapshot_len = data.read_u64::<BE>()? as usize;
        let mut snapshot = vec![0u8; snapshot_len];
        data.read_exact(&mut snapshot)?;
        let count = data.read_u32::<BE>()?;
        let mut trace = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let tag = data.read_u8()?;
            let entry = match tag {
                0 => {
                    let len = data.read_u32::<BE>()? as usize;
                    let mut d = vec![0u8; len];
                    data.read_exact(&mut d)?;
                    let offset = data.read_u64::<BE>()?;
                    let fua = data.read_u32::<BE>()?;
                    TraceEntry::Write {
                        data: d,
                        offset,
                        fua,
                    }
                }
                1 => TraceEntry::Flush,
                2 => {
                    let len = data.read_u32::<BE>()? as usize;
                    let mut payload = vec![0u8; len];
                    data.read_exact(&mut payload)?;
                    TraceEntry::Echo { payload }
                }
                _ => bail!("unknown trace entry tag {tag}"),
            };
            trace.push(entry);
        }
        Ok(Recording { snapshot, trace })
    }
}
