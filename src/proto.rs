//! NBD protocol constants and struct definitions.
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description. This module implements only the subset this
//! server actually serves: a single implicit export, no TLS, no structured
//! replies.
#![deny(missing_docs)]
#![allow(clippy::upper_case_acronyms)]
#![allow(non_camel_case_types)]
use color_eyre::eyre::{bail, ensure, WrapErr};
use color_eyre::Result;
use std::error::Error;
use std::fmt;
use std::io::{self, prelude::*};

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// TCP port the NBD listener binds.
pub const NBD_PORT: u16 = 10809;
/// TCP port the control-plane HTTP listener binds.
pub const CONTROL_PORT: u16 = 10880;

pub(crate) const MAGIC: u64 = 0x4e42444d41474943; // b"NBDMAGIC"
pub(crate) const OLDSTYLE_MAGIC: u64 = 0x00420281861253;
pub(crate) const IHAVEOPT: u64 = 0x49484156454F5054; // b"IHAVEOPT"
pub(crate) const REPLY_MAGIC: u64 = 0x0003e889045565a9;

// transmission constants
pub(crate) const REQUEST_MAGIC: u32 = 0x25609513;
pub(crate) const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

/// A malformed frame, bad magic, or other violation of the wire protocol.
///
/// Any occurrence of this error is fatal to the session that produced it.
#[derive(Debug, Clone)]
pub struct ProtocolError(String);

impl ProtocolError {
    /// Construct a protocol error with a human-readable description.
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        ProtocolError(s.as_ref().to_string())
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "nbd protocol error: {}", self.0)
    }
}

impl Error for ProtocolError {}

bitflags! {
    /// Server-to-client handshake flags (newstyle only).
    pub struct HandshakeFlags: u16 {
        /// Server supports the option-haggling newstyle handshake.
        const FIXED_NEWSTYLE = 0b01;
    }

    /// Client-to-server handshake flags (newstyle only).
    pub struct ClientHandshakeFlags: u32 {
        /// Client acknowledges `FIXED_NEWSTYLE`.
        const C_FIXED_NEWSTYLE = 0b01;
    }

    /// Transmission flags advertised with the export.
    pub struct TransmitFlags: u16 {
        /// This flags field is meaningful (always set).
        const HAS_FLAGS = 1 << 0;
        /// Export is read-only.
        const READ_ONLY = 1 << 1;
        /// Server understands `NBD_CMD_FLUSH`.
        const SEND_FLUSH = 1 << 2;
        /// Server understands the `FUA` command flag.
        const SEND_FUA = 1 << 3;
        /// Server understands `NBD_CMD_TRIM`.
        const SEND_TRIM = 1 << 5;
    }
}

/// Options a client may send during newstyle haggling.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum OptType {
    /// Select the (sole) export and move to the transmission phase.
    EXPORT_NAME = 1,
    /// Client wants to give up without selecting an export.
    ABORT = 2,
    /// List available exports. Unsupported here; falls through to
    /// `ERR_UNSUP` like any other unrecognized option.
    LIST = 3,
    /// Not implemented; unsupported here, named for logging.
    PEEK_EXPORT = 4,
    /// Not implemented; unsupported here, named for logging.
    STARTTLS = 5,
    /// Not implemented; unsupported here, named for logging.
    INFO = 6,
    /// Not implemented; unsupported here, named for logging.
    GO = 7,
}

/// Reply types the server sends during newstyle haggling.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone)]
#[repr(u32)]
pub enum ReplyType {
    /// Acknowledge successful completion of an option.
    ACK = 1,
    /// Option is not known/supported by this server.
    ERR_UNSUP = (1 << 31) + 1,
}

/// An option sent by the client during newstyle haggling. `id` is kept
/// alongside the parsed `typ` because a client may legally send an option
/// id this server doesn't recognize; the reply still has to echo that raw
/// id back, even though there is no `OptType` to name it by.
#[derive(Debug, Clone)]
pub struct Opt {
    /// Raw option id as sent on the wire.
    pub id: u32,
    /// `id` resolved against the known option set, if it maps to one.
    pub typ: Option<OptType>,
    /// Option-specific payload bytes.
    pub data: Vec<u8>,
}

impl Opt {
    /// Build an option from a known `OptType` (used by the test client).
    pub fn new(typ: OptType, data: Vec<u8>) -> Self {
        Self {
            id: typ.into(),
            typ: Some(typ),
            data,
        }
    }

    /// Read an option packet from `stream`. An unrecognized option id is not
    /// an error here: the id is still parsed and returned with `typ: None`,
    /// so the caller can reply `ERR_UNSUP` and keep the connection open
    /// instead of this call itself being fatal to the session.
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        // C: 64 bits, 0x49484156454F5054 ("IHAVEOPT")
        // C: 32 bits, option
        // C: 32 bits, length of option data (unsigned)
        // C: any data needed for the chosen option, of length as specified above.
        let magic = stream.read_u64::<BE>()?;
        if magic != IHAVEOPT {
            bail!(ProtocolError::new(format!(
                "unexpected option magic {magic:#x}"
            )));
        }
        let id = stream.read_u32::<BE>()?;
        let typ = OptType::try_from(id).ok();
        let option_len = stream.read_u32::<BE>()?;
        ensure!(
            option_len < 10_000,
            ProtocolError::new(format!("option length {option_len} is too large"))
        );
        let mut data = vec![0u8; option_len as usize];
        stream
            .read_exact(&mut data)
            .wrap_err_with(|| format!("reading option {id} of size {option_len}"))?;
        Ok(Self { id, typ, data })
    }

    /// Send an option (used by the test client).
    pub fn put<IO: Write>(&self, mut stream: IO) -> io::Result<()> {
        stream.write_u64::<BE>(IHAVEOPT)?;
        stream.write_u32::<BE>(self.id)?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }
}

/// Builder for replying to an option during newstyle haggling. Replies are
/// keyed off the raw option id rather than `OptType`, since an `ERR_UNSUP`
/// reply has to echo back an id the server may not recognize at all.
#[must_use]
pub struct OptReply {
    opt_id: u32,
    reply_type: ReplyType,
    data: Vec<u8>,
}

impl OptReply {
    /// A bare acknowledgement with no payload.
    pub fn ack(opt_id: impl Into<u32>) -> Self {
        Self {
            opt_id: opt_id.into(),
            reply_type: ReplyType::ACK,
            data: vec![],
        }
    }

    /// An `ERR_UNSUP` reply for an option this server does not implement,
    /// known or not.
    pub fn unsupported(opt_id: impl Into<u32>) -> Self {
        Self {
            opt_id: opt_id.into(),
            reply_type: ReplyType::ERR_UNSUP,
            data: vec![],
        }
    }

    /// Send the reply.
    pub fn put<IO: Write>(self, mut stream: IO) -> io::Result<()> {
        // S: 64 bits, reply magic
        // S: 32 bits, the option as sent by the client to which this is a reply
        // S: 32 bits, reply type
        // S: 32 bits, length of the reply (may be zero)
        // S: any data as required by the reply
        stream.write_u64::<BE>(REPLY_MAGIC)?;
        stream.write_u32::<BE>(self.opt_id)?;
        stream.write_u32::<BE>(self.reply_type.into())?;
        stream.write_u32::<BE>(self.data.len() as u32)?;
        stream.write_all(&self.data)?;
        stream.flush()?;
        Ok(())
    }
}

// -------------------
// Transmission phase
// -------------------

/// Transmission-phase commands.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u16)]
pub enum Cmd {
    /// Read a range of bytes.
    READ = 0,
    /// Write a range of bytes.
    WRITE = 1,
    /// Disconnect; no reply is sent.
    DISCONNECT = 2,
    /// Flush (a no-op against this in-memory backend).
    FLUSH = 3,
    /// Zero-fill a range of bytes.
    TRIM = 4,
}

bitflags! {
    /// Per-command flags.
    pub struct CmdFlags: u16 {
        /// Force Unit Access: the client wants this write durable before
        /// the reply. Recorded, but otherwise has no effect.
        const FUA = 1 << 0;
    }
}

/// A parsed transmission-phase request.
#[derive(Debug)]
pub struct Request {
    flags: CmdFlags,
    /// Which command this is.
    pub typ: Cmd,
    /// Opaque token echoed verbatim in the reply.
    pub handle: u64,
    /// Byte offset the command applies to.
    pub offset: u64,
    /// Length, in bytes (redundant with `data.len()` for `WRITE`).
    pub len: u32,
    /// For `WRITE`, the payload read off the wire. Empty for every other
    /// command.
    pub data: Vec<u8>,
}

impl Request {
    /// Whether the client asked for Force Unit Access on this request.
    pub fn fua(&self) -> bool {
        self.flags.contains(CmdFlags::FUA)
    }

    /// Read a request from `stream`, reading any `WRITE` payload into an
    /// owned buffer sized exactly to the request's declared `length`.
    ///
    /// The payload is always read in full, even if `offset`/`length` turn
    /// out to be out of range once checked against the backend: the bytes
    /// are already on the wire and have to be drained to keep framing
    /// intact for the request that follows.
    pub fn get<IO: Read>(mut stream: IO) -> Result<Self> {
        // C: 32 bits, magic (NBD_REQUEST_MAGIC)
        // C: 16 bits, command flags
        // C: 16 bits, type
        // C: 64 bits, handle
        // C: 64 bits, offset (unsigned)
        // C: 32 bits, length (unsigned)
        // C: (length bytes of data if the request is of type NBD_CMD_WRITE)
        let magic = stream.read_u32::<BE>()?;
        if magic != REQUEST_MAGIC {
            bail!(ProtocolError::new(format!(
                "wrong request magic {magic:#x}"
            )));
        }
        let flags = stream.read_u16::<BE>()?;
        let flags = CmdFlags::from_bits(flags)
            .ok_or_else(|| ProtocolError::new(format!("unexpected command flags {flags:#x}")))?;
        let typ = stream.read_u16::<BE>()?;
        let typ = Cmd::try_from(typ)
            .map_err(|_| ProtocolError::new(format!("unexpected command {typ}")))?;
        let handle = stream.read_u64::<BE>()?;
        let offset = stream.read_u64::<BE>()?;
        let len = stream.read_u32::<BE>()?;
        let data = if typ == Cmd::WRITE {
            let mut d = vec![0u8; len as usize];
            stream
                .read_exact(&mut d)
                .wrap_err_with(|| format!("parsing write request of length {len}"))?;
            d
        } else {
            Vec::new()
        };
        Ok(Self {
            flags,
            typ,
            handle,
            offset,
            len,
            data,
        })
    }

    /// Build a new request with the given command, offset, and length. FUA
    /// is never set by this constructor.
    pub fn new(typ: Cmd, offset: u64, len: u32) -> Self {
        Self {
            flags: CmdFlags::empty(),
            typ,
            handle: 0,
            offset,
            len,
            data: Vec::new(),
        }
    }

    /// Set the handle (opaque token) for this request.
    pub fn with_handle(mut self, handle: u64) -> Self {
        self.handle = handle;
        self
    }

    /// Encode and send a request, with `data` as the `WRITE` payload if
    /// applicable (used by the test client).
    pub fn put<IO: Write>(&self, data: &[u8], mut stream: IO) -> io::Result<()> {
        stream.write_u32::<BE>(REQUEST_MAGIC)?;
        stream.write_u16::<BE>(self.flags.bits())?;
        stream.write_u16::<BE>(self.typ.into())?;
        stream.write_u64::<BE>(self.handle)?;
        stream.write_u64::<BE>(self.offset)?;
        stream.write_u32::<BE>(self.len)?;
        if self.typ == Cmd::WRITE {
            stream.write_all(data)?;
        }
        Ok(())
    }
}

/// Wire-level error codes, matching POSIX `errno` values. These are encoding
/// values only; the server never inspects them as a typed error taxonomy.
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorType {
    /// Success.
    OK = 0,
    /// Operation not permitted. Defined but never produced by this server.
    EPERM = 1,
    /// I/O error. Defined but never produced by this server.
    EIO = 5,
    /// Out of memory. Defined but never produced by this server.
    ENOMEM = 12,
    /// Invalid argument (bad range, or unknown command).
    EINVAL = 22,
    /// No space left (write past the end of the export).
    ENOSPC = 28,
}

/// A transmission-phase reply.
#[derive(Debug)]
#[must_use]
pub struct SimpleReply<'a> {
    err: ErrorType,
    handle: u64,
    data: &'a [u8],
}

impl<'a> SimpleReply<'a> {
    /// A successful reply carrying `data` (used for `READ`).
    pub fn data(req: &Request, data: &'a [u8]) -> Self {
        SimpleReply {
            err: ErrorType::OK,
            handle: req.handle,
            data,
        }
    }

    /// A successful reply with no payload.
    pub fn ok(req: &Request) -> Self {
        Self::data(req, &[])
    }

    /// An error reply with no payload.
    pub fn err(err: ErrorType, req: &Request) -> Self {
        SimpleReply {
            err,
            handle: req.handle,
            data: &[],
        }
    }

    /// Send the reply.
    pub fn put<IO: Write>(self, mut stream: IO) -> io::Result<()> {
        stream.write_u32::<BE>(SIMPLE_REPLY_MAGIC)?;
        stream.write_u32::<BE>(self.err.into())?;
        stream.write_u64::<BE>(self.handle)?;
        stream.write_all(self.data)?;
        Ok(())
    }

    /// Read a reply from `stream`, placing any payload into `buf` (used by
    /// the test client for `READ` replies).
    pub fn get<IO: Read>(mut stream: IO, buf: &mut [u8]) -> Result<(ErrorType, u64)> {
        let magic = stream.read_u32::<BE>()?;
        if magic != SIMPLE_REPLY_MAGIC {
            bail!(ProtocolError::new(format!("wrong reply magic {magic:#x}")));
        }
        let err = stream.read_u32::<BE>()?;
        let err = ErrorType::try_from(err)
            .map_err(|_| ProtocolError::new(format!("unexpected error code {err}")))?;
        let handle = stream.read_u64::<BE>()?;
        if !buf.is_empty() {
            stream.read_exact(buf)?;
        }
        Ok((err, handle))
    }
}
