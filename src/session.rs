//! Per-connection NBD session: handshake through transmission, generalized
//! from the teacher's single-export, single-threaded `Server` into a
//! stateless set of functions operating over a shared [`Context`].
//!
//! See <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md> for
//! the protocol description.
#![deny(missing_docs)]

use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

use std::io::prelude::*;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use log::{info, warn};

use crate::backend::{in_range, Backend};
use crate::context::Context;
use crate::proto::*;

// fake constant: the one transmission flag set this server ever advertises.
#[allow(non_snake_case)]
fn TRANSMIT_FLAGS() -> TransmitFlags {
    TransmitFlags::HAS_FLAGS | TransmitFlags::SEND_FLUSH | TransmitFlags::SEND_FUA
        | TransmitFlags::SEND_TRIM
}

/// Handle one client connection end to end: handshake, then transmission,
/// until disconnect or a fatal protocol error.
pub fn handle_client<IO: Read + Write>(ctx: &Context, stream: &mut IO) -> Result<()> {
    #[cfg(not(feature = "oldstyle"))]
    {
        if newstyle_handshake(&ctx.backend, stream).wrap_err("newstyle handshake failed")? {
            info!(target: "nbd", "handshake finished, entering transmission");
            handle_ops(&ctx.backend, stream).wrap_err("handling client operations")?;
        }
    }
    #[cfg(feature = "oldstyle")]
    {
        oldstyle_handshake(&ctx.backend, stream).wrap_err("oldstyle handshake failed")?;
        handle_ops(&ctx.backend, stream).wrap_err("handling client operations")?;
    }
    Ok(())
}

#[cfg(feature = "oldstyle")]
fn oldstyle_handshake<IO: Write>(backend: &Backend, stream: &mut IO) -> Result<()> {
    stream.write_u64::<BE>(MAGIC)?;
    stream.write_u64::<BE>(OLDSTYLE_MAGIC)?;
    stream.write_u64::<BE>(backend.size())?;
    stream.write_u32::<BE>(TRANSMIT_FLAGS().bits() as u32)?;
    stream.write_all(&[0u8; 124])?;
    stream.flush()?;
    Ok(())
}

/// Performs the newstyle handshake and option-haggling loop. Returns `true`
/// if the client selected the export and transmission should begin, `false`
/// if the client aborted cleanly.
#[cfg(not(feature = "oldstyle"))]
fn newstyle_handshake<IO: Read + Write>(backend: &Backend, stream: &mut IO) -> Result<bool> {
    stream.write_u64::<BE>(MAGIC)?;
    stream.write_u64::<BE>(IHAVEOPT)?;
    stream.write_u16::<BE>(HandshakeFlags::FIXED_NEWSTYLE.bits())?;
    let client_flags = stream.read_u32::<BE>()?;
    let client_flags = ClientHandshakeFlags::from_bits(client_flags)
        .ok_or_else(|| ProtocolError::new(format!("unexpected client flags {client_flags}")))?;
    if !client_flags.contains(ClientHandshakeFlags::C_FIXED_NEWSTYLE) {
        bail!(ProtocolError::new("client does not support FIXED_NEWSTYLE"));
    }
    loop {
        let opt = Opt::get(&mut *stream)?;
        match opt.typ {
            Some(OptType::EXPORT_NAME) => {
                // The export name is read and validated but otherwise
                // ignored: a single implicit export is served regardless
                // of what name the client asked for.
                String::from_utf8(opt.data).wrap_err(ProtocolError::new("non-UTF8 export name"))?;
                send_export_info(backend, stream)?;
                return Ok(true);
            }
            Some(OptType::ABORT) => {
                OptReply::ack(opt.id).put(&mut *stream)?;
                return Ok(false);
            }
            _ => {
                // Either a recognized-but-unimplemented option (LIST,
                // PEEK_EXPORT, STARTTLS, INFO, GO) or an id this server
                // doesn't know at all; both get the same reply, and the
                // connection stays open either way.
                warn!(target: "nbd", "unsupported option {} ({:?})", opt.id, opt.typ);
                OptReply::unsupported(opt.id).put(&mut *stream)?;
            }
        }
    }
}

#[cfg(not(feature = "oldstyle"))]
fn send_export_info<IO: Write>(backend: &Backend, stream: &mut IO) -> Result<()> {
    stream.write_u64::<BE>(backend.size())?;
    stream.write_u16::<BE>(TRANSMIT_FLAGS().bits())?;
    stream.write_all(&[0u8; 124])?;
    stream.flush()?;
    Ok(())
}

fn handle_ops<IO: Read + Write>(backend: &Backend, stream: &mut IO) -> Result<()> {
    loop {
        let req = Request::get(&mut *stream).wrap_err("reading request")?;
        info!(target: "nbd", "{:?}", req);
        match req.typ {
            Cmd::READ => {
                if in_range(req.offset, req.len, backend.size()) {
                    let data = backend.read(req.offset, req.len);
                    SimpleReply::data(&req, &data).put(&mut *stream)?;
                } else {
                    warn!(target: "nbd", "read out of range: {:?}", req);
                    SimpleReply::err(ErrorType::EINVAL, &req).put(&mut *stream)?;
                }
            }
            Cmd::WRITE => {
                // The payload is already fully drained from the stream by
                // `Request::get`, regardless of whether the range check
                // below passes, so framing survives a rejected write.
                if in_range(req.offset, req.len, backend.size()) {
                    backend.write(req.offset, &req.data, req.fua());
                    SimpleReply::ok(&req).put(&mut *stream)?;
                } else {
                    warn!(target: "nbd", "write out of range: {:?}", req);
                    SimpleReply::err(ErrorType::ENOSPC, &req).put(&mut *stream)?;
                }
            }
            Cmd::DISCONNECT => return Ok(()),
            Cmd::FLUSH => {
                backend.flush();
                SimpleReply::ok(&req).put(&mut *stream)?;
            }
            Cmd::TRIM => {
                if in_range(req.offset, req.len, backend.size()) {
                    backend.trim(req.offset, req.len);
                    SimpleReply::ok(&req).put(&mut *stream)?;
                } else {
                    warn!(target: "nbd", "trim out of range: {:?}", req);
                    SimpleReply::err(ErrorType::EINVAL, &req).put(&mut *stream)?;
                }
            }
        }
    }
}
