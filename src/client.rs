//! A minimal NBD client, used by integration tests to drive a `Session`
//! over a real TCP connection without a separate client binary.
//!
//! Grounded on the teacher's `Client<IO>`, trimmed to the newstyle-only,
//! single-implicit-export handshake this server actually speaks (no
//! `NO_ZEROES` negotiation — the export-info frame here is unconditional).
#![deny(missing_docs)]

use color_eyre::eyre::bail;
use color_eyre::Result;

use std::io::prelude::*;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};

use crate::proto::*;

/// A connected NBD client, past the handshake and ready to issue commands.
#[derive(Debug)]
pub struct Client<IO: Read + Write> {
    conn: IO,
    size: u64,
    next_handle: u64,
}

impl<IO: Read + Write> Client<IO> {
    fn initial_handshake(stream: &mut (impl Read + Write)) -> Result<()> {
        let magic = stream.read_u64::<BE>()?;
        if magic != MAGIC {
            bail!(ProtocolError::new(format!("unexpected magic {magic:#x}")));
        }
        let opt_magic = stream.read_u64::<BE>()?;
        if opt_magic != IHAVEOPT {
            bail!(ProtocolError::new(format!(
                "unexpected IHAVEOPT value {opt_magic:#x}"
            )));
        }
        let server_flags = stream.read_u16::<BE>()?;
        let server_flags = HandshakeFlags::from_bits(server_flags)
            .ok_or_else(|| ProtocolError::new(format!("unexpected server flags {server_flags}")))?;
        if !server_flags.contains(HandshakeFlags::FIXED_NEWSTYLE) {
            bail!(ProtocolError::new("server does not support FIXED_NEWSTYLE"));
        }
        stream.write_u32::<BE>(ClientHandshakeFlags::C_FIXED_NEWSTYLE.bits())?;
        Ok(())
    }

    fn handshake_haggle(stream: &mut (impl Read + Write)) -> Result<u64> {
        Opt::new(OptType::EXPORT_NAME, b"default".to_vec()).put(&mut *stream)?;
        let size = stream.read_u64::<BE>()?;
        let transmit_flags = stream.read_u16::<BE>()?;
        TransmitFlags::from_bits(transmit_flags)
            .ok_or_else(|| ProtocolError::new(format!("invalid transmit flags {transmit_flags}")))?;
        let mut zeroes = [0u8; 124];
        stream.read_exact(&mut zeroes)?;
        Ok(size)
    }

    /// Establish a handshake with `stream` and return a Client ready for use.
    pub fn new(mut stream: IO) -> Result<Self> {
        Self::initial_handshake(&mut stream)?;
        let size = Self::handshake_haggle(&mut stream)?;
        Ok(Self {
            conn: stream,
            size,
            next_handle: 0,
        })
    }

    /// The export size reported by the server during the handshake.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn next_handle(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn roundtrip(&mut self, req: Request, data: &[u8], reply_buf: &mut [u8]) -> Result<ErrorType> {
        req.put(data, &mut self.conn)?;
        let (err, _handle) = SimpleReply::get(&mut self.conn, reply_buf)?;
        Ok(err)
    }

    /// Send a read command to the server.
    pub fn read(&mut self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let handle = self.next_handle();
        let req = Request::new(Cmd::READ, offset, len).with_handle(handle);
        let mut buf = vec![0u8; len as usize];
        let err = self.roundtrip(req, &[], &mut buf)?;
        if err != ErrorType::OK {
            bail!("read failed: {:?}", err);
        }
        Ok(buf)
    }

    /// Send a write command to the server.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<ErrorType> {
        let handle = self.next_handle();
        let req = Request::new(Cmd::WRITE, offset, data.len() as u32).with_handle(handle);
        self.roundtrip(req, data, &mut [])
    }

    /// Send a trim (zero-fill) command to the server.
    pub fn trim(&mut self, offset: u64, len: u32) -> Result<ErrorType> {
        let handle = self.next_handle();
        let req = Request::new(Cmd::TRIM, offset, len).with_handle(handle);
        self.roundtrip(req, &[], &mut [])
    }

    /// Send a flush command to the server.
    pub fn flush(&mut self) -> Result<()> {
        let handle = self.next_handle();
        let req = Request::new(Cmd::FLUSH, 0, 0).with_handle(handle);
        let err = self.roundtrip(req, &[], &mut [])?;
        if err != ErrorType::OK {
            bail!("flush failed: {:?}", err);
        }
        Ok(())
    }

    /// Disconnect cleanly; no reply is expected.
    pub fn disconnect(mut self) -> Result<()> {
        let handle = self.next_handle();
        Request::new(Cmd::DISCONNECT, 0, 0)
            .with_handle(handle)
            .put(&[], &mut self.conn)?;
        Ok(())
    }
}
