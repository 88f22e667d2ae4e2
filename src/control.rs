//! A minimal HTTP/1.1-subset control-plane server, exposing the Recorder
//! (begin/end/dump/echo) over a second TCP port.
//!
//! There is no blocking HTTP server crate in this codebase's dependency
//! family (the one HTTP crate found anywhere nearby, `axum`, is async and
//! would drag in a whole runtime just to serve four fixed endpoints), so
//! this is hand-rolled in the teacher's own preferred style: minimal parsing,
//! no persistent connections, no chunked encoding, no query strings.
#![deny(missing_docs)]

use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;

use std::io::prelude::*;
use std::net::TcpStream;

use log::{info, warn};

use crate::context::Context;

const MAX_BODY: u64 = 64 * 1024 * 1024;

struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn read_request<IO: Read>(mut stream: IO) -> Result<HttpRequest> {
    // A request line and headers, CRLF-terminated, then an optional body
    // whose length comes from `Content-Length`. Reading byte-at-a-time is
    // wasteful but keeps this free of a buffered-reader dependency and the
    // control plane only ever sees a handful of short lines.
    let mut header_bytes = Vec::new();
    let mut prev_four = [0u8; 4];
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte)?;
        if n == 0 {
            bail!("connection closed before headers completed");
        }
        header_bytes.push(byte[0]);
        prev_four.rotate_left(1);
        prev_four[3] = byte[0];
        if prev_four == *b"\r\n\r\n" {
            break;
        }
        if header_bytes.len() as u64 > MAX_BODY {
            bail!("request headers exceeded size bound");
        }
    }
    let header_text = String::from_utf8(header_bytes).wrap_err("non-UTF8 request headers")?;
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| color_eyre::eyre::eyre!("empty request line"))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| color_eyre::eyre::eyre!("missing path in request line"))?
        .to_string();

    let mut content_length: u64 = 0;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().wrap_err("bad Content-Length")?;
            }
        }
    }
    bail_if_too_large(content_length)?;
    let mut body = vec![0u8; content_length as usize];
    stream.read_exact(&mut body)?;

    Ok(HttpRequest { method, path, body })
}

fn bail_if_too_large(len: u64) -> Result<()> {
    if len > MAX_BODY {
        bail!("request body of {len} bytes exceeds the size bound");
    }
    Ok(())
}

fn write_response<IO: Write>(mut stream: IO, body: &[u8]) -> Result<()> {
    write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

/// Handle one control-plane connection: one request, one response, then the
/// connection is closed.
pub fn handle_client(ctx: &Context, stream: &mut TcpStream) -> Result<()> {
    let req = read_request(&mut *stream).wrap_err("parsing control request")?;
    let op = req.path.trim_start_matches('/');
    info!(target: "control", "{} /{}", req.method, op);
    let response_body = match op {
        "begin" => {
            ctx.backend.begin()?;
            Vec::new()
        }
        "end" => ctx.backend.end()?,
        "dump" => ctx.backend.dump(),
        "echo" => {
            ctx.backend.echo(req.body);
            Vec::new()
        }
        other => {
            warn!(target: "control", "unknown control operation {other:?}");
            bail!("unknown control operation {other:?}");
        }
    };
    write_response(stream, &response_body).wrap_err("writing control response")
}
