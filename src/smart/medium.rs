//! Server-side mediums: read requests off a byte stream, one after another,
//! and write the responses back.

use super::protocol::{identify_protocol_version, ServerProtocol};
use super::request::Dispatcher;
use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use tracing::{debug, error, trace};

/// Socket reads ask for this much regardless of what the protocol needs.
const SOCKET_READ_SIZE: usize = 4096;

/// The byte stream under a server medium.
pub trait ServerChannel {
    /// Empty at end of stream.
    fn read_bytes(&mut self, desired: usize) -> io::Result<Bytes>;

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    fn close(&mut self);

    fn describe(&self) -> String;
}

// =============================================================================
// Channels
// =============================================================================

pub struct SocketChannel {
    stream: TcpStream,
    peer: String,
}

impl SocketChannel {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown peer".to_string());
        Self { stream, peer }
    }
}

impl ServerChannel for SocketChannel {
    fn read_bytes(&mut self, _desired: usize) -> io::Result<Bytes> {
        read_some(&mut self.stream, SOCKET_READ_SIZE)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn describe(&self) -> String {
        self.peer.clone()
    }
}

/// Reads no more than the protocol asks for, so nothing is consumed past
/// the end of the last request.
pub struct PipeChannel<R, W> {
    reader: R,
    writer: W,
}

impl<R: Read, W: Write> PipeChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

impl<R: Read, W: Write> ServerChannel for PipeChannel<R, W> {
    fn read_bytes(&mut self, desired: usize) -> io::Result<Bytes> {
        read_some(&mut self.reader, desired)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    fn close(&mut self) {
        let _ = self.writer.flush();
    }

    fn describe(&self) -> String {
        "pipes".to_string()
    }
}

fn read_some<R: Read>(reader: &mut R, max: usize) -> io::Result<Bytes> {
    let mut buf = vec![0u8; max.max(1)];
    loop {
        match reader.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                return Ok(Bytes::from(buf));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Medium
// =============================================================================

/// Serves requests from one channel until it closes.
pub struct ServerStreamMedium<C> {
    channel: C,
    dispatcher: Dispatcher,
    push_back: Option<Bytes>,
    finished: bool,
}

impl<C: ServerChannel> ServerStreamMedium<C> {
    pub fn new(channel: C, dispatcher: Dispatcher) -> Self {
        Self {
            channel,
            dispatcher,
            push_back: None,
            finished: false,
        }
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Serve until end of stream. A protocol error closes the channel and
    /// is returned.
    pub fn serve(&mut self) -> Result<()> {
        debug!(peer = %self.channel.describe(), "serving");
        self.serve_requests()
            .map_err(|e| e.with_target(self.channel.describe()))?;
        debug!(peer = %self.channel.describe(), "connection finished");
        Ok(())
    }

    fn serve_requests(&mut self) -> Result<()> {
        while !self.finished {
            let Some(protocol) = self.build_protocol()? else {
                break;
            };
            self.serve_one_request(protocol)?;
        }
        Ok(())
    }

    /// Read the first line of a request and pick its protocol. `None` at
    /// end of stream.
    fn build_protocol(&mut self) -> Result<Option<Box<dyn ServerProtocol>>> {
        let line = self.get_line()?;
        if line.is_empty() {
            self.finished = true;
            return Ok(None);
        }
        if !line.ends_with(b"\n") {
            debug!(
                partial = %String::from_utf8_lossy(&line),
                "stream ended mid-request"
            );
            self.finished = true;
            return Ok(None);
        }
        let (version, residual) = identify_protocol_version(&line);
        trace!(%version, "request started");
        let mut protocol = version.build_server_protocol(&self.dispatcher);
        if let Err(e) = protocol.accept_bytes(residual) {
            self.fail(&mut *protocol, &e);
            return Err(e);
        }
        Ok(Some(protocol))
    }

    fn serve_one_request(&mut self, mut protocol: Box<dyn ServerProtocol>) -> Result<()> {
        match self.serve_one_request_unguarded(&mut *protocol) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&mut *protocol, &e);
                Err(e)
            }
        }
    }

    fn serve_one_request_unguarded(&mut self, protocol: &mut dyn ServerProtocol) -> Result<()> {
        self.write_output(protocol)?;
        loop {
            let wanted = protocol.next_read_size();
            if wanted == 0 {
                break;
            }
            let bytes = self.get_bytes(wanted)?;
            if bytes.is_empty() {
                debug!("stream ended mid-request");
                self.finished = true;
                break;
            }
            protocol.accept_bytes(&bytes)?;
            self.write_output(protocol)?;
        }
        self.push_back(protocol.take_unused_data())?;
        self.channel.flush()?;
        Ok(())
    }

    /// Each piece is flushed as soon as it is produced, so a streamed body
    /// reaches the client before its stream is exhausted.
    fn write_output(&mut self, protocol: &mut dyn ServerProtocol) -> Result<()> {
        loop {
            let out = protocol.take_output();
            if out.is_empty() {
                return Ok(());
            }
            self.channel.write_all(&out)?;
            self.channel.flush()?;
        }
    }

    /// Send whatever error response the protocol produced, then close.
    fn fail(&mut self, protocol: &mut dyn ServerProtocol, err: &Error) {
        error!(peer = %self.channel.describe(), error = %err, "error serving request");
        let out = protocol.take_output();
        if !out.is_empty() {
            let _ = self.channel.write_all(&out);
            let _ = self.channel.flush();
        }
        self.terminate_due_to_error();
    }

    pub fn terminate_due_to_error(&mut self) {
        self.channel.close();
        self.finished = true;
    }

    /// Return bytes that belong to the next request. Only one chunk may be
    /// pending at a time.
    fn push_back(&mut self, bytes: Bytes) -> Result<()> {
        if self.push_back.is_some() {
            return Err(Error::framing(
                "cannot push back while unread bytes are pending",
            ));
        }
        if !bytes.is_empty() {
            self.push_back = Some(bytes);
        }
        Ok(())
    }

    fn get_bytes(&mut self, desired: usize) -> Result<Bytes> {
        if let Some(pending) = self.push_back.take() {
            return Ok(pending);
        }
        Ok(self.channel.read_bytes(desired)?)
    }

    /// Bytes up to and including the next newline; at end of stream,
    /// whatever was read.
    fn get_line(&mut self) -> Result<Bytes> {
        let mut line = BytesMut::new();
        loop {
            let bytes = self.get_bytes(1)?;
            if bytes.is_empty() {
                return Ok(line.freeze());
            }
            line.extend_from_slice(&bytes);
            let start = line.len() - bytes.len();
            if let Some(pos) = line[start..].iter().position(|b| *b == b'\n') {
                let rest = line.split_off(start + pos + 1);
                self.push_back(rest.freeze())?;
                return Ok(line.freeze());
            }
        }
    }
}
