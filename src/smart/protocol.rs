//! Protocol versions one and two: newline-terminated argument tuples with
//! optional length-prefixed bodies.
//!
//! Wire format (v1):
//!   request  = tuple [body]
//!   tuple    = arg *( 0x01 arg ) "\n"
//!   body     = decimal-length "\n" bytes "done\n"
//!
//! Version two prefixes requests with `bzr request 2\n` and responses with
//! `bzr response 2\n` plus a `success\n` / `failed\n` status line.

use super::client_medium::ClientRequest;
use super::request::{translate_error, Dispatcher, RequestHandler, Response};
use super::v3::ServerProtocolThree;
use super::{MESSAGE_VERSION_THREE, REQUEST_VERSION_TWO, RESPONSE_VERSION_TWO};
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

const TUPLE_SEPARATOR: u8 = 0x01;
const BODY_TRAILER: &[u8] = b"done\n";
const STATUS_SUCCESS: &[u8] = b"success\n";
const STATUS_FAILED: &[u8] = b"failed\n";

// =============================================================================
// Version Detection
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    One = 1,
    Two = 2,
    Three = 3,
}

impl ProtocolVersion {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            3 => Some(Self::Three),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Server-side protocol object for one request in this version.
    pub fn build_server_protocol(self, dispatcher: &Dispatcher) -> Box<dyn ServerProtocol> {
        let handler = dispatcher.handler();
        match self {
            Self::One => Box::new(RequestProtocolOne::new(handler, Self::One)),
            Self::Two => Box::new(RequestProtocolOne::new(handler, Self::Two)),
            Self::Three => Box::new(ServerProtocolThree::new(handler)),
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// Pick the protocol for a request from its first line.
///
/// Returns the version and the bytes still to be fed to the protocol: the
/// whole line for v1, whatever follows the marker otherwise.
pub fn identify_protocol_version(line: &[u8]) -> (ProtocolVersion, &[u8]) {
    if let Some(rest) = line.strip_prefix(MESSAGE_VERSION_THREE) {
        (ProtocolVersion::Three, rest)
    } else if let Some(rest) = line.strip_prefix(REQUEST_VERSION_TWO) {
        (ProtocolVersion::Two, rest)
    } else {
        (ProtocolVersion::One, line)
    }
}

// =============================================================================
// Tuple and Body Codec
// =============================================================================

pub fn encode_tuple<S: AsRef<str>>(args: &[S]) -> Bytes {
    let mut buf = BytesMut::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            buf.put_u8(TUPLE_SEPARATOR);
        }
        buf.put_slice(arg.as_ref().as_bytes());
    }
    buf.put_u8(b'\n');
    buf.freeze()
}

/// `None` for an empty line; a line missing its newline is a framing error.
pub fn decode_tuple(line: &[u8]) -> Result<Option<Vec<String>>> {
    if line.is_empty() {
        return Ok(None);
    }
    let Some(line) = line.strip_suffix(b"\n") else {
        return Err(Error::framing(format!(
            "tuple {:?} is not terminated by a newline",
            String::from_utf8_lossy(line)
        )));
    };
    line.split(|b| *b == TUPLE_SEPARATOR)
        .map(|arg| {
            String::from_utf8(arg.to_vec()).map_err(|_| Error::framing("non-UTF-8 argument"))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

pub fn encode_body(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 16);
    buf.put_slice(format!("{}\n", body.len()).as_bytes());
    buf.put_slice(body);
    buf.put_slice(BODY_TRAILER);
    buf.freeze()
}

/// Body of a `readv` request: one `offset,length` per line, no trailing newline.
pub fn encode_readv_ranges(ranges: &[(u64, u64)]) -> Bytes {
    let lines: Vec<String> = ranges
        .iter()
        .map(|(offset, length)| format!("{},{}", offset, length))
        .collect();
    Bytes::from(lines.join("\n"))
}

pub fn decode_readv_ranges(body: &[u8]) -> Result<Vec<(u64, u64)>> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let text = std::str::from_utf8(body).map_err(|_| Error::framing("non-UTF-8 readv body"))?;
    text.split('\n')
        .map(|line| {
            let parsed = line
                .split_once(',')
                .and_then(|(o, l)| Some((o.parse().ok()?, l.parse().ok()?)));
            parsed.ok_or_else(|| Error::framing(format!("bad readv range {:?}", line)))
        })
        .collect()
}

// =============================================================================
// Length-Prefixed Body Decoder
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    ExpectingLength,
    ReadingBody,
    ReadingTrailer,
    ReadingUnused,
}

/// Incremental decoder for `length\n bytes done\n` bodies.
#[derive(Debug)]
pub struct LengthPrefixedBodyDecoder {
    state: BodyState,
    bytes_left: usize,
    in_buffer: BytesMut,
    trailer: BytesMut,
    unused: BytesMut,
}

impl Default for LengthPrefixedBodyDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LengthPrefixedBodyDecoder {
    pub fn new() -> Self {
        Self {
            state: BodyState::ExpectingLength,
            bytes_left: 0,
            in_buffer: BytesMut::new(),
            trailer: BytesMut::new(),
            unused: BytesMut::new(),
        }
    }

    pub fn finished_reading(&self) -> bool {
        self.state == BodyState::ReadingUnused
    }

    pub fn accept_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        match self.state {
            BodyState::ExpectingLength => {
                self.in_buffer.extend_from_slice(bytes);
                let Some(pos) = self.in_buffer.iter().position(|b| *b == b'\n') else {
                    return Ok(());
                };
                let header = self.in_buffer.split_to(pos + 1);
                self.bytes_left = std::str::from_utf8(&header[..pos])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        Error::framing(format!(
                            "bad body length {:?}",
                            String::from_utf8_lossy(&header[..pos])
                        ))
                    })?;
                let rest = self.in_buffer.split();
                self.state = BodyState::ReadingBody;
                self.accept_body(&rest)
            }
            BodyState::ReadingBody => self.accept_body(bytes),
            BodyState::ReadingTrailer => {
                self.trailer.extend_from_slice(bytes);
                self.check_trailer()
            }
            BodyState::ReadingUnused => {
                self.unused.extend_from_slice(bytes);
                Ok(())
            }
        }
    }

    fn accept_body(&mut self, bytes: &[u8]) -> Result<()> {
        let take = bytes.len().min(self.bytes_left);
        self.in_buffer.extend_from_slice(&bytes[..take]);
        self.bytes_left -= take;
        if self.bytes_left == 0 {
            self.state = BodyState::ReadingTrailer;
            self.trailer.extend_from_slice(&bytes[take..]);
            self.check_trailer()?;
        }
        Ok(())
    }

    fn check_trailer(&mut self) -> Result<()> {
        if self.trailer.len() < BODY_TRAILER.len() {
            return Ok(());
        }
        if !self.trailer.starts_with(BODY_TRAILER) {
            return Err(Error::framing(format!(
                "bad body trailer {:?}",
                String::from_utf8_lossy(&self.trailer[..BODY_TRAILER.len()])
            )));
        }
        let rest = self.trailer.split_off(BODY_TRAILER.len());
        self.unused.extend_from_slice(&rest);
        self.trailer.clear();
        self.state = BodyState::ReadingUnused;
        Ok(())
    }

    /// How many bytes to ask the channel for next.
    pub fn next_read_size(&self) -> usize {
        match self.state {
            BodyState::ExpectingLength => 6,
            BodyState::ReadingBody => self.bytes_left + BODY_TRAILER.len(),
            BodyState::ReadingTrailer => BODY_TRAILER.len() - self.trailer.len(),
            BodyState::ReadingUnused => 1,
        }
    }

    /// Body bytes decoded since the last call.
    pub fn read_pending_data(&mut self) -> Bytes {
        if self.state == BodyState::ExpectingLength {
            return Bytes::new();
        }
        self.in_buffer.split().freeze()
    }

    pub fn unused_data(&self) -> &[u8] {
        &self.unused
    }

    pub fn take_unused_data(&mut self) -> Bytes {
        self.unused.split().freeze()
    }
}

// =============================================================================
// Server Side
// =============================================================================

/// A protocol object decoding one request and encoding its response.
pub trait ServerProtocol {
    fn accept_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    /// Zero once the request has been fully read.
    fn next_read_size(&self) -> usize;

    /// Bytes received past the end of this request.
    fn take_unused_data(&mut self) -> Bytes;

    /// Response bytes produced since the last call. A streamed body comes
    /// out one piece per call; empty once nothing is pending.
    fn take_output(&mut self) -> Bytes;
}

/// Server protocol for versions one and two.
pub struct RequestProtocolOne {
    handler: RequestHandler,
    version: ProtocolVersion,
    in_buffer: BytesMut,
    has_dispatched: bool,
    body_decoder: Option<LengthPrefixedBodyDecoder>,
    excess: BytesMut,
    finished: bool,
    out: BytesMut,
}

impl RequestProtocolOne {
    pub fn new(handler: RequestHandler, version: ProtocolVersion) -> Self {
        Self {
            handler,
            version,
            in_buffer: BytesMut::new(),
            has_dispatched: false,
            body_decoder: None,
            excess: BytesMut::new(),
            finished: false,
            out: BytesMut::new(),
        }
    }

    fn dispatch(&mut self, line: &[u8]) {
        let args = match decode_tuple(line) {
            Ok(Some(args)) => args,
            Ok(None) => Vec::new(),
            Err(e) => {
                self.send_response(Response::failure(["error", &e.to_string()]));
                return;
            }
        };
        let Some((verb, rest)) = args.split_first() else {
            self.send_response(Response::failure(["error", "empty request"]));
            return;
        };
        debug!(version = %self.version, verb = %verb, "dispatching request");
        self.handler.dispatch_command(verb, rest);
        if self.handler.finished_reading() {
            let response = self.handler.take_response();
            self.send_response(response);
        }
    }

    fn send_response(&mut self, response: Response) {
        let (successful, args, body) = response.flatten();
        if self.version == ProtocolVersion::Two {
            self.out.put_slice(RESPONSE_VERSION_TWO);
            self.out
                .put_slice(if successful { STATUS_SUCCESS } else { STATUS_FAILED });
        }
        self.out.put_slice(&encode_tuple(&args));
        if let Some(body) = body {
            self.out.put_slice(&encode_body(&body));
        }
        self.finished = true;
    }
}

impl ServerProtocol for RequestProtocolOne {
    fn accept_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.finished {
            self.excess.extend_from_slice(bytes);
            return Ok(());
        }

        let body_bytes = if self.has_dispatched {
            Bytes::copy_from_slice(bytes)
        } else {
            self.in_buffer.extend_from_slice(bytes);
            let Some(pos) = self.in_buffer.iter().position(|b| *b == b'\n') else {
                return Ok(());
            };
            self.has_dispatched = true;
            let line = self.in_buffer.split_to(pos + 1);
            let rest = self.in_buffer.split().freeze();
            self.dispatch(&line);
            if self.finished {
                self.excess.extend_from_slice(&rest);
                return Ok(());
            }
            rest
        };

        let decoder = self
            .body_decoder
            .get_or_insert_with(LengthPrefixedBodyDecoder::new);
        if let Err(e) = decoder.accept_bytes(&body_bytes) {
            self.send_response(Response::failure(["error", &e.to_string()]));
            return Err(e);
        }
        let pending = decoder.read_pending_data();
        self.handler.accept_body(&pending);
        if decoder.finished_reading() {
            let unused = decoder.take_unused_data();
            self.excess.extend_from_slice(&unused);
            self.handler.end_of_body();
            let response = self.handler.take_response();
            self.send_response(response);
        }
        Ok(())
    }

    fn next_read_size(&self) -> usize {
        if self.finished {
            0
        } else {
            match &self.body_decoder {
                None => 1,
                Some(decoder) => decoder.next_read_size(),
            }
        }
    }

    fn take_unused_data(&mut self) -> Bytes {
        let mut unused = self.excess.split();
        // bytes that never completed a request line
        if !self.has_dispatched {
            unused.extend_from_slice(&self.in_buffer.split());
        }
        unused.freeze()
    }

    fn take_output(&mut self) -> Bytes {
        self.out.split().freeze()
    }
}

// =============================================================================
// Client Side
// =============================================================================

/// Client half of a protocol: encodes one request and decodes its response.
pub trait ClientProtocol {
    fn call(&mut self, args: &[&str]) -> Result<()>;

    fn call_with_body_bytes(&mut self, args: &[&str], body: &[u8]) -> Result<()>;

    fn call_with_body_readv_array(&mut self, args: &[&str], ranges: &[(u64, u64)]) -> Result<()> {
        self.call_with_body_bytes(args, &encode_readv_ranges(ranges))
    }

    /// Read the response arguments. With `expect_body` the request stays
    /// open for [`read_body_bytes`](Self::read_body_bytes).
    fn read_response_tuple(&mut self, expect_body: bool) -> Result<Vec<String>>;

    fn read_body_bytes(&mut self) -> Result<Bytes>;

    /// The next body part as soon as it has arrived; `None` after the last.
    fn read_body_part(&mut self) -> Result<Option<Bytes>>;

    fn read_streamed_body(&mut self) -> Result<Vec<Bytes>> {
        let mut parts = Vec::new();
        while let Some(part) = self.read_body_part()? {
            parts.push(part);
        }
        Ok(parts)
    }

    /// Abandon a body the caller does not want.
    fn cancel_read_body(&mut self) -> Result<()>;
}

/// Client protocol for versions one and two.
pub struct ClientProtocolOne {
    request: ClientRequest,
    version: ProtocolVersion,
    reading_done: bool,
}

impl ClientProtocolOne {
    pub fn new(request: ClientRequest, version: ProtocolVersion) -> Self {
        Self {
            request,
            version,
            reading_done: false,
        }
    }

    /// Ask the server which protocol it speaks: the `hello` verb.
    pub fn query_version(&mut self) -> Result<ProtocolVersion> {
        self.call(&["hello"])?;
        let resp = self.read_response_tuple(false)?;
        match resp.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["ok", "1"] => Ok(ProtocolVersion::One),
            ["ok", "2"] => Ok(ProtocolVersion::Two),
            _ => Err(Error::framing(format!("bad response to hello: {:?}", resp))),
        }
    }

    fn write_request(&mut self, args: &[&str], body: Option<&[u8]>) -> Result<()> {
        if self.version == ProtocolVersion::Two {
            self.request.accept_bytes(REQUEST_VERSION_TWO)?;
        }
        self.request.accept_bytes(&encode_tuple(args))?;
        if let Some(body) = body {
            self.request.accept_bytes(&encode_body(body))?;
        }
        self.request.finished_writing()
    }

    fn finish_reading(&mut self) -> Result<()> {
        if !self.reading_done {
            self.reading_done = true;
            self.request.finished_reading()?;
        }
        Ok(())
    }

    fn recv_tuple(&mut self) -> Result<Vec<String>> {
        let line = self.request.read_line()?;
        Ok(decode_tuple(&line)?.unwrap_or_default())
    }

    fn check_unknown_method(&mut self, resp: &[String]) -> Result<()> {
        if resp.first().map(String::as_str) == Some("UnknownMethod") {
            self.finish_reading()?;
            return Err(translate_error(resp.to_vec()));
        }
        Ok(())
    }
}

impl ClientProtocol for ClientProtocolOne {
    fn call(&mut self, args: &[&str]) -> Result<()> {
        debug!(version = %self.version, verb = ?args.first(), "sending request");
        self.write_request(args, None)
    }

    fn call_with_body_bytes(&mut self, args: &[&str], body: &[u8]) -> Result<()> {
        debug!(version = %self.version, verb = ?args.first(), len = body.len(), "sending request with body");
        self.write_request(args, Some(body))
    }

    fn read_response_tuple(&mut self, expect_body: bool) -> Result<Vec<String>> {
        if self.version == ProtocolVersion::One {
            let resp = self.recv_tuple()?;
            self.check_unknown_method(&resp)?;
            if !expect_body {
                self.finish_reading()?;
            }
            return Ok(resp);
        }

        let marker = self.request.read_line()?;
        if marker != RESPONSE_VERSION_TWO {
            self.finish_reading()?;
            return Err(Error::UnexpectedProtocolVersion(
                String::from_utf8_lossy(&marker).into_owned(),
            ));
        }
        let status = self.request.read_line()?;
        let resp = self.recv_tuple()?;
        self.check_unknown_method(&resp)?;
        if status == STATUS_SUCCESS {
            if !expect_body {
                self.finish_reading()?;
            }
            Ok(resp)
        } else if status == STATUS_FAILED {
            self.finish_reading()?;
            Err(translate_error(resp))
        } else {
            self.finish_reading()?;
            Err(Error::framing(format!(
                "bad protocol status {:?}",
                String::from_utf8_lossy(&status)
            )))
        }
    }

    fn read_body_bytes(&mut self) -> Result<Bytes> {
        let mut decoder = LengthPrefixedBodyDecoder::new();
        let mut body = BytesMut::new();
        while !decoder.finished_reading() {
            let bytes = self.request.read_bytes(decoder.next_read_size())?;
            if bytes.is_empty() {
                return Err(self
                    .request
                    .connection_lost("connection lost while reading response body"));
            }
            decoder.accept_bytes(&bytes)?;
            body.extend_from_slice(&decoder.read_pending_data());
        }
        self.finish_reading()?;
        Ok(body.freeze())
    }

    // Versions one and two cannot stream, so the whole body is one part.
    fn read_body_part(&mut self) -> Result<Option<Bytes>> {
        if self.reading_done {
            return Ok(None);
        }
        self.read_body_bytes().map(Some)
    }

    fn cancel_read_body(&mut self) -> Result<()> {
        self.finish_reading()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smart::client_medium::ClientMedium;
    use crate::smart::request::Registry;
    use crate::smart::vfs::LocalTransport;
    use std::io::Cursor;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn dispatcher(dir: &TempDir) -> Dispatcher {
        let transport = LocalTransport::new(dir.path(), false).unwrap();
        Dispatcher::new(Arc::new(Registry::with_default_verbs()), Arc::new(transport))
    }

    #[test]
    fn test_tuple_codec() {
        assert_eq!(&encode_tuple(&["get", "a/b"])[..], b"get\x01a/b\n");
        assert_eq!(
            decode_tuple(b"ok\x01x\n").unwrap(),
            Some(vec!["ok".to_string(), "x".to_string()])
        );
        assert_eq!(decode_tuple(b"").unwrap(), None);
        assert_eq!(decode_tuple(b"\n").unwrap(), Some(vec![String::new()]));
        assert!(matches!(
            decode_tuple(b"ok"),
            Err(Error::ProtocolFraming { .. })
        ));
    }

    #[test]
    fn test_body_encoding() {
        assert_eq!(&encode_body(b"abc")[..], b"3\nabcdone\n");
        assert_eq!(&encode_body(b"")[..], b"0\ndone\n");
    }

    #[test]
    fn test_readv_ranges() {
        let body = encode_readv_ranges(&[(0, 3), (10, 2)]);
        assert_eq!(&body[..], b"0,3\n10,2");
        assert_eq!(decode_readv_ranges(&body).unwrap(), vec![(0, 3), (10, 2)]);
        assert!(decode_readv_ranges(b"1;2").is_err());
    }

    #[test]
    fn test_identify_protocol_version() {
        assert_eq!(
            identify_protocol_version(b"bzr message 3 (bzr 1.6)\nrest"),
            (ProtocolVersion::Three, &b"rest"[..])
        );
        assert_eq!(
            identify_protocol_version(b"bzr request 2\n"),
            (ProtocolVersion::Two, &b""[..])
        );
        assert_eq!(
            identify_protocol_version(b"hello\n"),
            (ProtocolVersion::One, &b"hello\n"[..])
        );
    }

    #[test]
    fn test_body_decoder_byte_at_a_time() {
        let mut decoder = LengthPrefixedBodyDecoder::new();
        assert_eq!(decoder.next_read_size(), 6);
        let mut body = Vec::new();
        for b in b"5\nhellodone\nnext" {
            decoder.accept_bytes(&[*b]).unwrap();
            body.extend_from_slice(&decoder.read_pending_data());
        }
        assert!(decoder.finished_reading());
        assert_eq!(body, b"hello");
        assert_eq!(decoder.unused_data(), b"next");
        assert_eq!(decoder.next_read_size(), 1);
    }

    #[test]
    fn test_body_decoder_next_read_size() {
        let mut decoder = LengthPrefixedBodyDecoder::new();
        decoder.accept_bytes(b"10\nab").unwrap();
        assert_eq!(decoder.next_read_size(), 8 + 5);
        decoder.accept_bytes(b"cdefghijdo").unwrap();
        assert_eq!(decoder.next_read_size(), 3);
        assert_eq!(&decoder.read_pending_data()[..], b"abcdefghij");
        decoder.accept_bytes(b"ne\n").unwrap();
        assert!(decoder.finished_reading());
    }

    #[test]
    fn test_body_decoder_bad_trailer() {
        let mut decoder = LengthPrefixedBodyDecoder::new();
        let err = decoder.accept_bytes(b"1\nxnope\n").unwrap_err();
        assert!(matches!(err, Error::ProtocolFraming { .. }));
    }

    #[test]
    fn test_body_decoder_bad_length() {
        let mut decoder = LengthPrefixedBodyDecoder::new();
        assert!(decoder.accept_bytes(b"x1\n").is_err());
    }

    #[test]
    fn test_server_v1_hello_with_excess() {
        let dir = TempDir::new().unwrap();
        let mut protocol = ProtocolVersion::One.build_server_protocol(&dispatcher(&dir));
        protocol.accept_bytes(b"hello\nhello\n").unwrap();
        assert_eq!(protocol.next_read_size(), 0);
        assert_eq!(&protocol.take_output()[..], b"ok\x012\n");
        assert_eq!(&protocol.take_unused_data()[..], b"hello\n");
    }

    #[test]
    fn test_server_v2_failure_status() {
        let dir = TempDir::new().unwrap();
        let mut protocol = ProtocolVersion::Two.build_server_protocol(&dispatcher(&dir));
        protocol.accept_bytes(b"get\x01missing\n").unwrap();
        assert_eq!(
            &protocol.take_output()[..],
            b"bzr response 2\nfailed\nNoSuchFile\x01missing\n"
        );
    }

    #[test]
    fn test_server_v1_put_with_body() {
        let dir = TempDir::new().unwrap();
        let mut protocol = ProtocolVersion::One.build_server_protocol(&dispatcher(&dir));
        protocol.accept_bytes(b"put\x01f\x01\n").unwrap();
        assert_eq!(protocol.next_read_size(), 6);
        protocol.accept_bytes(b"4\nda").unwrap();
        assert_eq!(protocol.next_read_size(), 2 + 5);
        protocol.accept_bytes(b"tadone\n").unwrap();
        assert_eq!(protocol.next_read_size(), 0);
        assert_eq!(&protocol.take_output()[..], b"ok\n");
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"data");
    }

    #[test]
    fn test_server_v1_bad_trailer_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut protocol = ProtocolVersion::One.build_server_protocol(&dispatcher(&dir));
        protocol.accept_bytes(b"put\x01f\x01\n").unwrap();
        assert!(protocol.accept_bytes(b"1\nxjunk\n").is_err());
        assert!(protocol.take_output().starts_with(b"error\x01"));
        assert_eq!(protocol.next_read_size(), 0);
    }

    #[test]
    fn test_server_unknown_verb() {
        let dir = TempDir::new().unwrap();
        let mut protocol = ProtocolVersion::One.build_server_protocol(&dispatcher(&dir));
        protocol.accept_bytes(b"frobnicate\x01x\n").unwrap();
        assert_eq!(&protocol.take_output()[..], b"UnknownMethod\x01frobnicate\n");
    }

    fn client_over(response: &[u8], version: ProtocolVersion) -> (ClientProtocolOne, ClientMedium) {
        let medium = ClientMedium::pipes(Cursor::new(response.to_vec()), Vec::new());
        let request = medium.get_request().unwrap();
        (ClientProtocolOne::new(request, version), medium)
    }

    #[test]
    fn test_client_v1_query_version() {
        let (mut protocol, medium) = client_over(b"ok\x012\n", ProtocolVersion::One);
        assert_eq!(protocol.query_version().unwrap(), ProtocolVersion::Two);
        assert!(medium.get_request().is_ok());
    }

    #[test]
    fn test_client_v2_reads_body() {
        let (mut protocol, _medium) = client_over(
            b"bzr response 2\nsuccess\nok\n5\nhellodone\n",
            ProtocolVersion::Two,
        );
        protocol.call(&["get", "f"]).unwrap();
        assert_eq!(protocol.read_response_tuple(true).unwrap(), vec!["ok"]);
        assert_eq!(&protocol.read_body_bytes().unwrap()[..], b"hello");
    }

    #[test]
    fn test_client_v2_failed_response() {
        let (mut protocol, medium) =
            client_over(b"bzr response 2\nfailed\nNoSuchFile\x01f\n", ProtocolVersion::Two);
        protocol.call(&["get", "f"]).unwrap();
        let err = protocol.read_response_tuple(true).unwrap_err();
        assert!(matches!(err, Error::ErrorFromServer { ref args } if args[0] == "NoSuchFile"));
        assert!(medium.get_request().is_ok());
    }

    #[test]
    fn test_client_v2_bad_status_frees_medium() {
        let (mut protocol, medium) = client_over(
            b"bzr response 2\nmaybe\nok\nbzr response 2\nsuccess\nyes\n",
            ProtocolVersion::Two,
        );
        protocol.call(&["has", "f"]).unwrap();
        let err = protocol.read_response_tuple(false).unwrap_err();
        assert!(matches!(err, Error::ProtocolFraming { ref reason, .. } if reason.contains("maybe")));
        assert!(!medium.has_request_in_flight());

        let mut second = ClientProtocolOne::new(medium.get_request().unwrap(), ProtocolVersion::Two);
        second.call(&["has", "f"]).unwrap();
        assert_eq!(second.read_response_tuple(false).unwrap(), vec!["yes"]);
    }

    #[test]
    fn test_client_v2_unexpected_marker() {
        let (mut protocol, _medium) = client_over(b"ok\x012\n", ProtocolVersion::Two);
        protocol.call(&["hello"]).unwrap();
        assert!(matches!(
            protocol.read_response_tuple(false),
            Err(Error::UnexpectedProtocolVersion(_))
        ));
    }

    #[test]
    fn test_client_truncated_response() {
        let (mut protocol, _medium) = client_over(b"ok\x01", ProtocolVersion::One);
        protocol.call(&["hello"]).unwrap();
        assert!(matches!(
            protocol.read_response_tuple(false),
            Err(Error::ConnectionReset { ref target, .. }) if target == "pipes"
        ));
    }
}
