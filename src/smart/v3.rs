//! Protocol version three: self-delimiting messages made of typed parts.
//!
//! Wire format:
//!   message   = marker headers *part end
//!   marker    = "bzr message 3 (bzr 1.6)\n"
//!   headers   = len:u32 bencoded-dict
//!   part      = "o" byte | "s" len:u32 bencoded-value | "b" len:u32 bytes
//!   end       = "e"
//!
//! All lengths are big-endian.

use super::bencode::Value;
use super::client_medium::ClientRequest;
use super::message::{
    ConventionalRequestHandler, ConventionalResponseHandler, Headers, MessageHandler,
    STATUS_ERROR, STATUS_SUCCESS,
};
use super::protocol::{encode_readv_ranges, ClientProtocol, ServerProtocol};
use super::request::{translate_error, BodyChunk, BodyStream, RequestHandler, Response};
use super::MESSAGE_VERSION_THREE;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

const LENGTH_PREFIX: usize = 4;

/// Largest headers, structure or bytes payload accepted in one frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// =============================================================================
// Message Parts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PartKind {
    Byte = b'o',
    Structure = b's',
    Bytes = b'b',
    End = b'e',
}

impl PartKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            b'o' => Some(Self::Byte),
            b's' => Some(Self::Structure),
            b'b' => Some(Self::Bytes),
            b'e' => Some(Self::End),
            _ => None,
        }
    }
}

// =============================================================================
// Encoding
// =============================================================================

#[derive(Debug, Default)]
pub struct MessageEncoder {
    buf: BytesMut,
}

impl MessageEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version_marker(&mut self) -> &mut Self {
        self.buf.put_slice(MESSAGE_VERSION_THREE);
        self
    }

    pub fn headers(&mut self, headers: &Headers) -> Result<&mut Self> {
        let encoded = Value::Dict(headers.clone()).encode();
        self.length_prefixed(None, &encoded)?;
        Ok(self)
    }

    pub fn byte(&mut self, byte: u8) -> &mut Self {
        self.buf.put_u8(PartKind::Byte as u8);
        self.buf.put_u8(byte);
        self
    }

    pub fn structure(&mut self, value: &Value) -> Result<&mut Self> {
        self.length_prefixed(Some(PartKind::Structure), &value.encode())?;
        Ok(self)
    }

    /// Body bytes, split into as many parts as the frame limit needs.
    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        for part in bytes.chunks(MAX_FRAME_LEN) {
            self.buf.put_u8(PartKind::Bytes as u8);
            // chunks are never longer than MAX_FRAME_LEN
            self.buf.put_u32(part.len() as u32);
            self.buf.put_slice(part);
        }
        self
    }

    pub fn end(&mut self) -> &mut Self {
        self.buf.put_u8(PartKind::End as u8);
        self
    }

    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    fn length_prefixed(&mut self, kind: Option<PartKind>, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .ok()
            .filter(|len| *len as usize <= MAX_FRAME_LEN)
            .ok_or_else(|| {
                Error::framing(format!(
                    "{} byte frame exceeds the {} byte limit",
                    data.len(),
                    MAX_FRAME_LEN
                ))
            })?;
        if let Some(kind) = kind {
            self.buf.put_u8(kind as u8);
        }
        self.buf.put_u32(len);
        self.buf.put_slice(data);
        Ok(())
    }
}

fn request_headers() -> Headers {
    let mut headers = Headers::new();
    headers.insert(
        Bytes::from_static(b"Software version"),
        Value::Bytes(Bytes::from(format!(
            "{} {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ))),
    );
    headers
}

pub fn encode_request(args: &[&str], body: Option<&[u8]>) -> Result<Bytes> {
    let mut encoder = MessageEncoder::new();
    encoder
        .version_marker()
        .headers(&request_headers())?
        .structure(&Value::string_list(args))?;
    if let Some(body) = body {
        encoder.bytes(body);
    }
    Ok(encoder.end().finish())
}

/// Writes a response out a piece at a time: first the status, arguments
/// and any fixed body, then one piece per streamed chunk as the stream
/// yields it, ending with the end-of-message byte.
pub struct ResponseEncoder {
    head: Option<Bytes>,
    stream: Option<BodyStream>,
    finished: bool,
}

impl ResponseEncoder {
    pub fn new(response: Response) -> Self {
        match response_head(&response) {
            Ok(head) => Self {
                head: Some(head),
                stream: response.body_stream,
                finished: false,
            },
            Err(e) => {
                warn!(error = %e, "response does not fit a message");
                Self::new(Response::failure(["error".to_string(), e.to_string()]))
            }
        }
    }

    /// `None` once the whole message has been produced.
    pub fn next_piece(&mut self) -> Option<Bytes> {
        if let Some(head) = self.head.take() {
            if self.stream.is_none() {
                self.finished = true;
                let mut encoder = MessageEncoder::new();
                encoder.end();
                let mut piece = BytesMut::from(&head[..]);
                piece.extend_from_slice(&encoder.finish());
                return Some(piece.freeze());
            }
            return Some(head);
        }
        if self.finished {
            return None;
        }
        let mut encoder = MessageEncoder::new();
        match self.stream.as_mut().and_then(Iterator::next) {
            Some(BodyChunk::Data(data)) => {
                encoder.bytes(&data);
            }
            Some(BodyChunk::Error(args)) => {
                debug!(args = ?args, "streamed body failed");
                stream_error(&mut encoder, &args);
                self.close(&mut encoder);
            }
            None => self.close(&mut encoder),
        }
        Some(encoder.finish())
    }

    fn close(&mut self, encoder: &mut MessageEncoder) {
        encoder.end();
        self.stream = None;
        self.finished = true;
    }
}

fn response_head(response: &Response) -> Result<Bytes> {
    let status = if response.successful {
        STATUS_SUCCESS
    } else {
        STATUS_ERROR
    };
    let mut encoder = MessageEncoder::new();
    encoder
        .version_marker()
        .headers(&Headers::new())?
        .byte(status)
        .structure(&Value::string_list(&response.args))?;
    if let Some(body) = &response.body {
        encoder.bytes(body);
    }
    Ok(encoder.finish())
}

fn stream_error(encoder: &mut MessageEncoder, args: &[String]) {
    encoder.byte(STATUS_ERROR);
    if let Err(e) = encoder.structure(&Value::string_list(args)) {
        let fallback = Value::string_list(&["error".to_string(), e.to_string()]);
        // nothing is written when a structure is refused
        let _ = encoder.structure(&fallback);
    }
}

/// The whole response as one buffer.
pub fn encode_response(response: Response) -> Bytes {
    let mut encoder = ResponseEncoder::new(response);
    let mut out = BytesMut::new();
    while let Some(piece) = encoder.next_piece() {
        out.extend_from_slice(&piece);
    }
    out.freeze()
}

// =============================================================================
// Decoding
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    ExpectingVersion,
    ExpectingHeaders,
    ExpectingPart,
    Done,
}

/// Incremental v3 decoder feeding parts to a [`MessageHandler`].
pub struct MessageDecoder<H> {
    handler: H,
    state: DecoderState,
    in_buffer: BytesMut,
    unused: BytesMut,
    failed: bool,
}

impl<H: MessageHandler> MessageDecoder<H> {
    /// Requests arrive with the marker already consumed; responses do not.
    pub fn new(handler: H, expect_version_marker: bool) -> Self {
        Self {
            handler,
            state: if expect_version_marker {
                DecoderState::ExpectingVersion
            } else {
                DecoderState::ExpectingHeaders
            },
            in_buffer: BytesMut::new(),
            unused: BytesMut::new(),
            failed: false,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn finished(&self) -> bool {
        self.state == DecoderState::Done
    }

    pub fn accept_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.failed {
            return Err(Error::framing("message decoder already failed"));
        }
        if self.state == DecoderState::Done {
            self.unused.extend_from_slice(bytes);
            return Ok(());
        }
        self.in_buffer.extend_from_slice(bytes);
        let result = self.process();
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn process(&mut self) -> Result<()> {
        loop {
            match self.state {
                DecoderState::ExpectingVersion => {
                    let marker = MESSAGE_VERSION_THREE;
                    if self.in_buffer.len() < marker.len() {
                        // fail early on a peer that will never send the whole marker
                        if !marker.starts_with(&self.in_buffer) {
                            return Err(self.bad_marker());
                        }
                        return Ok(());
                    }
                    if !self.in_buffer.starts_with(marker) {
                        return Err(self.bad_marker());
                    }
                    self.in_buffer.advance(marker.len());
                    self.state = DecoderState::ExpectingHeaders;
                }
                DecoderState::ExpectingHeaders => {
                    let Some(payload) = self.take_length_prefixed(0)? else {
                        return Ok(());
                    };
                    let Value::Dict(headers) = Value::decode(&payload)? else {
                        return Err(Error::framing("message headers are not a dict"));
                    };
                    self.handler.headers_received(headers)?;
                    self.state = DecoderState::ExpectingPart;
                }
                DecoderState::ExpectingPart => {
                    let Some(&kind) = self.in_buffer.first() else {
                        return Ok(());
                    };
                    match PartKind::from_u8(kind) {
                        Some(PartKind::Byte) => {
                            if self.in_buffer.len() < 2 {
                                return Ok(());
                            }
                            let byte = self.in_buffer[1];
                            self.in_buffer.advance(2);
                            self.handler.byte_part_received(byte)?;
                        }
                        Some(PartKind::Structure) => {
                            let Some(payload) = self.take_length_prefixed(1)? else {
                                return Ok(());
                            };
                            self.handler
                                .structure_part_received(Value::decode(&payload)?)?;
                        }
                        Some(PartKind::Bytes) => {
                            let Some(payload) = self.take_length_prefixed(1)? else {
                                return Ok(());
                            };
                            self.handler.bytes_part_received(payload)?;
                        }
                        Some(PartKind::End) => {
                            self.in_buffer.advance(1);
                            self.state = DecoderState::Done;
                            let rest = self.in_buffer.split();
                            self.unused.extend_from_slice(&rest);
                            return self.handler.end_received();
                        }
                        None => {
                            return Err(Error::framing(format!(
                                "bad message part kind {:?}",
                                kind as char
                            )));
                        }
                    }
                }
                DecoderState::Done => return Ok(()),
            }
        }
    }

    fn bad_marker(&self) -> Error {
        Error::UnexpectedProtocolVersion(String::from_utf8_lossy(&self.in_buffer).into_owned())
    }

    /// Payload of a length-prefixed frame that starts `skip` bytes in.
    fn take_length_prefixed(&mut self, skip: usize) -> Result<Option<Bytes>> {
        let Some(total) = self.frame_len(skip)? else {
            return Ok(None);
        };
        if self.in_buffer.len() < total {
            return Ok(None);
        }
        self.in_buffer.advance(skip + LENGTH_PREFIX);
        Ok(Some(
            self.in_buffer
                .split_to(total - skip - LENGTH_PREFIX)
                .freeze(),
        ))
    }

    /// Whole frame length once its prefix has arrived.
    fn frame_len(&self, skip: usize) -> Result<Option<usize>> {
        let Some(prefix) = self.in_buffer.get(skip..skip + LENGTH_PREFIX) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::framing(format!(
                "frame of {} bytes exceeds the {} byte limit",
                len, MAX_FRAME_LEN
            )));
        }
        Ok(Some(skip + LENGTH_PREFIX + len))
    }

    /// How many bytes complete the frame being decoded; zero when done.
    pub fn next_read_size(&self) -> usize {
        if self.failed || self.state == DecoderState::Done {
            return 0;
        }
        let needed = match self.state {
            DecoderState::ExpectingVersion => MESSAGE_VERSION_THREE.len(),
            DecoderState::ExpectingHeaders => {
                self.frame_len(0).ok().flatten().unwrap_or(LENGTH_PREFIX)
            }
            DecoderState::ExpectingPart => match self.in_buffer.first().copied().and_then(PartKind::from_u8) {
                None | Some(PartKind::End) => 1,
                Some(PartKind::Byte) => 2,
                Some(_) => self
                    .frame_len(1)
                    .ok()
                    .flatten()
                    .unwrap_or(1 + LENGTH_PREFIX),
            },
            DecoderState::Done => 0,
        };
        needed.saturating_sub(self.in_buffer.len()).max(1)
    }

    pub fn take_unused_data(&mut self) -> Bytes {
        self.unused.split().freeze()
    }
}

// =============================================================================
// Server Protocol
// =============================================================================

pub struct ServerProtocolThree {
    decoder: MessageDecoder<ConventionalRequestHandler>,
}

impl ServerProtocolThree {
    pub fn new(handler: RequestHandler) -> Self {
        Self {
            decoder: MessageDecoder::new(ConventionalRequestHandler::new(handler), false),
        }
    }
}

impl ServerProtocol for ServerProtocolThree {
    fn accept_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if let Err(e) = self.decoder.accept_bytes(bytes) {
            let msg = e.to_string();
            self.decoder.handler_mut().send_error(&["error", &msg]);
            return Err(e);
        }
        Ok(())
    }

    fn next_read_size(&self) -> usize {
        self.decoder.next_read_size()
    }

    fn take_unused_data(&mut self) -> Bytes {
        self.decoder.take_unused_data()
    }

    fn take_output(&mut self) -> Bytes {
        self.decoder.handler_mut().take_output()
    }
}

// =============================================================================
// Client Protocol
// =============================================================================

pub struct ClientProtocolThree {
    request: ClientRequest,
    decoder: MessageDecoder<ConventionalResponseHandler>,
    reading_done: bool,
}

impl ClientProtocolThree {
    pub fn new(request: ClientRequest) -> Self {
        Self {
            request,
            decoder: MessageDecoder::new(ConventionalResponseHandler::new(), true),
            reading_done: false,
        }
    }

    fn send(&mut self, args: &[&str], body: Option<&[u8]>) -> Result<()> {
        debug!(version = "v3", verb = ?args.first(), "sending request");
        self.request.accept_bytes(&encode_request(args, body)?)?;
        self.request.finished_writing()
    }

    fn read_more(&mut self) -> Result<()> {
        let size = self.decoder.next_read_size();
        if size > 0 {
            let bytes = self.request.read_bytes(size)?;
            if bytes.is_empty() {
                return Err(self
                    .request
                    .connection_lost("connection lost while reading response"));
            }
            self.decoder.accept_bytes(&bytes)?;
        }
        if self.decoder.next_read_size() == 0 && !self.reading_done {
            self.reading_done = true;
            self.request.finished_reading()?;
        }
        Ok(())
    }

    fn wait_for_response_end(&mut self) -> Result<()> {
        while !self.decoder.finished() {
            self.read_more()?;
        }
        if !self.reading_done {
            self.reading_done = true;
            self.request.finished_reading()?;
        }
        Ok(())
    }

    fn check_body_error(&self) -> Result<()> {
        match self.decoder.handler().body_error() {
            Some(args) => Err(translate_error(args.to_vec())),
            None => Ok(()),
        }
    }
}

impl ClientProtocol for ClientProtocolThree {
    fn call(&mut self, args: &[&str]) -> Result<()> {
        self.send(args, None)
    }

    fn call_with_body_bytes(&mut self, args: &[&str], body: &[u8]) -> Result<()> {
        self.send(args, Some(body))
    }

    fn call_with_body_readv_array(&mut self, args: &[&str], ranges: &[(u64, u64)]) -> Result<()> {
        let body = encode_readv_ranges(ranges);
        self.send(args, Some(&body))
    }

    fn read_response_tuple(&mut self, expect_body: bool) -> Result<Vec<String>> {
        while self.decoder.handler().args().is_none() {
            if self.decoder.finished() {
                return Err(Error::framing("response ended without arguments"));
            }
            self.read_more()?;
        }
        let args = self.decoder.handler().args().unwrap_or_default().to_vec();
        if self.decoder.handler().status() == Some(STATUS_ERROR) {
            self.wait_for_response_end()?;
            return Err(translate_error(args));
        }
        if !expect_body {
            self.wait_for_response_end()?;
        }
        Ok(args)
    }

    fn read_body_bytes(&mut self) -> Result<Bytes> {
        self.wait_for_response_end()?;
        self.check_body_error()?;
        let mut body = BytesMut::new();
        for part in self.decoder.handler_mut().take_body_parts() {
            body.extend_from_slice(&part);
        }
        Ok(body.freeze())
    }

    fn read_body_part(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(part) = self.decoder.handler_mut().next_body_part() {
                return Ok(Some(part));
            }
            if self.decoder.finished() {
                self.wait_for_response_end()?;
                self.check_body_error()?;
                return Ok(None);
            }
            self.read_more()?;
        }
    }

    fn cancel_read_body(&mut self) -> Result<()> {
        self.wait_for_response_end()
    }
}
