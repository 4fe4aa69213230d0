//! Handlers for decoded v3 message parts.
//!
//! A conventional request is one argument structure followed by optional
//! body parts. A conventional response is a status byte (`S` or `E`), an
//! argument structure, then optional body parts, possibly ending with an
//! `E` byte and an error structure when a streamed body fails.

use super::bencode::Value;
use super::request::{RequestHandler, Response};
use super::v3::ResponseEncoder;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace};

pub const STATUS_SUCCESS: u8 = b'S';
pub const STATUS_ERROR: u8 = b'E';

pub type Headers = BTreeMap<Bytes, Value>;

/// Receives the parts of one v3 message as they are decoded.
pub trait MessageHandler {
    fn headers_received(&mut self, headers: Headers) -> Result<()>;

    fn byte_part_received(&mut self, byte: u8) -> Result<()>;

    fn bytes_part_received(&mut self, bytes: Bytes) -> Result<()>;

    fn structure_part_received(&mut self, structure: Value) -> Result<()>;

    fn end_received(&mut self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Server Side
// =============================================================================

pub struct ConventionalRequestHandler {
    handler: RequestHandler,
    args_received: bool,
    responded: bool,
    response: Option<ResponseEncoder>,
}

impl ConventionalRequestHandler {
    pub fn new(handler: RequestHandler) -> Self {
        Self {
            handler,
            args_received: false,
            responded: false,
            response: None,
        }
    }

    /// The next piece of the response; empty when nothing is pending.
    pub fn take_output(&mut self) -> Bytes {
        let Some(encoder) = self.response.as_mut() else {
            return Bytes::new();
        };
        match encoder.next_piece() {
            Some(piece) => piece,
            None => {
                self.response = None;
                Bytes::new()
            }
        }
    }

    /// Respond with an error tuple unless a response already went out.
    pub fn send_error(&mut self, args: &[&str]) {
        if !self.responded {
            self.send_response(Response::failure(args.iter().copied()));
        }
    }

    fn send_response(&mut self, response: Response) {
        self.response = Some(ResponseEncoder::new(response));
        self.responded = true;
    }
}

impl MessageHandler for ConventionalRequestHandler {
    fn headers_received(&mut self, headers: Headers) -> Result<()> {
        trace!(count = headers.len(), "request headers");
        Ok(())
    }

    fn byte_part_received(&mut self, byte: u8) -> Result<()> {
        Err(Error::framing(format!(
            "unexpected byte part {:?} in request",
            byte as char
        )))
    }

    fn bytes_part_received(&mut self, bytes: Bytes) -> Result<()> {
        if !self.args_received {
            return Err(Error::framing("body part before request arguments"));
        }
        // a request answered early still has its body parts drained here
        if !self.responded {
            self.handler.accept_body(&bytes);
        }
        Ok(())
    }

    fn structure_part_received(&mut self, structure: Value) -> Result<()> {
        if self.args_received {
            return Err(Error::framing("unexpected structure after request arguments"));
        }
        self.args_received = true;
        let args = structure.into_string_list()?;
        let Some((verb, rest)) = args.split_first() else {
            return Err(Error::framing("empty request arguments"));
        };
        debug!(version = "v3", verb = %verb, "dispatching request");
        self.handler.dispatch_command(verb, rest);
        if self.handler.finished_reading() {
            let response = self.handler.take_response();
            self.send_response(response);
        }
        Ok(())
    }

    fn end_received(&mut self) -> Result<()> {
        if !self.args_received {
            return Err(Error::framing("request ended without arguments"));
        }
        if !self.responded {
            self.handler.end_of_body();
            let response = self.handler.take_response();
            self.send_response(response);
        }
        Ok(())
    }
}

// =============================================================================
// Client Side
// =============================================================================

#[derive(Debug, Default)]
pub struct ConventionalResponseHandler {
    headers: Option<Headers>,
    status: Option<u8>,
    args: Option<Vec<String>>,
    body_parts: VecDeque<Bytes>,
    body_started: bool,
    body_stream_status: Option<u8>,
    body_error_args: Option<Vec<String>>,
}

impl ConventionalResponseHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }

    pub fn status(&self) -> Option<u8> {
        self.status
    }

    pub fn args(&self) -> Option<&[String]> {
        self.args.as_deref()
    }

    pub fn take_body_parts(&mut self) -> Vec<Bytes> {
        self.body_parts.drain(..).collect()
    }

    /// Oldest body part not yet handed out.
    pub fn next_body_part(&mut self) -> Option<Bytes> {
        self.body_parts.pop_front()
    }

    /// Error tuple of a streamed body that failed part way.
    pub fn body_error(&self) -> Option<&[String]> {
        match self.body_stream_status {
            Some(STATUS_ERROR) => self.body_error_args.as_deref(),
            _ => None,
        }
    }
}

impl MessageHandler for ConventionalResponseHandler {
    fn headers_received(&mut self, headers: Headers) -> Result<()> {
        self.headers = Some(headers);
        Ok(())
    }

    fn byte_part_received(&mut self, byte: u8) -> Result<()> {
        if self.status.is_none() {
            if byte != STATUS_SUCCESS && byte != STATUS_ERROR {
                return Err(Error::framing(format!(
                    "bad response status {:?}",
                    byte as char
                )));
            }
            self.status = Some(byte);
        } else if (self.body_started || self.args.is_some()) && self.body_stream_status.is_none() {
            self.body_stream_status = Some(byte);
        } else {
            return Err(Error::framing("unexpected byte part in response"));
        }
        Ok(())
    }

    fn bytes_part_received(&mut self, bytes: Bytes) -> Result<()> {
        self.body_started = true;
        self.body_parts.push_back(bytes);
        Ok(())
    }

    fn structure_part_received(&mut self, structure: Value) -> Result<()> {
        if self.args.is_none() {
            self.args = Some(structure.into_string_list()?);
        } else if self.body_stream_status == Some(STATUS_ERROR) && self.body_error_args.is_none() {
            self.body_error_args = Some(structure.into_string_list()?);
        } else {
            return Err(Error::framing("unexpected structure in response"));
        }
        Ok(())
    }
}
