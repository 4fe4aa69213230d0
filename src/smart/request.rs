//! Request dispatch: the verb registry, the handler driving one request and
//! the mapping between local errors and wire error tuples.

use super::vfs::{self, LocalTransport};
use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// Responses
// =============================================================================

/// One piece of a streamed response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyChunk {
    Data(Bytes),
    /// Aborts the stream with an error tuple.
    Error(Vec<String>),
}

/// Body parts produced lazily, one per `next`.
pub type BodyStream = Box<dyn Iterator<Item = BodyChunk> + Send>;

pub struct Response {
    pub args: Vec<String>,
    pub body: Option<Bytes>,
    pub body_stream: Option<BodyStream>,
    pub successful: bool,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("args", &self.args)
            .field("body", &self.body.as_ref().map(Bytes::len))
            .field("streamed", &self.body_stream.is_some())
            .field("successful", &self.successful)
            .finish()
    }
}

impl Response {
    pub fn success<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            body: None,
            body_stream: None,
            successful: true,
        }
    }

    pub fn failure<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            successful: false,
            ..Self::success(args)
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// The chunks are pulled only as the response is written out.
    pub fn with_body_stream<I>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = BodyChunk>,
        I::IntoIter: Send + 'static,
    {
        self.body_stream = Some(Box::new(chunks.into_iter()));
        self
    }

    /// Collapse a streamed body for protocols that cannot stream. An error
    /// chunk replaces the whole response.
    pub(crate) fn flatten(self) -> (bool, Vec<String>, Option<Bytes>) {
        let Some(chunks) = self.body_stream else {
            return (self.successful, self.args, self.body);
        };
        let mut body = BytesMut::new();
        for chunk in chunks {
            match chunk {
                BodyChunk::Data(data) => body.extend_from_slice(&data),
                BodyChunk::Error(args) => return (false, args, None),
            }
        }
        (self.successful, self.args, Some(body.freeze()))
    }
}

// =============================================================================
// Requests and Registry
// =============================================================================

/// Server-side implementation of one verb.
pub trait SmartRequest {
    /// Handle the arguments. `None` means a body is expected and the
    /// response comes from [`do_body`](Self::do_body).
    fn execute(&mut self, args: &[String]) -> Result<Option<Response>>;

    fn do_body(&mut self, _body: Bytes) -> Result<Response> {
        Err(Error::framing("this request does not take a body"))
    }
}

pub type RequestFactory = fn(Arc<LocalTransport>) -> Box<dyn SmartRequest>;

/// Maps verbs to request constructors.
#[derive(Default)]
pub struct Registry {
    verbs: HashMap<&'static str, RequestFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `hello`, `Transport.is_readonly` and the VFS verbs.
    pub fn with_default_verbs() -> Self {
        let mut registry = Self::new();
        registry.register("hello", hello);
        registry.register("Transport.is_readonly", is_readonly);
        vfs::register_verbs(&mut registry);
        registry
    }

    pub fn register(&mut self, verb: &'static str, factory: RequestFactory) {
        self.verbs.insert(verb, factory);
    }

    pub fn get(&self, verb: &str) -> Option<RequestFactory> {
        self.verbs.get(verb).copied()
    }

    pub fn contains(&self, verb: &str) -> bool {
        self.verbs.contains_key(verb)
    }

    pub fn verbs(&self) -> Vec<&'static str> {
        let mut verbs: Vec<_> = self.verbs.keys().copied().collect();
        verbs.sort_unstable();
        verbs
    }
}

struct HelloRequest;

impl SmartRequest for HelloRequest {
    fn execute(&mut self, _args: &[String]) -> Result<Option<Response>> {
        Ok(Some(Response::success(["ok", "2"])))
    }
}

fn hello(_: Arc<LocalTransport>) -> Box<dyn SmartRequest> {
    Box::new(HelloRequest)
}

struct IsReadonlyRequest(Arc<LocalTransport>);

impl SmartRequest for IsReadonlyRequest {
    fn execute(&mut self, _args: &[String]) -> Result<Option<Response>> {
        let answer = if self.0.is_read_only() { "yes" } else { "no" };
        Ok(Some(Response::success([answer])))
    }
}

fn is_readonly(transport: Arc<LocalTransport>) -> Box<dyn SmartRequest> {
    Box::new(IsReadonlyRequest(transport))
}

// =============================================================================
// Dispatch
// =============================================================================

/// Everything a connection needs to serve requests. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    transport: Arc<LocalTransport>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, transport: Arc<LocalTransport>) -> Self {
        Self {
            registry,
            transport,
        }
    }

    pub fn transport(&self) -> &LocalTransport {
        &self.transport
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn handler(&self) -> RequestHandler {
        RequestHandler::new(self.clone())
    }
}

/// Drives a single request through execute, body and response.
pub struct RequestHandler {
    dispatcher: Dispatcher,
    command: Option<Box<dyn SmartRequest>>,
    body: BytesMut,
    response: Option<Response>,
    finished_reading: bool,
}

impl RequestHandler {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            command: None,
            body: BytesMut::new(),
            response: None,
            finished_reading: false,
        }
    }

    pub fn dispatch_command(&mut self, verb: &str, args: &[String]) {
        let Some(factory) = self.dispatcher.registry.get(verb) else {
            self.set_result(Err(Error::UnknownMethod(verb.to_string())));
            return;
        };
        let mut command = factory(Arc::clone(&self.dispatcher.transport));
        let result = command.execute(args);
        self.command = Some(command);
        self.set_result(result);
    }

    pub fn accept_body(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    pub fn end_of_body(&mut self) {
        let body = self.body.split().freeze();
        let result = match self.command.as_mut() {
            Some(command) => command.do_body(body).map(Some),
            None => Err(Error::framing("body received before a request")),
        };
        self.set_result(result);
        self.finished_reading = true;
    }

    /// True once a response is ready.
    pub fn finished_reading(&self) -> bool {
        self.finished_reading
    }

    pub fn take_response(&mut self) -> Response {
        self.response
            .take()
            .unwrap_or_else(|| Response::failure(["error", "request produced no response"]))
    }

    fn set_result(&mut self, result: Result<Option<Response>>) {
        match result {
            Ok(None) => {}
            Ok(Some(response)) => {
                self.response = Some(response);
                self.finished_reading = true;
            }
            Err(e) => {
                self.response = Some(error_response(&e));
                self.finished_reading = true;
            }
        }
    }
}

/// Wire form of a request failure.
pub fn error_response(err: &Error) -> Response {
    match err {
        Error::UnknownMethod(verb) => Response::failure(["UnknownMethod", verb.as_str()]),
        Error::NoSuchFile { path } => Response::failure(["NoSuchFile", path.as_str()]),
        Error::FileExists { path } => Response::failure(["FileExists", path.as_str()]),
        Error::DirectoryNotEmpty { path } => {
            Response::failure(["DirectoryNotEmpty", path.as_str()])
        }
        Error::PathEscapesRoot { path } => Response::failure(["PermissionDenied", path.as_str()]),
        Error::ReadOnly => Response::failure(["ReadOnlyError"]),
        Error::ShortReadv {
            path,
            offset,
            length,
            actual,
        } => Response::failure([
            "ShortReadvError".to_string(),
            path.clone(),
            offset.to_string(),
            length.to_string(),
            actual.to_string(),
        ]),
        other => {
            warn!(error = %other, "request failed");
            Response::failure(["error".to_string(), other.to_string()])
        }
    }
}

/// Client-side inverse of [`error_response`].
pub fn translate_error(args: Vec<String>) -> Error {
    debug!(args = ?args, "server returned an error");
    match args.first().map(String::as_str) {
        Some("UnknownMethod") => Error::UnknownMethod(args.get(1).cloned().unwrap_or_default()),
        _ => Error::ErrorFromServer { args },
    }
}

/// Argument `idx` of a request, or an error naming the verb.
pub(crate) fn arg<'a>(verb: &str, args: &'a [String], idx: usize) -> Result<&'a str> {
    args.get(idx).map(String::as_str).ok_or_else(|| {
        Error::framing(format!(
            "{} expects at least {} arguments, got {}",
            verb,
            idx + 1,
            args.len()
        ))
    })
}
