//! Client-side mediums: a byte channel to a smart server plus the
//! bookkeeping that allows only one request in flight at a time.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use tracing::debug;

#[cfg(feature = "ssh")]
use super::ssh::{SshChannel, SshConfig};

/// A connection that may be opened lazily and reopened after a disconnect.
pub trait ClientChannel {
    fn ensure_connection(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Up to `count` bytes; empty at end of stream.
    fn read(&mut self, count: usize) -> Result<Bytes>;

    fn disconnect(&mut self);

    fn describe(&self) -> String;
}

// =============================================================================
// Channels
// =============================================================================

/// A pair of already-open streams, e.g. a child's stdout and stdin.
pub struct PipeChannel<R, W> {
    reader: R,
    writer: W,
}

impl<R: Read, W: Write> PipeChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R: Read, W: Write> ClientChannel for PipeChannel<R, W> {
    fn ensure_connection(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn read(&mut self, count: usize) -> Result<Bytes> {
        read_up_to(&mut self.reader, count)
    }

    // Pipes cannot be reopened.
    fn disconnect(&mut self) {}

    fn describe(&self) -> String {
        "pipes".to_string()
    }
}

pub struct TcpChannel {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    pending: BytesMut,
}

impl TcpChannel {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
            pending: BytesMut::new(),
        }
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        let target = self.target();
        self.stream
            .as_mut()
            .ok_or(Error::MediumNotConnected(target))
    }
}

impl ClientChannel for TcpChannel {
    fn ensure_connection(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream =
            TcpStream::connect((self.host.as_str(), self.port)).map_err(|e| Error::Connection {
                target: self.target(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        debug!(target_addr = %self.target(), "connected");
        self.stream = Some(stream);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream()?;
        self.pending.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let pending = self.pending.split();
        let stream = self.stream()?;
        stream.write_all(&pending)?;
        stream.flush()?;
        Ok(())
    }

    fn read(&mut self, count: usize) -> Result<Bytes> {
        read_up_to(self.stream()?, count)
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!(target_addr = %self.target(), "disconnected");
        }
        self.pending.clear();
    }

    fn describe(&self) -> String {
        format!("bzr://{}/", self.target())
    }
}

pub(crate) fn read_up_to<R: Read + ?Sized>(reader: &mut R, count: usize) -> Result<Bytes> {
    let mut buf = vec![0u8; count.max(1)];
    let n = loop {
        match reader.read(&mut buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    };
    buf.truncate(n);
    Ok(Bytes::from(buf))
}

// =============================================================================
// Medium
// =============================================================================

/// Lines are read this many bytes at a time; the excess waits in the
/// medium for the next read.
const LINE_READ_SIZE: usize = 4096;

struct MediumState {
    channel: Box<dyn ClientChannel>,
    /// Bytes read from the channel but not yet consumed.
    read_ahead: BytesMut,
    current_request: Option<u64>,
    next_request_id: u64,
}

impl MediumState {
    fn read_bytes(&mut self, count: usize) -> Result<Bytes> {
        if !self.read_ahead.is_empty() {
            let take = count.max(1).min(self.read_ahead.len());
            return Ok(self.read_ahead.split_to(take).freeze());
        }
        self.channel.read(count)
    }

    /// `None` at end of stream, leaving the partial line buffered.
    fn read_line(&mut self) -> Result<Option<Bytes>> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.read_ahead[scanned..].iter().position(|b| *b == b'\n') {
                return Ok(Some(self.read_ahead.split_to(scanned + pos + 1).freeze()));
            }
            scanned = self.read_ahead.len();
            let bytes = self.channel.read(LINE_READ_SIZE)?;
            if bytes.is_empty() {
                return Ok(None);
            }
            self.read_ahead.extend_from_slice(&bytes);
        }
    }
}

/// Shared handle to a client channel. Clones refer to the same connection.
#[derive(Clone)]
pub struct ClientMedium {
    state: Rc<RefCell<MediumState>>,
}

impl ClientMedium {
    pub fn new(channel: impl ClientChannel + 'static) -> Self {
        Self {
            state: Rc::new(RefCell::new(MediumState {
                channel: Box::new(channel),
                read_ahead: BytesMut::new(),
                current_request: None,
                next_request_id: 0,
            })),
        }
    }

    pub fn pipes<R, W>(reader: R, writer: W) -> Self
    where
        R: Read + 'static,
        W: Write + 'static,
    {
        Self::new(PipeChannel::new(reader, writer))
    }

    /// Connects on first use.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(TcpChannel::new(host, port))
    }

    /// Spawns `ssh` on first use.
    #[cfg(feature = "ssh")]
    pub fn ssh(config: SshConfig) -> Self {
        Self::new(SshChannel::new(config))
    }

    /// Start a request. Fails while another request is unfinished.
    pub fn get_request(&self) -> Result<ClientRequest> {
        let mut state = self.state.borrow_mut();
        if state.current_request.is_some() {
            return Err(Error::TooManyConcurrentRequests);
        }
        let id = state.next_request_id;
        state.next_request_id += 1;
        state.current_request = Some(id);
        Ok(ClientRequest {
            medium: self.clone(),
            id,
            state: RequestState::Writing,
            wrote: false,
        })
    }

    pub fn has_request_in_flight(&self) -> bool {
        self.state.borrow().current_request.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().channel.is_connected()
    }

    /// Close the channel and forget any request in flight.
    pub fn disconnect(&self) {
        let mut state = self.state.borrow_mut();
        state.channel.disconnect();
        state.read_ahead.clear();
        state.current_request = None;
    }

    pub fn describe(&self) -> String {
        self.state.borrow().channel.describe()
    }

    fn release(&self, id: u64) {
        let mut state = self.state.borrow_mut();
        if state.current_request == Some(id) {
            state.current_request = None;
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Writing,
    Reading,
    Done,
}

/// One request: written completely, then read completely.
///
/// Dropping a request before it is done frees the medium. If any of it
/// reached the channel the connection is dropped too, since the position
/// in the response stream is lost.
pub struct ClientRequest {
    medium: ClientMedium,
    id: u64,
    state: RequestState,
    wrote: bool,
}

impl ClientRequest {
    pub fn accept_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.state != RequestState::Writing {
            return Err(Error::WritingCompleted);
        }
        let mut medium = self.medium.state.borrow_mut();
        medium.channel.ensure_connection()?;
        self.wrote = true;
        medium.channel.write_all(bytes)
    }

    pub fn finished_writing(&mut self) -> Result<()> {
        if self.state != RequestState::Writing {
            return Err(Error::WritingCompleted);
        }
        self.state = RequestState::Reading;
        let mut medium = self.medium.state.borrow_mut();
        medium.channel.ensure_connection()?;
        medium.channel.flush()
    }

    /// Up to `count` bytes of the response; empty at end of stream.
    pub fn read_bytes(&mut self, count: usize) -> Result<Bytes> {
        self.check_reading()?;
        self.medium.state.borrow_mut().read_bytes(count)
    }

    /// One line including its newline. End of stream first is an error.
    pub fn read_line(&mut self) -> Result<Bytes> {
        self.check_reading()?;
        let line = self.medium.state.borrow_mut().read_line()?;
        match line {
            Some(line) => Ok(line),
            None => {
                let partial = self.medium.state.borrow_mut().read_ahead.split();
                Err(self.connection_lost(format!(
                    "unexpected end of stream after {:?}",
                    String::from_utf8_lossy(&partial)
                )))
            }
        }
    }

    pub fn finished_reading(&mut self) -> Result<()> {
        self.check_reading()?;
        self.state = RequestState::Done;
        self.medium.release(self.id);
        Ok(())
    }

    /// The error for a response cut short by the peer.
    pub fn connection_lost(&self, reason: impl Into<String>) -> Error {
        Error::ConnectionReset {
            target: self.medium.describe(),
            reason: reason.into(),
        }
    }

    fn check_reading(&self) -> Result<()> {
        match self.state {
            RequestState::Writing => Err(Error::WritingNotComplete),
            RequestState::Reading => Ok(()),
            RequestState::Done => Err(Error::ReadingCompleted),
        }
    }
}

impl Drop for ClientRequest {
    fn drop(&mut self) {
        if self.state == RequestState::Done {
            return;
        }
        if self.medium.state.borrow().current_request != Some(self.id) {
            return;
        }
        if self.wrote {
            debug!(id = self.id, "request abandoned part way, dropping connection");
            self.medium.disconnect();
        } else {
            self.medium.release(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Writer whose contents stay visible after the medium takes it.
    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn medium(input: &[u8]) -> (ClientMedium, SharedBuf) {
        let out = SharedBuf::default();
        let medium = ClientMedium::pipes(Cursor::new(input.to_vec()), out.clone());
        (medium, out)
    }

    #[test]
    fn test_request_lifecycle() {
        let (medium, out) = medium(b"ok\n");
        let mut request = medium.get_request().unwrap();
        request.accept_bytes(b"hello\n").unwrap();
        assert!(matches!(request.read_bytes(1), Err(Error::WritingNotComplete)));
        assert!(matches!(request.finished_reading(), Err(Error::WritingNotComplete)));
        request.finished_writing().unwrap();
        assert!(matches!(request.accept_bytes(b"x"), Err(Error::WritingCompleted)));
        assert!(matches!(request.finished_writing(), Err(Error::WritingCompleted)));
        assert_eq!(&request.read_line().unwrap()[..], b"ok\n");
        request.finished_reading().unwrap();
        assert!(matches!(request.read_bytes(1), Err(Error::ReadingCompleted)));
        assert!(matches!(request.finished_reading(), Err(Error::ReadingCompleted)));
        assert_eq!(out.0.borrow().as_slice(), b"hello\n");
    }

    #[test]
    fn test_one_request_at_a_time() {
        let (medium, _out) = medium(b"");
        let mut first = medium.get_request().unwrap();
        assert!(matches!(
            medium.get_request(),
            Err(Error::TooManyConcurrentRequests)
        ));
        first.finished_writing().unwrap();
        first.finished_reading().unwrap();
        assert!(medium.get_request().is_ok());
    }

    #[test]
    fn test_disconnect_releases_request() {
        let (medium, _out) = medium(b"");
        let _stuck = medium.get_request().unwrap();
        assert!(medium.has_request_in_flight());
        medium.disconnect();
        assert!(!medium.has_request_in_flight());
    }

    #[test]
    fn test_read_line_at_eof() {
        let (medium, _out) = medium(b"partial");
        let mut request = medium.get_request().unwrap();
        request.finished_writing().unwrap();
        assert!(matches!(request.read_line(), Err(Error::ConnectionReset { .. })));
    }

    /// Counts the reads that reach the underlying stream.
    struct CountingReader {
        inner: Cursor<Vec<u8>>,
        reads: Rc<RefCell<usize>>,
    }

    impl Read for CountingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            *self.reads.borrow_mut() += 1;
            self.inner.read(buf)
        }
    }

    #[test]
    fn test_lines_are_read_in_blocks() {
        let reads = Rc::new(RefCell::new(0));
        let reader = CountingReader {
            inner: Cursor::new(b"bzr response 2\nsuccess\nok\n3\nabcdone\nnext\n".to_vec()),
            reads: Rc::clone(&reads),
        };
        let medium = ClientMedium::pipes(reader, Vec::new());
        let mut request = medium.get_request().unwrap();
        request.finished_writing().unwrap();
        assert_eq!(&request.read_line().unwrap()[..], b"bzr response 2\n");
        assert_eq!(&request.read_line().unwrap()[..], b"success\n");
        assert_eq!(&request.read_line().unwrap()[..], b"ok\n");
        assert_eq!(*reads.borrow(), 1);
        // bytes read past the last line are served before the channel
        assert_eq!(&request.read_bytes(9).unwrap()[..], b"3\nabcdone");
        assert_eq!(&request.read_bytes(1).unwrap()[..], b"\n");
        request.finished_reading().unwrap();
        assert_eq!(*reads.borrow(), 1);

        // and what belongs to the next response survives into it
        let mut next = medium.get_request().unwrap();
        next.finished_writing().unwrap();
        assert_eq!(&next.read_line().unwrap()[..], b"next\n");
    }

    #[test]
    fn test_dropped_request_frees_medium() {
        let (medium, _out) = medium(b"ok\nstale\n");
        let unused = medium.get_request().unwrap();
        drop(unused);
        assert!(!medium.has_request_in_flight());

        let mut abandoned = medium.get_request().unwrap();
        abandoned.accept_bytes(b"hello\n").unwrap();
        abandoned.finished_writing().unwrap();
        assert_eq!(&abandoned.read_line().unwrap()[..], b"ok\n");
        drop(abandoned);
        assert!(!medium.has_request_in_flight());
        assert!(medium.get_request().is_ok());
    }

    #[test]
    fn test_tcp_not_connected_and_refused() {
        let mut channel = TcpChannel::new("127.0.0.1", 1);
        assert!(matches!(channel.read(1), Err(Error::MediumNotConnected(_))));
        assert!(!channel.is_connected());

        // bind then drop to find a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut channel = TcpChannel::new("127.0.0.1", port);
        let err = channel.ensure_connection().unwrap_err();
        assert!(matches!(err, Error::Connection { ref target, .. } if *target == format!("127.0.0.1:{}", port)));
        assert!(err.to_string().starts_with("Failed to connect to 127.0.0.1:"));
    }

    #[test]
    fn test_tcp_lazy_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let echo = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let medium = ClientMedium::tcp("127.0.0.1", port);
        assert!(!medium.is_connected());
        let mut request = medium.get_request().unwrap();
        request.accept_bytes(b"hello\n").unwrap();
        assert!(medium.is_connected());
        request.finished_writing().unwrap();
        assert_eq!(&request.read_line().unwrap()[..], b"hello\n");
        request.finished_reading().unwrap();
        echo.join().unwrap();

        medium.disconnect();
        assert!(!medium.is_connected());
    }
}
