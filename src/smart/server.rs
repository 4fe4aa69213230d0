//! TCP smart server: one thread per connection, each running a
//! [`ServerStreamMedium`] until the client hangs up.

use super::medium::{ServerStreamMedium, SocketChannel};
use super::request::Dispatcher;
use crate::error::{Error, Result};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

pub struct TcpServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Dispatcher,
    should_terminate: Arc<AtomicBool>,
}

impl TcpServer {
    /// Bind `host:port`; port 0 picks a free port.
    pub fn bind(host: &str, port: u16, dispatcher: Dispatcher) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).map_err(|e| Error::Connection {
            target: format!("{}:{}", host, port),
            reason: format!("cannot listen: {}", e),
        })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            dispatcher,
            should_terminate: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!(
            "bzr://{}:{}/",
            self.local_addr.ip(),
            self.local_addr.port()
        )
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            addr: self.local_addr,
            should_terminate: Arc::clone(&self.should_terminate),
        }
    }

    /// Accept connections until stopped.
    pub fn serve(&self) -> Result<()> {
        info!(url = %self.url(), "listening");
        for stream in self.listener.incoming() {
            if self.should_terminate.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => self.serve_conn(stream),
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
        info!(url = %self.url(), "stopped");
        Ok(())
    }

    fn serve_conn(&self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY");
        }
        let dispatcher = self.dispatcher.clone();
        let spawned = thread::Builder::new()
            .name("smart-server-child".into())
            .spawn(move || {
                let channel = SocketChannel::new(stream);
                let mut medium = ServerStreamMedium::new(channel, dispatcher);
                if let Err(e) = medium.serve() {
                    warn!(error = %e, "client connection failed");
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn connection thread");
        }
    }

    /// Serve on a background thread.
    pub fn start_background_thread(self) -> Result<RunningServer> {
        let url = self.url();
        let stop = self.stop_handle();
        let handle = thread::Builder::new()
            .name("smart-server".into())
            .spawn(move || self.serve())?;
        debug!(url = %url, "server thread started");
        Ok(RunningServer { url, stop, handle })
    }
}

/// Stops a server blocked in `accept` from another thread.
#[derive(Clone)]
pub struct StopHandle {
    addr: SocketAddr,
    should_terminate: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.should_terminate.store(true, Ordering::SeqCst);
        // wake the accept loop so it sees the flag
        let _ = TcpStream::connect(self.addr);
    }
}

pub struct RunningServer {
    url: String,
    stop: StopHandle,
    handle: JoinHandle<Result<()>>,
}

impl RunningServer {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn port(&self) -> u16 {
        self.stop.addr.port()
    }

    pub fn stop(self) -> Result<()> {
        self.stop.stop();
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(Error::Config("server thread panicked".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smart::request::Registry;
    use crate::smart::vfs::LocalTransport;
    use std::io::{BufRead, BufReader, Write};
    use tempfile::TempDir;

    fn dispatcher(dir: &TempDir) -> Dispatcher {
        let transport = LocalTransport::new(dir.path(), false).unwrap();
        Dispatcher::new(Arc::new(Registry::with_default_verbs()), Arc::new(transport))
    }

    #[test]
    fn test_url_uses_bound_port() {
        let dir = TempDir::new().unwrap();
        let server = TcpServer::bind("127.0.0.1", 0, dispatcher(&dir)).unwrap();
        let port = server.local_addr().port();
        assert_ne!(port, 0);
        assert_eq!(server.url(), format!("bzr://127.0.0.1:{}/", port));
    }

    #[test]
    fn test_hello_over_tcp_then_stop() {
        let dir = TempDir::new().unwrap();
        let server = TcpServer::bind("127.0.0.1", 0, dispatcher(&dir))
            .unwrap()
            .start_background_thread()
            .unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
        stream.write_all(b"hello\n").unwrap();
        let mut line = String::new();
        BufReader::new(&stream).read_line(&mut line).unwrap();
        assert_eq!(line, "ok\x012\n");

        server.stop().unwrap();
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let dir = TempDir::new().unwrap();
        let first = TcpServer::bind("127.0.0.1", 0, dispatcher(&dir)).unwrap();
        let port = first.local_addr().port();
        let err = TcpServer::bind("127.0.0.1", port, dispatcher(&dir))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Connection { .. }));
    }
}
