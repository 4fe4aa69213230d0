//! Smart protocol: a request/response RPC for remote file access, spoken
//! over TCP, SSH or a pair of pipes.
//!
//! Three framings share one server. The first line a client sends decides
//! which one a request uses:
//!
//! - v1: bare argument tuple, e.g. `hello\n`
//! - v2: `bzr request 2\n` then a v1 request; responses carry a status line
//! - v3: `bzr message 3 (bzr 1.6)\n` then headers and typed message parts

pub mod bencode;
pub mod client;
pub mod client_medium;
pub mod medium;
pub mod message;
pub mod protocol;
pub mod request;
pub mod server;
#[cfg(feature = "ssh")]
pub mod ssh;
pub mod v3;
pub mod vfs;

pub use client::{RemoteStat, Scheme, SmartClient, SmartUrl};
pub use client_medium::{ClientChannel, ClientMedium, ClientRequest, TcpChannel};
pub use medium::{ServerChannel, ServerStreamMedium, SocketChannel};
pub use protocol::{identify_protocol_version, ProtocolVersion, ServerProtocol};
pub use request::{Dispatcher, Registry, RequestHandler, Response, SmartRequest};
pub use server::{RunningServer, StopHandle, TcpServer};
#[cfg(feature = "ssh")]
pub use ssh::SshConfig;
pub use vfs::LocalTransport;

use crate::error::Result;
use std::io::{Read, Write};

pub const REQUEST_VERSION_TWO: &[u8] = b"bzr request 2\n";
pub const RESPONSE_VERSION_TWO: &[u8] = b"bzr response 2\n";
pub const MESSAGE_VERSION_THREE: &[u8] = b"bzr message 3 (bzr 1.6)\n";

pub const DEFAULT_PORT: u16 = 4155;
pub const DEFAULT_INTERFACE: &str = "0.0.0.0";

/// Serve requests from `reader`, answering on `writer`, until end of input.
pub fn serve_pipes<R: Read, W: Write>(reader: R, writer: W, dispatcher: Dispatcher) -> Result<()> {
    let channel = medium::PipeChannel::new(reader, writer);
    ServerStreamMedium::new(channel, dispatcher).serve()
}
