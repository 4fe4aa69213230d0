//! Error types shared by the annotate engine and the smart protocol stack.

use crate::text::Key;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A key is absent from both the annotator caches and the backing store
    #[error("Revision not present: {key}")]
    NotFound { key: Key },

    #[error("Graph contains a cycle")]
    GraphCycle,

    /// Malformed or truncated frame; fatal to the request in flight.
    /// `target` names the peer once the error reaches a medium.
    #[error("Smart protocol error{}: {reason}", from_peer(.target))]
    ProtocolFraming {
        target: Option<String>,
        reason: String,
    },

    #[error("Unexpected protocol version marker: {0}")]
    UnexpectedProtocolVersion(String),

    /// Failed to establish a channel to the peer
    #[error("Failed to connect to {target}: {reason}")]
    Connection { target: String, reason: String },

    /// The peer went away while we were waiting on it
    #[error("Connection to {target} closed: {reason}")]
    ConnectionReset { target: String, reason: String },

    #[error("Medium not connected: {0}")]
    MediumNotConnected(String),

    #[error("The request has already finished writing")]
    WritingCompleted,

    #[error("The request has not finished writing yet")]
    WritingNotComplete,

    #[error("The request has already finished reading")]
    ReadingCompleted,

    #[error("The medium already has a request in flight")]
    TooManyConcurrentRequests,

    #[error("Server does not understand method {0:?}")]
    UnknownMethod(String),

    /// Error tuple returned by the remote side
    #[error("Error received from smart server: {}", display_args(.args))]
    ErrorFromServer { args: Vec<String> },

    #[error("No such file: {path}")]
    NoSuchFile { path: String },

    #[error("File exists: {path}")]
    FileExists { path: String },

    #[error("Directory not empty: {path}")]
    DirectoryNotEmpty { path: String },

    #[error("Path escapes served root: {path}")]
    PathEscapesRoot { path: String },

    #[error("Transport is read-only")]
    ReadOnly,

    #[error("Short read from {path}: wanted {length} bytes at {offset}, got {actual}")]
    ShortReadv {
        path: String,
        offset: u64,
        length: u64,
        actual: u64,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_args(args: &[String]) -> String {
    format!("({})", args.join(", "))
}

fn from_peer(target: &Option<String>) -> String {
    target
        .as_ref()
        .map(|t| format!(" from {}", t))
        .unwrap_or_default()
}

impl Error {
    pub(crate) fn framing(msg: impl Into<String>) -> Self {
        Error::ProtocolFraming {
            target: None,
            reason: msg.into(),
        }
    }

    /// Name the peer on a framing error that does not say yet.
    pub fn with_target(self, peer: impl Into<String>) -> Self {
        match self {
            Error::ProtocolFraming {
                target: None,
                reason,
            } => Error::ProtocolFraming {
                target: Some(peer.into()),
                reason,
            },
            other => other,
        }
    }

    /// True for errors that leave the underlying channel unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. }
                | Error::ConnectionReset { .. }
                | Error::MediumNotConnected(_)
                | Error::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_names_key() {
        let err = Error::NotFound {
            key: Key::new(["file-id", "rev-3"]),
        };
        assert_eq!(err.to_string(), "Revision not present: file-id:rev-3");
    }

    #[test]
    fn test_error_from_server_display() {
        let err = Error::ErrorFromServer {
            args: vec!["NoSuchFile".into(), "missing".into()],
        };
        assert_eq!(
            err.to_string(),
            "Error received from smart server: (NoSuchFile, missing)"
        );
    }

    #[test]
    fn test_protocol_errors_name_the_peer() {
        let err = Error::framing("bad part").with_target("bzr://host:4155/");
        assert_eq!(
            err.to_string(),
            "Smart protocol error from bzr://host:4155/: bad part"
        );
        // an error that already names its peer keeps it
        let err = err.with_target("elsewhere");
        assert!(matches!(err, Error::ProtocolFraming { target: Some(ref t), .. } if t == "bzr://host:4155/"));
        assert_eq!(
            Error::framing("bad part").to_string(),
            "Smart protocol error: bad part"
        );

        let reset = Error::ConnectionReset {
            target: "pipes".into(),
            reason: "end of stream".into(),
        };
        assert_eq!(reset.to_string(), "Connection to pipes closed: end of stream");
        assert!(reset.is_connection_error());
    }

    #[test]
    fn test_connection_error_classification() {
        let err = Error::Connection {
            target: "localhost:4155".into(),
            reason: "refused".into(),
        };
        assert!(err.is_connection_error());
        assert!(!Error::WritingCompleted.is_connection_error());
    }
}
