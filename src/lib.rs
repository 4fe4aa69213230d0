//! medley: a smart-protocol file server/client and a patience-diff based
//! annotate and merge engine.
//!
//! - [`smart`]: wire protocol versions 1 to 3, server and client mediums
//!   over TCP, SSH and pipes, and the VFS request verbs
//! - [`text`]: patience matching, per-line annotation over a versioned
//!   file store, reannotation and three-way merge

pub mod config;
pub mod error;
pub mod smart;
pub mod text;

pub use error::{Error, Result};
