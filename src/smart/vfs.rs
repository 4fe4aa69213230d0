//! File operations over the served directory and the VFS verbs that expose
//! them to clients.
//!
//! Every relpath is resolved inside the root; `..` may move around within
//! it but never out of it.

use super::protocol::decode_readv_ranges;
use super::request::{arg, error_response, BodyChunk, Registry, Response, SmartRequest};
use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Files larger than this are sent as a streamed body.
const GET_CHUNK_SIZE: usize = 64 * 1024;

// =============================================================================
// Local Transport
// =============================================================================

/// A directory tree that smart requests operate on.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    root: PathBuf,
    read_only: bool,
}

impl LocalTransport {
    pub fn new(root: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let root = fs::canonicalize(root.as_ref()).map_err(|e| {
            Error::Config(format!(
                "cannot serve {}: {}",
                root.as_ref().display(),
                e
            ))
        })?;
        Ok(Self { root, read_only })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Map a relpath onto the filesystem. `""`, `"."` and `"/"` are the root.
    pub fn resolve(&self, relpath: &str) -> Result<PathBuf> {
        let rel = Path::new(relpath.trim_start_matches('/'));
        for component in rel.components() {
            if let Component::Prefix(_) | Component::RootDir = component {
                return Err(Error::PathEscapesRoot {
                    path: relpath.to_string(),
                });
            }
        }
        let full = normalize_path(&self.root.join(rel));
        if !full.starts_with(&self.root) {
            return Err(Error::PathEscapesRoot {
                path: relpath.to_string(),
            });
        }
        Ok(full)
    }

    fn writable(&self) -> Result<()> {
        if self.read_only {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub fn has(&self, relpath: &str) -> Result<bool> {
        Ok(fs::symlink_metadata(self.resolve(relpath)?).is_ok())
    }

    pub fn get(&self, relpath: &str) -> Result<Bytes> {
        let data = fs::read(self.resolve(relpath)?).map_err(|e| io_error(e, relpath))?;
        Ok(Bytes::from(data))
    }

    /// An open file and its length, for reading a piece at a time.
    pub fn open(&self, relpath: &str) -> Result<(File, u64)> {
        let file = File::open(self.resolve(relpath)?).map_err(|e| io_error(e, relpath))?;
        let meta = file.metadata()?;
        if meta.is_dir() {
            return Err(Error::Io(io::Error::other(format!(
                "{} is a directory",
                relpath
            ))));
        }
        Ok((file, meta.len()))
    }

    /// Replace `relpath` atomically via a temporary file in the same directory.
    pub fn put(&self, relpath: &str, data: &[u8], mode: Option<u32>) -> Result<()> {
        self.writable()?;
        let path = self.resolve(relpath)?;
        let tmp = temp_sibling(&path);
        let written = write_file(&tmp, data, mode).and_then(|_| fs::rename(&tmp, &path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(io_error(e, relpath));
        }
        Ok(())
    }

    pub fn put_non_atomic(
        &self,
        relpath: &str,
        data: &[u8],
        mode: Option<u32>,
        create_parent_dir: bool,
        dir_mode: Option<u32>,
    ) -> Result<()> {
        self.writable()?;
        let path = self.resolve(relpath)?;
        match write_file(&path, data, mode) {
            Err(e) if e.kind() == io::ErrorKind::NotFound && create_parent_dir => {
                if let Some(parent) = path.parent() {
                    fs::create_dir(parent).map_err(|e| io_error(e, relpath))?;
                    set_mode(parent, dir_mode).map_err(|e| io_error(e, relpath))?;
                }
                write_file(&path, data, mode).map_err(|e| io_error(e, relpath))
            }
            other => other.map_err(|e| io_error(e, relpath)),
        }
    }

    /// Append and return the length of the file before the write.
    pub fn append(&self, relpath: &str, data: &[u8], mode: Option<u32>) -> Result<u64> {
        self.writable()?;
        let path = self.resolve(relpath)?;
        let existed = path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(e, relpath))?;
        let old_len = file.metadata()?.len();
        file.write_all(data)?;
        if !existed {
            set_mode(&path, mode)?;
        }
        Ok(old_len)
    }

    pub fn delete(&self, relpath: &str) -> Result<()> {
        self.writable()?;
        fs::remove_file(self.resolve(relpath)?).map_err(|e| io_error(e, relpath))
    }

    pub fn mkdir(&self, relpath: &str, mode: Option<u32>) -> Result<()> {
        self.writable()?;
        let path = self.resolve(relpath)?;
        fs::create_dir(&path).map_err(|e| io_error(e, relpath))?;
        set_mode(&path, mode)?;
        Ok(())
    }

    pub fn rmdir(&self, relpath: &str) -> Result<()> {
        self.writable()?;
        let path = self.resolve(relpath)?;
        let mut entries = fs::read_dir(&path).map_err(|e| io_error(e, relpath))?;
        if entries.next().is_some() {
            return Err(Error::DirectoryNotEmpty {
                path: relpath.to_string(),
            });
        }
        fs::remove_dir(&path).map_err(|e| io_error(e, relpath))
    }

    /// Rename without replacing an existing file.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.writable()?;
        let target = self.resolve(to)?;
        if target.is_file() {
            return Err(Error::FileExists {
                path: to.to_string(),
            });
        }
        fs::rename(self.resolve(from)?, target).map_err(|e| io_error(e, from))
    }

    /// Rename, replacing `to` if it is a file.
    pub fn move_to(&self, from: &str, to: &str) -> Result<()> {
        self.writable()?;
        fs::rename(self.resolve(from)?, self.resolve(to)?).map_err(|e| io_error(e, from))
    }

    /// Entry names directly under `relpath`, sorted.
    pub fn list_dir(&self, relpath: &str) -> Result<Vec<String>> {
        let path = self.resolve(relpath)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&path).map_err(|e| io_error(e, relpath))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// Every file below `relpath`, as `/`-separated paths relative to it.
    pub fn iter_files_recursive(&self, relpath: &str) -> Result<Vec<String>> {
        let base = self.resolve(relpath)?;
        if !base.is_dir() {
            return Err(Error::NoSuchFile {
                path: relpath.to_string(),
            });
        }
        let mut files = Vec::new();
        let mut pending = vec![base.clone()];
        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&base) {
                    let parts: Vec<_> = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    files.push(parts.join("/"));
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Size and full mode bits (file type included).
    pub fn stat(&self, relpath: &str) -> Result<(u64, u32)> {
        let meta = fs::metadata(self.resolve(relpath)?).map_err(|e| io_error(e, relpath))?;
        Ok((meta.len(), file_mode(&meta)))
    }

    /// Read each `(offset, length)` range; a range past end of file is an error.
    pub fn readv(&self, relpath: &str, ranges: &[(u64, u64)]) -> Result<Vec<Bytes>> {
        let mut file = File::open(self.resolve(relpath)?).map_err(|e| io_error(e, relpath))?;
        let mut chunks = Vec::with_capacity(ranges.len());
        for &(offset, length) in ranges {
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = Vec::new();
            (&mut file).take(length).read_to_end(&mut buf)?;
            if (buf.len() as u64) < length {
                return Err(Error::ShortReadv {
                    path: relpath.to_string(),
                    offset,
                    length,
                    actual: buf.len() as u64,
                });
            }
            chunks.push(Bytes::from(buf));
        }
        Ok(chunks)
    }
}

/// Normalize a path without requiring it to exist.
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()))
}

fn write_file(path: &Path, data: &[u8], mode: Option<u32>) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    set_mode(path, mode)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    match mode {
        Some(mode) => fs::set_permissions(path, fs::Permissions::from_mode(mode)),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o40755
    } else {
        0o100644
    }
}

fn io_error(err: io::Error, relpath: &str) -> Error {
    let path = relpath.to_string();
    match err.kind() {
        io::ErrorKind::NotFound => Error::NoSuchFile { path },
        io::ErrorKind::AlreadyExists => Error::FileExists { path },
        _ => Error::Io(err),
    }
}

// =============================================================================
// Verbs
// =============================================================================

trait VfsVerb: SmartRequest + 'static {
    const VERB: &'static str;

    fn new(transport: Arc<LocalTransport>) -> Self;

    fn arg<'a>(&self, args: &'a [String], idx: usize) -> Result<&'a str> {
        arg(Self::VERB, args, idx)
    }
}

fn build<R: VfsVerb>(transport: Arc<LocalTransport>) -> Box<dyn SmartRequest> {
    Box::new(R::new(transport))
}

fn add<R: VfsVerb>(registry: &mut Registry) {
    registry.register(R::VERB, build::<R>);
}

pub(crate) fn register_verbs(registry: &mut Registry) {
    add::<HasRequest>(registry);
    add::<GetRequest>(registry);
    add::<AppendRequest>(registry);
    add::<DeleteRequest>(registry);
    add::<IterFilesRecursiveRequest>(registry);
    add::<ListDirRequest>(registry);
    add::<MkdirRequest>(registry);
    add::<MoveRequest>(registry);
    add::<PutRequest>(registry);
    add::<PutNonAtomicRequest>(registry);
    add::<ReadvRequest>(registry);
    add::<RenameRequest>(registry);
    add::<RmdirRequest>(registry);
    add::<StatRequest>(registry);
}

/// `""` means no explicit mode; anything else is a decimal mode.
fn optional_mode(mode: &str) -> Result<Option<u32>> {
    if mode.is_empty() {
        return Ok(None);
    }
    mode.parse()
        .map(Some)
        .map_err(|_| Error::framing(format!("bad mode {:?}", mode)))
}

fn ok() -> Result<Option<Response>> {
    Ok(Some(Response::success(["ok"])))
}

struct HasRequest(Arc<LocalTransport>);

impl VfsVerb for HasRequest {
    const VERB: &'static str = "has";

    fn new(transport: Arc<LocalTransport>) -> Self {
        Self(transport)
    }
}

impl SmartRequest for HasRequest {
    fn execute(&mut self, args: &[String]) -> Result<Option<Response>> {
        let found = self.0.has(self.arg(args, 0)?)?;
        Ok(Some(Response::success([if found { "yes" } else { "no" }])))
    }
}

struct GetRequest(Arc<LocalTransport>);

impl VfsVerb for GetRequest {
    const VERB: &'static str = "get";

    fn new(transport: Arc<LocalTransport>) -> Self {
        Self(transport)
    }
}

impl SmartRequest for GetRequest {
    fn execute(&mut self, args: &[String]) -> Result<Option<Response>> {
        let relpath = self.arg(args, 0)?;
        let (mut file, len) = self.0.open(relpath)?;
        let response = Response::success(["ok"]);
        if len <= GET_CHUNK_SIZE as u64 {
            let mut data = Vec::new();
            file.read_to_end(&mut data).map_err(|e| io_error(e, relpath))?;
            return Ok(Some(response.with_body(data)));
        }
        debug!(relpath, len, "streaming file body");
        Ok(Some(response.with_body_stream(FileChunks {
            file: Some(file),
            relpath: relpath.to_string(),
        })))
    }
}

/// Reads a file `GET_CHUNK_SIZE` bytes per `next`. A read error ends the
/// stream with an error chunk.
struct FileChunks {
    file: Option<File>,
    relpath: String,
}

impl Iterator for FileChunks {
    type Item = BodyChunk;

    fn next(&mut self) -> Option<BodyChunk> {
        let file = self.file.as_mut()?;
        let mut buf = Vec::with_capacity(GET_CHUNK_SIZE);
        match std::io::Read::by_ref(file).take(GET_CHUNK_SIZE as u64).read_to_end(&mut buf) {
            Ok(0) => {
                self.file = None;
                None
            }
            Ok(_) => Some(BodyChunk::Data(Bytes::from(buf))),
            Err(e) => {
                self.file = None;
                let err = io_error(e, &self.relpath);
                Some(BodyChunk::Error(error_response(&err).args))
            }
        }
    }
}

struct AppendRequest {
    transport: Arc<LocalTransport>,
    relpath: String,
    mode: Option<u32>,
}

impl VfsVerb for AppendRequest {
    const VERB: &'static str = "append";

    fn new(transport: Arc<LocalTransport>) -> Self {
        Self {
            transport,
            relpath: String::new(),
            mode: None,
        }
    }
}

impl SmartRequest for AppendRequest {
    fn execute(&mut self, args: &[String]) -> Result<Option<Response>> {
        self.relpath = self.arg(args, 0)?.to_string();
        self.mode = optional_mode(self.arg(args, 1)?)?;
        Ok(None)
    }

    fn do_body(&mut self, body: Bytes) -> Result<Response> {
        let old_len = self.transport.append(&self.relpath, &body, self.mode)?;
        Ok(Response::success(["appended".to_string(), old_len.to_string()]))
    }
}

struct DeleteRequest(Arc<LocalTransport>);

impl VfsVerb for DeleteRequest {
    const VERB: &'static str = "delete";

    fn new(transport: Arc<LocalTransport>) -> Self {
        Self(transport)
    }
}

impl SmartRequest for DeleteRequest {
    fn execute(&mut self, args: &[String]) -> Result<Option<Response>> {
        self.0.delete(self.arg(args, 0)?)?;
        ok()
    }
}

struct IterFilesRecursiveRequest(Arc<LocalTransport>);

impl VfsVerb for IterFilesRecursiveRequest {
    const VERB: &'static str = "iter_files_recursive";

    fn new(transport: Arc<LocalTransport>) -> Self {
        Self(transport)
    }
}

impl SmartRequest for IterFilesRecursiveRequest {
    fn execute(&mut self, args: &[String]) -> Result<Option<Response>> {
        let relpath = args.first().map(String::as_str).unwrap_or("");
        let names = self.0.iter_files_recursive(relpath)?;
        Ok(Some(Response::success(
            std::iter::once("names".to_string()).chain(names),
        )))
    }
}

struct ListDirRequest(Arc<LocalTransport>);

impl VfsVerb for ListDirRequest {
    const VERB: &'static str = "list_dir";

    fn new(transport: Arc<LocalTransport>) -> Self {
        Self(transport)
    }
}

impl SmartRequest for ListDirRequest {
    fn execute(&mut self, args: &[String]) -> Result<Option<Response>> {
        let names = self.0.list_dir(self.arg(args, 0)?)?;
        Ok(Some(Response::success(
            std::iter::once("names".to_string()).chain(names),
        )))
    }
}

struct MkdirRequest(Arc<LocalTransport>);

impl VfsVerb for MkdirRequest {
    const VERB: &'static str = "mkdir";

    fn new(transport: Arc<LocalTransport>) -> Self {
        Self(transport)
    }
}

impl SmartRequest for MkdirRequest {
    fn execute(&mut self, args: &[String]) -> Result<Option<Response>> {
        let mode = optional_mode(args.get(1).map(String::as_str).unwrap_or(""))?;
        self.0.mkdir(self.arg(args, 0)?, mode)?;
        ok()
    }
}

struct MoveRequest(Arc<LocalTransport>);

impl VfsVerb for MoveRequest {
    const VERB: &'static str = "move";

    fn new(transport: Arc<LocalTransport>) -> Self {
        Self(transport)
    }
}

impl SmartRequest for MoveRequest {
    fn execute(&mut self, args: &[String]) -> Result<Option<Response>> {
        self.0.move_to(self.arg(args, 0)?, self.arg(args, 1)?)?;
        ok()
    }
}

struct PutRequest {
    transport: Arc<LocalTransport>,
    relpath: String,
    mode: Option<u32>,
}

impl VfsVerb for PutRequest {
    const VERB: &'static str = "put";

    fn new(transport: Arc<LocalTransport>) -> Self {
        Self {
            transport,
            relpath: String::new(),
            mode: None,
        }
    }
}

impl SmartRequest for PutRequest {
    fn execute(&mut self, args: &[String]) -> Result<Option<Response>> {
        self.relpath = self.arg(args, 0)?.to_string();
        self.mode = optional_mode(args.get(1).map(String::as_str).unwrap_or(""))?;
        Ok(None)
    }

    fn do_body(&mut self, body: Bytes) -> Result<Response> {
        debug!(path = %self.relpath, len = body.len(), "put");
        self.transport.put(&self.relpath, &body, self.mode)?;
        Ok(Response::success(["ok"]))
    }
}

struct PutNonAtomicRequest {
    transport: Arc<LocalTransport>,
    relpath: String,
    mode: Option<u32>,
    create_parent_dir: bool,
    dir_mode: Option<u32>,
}

impl VfsVerb for PutNonAtomicRequest {
    const VERB: &'static str = "put_non_atomic";

    fn new(transport: Arc<LocalTransport>) -> Self {
        Self {
            transport,
            relpath: String::new(),
            mode: None,
            create_parent_dir: false,
            dir_mode: None,
        }
    }
}

impl SmartRequest for PutNonAtomicRequest {
    fn execute(&mut self, args: &[String]) -> Result<Option<Response>> {
        self.relpath = self.arg(args, 0)?.to_string();
        self.mode = optional_mode(self.arg(args, 1)?)?;
        self.create_parent_dir = self.arg(args, 2)? == "T";
        self.dir_mode = optional_mode(self.arg(args, 3)?)?;
        Ok(None)
    }

    fn do_body(&mut self, body: Bytes) -> Result<Response> {
        self.transport.put_non_atomic(
            &self.relpath,
            &body,
            self.mode,
            self.create_parent_dir,
            self.dir_mode,
        )?;
        Ok(Response::success(["ok"]))
    }
}

struct ReadvRequest {
    transport: Arc<LocalTransport>,
    relpath: String,
}

impl VfsVerb for ReadvRequest {
    const VERB: &'static str = "readv";

    fn new(transport: Arc<LocalTransport>) -> Self {
        Self {
            transport,
            relpath: String::new(),
        }
    }
}

impl SmartRequest for ReadvRequest {
    fn execute(&mut self, args: &[String]) -> Result<Option<Response>> {
        self.relpath = self.arg(args, 0)?.to_string();
        Ok(None)
    }

    fn do_body(&mut self, body: Bytes) -> Result<Response> {
        let ranges = decode_readv_ranges(&body)?;
        let chunks = self.transport.readv(&self.relpath, &ranges)?;
        let mut data = BytesMut::new();
        for chunk in chunks {
            data.extend_from_slice(&chunk);
        }
        Ok(Response::success(["readv"]).with_body(data.freeze()))
    }
}

struct RenameRequest(Arc<LocalTransport>);

impl VfsVerb for RenameRequest {
    const VERB: &'static str = "rename";

    fn new(transport: Arc<LocalTransport>) -> Self {
        Self(transport)
    }
}

impl SmartRequest for RenameRequest {
    fn execute(&mut self, args: &[String]) -> Result<Option<Response>> {
        self.0.rename(self.arg(args, 0)?, self.arg(args, 1)?)?;
        ok()
    }
}

struct RmdirRequest(Arc<LocalTransport>);

impl VfsVerb for RmdirRequest {
    const VERB: &'static str = "rmdir";

    fn new(transport: Arc<LocalTransport>) -> Self {
        Self(transport)
    }
}

impl SmartRequest for RmdirRequest {
    fn execute(&mut self, args: &[String]) -> Result<Option<Response>> {
        self.0.rmdir(self.arg(args, 0)?)?;
        ok()
    }
}

struct StatRequest(Arc<LocalTransport>);

impl VfsVerb for StatRequest {
    const VERB: &'static str = "stat";

    fn new(transport: Arc<LocalTransport>) -> Self {
        Self(transport)
    }
}

impl SmartRequest for StatRequest {
    fn execute(&mut self, args: &[String]) -> Result<Option<Response>> {
        let (size, mode) = self.0.stat(self.arg(args, 0)?)?;
        Ok(Some(Response::success([
            "stat".to_string(),
            size.to_string(),
            format!("0{:o}", mode),
        ])))
    }
}
