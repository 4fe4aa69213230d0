//! High-level client: protocol negotiation, request helpers and typed VFS
//! operations on top of a [`ClientMedium`].

use super::client_medium::ClientMedium;
use super::protocol::{ClientProtocol, ClientProtocolOne, ProtocolVersion};
use super::request::translate_error;
use super::v3::ClientProtocolThree;
use super::DEFAULT_PORT;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::io::Write;
use tracing::{debug, warn};

#[cfg(feature = "ssh")]
use super::ssh::SshConfig;

/// First elements that mark a v1 response as an error.
const ERROR_TUPLE_NAMES: &[&str] = &[
    "error",
    "NoSuchFile",
    "FileExists",
    "DirectoryNotEmpty",
    "PermissionDenied",
    "ReadOnlyError",
    "ShortReadvError",
    "UnknownMethod",
];

// =============================================================================
// URLs
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `bzr://`
    Tcp,
    /// `bzr+ssh://`
    Ssh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartUrl {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl SmartUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let bad = |why: &str| Error::Config(format!("invalid URL {:?}: {}", url, why));
        let (scheme, rest) = if let Some(rest) = url.strip_prefix("bzr://") {
            (Scheme::Tcp, rest)
        } else if let Some(rest) = url.strip_prefix("bzr+ssh://") {
            (Scheme::Ssh, rest)
        } else {
            return Err(bad("expected bzr:// or bzr+ssh://"));
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (user, hostport) = match authority.rsplit_once('@') {
            Some((user, hostport)) => (Some(user.to_string()), hostport),
            None => (None, authority),
        };
        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| bad("bad port"))?;
                (host, Some(port))
            }
            None => (hostport, None),
        };
        if host.is_empty() {
            return Err(bad("missing host"));
        }
        Ok(Self {
            scheme,
            user,
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

// =============================================================================
// Client
// =============================================================================

/// Size and mode of a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub mode: u32,
}

pub struct SmartClient {
    medium: ClientMedium,
    version: Option<ProtocolVersion>,
    base: String,
}

impl SmartClient {
    /// The protocol version is negotiated on first use.
    pub fn new(medium: ClientMedium) -> Self {
        Self {
            medium,
            version: None,
            base: String::new(),
        }
    }

    /// Skip negotiation and always speak `version`.
    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// Relpaths are joined onto `base` before they are sent.
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    pub fn connect(url: &str) -> Result<Self> {
        let url = SmartUrl::parse(url)?;
        match url.scheme {
            Scheme::Tcp => {
                let medium = ClientMedium::tcp(url.host, url.port.unwrap_or(DEFAULT_PORT));
                Ok(Self::new(medium).with_base(url.path))
            }
            #[cfg(feature = "ssh")]
            Scheme::Ssh => {
                let mut config = SshConfig::new(url.host);
                if let Some(user) = url.user {
                    config.user = user;
                }
                if let Some(port) = url.port {
                    config.port = port;
                }
                Ok(Self::new(ClientMedium::ssh(config)).with_base(url.path))
            }
            #[cfg(not(feature = "ssh"))]
            Scheme::Ssh => Err(Error::Config(
                "bzr+ssh:// needs the ssh feature".to_string(),
            )),
        }
    }

    pub fn medium(&self) -> &ClientMedium {
        &self.medium
    }

    /// The version in use, negotiating it first if needed. Newer versions
    /// are tried first; a server that does not recognise one is
    /// reconnected to and asked again with the next older version.
    pub fn protocol_version(&mut self) -> Result<ProtocolVersion> {
        if let Some(version) = self.version {
            return Ok(version);
        }
        for version in [ProtocolVersion::Three, ProtocolVersion::Two, ProtocolVersion::One] {
            match self.try_version(version) {
                Ok(agreed) => {
                    debug!(version = %agreed, medium = %self.medium.describe(), "protocol negotiated");
                    self.version = Some(agreed);
                    return Ok(agreed);
                }
                Err(Error::UnexpectedProtocolVersion(marker)) => {
                    warn!(
                        version = %version,
                        reply = %marker,
                        "server does not understand protocol, reconnecting"
                    );
                    self.medium.disconnect();
                }
                Err(e) => {
                    if needs_reset(&e) {
                        self.medium.disconnect();
                    }
                    return Err(e);
                }
            }
        }
        Err(Error::framing("server speaks no known protocol version"))
    }

    fn try_version(&mut self, version: ProtocolVersion) -> Result<ProtocolVersion> {
        let request = self.medium.get_request()?;
        match version {
            ProtocolVersion::Three => {
                let mut protocol = ClientProtocolThree::new(request);
                protocol.call(&["hello"])?;
                protocol.read_response_tuple(false)?;
                Ok(ProtocolVersion::Three)
            }
            ProtocolVersion::Two => {
                ClientProtocolOne::new(request, ProtocolVersion::Two).query_version()?;
                Ok(ProtocolVersion::Two)
            }
            ProtocolVersion::One => {
                ClientProtocolOne::new(request, ProtocolVersion::One).query_version()
            }
        }
    }

    fn with_protocol<T>(
        &mut self,
        f: impl FnOnce(&mut dyn ClientProtocol, ProtocolVersion) -> Result<T>,
    ) -> Result<T> {
        let version = self.protocol_version()?;
        let request = self.medium.get_request()?;
        let mut protocol: Box<dyn ClientProtocol> = match version {
            ProtocolVersion::Three => Box::new(ClientProtocolThree::new(request)),
            v => Box::new(ClientProtocolOne::new(request, v)),
        };
        let result = f(protocol.as_mut(), version);
        if let Err(e) = &result {
            if needs_reset(e) {
                debug!(error = %e, "dropping connection after failed request");
                self.medium.disconnect();
            }
        }
        result.map_err(|e| e.with_target(self.medium.describe()))
    }

    pub fn call(&mut self, args: &[&str]) -> Result<Vec<String>> {
        self.with_protocol(|protocol, version| {
            protocol.call(args)?;
            let resp = protocol.read_response_tuple(false)?;
            check_v1_error(version, resp)
        })
    }

    pub fn call_expecting_body(&mut self, args: &[&str]) -> Result<(Vec<String>, Bytes)> {
        self.with_protocol(|protocol, version| {
            protocol.call(args)?;
            read_with_body(protocol, version)
        })
    }

    pub fn call_with_body_bytes(&mut self, args: &[&str], body: &[u8]) -> Result<Vec<String>> {
        self.with_protocol(|protocol, version| {
            protocol.call_with_body_bytes(args, body)?;
            let resp = protocol.read_response_tuple(false)?;
            check_v1_error(version, resp)
        })
    }

    pub fn call_with_body_bytes_expecting_body(
        &mut self,
        args: &[&str],
        body: &[u8],
    ) -> Result<(Vec<String>, Bytes)> {
        self.with_protocol(|protocol, version| {
            protocol.call_with_body_bytes(args, body)?;
            read_with_body(protocol, version)
        })
    }

    /// Hand each body part to `on_part` as soon as it arrives. Over v1 and
    /// v2 the whole body is a single part.
    pub fn call_expecting_body_parts<F>(&mut self, args: &[&str], mut on_part: F) -> Result<Vec<String>>
    where
        F: FnMut(Bytes) -> Result<()>,
    {
        self.with_protocol(|protocol, version| {
            protocol.call(args)?;
            let resp = protocol.read_response_tuple(true)?;
            if version == ProtocolVersion::One && is_error_tuple(&resp) {
                protocol.cancel_read_body()?;
                return Err(translate_error(resp));
            }
            while let Some(part) = protocol.read_body_part()? {
                on_part(part)?;
            }
            Ok(resp)
        })
    }

    /// Like [`call_expecting_body`](Self::call_expecting_body) but keeps
    /// the body parts as the server streamed them.
    pub fn call_expecting_body_stream(
        &mut self,
        args: &[&str],
    ) -> Result<(Vec<String>, Vec<Bytes>)> {
        let mut parts = Vec::new();
        let resp = self.call_expecting_body_parts(args, |part| {
            parts.push(part);
            Ok(())
        })?;
        Ok((resp, parts))
    }

    fn remote_path(&self, relpath: &str) -> String {
        let base = self.base.trim_end_matches('/');
        if base.is_empty() {
            relpath.to_string()
        } else {
            format!("{}/{}", base, relpath.trim_start_matches('/'))
        }
    }

    // =========================================================================
    // VFS Operations
    // =========================================================================

    pub fn hello(&mut self) -> Result<Vec<String>> {
        self.call(&["hello"])
    }

    pub fn has(&mut self, relpath: &str) -> Result<bool> {
        let path = self.remote_path(relpath);
        let resp = self.call(&["has", &path])?;
        match first(&resp) {
            "yes" => Ok(true),
            "no" => Ok(false),
            _ => Err(translate_error(resp)),
        }
    }

    pub fn get_bytes(&mut self, relpath: &str) -> Result<Bytes> {
        let path = self.remote_path(relpath);
        let (resp, body) = self.call_expecting_body(&["get", &path])?;
        expect(&resp, "ok")?;
        Ok(body)
    }

    /// Copy a remote file into `out` part by part; returns the bytes written.
    pub fn get_to<W: Write>(&mut self, relpath: &str, out: &mut W) -> Result<u64> {
        let path = self.remote_path(relpath);
        let mut written = 0u64;
        let resp = self.call_expecting_body_parts(&["get", &path], |part| {
            out.write_all(&part)?;
            written += part.len() as u64;
            Ok(())
        })?;
        expect(&resp, "ok")?;
        Ok(written)
    }

    pub fn put_bytes(&mut self, relpath: &str, data: &[u8], mode: Option<u32>) -> Result<()> {
        let path = self.remote_path(relpath);
        let mode = mode_arg(mode);
        let resp = self.call_with_body_bytes(&["put", &path, &mode], data)?;
        expect(&resp, "ok")
    }

    pub fn put_bytes_non_atomic(
        &mut self,
        relpath: &str,
        data: &[u8],
        mode: Option<u32>,
        create_parent_dir: bool,
        dir_mode: Option<u32>,
    ) -> Result<()> {
        let path = self.remote_path(relpath);
        let (mode, dir_mode) = (mode_arg(mode), mode_arg(dir_mode));
        let create = if create_parent_dir { "T" } else { "F" };
        let resp = self.call_with_body_bytes(
            &["put_non_atomic", &path, &mode, create, &dir_mode],
            data,
        )?;
        expect(&resp, "ok")
    }

    /// Returns the length of the file before the append.
    pub fn append_bytes(&mut self, relpath: &str, data: &[u8], mode: Option<u32>) -> Result<u64> {
        let path = self.remote_path(relpath);
        let mode = mode_arg(mode);
        let resp = self.call_with_body_bytes(&["append", &path, &mode], data)?;
        expect(&resp, "appended")?;
        resp.get(1)
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| translate_error(resp.clone()))
    }

    pub fn delete(&mut self, relpath: &str) -> Result<()> {
        let path = self.remote_path(relpath);
        let resp = self.call(&["delete", &path])?;
        expect(&resp, "ok")
    }

    pub fn mkdir(&mut self, relpath: &str, mode: Option<u32>) -> Result<()> {
        let path = self.remote_path(relpath);
        let mode = mode_arg(mode);
        let resp = self.call(&["mkdir", &path, &mode])?;
        expect(&resp, "ok")
    }

    pub fn rmdir(&mut self, relpath: &str) -> Result<()> {
        let path = self.remote_path(relpath);
        let resp = self.call(&["rmdir", &path])?;
        expect(&resp, "ok")
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let (from, to) = (self.remote_path(from), self.remote_path(to));
        let resp = self.call(&["rename", &from, &to])?;
        expect(&resp, "ok")
    }

    pub fn move_to(&mut self, from: &str, to: &str) -> Result<()> {
        let (from, to) = (self.remote_path(from), self.remote_path(to));
        let resp = self.call(&["move", &from, &to])?;
        expect(&resp, "ok")
    }

    pub fn list_dir(&mut self, relpath: &str) -> Result<Vec<String>> {
        let path = self.remote_path(relpath);
        let resp = self.call(&["list_dir", &path])?;
        names(resp)
    }

    pub fn iter_files_recursive(&mut self, relpath: &str) -> Result<Vec<String>> {
        let path = self.remote_path(relpath);
        let resp = self.call(&["iter_files_recursive", &path])?;
        names(resp)
    }

    pub fn stat(&mut self, relpath: &str) -> Result<RemoteStat> {
        let path = self.remote_path(relpath);
        let resp = self.call(&["stat", &path])?;
        expect(&resp, "stat")?;
        let size = resp.get(1).and_then(|s| s.parse().ok());
        let mode = resp.get(2).and_then(|m| u32::from_str_radix(m, 8).ok());
        match (size, mode) {
            (Some(size), Some(mode)) => Ok(RemoteStat { size, mode }),
            _ => Err(translate_error(resp)),
        }
    }

    /// One chunk per requested `(offset, length)`.
    pub fn readv(&mut self, relpath: &str, ranges: &[(u64, u64)]) -> Result<Vec<Bytes>> {
        let path = self.remote_path(relpath);
        let (resp, body) = self.with_protocol(|protocol, version| {
            protocol.call_with_body_readv_array(&["readv", &path], ranges)?;
            read_with_body(protocol, version)
        })?;
        expect(&resp, "readv")?;

        let mut chunks = Vec::with_capacity(ranges.len());
        let mut pos = 0usize;
        for &(_, length) in ranges {
            let end = usize::try_from(length)
                .ok()
                .and_then(|length| pos.checked_add(length))
                .filter(|end| *end <= body.len())
                .ok_or_else(|| {
                    Error::framing(format!(
                        "readv body is {} bytes, too short for {} more at {}",
                        body.len(),
                        length,
                        pos
                    ))
                    .with_target(self.medium.describe())
                })?;
            chunks.push(body.slice(pos..end));
            pos = end;
        }
        Ok(chunks)
    }

    pub fn is_readonly(&mut self) -> Result<bool> {
        let resp = self.call(&["Transport.is_readonly"])?;
        match first(&resp) {
            "yes" => Ok(true),
            "no" => Ok(false),
            _ => Err(translate_error(resp)),
        }
    }
}

fn read_with_body(
    protocol: &mut dyn ClientProtocol,
    version: ProtocolVersion,
) -> Result<(Vec<String>, Bytes)> {
    let resp = protocol.read_response_tuple(true)?;
    if version == ProtocolVersion::One && is_error_tuple(&resp) {
        protocol.cancel_read_body()?;
        return Err(translate_error(resp));
    }
    let body = protocol.read_body_bytes()?;
    Ok((resp, body))
}

/// Version one has no status line, so errors are recognised by name.
fn check_v1_error(version: ProtocolVersion, resp: Vec<String>) -> Result<Vec<String>> {
    if version == ProtocolVersion::One && is_error_tuple(&resp) {
        return Err(translate_error(resp));
    }
    Ok(resp)
}

fn is_error_tuple(resp: &[String]) -> bool {
    ERROR_TUPLE_NAMES.contains(&first(resp))
}

fn first(resp: &[String]) -> &str {
    resp.first().map(String::as_str).unwrap_or("")
}

fn expect(resp: &[String], word: &str) -> Result<()> {
    if first(resp) == word {
        Ok(())
    } else {
        Err(translate_error(resp.to_vec()))
    }
}

fn names(resp: Vec<String>) -> Result<Vec<String>> {
    if first(&resp) != "names" {
        return Err(translate_error(resp));
    }
    Ok(resp.into_iter().skip(1).collect())
}

fn mode_arg(mode: Option<u32>) -> String {
    mode.map(|m| m.to_string()).unwrap_or_default()
}

/// Errors after which the stream position is unknown.
fn needs_reset(err: &Error) -> bool {
    err.is_connection_error()
        || matches!(
            err,
            Error::ProtocolFraming { .. } | Error::UnexpectedProtocolVersion(_)
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smart::request::Response;
    use crate::smart::v3::encode_response;
    use std::io::Cursor;

    #[test]
    fn test_parse_tcp_url() {
        let url = SmartUrl::parse("bzr://example.com:4000/repo/").unwrap();
        assert_eq!(url.scheme, Scheme::Tcp);
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, Some(4000));
        assert_eq!(url.path, "/repo/");
        assert_eq!(url.user, None);

        let url = SmartUrl::parse("bzr://localhost").unwrap();
        assert_eq!(url.port, None);
        assert_eq!(url.path, "/");
    }

    #[test]
    fn test_parse_ssh_url() {
        let url = SmartUrl::parse("bzr+ssh://bob@host:2222/home/bob").unwrap();
        assert_eq!(url.scheme, Scheme::Ssh);
        assert_eq!(url.user.as_deref(), Some("bob"));
        assert_eq!(url.port, Some(2222));
        assert_eq!(url.path, "/home/bob");
    }

    #[test]
    fn test_parse_rejects_bad_urls() {
        assert!(SmartUrl::parse("http://x/").is_err());
        assert!(SmartUrl::parse("bzr://:4155/").is_err());
        assert!(SmartUrl::parse("bzr://h:notaport/").is_err());
    }

    #[test]
    fn test_remote_path() {
        let medium = ClientMedium::pipes(Cursor::new(Vec::new()), Vec::new());
        let client = SmartClient::new(medium.clone());
        assert_eq!(client.remote_path("a/b"), "a/b");
        let client = SmartClient::new(medium.clone()).with_base("/");
        assert_eq!(client.remote_path("a"), "a");
        let client = SmartClient::new(medium).with_base("/srv/repo/");
        assert_eq!(client.remote_path("/a"), "/srv/repo/a");
    }

    #[test]
    fn test_v1_error_tuple_is_translated() {
        let medium = ClientMedium::pipes(Cursor::new(b"NoSuchFile\x01f\n".to_vec()), Vec::new());
        let mut client = SmartClient::new(medium.clone()).with_protocol_version(ProtocolVersion::One);
        let err = client.get_bytes("f").unwrap_err();
        assert!(matches!(err, Error::ErrorFromServer { ref args } if args[0] == "NoSuchFile"));
        assert!(!medium.has_request_in_flight());
    }

    #[test]
    fn test_readv_rejects_lengths_past_body() {
        let response = encode_response(Response::success(["readv"]).with_body("abcde"));
        let medium = ClientMedium::pipes(Cursor::new(response.to_vec()), Vec::new());
        let mut client = SmartClient::new(medium).with_protocol_version(ProtocolVersion::Three);
        let err = client.readv("f", &[(0, 2), (2, u64::MAX)]).unwrap_err();
        assert!(matches!(
            err,
            Error::ProtocolFraming { target: Some(ref t), ref reason } if t == "pipes" && reason.contains("too short")
        ));
    }

    #[test]
    fn test_v3_readv_splits_body() {
        let response = encode_response(Response::success(["readv"]).with_body("abcde"));
        let medium = ClientMedium::pipes(Cursor::new(response.to_vec()), Vec::new());
        let mut client = SmartClient::new(medium).with_protocol_version(ProtocolVersion::Three);
        let chunks = client.readv("f", &[(0, 2), (5, 3)]).unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cde")]);
    }

    #[test]
    fn test_stat_parses_octal_mode() {
        let response = encode_response(Response::success(["stat", "12", "0100644"]));
        let medium = ClientMedium::pipes(Cursor::new(response.to_vec()), Vec::new());
        let mut client = SmartClient::new(medium).with_protocol_version(ProtocolVersion::Three);
        assert_eq!(
            client.stat("f").unwrap(),
            RemoteStat {
                size: 12,
                mode: 0o100644
            }
        );
    }
}
