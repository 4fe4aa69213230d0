//! SSH channel: runs `medley serve --inet` on the remote host through the
//! system `ssh` binary and talks to it over the child's stdin/stdout.

use super::client_medium::{read_up_to, ClientChannel};
use crate::error::{Error, Result};
use bytes::Bytes;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::{debug, warn};

/// Overrides the program started on the remote host.
pub const REMOTE_PATH_ENV: &str = "MEDLEY_REMOTE_PATH";

const DEFAULT_REMOTE_COMMAND: &str = "medley";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub hostname: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Vec<PathBuf>,
    pub remote_command: String,
}

impl SshConfig {
    /// Defaults: the local user, port 22, `$MEDLEY_REMOTE_PATH` or `medley`.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            user: whoami::username(),
            port: 22,
            identity_file: Vec::new(),
            remote_command: std::env::var(REMOTE_PATH_ENV)
                .unwrap_or_else(|_| DEFAULT_REMOTE_COMMAND.to_string()),
        }
    }

    /// The `ssh` invocation that starts a server on the remote end.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new("ssh");

        cmd.arg(&self.hostname);

        if !self.user.is_empty() {
            cmd.arg("-l").arg(&self.user);
        }

        if self.port != 22 {
            cmd.arg("-p").arg(self.port.to_string());
        }

        for key in &self.identity_file {
            cmd.arg("-i").arg(key);
        }

        cmd.arg(&self.remote_command);
        cmd.args(["serve", "--inet", "--directory=/", "--allow-writes"]);

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd
    }

    fn target(&self) -> String {
        format!("ssh://{}@{}:{}", self.user, self.hostname, self.port)
    }
}

struct SshSession {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: ChildStdout,
}

pub struct SshChannel {
    config: SshConfig,
    session: Option<SshSession>,
}

impl SshChannel {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    fn session(&mut self) -> Result<&mut SshSession> {
        let target = self.config.target();
        self.session
            .as_mut()
            .ok_or(Error::MediumNotConnected(target))
    }
}

impl ClientChannel for SshChannel {
    fn ensure_connection(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let connect_error = |reason: String| Error::Connection {
            target: self.config.target(),
            reason,
        };
        let mut child = self
            .config
            .command()
            .spawn()
            .map_err(|e| connect_error(format!("failed to spawn ssh: {}", e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| connect_error("failed to open stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| connect_error("failed to open stdout".into()))?;
        debug!(target_addr = %self.config.target(), "ssh session started");
        self.session = Some(SshSession {
            child,
            stdin: BufWriter::new(stdin),
            stdout,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.session()?.stdin.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.session()?.stdin.flush()?;
        Ok(())
    }

    fn read(&mut self, count: usize) -> Result<Bytes> {
        read_up_to(&mut self.session()?.stdout, count)
    }

    fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let SshSession {
            mut child,
            stdin,
            stdout,
        } = session;
        // closing stdin ends `serve --inet` on the far side
        drop(stdin);
        drop(stdout);
        if let Err(e) = child.wait() {
            warn!(error = %e, "failed to reap ssh process");
        }
    }

    fn describe(&self) -> String {
        self.config.target()
    }
}

impl Drop for SshChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(config: &SshConfig) -> Vec<String> {
        config
            .command()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_default_port_is_omitted() {
        let config = SshConfig {
            hostname: "example.com".into(),
            user: "alice".into(),
            port: 22,
            identity_file: vec![],
            remote_command: "medley".into(),
        };
        assert_eq!(
            args(&config),
            vec![
                "example.com",
                "-l",
                "alice",
                "medley",
                "serve",
                "--inet",
                "--directory=/",
                "--allow-writes"
            ]
        );
    }

    #[test]
    fn test_port_and_identity_files() {
        let config = SshConfig {
            hostname: "h".into(),
            user: String::new(),
            port: 2222,
            identity_file: vec![PathBuf::from("/k1"), PathBuf::from("/k2")],
            remote_command: "/opt/medley".into(),
        };
        let got = args(&config);
        assert_eq!(&got[..7], ["h", "-p", "2222", "-i", "/k1", "-i", "/k2"]);
        assert_eq!(got[7], "/opt/medley");
    }

    #[test]
    fn test_not_connected() {
        let mut channel = SshChannel::new(SshConfig::new("localhost"));
        assert!(!channel.is_connected());
        assert!(matches!(channel.read(1), Err(Error::MediumNotConnected(_))));
        channel.disconnect();
    }
}
