//! Remote execution layer
//!
//! One authenticated shell session per host, with full-capture and
//! streaming command execution, shell-piped file transfer and
//! cancellation. Production sessions speak SSH (see [`session`]); the
//! [`ShellSession`] / [`SessionFactory`] seam lets tests substitute a
//! scripted shell.

pub mod session;

pub use session::RusshSessionFactory;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::types::HostSpec;

/// Errors surfaced by remote shell sessions
#[derive(Debug, Error)]
pub enum SshError {
    /// Missing or unparseable key material, malformed host spec
    #[error("invalid host spec: {0}")]
    InvalidSpec(String),

    /// TCP, handshake or authentication failure
    #[error("connection to {host} failed: {reason}")]
    ConnectionFailed { host: String, reason: String },

    /// Remote process exited non-zero; both streams are captured in full
    #[error("command failed on {host} (exit {code}): {stderr}")]
    CommandFailed {
        host: String,
        code: u32,
        stdout: String,
        stderr: String,
    },

    /// The cancellation token fired before the remote process exited;
    /// output captured up to that point is carried along
    #[error("operation cancelled on {host}")]
    Cancelled {
        host: String,
        stdout: String,
        stderr: String,
    },

    /// The session transport was already released
    #[error("session is closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured output of a successfully completed command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Streaming output callback; receives merged stdout/stderr chunks in
/// arrival order
pub type OnChunk<'a> = &'a mut (dyn FnMut(&[u8]) + Send);

/// One authenticated channel to a single remote host
#[async_trait]
pub trait ShellSession: Send {
    /// Run `command` to completion and capture both streams in full.
    async fn run(
        &mut self,
        ctx: &CancellationToken,
        command: &str,
    ) -> Result<CommandOutput, SshError>;

    /// Run `command`, delivering output chunks as they arrive. Returns
    /// when the remote process exits.
    async fn run_streaming(
        &mut self,
        ctx: &CancellationToken,
        command: &str,
        on_chunk: OnChunk<'_>,
    ) -> Result<(), SshError>;

    /// Byte-accurate upload over a shell-piped transport.
    async fn upload(
        &mut self,
        ctx: &CancellationToken,
        local: &Path,
        remote: &str,
    ) -> Result<(), SshError>;

    /// Byte-accurate download over a shell-piped transport.
    async fn download(
        &mut self,
        ctx: &CancellationToken,
        remote: &str,
        local: &Path,
    ) -> Result<(), SshError>;

    /// Release the underlying transport. Exactly one release takes
    /// effect; operations after close fail with [`SshError::Closed`].
    async fn close(&mut self) -> Result<(), SshError>;

    /// One lightweight echo round-trip.
    async fn test_connection(&mut self, ctx: &CancellationToken) -> Result<(), SshError> {
        self.run(ctx, "echo connection-test").await?;
        Ok(())
    }

    /// Basic facts about the host as a flat map with keys `hostname`,
    /// `os`, `kernel` and `swap_enabled` ("true"/"false").
    async fn host_info(
        &mut self,
        ctx: &CancellationToken,
    ) -> Result<HashMap<String, String>, SshError> {
        let hostname = self.run(ctx, "hostname").await?.stdout.trim().to_string();

        let os = self
            .run(ctx, ". /etc/os-release 2>/dev/null && printf '%s' \"$PRETTY_NAME\"")
            .await
            .map(|out| out.stdout.trim().to_string())
            .unwrap_or_default();

        let kernel = self.run(ctx, "uname -r").await?.stdout.trim().to_string();

        let swap_lines = self
            .run(ctx, "swapon --noheadings 2>/dev/null | wc -l")
            .await?
            .stdout
            .trim()
            .parse::<i64>()
            .unwrap_or(0);

        let mut info = HashMap::new();
        info.insert("hostname".to_string(), hostname);
        info.insert("os".to_string(), os);
        info.insert("kernel".to_string(), kernel);
        info.insert("swap_enabled".to_string(), (swap_lines > 0).to_string());
        Ok(info)
    }
}

/// Opens shell sessions for hosts; the seam for substituting fakes in tests
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(
        &self,
        ctx: &CancellationToken,
        host: &HostSpec,
    ) -> Result<Box<dyn ShellSession>, SshError>;
}
