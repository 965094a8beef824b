//! SSH shell session backed by russh
//!
//! Host-key verification is accept-all; a production deployment needs a
//! trust policy before exposing this to untrusted networks.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use russh_keys::key;
use tokio_util::sync::CancellationToken;

use super::{CommandOutput, OnChunk, SessionFactory, ShellSession, SshError};
use crate::types::HostSpec;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens [`SshSession`]s over the network
#[derive(Debug, Default, Clone)]
pub struct RusshSessionFactory;

impl RusshSessionFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionFactory for RusshSessionFactory {
    async fn connect(
        &self,
        ctx: &CancellationToken,
        host: &HostSpec,
    ) -> Result<Box<dyn ShellSession>, SshError> {
        let session = SshSession::connect(ctx, host).await?;
        Ok(Box::new(session))
    }
}

struct AcceptAll;

#[async_trait]
impl client::Handler for AcceptAll {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// One authenticated SSH connection to a single host
pub struct SshSession {
    handle: Handle<AcceptAll>,
    host: String,
    closed: bool,
}

impl SshSession {
    /// Load the key material, open the TCP connection and authenticate.
    pub async fn connect(ctx: &CancellationToken, host: &HostSpec) -> Result<Self, SshError> {
        let keypair = load_key(host).await?;

        let config = Arc::new(client::Config::default());
        let address = (host.address.as_str(), host.port);

        let connect = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(config, address, AcceptAll),
        );

        let mut handle = tokio::select! {
            _ = ctx.cancelled() => {
                return Err(SshError::Cancelled {
                    host: host.address.clone(),
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
            result = connect => result
                .map_err(|_| SshError::ConnectionFailed {
                    host: host.address.clone(),
                    reason: format!("connect timed out after {}s", CONNECT_TIMEOUT.as_secs()),
                })?
                .map_err(|e| SshError::ConnectionFailed {
                    host: host.address.clone(),
                    reason: e.to_string(),
                })?,
        };

        let authenticated = handle
            .authenticate_publickey(host.user.clone(), Arc::new(keypair))
            .await
            .map_err(|e| SshError::ConnectionFailed {
                host: host.address.clone(),
                reason: e.to_string(),
            })?;

        if !authenticated {
            return Err(SshError::ConnectionFailed {
                host: host.address.clone(),
                reason: format!("public key authentication rejected for user '{}'", host.user),
            });
        }

        Ok(Self {
            handle,
            host: host.address.clone(),
            closed: false,
        })
    }

    async fn open_channel(&mut self) -> Result<Channel<Msg>, SshError> {
        if self.closed {
            return Err(SshError::Closed);
        }

        self.handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::ConnectionFailed {
                host: self.host.clone(),
                reason: e.to_string(),
            })
    }

    /// Pump channel messages until the remote process exits, delivering
    /// output through `on_output`. Signals the remote process and bails
    /// out when the token fires.
    async fn drive_channel(
        &self,
        ctx: &CancellationToken,
        channel: &mut Channel<Msg>,
        on_output: &mut (dyn FnMut(bool, &[u8]) + Send),
    ) -> Result<u32, SshError> {
        let mut exit_code = 0u32;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    let _ = channel.signal(Sig::TERM).await;
                    let _ = channel.close().await;
                    return Err(SshError::Cancelled {
                        host: self.host.clone(),
                        stdout: String::new(),
                        stderr: String::new(),
                    });
                }
                msg = channel.wait() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        ChannelMsg::Data { ref data } => on_output(false, data),
                        ChannelMsg::ExtendedData { ref data, ext: 1 } => on_output(true, data),
                        ChannelMsg::ExitStatus { exit_status } => exit_code = exit_status,
                        _ => {}
                    }
                }
            }
        }

        Ok(exit_code)
    }

    async fn exec(
        &mut self,
        ctx: &CancellationToken,
        command: &str,
        on_output: &mut (dyn FnMut(bool, &[u8]) + Send),
    ) -> Result<u32, SshError> {
        let mut channel = self.open_channel().await?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ConnectionFailed {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;

        self.drive_channel(ctx, &mut channel, on_output).await
    }
}

#[async_trait]
impl ShellSession for SshSession {
    async fn run(
        &mut self,
        ctx: &CancellationToken,
        command: &str,
    ) -> Result<CommandOutput, SshError> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let result = self
            .exec(ctx, command, &mut |is_stderr, data| {
                if is_stderr {
                    stderr.extend_from_slice(data);
                } else {
                    stdout.extend_from_slice(data);
                }
            })
            .await;

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        match result {
            Ok(0) => Ok(CommandOutput { stdout, stderr }),
            Ok(code) => Err(SshError::CommandFailed {
                host: self.host.clone(),
                code,
                stdout,
                stderr,
            }),
            Err(SshError::Cancelled { host, .. }) => Err(SshError::Cancelled {
                host,
                stdout,
                stderr,
            }),
            Err(e) => Err(e),
        }
    }

    async fn run_streaming(
        &mut self,
        ctx: &CancellationToken,
        command: &str,
        on_chunk: OnChunk<'_>,
    ) -> Result<(), SshError> {
        let mut stderr = Vec::new();

        let result = self
            .exec(ctx, command, &mut |is_stderr, data| {
                if is_stderr {
                    stderr.extend_from_slice(data);
                }
                on_chunk(data);
            })
            .await;

        match result {
            Ok(0) => Ok(()),
            Ok(code) => Err(SshError::CommandFailed {
                host: self.host.clone(),
                code,
                stdout: String::new(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn upload(
        &mut self,
        ctx: &CancellationToken,
        local: &Path,
        remote: &str,
    ) -> Result<(), SshError> {
        let data = tokio::fs::read(local).await?;

        let command = format!("cat > {}", shell_quote(remote));
        let mut channel = self.open_channel().await?;
        channel
            .exec(true, command.as_str())
            .await
            .map_err(|e| SshError::ConnectionFailed {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;

        channel
            .data(&data[..])
            .await
            .map_err(|e| SshError::ConnectionFailed {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;
        channel.eof().await.map_err(|e| SshError::ConnectionFailed {
            host: self.host.clone(),
            reason: e.to_string(),
        })?;

        let mut stderr = Vec::new();
        let code = self
            .drive_channel(ctx, &mut channel, &mut |is_stderr, data| {
                if is_stderr {
                    stderr.extend_from_slice(data);
                }
            })
            .await?;

        if code != 0 {
            return Err(SshError::CommandFailed {
                host: self.host.clone(),
                code,
                stdout: String::new(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }

        Ok(())
    }

    async fn download(
        &mut self,
        ctx: &CancellationToken,
        remote: &str,
        local: &Path,
    ) -> Result<(), SshError> {
        let mut contents = Vec::new();
        let mut stderr = Vec::new();

        let code = self
            .exec(
                ctx,
                &format!("cat {}", shell_quote(remote)),
                &mut |is_stderr, data| {
                    if is_stderr {
                        stderr.extend_from_slice(data);
                    } else {
                        contents.extend_from_slice(data);
                    }
                },
            )
            .await?;

        if code != 0 {
            return Err(SshError::CommandFailed {
                host: self.host.clone(),
                code,
                stdout: String::new(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }

        tokio::fs::write(local, contents).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SshError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| SshError::ConnectionFailed {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

}

/// Load and parse the private key named by the host spec.
async fn load_key(host: &HostSpec) -> Result<key::KeyPair, SshError> {
    let material = match (&host.ssh_key, &host.ssh_key_path) {
        (Some(inline), _) if !inline.is_empty() => inline.clone(),
        (_, Some(path)) if !path.is_empty() => tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SshError::InvalidSpec(format!("failed to read SSH key '{}': {}", path, e)))?,
        _ => {
            return Err(SshError::InvalidSpec(format!(
                "host '{}' has no SSH key material",
                host.address
            )));
        }
    };

    russh_keys::decode_secret_key(&material, None)
        .map_err(|e| SshError::InvalidSpec(format!("failed to parse SSH private key: {}", e)))
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
