//! Shared test support: a scripted fake shell and orchestrator harness

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use kubeforge::db::{self, Database};
use kubeforge::hub::EventHub;
use kubeforge::orchestrator::Orchestrator;
use kubeforge::provision::{EventSink, ProvisionerRegistry};
use kubeforge::ssh::{CommandOutput, OnChunk, SessionFactory, ShellSession, SshError};
use kubeforge::types::{ClusterSpec, ClusterStatus, Event, EventLevel, HostSpec};

/// A canned `kubeadm init` transcript carrying both join variants
pub const INIT_TRANSCRIPT: &str = "\
Your Kubernetes control-plane has initialized successfully!

To start using your cluster, you need to run the following as a regular user:

  mkdir -p $HOME/.kube

You can now join any number of control-plane nodes by running the following command on each as root:

  kubeadm join 10.0.0.1:6443 --token abc \\
\t--discovery-token-ca-cert-hash sha256:xyz \\
\t--control-plane --certificate-key KEY

Then you can join any number of worker nodes by running the following on each as root:

kubeadm join 10.0.0.1:6443 --token abc \\
\t--discovery-token-ca-cert-hash sha256:xyz
";

pub const WORKER_JOIN_COMMAND: &str =
    "kubeadm join 10.0.0.1:6443 --token abc --discovery-token-ca-cert-hash sha256:xyz";

#[derive(Clone)]
pub struct Rule {
    /// Restrict the rule to one host address; `None` matches every host
    pub host: Option<String>,
    /// Command substring this rule responds to
    pub contains: String,
    pub stdout: String,
    pub stderr: String,
    pub code: u32,
    pub delay_ms: u64,
}

/// Scripted session factory: responses are matched by command substring,
/// every issued command is logged.
#[derive(Clone, Default)]
pub struct FakeSessions {
    rules: Arc<Mutex<Vec<Rule>>>,
    commands: Arc<Mutex<Vec<(String, String)>>>,
    refuse: Arc<Mutex<Vec<String>>>,
}

impl FakeSessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_command(&self, contains: &str, stdout: &str) {
        self.push_rule(None, contains, stdout, "", 0, 0);
    }

    pub fn fail_command(&self, host: Option<&str>, contains: &str, stderr: &str) {
        self.push_rule(host, contains, "", stderr, 1, 0);
    }

    pub fn delay_command(&self, contains: &str, stdout: &str, delay_ms: u64) {
        self.push_rule(None, contains, stdout, "", 0, delay_ms);
    }

    pub fn refuse_connections_to(&self, host: &str) {
        self.refuse.lock().unwrap().push(host.to_string());
    }

    fn push_rule(
        &self,
        host: Option<&str>,
        contains: &str,
        stdout: &str,
        stderr: &str,
        code: u32,
        delay_ms: u64,
    ) {
        self.rules.lock().unwrap().push(Rule {
            host: host.map(str::to_string),
            contains: contains.to_string(),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            code,
            delay_ms,
        });
    }

    /// Every (host, command) pair issued so far
    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn commands_for(&self, host: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c)
            .collect()
    }

    pub fn clear_command_log(&self) {
        self.commands.lock().unwrap().clear();
    }
}

#[async_trait]
impl SessionFactory for FakeSessions {
    async fn connect(
        &self,
        _ctx: &CancellationToken,
        host: &HostSpec,
    ) -> Result<Box<dyn ShellSession>, SshError> {
        if self.refuse.lock().unwrap().contains(&host.address) {
            return Err(SshError::ConnectionFailed {
                host: host.address.clone(),
                reason: "scripted connection failure".to_string(),
            });
        }

        Ok(Box::new(FakeShell {
            host: host.address.clone(),
            rules: self.rules.clone(),
            commands: self.commands.clone(),
            closed: false,
        }))
    }
}

pub struct FakeShell {
    host: String,
    rules: Arc<Mutex<Vec<Rule>>>,
    commands: Arc<Mutex<Vec<(String, String)>>>,
    closed: bool,
}

impl FakeShell {
    fn lookup(&self, command: &str) -> Option<Rule> {
        self.rules
            .lock()
            .unwrap()
            .iter()
            .find(|rule| {
                rule.host.as_deref().map_or(true, |h| h == self.host)
                    && command.contains(&rule.contains)
            })
            .cloned()
    }
}

#[async_trait]
impl ShellSession for FakeShell {
    async fn run(
        &mut self,
        ctx: &CancellationToken,
        command: &str,
    ) -> Result<CommandOutput, SshError> {
        if self.closed {
            return Err(SshError::Closed);
        }

        self.commands
            .lock()
            .unwrap()
            .push((self.host.clone(), command.to_string()));

        let rule = self.lookup(command);

        let delay = rule.as_ref().map(|r| r.delay_ms).unwrap_or(0);
        tokio::select! {
            _ = ctx.cancelled() => {
                return Err(SshError::Cancelled {
                    host: self.host.clone(),
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
        }

        match rule {
            Some(rule) if rule.code != 0 => Err(SshError::CommandFailed {
                host: self.host.clone(),
                code: rule.code,
                stdout: rule.stdout,
                stderr: rule.stderr,
            }),
            Some(rule) => Ok(CommandOutput {
                stdout: rule.stdout,
                stderr: rule.stderr,
            }),
            None => Ok(CommandOutput::default()),
        }
    }

    async fn run_streaming(
        &mut self,
        ctx: &CancellationToken,
        command: &str,
        on_chunk: OnChunk<'_>,
    ) -> Result<(), SshError> {
        let output = self.run(ctx, command).await?;
        if !output.stdout.is_empty() {
            on_chunk(output.stdout.as_bytes());
        }
        if !output.stderr.is_empty() {
            on_chunk(output.stderr.as_bytes());
        }
        Ok(())
    }

    async fn upload(
        &mut self,
        ctx: &CancellationToken,
        local: &Path,
        remote: &str,
    ) -> Result<(), SshError> {
        let command = format!("upload {} {}", local.display(), remote);
        self.run(ctx, &command).await?;
        Ok(())
    }

    async fn download(
        &mut self,
        ctx: &CancellationToken,
        remote: &str,
        local: &Path,
    ) -> Result<(), SshError> {
        let command = format!("download {} {}", remote, local.display());
        self.run(ctx, &command).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SshError> {
        self.closed = true;
        Ok(())
    }
}

/// Event sink that records emissions in memory
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub events: Arc<Mutex<Vec<(EventLevel, String, String, String)>>>,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(
        &self,
        level: EventLevel,
        host: &str,
        step: &str,
        message: &str,
        _output: Option<String>,
    ) {
        self.events.lock().unwrap().push((
            level,
            host.to_string(),
            step.to_string(),
            message.to_string(),
        ));
    }
}

pub struct Harness {
    pub db: Arc<Database>,
    pub hub: EventHub,
    pub orchestrator: Orchestrator,
    pub shutdown: CancellationToken,
}

/// In-memory database, hub and orchestrator wired to a scripted shell.
pub async fn harness(sessions: Arc<FakeSessions>) -> Harness {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    db.migrate().await.unwrap();

    let hub = EventHub::new();
    let registry = Arc::new(ProvisionerRegistry::with_defaults(sessions));
    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(db.clone(), hub.clone(), registry, shutdown.clone());

    Harness {
        db,
        hub,
        orchestrator,
        shutdown,
    }
}

pub fn host(address: &str, hostname: &str) -> HostSpec {
    HostSpec {
        hostname: hostname.to_string(),
        address: address.to_string(),
        user: "u".to_string(),
        ssh_key: None,
        ssh_key_path: Some("/k".to_string()),
        port: 22,
    }
}

pub fn spec(name: &str, control_planes: Vec<HostSpec>, workers: Vec<HostSpec>) -> ClusterSpec {
    ClusterSpec {
        name: name.to_string(),
        k8s_version: String::new(),
        pod_network_cidr: String::new(),
        service_cidr: String::new(),
        cni: None,
        container_runtime: None,
        api_server_endpoint: None,
        provider: String::new(),
        control_planes,
        workers,
    }
}

/// Poll until the cluster reaches one of `statuses`; panics after 5s.
pub async fn wait_for_status(
    db: &Database,
    cluster_id: i64,
    statuses: &[ClusterStatus],
) -> ClusterStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    loop {
        let cluster = db::clusters::get(db.pool(), cluster_id).await.unwrap();
        if statuses.contains(&cluster.status) {
            return cluster.status;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "cluster {} stuck in status {:?}",
                cluster_id, cluster.status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// All persisted events for a cluster in chronological order.
pub async fn all_events(db: &Database, cluster_id: i64) -> Vec<Event> {
    db::events::recent(db.pool(), cluster_id, 1000).await.unwrap()
}
