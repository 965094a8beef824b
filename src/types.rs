//! Core types for KubeForge
//!
//! Cluster, node, event and job records plus the request-time
//! specifications submitted through the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default Kubernetes version installed when the spec leaves it empty
pub const DEFAULT_K8S_VERSION: &str = "1.28.0";
/// Default pod network CIDR
pub const DEFAULT_POD_NETWORK_CIDR: &str = "10.244.0.0/16";
/// Default service CIDR
pub const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/12";
/// Default provisioning strategy
pub const DEFAULT_PROVIDER: &str = "kubeadm";
/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default SSH user
pub const DEFAULT_SSH_USER: &str = "root";

/// Lifecycle status of a managed cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    /// Accepted but provisioning has not started
    Pending,
    /// Provisioning in progress
    Provisioning,
    /// Fully provisioned and reachable
    Ready,
    /// Provisioning failed
    Failed,
    /// Being torn down
    Destroying,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Destroying => "destroying",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "provisioning" => Self::Provisioning,
            "ready" => Self::Ready,
            "failed" => Self::Failed,
            "destroying" => Self::Destroying,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a host within a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ControlPlane,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ControlPlane => "control-plane",
            Self::Worker => "worker",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "control-plane" => Self::ControlPlane,
            _ => Self::Worker,
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Provisioning,
    Ready,
    NotReady,
    Unknown,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::NotReady => "notready",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "provisioning" => Self::Provisioning,
            "ready" => Self::Ready,
            "notready" => Self::NotReady,
            _ => Self::Unknown,
        }
    }
}

/// Severity of a provisioning event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// Kind of asynchronous operation tracked by a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    Provision,
    Destroy,
    AddNode,
    RemoveNode,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Destroy => "destroy",
            Self::AddNode => "add-node",
            Self::RemoveNode => "remove-node",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "destroy" => Self::Destroy,
            "add-node" => Self::AddNode,
            "remove-node" => Self::RemoveNode,
            _ => Self::Provision,
        }
    }
}

/// Status of an asynchronous job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    /// A terminal job no longer blocks new jobs for its cluster
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Pod network plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CniPlugin {
    Calico,
    Flannel,
    Weave,
    /// Reserved, not yet installable
    Cilium,
}

impl Default for CniPlugin {
    fn default() -> Self {
        Self::Calico
    }
}

impl CniPlugin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calico => "calico",
            Self::Flannel => "flannel",
            Self::Weave => "weave",
            Self::Cilium => "cilium",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "flannel" => Self::Flannel,
            "weave" => Self::Weave,
            "cilium" => Self::Cilium,
            _ => Self::Calico,
        }
    }
}

impl std::fmt::Display for CniPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node-level container runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerRuntime {
    Containerd,
    /// Reserved, not yet installable
    CriO,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::Containerd
    }
}

impl ContainerRuntime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Containerd => "containerd",
            Self::CriO => "cri-o",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "cri-o" => Self::CriO,
            _ => Self::Containerd,
        }
    }
}

impl std::fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A managed Kubernetes cluster
///
/// The credential fields are never serialized into API views.
#[derive(Debug, Clone, Serialize)]
pub struct Cluster {
    pub id: i64,
    pub name: String,
    pub k8s_version: String,
    pub pod_network_cidr: String,
    pub service_cidr: String,
    pub cni: CniPlugin,
    pub container_runtime: ContainerRuntime,
    pub api_server_endpoint: Option<String>,
    pub provider: String,
    pub status: ClusterStatus,
    #[serde(skip_serializing)]
    pub kubeconfig: Vec<u8>,
    #[serde(skip_serializing)]
    pub join_command: String,
    #[serde(skip_serializing)]
    pub certificate_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A host participating in a cluster
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: i64,
    pub cluster_id: i64,
    pub hostname: String,
    pub address: String,
    pub ssh_user: String,
    pub ssh_key_path: Option<String>,
    pub ssh_port: u16,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub k8s_version: Option<String>,
}

/// One observation emitted during provisioning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub cluster_id: i64,
    /// Milliseconds since the Unix epoch; (timestamp, id) is the canonical order
    pub timestamp: i64,
    pub level: EventLevel,
    /// Host address the event concerns, or `localhost` for orchestrator-originated events
    pub host: String,
    /// Short stable tag. Orchestrator milestones use prepare, bootstrap,
    /// cni, join, reset, complete and error; host preparation sub-steps
    /// use probe, swap, modules, sysctl, runtime and tools.
    pub step: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// One asynchronous operation on a cluster
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub cluster_id: i64,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: u8,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Request-time description of one SSH-reachable host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSpec {
    #[serde(default)]
    pub hostname: String,
    pub address: String,
    #[serde(default)]
    pub user: String,
    /// Inline private key material
    #[serde(default)]
    pub ssh_key: Option<String>,
    /// Path to a private key file on the server
    #[serde(default)]
    pub ssh_key_path: Option<String>,
    #[serde(default)]
    pub port: u16,
}

impl HostSpec {
    /// Fill in omitted fields with their defaults
    pub fn normalize(&mut self) {
        if self.user.is_empty() {
            self.user = DEFAULT_SSH_USER.to_string();
        }
        if self.port == 0 {
            self.port = DEFAULT_SSH_PORT;
        }
        if self.hostname.is_empty() {
            self.hostname = self.address.clone();
        }
    }

    pub fn has_key_material(&self) -> bool {
        self.ssh_key.as_deref().is_some_and(|k| !k.is_empty())
            || self.ssh_key_path.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Request-time description of a desired cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    #[serde(default)]
    pub k8s_version: String,
    #[serde(default)]
    pub pod_network_cidr: String,
    #[serde(default)]
    pub service_cidr: String,
    #[serde(default)]
    pub cni: Option<CniPlugin>,
    #[serde(default)]
    pub container_runtime: Option<ContainerRuntime>,
    /// Virtual address for a highly available API server
    #[serde(default)]
    pub api_server_endpoint: Option<String>,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub control_planes: Vec<HostSpec>,
    #[serde(default)]
    pub workers: Vec<HostSpec>,
}

impl ClusterSpec {
    /// Provider tag used for registry lookup, defaulted before validation
    pub fn provider_tag(&self) -> &str {
        if self.provider.is_empty() {
            DEFAULT_PROVIDER
        } else {
            &self.provider
        }
    }

    pub fn cni(&self) -> CniPlugin {
        self.cni.unwrap_or_default()
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.container_runtime.unwrap_or_default()
    }

    /// All hosts, control planes first
    pub fn all_hosts(&self) -> Vec<HostSpec> {
        self.control_planes
            .iter()
            .chain(self.workers.iter())
            .cloned()
            .collect()
    }
}

/// Artifacts produced by bootstrapping the first control plane
#[derive(Debug, Clone)]
pub struct BootstrapResult {
    pub kubeconfig: Vec<u8>,
    pub join_command: String,
    pub certificate_key: String,
}

/// Cluster view with its nodes and recent events
#[derive(Debug, Clone, Serialize)]
pub struct ClusterDetail {
    #[serde(flatten)]
    pub cluster: Cluster,
    pub nodes: Vec<Node>,
    pub events: Vec<Event>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cluster() -> Cluster {
        Cluster {
            id: 1,
            name: "c1".to_string(),
            k8s_version: DEFAULT_K8S_VERSION.to_string(),
            pod_network_cidr: DEFAULT_POD_NETWORK_CIDR.to_string(),
            service_cidr: DEFAULT_SERVICE_CIDR.to_string(),
            cni: CniPlugin::Calico,
            container_runtime: ContainerRuntime::Containerd,
            api_server_endpoint: None,
            provider: DEFAULT_PROVIDER.to_string(),
            status: ClusterStatus::Ready,
            kubeconfig: b"apiVersion: v1".to_vec(),
            join_command: "kubeadm join 10.0.0.1:6443 --token t".to_string(),
            certificate_key: "deadbeef".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_cluster_view_hides_secrets() {
        let json = serde_json::to_string(&sample_cluster()).unwrap();
        assert!(!json.contains("kubeconfig"));
        assert!(!json.contains("join_command"));
        assert!(!json.contains("certificate_key"));
        assert!(json.contains("\"name\":\"c1\""));
    }

    #[test]
    fn test_cluster_detail_hides_secrets() {
        let detail = ClusterDetail {
            cluster: sample_cluster(),
            nodes: Vec::new(),
            events: Vec::new(),
        };
        let json = serde_json::to_string(&detail).unwrap();
        assert!(!json.contains("kubeconfig"));
        assert!(!json.contains("join_command"));
        assert!(!json.contains("certificate_key"));
    }

    #[test]
    fn test_host_spec_normalization() {
        let mut host = HostSpec {
            hostname: String::new(),
            address: "10.0.0.1".to_string(),
            user: String::new(),
            ssh_key: None,
            ssh_key_path: Some("/k".to_string()),
            port: 0,
        };
        host.normalize();
        assert_eq!(host.user, "root");
        assert_eq!(host.port, 22);
        assert_eq!(host.hostname, "10.0.0.1");
        assert!(host.has_key_material());
    }

    #[test]
    fn test_status_round_trips() {
        for status in [
            ClusterStatus::Pending,
            ClusterStatus::Provisioning,
            ClusterStatus::Ready,
            ClusterStatus::Failed,
            ClusterStatus::Destroying,
        ] {
            assert_eq!(ClusterStatus::parse(status.as_str()), status);
        }
        for status in [
            NodeStatus::Provisioning,
            NodeStatus::Ready,
            NodeStatus::NotReady,
            NodeStatus::Unknown,
        ] {
            assert_eq!(NodeStatus::parse(status.as_str()), status);
        }
        assert_eq!(NodeStatus::NotReady.as_str(), "notready");
    }

    #[test]
    fn test_job_status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_job_type_serialization() {
        assert_eq!(
            serde_json::to_string(&JobType::AddNode).unwrap(),
            "\"add-node\""
        );
        assert_eq!(JobType::parse("remove-node"), JobType::RemoveNode);
    }
}
