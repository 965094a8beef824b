//! Cluster provisioning strategies
//!
//! A [`Provisioner`] turns a validated cluster specification into a
//! running cluster by driving remote hosts. Strategies are looked up in
//! a [`ProvisionerRegistry`] by provider tag; kubeadm is the one
//! implemented today, with k3s and kind as candidates for later.

pub mod error;
pub mod kubeadm;
pub mod prepare;

pub use error::{db_err, ProvisionError, ProvisionResult};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::types::{BootstrapResult, ClusterSpec, CniPlugin, ContainerRuntime, EventLevel, HostSpec};

/// Receives provisioning events for persistence and fan-out.
///
/// Emission never fails the operation that produced the event; sinks log
/// and carry on when persistence misbehaves.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(
        &self,
        level: EventLevel,
        host: &str,
        step: &str,
        message: &str,
        output: Option<String>,
    );
}

/// Capability set a provisioning strategy exposes to the orchestrator
#[async_trait]
pub trait Provisioner: Send + Sync + std::fmt::Debug {
    /// Apply defaults and reject invalid specs. Idempotent: validating
    /// an already validated spec changes nothing.
    fn validate_spec(&self, spec: ClusterSpec) -> ProvisionResult<ClusterSpec>;

    /// Bring every host to a state where cluster components can be
    /// installed. Hosts are prepared in parallel.
    async fn prepare_hosts(
        &self,
        ctx: &CancellationToken,
        hosts: &[HostSpec],
        runtime: ContainerRuntime,
        version: &str,
        events: &dyn EventSink,
    ) -> ProvisionResult<()>;

    /// Initialize the first control plane and harvest the join
    /// artifacts and admin credentials.
    async fn bootstrap_control_plane(
        &self,
        ctx: &CancellationToken,
        host: &HostSpec,
        spec: &ClusterSpec,
        events: &dyn EventSink,
    ) -> ProvisionResult<BootstrapResult>;

    /// Apply the pod network manifest and wait for it to settle.
    async fn install_cni(
        &self,
        ctx: &CancellationToken,
        kubeconfig: &[u8],
        cni: CniPlugin,
        control_plane: &HostSpec,
        events: &dyn EventSink,
    ) -> ProvisionResult<()>;

    /// Attach an additional control plane.
    async fn join_control_plane(
        &self,
        ctx: &CancellationToken,
        host: &HostSpec,
        join_command: &str,
        certificate_key: &str,
    ) -> ProvisionResult<()>;

    /// Attach a worker.
    async fn join_worker(
        &self,
        ctx: &CancellationToken,
        host: &HostSpec,
        join_command: &str,
    ) -> ProvisionResult<()>;

    /// Best-effort teardown across all hosts; failures are reported as
    /// warnings and never abort the operation.
    async fn destroy_cluster(
        &self,
        ctx: &CancellationToken,
        spec: &ClusterSpec,
        events: &dyn EventSink,
    ) -> ProvisionResult<()>;

    /// Mint a fresh join token on a control plane.
    async fn generate_join_token(
        &self,
        _ctx: &CancellationToken,
        _control_plane: &HostSpec,
    ) -> ProvisionResult<String> {
        Err(ProvisionError::NotImplemented(
            "join token generation is not implemented".to_string(),
        ))
    }

    /// Introspect a running cluster.
    async fn get_cluster_info(
        &self,
        _ctx: &CancellationToken,
        _control_plane: &HostSpec,
    ) -> ProvisionResult<String> {
        Err(ProvisionError::NotImplemented(
            "cluster introspection is not implemented".to_string(),
        ))
    }

    /// Drain and remove a node.
    async fn remove_node(
        &self,
        _ctx: &CancellationToken,
        _control_plane: &HostSpec,
        _node_name: &str,
    ) -> ProvisionResult<()> {
        Err(ProvisionError::NotImplemented(
            "node removal is not implemented".to_string(),
        ))
    }
}

/// Registry mapping provider tags to provisioning strategies
pub struct ProvisionerRegistry {
    providers: HashMap<String, Arc<dyn Provisioner>>,
}

impl ProvisionerRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in strategies.
    pub fn with_defaults(sessions: Arc<dyn crate::ssh::SessionFactory>) -> Self {
        let mut registry = Self::new();
        registry.register(
            kubeadm::PROVIDER,
            Arc::new(kubeadm::KubeadmProvisioner::new(sessions)),
        );
        registry
    }

    pub fn register(&mut self, tag: &str, provisioner: Arc<dyn Provisioner>) {
        self.providers.insert(tag.to_string(), provisioner);
    }

    pub fn get(&self, tag: &str) -> ProvisionResult<Arc<dyn Provisioner>> {
        self.providers
            .get(tag)
            .cloned()
            .ok_or_else(|| ProvisionError::ProvisionerNotFound(tag.to_string()))
    }
}

impl Default for ProvisionerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_provider_lookup_fails() {
        let registry = ProvisionerRegistry::new();
        let err = registry.get("k3s").unwrap_err();
        assert!(matches!(err, ProvisionError::ProvisionerNotFound(tag) if tag == "k3s"));
    }
}
