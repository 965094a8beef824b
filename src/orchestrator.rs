//! Provisioning orchestrator
//!
//! Drives one cluster at a time from "specified" to "ready" as a
//! long-lived task owning that cluster's state transitions and job
//! record. Every event it emits is persisted first and then broadcast
//! through the hub, so history replay and live delivery agree.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::db::{self, Database};
use crate::hub::EventHub;
use crate::provision::{db_err, EventSink, ProvisionError, ProvisionResult, ProvisionerRegistry};
use crate::types::{
    Cluster, ClusterSpec, ClusterStatus, EventLevel, HostSpec, JobStatus, JobType, Node, NodeRole,
    NodeStatus,
};

/// Persists an event, then broadcasts it with the identical payload.
#[derive(Clone)]
pub struct EventRecorder {
    db: Arc<Database>,
    hub: EventHub,
    cluster_id: i64,
}

impl EventRecorder {
    pub fn new(db: Arc<Database>, hub: EventHub, cluster_id: i64) -> Self {
        Self {
            db,
            hub,
            cluster_id,
        }
    }
}

#[async_trait]
impl EventSink for EventRecorder {
    async fn emit(
        &self,
        level: EventLevel,
        host: &str,
        step: &str,
        message: &str,
        output: Option<String>,
    ) {
        match db::events::append(self.db.pool(), self.cluster_id, level, host, step, message, output)
            .await
        {
            Ok(event) => self.hub.broadcast(self.cluster_id, event).await,
            Err(e) => error!(cluster_id = self.cluster_id, "failed to persist event: {}", e),
        }
    }
}

/// Schedules and drives cluster lifecycle operations
#[derive(Clone)]
pub struct Orchestrator {
    db: Arc<Database>,
    hub: EventHub,
    registry: Arc<ProvisionerRegistry>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        hub: EventHub,
        registry: Arc<ProvisionerRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            db,
            hub,
            registry,
            shutdown,
            tasks: TaskTracker::new(),
        }
    }

    /// Task tracker for draining in-flight operations on shutdown
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Accept a cluster specification: validate it, persist the cluster,
    /// node and job records, and schedule the provisioning task. Returns
    /// before provisioning begins.
    pub async fn create_cluster(&self, spec: ClusterSpec) -> ProvisionResult<Cluster> {
        let provisioner = self.registry.get(spec.provider_tag())?;
        let spec = provisioner.validate_spec(spec)?;

        let pool = self.db.pool();

        if db::clusters::name_exists(pool, &spec.name).await.map_err(db_err)? {
            return Err(ProvisionError::InvalidSpec(format!(
                "cluster '{}' already exists",
                spec.name
            )));
        }

        let now = Utc::now();
        let record = Cluster {
            id: 0,
            name: spec.name.clone(),
            k8s_version: spec.k8s_version.clone(),
            pod_network_cidr: spec.pod_network_cidr.clone(),
            service_cidr: spec.service_cidr.clone(),
            cni: spec.cni(),
            container_runtime: spec.runtime(),
            api_server_endpoint: spec.api_server_endpoint.clone(),
            provider: spec.provider.clone(),
            status: ClusterStatus::Pending,
            kubeconfig: Vec::new(),
            join_command: String::new(),
            certificate_key: String::new(),
            created_at: now,
            updated_at: now,
        };
        let cluster_id = db::clusters::create(pool, &record).await.map_err(db_err)?;

        for host in &spec.control_planes {
            let node = node_record(cluster_id, host, NodeRole::ControlPlane);
            db::nodes::create(pool, &node).await.map_err(db_err)?;
        }
        for host in &spec.workers {
            let node = node_record(cluster_id, host, NodeRole::Worker);
            db::nodes::create(pool, &node).await.map_err(db_err)?;
        }

        let job = db::jobs::create(pool, cluster_id, JobType::Provision)
            .await
            .map_err(db_err)?
            .ok_or_else(|| {
                ProvisionError::InvalidSpec(
                    "another job is already running for this cluster".to_string(),
                )
            })?;

        let cluster = db::clusters::get(pool, cluster_id).await.map_err(db_err)?;

        let this = self.clone();
        let ctx = self.shutdown.child_token();
        let task_cluster = cluster.clone();
        self.tasks.spawn(async move {
            this.run_provisioning(ctx, task_cluster, spec, job.id).await;
        });

        Ok(cluster)
    }

    /// Tear a cluster down: best-effort node reset, then remove its
    /// records. Returns once the destroy task is scheduled.
    pub async fn delete_cluster(&self, cluster_id: i64) -> ProvisionResult<()> {
        let pool = self.db.pool();

        let cluster = db::clusters::get(pool, cluster_id).await.map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                ProvisionError::NotFound(format!("cluster {} not found", cluster_id))
            }
            other => db_err(other),
        })?;
        let nodes = db::nodes::list_by_cluster(pool, cluster_id).await.map_err(db_err)?;

        let job = db::jobs::create(pool, cluster_id, JobType::Destroy)
            .await
            .map_err(db_err)?
            .ok_or_else(|| {
                ProvisionError::InvalidSpec(
                    "another job is already running for this cluster".to_string(),
                )
            })?;

        db::clusters::update_status(pool, cluster_id, ClusterStatus::Destroying)
            .await
            .map_err(db_err)?;

        let spec = spec_from_records(&cluster, &nodes);
        let this = self.clone();
        let ctx = self.shutdown.child_token();
        self.tasks.spawn(async move {
            this.run_destroy(ctx, cluster, spec, job.id).await;
        });

        Ok(())
    }

    async fn run_provisioning(
        &self,
        ctx: CancellationToken,
        cluster: Cluster,
        spec: ClusterSpec,
        job_id: i64,
    ) {
        let mut context = String::from("start provisioning");

        match self
            .provision_steps(&ctx, &cluster, &spec, job_id, &mut context)
            .await
        {
            Ok(()) => {
                info!(cluster = cluster.id, name = %cluster.name, "cluster provisioned");
            }
            Err(e) => {
                self.finalize_failure(&ctx, cluster.id, job_id, &context, &e).await;
            }
        }
    }

    async fn provision_steps(
        &self,
        ctx: &CancellationToken,
        cluster: &Cluster,
        spec: &ClusterSpec,
        job_id: i64,
        context: &mut String,
    ) -> ProvisionResult<()> {
        let pool = self.db.pool();
        let sink = EventRecorder::new(self.db.clone(), self.hub.clone(), cluster.id);

        db::clusters::update_status(pool, cluster.id, ClusterStatus::Provisioning)
            .await
            .map_err(db_err)?;
        db::jobs::mark_running(pool, job_id).await.map_err(db_err)?;

        *context = "resolve provisioner".to_string();
        let provisioner = self.registry.get(spec.provider_tag())?;

        *context = "validate spec".to_string();
        let spec = provisioner.validate_spec(spec.clone())?;
        let _ = db::jobs::set_progress(pool, job_id, 5).await;

        *context = "prepare hosts".to_string();
        sink.emit(EventLevel::Info, "localhost", "prepare", "Preparing hosts", None)
            .await;
        let hosts = spec.all_hosts();
        provisioner
            .prepare_hosts(ctx, &hosts, spec.runtime(), &spec.k8s_version, &sink)
            .await?;
        let _ = db::jobs::set_progress(pool, job_id, 40).await;

        *context = "bootstrap control plane".to_string();
        let first = &spec.control_planes[0];
        sink.emit(
            EventLevel::Info,
            &first.address,
            "bootstrap",
            "Bootstrapping control plane",
            None,
        )
        .await;
        let bootstrap = provisioner
            .bootstrap_control_plane(ctx, first, &spec, &sink)
            .await?;
        let _ = db::jobs::set_progress(pool, job_id, 60).await;

        *context = "store cluster credentials".to_string();
        db::clusters::update_secrets(
            pool,
            cluster.id,
            &bootstrap.kubeconfig,
            &bootstrap.join_command,
            &bootstrap.certificate_key,
        )
        .await
        .map_err(db_err)?;
        let _ = db::nodes::update_status(
            pool,
            cluster.id,
            &first.address,
            NodeStatus::Ready,
            Some(&spec.k8s_version),
        )
        .await;

        // CNI failure is not fatal; the operator can install one manually
        sink.emit(EventLevel::Info, &first.address, "cni", "Installing CNI", None)
            .await;
        if let Err(e) = provisioner
            .install_cni(ctx, &bootstrap.kubeconfig, spec.cni(), first, &sink)
            .await
        {
            warn!(cluster = cluster.id, "CNI installation failed: {}", e);
            sink.emit(
                EventLevel::Error,
                &first.address,
                "cni",
                &format!("CNI installation failed: {}", e),
                None,
            )
            .await;
        }
        let _ = db::jobs::set_progress(pool, job_id, 70).await;

        *context = "join control planes".to_string();
        for host in spec.control_planes.iter().skip(1) {
            if ctx.is_cancelled() {
                return Err(ProvisionError::Cancelled(host.address.clone()));
            }

            sink.emit(
                EventLevel::Info,
                &host.address,
                "join",
                "Joining control plane",
                None,
            )
            .await;
            match provisioner
                .join_control_plane(ctx, host, &bootstrap.join_command, &bootstrap.certificate_key)
                .await
            {
                Ok(()) => {
                    let _ = db::nodes::update_status(
                        pool,
                        cluster.id,
                        &host.address,
                        NodeStatus::Ready,
                        Some(&spec.k8s_version),
                    )
                    .await;
                }
                Err(e) if ctx.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(cluster = cluster.id, host = %host.address, "control plane join failed: {}", e);
                    sink.emit(
                        EventLevel::Error,
                        &host.address,
                        "join",
                        &format!("Failed to join control plane: {}", e),
                        None,
                    )
                    .await;
                    let _ = db::nodes::update_status(
                        pool,
                        cluster.id,
                        &host.address,
                        NodeStatus::NotReady,
                        None,
                    )
                    .await;
                }
            }
        }
        let _ = db::jobs::set_progress(pool, job_id, 85).await;

        *context = "join workers".to_string();
        for host in &spec.workers {
            if ctx.is_cancelled() {
                return Err(ProvisionError::Cancelled(host.address.clone()));
            }

            sink.emit(EventLevel::Info, &host.address, "join", "Joining worker", None)
                .await;
            match provisioner
                .join_worker(ctx, host, &bootstrap.join_command)
                .await
            {
                Ok(()) => {
                    let _ = db::nodes::update_status(
                        pool,
                        cluster.id,
                        &host.address,
                        NodeStatus::Ready,
                        Some(&spec.k8s_version),
                    )
                    .await;
                }
                Err(e) if ctx.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(cluster = cluster.id, host = %host.address, "worker join failed: {}", e);
                    sink.emit(
                        EventLevel::Error,
                        &host.address,
                        "join",
                        &format!("Failed to join worker: {}", e),
                        None,
                    )
                    .await;
                    let _ = db::nodes::update_status(
                        pool,
                        cluster.id,
                        &host.address,
                        NodeStatus::NotReady,
                        None,
                    )
                    .await;
                }
            }
        }
        let _ = db::jobs::set_progress(pool, job_id, 95).await;

        *context = "finalize".to_string();
        db::clusters::update_status(pool, cluster.id, ClusterStatus::Ready)
            .await
            .map_err(db_err)?;
        sink.emit(
            EventLevel::Info,
            "localhost",
            "complete",
            "Cluster provisioned successfully",
            None,
        )
        .await;
        db::jobs::finish(pool, job_id, JobStatus::Completed, None)
            .await
            .map_err(db_err)?;

        Ok(())
    }

    async fn finalize_failure(
        &self,
        ctx: &CancellationToken,
        cluster_id: i64,
        job_id: i64,
        context: &str,
        err: &ProvisionError,
    ) {
        let pool = self.db.pool();
        let sink = EventRecorder::new(self.db.clone(), self.hub.clone(), cluster_id);

        let cancelled = ctx.is_cancelled() || matches!(err, ProvisionError::Cancelled(_));

        if cancelled {
            // leave the cluster in whatever state it reached; the
            // idempotent preparation contract allows a later retry
            warn!(cluster = cluster_id, "provisioning interrupted during {}: {}", context, err);
            sink.emit(
                EventLevel::Warn,
                "localhost",
                "error",
                &format!("Provisioning interrupted during {}: {}", context, err),
                None,
            )
            .await;
            let _ = db::jobs::finish(pool, job_id, JobStatus::Cancelled, Some(&err.to_string())).await;
            return;
        }

        error!(cluster = cluster_id, "failed to {}: {}", context, err);
        sink.emit(
            EventLevel::Error,
            "localhost",
            "error",
            &format!("Failed to {}: {}", context, err),
            None,
        )
        .await;
        let _ = db::clusters::update_status(pool, cluster_id, ClusterStatus::Failed).await;
        let _ = db::jobs::finish(pool, job_id, JobStatus::Failed, Some(&err.to_string())).await;
    }

    async fn run_destroy(
        &self,
        ctx: CancellationToken,
        cluster: Cluster,
        spec: ClusterSpec,
        job_id: i64,
    ) {
        let pool = self.db.pool();
        let sink = EventRecorder::new(self.db.clone(), self.hub.clone(), cluster.id);

        let _ = db::jobs::mark_running(pool, job_id).await;
        sink.emit(EventLevel::Info, "localhost", "reset", "Destroying cluster", None)
            .await;

        match self.registry.get(spec.provider_tag()) {
            Ok(provisioner) => {
                // reset failures are warnings; teardown is best-effort
                let _ = provisioner.destroy_cluster(&ctx, &spec, &sink).await;
            }
            Err(e) => {
                warn!(cluster = cluster.id, "skipping node reset: {}", e);
                sink.emit(
                    EventLevel::Warn,
                    "localhost",
                    "reset",
                    &format!("Skipping node reset: {}", e),
                    None,
                )
                .await;
            }
        }

        let _ = db::jobs::finish(pool, job_id, JobStatus::Completed, None).await;

        let _ = db::events::delete_by_cluster(pool, cluster.id).await;
        let _ = db::nodes::delete_by_cluster(pool, cluster.id).await;
        let _ = db::jobs::delete_by_cluster(pool, cluster.id).await;
        if let Err(e) = db::clusters::delete(pool, cluster.id).await {
            error!(cluster = cluster.id, "failed to remove cluster record: {}", e);
            return;
        }

        info!(cluster = cluster.id, name = %cluster.name, "cluster destroyed");
    }
}

fn node_record(cluster_id: i64, host: &HostSpec, role: NodeRole) -> Node {
    Node {
        id: 0,
        cluster_id,
        hostname: host.hostname.clone(),
        address: host.address.clone(),
        ssh_user: host.user.clone(),
        ssh_key_path: host.ssh_key_path.clone(),
        ssh_port: host.port,
        role,
        status: NodeStatus::Provisioning,
        k8s_version: None,
    }
}

/// Rebuild a provisioning spec from persisted records, for teardown.
/// Inline key material is never persisted, so hosts enrolled with inline
/// keys reset on a best-effort basis only.
fn spec_from_records(cluster: &Cluster, nodes: &[Node]) -> ClusterSpec {
    let host_from_node = |node: &Node| HostSpec {
        hostname: node.hostname.clone(),
        address: node.address.clone(),
        user: node.ssh_user.clone(),
        ssh_key: None,
        ssh_key_path: node.ssh_key_path.clone(),
        port: node.ssh_port,
    };

    ClusterSpec {
        name: cluster.name.clone(),
        k8s_version: cluster.k8s_version.clone(),
        pod_network_cidr: cluster.pod_network_cidr.clone(),
        service_cidr: cluster.service_cidr.clone(),
        cni: Some(cluster.cni),
        container_runtime: Some(cluster.container_runtime),
        api_server_endpoint: cluster.api_server_endpoint.clone(),
        provider: cluster.provider.clone(),
        control_planes: nodes
            .iter()
            .filter(|n| n.role == NodeRole::ControlPlane)
            .map(host_from_node)
            .collect(),
        workers: nodes
            .iter()
            .filter(|n| n.role == NodeRole::Worker)
            .map(host_from_node)
            .collect(),
    }
}
