//! kubeadm provisioning strategy
//!
//! Bootstraps the first control plane with `kubeadm init`, parses the
//! join artifacts out of its output, installs the pod network and
//! attaches the remaining hosts.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::prepare::{minor_channel, HostPreparer};
use super::{EventSink, Provisioner, ProvisionError, ProvisionResult};
use crate::ssh::SessionFactory;
use crate::types::{
    BootstrapResult, ClusterSpec, CniPlugin, ContainerRuntime, EventLevel, HostSpec,
    DEFAULT_K8S_VERSION, DEFAULT_POD_NETWORK_CIDR, DEFAULT_PROVIDER, DEFAULT_SERVICE_CIDR,
};

/// Provider tag this strategy registers under
pub const PROVIDER: &str = "kubeadm";

/// Conventional location of the admin credentials on a control plane
const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";

/// How long to wait for the pod network to settle
const CNI_WAIT_SECS: u32 = 300;

const RESET_COMMAND: &str = "sudo kubeadm reset -f && \
    sudo rm -rf /etc/cni/net.d /var/lib/cni /var/lib/kubelet /etc/kubernetes";

pub struct KubeadmProvisioner {
    sessions: Arc<dyn SessionFactory>,
}

impl std::fmt::Debug for KubeadmProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeadmProvisioner").finish()
    }
}

impl KubeadmProvisioner {
    pub fn new(sessions: Arc<dyn SessionFactory>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Provisioner for KubeadmProvisioner {
    fn validate_spec(&self, mut spec: ClusterSpec) -> ProvisionResult<ClusterSpec> {
        if spec.name.trim().is_empty() {
            return Err(ProvisionError::InvalidSpec(
                "cluster name is required".to_string(),
            ));
        }
        if spec.control_planes.is_empty() {
            return Err(ProvisionError::InvalidSpec(
                "at least one control plane host is required".to_string(),
            ));
        }

        if spec.k8s_version.is_empty() {
            spec.k8s_version = DEFAULT_K8S_VERSION.to_string();
        }
        if spec.pod_network_cidr.is_empty() {
            spec.pod_network_cidr = DEFAULT_POD_NETWORK_CIDR.to_string();
        }
        if spec.service_cidr.is_empty() {
            spec.service_cidr = DEFAULT_SERVICE_CIDR.to_string();
        }
        if spec.cni.is_none() {
            spec.cni = Some(CniPlugin::default());
        }
        if spec.container_runtime.is_none() {
            spec.container_runtime = Some(ContainerRuntime::default());
        }
        if spec.provider.is_empty() {
            spec.provider = DEFAULT_PROVIDER.to_string();
        }

        minor_channel(&spec.k8s_version)?;

        for host in spec
            .control_planes
            .iter_mut()
            .chain(spec.workers.iter_mut())
        {
            if host.address.trim().is_empty() {
                return Err(ProvisionError::InvalidSpec(
                    "host address is required".to_string(),
                ));
            }
            host.normalize();
            if !host.has_key_material() {
                return Err(ProvisionError::InvalidSpec(format!(
                    "host '{}' has no SSH key material",
                    host.address
                )));
            }
        }

        Ok(spec)
    }

    async fn prepare_hosts(
        &self,
        ctx: &CancellationToken,
        hosts: &[HostSpec],
        runtime: ContainerRuntime,
        version: &str,
        events: &dyn EventSink,
    ) -> ProvisionResult<()> {
        let preparer = HostPreparer::new(self.sessions.clone());

        let results = futures::future::join_all(
            hosts
                .iter()
                .map(|host| preparer.prepare(ctx, host, runtime, version, events)),
        )
        .await;

        for result in results {
            result?;
        }

        Ok(())
    }

    async fn bootstrap_control_plane(
        &self,
        ctx: &CancellationToken,
        host: &HostSpec,
        spec: &ClusterSpec,
        _events: &dyn EventSink,
    ) -> ProvisionResult<BootstrapResult> {
        let mut session = self.sessions.connect(ctx, host).await?;

        let mut command = format!(
            "sudo kubeadm init --pod-network-cidr={} --kubernetes-version={} --upload-certs",
            spec.pod_network_cidr, spec.k8s_version
        );
        if let Some(endpoint) = spec.api_server_endpoint.as_deref() {
            if !endpoint.is_empty() {
                command.push_str(&format!(" --control-plane-endpoint={}", endpoint));
            }
        }

        info!(host = %host.address, "running cluster initialization");

        // kubeadm init runs for minutes; stream its output instead of
        // sitting silent until the end
        let mut transcript = Vec::new();
        session
            .run_streaming(ctx, &command, &mut |chunk| {
                transcript.extend_from_slice(chunk);
            })
            .await?;
        let transcript = String::from_utf8_lossy(&transcript).into_owned();

        let join_command = extract_join_command(&transcript)?;
        let certificate_key = extract_certificate_key(&transcript)?;

        session
            .run(
                ctx,
                &format!(
                    "mkdir -p $HOME/.kube && sudo cp -f {ADMIN_CONF} $HOME/.kube/config \
                     && sudo chown $(id -u):$(id -g) $HOME/.kube/config"
                ),
            )
            .await?;

        let kubeconfig = session
            .run(ctx, &format!("sudo cat {ADMIN_CONF}"))
            .await?
            .stdout
            .into_bytes();

        let _ = session.close().await;

        if kubeconfig.is_empty() {
            return Err(ProvisionError::Internal(
                "bootstrap produced an empty kubeconfig".to_string(),
            ));
        }

        Ok(BootstrapResult {
            kubeconfig,
            join_command,
            certificate_key,
        })
    }

    async fn install_cni(
        &self,
        ctx: &CancellationToken,
        kubeconfig: &[u8],
        cni: CniPlugin,
        control_plane: &HostSpec,
        events: &dyn EventSink,
    ) -> ProvisionResult<()> {
        if kubeconfig.is_empty() {
            return Err(ProvisionError::InvalidSpec(
                "cluster has no kubeconfig".to_string(),
            ));
        }
        let manifest = manifest_url(cni)?;

        let mut session = self.sessions.connect(ctx, control_plane).await?;

        session
            .run(
                ctx,
                &format!("sudo kubectl --kubeconfig={ADMIN_CONF} apply -f {manifest}"),
            )
            .await?;

        // a slow pod network is an operator concern, not a provisioning
        // failure
        let wait = format!(
            "sudo kubectl --kubeconfig={ADMIN_CONF} wait --for=condition=Ready pods --all \
             --namespace=kube-system --timeout={CNI_WAIT_SECS}s"
        );
        if let Err(e) = session.run(ctx, &wait).await {
            warn!(host = %control_plane.address, "CNI readiness wait did not complete: {}", e);
            events
                .emit(
                    EventLevel::Warn,
                    &control_plane.address,
                    "cni",
                    &format!("Pod network not ready after {}s: {}", CNI_WAIT_SECS, e),
                    None,
                )
                .await;
        }

        let _ = session.close().await;
        Ok(())
    }

    async fn join_control_plane(
        &self,
        ctx: &CancellationToken,
        host: &HostSpec,
        join_command: &str,
        certificate_key: &str,
    ) -> ProvisionResult<()> {
        let mut session = self.sessions.connect(ctx, host).await?;

        let command = format!(
            "sudo {} --control-plane --certificate-key {}",
            join_command, certificate_key
        );
        session.run(ctx, &command).await?;

        let _ = session.close().await;
        Ok(())
    }

    async fn join_worker(
        &self,
        ctx: &CancellationToken,
        host: &HostSpec,
        join_command: &str,
    ) -> ProvisionResult<()> {
        let mut session = self.sessions.connect(ctx, host).await?;

        session.run(ctx, &format!("sudo {}", join_command)).await?;

        let _ = session.close().await;
        Ok(())
    }

    async fn destroy_cluster(
        &self,
        ctx: &CancellationToken,
        spec: &ClusterSpec,
        events: &dyn EventSink,
    ) -> ProvisionResult<()> {
        for host in spec.control_planes.iter().chain(spec.workers.iter()) {
            match self.sessions.connect(ctx, host).await {
                Ok(mut session) => {
                    match session.run(ctx, RESET_COMMAND).await {
                        Ok(_) => {
                            events
                                .emit(EventLevel::Info, &host.address, "reset", "Node reset", None)
                                .await;
                        }
                        Err(e) => {
                            warn!(host = %host.address, "node reset failed: {}", e);
                            events
                                .emit(
                                    EventLevel::Warn,
                                    &host.address,
                                    "reset",
                                    &format!("Failed to reset node: {}", e),
                                    None,
                                )
                                .await;
                        }
                    }
                    let _ = session.close().await;
                }
                Err(e) => {
                    warn!(host = %host.address, "could not connect for reset: {}", e);
                    events
                        .emit(
                            EventLevel::Warn,
                            &host.address,
                            "reset",
                            &format!("Could not connect for reset: {}", e),
                            None,
                        )
                        .await;
                }
            }
        }

        Ok(())
    }
}

/// Pinned upstream manifest for each supported pod network plugin.
fn manifest_url(cni: CniPlugin) -> ProvisionResult<&'static str> {
    match cni {
        CniPlugin::Calico => {
            Ok("https://raw.githubusercontent.com/projectcalico/calico/v3.26.1/manifests/calico.yaml")
        }
        CniPlugin::Flannel => {
            Ok("https://github.com/flannel-io/flannel/releases/download/v0.24.2/kube-flannel.yml")
        }
        CniPlugin::Weave => {
            Ok("https://github.com/weaveworks/weave/releases/download/v2.8.1/weave-daemonset-k8s.yaml")
        }
        CniPlugin::Cilium => Err(ProvisionError::NotImplemented(
            "CNI 'cilium' is not implemented".to_string(),
        )),
    }
}

/// Extract the worker join invocation from `kubeadm init` output.
///
/// The command may span several lines; continuation lines either follow
/// a trailing backslash or start with `--`. When the output carries both
/// the control-plane and the worker variant, the worker one (without
/// `--control-plane`) wins.
pub fn extract_join_command(output: &str) -> ProvisionResult<String> {
    let lines: Vec<&str> = output.lines().collect();
    let mut candidates = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let first = lines[i].trim();
        if !first.starts_with("kubeadm join") {
            i += 1;
            continue;
        }

        let mut pieces = Vec::new();
        let mut continued = false;

        let body = match first.strip_suffix('\\') {
            Some(body) => {
                continued = true;
                body.trim_end()
            }
            None => first,
        };
        pieces.push(body.to_string());
        i += 1;

        while i < lines.len() {
            let next = lines[i].trim();
            let take = (continued && !next.is_empty()) || next.starts_with("--");
            if !take {
                break;
            }

            continued = false;
            let body = match next.strip_suffix('\\') {
                Some(body) => {
                    continued = true;
                    body.trim_end()
                }
                None => next,
            };
            pieces.push(body.to_string());
            i += 1;
        }

        let merged = pieces.join(" ");
        candidates.push(merged.split_whitespace().collect::<Vec<_>>().join(" "));
    }

    if candidates.is_empty() {
        return Err(ProvisionError::Internal(
            "could not find join command in kubeadm output".to_string(),
        ));
    }

    let command = candidates
        .iter()
        .find(|c| !c.contains("--control-plane"))
        .or(candidates.last())
        .cloned()
        .ok_or_else(|| {
            ProvisionError::Internal("could not find join command in kubeadm output".to_string())
        })?;

    Ok(command)
}

/// Extract the certificate key: the whitespace-delimited token following
/// the `--certificate-key` flag.
pub fn extract_certificate_key(output: &str) -> ProvisionResult<String> {
    let tokens: Vec<&str> = output.split_whitespace().collect();

    let position = tokens
        .iter()
        .position(|t| *t == "--certificate-key")
        .ok_or_else(|| {
            ProvisionError::Internal(
                "could not find certificate key in kubeadm output".to_string(),
            )
        })?;

    let mut index = position + 1;
    if tokens.get(index) == Some(&"\\") {
        index += 1;
    }

    tokens
        .get(index)
        .map(|t| t.to_string())
        .ok_or_else(|| {
            ProvisionError::Internal(
                "could not find certificate key in kubeadm output".to_string(),
            )
        })
}
