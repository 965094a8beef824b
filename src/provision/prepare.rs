//! Host preparation
//!
//! Brings a bare Linux host to a kubeadm-ready state. Every step is
//! idempotent, so re-running against a partially prepared host
//! converges instead of failing.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{EventSink, ProvisionError, ProvisionResult};
use crate::ssh::SessionFactory;
use crate::types::{ContainerRuntime, EventLevel, HostSpec};

const KERNEL_MODULES_SCRIPT: &str = r#"cat <<EOF | sudo tee /etc/modules-load.d/k8s.conf
overlay
br_netfilter
EOF
sudo modprobe overlay
sudo modprobe br_netfilter"#;

const SYSCTL_SCRIPT: &str = r#"cat <<EOF | sudo tee /etc/sysctl.d/k8s.conf
net.bridge.bridge-nf-call-iptables  = 1
net.bridge.bridge-nf-call-ip6tables = 1
net.ipv4.ip_forward                 = 1
EOF
sudo sysctl --system"#;

const CONTAINERD_SCRIPT: &str = r#"sudo install -m 0755 -d /etc/apt/keyrings
curl -fsSL https://download.docker.com/linux/ubuntu/gpg | sudo gpg --dearmor --yes -o /etc/apt/keyrings/docker.gpg
echo "deb [signed-by=/etc/apt/keyrings/docker.gpg] https://download.docker.com/linux/ubuntu $(. /etc/os-release && echo $VERSION_CODENAME) stable" | sudo tee /etc/apt/sources.list.d/docker.list
sudo apt-get update
sudo apt-get install -y containerd.io
sudo mkdir -p /etc/containerd
containerd config default | sudo tee /etc/containerd/config.toml
sudo sed -i 's/SystemdCgroup = false/SystemdCgroup = true/' /etc/containerd/config.toml
sudo systemctl enable containerd
sudo systemctl restart containerd"#;

/// Derive the `major.minor` package channel from a version string.
pub fn minor_channel(version: &str) -> ProvisionResult<String> {
    let trimmed = version.trim().trim_start_matches('v');
    let parts: Vec<&str> = trimmed.split('.').collect();

    if parts.len() < 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(ProvisionError::InvalidSpec(format!(
            "invalid Kubernetes version '{}'",
            version
        )));
    }

    Ok(format!("{}.{}", parts[0], parts[1]))
}

fn kube_tools_script(channel: &str) -> String {
    format!(
        r#"sudo apt-get install -y apt-transport-https ca-certificates curl gnupg
sudo mkdir -p /etc/apt/keyrings
curl -fsSL https://pkgs.k8s.io/core:/stable:/v{channel}/deb/Release.key | sudo gpg --dearmor --yes -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg
echo 'deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/v{channel}/deb/ /' | sudo tee /etc/apt/sources.list.d/kubernetes.list
sudo apt-get update
sudo apt-get install -y kubelet kubeadm kubectl
sudo apt-mark hold kubelet kubeadm kubectl
sudo systemctl enable kubelet"#
    )
}

/// Drives the preparation sequence on individual hosts
pub struct HostPreparer {
    sessions: Arc<dyn SessionFactory>,
}

impl HostPreparer {
    pub fn new(sessions: Arc<dyn SessionFactory>) -> Self {
        Self { sessions }
    }

    /// Run the full sequence against one host, emitting an event per
    /// step. A failure emits an error event and aborts this host.
    pub async fn prepare(
        &self,
        ctx: &CancellationToken,
        host: &HostSpec,
        runtime: ContainerRuntime,
        version: &str,
        events: &dyn EventSink,
    ) -> ProvisionResult<()> {
        let result = self.prepare_steps(ctx, host, runtime, version, events).await;

        if let Err(e) = &result {
            events
                .emit(
                    EventLevel::Error,
                    &host.address,
                    "prepare",
                    &format!("Host preparation failed: {}", e),
                    None,
                )
                .await;
        }

        result
    }

    async fn prepare_steps(
        &self,
        ctx: &CancellationToken,
        host: &HostSpec,
        runtime: ContainerRuntime,
        version: &str,
        events: &dyn EventSink,
    ) -> ProvisionResult<()> {
        let channel = minor_channel(version)?;
        let addr = host.address.as_str();

        events
            .emit(EventLevel::Info, addr, "probe", "Connecting to host", None)
            .await;
        let mut session = self.sessions.connect(ctx, host).await?;
        session.test_connection(ctx).await?;
        let facts = session.host_info(ctx).await?;
        info!(
            host = addr,
            os = facts.get("os").map(String::as_str).unwrap_or(""),
            kernel = facts.get("kernel").map(String::as_str).unwrap_or(""),
            "host probe complete"
        );
        events
            .emit(EventLevel::Info, addr, "probe", "Host reachable", None)
            .await;

        events
            .emit(EventLevel::Info, addr, "swap", "Disabling swap", None)
            .await;
        if facts.get("swap_enabled").map(String::as_str) == Some("true") {
            session.run(ctx, "sudo swapoff -a").await?;
        }
        session
            .run(ctx, r"sudo sed -i '/ swap / s/^\([^#]\)/#\1/' /etc/fstab")
            .await?;
        events
            .emit(EventLevel::Info, addr, "swap", "Swap disabled", None)
            .await;

        events
            .emit(EventLevel::Info, addr, "modules", "Loading kernel modules", None)
            .await;
        session.run(ctx, KERNEL_MODULES_SCRIPT).await?;
        events
            .emit(EventLevel::Info, addr, "modules", "Kernel modules loaded", None)
            .await;

        events
            .emit(EventLevel::Info, addr, "sysctl", "Applying sysctl settings", None)
            .await;
        session.run(ctx, SYSCTL_SCRIPT).await?;
        events
            .emit(EventLevel::Info, addr, "sysctl", "Sysctl settings applied", None)
            .await;

        events
            .emit(
                EventLevel::Info,
                addr,
                "runtime",
                &format!("Installing container runtime {}", runtime),
                None,
            )
            .await;
        match runtime {
            ContainerRuntime::Containerd => {
                session.run(ctx, CONTAINERD_SCRIPT).await?;
            }
            ContainerRuntime::CriO => {
                return Err(ProvisionError::NotImplemented(
                    "container runtime 'cri-o' is not implemented".to_string(),
                ));
            }
        }
        events
            .emit(EventLevel::Info, addr, "runtime", "Container runtime installed", None)
            .await;

        events
            .emit(
                EventLevel::Info,
                addr,
                "tools",
                &format!("Installing Kubernetes tools for v{}", channel),
                None,
            )
            .await;
        session.run(ctx, &kube_tools_script(&channel)).await?;
        events
            .emit(EventLevel::Info, addr, "tools", "Kubernetes tools installed", None)
            .await;

        let _ = session.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_channel_extraction() {
        assert_eq!(minor_channel("1.28.0").unwrap(), "1.28");
        assert_eq!(minor_channel("v1.30.1").unwrap(), "1.30");
        assert_eq!(minor_channel("1.27").unwrap(), "1.27");
    }

    #[test]
    fn test_minor_channel_rejects_short_versions() {
        assert!(minor_channel("1").is_err());
        assert!(minor_channel("").is_err());
        assert!(minor_channel("v1.").is_err());
    }

    #[test]
    fn test_kube_tools_script_pins_channel() {
        let script = kube_tools_script("1.28");
        assert!(script.contains("https://pkgs.k8s.io/core:/stable:/v1.28/deb/"));
        assert!(script.contains("apt-mark hold kubelet kubeadm kubectl"));
    }
}
