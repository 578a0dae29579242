//! Configuration for a cluster run.
//!
//! Every section deserializes with defaults, so an empty document yields a
//! usable single-master configuration without a bastion.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use meshkube_shared::constants::{addons, bastion, cluster, firewall, mesh, provision, ssh};
use meshkube_shared::errors::{MeshkubeError, MeshkubeResult};
use serde::{Deserialize, Serialize};

use crate::cluster::Distribution;
use crate::retry::BackoffPolicy;

// ============================================================================
// Cluster Options
// ============================================================================

/// Options for one provisioning run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterOptions {
    #[serde(default)]
    pub ssh: SshOptions,

    #[serde(default)]
    pub bastion: BastionOptions,

    #[serde(default)]
    pub mesh: MeshOptions,

    #[serde(default)]
    pub kubernetes: KubernetesOptions,

    #[serde(default)]
    pub provisioning: ProvisioningOptions,

    #[serde(default)]
    pub firewall: FirewallOptions,

    #[serde(default)]
    pub dns: DnsOptions,

    #[serde(default)]
    pub addons: AddonOptions,
}

impl ClusterOptions {
    /// Check the options against a fleet of `node_count` machines.
    pub fn validate(&self, node_count: usize) -> MeshkubeResult<()> {
        if self.ssh.port == 0 || self.mesh.listen_port == 0 {
            return Err(MeshkubeError::Config("ports must be non-zero".into()));
        }

        if self.bastion.enabled {
            if self.bastion.allowed_cidrs.is_empty() {
                return Err(MeshkubeError::Config(
                    "bastion.allowed_cidrs must not be empty when the bastion is enabled".into(),
                ));
            }
            for cidr in &self.bastion.allowed_cidrs {
                parse_cidr(cidr).ok_or_else(|| {
                    MeshkubeError::Config(format!("bastion.allowed_cidrs: invalid CIDR '{cidr}'"))
                })?;
            }
            if self.bastion.ssh_port == 0 {
                return Err(MeshkubeError::Config("bastion.ssh_port must be non-zero".into()));
            }
        }

        let threshold = self.mesh.handshake_threshold_percent;
        if threshold == 0 || threshold > 100 {
            return Err(MeshkubeError::Config(format!(
                "mesh.handshake_threshold_percent must be within 1..=100, got {threshold}"
            )));
        }

        if node_count > 0 {
            self.mesh.address_for(node_count - 1)?;
        }

        for (field, value) in [
            ("mesh.peer_allowed_range", &self.mesh.peer_allowed_range),
            ("kubernetes.pod_cidr", &self.kubernetes.pod_cidr),
            ("kubernetes.service_cidr", &self.kubernetes.service_cidr),
        ] {
            parse_cidr(value)
                .ok_or_else(|| MeshkubeError::Config(format!("{field}: invalid CIDR '{value}'")))?;
        }

        self.kubernetes
            .cluster_dns
            .parse::<IpAddr>()
            .map_err(|_| {
                MeshkubeError::Config(format!(
                    "kubernetes.cluster_dns: invalid address '{}'",
                    self.kubernetes.cluster_dns
                ))
            })?;

        if self.kubernetes.masters == 0 {
            return Err(MeshkubeError::Config("kubernetes.masters must be at least 1".into()));
        }

        if self.firewall.enabled {
            if self.firewall.ssh_sources.is_empty() && !self.bastion.enabled {
                return Err(MeshkubeError::Config(
                    "firewall.ssh_sources must not be empty without a bastion".into(),
                ));
            }
            for cidr in &self.firewall.ssh_sources {
                parse_cidr(cidr).ok_or_else(|| {
                    MeshkubeError::Config(format!("firewall.ssh_sources: invalid CIDR '{cidr}'"))
                })?;
            }
        }

        if let Some(ingress) = &self.addons.ingress {
            if ingress.replicas == 0 {
                return Err(MeshkubeError::Config(
                    "addons.ingress.replicas must be at least 1".into(),
                ));
            }
        }

        if self.provisioning.disk_usage_ceiling_percent > 100 {
            return Err(MeshkubeError::Config(
                "provisioning.disk_usage_ceiling_percent must be at most 100".into(),
            ));
        }

        Ok(())
    }
}

/// Parse `a.b.c.d/len` (or an IPv6 equivalent).
pub fn parse_cidr(value: &str) -> Option<(IpAddr, u8)> {
    let (addr, len) = value.trim().split_once('/')?;
    let addr: IpAddr = addr.parse().ok()?;
    let len: u8 = len.parse().ok()?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    (len <= max).then_some((addr, len))
}

// ============================================================================
// SSH Options
// ============================================================================

/// How the pipeline reaches machines.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SshOptions {
    /// Login user for every node.
    ///
    /// - None: derive from the node's provider (see [`crate::node::Provider`])
    /// - Some(user): use `user` everywhere
    #[serde(default)]
    pub user: Option<String>,

    /// Private key used for nodes and for the bastion hop.
    ///
    /// Default: ~/.ssh/id_rsa
    #[serde(default = "default_identity_file")]
    pub identity_file: PathBuf,

    /// SSH port on cluster nodes.
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Dial retry policy. Fresh VMs can take minutes to accept connections.
    #[serde(default = "default_dial_retry")]
    pub dial_retry: BackoffPolicy,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Timeout for mutating scripts (installers, joins).
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,

    /// Timeout for read-only checks.
    #[serde(default = "default_validate_timeout_secs")]
    pub validate_timeout_secs: u64,
}

impl SshOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn validate_timeout(&self) -> Duration {
        Duration::from_secs(self.validate_timeout_secs)
    }
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            user: None,
            identity_file: default_identity_file(),
            port: default_ssh_port(),
            dial_retry: default_dial_retry(),
            connect_timeout_secs: default_connect_timeout_secs(),
            install_timeout_secs: default_install_timeout_secs(),
            validate_timeout_secs: default_validate_timeout_secs(),
        }
    }
}

fn default_identity_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(ssh::DEFAULT_IDENTITY)
}

fn default_ssh_port() -> u16 {
    ssh::PORT
}

fn default_dial_retry() -> BackoffPolicy {
    BackoffPolicy::new(
        ssh::DIAL_RETRY_LIMIT,
        Duration::from_secs(ssh::DIAL_BASE_DELAY_SECS),
        Duration::from_secs(ssh::DIAL_MAX_DELAY_SECS),
    )
}

fn default_connect_timeout_secs() -> u64 {
    ssh::CONNECT_TIMEOUT_SECS
}

fn default_install_timeout_secs() -> u64 {
    ssh::INSTALL_TIMEOUT_SECS
}

fn default_validate_timeout_secs() -> u64 {
    ssh::VALIDATE_TIMEOUT_SECS
}

// ============================================================================
// Bastion Options
// ============================================================================

/// Jump host policy.
///
/// When enabled, every node is reached through the bastion and node
/// provisioning runs one node at a time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BastionOptions {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_bastion_name")]
    pub name: String,

    /// Source ranges allowed to reach the bastion's SSH port.
    ///
    /// Default: ["0.0.0.0/0"]
    #[serde(default = "default_allowed_cidrs")]
    pub allowed_cidrs: Vec<String>,

    #[serde(default = "default_bastion_ssh_port")]
    pub ssh_port: u16,

    /// Idle minutes before sshd drops a silent client.
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: u32,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,

    /// Install auditd with rules for sshd and auth.log.
    #[serde(default)]
    pub audit_log: bool,

    /// Install the TOTP PAM module. Enrollment and enforcement stay manual.
    #[serde(default)]
    pub mfa: bool,
}

impl Default for BastionOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            name: default_bastion_name(),
            allowed_cidrs: default_allowed_cidrs(),
            ssh_port: default_bastion_ssh_port(),
            idle_timeout_minutes: default_idle_timeout_minutes(),
            max_sessions: default_max_sessions(),
            audit_log: false,
            mfa: false,
        }
    }
}

fn default_bastion_name() -> String {
    "bastion".into()
}

fn default_allowed_cidrs() -> Vec<String> {
    vec![bastion::OPEN_CIDR.to_string()]
}

fn default_bastion_ssh_port() -> u16 {
    bastion::SSH_PORT
}

fn default_idle_timeout_minutes() -> u32 {
    bastion::IDLE_TIMEOUT_MINUTES
}

fn default_max_sessions() -> u32 {
    bastion::MAX_SESSIONS
}

// ============================================================================
// Mesh Options
// ============================================================================

/// Where reachability probes originate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationScope {
    /// Probe from every node (complete matrix).
    #[default]
    All,
    /// Probe from the first node only.
    Representative,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshOptions {
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Mesh network; node `i` gets host part `host_offset + i`.
    #[serde(default = "default_network_base")]
    pub network_base: Ipv4Addr,

    #[serde(default = "default_host_offset")]
    pub host_offset: u8,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u16,

    /// Extra range routed through each peer besides its /32.
    #[serde(default = "default_peer_allowed_range")]
    pub peer_allowed_range: String,

    #[serde(default = "default_handshake_threshold_percent")]
    pub handshake_threshold_percent: u8,

    #[serde(default = "default_handshake_wait_secs")]
    pub handshake_wait_secs: u64,

    #[serde(default = "default_handshake_poll_secs")]
    pub handshake_poll_secs: u64,

    #[serde(default = "default_ping_count")]
    pub ping_count: u32,

    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u32,

    #[serde(default)]
    pub validation_scope: ValidationScope,

    /// Concurrent per-node mesh operations.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl MeshOptions {
    /// Deterministic mesh address for the node at `index`.
    pub fn address_for(&self, index: usize) -> MeshkubeResult<Ipv4Addr> {
        let host = usize::from(self.host_offset) + index;
        if host == 0 || host > 254 {
            return Err(MeshkubeError::Config(format!(
                "mesh address space exhausted: node index {index} with host offset {}",
                self.host_offset
            )));
        }
        let [a, b, c, _] = self.network_base.octets();
        Ok(Ipv4Addr::new(a, b, c, host as u8))
    }

    pub fn handshake_wait(&self) -> Duration {
        Duration::from_secs(self.handshake_wait_secs)
    }

    pub fn handshake_poll(&self) -> Duration {
        Duration::from_secs(self.handshake_poll_secs.max(1))
    }
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            network_base: default_network_base(),
            host_offset: default_host_offset(),
            listen_port: default_listen_port(),
            mtu: default_mtu(),
            keepalive_secs: default_keepalive_secs(),
            peer_allowed_range: default_peer_allowed_range(),
            handshake_threshold_percent: default_handshake_threshold_percent(),
            handshake_wait_secs: default_handshake_wait_secs(),
            handshake_poll_secs: default_handshake_poll_secs(),
            ping_count: default_ping_count(),
            ping_timeout_secs: default_ping_timeout_secs(),
            validation_scope: ValidationScope::default(),
            max_parallel: default_max_parallel(),
        }
    }
}

fn default_interface() -> String {
    mesh::INTERFACE.into()
}

fn default_network_base() -> Ipv4Addr {
    let [a, b, c, d] = mesh::NETWORK_BASE;
    Ipv4Addr::new(a, b, c, d)
}

fn default_host_offset() -> u8 {
    mesh::HOST_OFFSET
}

fn default_listen_port() -> u16 {
    mesh::LISTEN_PORT
}

fn default_mtu() -> u16 {
    mesh::MTU
}

fn default_keepalive_secs() -> u16 {
    mesh::PERSISTENT_KEEPALIVE_SECS
}

fn default_peer_allowed_range() -> String {
    mesh::PEER_ALLOWED_RANGE.into()
}

fn default_handshake_threshold_percent() -> u8 {
    mesh::HANDSHAKE_THRESHOLD_PERCENT
}

fn default_handshake_wait_secs() -> u64 {
    mesh::HANDSHAKE_WAIT_SECS
}

fn default_handshake_poll_secs() -> u64 {
    mesh::HANDSHAKE_POLL_SECS
}

fn default_ping_count() -> u32 {
    mesh::PING_COUNT
}

fn default_ping_timeout_secs() -> u32 {
    mesh::PING_TIMEOUT_SECS
}

fn default_max_parallel() -> usize {
    16
}

// ============================================================================
// Kubernetes Options
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KubernetesOptions {
    #[serde(default)]
    pub distribution: Distribution,

    /// Master count used when nodes arrive without explicit roles.
    #[serde(default = "default_masters")]
    pub masters: usize,

    #[serde(default = "default_pod_cidr")]
    pub pod_cidr: String,

    #[serde(default = "default_service_cidr")]
    pub service_cidr: String,

    #[serde(default = "default_cluster_dns")]
    pub cluster_dns: String,

    /// Pre-shared join token. When unset the leader generates one.
    #[serde(default)]
    pub token: Option<String>,

    /// Extra subject alternative names for the API certificate.
    #[serde(default)]
    pub tls_sans: Vec<String>,

    #[serde(default = "default_leader_api_wait_secs")]
    pub leader_api_wait_secs: u64,

    #[serde(default = "default_token_wait_secs")]
    pub token_wait_secs: u64,

    #[serde(default = "default_follower_mesh_wait_secs")]
    pub follower_mesh_wait_secs: u64,

    #[serde(default = "default_leader_port_wait_secs")]
    pub leader_port_wait_secs: u64,

    #[serde(default = "default_node_ready_wait_secs")]
    pub node_ready_wait_secs: u64,

    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,

    /// Concurrent follower joins.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl KubernetesOptions {
    pub fn leader_api_wait(&self) -> Duration {
        Duration::from_secs(self.leader_api_wait_secs)
    }

    pub fn node_ready_wait(&self) -> Duration {
        Duration::from_secs(self.node_ready_wait_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs.max(1))
    }
}

impl Default for KubernetesOptions {
    fn default() -> Self {
        Self {
            distribution: Distribution::default(),
            masters: default_masters(),
            pod_cidr: default_pod_cidr(),
            service_cidr: default_service_cidr(),
            cluster_dns: default_cluster_dns(),
            token: None,
            tls_sans: Vec::new(),
            leader_api_wait_secs: default_leader_api_wait_secs(),
            token_wait_secs: default_token_wait_secs(),
            follower_mesh_wait_secs: default_follower_mesh_wait_secs(),
            leader_port_wait_secs: default_leader_port_wait_secs(),
            node_ready_wait_secs: default_node_ready_wait_secs(),
            poll_secs: default_poll_secs(),
            max_parallel: default_max_parallel(),
        }
    }
}

fn default_masters() -> usize {
    1
}

fn default_pod_cidr() -> String {
    cluster::POD_CIDR.into()
}

fn default_service_cidr() -> String {
    cluster::SERVICE_CIDR.into()
}

fn default_cluster_dns() -> String {
    cluster::CLUSTER_DNS.into()
}

fn default_leader_api_wait_secs() -> u64 {
    cluster::LEADER_API_WAIT_SECS
}

fn default_token_wait_secs() -> u64 {
    cluster::TOKEN_WAIT_SECS
}

fn default_follower_mesh_wait_secs() -> u64 {
    cluster::FOLLOWER_MESH_WAIT_SECS
}

fn default_leader_port_wait_secs() -> u64 {
    cluster::LEADER_PORT_WAIT_SECS
}

fn default_node_ready_wait_secs() -> u64 {
    cluster::NODE_READY_WAIT_SECS
}

fn default_poll_secs() -> u64 {
    cluster::POLL_SECS
}

// ============================================================================
// Provisioning Options
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProvisioningOptions {
    /// How long to wait for another apt/dpkg process before forcing recovery.
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,

    #[serde(default = "default_lock_poll_secs")]
    pub lock_poll_secs: u64,

    /// Retry policy for a whole install attempt.
    #[serde(default = "default_install_retry")]
    pub install_retry: BackoffPolicy,

    #[serde(default = "default_cloud_init_wait_secs")]
    pub cloud_init_wait_secs: u64,

    #[serde(default = "default_disk_usage_ceiling_percent")]
    pub disk_usage_ceiling_percent: u8,

    /// Concurrent node preparations. Ignored (forced to 1) behind a bastion.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

impl Default for ProvisioningOptions {
    fn default() -> Self {
        Self {
            lock_wait_secs: default_lock_wait_secs(),
            lock_poll_secs: default_lock_poll_secs(),
            install_retry: default_install_retry(),
            cloud_init_wait_secs: default_cloud_init_wait_secs(),
            disk_usage_ceiling_percent: default_disk_usage_ceiling_percent(),
            max_parallel: default_max_parallel(),
        }
    }
}

fn default_lock_wait_secs() -> u64 {
    provision::LOCK_WAIT_SECS
}

fn default_lock_poll_secs() -> u64 {
    provision::LOCK_POLL_SECS
}

fn default_install_retry() -> BackoffPolicy {
    BackoffPolicy::new(
        provision::INSTALL_ATTEMPTS,
        Duration::from_secs(provision::INSTALL_BASE_DELAY_SECS),
        Duration::from_secs(provision::INSTALL_MAX_DELAY_SECS),
    )
}

fn default_cloud_init_wait_secs() -> u64 {
    provision::CLOUD_INIT_WAIT_SECS
}

fn default_disk_usage_ceiling_percent() -> u8 {
    provision::DISK_USAGE_CEILING_PERCENT
}

// ============================================================================
// Firewall Options
// ============================================================================

/// Host firewall applied to every node after provisioning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FirewallOptions {
    #[serde(default)]
    pub enabled: bool,

    /// Sources allowed to reach SSH. Replaced by the bastion's address
    /// when a bastion fronts the nodes.
    #[serde(default = "default_ssh_sources")]
    pub ssh_sources: Vec<String>,

    /// Open NodePorts and HTTP(S) on workers.
    #[serde(default = "default_worker_ingress")]
    pub worker_ingress: bool,
}

impl Default for FirewallOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            ssh_sources: default_ssh_sources(),
            worker_ingress: default_worker_ingress(),
        }
    }
}

fn default_ssh_sources() -> Vec<String> {
    vec![firewall::ANYWHERE.to_string()]
}

fn default_worker_ingress() -> bool {
    true
}

// ============================================================================
// DNS and Addon Options
// ============================================================================

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DnsOptions {
    /// Zone for `api.<domain>` and per-node records. Empty disables DNS.
    #[serde(default)]
    pub domain: String,
}

impl DnsOptions {
    pub fn is_enabled(&self) -> bool {
        let domain = self.domain.trim();
        !domain.is_empty() && domain != addons::PLACEHOLDER_DOMAIN
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AddonOptions {
    #[serde(default)]
    pub gitops: Option<GitOpsOptions>,

    #[serde(default)]
    pub ingress: Option<IngressOptions>,
}

/// ArgoCD installation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GitOpsOptions {
    #[serde(default = "default_argocd_namespace")]
    pub namespace: String,

    /// Release tag of the install manifest.
    #[serde(default = "default_argocd_version")]
    pub version: String,

    /// App-of-apps repository. No Application is created when unset.
    #[serde(default)]
    pub repo_url: Option<String>,

    #[serde(default = "default_gitops_branch")]
    pub branch: String,

    #[serde(default = "default_gitops_apps_path")]
    pub apps_path: String,
}

impl Default for GitOpsOptions {
    fn default() -> Self {
        Self {
            namespace: default_argocd_namespace(),
            version: default_argocd_version(),
            repo_url: None,
            branch: default_gitops_branch(),
            apps_path: default_gitops_apps_path(),
        }
    }
}

/// NGINX ingress controller, optionally with cert-manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngressOptions {
    #[serde(default = "default_ingress_namespace")]
    pub namespace: String,

    #[serde(default = "default_ingress_replicas")]
    pub replicas: u32,

    /// Chart version; latest when unset.
    #[serde(default)]
    pub chart_version: Option<String>,

    #[serde(default = "default_cert_manager")]
    pub cert_manager: bool,

    #[serde(default = "default_cert_manager_version")]
    pub cert_manager_version: String,

    /// ACME account for the Let's Encrypt issuers. Falls back to
    /// `admin@<dns.domain>`; no issuers are created without either.
    #[serde(default)]
    pub acme_email: Option<String>,
}

impl Default for IngressOptions {
    fn default() -> Self {
        Self {
            namespace: default_ingress_namespace(),
            replicas: default_ingress_replicas(),
            chart_version: None,
            cert_manager: default_cert_manager(),
            cert_manager_version: default_cert_manager_version(),
            acme_email: None,
        }
    }
}

impl IngressOptions {
    /// ACME account email, falling back to `admin@<domain>` when DNS is on.
    pub fn acme_email(&self, dns: &DnsOptions) -> Option<String> {
        match &self.acme_email {
            Some(email) => Some(email.clone()),
            None if dns.is_enabled() => Some(format!("admin@{}", dns.domain.trim())),
            None => None,
        }
    }
}

fn default_ingress_namespace() -> String {
    addons::INGRESS_NAMESPACE.into()
}

fn default_ingress_replicas() -> u32 {
    addons::INGRESS_REPLICAS
}

fn default_cert_manager() -> bool {
    true
}

fn default_cert_manager_version() -> String {
    addons::CERT_MANAGER_VERSION.into()
}

fn default_argocd_namespace() -> String {
    addons::ARGOCD_NAMESPACE.into()
}

fn default_argocd_version() -> String {
    addons::ARGOCD_VERSION.into()
}

fn default_gitops_branch() -> String {
    addons::GITOPS_BRANCH.into()
}

fn default_gitops_apps_path() -> String {
    addons::GITOPS_APPS_PATH.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let options: ClusterOptions = serde_json::from_str("{}").unwrap();
        assert!(!options.bastion.enabled);
        assert_eq!(options.mesh.listen_port, 51820);
        assert_eq!(options.mesh.handshake_threshold_percent, 70);
        assert_eq!(options.kubernetes.pod_cidr, "10.42.0.0/16");
        assert_eq!(options.provisioning.install_retry.max_attempts, 3);
        assert_eq!(options.ssh.dial_retry.max_attempts, 30);
        assert!(options.validate(6).is_ok());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let options: ClusterOptions = serde_json::from_str(
            r#"{"bastion": {"enabled": true, "allowed_cidrs": ["198.51.100.0/24"]},
                "mesh": {"mtu": 1380}}"#,
        )
        .unwrap();
        assert!(options.bastion.enabled);
        assert_eq!(options.bastion.ssh_port, 22);
        assert_eq!(options.mesh.mtu, 1380);
        assert_eq!(options.mesh.interface, "wg0");
    }

    #[test]
    fn mesh_addresses_start_at_offset() {
        let mesh = MeshOptions::default();
        assert_eq!(mesh.address_for(0).unwrap(), Ipv4Addr::new(10, 8, 0, 10));
        assert_eq!(mesh.address_for(5).unwrap(), Ipv4Addr::new(10, 8, 0, 15));
        assert!(mesh.address_for(245).is_err());
    }

    #[test]
    fn validate_rejects_bad_cidr() {
        let mut options = ClusterOptions::default();
        options.bastion.enabled = true;
        options.bastion.allowed_cidrs = vec!["10.0.0.0/33".into()];
        let err = options.validate(3).unwrap_err();
        assert!(err.to_string().contains("invalid CIDR"));
    }

    #[test]
    fn validate_rejects_threshold_out_of_range() {
        let mut options = ClusterOptions::default();
        options.mesh.handshake_threshold_percent = 0;
        assert!(options.validate(3).is_err());
        options.mesh.handshake_threshold_percent = 101;
        assert!(options.validate(3).is_err());
    }

    #[test]
    fn validate_rejects_oversized_fleet() {
        let options = ClusterOptions::default();
        assert!(options.validate(245).is_ok());
        assert!(options.validate(246).is_err());
    }

    #[test]
    fn dns_placeholder_domain_is_disabled() {
        let mut dns = DnsOptions::default();
        assert!(!dns.is_enabled());
        dns.domain = "example.com".into();
        assert!(!dns.is_enabled());
        dns.domain = "k8s.internal.test".into();
        assert!(dns.is_enabled());
    }

    #[test]
    fn firewall_and_ingress_default_off() {
        let options: ClusterOptions = serde_json::from_str("{}").unwrap();
        assert!(!options.firewall.enabled);
        assert_eq!(options.firewall.ssh_sources, vec!["0.0.0.0/0".to_string()]);
        assert!(options.addons.ingress.is_none());

        let options: ClusterOptions =
            serde_json::from_str(r#"{"addons": {"ingress": {}}}"#).unwrap();
        let ingress = options.addons.ingress.unwrap();
        assert_eq!(ingress.namespace, "ingress-nginx");
        assert_eq!(ingress.replicas, 2);
        assert!(ingress.cert_manager);

        assert_eq!(ingress.acme_email(&options.dns), None);
        let dns = DnsOptions {
            domain: "cluster.example.net".into(),
        };
        assert_eq!(ingress.acme_email(&dns).as_deref(), Some("admin@cluster.example.net"));
    }

    #[test]
    fn validate_rejects_bad_firewall_sources() {
        let mut options = ClusterOptions::default();
        options.firewall.enabled = true;
        options.firewall.ssh_sources = vec!["203.0.113.0/40".into()];
        assert!(options.validate(3).is_err());

        options.firewall.ssh_sources.clear();
        assert!(options.validate(3).is_err());
        options.bastion.enabled = true;
        assert!(options.validate(3).is_ok());
    }

    #[test]
    fn parse_cidr_accepts_v4_and_v6() {
        assert_eq!(
            parse_cidr("0.0.0.0/0"),
            Some((IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
        );
        assert!(parse_cidr("2001:db8::/32").is_some());
        assert!(parse_cidr("10.0.0.1").is_none());
        assert!(parse_cidr("nonsense/8").is_none());
    }
}
