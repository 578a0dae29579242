//! Shared constants
//!
//! Defaults and remote protocol markers. Both the pipeline and simulated
//! executors read these, so they must stay in one place.

/// Remote step markers.
///
/// Every script sent to a machine starts with `# meshkube-step: <step>`.
pub mod steps {
    /// Prefix of the marker line carried by every remote script
    pub const MARKER_PREFIX: &str = "# meshkube-step: ";

    pub const CLOUD_INIT_WAIT: &str = "host.cloud-init-wait";

    pub const PROVISION_LOCK_WAIT: &str = "provision.lock-wait";
    pub const PROVISION_INSTALL: &str = "provision.install";
    pub const PROVISION_VERIFY: &str = "provision.verify";
    pub const PROVISION_VALIDATE: &str = "provision.validate";

    pub const BASTION_HARDEN: &str = "bastion.harden";
    pub const BASTION_VALIDATE: &str = "bastion.validate";

    pub const MESH_KEYGEN: &str = "mesh.keygen";
    pub const MESH_DEPLOY: &str = "mesh.deploy";
    pub const MESH_HANDSHAKES: &str = "mesh.handshakes";
    pub const MESH_PING: &str = "mesh.ping";

    pub const CLUSTER_LEADER_INIT: &str = "cluster.leader-init";
    pub const CLUSTER_API_READY: &str = "cluster.api-ready";
    pub const CLUSTER_TOKEN: &str = "cluster.token";
    pub const CLUSTER_KUBECONFIG: &str = "cluster.kubeconfig";
    pub const CLUSTER_JOIN: &str = "cluster.join";
    pub const CLUSTER_NODE_STATUS: &str = "cluster.node-status";

    pub const FIREWALL_APPLY: &str = "firewall.apply";

    pub const ADDON_GITOPS: &str = "addons.gitops";
    pub const ADDON_INGRESS: &str = "addons.ingress";
}

/// Line prefixes of the structured output remote scripts print.
pub mod protocol {
    /// `CHECK|<name>|ok|<detail>` or `CHECK|<name>|fail|<detail>`
    pub const CHECK: &str = "CHECK";
    /// `SERVICE|<name>|<systemctl state>`
    pub const SERVICE: &str = "SERVICE";
    /// `PEERS|<count>`
    pub const PEERS: &str = "PEERS";
    /// `PING|<target>|ok` or `PING|<target>|fail`
    pub const PING: &str = "PING";
    /// `NODE|<name>|<ready>|<unschedulable>`
    pub const NODE: &str = "NODE";
    /// `TOKEN|<token>`
    pub const TOKEN: &str = "TOKEN";
    /// Marker printed when the apt lock had to be forcibly cleared
    pub const LOCK_FORCED: &str = "LOCK_FORCED";
    /// Marker printed when every prerequisite is already present
    pub const ALREADY_INSTALLED: &str = "ALREADY_INSTALLED";
    /// `FIREWALL|<ufw state>|<meshkube rules present>`
    pub const FIREWALL: &str = "FIREWALL";
    /// `ADDON|<component>|<ready or not-ready>`
    pub const ADDON: &str = "ADDON";
}

/// SSH transport constants
pub mod ssh {
    /// Default SSH port for cluster nodes
    pub const PORT: u16 = 22;

    /// Exit status `ssh` reserves for its own connection failures
    pub const DIAL_FAILURE_EXIT_CODE: i32 = 255;

    /// Dial attempts before a node is declared unreachable.
    /// New VMs can take several minutes to accept connections.
    pub const DIAL_RETRY_LIMIT: u32 = 30;

    /// Base delay between dial attempts, in seconds
    pub const DIAL_BASE_DELAY_SECS: u64 = 2;

    /// Upper bound for a single dial backoff delay, in seconds
    pub const DIAL_MAX_DELAY_SECS: u64 = 10;

    /// Per-attempt TCP connect timeout, in seconds
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;

    /// Timeout for long mutating scripts (package installs), in seconds
    pub const INSTALL_TIMEOUT_SECS: u64 = 15 * 60;

    /// Timeout for read-only validation scripts, in seconds
    pub const VALIDATE_TIMEOUT_SECS: u64 = 3 * 60;

    /// Default private key location relative to the home directory
    pub const DEFAULT_IDENTITY: &str = ".ssh/id_rsa";
}

/// WireGuard mesh constants
pub mod mesh {
    pub const INTERFACE: &str = "wg0";

    /// First three octets of the mesh network; nodes get `.(offset + index)`
    pub const NETWORK_BASE: [u8; 4] = [10, 8, 0, 0];

    /// Host part of the first node's mesh address
    pub const HOST_OFFSET: u8 = 10;

    pub const PREFIX_LEN: u8 = 24;

    pub const LISTEN_PORT: u16 = 51820;

    pub const MTU: u16 = 1420;

    pub const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

    /// Range routed through every peer in addition to its own /32
    pub const PEER_ALLOWED_RANGE: &str = "10.0.0.0/8";

    /// Minimum share of peers with a completed handshake, in percent
    pub const HANDSHAKE_THRESHOLD_PERCENT: u8 = 70;

    pub const HANDSHAKE_WAIT_SECS: u64 = 120;

    pub const HANDSHAKE_POLL_SECS: u64 = 5;

    pub const PING_COUNT: u32 = 2;

    pub const PING_TIMEOUT_SECS: u32 = 10;

    pub const CONFIG_DIR: &str = "/etc/wireguard";

    /// Substituted with the on-node private key before activation
    pub const PRIVATE_KEY_PLACEHOLDER: &str = "__MESHKUBE_PRIVATE_KEY__";

    /// Length of a decoded Curve25519 key
    pub const KEY_LEN: usize = 32;
}

/// Node preparation constants
pub mod provision {
    pub const LOCK_WAIT_SECS: u64 = 300;

    pub const LOCK_POLL_SECS: u64 = 5;

    /// Lock script exit status when the lock survived forced recovery
    pub const LOCK_HELD_EXIT_CODE: i32 = 75;

    pub const LOCK_FILES: &[&str] = &[
        "/var/lib/dpkg/lock-frontend",
        "/var/lib/dpkg/lock",
        "/var/lib/apt/lists/lock",
        "/var/cache/apt/archives/lock",
    ];

    pub const INSTALL_ATTEMPTS: u32 = 3;

    pub const INSTALL_BASE_DELAY_SECS: u64 = 30;

    pub const INSTALL_MAX_DELAY_SECS: u64 = 120;

    pub const CLOUD_INIT_WAIT_SECS: u64 = 600;

    /// Root filesystem usage above this percentage fails validation
    pub const DISK_USAGE_CEILING_PERCENT: u8 = 90;

    pub const KERNEL_MODULES: &[&str] = &["overlay", "br_netfilter"];
}

/// Bastion hardening defaults
pub mod bastion {
    pub const SSH_PORT: u16 = 22;

    pub const OPEN_CIDR: &str = "0.0.0.0/0";

    pub const IDLE_TIMEOUT_MINUTES: u32 = 30;

    pub const MAX_SESSIONS: u32 = 10;

    pub const CLIENT_ALIVE_INTERVAL_SECS: u32 = 60;

    pub const FAIL2BAN_BANTIME_SECS: u32 = 3600;

    pub const FAIL2BAN_FINDTIME_SECS: u32 = 600;

    pub const FAIL2BAN_MAXRETRY: u32 = 5;

    pub const FAIL2BAN_SSHD_MAXRETRY: u32 = 3;

    pub const SSHD_DROPIN: &str = "/etc/ssh/sshd_config.d/99-meshkube-bastion.conf";
}

/// Kubernetes bootstrap constants
pub mod cluster {
    pub const API_PORT: u16 = 6443;

    /// RKE2 agents register against the supervisor port, not the API port
    pub const RKE2_SUPERVISOR_PORT: u16 = 9345;

    pub const POD_CIDR: &str = "10.42.0.0/16";

    pub const SERVICE_CIDR: &str = "10.43.0.0/16";

    pub const CLUSTER_DNS: &str = "10.43.0.10";

    pub const LEADER_API_WAIT_SECS: u64 = 180;

    pub const TOKEN_WAIT_SECS: u64 = 120;

    pub const FOLLOWER_MESH_WAIT_SECS: u64 = 60;

    pub const LEADER_PORT_WAIT_SECS: u64 = 300;

    pub const NODE_READY_WAIT_SECS: u64 = 180;

    pub const POLL_SECS: u64 = 5;

    /// Hosts the distributions write into the local kubeconfig
    pub const LOOPBACK_SERVERS: &[&str] = &["127.0.0.1", "0.0.0.0", "localhost"];
}

/// Per-node host firewall
pub mod firewall {
    /// Prefix of every rule comment; counts rules owned by meshkube
    pub const COMMENT_PREFIX: &str = "meshkube:";

    pub const ANYWHERE: &str = "0.0.0.0/0";

    pub const API_SERVER: &str = "6443";
    pub const ETCD: &str = "2379:2380";
    pub const SCHEDULER: &str = "10259";
    pub const CONTROLLER_MANAGER: &str = "10257";
    pub const KUBELET: &str = "10250";
    pub const KUBE_PROXY: &str = "10256";
    pub const FLANNEL_VXLAN: &str = "8472";
    pub const CANAL_BGP: &str = "179";
    pub const NODE_PORTS: &str = "30000:32767";
    pub const HTTP: &str = "80";
    pub const HTTPS: &str = "443";
}

/// Optional post-bootstrap addons
pub mod addons {
    pub const ARGOCD_NAMESPACE: &str = "argocd";

    pub const ARGOCD_VERSION: &str = "stable";

    pub const GITOPS_BRANCH: &str = "main";

    pub const GITOPS_APPS_PATH: &str = "argocd/apps";

    pub const ARGOCD_READY_WAIT_SECS: u64 = 300;

    /// Domain used by sample configs; records are never created for it
    pub const PLACEHOLDER_DOMAIN: &str = "example.com";

    pub const API_RECORD: &str = "api";

    pub const INGRESS_NAMESPACE: &str = "ingress-nginx";

    pub const INGRESS_REPLICAS: u32 = 2;

    pub const CERT_MANAGER_NAMESPACE: &str = "cert-manager";

    pub const CERT_MANAGER_VERSION: &str = "v1.13.0";

    pub const HELM_INSTALL_URL: &str =
        "https://raw.githubusercontent.com/helm/helm/main/scripts/get-helm-3";

    pub const INGRESS_READY_WAIT_SECS: u64 = 600;
}

/// Names of the orchestrator's phases, in dependency order
pub mod phases {
    pub const BASTION: &str = "bastion";
    pub const NODES_CREATE: &str = "nodes.create";
    pub const NODES_PROVISION: &str = "nodes.provision";
    pub const NODES_FIREWALL: &str = "nodes.firewall";
    pub const MESH_BUILD: &str = "mesh.build";
    pub const MESH_VALIDATE: &str = "mesh.validate";
    pub const CLUSTER_BOOTSTRAP: &str = "cluster.bootstrap";
    pub const DNS: &str = "dns";
    pub const ADDONS_GITOPS: &str = "addons.gitops";
    pub const ADDONS_INGRESS: &str = "addons.ingress";

    /// Reported when options are rejected before any phase runs
    pub const CONFIG: &str = "config";
}
