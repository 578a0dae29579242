//! Control plane and join scripts.
//!
//! Every install is driven by `<config_dir>/config.yaml`; flags never appear
//! on a command line, which keeps the join token out of process listings.

use std::fmt::Write as _;

use meshkube_shared::constants::steps;

use super::Distribution;
use crate::node::Node;
use crate::options::KubernetesOptions;
use crate::remote::{RemoteScript, shell_quote};

/// Settings shared by every server (leader and joining masters).
fn server_settings(out: &mut String, node: &Node, options: &KubernetesOptions) {
    let _ = writeln!(out, "advertise-address: \"{}\"", node.mesh_ip);
    let _ = writeln!(out, "tls-san:");
    let _ = writeln!(out, "  - \"{}\"", node.mesh_ip);
    let _ = writeln!(out, "  - \"{}\"", node.public_ip);
    for san in &options.tls_sans {
        let _ = writeln!(out, "  - \"{san}\"");
    }
    let _ = writeln!(out, "cluster-cidr: \"{}\"", options.pod_cidr);
    let _ = writeln!(out, "service-cidr: \"{}\"", options.service_cidr);
    let _ = writeln!(out, "cluster-dns: \"{}\"", options.cluster_dns);
    if options.distribution == Distribution::K3s {
        let _ = writeln!(out, "disable:");
        let _ = writeln!(out, "  - traefik");
    }
}

/// `config.yaml` for `node`.
///
/// `join` is the leader's registration URL plus token; `None` renders the
/// leader's own config.
pub fn render_config(
    node: &Node,
    server: bool,
    join: Option<(&str, &str)>,
    options: &KubernetesOptions,
    mesh_interface: &str,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "node-name: \"{}\"", node.name);
    let _ = writeln!(out, "node-ip: \"{}\"", node.mesh_ip);
    if options.distribution == Distribution::K3s {
        let _ = writeln!(out, "flannel-iface: \"{mesh_interface}\"");
    }
    if server {
        server_settings(&mut out, node, options);
    }
    match join {
        Some((url, token)) => {
            let _ = writeln!(out, "server: \"{url}\"");
            let _ = writeln!(out, "token: \"{token}\"");
        }
        None => {
            if options.distribution == Distribution::K3s {
                let _ = writeln!(out, "cluster-init: true");
            }
            if let Some(token) = &options.token {
                let _ = writeln!(out, "token: \"{token}\"");
            }
        }
    }
    out
}

/// RKE2 runs canal; its flannel backend is pinned to the mesh interface
/// through a HelmChartConfig on every server.
fn canal_override(mesh_interface: &str) -> String {
    format!(
        r#"mkdir -p /var/lib/rancher/rke2/server/manifests
cat > /var/lib/rancher/rke2/server/manifests/rke2-canal-config.yaml <<'MESHKUBE_EOF'
apiVersion: helm.cattle.io/v1
kind: HelmChartConfig
metadata:
  name: rke2-canal
  namespace: kube-system
spec:
  valuesContent: |-
    flannel:
      iface: "{mesh_interface}"
MESHKUBE_EOF
"#
    )
}

fn install(
    step: &'static str,
    server: bool,
    config: &str,
    options: &KubernetesOptions,
    mesh_interface: &str,
    preamble: &str,
) -> RemoteScript {
    let dist = options.distribution;
    let service = if server {
        dist.server_service()
    } else {
        dist.agent_service()
    };
    let canal = if server && dist == Distribution::Rke2 {
        canal_override(mesh_interface)
    } else {
        String::new()
    };
    RemoteScript::new(
        step,
        format!(
            r#"set -e
{preamble}
umask 077
mkdir -p {config_dir}
cat > {config_dir}/config.yaml <<'MESHKUBE_EOF'
{config}MESHKUBE_EOF
{canal}
if ! command -v {binary} >/dev/null 2>&1; then
  {install}
fi
systemctl enable --now {service}
echo "{service} started"
"#,
            config_dir = dist.config_dir(),
            binary = dist.as_str(),
            install = dist.install_command(server),
        ),
    )
}

/// Write the leader config, install the server and start it.
pub fn leader_init(node: &Node, options: &KubernetesOptions, mesh_interface: &str) -> RemoteScript {
    let config = render_config(node, true, None, options, mesh_interface);
    install(
        steps::CLUSTER_LEADER_INIT,
        true,
        &config,
        options,
        mesh_interface,
        "",
    )
}

/// Wait for the own mesh interface and the leader's registration port, then
/// install and start with the shared token.
pub fn join(
    node: &Node,
    leader: &Node,
    token: &str,
    options: &KubernetesOptions,
    mesh_interface: &str,
) -> RemoteScript {
    let server = node.is_master();
    let port = options.distribution.join_port();
    let url = format!("https://{}:{port}", leader.mesh_ip);
    let config = render_config(node, server, Some((&url, token)), options, mesh_interface);
    let preamble = format!(
        r#"deadline=$((SECONDS + {mesh_wait}))
until ip link show {iface} >/dev/null 2>&1; do
  if [ "$SECONDS" -ge "$deadline" ]; then
    echo "mesh interface {iface} not up after {mesh_wait}s" >&2
    exit 1
  fi
  sleep {poll}
done
deadline=$((SECONDS + {port_wait}))
until timeout 3 bash -c "</dev/tcp/{leader}/{port}" 2>/dev/null; do
  if [ "$SECONDS" -ge "$deadline" ]; then
    echo "leader {leader}:{port} unreachable after {port_wait}s" >&2
    exit 1
  fi
  sleep {poll}
done"#,
        mesh_wait = options.follower_mesh_wait_secs,
        port_wait = options.leader_port_wait_secs,
        poll = options.poll_secs.max(1),
        iface = mesh_interface,
        leader = leader.mesh_ip,
    );
    install(
        steps::CLUSTER_JOIN,
        server,
        &config,
        options,
        mesh_interface,
        &preamble,
    )
}

/// Succeeds once the local API server answers its readiness endpoint.
pub fn api_ready(options: &KubernetesOptions) -> RemoteScript {
    RemoteScript::new(
        steps::CLUSTER_API_READY,
        format!("{} get --raw=/readyz\n", options.distribution.kubectl()),
    )
}

/// Wait for the node token and print it as `TOKEN|<token>`.
pub fn fetch_token(options: &KubernetesOptions) -> RemoteScript {
    let path = options.distribution.token_path();
    RemoteScript::new(
        steps::CLUSTER_TOKEN,
        format!(
            r#"deadline=$((SECONDS + {wait}))
until [ -s {path} ]; do
  if [ "$SECONDS" -ge "$deadline" ]; then
    echo "{path} missing after {wait}s" >&2
    exit 1
  fi
  sleep {poll}
done
echo "TOKEN|$(cat {path})"
"#,
            wait = options.token_wait_secs,
            poll = options.poll_secs.max(1),
        ),
    )
}

pub fn fetch_kubeconfig(options: &KubernetesOptions) -> RemoteScript {
    RemoteScript::new(
        steps::CLUSTER_KUBECONFIG,
        format!("cat {}\n", options.distribution.kubeconfig_path()),
    )
}

/// Report `NODE|<name>|<Ready status>|<unschedulable>` for `name`, run on
/// the leader.
pub fn node_status(name: &str, options: &KubernetesOptions) -> RemoteScript {
    let jsonpath = r#"{range .status.conditions[?(@.type=="Ready")]}{.status}{end}|{.spec.unschedulable}"#;
    RemoteScript::new(
        steps::CLUSTER_NODE_STATUS,
        format!(
            "out=$({kubectl} get node {node} -o jsonpath={jsonpath} 2>/dev/null || true)\n\
             echo \"NODE|{name}|${{out:-Unknown|}}\"\n",
            kubectl = options.distribution.kubectl(),
            node = shell_quote(name),
            jsonpath = shell_quote(jsonpath),
        ),
    )
}
