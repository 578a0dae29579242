//! Port rules per node role.

use std::fmt;

use meshkube_shared::constants::{firewall, mesh};
use serde::{Deserialize, Serialize};

use crate::cluster::Distribution;
use crate::node::Node;
use crate::options::ClusterOptions;
use crate::remote::shell_quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

/// One inbound allow rule. `ports` is a single port or a `low:high` range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub ports: String,
    pub protocol: Protocol,
    pub source: String,
    pub comment: String,
}

impl FirewallRule {
    fn new(ports: impl Into<String>, protocol: Protocol, source: &str, comment: &str) -> Self {
        Self {
            ports: ports.into(),
            protocol,
            source: source.to_string(),
            comment: comment.to_string(),
        }
    }

    /// `ufw allow ...` line for this rule.
    pub fn ufw(&self) -> String {
        let comment = shell_quote(&format!("{} {}", firewall::COMMENT_PREFIX, self.comment));
        if self.source == firewall::ANYWHERE {
            format!("ufw allow {}/{} comment {comment}", self.ports, self.protocol)
        } else {
            format!(
                "ufw allow from {} to any port {} proto {} comment {comment}",
                self.source, self.ports, self.protocol
            )
        }
    }
}

/// Everything rule selection depends on, resolved once per run.
#[derive(Debug, Clone)]
pub struct FirewallPolicy {
    pub ssh_port: u16,
    pub ssh_sources: Vec<String>,
    pub mesh_network: String,
    pub listen_port: u16,
    /// Range cluster-internal traffic comes from.
    pub internal: String,
    pub distribution: Distribution,
    pub worker_ingress: bool,
}

impl FirewallPolicy {
    /// With a bastion, SSH is reachable from the bastion only.
    pub fn new(options: &ClusterOptions, bastion: Option<&str>) -> Self {
        let ssh_sources = match bastion {
            Some(host) => vec![format!("{host}/32")],
            None => options.firewall.ssh_sources.clone(),
        };
        Self {
            ssh_port: options.ssh.port,
            ssh_sources,
            mesh_network: format!("{}/{}", options.mesh.network_base, mesh::PREFIX_LEN),
            listen_port: options.mesh.listen_port,
            internal: options.mesh.peer_allowed_range.clone(),
            distribution: options.kubernetes.distribution,
            worker_ingress: options.firewall.worker_ingress,
        }
    }

    /// Rules for `node`, by role. Masters that also schedule workloads get
    /// the master set only.
    pub fn rules_for(&self, node: &Node) -> Vec<FirewallRule> {
        use Protocol::{Tcp, Udp};

        let internal = self.internal.as_str();
        let mut rules: Vec<FirewallRule> = self
            .ssh_sources
            .iter()
            .chain(std::iter::once(&self.mesh_network))
            .map(|source| FirewallRule::new(self.ssh_port.to_string(), Tcp, source, "ssh"))
            .collect();
        rules.extend([
            FirewallRule::new(self.listen_port.to_string(), Udp, firewall::ANYWHERE, "wireguard"),
            FirewallRule::new(firewall::KUBELET, Tcp, internal, "kubelet"),
            FirewallRule::new(firewall::KUBE_PROXY, Tcp, internal, "kube-proxy health"),
            FirewallRule::new(firewall::FLANNEL_VXLAN, Udp, internal, "flannel vxlan"),
            FirewallRule::new(firewall::CANAL_BGP, Tcp, internal, "canal bgp"),
        ]);

        if node.is_master() {
            rules.extend([
                FirewallRule::new(firewall::API_SERVER, Tcp, firewall::ANYWHERE, "kube-apiserver"),
                FirewallRule::new(firewall::ETCD, Tcp, internal, "etcd"),
                FirewallRule::new(firewall::SCHEDULER, Tcp, internal, "kube-scheduler"),
                FirewallRule::new(firewall::CONTROLLER_MANAGER, Tcp, internal, "kube-controller-manager"),
            ]);
            if self.distribution == Distribution::Rke2 {
                rules.push(FirewallRule::new(
                    self.distribution.join_port().to_string(),
                    Tcp,
                    internal,
                    "rke2 supervisor",
                ));
            }
        }

        if node.is_worker() && self.worker_ingress {
            rules.extend([
                FirewallRule::new(firewall::NODE_PORTS, Tcp, firewall::ANYWHERE, "nodeports"),
                FirewallRule::new(firewall::HTTP, Tcp, firewall::ANYWHERE, "http"),
                FirewallRule::new(firewall::HTTPS, Tcp, firewall::ANYWHERE, "https"),
            ]);
        }
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeRegistry, NodeSpec, Provider, Role};
    use crate::options::MeshOptions;

    fn node(roles: &[Role]) -> Node {
        let registry = NodeRegistry::new();
        let spec = NodeSpec::new("n1", Provider::Linode, "203.0.113.5".parse().unwrap())
            .with_roles(roles.iter().copied());
        registry.register(vec![spec], &MeshOptions::default(), 1).unwrap();
        registry.snapshot().remove(0)
    }

    fn ports(rules: &[FirewallRule]) -> Vec<&str> {
        rules.iter().map(|r| r.ports.as_str()).collect()
    }

    #[test]
    fn masters_open_control_plane_ports_only_internally() {
        let policy = FirewallPolicy::new(&ClusterOptions::default(), None);
        let rules = policy.rules_for(&node(&[Role::Master]));
        let ports = ports(&rules);

        assert!(ports.contains(&"6443"));
        assert!(ports.contains(&"2379:2380"));
        assert!(!ports.contains(&"30000:32767"));
        assert!(!ports.contains(&"9345"));

        let etcd = rules.iter().find(|r| r.ports == "2379:2380").unwrap();
        assert_eq!(etcd.source, "10.0.0.0/8");
        assert_eq!(
            etcd.ufw(),
            "ufw allow from 10.0.0.0/8 to any port 2379:2380 proto tcp comment 'meshkube: etcd'"
        );
    }

    #[test]
    fn workers_open_ingress_ports() {
        let policy = FirewallPolicy::new(&ClusterOptions::default(), None);
        let rules = policy.rules_for(&node(&[Role::Worker]));
        let ports = ports(&rules);

        assert!(ports.contains(&"80"));
        assert!(ports.contains(&"443"));
        assert!(!ports.contains(&"6443"));
        let wg = rules.iter().find(|r| r.comment == "wireguard").unwrap();
        assert_eq!(wg.ufw(), "ufw allow 51820/udp comment 'meshkube: wireguard'");
    }

    #[test]
    fn bastion_replaces_ssh_sources() {
        let mut options = ClusterOptions::default();
        options.firewall.ssh_sources = vec!["0.0.0.0/0".into()];
        let policy = FirewallPolicy::new(&options, Some("198.51.100.10"));
        let ssh: Vec<_> = policy
            .rules_for(&node(&[Role::Worker]))
            .into_iter()
            .filter(|r| r.comment == "ssh")
            .map(|r| r.source)
            .collect();
        assert_eq!(ssh, vec!["198.51.100.10/32", "10.8.0.0/24"]);
    }

    #[test]
    fn rke2_masters_open_supervisor_port() {
        let mut options = ClusterOptions::default();
        options.kubernetes.distribution = Distribution::Rke2;
        let policy = FirewallPolicy::new(&options, None);
        let rules = policy.rules_for(&node(&[Role::Master, Role::Worker]));
        let ports = ports(&rules);
        assert!(ports.contains(&"9345"));
        assert!(!ports.contains(&"443"));

        options.firewall.worker_ingress = false;
        let policy = FirewallPolicy::new(&options, None);
        assert!(!policy.rules_for(&node(&[Role::Worker])).iter().any(|r| r.ports == "443"));
    }
}
