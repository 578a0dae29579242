//! Full-mesh peer assembly and `wg-quick` config rendering.

use std::fmt::Write as _;
use std::net::{Ipv4Addr, SocketAddr};

use meshkube_shared::constants::{mesh, steps};
use meshkube_shared::errors::{MeshError, MeshkubeResult};
use serde::Serialize;

use super::keys::{KeyRing, PublicKey};
use crate::node::{Node, NodeIndex};
use crate::options::MeshOptions;
use crate::remote::RemoteScript;

/// A node's place in the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeshMember {
    pub index: NodeIndex,
    pub name: String,
    pub mesh_ip: Ipv4Addr,
    pub endpoint: SocketAddr,
}

impl MeshMember {
    pub fn from_node(node: &Node, listen_port: u16) -> Self {
        Self {
            index: node.index,
            name: node.name.clone(),
            mesh_ip: node.mesh_ip,
            endpoint: SocketAddr::new(node.public_ip, listen_port),
        }
    }
}

/// One `[Peer]` entry as seen from a particular node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeshPeer {
    /// The peer, by arena index.
    pub peer: NodeIndex,
    pub name: String,
    pub public_key: PublicKey,
    pub allowed_ips: Vec<String>,
    pub endpoint: SocketAddr,
    pub keepalive_secs: u16,
}

/// Members plus their keys. Peer sets are derived, never stored.
#[derive(Debug, Clone)]
pub struct MeshPlan {
    members: Vec<MeshMember>,
    keys: KeyRing,
}

impl MeshPlan {
    /// # Errors
    ///
    /// `KeyCollection` if any member has no key in `keys`.
    pub fn new(members: Vec<MeshMember>, keys: KeyRing) -> Result<Self, MeshError> {
        if members.len() < 2 {
            return Err(MeshError::InsufficientNodes {
                count: members.len(),
            });
        }
        let missing: Vec<String> = members
            .iter()
            .filter(|m| keys.get(m.index).is_none())
            .map(|m| m.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(MeshError::KeyCollection {
                nodes: missing,
                reason: "public key not collected".into(),
            });
        }
        Ok(Self { members, keys })
    }

    pub fn members(&self) -> &[MeshMember] {
        &self.members
    }

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    /// Undirected tunnels: n·(n−1)/2.
    pub fn tunnel_count(&self) -> usize {
        tunnel_count(self.members.len())
    }

    /// Every member except `index`.
    pub fn peers_for(&self, index: NodeIndex, options: &MeshOptions) -> Vec<MeshPeer> {
        self.members
            .iter()
            .filter(|m| m.index != index)
            .filter_map(|m| {
                let public_key = self.keys.get(m.index)?.clone();
                Some(MeshPeer {
                    peer: m.index,
                    name: m.name.clone(),
                    public_key,
                    allowed_ips: vec![
                        format!("{}/32", m.mesh_ip),
                        options.peer_allowed_range.clone(),
                    ],
                    endpoint: m.endpoint,
                    keepalive_secs: options.keepalive_secs,
                })
            })
            .collect()
    }
}

pub fn tunnel_count(nodes: usize) -> usize {
    nodes * nodes.saturating_sub(1) / 2
}

/// Render the interface config for `member`. The private key stays a
/// placeholder, substituted on the node itself.
pub fn render(member: &MeshMember, peers: &[MeshPeer], options: &MeshOptions) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "# {} ({})", member.name, member.index);
    let _ = writeln!(out, "Address = {}/{}", member.mesh_ip, mesh::PREFIX_LEN);
    let _ = writeln!(out, "ListenPort = {}", options.listen_port);
    let _ = writeln!(out, "PrivateKey = {}", mesh::PRIVATE_KEY_PLACEHOLDER);
    let _ = writeln!(out, "MTU = {}", options.mtu);

    for peer in peers {
        let _ = writeln!(out);
        let _ = writeln!(out, "[Peer]");
        let _ = writeln!(out, "# {}", peer.name);
        let _ = writeln!(out, "PublicKey = {}", peer.public_key);
        let _ = writeln!(out, "AllowedIPs = {}", peer.allowed_ips.join(", "));
        let _ = writeln!(out, "Endpoint = {}", peer.endpoint);
        let _ = writeln!(out, "PersistentKeepalive = {}", peer.keepalive_secs);
    }
    out
}

/// Install the rendered config, bring the interface up, enable it at boot
/// and report the peer count the kernel actually holds.
pub fn deploy_script(config: &str, options: &MeshOptions) -> MeshkubeResult<RemoteScript> {
    if config.lines().any(|l| l.trim() == "MESHKUBE_EOF") {
        return Err(meshkube_shared::errors::MeshkubeError::Internal(
            "rendered config contains heredoc terminator".into(),
        ));
    }
    let iface = &options.interface;
    Ok(RemoteScript::new(
        steps::MESH_DEPLOY,
        format!(
            r#"set -e
umask 077
cd {dir}
cat > {iface}.conf.tmpl <<'MESHKUBE_EOF'
{config}MESHKUBE_EOF
key=$(cat privatekey)
sed "s|{placeholder}|${{key}}|" {iface}.conf.tmpl > {iface}.conf
rm -f {iface}.conf.tmpl
chmod 600 {iface}.conf
wg-quick down {iface} >/dev/null 2>&1 || true
wg-quick up {iface}
systemctl enable wg-quick@{iface} >/dev/null 2>&1
echo "PEERS|$(wg show {iface} peers | wc -l)"
"#,
            dir = mesh::CONFIG_DIR,
            placeholder = mesh::PRIVATE_KEY_PLACEHOLDER,
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::IpAddr;

    fn key(i: usize) -> PublicKey {
        use base64::Engine;
        let raw = base64::engine::general_purpose::STANDARD.encode([i as u8; 32]);
        PublicKey::parse("n", &raw).unwrap()
    }

    fn plan(n: usize) -> MeshPlan {
        let options = MeshOptions::default();
        let members: Vec<MeshMember> = (0..n)
            .map(|i| MeshMember {
                index: NodeIndex(i),
                name: format!("node-{i}"),
                mesh_ip: options.address_for(i).unwrap(),
                endpoint: SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::new(203, 0, 113, i as u8 + 1)),
                    options.listen_port,
                ),
            })
            .collect();
        let keys = KeyRing::from_keys((0..n).map(|i| (NodeIndex(i), key(i))));
        MeshPlan::new(members, keys).unwrap()
    }

    #[test]
    fn six_nodes_have_fifteen_tunnels() {
        assert_eq!(plan(6).tunnel_count(), 15);
    }

    #[test]
    fn plan_requires_every_key() {
        let options = MeshOptions::default();
        let members: Vec<MeshMember> = (0..3)
            .map(|i| MeshMember {
                index: NodeIndex(i),
                name: format!("node-{i}"),
                mesh_ip: options.address_for(i).unwrap(),
                endpoint: "203.0.113.1:51820".parse().unwrap(),
            })
            .collect();
        let keys = KeyRing::from_keys([(NodeIndex(0), key(0)), (NodeIndex(2), key(2))]);
        match MeshPlan::new(members, keys).unwrap_err() {
            MeshError::KeyCollection { nodes, .. } => assert_eq!(nodes, vec!["node-1"]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn single_node_is_not_a_mesh() {
        let options = MeshOptions::default();
        let member = MeshMember {
            index: NodeIndex(0),
            name: "solo".into(),
            mesh_ip: options.address_for(0).unwrap(),
            endpoint: "203.0.113.1:51820".parse().unwrap(),
        };
        assert!(matches!(
            MeshPlan::new(vec![member], KeyRing::default()),
            Err(MeshError::InsufficientNodes { count: 1 })
        ));
    }

    #[test]
    fn render_includes_interface_and_peers() {
        let options = MeshOptions::default();
        let plan = plan(3);
        let member = &plan.members()[0];
        let peers = plan.peers_for(member.index, &options);
        let config = render(member, &peers, &options);

        assert!(config.starts_with("[Interface]\n"));
        assert!(config.contains("Address = 10.8.0.10/24\n"));
        assert!(config.contains("ListenPort = 51820\n"));
        assert!(config.contains("PrivateKey = __MESHKUBE_PRIVATE_KEY__\n"));
        assert_eq!(config.matches("[Peer]").count(), 2);
        assert!(config.contains("AllowedIPs = 10.8.0.11/32, 10.0.0.0/8\n"));
        assert!(config.contains("Endpoint = 203.0.113.3:51820\n"));
        assert!(config.contains("PersistentKeepalive = 25\n"));
        assert!(!config.contains("AllowedIPs = 10.8.0.10/32"));
    }

    #[test]
    fn deploy_script_substitutes_key_on_node() {
        let options = MeshOptions::default();
        let script = deploy_script("[Interface]\n", &options).unwrap();
        let text = script.text();
        assert!(text.contains("key=$(cat privatekey)"));
        assert!(text.contains(r#"sed "s|__MESHKUBE_PRIVATE_KEY__|${key}|""#));
        assert!(text.contains("systemctl enable wg-quick@wg0"));
        assert!(text.contains("PEERS|$(wg show wg0 peers | wc -l)"));
    }

    proptest! {
        #[test]
        fn full_mesh_counts(n in 2usize..40) {
            let options = MeshOptions::default();
            let plan = plan(n);
            prop_assert_eq!(plan.tunnel_count(), n * (n - 1) / 2);

            let mut directed = 0;
            for member in plan.members() {
                let peers = plan.peers_for(member.index, &options);
                prop_assert_eq!(peers.len(), n - 1);
                prop_assert!(peers.iter().all(|p| p.peer != member.index));
                directed += peers.len();
            }
            prop_assert_eq!(directed, 2 * plan.tunnel_count());
        }
    }
}
