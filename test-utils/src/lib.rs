//! Test utilities for meshkube.
//!
//! [`SimulatedFleet`] stands in for both the cloud and the machines: it
//! hands out node specs as an [`Infrastructure`] and answers every remote
//! step protocol as a [`RemoteExecutor`], recording what ran where.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use meshkube::node::{NodeSpec, Provider, Role};
use meshkube::options::BastionOptions;
use meshkube::remote::{ExecOutput, RemoteExecutor, RemoteScript, RemoteTarget};
use meshkube::{Infrastructure, MeshkubeError, MeshkubeResult};
use meshkube_shared::constants::{ssh, steps};
use meshkube_shared::errors::RemoteError;
use parking_lot::Mutex;

const PROVIDERS: [Provider; 5] = [
    Provider::DigitalOcean,
    Provider::Linode,
    Provider::Aws,
    Provider::Azure,
    Provider::Gcp,
];

/// One thing the fleet saw happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    BastionCreated,
    NodesCreated,
    Script {
        node: String,
        step: String,
        /// Bastion host the connection was tunneled through.
        via: Option<String>,
    },
}

#[derive(Default)]
struct FleetState {
    events: Vec<FleetEvent>,
    dial_failures: HashSet<String>,
    step_failures: HashSet<(String, String)>,
    unreachable: HashSet<(String, String)>,
    installed: HashSet<String>,
    forwarding_off: HashSet<String>,
    installs: HashMap<String, u32>,
    firewall_rules: HashMap<String, Vec<String>>,
    peers: HashMap<String, usize>,
    joined: HashSet<String>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// In-memory multi-cloud fleet.
pub struct SimulatedFleet {
    nodes: Vec<NodeSpec>,
    bastion: Option<NodeSpec>,
    state: Mutex<FleetState>,
}

impl SimulatedFleet {
    /// `masters` nodes named `master-N` followed by `workers` named
    /// `worker-N`, spread across providers, without explicit roles.
    pub fn new(masters: usize, workers: usize) -> Self {
        let names = (1..=masters)
            .map(|i| format!("master-{i}"))
            .chain((1..=workers).map(|i| format!("worker-{i}")));
        let nodes = names
            .enumerate()
            .map(|(i, name)| {
                let ip: IpAddr = format!("203.0.113.{}", i + 11)
                    .parse()
                    .expect("valid test address");
                let mut spec = NodeSpec::new(name, PROVIDERS[i % PROVIDERS.len()], ip);
                spec.region = "test-1".into();
                spec.size = "4vcpu-8gb".into();
                spec
            })
            .collect();
        Self {
            nodes,
            bastion: None,
            state: Mutex::new(FleetState::default()),
        }
    }

    /// Same fleet, with roles carried on every spec.
    pub fn with_explicit_roles(mut self, masters: usize) -> Self {
        for (i, spec) in self.nodes.iter_mut().enumerate() {
            let role = if i < masters { Role::Master } else { Role::Worker };
            spec.roles = vec![role];
        }
        self
    }

    /// Offer a bastion host named `bastion`.
    pub fn with_bastion(mut self) -> Self {
        let ip: IpAddr = "198.51.100.10".parse().expect("valid test address");
        self.bastion = Some(NodeSpec::new("bastion", Provider::DigitalOcean, ip));
        self
    }

    /// Every connection to `node` exhausts its dial budget.
    pub fn fail_dial(self, node: &str) -> Self {
        self.state.lock().dial_failures.insert(node.to_string());
        self
    }

    /// `step` exits non-zero on `node`.
    pub fn fail_step(self, node: &str, step: &str) -> Self {
        self.state
            .lock()
            .step_failures
            .insert((node.to_string(), step.to_string()));
        self
    }

    /// Probes from `source` to `target` over the mesh fail.
    pub fn unreachable(self, source: &str, target: &str) -> Self {
        self.state
            .lock()
            .unreachable
            .insert((source.to_string(), target.to_string()));
        self
    }

    /// `node` already has every prerequisite installed.
    pub fn preinstalled(self, node: &str) -> Self {
        self.state.lock().installed.insert(node.to_string());
        self
    }

    /// Install and verify pass on `node`, but IPv4 forwarding stays off.
    pub fn reverts_forwarding(self, node: &str) -> Self {
        self.state.lock().forwarding_off.insert(node.to_string());
        self
    }

    pub fn specs(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn events(&self) -> Vec<FleetEvent> {
        self.state.lock().events.clone()
    }

    /// Steps run on `node`, in order.
    pub fn steps_on(&self, node: &str) -> Vec<String> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                FleetEvent::Script { node: n, step, .. } if n == node => Some(step.clone()),
                _ => None,
            })
            .collect()
    }

    /// Position of the first event matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&FleetEvent) -> bool) -> Option<usize> {
        self.state.lock().events.iter().position(predicate)
    }

    /// Position of the first run of `step` on `node`.
    pub fn position_of(&self, node: &str, step: &str) -> Option<usize> {
        self.position(|e| {
            matches!(e, FleetEvent::Script { node: n, step: s, .. } if n == node && s == step)
        })
    }

    /// Completed install runs on `node`.
    pub fn installs(&self, node: &str) -> u32 {
        self.state.lock().installs.get(node).copied().unwrap_or(0)
    }

    /// `ufw allow` lines last applied on `node`.
    pub fn firewall_rules(&self, node: &str) -> Vec<String> {
        self.state
            .lock()
            .firewall_rules
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    /// Highest number of concurrent runs of `step` seen.
    pub fn max_concurrency(&self, step: &str) -> usize {
        self.state.lock().max_in_flight.get(step).copied().unwrap_or(0)
    }

    fn respond(&self, node: &str, step: &str, script: &str) -> String {
        let mut state = self.state.lock();
        match step {
            steps::PROVISION_VALIDATE => {
                if state.installed.contains(node) {
                    let forwarding = if state.forwarding_off.contains(node) {
                        "CHECK|ip_forward|fail|net.ipv4.ip_forward=0"
                    } else {
                        "CHECK|ip_forward|ok|net.ipv4.ip_forward=1"
                    };
                    [
                        "CHECK|docker|ok|Docker version 24.0.7, build afdd53b",
                        "CHECK|docker-daemon|ok|active",
                        "CHECK|wireguard|ok|wireguard-tools v1.0.20210914",
                        forwarding,
                        "CHECK|overlay|ok|loaded",
                        "CHECK|br_netfilter|ok|loaded",
                        "CHECK|disk|ok|root usage 31%",
                    ]
                    .join("\n")
                } else {
                    [
                        "CHECK|docker|fail|docker: command not found",
                        "CHECK|docker-daemon|fail|inactive",
                        "CHECK|wireguard|fail|wg: command not found",
                        "CHECK|ip_forward|fail|net.ipv4.ip_forward=0",
                        "CHECK|overlay|ok|loaded",
                        "CHECK|br_netfilter|fail|not loaded",
                        "CHECK|disk|ok|root usage 12%",
                    ]
                    .join("\n")
                }
            }
            steps::PROVISION_INSTALL => {
                state.installed.insert(node.to_string());
                *state.installs.entry(node.to_string()).or_default() += 1;
                "Setting up docker-ce ...\n".into()
            }
            steps::PROVISION_VERIFY => [
                "CHECK|docker|ok|Docker version 24.0.7, build afdd53b",
                "CHECK|docker-daemon|ok|active",
                "CHECK|wireguard|ok|wireguard-tools v1.0.20210914",
            ]
            .join("\n"),
            steps::BASTION_VALIDATE => [
                "SERVICE|sshd|active",
                "SERVICE|ufw|active",
                "SERVICE|fail2ban|active",
                "SERVICE|auditd|active",
            ]
            .join("\n"),
            steps::FIREWALL_APPLY => {
                let rules: Vec<String> = script
                    .lines()
                    .filter(|l| l.starts_with("ufw allow") && l.contains("meshkube:"))
                    .map(str::to_string)
                    .collect();
                let out = format!("Firewall is active and enabled on system startup\nFIREWALL|active|{}\n", rules.len());
                state.firewall_rules.insert(node.to_string(), rules);
                out
            }
            steps::MESH_KEYGEN => public_key(node),
            steps::MESH_DEPLOY => {
                let peers = script.matches("[Peer]").count();
                state.peers.insert(node.to_string(), peers);
                format!("PEERS|{peers}\n")
            }
            steps::MESH_HANDSHAKES => {
                let peers = state.peers.get(node).copied().unwrap_or(0);
                (0..peers)
                    .map(|i| format!("peer{i}=\t{}\n", 1_700_000_000 + i))
                    .collect()
            }
            steps::MESH_PING => probed_names(script)
                .into_iter()
                .map(|target| {
                    let ok = !state.unreachable.contains(&(node.to_string(), target.clone()));
                    format!("PING|{target}|{}\n", if ok { "ok" } else { "fail" })
                })
                .collect(),
            steps::CLUSTER_LEADER_INIT | steps::CLUSTER_JOIN => {
                state.joined.insert(node.to_string());
                String::new()
            }
            steps::CLUSTER_API_READY => "ok".into(),
            steps::CLUSTER_TOKEN => "TOKEN|K10simulated::server:0123456789abcdef\n".into(),
            steps::CLUSTER_KUBECONFIG => KUBECONFIG.into(),
            steps::ADDON_INGRESS => {
                let mut out = String::from("Release \"ingress-nginx\" has been upgraded. Happy Helming!\nADDON|ingress-nginx|ready\n");
                if script.contains("jetstack/cert-manager") {
                    out.push_str("ADDON|cert-manager|ready\n");
                }
                out
            }
            steps::CLUSTER_NODE_STATUS => match status_subject(script) {
                Some(name) if state.joined.contains(&name) => format!("NODE|{name}|True|\n"),
                Some(name) => format!("NODE|{name}|Unknown|\n"),
                None => String::new(),
            },
            _ => String::new(),
        }
    }

    fn enter(&self, step: &str) {
        let mut state = self.state.lock();
        let in_flight = state.in_flight.entry(step.to_string()).or_default();
        *in_flight += 1;
        let now = *in_flight;
        let max = state.max_in_flight.entry(step.to_string()).or_default();
        *max = (*max).max(now);
    }

    fn leave(&self, step: &str) {
        if let Some(in_flight) = self.state.lock().in_flight.get_mut(step) {
            *in_flight = in_flight.saturating_sub(1);
        }
    }
}

const KUBECONFIG: &str = "apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: LS0tLS1CRUdJTg==
    server: https://127.0.0.1:6443
  name: default
contexts:
- context:
    cluster: default
    user: default
  name: default
current-context: default
kind: Config
";

/// Deterministic, distinct WireGuard-shaped key for `node`.
pub fn public_key(node: &str) -> String {
    let mut bytes = [0u8; 32];
    for (slot, b) in bytes.iter_mut().zip(node.bytes()) {
        *slot = b;
    }
    STANDARD.encode(bytes)
}

/// Targets of `probe '<name>' <ip> &` lines.
fn probed_names(script: &str) -> Vec<String> {
    script
        .lines()
        .filter_map(|line| line.trim().strip_prefix("probe '"))
        .filter_map(|rest| rest.split_once('\''))
        .map(|(name, _)| name.to_string())
        .collect()
}

/// Node named by an `echo "NODE|<name>|...` line.
fn status_subject(script: &str) -> Option<String> {
    let (_, rest) = script.split_once("\"NODE|")?;
    rest.split_once('|').map(|(name, _)| name.to_string())
}

#[async_trait]
impl RemoteExecutor for SimulatedFleet {
    async fn run(
        &self,
        target: &RemoteTarget,
        script: &RemoteScript,
        _timeout: Duration,
    ) -> Result<ExecOutput, RemoteError> {
        let node = target.node.clone();
        let step = script.step();
        {
            let mut state = self.state.lock();
            state.events.push(FleetEvent::Script {
                node: node.clone(),
                step: step.to_string(),
                via: target.proxy.as_ref().map(|p| p.host.clone()),
            });
            if state.dial_failures.contains(&node) {
                return Err(RemoteError::DialTimeout {
                    node,
                    host: target.host.clone(),
                    attempts: ssh::DIAL_RETRY_LIMIT,
                    last: format!("ssh: connect to host {} port {}: Connection timed out", target.host, target.port),
                });
            }
        }

        self.enter(step);
        tokio::task::yield_now().await;
        self.leave(step);

        if self
            .state
            .lock()
            .step_failures
            .contains(&(node.clone(), step.to_string()))
        {
            return Err(RemoteError::ScriptFailed {
                node,
                host: target.host.clone(),
                step: step.to_string(),
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("simulated failure of {step}"),
            });
        }

        Ok(ExecOutput::stdout(self.respond(&node, step, script.text())))
    }
}

#[async_trait]
impl Infrastructure for SimulatedFleet {
    async fn create_bastion(&self, options: &BastionOptions) -> MeshkubeResult<NodeSpec> {
        self.state.lock().events.push(FleetEvent::BastionCreated);
        self.bastion.clone().ok_or_else(|| {
            MeshkubeError::Infrastructure(format!("no capacity for bastion '{}'", options.name))
        })
    }

    async fn create_nodes(&self) -> MeshkubeResult<Vec<NodeSpec>> {
        self.state.lock().events.push(FleetEvent::NodesCreated);
        Ok(self.nodes.clone())
    }
}

/// Statuses keyed by node name, for compact assertions.
pub fn count_by_status<S: Ord + Clone>(statuses: &BTreeMap<String, S>) -> BTreeMap<S, usize> {
    let mut counts = BTreeMap::new();
    for status in statuses.values() {
        *counts.entry(status.clone()).or_default() += 1;
    }
    counts
}
