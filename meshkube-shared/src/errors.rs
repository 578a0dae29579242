//! Hierarchical error types for the provisioning pipeline.
//!
//! Errors are grouped by the component that raises them:
//! - [`RemoteError`]: SSH transport and script execution
//! - [`ProvisionError`]: node preparation (locks, installs, validation)
//! - [`BastionError`]: jump host hardening and validation
//! - [`MeshError`]: WireGuard key exchange and mesh gating
//! - [`ClusterError`]: control plane and join protocol
//!
//! A failed phase wraps its cause in [`MeshkubeError::Phase`], which carries
//! the implicated nodes and the last diagnostic output.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across meshkube.
pub type MeshkubeResult<T> = Result<T, MeshkubeError>;

// ============================================================================
// Top-Level Error
// ============================================================================

/// Errors that can occur while provisioning and bootstrapping a cluster.
///
/// ```ignore
/// match provisioner.provision(&target).await {
///     Err(MeshkubeError::Remote(e)) if e.is_dial_failure() => { /* node unreachable */ }
///     Err(MeshkubeError::Provision(_)) => { /* node stays Failed */ }
///     _ => {}
/// }
/// ```
#[derive(Debug, Error)]
pub enum MeshkubeError {
    #[error("remote: {0}")]
    Remote(#[from] RemoteError),

    #[error("provision: {0}")]
    Provision(#[from] ProvisionError),

    #[error("bastion: {0}")]
    Bastion(#[from] BastionError),

    #[error("mesh: {0}")]
    Mesh(#[from] MeshError),

    #[error("cluster: {0}")]
    Cluster(#[from] ClusterError),

    /// Invalid options (user-fixable).
    #[error("config: {0}")]
    Config(String),

    /// External collaborator (infrastructure, DNS) failure.
    #[error("infrastructure: {0}")]
    Infrastructure(String),

    /// Illegal state transition or phase graph violation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Work abandoned because a sibling failed fatally.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal: {0}")]
    Internal(String),

    /// A fatal phase failure, as surfaced to the caller.
    #[error("phase '{phase}' failed: {source}")]
    Phase {
        phase: String,
        nodes: Vec<String>,
        diagnostic: String,
        #[source]
        source: Box<MeshkubeError>,
    },
}

impl MeshkubeError {
    /// Wrap an error as the fatal failure of `phase`.
    ///
    /// Implicated nodes and diagnostics are lifted from the cause so the
    /// caller does not have to dig through the source chain.
    pub fn phase(phase: impl Into<String>, source: MeshkubeError) -> Self {
        if let MeshkubeError::Phase { .. } = source {
            return source;
        }
        MeshkubeError::Phase {
            phase: phase.into(),
            nodes: source.implicated_nodes(),
            diagnostic: source.diagnostic().unwrap_or_default(),
            source: Box::new(source),
        }
    }

    /// Names of the nodes this error is about, if any.
    pub fn implicated_nodes(&self) -> Vec<String> {
        match self {
            MeshkubeError::Remote(e) => vec![e.node().to_string()],
            MeshkubeError::Provision(e) => vec![e.node().to_string()],
            MeshkubeError::Bastion(e) => vec![e.host().to_string()],
            MeshkubeError::Mesh(e) => e.nodes(),
            MeshkubeError::Cluster(e) => e.nodes(),
            MeshkubeError::Phase { nodes, .. } => nodes.clone(),
            _ => Vec::new(),
        }
    }

    /// Last captured remote output or rendered matrix, if any.
    pub fn diagnostic(&self) -> Option<String> {
        let text = match self {
            MeshkubeError::Remote(e) => e.output().map(str::to_string),
            MeshkubeError::Provision(ProvisionError::InstallFailed { diagnostic, .. }) => {
                Some(diagnostic.clone())
            }
            MeshkubeError::Provision(ProvisionError::ValidationFailed { output, .. })
            | MeshkubeError::Provision(ProvisionError::Firewall { output, .. }) => {
                Some(output.clone())
            }
            MeshkubeError::Provision(ProvisionError::Remote { source, .. }) => {
                source.output().map(str::to_string)
            }
            MeshkubeError::Bastion(BastionError::Validate { output, .. }) => Some(output.clone()),
            MeshkubeError::Bastion(BastionError::Harden { source, .. }) => source.diagnostic(),
            MeshkubeError::Mesh(MeshError::HandshakeThresholdUnmet { dump, .. }) => {
                Some(dump.clone())
            }
            MeshkubeError::Mesh(MeshError::Unreachable { matrix, .. })
            | MeshkubeError::Mesh(MeshError::ReadinessGate { matrix, .. }) => Some(matrix.clone()),
            MeshkubeError::Cluster(ClusterError::LeaderInit { source, .. })
            | MeshkubeError::Cluster(ClusterError::Token { source, .. }) => source.diagnostic(),
            MeshkubeError::Cluster(ClusterError::ApiNotReady { last_output, .. }) => {
                Some(last_output.clone())
            }
            MeshkubeError::Phase { diagnostic, .. } => Some(diagnostic.clone()),
            _ => None,
        };
        text.filter(|t| !t.trim().is_empty())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, MeshkubeError::Cancelled(_))
    }

    /// Dial timeouts and package manager lock contention clear up on their
    /// own; everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            MeshkubeError::Remote(e) => e.is_transient(),
            MeshkubeError::Provision(e) => e.is_transient(),
            MeshkubeError::Phase { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

// ============================================================================
// Remote Errors (SSH transport, script execution)
// ============================================================================

/// Errors from running a script on a remote machine.
///
/// Only `DialTimeout` is produced by transport retries running out; a
/// script that runs and fails is reported once as `ScriptFailed`.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// SSH connection could not be established within the dial budget.
    #[error("{node} ({host}): ssh dial failed after {attempts} attempt(s): {last}")]
    DialTimeout {
        node: String,
        host: String,
        attempts: u32,
        last: String,
    },

    /// Script ran and exited non-zero.
    #[error("{node} ({host}): step {step} exited with {exit_code}")]
    ScriptFailed {
        node: String,
        host: String,
        step: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// Script did not finish within its timeout.
    #[error("{node} ({host}): step {step} timed out after {after:?}")]
    Timeout {
        node: String,
        host: String,
        step: String,
        after: Duration,
    },

    /// The local ssh client could not be started.
    #[error("{node}: failed to spawn ssh: {source}")]
    Spawn {
        node: String,
        #[source]
        source: std::io::Error,
    },

    /// Script succeeded but printed something we cannot interpret.
    #[error("{node}: step {step} produced unexpected output: {detail}")]
    Protocol {
        node: String,
        step: String,
        detail: String,
    },
}

impl RemoteError {
    pub fn node(&self) -> &str {
        match self {
            RemoteError::DialTimeout { node, .. }
            | RemoteError::ScriptFailed { node, .. }
            | RemoteError::Timeout { node, .. }
            | RemoteError::Spawn { node, .. }
            | RemoteError::Protocol { node, .. } => node,
        }
    }

    /// Captured output for diagnostics (stdout then stderr).
    pub fn output(&self) -> Option<&str> {
        match self {
            RemoteError::ScriptFailed { stdout, stderr, .. } => {
                if stderr.trim().is_empty() {
                    Some(stdout)
                } else {
                    Some(stderr)
                }
            }
            RemoteError::DialTimeout { last, .. } => Some(last),
            _ => None,
        }
    }

    pub fn is_dial_failure(&self) -> bool {
        matches!(self, RemoteError::DialTimeout { .. })
    }

    pub fn is_transient(&self) -> bool {
        self.is_dial_failure()
    }
}

// ============================================================================
// Provision Errors
// ============================================================================

/// Errors while preparing a node's operating system.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Package manager lock still held after the wait and forced recovery.
    #[error("{node}: package manager lock still held after {waited:?} and recovery")]
    LockTimeout { node: String, waited: Duration },

    /// Every install attempt failed.
    #[error("{node}: install failed after {attempts} attempt(s): {last}")]
    InstallFailed {
        node: String,
        attempts: u32,
        last: String,
        diagnostic: String,
    },

    /// Installed prerequisites could not be independently verified.
    #[error("{node}: validation failed: {}", failed.join(", "))]
    ValidationFailed {
        node: String,
        failed: Vec<String>,
        output: String,
    },

    /// Host firewall did not end up enabled with every rule in place.
    #[error("{node}: firewall: {reason}")]
    Firewall {
        node: String,
        reason: String,
        output: String,
    },

    /// Transport failure that retrying the install cannot fix.
    #[error("{node}: {source}")]
    Remote {
        node: String,
        #[source]
        source: RemoteError,
    },
}

impl ProvisionError {
    pub fn node(&self) -> &str {
        match self {
            ProvisionError::LockTimeout { node, .. }
            | ProvisionError::InstallFailed { node, .. }
            | ProvisionError::ValidationFailed { node, .. }
            | ProvisionError::Firewall { node, .. }
            | ProvisionError::Remote { node, .. } => node,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            ProvisionError::LockTimeout { .. } => true,
            ProvisionError::Remote { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

// ============================================================================
// Bastion Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum BastionError {
    /// Infrastructure did not hand back a usable bastion host.
    #[error("{host}: create: {reason}")]
    Create { host: String, reason: String },

    #[error("{host}: hardening failed: {source}")]
    Harden {
        host: String,
        #[source]
        source: Box<MeshkubeError>,
    },

    /// Post-hardening round trip found inactive services.
    #[error("{host}: validation failed: {}", failed.join(", "))]
    Validate {
        host: String,
        failed: Vec<String>,
        output: String,
    },
}

impl BastionError {
    pub fn host(&self) -> &str {
        match self {
            BastionError::Create { host, .. }
            | BastionError::Harden { host, .. }
            | BastionError::Validate { host, .. } => host,
        }
    }
}

// ============================================================================
// Mesh Errors
// ============================================================================

/// Per-node handshake count that fell short of the threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeShortfall {
    pub node: String,
    pub active: usize,
    pub total: usize,
}

impl std::fmt::Display for HandshakeShortfall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}/{})", self.node, self.active, self.total)
    }
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("full mesh needs at least 2 nodes, got {count}")]
    InsufficientNodes { count: usize },

    /// Key generation barrier could not be met.
    #[error("public keys missing for {}: {reason}", nodes.join(", "))]
    KeyCollection { nodes: Vec<String>, reason: String },

    #[error("{node}: invalid WireGuard public key {key:?}")]
    InvalidKey { node: String, key: String },

    #[error(
        "handshake threshold {threshold_percent}% unmet on {}",
        lagging.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    )]
    HandshakeThresholdUnmet {
        threshold_percent: u8,
        lagging: Vec<HandshakeShortfall>,
        /// `wg show` output of the lagging nodes at the last poll.
        dump: String,
    },

    /// All-pairs reachability failed; every failing pair is listed.
    #[error(
        "{} unreachable pair(s): {}",
        pairs.len(),
        pairs.iter().map(|(s, t)| format!("{s}->{t}")).collect::<Vec<_>>().join(", ")
    )]
    Unreachable {
        pairs: Vec<(String, String)>,
        matrix: String,
    },

    /// Kubernetes readiness requirement not satisfied by the matrix.
    #[error("{requirement}: {} pair(s) failing", pairs.len())]
    ReadinessGate {
        requirement: String,
        pairs: Vec<(String, String)>,
        matrix: String,
    },
}

impl MeshError {
    fn nodes(&self) -> Vec<String> {
        match self {
            MeshError::InsufficientNodes { .. } => Vec::new(),
            MeshError::KeyCollection { nodes, .. } => nodes.clone(),
            MeshError::InvalidKey { node, .. } => vec![node.clone()],
            MeshError::HandshakeThresholdUnmet { lagging, .. } => {
                lagging.iter().map(|s| s.node.clone()).collect()
            }
            MeshError::Unreachable { pairs, .. } | MeshError::ReadinessGate { pairs, .. } => {
                let mut nodes: Vec<String> = pairs
                    .iter()
                    .flat_map(|(s, t)| [s.clone(), t.clone()])
                    .collect();
                nodes.sort();
                nodes.dedup();
                nodes
            }
        }
    }
}

// ============================================================================
// Cluster Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("no node carries the master role")]
    NoMaster,

    /// Control plane initialization failed on the leader.
    #[error("{node}: leader init failed: {source}")]
    LeaderInit {
        node: String,
        #[source]
        source: Box<MeshkubeError>,
    },

    #[error("{node}: API did not answer within {waited:?}")]
    ApiNotReady {
        node: String,
        waited: Duration,
        last_output: String,
    },

    #[error("{node}: join token unavailable: {source}")]
    Token {
        node: String,
        #[source]
        source: Box<MeshkubeError>,
    },

    /// A follower failed to join or never became Ready.
    #[error("{node}: join failed: {reason}")]
    Join { node: String, reason: String },
}

impl ClusterError {
    fn nodes(&self) -> Vec<String> {
        match self {
            ClusterError::NoMaster => Vec::new(),
            ClusterError::LeaderInit { node, .. }
            | ClusterError::ApiNotReady { node, .. }
            | ClusterError::Token { node, .. }
            | ClusterError::Join { node, .. } => vec![node.clone()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script_failed(node: &str) -> RemoteError {
        RemoteError::ScriptFailed {
            node: node.into(),
            host: "203.0.113.7".into(),
            step: "provision.install".into(),
            exit_code: 100,
            stdout: "E: Unable to locate package wireguard".into(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_error_hierarchy() {
        let err: MeshkubeError = script_failed("worker-1").into();
        assert!(matches!(err, MeshkubeError::Remote(_)));

        let err: MeshkubeError = ProvisionError::LockTimeout {
            node: "worker-1".into(),
            waited: Duration::from_secs(300),
        }
        .into();
        assert!(matches!(err, MeshkubeError::Provision(_)));

        let err: MeshkubeError = ClusterError::NoMaster.into();
        assert!(matches!(err, MeshkubeError::Cluster(_)));
    }

    #[test]
    fn test_error_display() {
        let err: MeshkubeError = script_failed("worker-1").into();
        assert_eq!(
            err.to_string(),
            "remote: worker-1 (203.0.113.7): step provision.install exited with 100"
        );

        let err = MeshError::Unreachable {
            pairs: vec![("a".into(), "b".into()), ("b".into(), "c".into())],
            matrix: String::new(),
        };
        assert_eq!(err.to_string(), "2 unreachable pair(s): a->b, b->c");
    }

    #[test]
    fn test_phase_lifts_nodes_and_diagnostic() {
        let err = MeshkubeError::phase("nodes.provision", script_failed("worker-2").into());
        match &err {
            MeshkubeError::Phase {
                phase,
                nodes,
                diagnostic,
                ..
            } => {
                assert_eq!(phase, "nodes.provision");
                assert_eq!(nodes, &vec!["worker-2".to_string()]);
                assert!(diagnostic.contains("Unable to locate package"));
            }
            other => panic!("expected phase error, got {other:?}"),
        }
    }

    #[test]
    fn test_phase_does_not_double_wrap() {
        let inner = MeshkubeError::phase("mesh.validate", ClusterError::NoMaster.into());
        let outer = MeshkubeError::phase("cluster.bootstrap", inner);
        assert!(outer.to_string().starts_with("phase 'mesh.validate'"));
    }

    #[test]
    fn test_unreachable_nodes_are_deduplicated() {
        let err: MeshkubeError = MeshError::Unreachable {
            pairs: vec![("b".into(), "a".into()), ("a".into(), "b".into())],
            matrix: "matrix".into(),
        }
        .into();
        assert_eq!(err.implicated_nodes(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.diagnostic().as_deref(), Some("matrix"));
    }

    #[test]
    fn test_transient_classification() {
        let dial: MeshkubeError = RemoteError::DialTimeout {
            node: "worker-1".into(),
            host: "203.0.113.7".into(),
            attempts: 30,
            last: "Connection timed out".into(),
        }
        .into();
        let lock: MeshkubeError = ProvisionError::LockTimeout {
            node: "worker-1".into(),
            waited: Duration::from_secs(300),
        }
        .into();
        assert!(dial.is_transient());
        assert!(lock.is_transient());
        assert!(MeshkubeError::phase("nodes.provision", lock).is_transient());

        let permanent: Vec<MeshkubeError> = vec![
            script_failed("worker-1").into(),
            ProvisionError::InstallFailed {
                node: "worker-1".into(),
                attempts: 3,
                last: "exit 100".into(),
                diagnostic: String::new(),
            }
            .into(),
            ProvisionError::ValidationFailed {
                node: "worker-1".into(),
                failed: vec!["ip_forward".into()],
                output: String::new(),
            }
            .into(),
            ClusterError::NoMaster.into(),
            MeshkubeError::Config("bad".into()),
            MeshkubeError::Cancelled("run".into()),
        ];
        for err in permanent {
            assert!(!err.is_transient(), "{err} should be permanent");
        }
    }

    #[test]
    fn test_handshake_shortfall_carries_wg_dump() {
        let err: MeshkubeError = MeshError::HandshakeThresholdUnmet {
            threshold_percent: 70,
            lagging: vec![HandshakeShortfall {
                node: "worker-2".into(),
                active: 1,
                total: 5,
            }],
            dump: "== worker-2 ==\npeerA=\t0\n".into(),
        }
        .into();
        assert_eq!(err.implicated_nodes(), vec!["worker-2".to_string()]);
        assert!(err.diagnostic().unwrap().contains("== worker-2 =="));
        let wrapped = MeshkubeError::phase("mesh.validate", err);
        assert!(wrapped.diagnostic().unwrap().contains("peerA"));
    }
}
