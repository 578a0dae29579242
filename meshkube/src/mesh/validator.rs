//! Mesh validation.
//!
//! Two gates, in order:
//!
//! 1. Handshakes: every node must hold a recent handshake with at least
//!    `handshake_threshold_percent` of its peers before the wait expires.
//! 2. Reachability: probes over mesh addresses fill a [`ConnectivityMatrix`].
//!    Masters must reach each other and every worker must reach every
//!    master; any other failing pair fails validation too.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use meshkube_shared::constants::{protocol, steps};
use meshkube_shared::errors::{HandshakeShortfall, MeshError, MeshkubeError, MeshkubeResult};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::matrix::ConnectivityMatrix;
use crate::node::Node;
use crate::options::{MeshOptions, SshOptions, ValidationScope};
use crate::remote::{RemoteScript, SharedExecutor, TargetResolver, records, shell_quote};

/// True when `active` of `total` peers meets `threshold_percent`.
///
/// A node with no peers is never ready.
pub fn handshake_ready(active: usize, total: usize, threshold_percent: u8) -> bool {
    total > 0 && active * 100 >= usize::from(threshold_percent) * total
}

/// Count peers with a non-zero handshake timestamp in
/// `wg show <iface> latest-handshakes` output.
pub fn count_active_handshakes(output: &str) -> usize {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter(|ts| ts.parse::<u64>().is_ok_and(|t| t > 0))
        .count()
}

/// Handshake state of one node at the last poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeSample {
    pub node: String,
    pub active: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshValidation {
    pub handshakes: Vec<HandshakeSample>,
    pub matrix: ConnectivityMatrix,
}

pub struct MeshValidator {
    executor: SharedExecutor,
    options: MeshOptions,
    validate_timeout: Duration,
}

impl MeshValidator {
    pub fn new(executor: SharedExecutor, options: MeshOptions, ssh: &SshOptions) -> Self {
        Self {
            executor,
            options,
            validate_timeout: ssh.validate_timeout(),
        }
    }

    /// Validate the mesh over `nodes`, each configured with `peers` peers.
    ///
    /// The matrix is returned inside the error for reachability failures,
    /// rendered, so the report can show it.
    pub async fn validate(
        &self,
        nodes: &[Node],
        peers: usize,
        resolver: &TargetResolver,
        cancel: &CancellationToken,
    ) -> MeshkubeResult<MeshValidation> {
        let handshakes = self.wait_for_handshakes(nodes, peers, resolver, cancel).await?;
        let matrix = self.probe(nodes, resolver, cancel).await?;
        tracing::info!(
            probed = matrix.probed_pairs(),
            failing = matrix.failing_pairs().len(),
            "Reachability matrix collected"
        );
        readiness_gate(nodes, &matrix)?;

        let failing = matrix.failing_pairs();
        if !failing.is_empty() {
            return Err(MeshError::Unreachable {
                pairs: failing,
                matrix: matrix.render(),
            }
            .into());
        }

        Ok(MeshValidation { handshakes, matrix })
    }

    /// Poll until every node meets the threshold or the wait runs out.
    async fn wait_for_handshakes(
        &self,
        nodes: &[Node],
        peers: usize,
        resolver: &TargetResolver,
        cancel: &CancellationToken,
    ) -> MeshkubeResult<Vec<HandshakeSample>> {
        let threshold = self.options.handshake_threshold_percent;
        let deadline = Instant::now() + self.options.handshake_wait();
        let script = handshakes_script(&self.options.interface);

        loop {
            let polled: Vec<(HandshakeSample, String)> = stream::iter(nodes)
                .map(|node| {
                    let script = &script;
                    let target = resolver.target(node);
                    async move {
                        let raw = match self
                            .executor
                            .run(&target, script, self.validate_timeout)
                            .await
                        {
                            Ok(output) => output.stdout,
                            Err(e) => {
                                tracing::warn!(node = %node.name, error = %e, "Handshake poll failed");
                                format!("poll failed: {e}\n")
                            }
                        };
                        let sample = HandshakeSample {
                            node: node.name.clone(),
                            active: count_active_handshakes(&raw).min(peers),
                            total: peers,
                        };
                        (sample, raw)
                    }
                })
                .buffered(self.options.max_parallel.max(1))
                .collect()
                .await;

            let lagging: Vec<(HandshakeShortfall, &str)> = polled
                .iter()
                .filter(|(s, _)| !handshake_ready(s.active, s.total, threshold))
                .map(|(s, raw)| {
                    let shortfall = HandshakeShortfall {
                        node: s.node.clone(),
                        active: s.active,
                        total: s.total,
                    };
                    (shortfall, raw.as_str())
                })
                .collect();

            if lagging.is_empty() {
                tracing::info!(nodes = polled.len(), threshold, "Handshake threshold met");
                return Ok(polled.into_iter().map(|(sample, _)| sample).collect());
            }
            if Instant::now() >= deadline {
                let dump = lagging
                    .iter()
                    .map(|(s, raw)| format!("== {} ==\n{}", s.node, raw.trim_end()))
                    .collect::<Vec<_>>()
                    .join("\n");
                return Err(MeshError::HandshakeThresholdUnmet {
                    threshold_percent: threshold,
                    lagging: lagging.into_iter().map(|(s, _)| s).collect(),
                    dump,
                }
                .into());
            }
            tracing::debug!(lagging = lagging.len(), "Waiting for handshakes");

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(MeshkubeError::Cancelled("mesh handshake wait".into()));
                }
                _ = tokio::time::sleep(self.options.handshake_poll()) => {}
            }
        }
    }

    async fn probe(
        &self,
        nodes: &[Node],
        resolver: &TargetResolver,
        cancel: &CancellationToken,
    ) -> MeshkubeResult<ConnectivityMatrix> {
        let sources: &[Node] = match self.options.validation_scope {
            ValidationScope::All => nodes,
            ValidationScope::Representative => &nodes[..nodes.len().min(1)],
        };

        let rows: Vec<(String, BTreeMap<String, bool>)> = stream::iter(sources)
            .map(|source| {
                let targets: Vec<&Node> = nodes.iter().filter(|n| n.index != source.index).collect();
                let script = ping_script(&targets, &self.options);
                let target = resolver.target(source);
                async move {
                    let reported: BTreeMap<String, bool> = match self
                        .executor
                        .run(&target, &script, self.validate_timeout)
                        .await
                    {
                        Ok(output) => records(&output.stdout, protocol::PING)
                            .iter()
                            .map(|r| (r.field(0).to_string(), r.field(1) == "ok"))
                            .collect(),
                        Err(e) => {
                            tracing::warn!(node = %source.name, error = %e, "Reachability probe failed");
                            BTreeMap::new()
                        }
                    };
                    let row = targets
                        .iter()
                        .map(|t| (t.name.clone(), reported.get(&t.name).copied().unwrap_or(false)))
                        .collect();
                    (source.name.clone(), row)
                }
            })
            .buffer_unordered(self.options.max_parallel.max(1))
            .collect()
            .await;

        if cancel.is_cancelled() {
            return Err(MeshkubeError::Cancelled("mesh reachability probe".into()));
        }

        let mut matrix = ConnectivityMatrix::new(nodes.iter().map(|n| n.name.clone()).collect());
        for (source, row) in rows {
            for (target, ok) in row {
                matrix.record(&source, &target, ok);
            }
        }
        Ok(matrix)
    }
}

/// Kubernetes needs masters to reach each other and workers to reach
/// masters. Unprobed pairs are not counted against the gate.
fn readiness_gate(nodes: &[Node], matrix: &ConnectivityMatrix) -> MeshkubeResult<()> {
    let masters: Vec<&Node> = nodes.iter().filter(|n| n.is_master()).collect();
    let mut pairs = Vec::new();
    for source in nodes {
        for master in &masters {
            if source.index != master.index
                && matrix.reachable(&source.name, &master.name) == Some(false)
            {
                pairs.push((source.name.clone(), master.name.clone()));
            }
        }
    }
    if pairs.is_empty() {
        return Ok(());
    }
    Err(MeshError::ReadinessGate {
        requirement: "masters and workers must reach every master".into(),
        pairs,
        matrix: matrix.render(),
    }
    .into())
}

fn handshakes_script(interface: &str) -> RemoteScript {
    RemoteScript::new(
        steps::MESH_HANDSHAKES,
        format!("wg show {interface} latest-handshakes 2>/dev/null || true\n"),
    )
}

/// One `probe <name> <mesh ip>` line per target, run in parallel.
fn ping_script(targets: &[&Node], options: &MeshOptions) -> RemoteScript {
    let mut body = format!(
        r#"probe() {{
  if ping -c {count} -W {timeout} "$2" >/dev/null 2>&1; then
    echo "PING|$1|ok"
  else
    echo "PING|$1|fail"
  fi
}}
"#,
        count = options.ping_count,
        timeout = options.ping_timeout_secs,
    );
    for target in targets {
        body.push_str(&format!("probe {} {} &\n", shell_quote(&target.name), target.mesh_ip));
    }
    body.push_str("wait\n");
    RemoteScript::new(steps::MESH_PING, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeRegistry, NodeSpec, Provider};
    use crate::remote::{ExecOutput, RemoteExecutor, RemoteTarget};
    use async_trait::async_trait;
    use meshkube_shared::errors::RemoteError;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    // ========================================================================
    // Fake mesh
    // ========================================================================

    /// Reports handshakes after `warmup_polls` polls per node, answers ping
    /// probes except for pairs listed in `blocked`.
    #[derive(Default)]
    struct FakeWg {
        peers: usize,
        warmup_polls: usize,
        stuck: HashSet<String>,
        blocked: HashSet<(String, String)>,
        polls: Mutex<BTreeMap<String, usize>>,
    }

    #[async_trait]
    impl RemoteExecutor for FakeWg {
        async fn run(
            &self,
            target: &RemoteTarget,
            script: &RemoteScript,
            _timeout: Duration,
        ) -> Result<ExecOutput, RemoteError> {
            match script.step() {
                "mesh.handshakes" => {
                    let mut polls = self.polls.lock();
                    let count = polls.entry(target.node.clone()).or_default();
                    *count += 1;
                    let warm = *count > self.warmup_polls && !self.stuck.contains(&target.node);
                    let ts = if warm { 1_760_000_000 } else { 0 };
                    let out: String = (0..self.peers).map(|i| format!("key{i}=\t{ts}\n")).collect();
                    Ok(ExecOutput::stdout(out))
                }
                "mesh.ping" => {
                    let out: String = script
                        .text()
                        .lines()
                        .filter_map(|l| l.strip_prefix("probe '"))
                        .filter_map(|l| l.split('\'').next())
                        .map(|name| {
                            let ok = !self.blocked.contains(&(target.node.clone(), name.to_string()));
                            format!("PING|{name}|{}\n", if ok { "ok" } else { "fail" })
                        })
                        .collect();
                    Ok(ExecOutput::stdout(out))
                }
                other => panic!("unexpected step {other}"),
            }
        }
    }

    fn nodes() -> Vec<Node> {
        let registry = NodeRegistry::new();
        registry
            .register(
                ["m1", "m2", "w1", "w2"]
                    .iter()
                    .enumerate()
                    .map(|(i, name)| {
                        NodeSpec::new(*name, Provider::Aws, format!("203.0.113.{}", i + 1).parse().unwrap())
                    })
                    .collect(),
                &MeshOptions::default(),
                2,
            )
            .unwrap();
        registry.snapshot()
    }

    fn validator(fake: Arc<FakeWg>, scope: ValidationScope) -> MeshValidator {
        let options = MeshOptions {
            validation_scope: scope,
            ..Default::default()
        };
        MeshValidator::new(fake, options, &SshOptions::default())
    }

    // ========================================================================
    // Handshake threshold
    // ========================================================================

    #[test]
    fn threshold_boundaries() {
        assert!(handshake_ready(7, 10, 70));
        assert!(!handshake_ready(6, 10, 70));
        assert!(handshake_ready(4, 5, 70));
        assert!(!handshake_ready(3, 5, 70));
        assert!(!handshake_ready(0, 0, 70));
        assert!(handshake_ready(1, 1, 100));
    }

    #[test]
    fn counts_non_zero_timestamps() {
        let out = "a=\t1760000000\nb=\t0\nc=\t1760000100\n";
        assert_eq!(count_active_handshakes(out), 2);
        assert_eq!(count_active_handshakes(""), 0);
    }

    proptest! {
        #[test]
        fn threshold_matches_ratio(active in 0usize..200, total in 1usize..200, pct in 1u8..=100) {
            let active = active.min(total);
            let expected = (active as f64) / (total as f64) * 100.0 >= f64::from(pct) - 1e-9;
            prop_assert_eq!(handshake_ready(active, total, pct), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_late_handshakes() {
        let fake = Arc::new(FakeWg {
            peers: 3,
            warmup_polls: 2,
            ..Default::default()
        });
        let result = validator(fake.clone(), ValidationScope::All)
            .validate(&nodes(), 3, &TargetResolver::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.handshakes.iter().all(|s| s.active == 3));
        assert_eq!(fake.polls.lock()["m1"], 3);
        assert!(result.matrix.is_fully_connected());
        assert_eq!(result.matrix.probed_pairs(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_node_fails_threshold_after_wait() {
        let fake = Arc::new(FakeWg {
            peers: 3,
            stuck: HashSet::from(["w2".to_string()]),
            ..Default::default()
        });
        let err = validator(fake, ValidationScope::All)
            .validate(&nodes(), 3, &TargetResolver::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            MeshkubeError::Mesh(MeshError::HandshakeThresholdUnmet { ref lagging, ref dump, .. }) => {
                assert_eq!(lagging.len(), 1);
                assert_eq!(lagging[0].node, "w2");
                assert_eq!(lagging[0].active, 0);
                assert!(dump.starts_with("== w2 ==\nkey0=\t0"));
                assert!(!dump.contains("== m1 =="));
            }
            ref other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.diagnostic().is_some_and(|d| d.contains("key2=\t0")));
    }

    // ========================================================================
    // Reachability
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn worker_to_worker_failure_is_unreachable() {
        let fake = Arc::new(FakeWg {
            peers: 3,
            blocked: HashSet::from([("w1".to_string(), "w2".to_string())]),
            ..Default::default()
        });
        let err = validator(fake, ValidationScope::All)
            .validate(&nodes(), 3, &TargetResolver::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            MeshkubeError::Mesh(MeshError::Unreachable { pairs, matrix }) => {
                assert_eq!(pairs, vec![("w1".to_string(), "w2".to_string())]);
                assert!(matrix.contains("FAIL"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn worker_to_master_failure_trips_readiness_gate() {
        let fake = Arc::new(FakeWg {
            peers: 3,
            blocked: HashSet::from([("w2".to_string(), "m1".to_string())]),
            ..Default::default()
        });
        let err = validator(fake, ValidationScope::All)
            .validate(&nodes(), 3, &TargetResolver::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MeshkubeError::Mesh(MeshError::ReadinessGate { .. })
        ));
        assert_eq!(err.implicated_nodes(), vec!["m1".to_string(), "w2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn representative_scope_probes_from_first_node() {
        let fake = Arc::new(FakeWg {
            peers: 3,
            ..Default::default()
        });
        let result = validator(fake, ValidationScope::Representative)
            .validate(&nodes(), 3, &TargetResolver::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.matrix.probed_pairs(), 3);
        assert_eq!(result.matrix.reachable("w1", "m1"), None);
    }

    #[test]
    fn ping_script_probes_each_target_in_background() {
        let nodes = nodes();
        let targets: Vec<&Node> = nodes[1..].iter().collect();
        let text = ping_script(&targets, &MeshOptions::default()).text().to_string();
        assert!(text.contains("probe 'm2' 10.8.0.11 &\n"));
        assert!(text.contains("probe 'w2' 10.8.0.13 &\n"));
        assert!(text.contains("ping -c 2 -W 10"));
        assert!(text.trim_end().ends_with("wait"));
    }
}
