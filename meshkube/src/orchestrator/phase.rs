//! Phase graph and wave scheduler.
//!
//! Phases form an explicit DAG. The scheduler runs every phase whose
//! dependencies have all succeeded, one wave at a time:
//!
//! ```text
//! wave 1: [bastion]
//! wave 2: [nodes.create]
//! ...
//! wave 7: [dns, addons.gitops]   (concurrent)
//! ```
//!
//! A `WarnOnly` failure skips only that phase's dependents. A `Fatal`
//! failure cancels in-flight siblings and skips everything still pending.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use meshkube_shared::errors::{MeshkubeError, MeshkubeResult};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Lifecycle of a phase.
///
/// ```text
/// Pending ──→ Running ──→ Succeeded
///    │           └──────→ Failed
///    └──→ Skipped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl PhaseState {
    pub fn can_transition_to(&self, target: PhaseState) -> bool {
        use PhaseState::*;
        matches!(
            (self, target),
            (Pending, Running) | (Pending, Skipped) | (Running, Succeeded) | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseState::Succeeded | PhaseState::Failed | PhaseState::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseState::Pending => "pending",
            PhaseState::Running => "running",
            PhaseState::Succeeded => "succeeded",
            PhaseState::Failed => "failed",
            PhaseState::Skipped => "skipped",
        }
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a phase failure does to the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Halt the run.
    Fatal,
    /// Record a warning and skip dependents.
    WarnOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub name: String,
    pub deps: Vec<String>,
    pub policy: FailurePolicy,
}

impl Phase {
    pub fn new(name: impl Into<String>, policy: FailurePolicy) -> Self {
        Self {
            name: name.into(),
            deps: Vec::new(),
            policy,
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.deps.extend(deps.iter().map(|d| d.to_string()));
        self
    }
}

/// Validated phase DAG.
#[derive(Debug, Clone)]
pub struct PhaseGraph {
    phases: Vec<Phase>,
}

impl PhaseGraph {
    /// # Errors
    ///
    /// `Config` for duplicate names, unknown dependencies or cycles.
    pub fn new(phases: Vec<Phase>) -> MeshkubeResult<Self> {
        let mut names = HashSet::new();
        for phase in &phases {
            if !names.insert(phase.name.as_str()) {
                return Err(MeshkubeError::Config(format!(
                    "duplicate phase '{}'",
                    phase.name
                )));
            }
        }
        for phase in &phases {
            if let Some(dep) = phase.deps.iter().find(|d| !names.contains(d.as_str())) {
                return Err(MeshkubeError::Config(format!(
                    "phase '{}' depends on unknown phase '{dep}'",
                    phase.name
                )));
            }
        }

        let graph = Self { phases };
        let ordered: usize = graph.waves().iter().map(Vec::len).sum();
        if ordered != graph.phases.len() {
            let placed: HashSet<&str> = graph.waves().into_iter().flatten().collect();
            let cyclic: Vec<&str> = graph
                .phases
                .iter()
                .map(|p| p.name.as_str())
                .filter(|n| !placed.contains(n))
                .collect();
            return Err(MeshkubeError::Config(format!(
                "phase dependency cycle among: {}",
                cyclic.join(", ")
            )));
        }
        Ok(graph)
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn get(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Topological levels (Kahn). Phases on a cycle are left out.
    pub fn waves(&self) -> Vec<Vec<&str>> {
        let mut indegree: HashMap<&str, usize> = self
            .phases
            .iter()
            .map(|p| (p.name.as_str(), p.deps.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for phase in &self.phases {
            for dep in &phase.deps {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(phase.name.as_str());
            }
        }

        let mut current: VecDeque<&str> = self
            .phases
            .iter()
            .filter(|p| p.deps.is_empty())
            .map(|p| p.name.as_str())
            .collect();
        let mut waves = Vec::new();
        while !current.is_empty() {
            let wave: Vec<&str> = current.drain(..).collect();
            for name in &wave {
                for dependent in dependents.get(name).into_iter().flatten() {
                    if let Some(d) = indegree.get_mut(dependent) {
                        *d -= 1;
                        if *d == 0 {
                            current.push_back(dependent);
                        }
                    }
                }
            }
            waves.push(wave);
        }
        waves
    }

    /// One line per phase, grouped by wave.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, wave) in self.waves().iter().enumerate() {
            for name in wave {
                let Some(phase) = self.get(name) else {
                    continue;
                };
                let policy = match phase.policy {
                    FailurePolicy::Fatal => "fatal",
                    FailurePolicy::WarnOnly => "warn",
                };
                let _ = write!(out, "{}. {} [{policy}]", i + 1, phase.name);
                if !phase.deps.is_empty() {
                    let _ = write!(out, " <- {}", phase.deps.join(", "));
                }
                out.push('\n');
            }
        }
        out
    }
}

/// Non-fatal findings of a successful phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseOutput {
    pub warnings: Vec<String>,
}

impl PhaseOutput {
    pub fn with_warnings(warnings: Vec<String>) -> Self {
        Self { warnings }
    }
}

/// Executes phases by name. Phase futures stay on the driving task, so they
/// need not be `Send`.
#[async_trait(?Send)]
pub trait PhaseRunner: Send + Sync {
    async fn run_phase(&self, name: &str, cancel: &CancellationToken) -> MeshkubeResult<PhaseOutput>;
}

/// Per-phase entry of the run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: String,
    pub policy: FailurePolicy,
    pub state: PhaseState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseRecord {
    fn new(phase: &Phase) -> Self {
        Self {
            name: phase.name.clone(),
            policy: phase.policy,
            state: PhaseState::Pending,
            started_at: None,
            finished_at: None,
            warnings: Vec::new(),
            error: None,
        }
    }

    fn transition(&mut self, state: PhaseState) {
        if self.state.can_transition_to(state) {
            self.state = state;
        } else {
            tracing::error!(
                phase = %self.name,
                from = %self.state,
                to = %state,
                "Invalid phase transition ignored"
            );
        }
    }
}

/// Outcome of executing a graph.
#[derive(Debug)]
pub struct Schedule {
    /// Records in graph order.
    pub records: Vec<PhaseRecord>,
    /// The fatal failure that halted the run, wrapped with its phase.
    pub fatal: Option<MeshkubeError>,
}

impl Schedule {
    /// Warnings from successful phases plus every WarnOnly failure and the
    /// phases it skipped.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for record in &self.records {
            warnings.extend(record.warnings.iter().cloned());
            if record.policy == FailurePolicy::WarnOnly && record.state == PhaseState::Failed {
                if let Some(error) = &record.error {
                    warnings.push(format!("{} failed: {error}", record.name));
                }
            }
        }
        if self.fatal.is_none() {
            for record in &self.records {
                if record.state == PhaseState::Skipped {
                    warnings.push(format!("{} skipped", record.name));
                }
            }
        }
        warnings
    }
}

/// Run `graph` to completion or to the first fatal failure.
pub async fn execute(
    graph: &PhaseGraph,
    runner: &dyn PhaseRunner,
    cancel: &CancellationToken,
) -> Schedule {
    let mut records: BTreeMap<&str, PhaseRecord> = graph
        .phases()
        .iter()
        .map(|p| (p.name.as_str(), PhaseRecord::new(p)))
        .collect();
    let mut fatal: Option<MeshkubeError> = None;

    loop {
        skip_blocked(graph, &mut records);

        let ready: Vec<&Phase> = graph
            .phases()
            .iter()
            .filter(|p| records[p.name.as_str()].state == PhaseState::Pending)
            .filter(|p| {
                p.deps
                    .iter()
                    .all(|d| records[d.as_str()].state == PhaseState::Succeeded)
            })
            .collect();
        if ready.is_empty() {
            break;
        }

        if cancel.is_cancelled() {
            fatal = Some(MeshkubeError::phase(
                ready[0].name.clone(),
                MeshkubeError::Cancelled("run cancelled".into()),
            ));
            break;
        }

        for phase in &ready {
            if let Some(record) = records.get_mut(phase.name.as_str()) {
                record.transition(PhaseState::Running);
                record.started_at = Some(Utc::now());
            }
            tracing::info!(phase = %phase.name, "Phase started");
        }

        let results = join_all(ready.iter().map(|phase| async move {
            let result = runner.run_phase(&phase.name, cancel).await;
            if result.is_err() && phase.policy == FailurePolicy::Fatal {
                cancel.cancel();
            }
            (*phase, result)
        }))
        .await;

        for (phase, result) in results {
            let Some(record) = records.get_mut(phase.name.as_str()) else {
                continue;
            };
            record.finished_at = Some(Utc::now());
            match result {
                Ok(output) => {
                    record.transition(PhaseState::Succeeded);
                    tracing::info!(
                        phase = %phase.name,
                        warnings = output.warnings.len(),
                        "Phase succeeded"
                    );
                    record.warnings = output.warnings;
                }
                Err(e) => {
                    record.transition(PhaseState::Failed);
                    record.error = Some(e.to_string());
                    match phase.policy {
                        FailurePolicy::WarnOnly => {
                            tracing::warn!(phase = %phase.name, error = %e, "Phase failed, continuing");
                        }
                        FailurePolicy::Fatal => {
                            tracing::error!(phase = %phase.name, error = %e, "Phase failed");
                            // Siblings cancelled by this failure do not replace it
                            if fatal.as_ref().is_none_or(is_cancellation) {
                                fatal = Some(MeshkubeError::phase(phase.name.clone(), e));
                            }
                        }
                    }
                }
            }
        }

        if fatal.is_some() {
            break;
        }
    }

    if fatal.is_some() {
        for record in records.values_mut() {
            if record.state == PhaseState::Pending {
                record.transition(PhaseState::Skipped);
            }
        }
    }

    let records = graph
        .phases()
        .iter()
        .filter_map(|p| records.remove(p.name.as_str()))
        .collect();
    Schedule { records, fatal }
}

/// Skip every pending phase with a failed or skipped dependency.
fn skip_blocked(graph: &PhaseGraph, records: &mut BTreeMap<&str, PhaseRecord>) {
    loop {
        let blocked: Vec<&str> = graph
            .phases()
            .iter()
            .filter(|p| records[p.name.as_str()].state == PhaseState::Pending)
            .filter(|p| {
                p.deps.iter().any(|d| {
                    matches!(
                        records[d.as_str()].state,
                        PhaseState::Failed | PhaseState::Skipped
                    )
                })
            })
            .map(|p| p.name.as_str())
            .collect();
        if blocked.is_empty() {
            return;
        }
        for name in blocked {
            if let Some(record) = records.get_mut(name) {
                tracing::info!(phase = name, "Phase skipped, dependency did not succeed");
                record.transition(PhaseState::Skipped);
            }
        }
    }
}

fn is_cancellation(error: &MeshkubeError) -> bool {
    match error {
        MeshkubeError::Phase { source, .. } => source.is_cancelled(),
        other => other.is_cancelled(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    // ========================================================================
    // Graph validation
    // ========================================================================

    fn linear() -> Vec<Phase> {
        vec![
            Phase::new("a", FailurePolicy::Fatal),
            Phase::new("b", FailurePolicy::Fatal).after(&["a"]),
            Phase::new("c", FailurePolicy::WarnOnly).after(&["b"]),
            Phase::new("d", FailurePolicy::WarnOnly).after(&["b"]),
            Phase::new("e", FailurePolicy::WarnOnly).after(&["c"]),
        ]
    }

    #[test]
    fn waves_follow_dependencies() {
        let graph = PhaseGraph::new(linear()).unwrap();
        assert_eq!(
            graph.waves(),
            vec![vec!["a"], vec!["b"], vec!["c", "d"], vec!["e"]]
        );
        let rendered = graph.render();
        assert!(rendered.contains("3. c [warn] <- b\n"));
        assert!(rendered.starts_with("1. a [fatal]\n"));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = PhaseGraph::new(vec![Phase::new("a", FailurePolicy::Fatal).after(&["ghost"])])
            .unwrap_err();
        assert!(err.to_string().contains("unknown phase 'ghost'"));
    }

    #[test]
    fn rejects_duplicates_and_cycles() {
        assert!(PhaseGraph::new(vec![
            Phase::new("a", FailurePolicy::Fatal),
            Phase::new("a", FailurePolicy::Fatal),
        ])
        .is_err());

        let err = PhaseGraph::new(vec![
            Phase::new("root", FailurePolicy::Fatal),
            Phase::new("x", FailurePolicy::Fatal).after(&["root", "y"]),
            Phase::new("y", FailurePolicy::Fatal).after(&["x"]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("cycle among: x, y"));
    }

    #[test]
    fn state_transitions() {
        assert!(PhaseState::Pending.can_transition_to(PhaseState::Running));
        assert!(PhaseState::Pending.can_transition_to(PhaseState::Skipped));
        assert!(PhaseState::Running.can_transition_to(PhaseState::Failed));
        assert!(!PhaseState::Succeeded.can_transition_to(PhaseState::Running));
        assert!(!PhaseState::Skipped.can_transition_to(PhaseState::Running));
        assert!(PhaseState::Skipped.is_terminal());
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    #[derive(Default)]
    struct Script {
        failing: Vec<&'static str>,
        slow: Vec<&'static str>,
        log: Mutex<Vec<String>>,
    }

    #[async_trait(?Send)]
    impl PhaseRunner for Script {
        async fn run_phase(&self, name: &str, cancel: &CancellationToken) -> MeshkubeResult<PhaseOutput> {
            self.log.lock().push(format!("start {name}"));
            if self.slow.iter().any(|s| *s == name) {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(MeshkubeError::Cancelled(name.to_string()));
                    }
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                }
            }
            if self.failing.iter().any(|f| *f == name) {
                return Err(MeshkubeError::Internal(format!("{name} broke")));
            }
            Ok(PhaseOutput::with_warnings(vec![format!("{name} note")]))
        }
    }

    fn state(schedule: &Schedule, name: &str) -> PhaseState {
        schedule
            .records
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.state)
            .unwrap()
    }

    #[tokio::test]
    async fn all_phases_succeed_in_order() {
        let graph = PhaseGraph::new(linear()).unwrap();
        let runner = Script::default();
        let schedule = execute(&graph, &runner, &CancellationToken::new()).await;

        assert!(schedule.fatal.is_none());
        assert!(schedule.records.iter().all(|r| r.state == PhaseState::Succeeded));
        let log = runner.log.lock().clone();
        assert_eq!(log[0], "start a");
        assert_eq!(log[1], "start b");
        assert_eq!(log[4], "start e");
        assert_eq!(schedule.warnings().len(), 5);
    }

    #[tokio::test]
    async fn warn_only_failure_skips_dependents_only() {
        let graph = PhaseGraph::new(linear()).unwrap();
        let runner = Script {
            failing: vec!["c"],
            ..Default::default()
        };
        let schedule = execute(&graph, &runner, &CancellationToken::new()).await;

        assert!(schedule.fatal.is_none());
        assert_eq!(state(&schedule, "c"), PhaseState::Failed);
        assert_eq!(state(&schedule, "d"), PhaseState::Succeeded);
        assert_eq!(state(&schedule, "e"), PhaseState::Skipped);
        let warnings = schedule.warnings();
        assert!(warnings.contains(&"c failed: internal: c broke".to_string()));
        assert!(warnings.contains(&"e skipped".to_string()));
    }

    #[tokio::test]
    async fn fatal_failure_halts_and_skips_rest() {
        let graph = PhaseGraph::new(linear()).unwrap();
        let runner = Script {
            failing: vec!["b"],
            ..Default::default()
        };
        let schedule = execute(&graph, &runner, &CancellationToken::new()).await;

        match schedule.fatal {
            Some(MeshkubeError::Phase { ref phase, .. }) => assert_eq!(phase, "b"),
            ref other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(state(&schedule, "a"), PhaseState::Succeeded);
        assert_eq!(state(&schedule, "b"), PhaseState::Failed);
        for name in ["c", "d", "e"] {
            assert_eq!(state(&schedule, name), PhaseState::Skipped);
        }
        assert!(!runner.log.lock().iter().any(|l| l == "start c"));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_cancels_running_sibling() {
        let graph = PhaseGraph::new(vec![
            Phase::new("root", FailurePolicy::Fatal),
            Phase::new("slow", FailurePolicy::Fatal).after(&["root"]),
            Phase::new("broken", FailurePolicy::Fatal).after(&["root"]),
        ])
        .unwrap();
        let runner = Script {
            failing: vec!["broken"],
            slow: vec!["slow"],
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let schedule = execute(&graph, &runner, &cancel).await;

        assert!(cancel.is_cancelled());
        match schedule.fatal {
            Some(MeshkubeError::Phase { ref phase, .. }) => assert_eq!(phase, "broken"),
            ref other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(state(&schedule, "slow"), PhaseState::Failed);
    }

    #[tokio::test]
    async fn cancelled_run_starts_nothing() {
        let graph = PhaseGraph::new(linear()).unwrap();
        let runner = Script::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let schedule = execute(&graph, &runner, &cancel).await;

        assert!(runner.log.lock().is_empty());
        assert!(schedule.records.iter().all(|r| r.state == PhaseState::Skipped));
        assert!(schedule.fatal.unwrap().to_string().contains("cancelled"));
    }
}
