//! Directed reachability results.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// `source → target → reachable` over mesh addresses.
///
/// Rows exist only for nodes that probed. Rendering follows node creation
/// order rather than name order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityMatrix {
    order: Vec<String>,
    results: BTreeMap<String, BTreeMap<String, bool>>,
}

impl ConnectivityMatrix {
    pub fn new(order: Vec<String>) -> Self {
        Self {
            order,
            results: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, source: &str, target: &str, reachable: bool) {
        self.results
            .entry(source.to_string())
            .or_default()
            .insert(target.to_string(), reachable);
    }

    /// `None` when the pair was never probed.
    pub fn reachable(&self, source: &str, target: &str) -> Option<bool> {
        self.results.get(source)?.get(target).copied()
    }

    pub fn probed_pairs(&self) -> usize {
        self.results.values().map(BTreeMap::len).sum()
    }

    /// Every probed pair that failed, in creation order.
    pub fn failing_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for source in &self.order {
            for target in &self.order {
                if self.reachable(source, target) == Some(false) {
                    pairs.push((source.clone(), target.clone()));
                }
            }
        }
        pairs
    }

    pub fn is_fully_connected(&self) -> bool {
        self.failing_pairs().is_empty()
    }

    /// Table with one row per node: `ok`, `FAIL`, `-` for self, `.` unprobed.
    pub fn render(&self) -> String {
        let width = self
            .order
            .iter()
            .map(String::len)
            .max()
            .unwrap_or(0)
            .max(4);

        let mut out = String::new();
        let _ = write!(out, "{:width$}", "");
        for target in &self.order {
            let _ = write!(out, "  {target:>width$}");
        }
        out.push('\n');

        for source in &self.order {
            let _ = write!(out, "{source:width$}");
            for target in &self.order {
                let cell = if source == target {
                    "-"
                } else {
                    match self.reachable(source, target) {
                        Some(true) => "ok",
                        Some(false) => "FAIL",
                        None => ".",
                    }
                };
                let _ = write!(out, "  {cell:>width$}");
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix() -> ConnectivityMatrix {
        let mut m = ConnectivityMatrix::new(vec!["m1".into(), "w1".into(), "w2".into()]);
        for s in ["m1", "w1", "w2"] {
            for t in ["m1", "w1", "w2"] {
                if s != t {
                    m.record(s, t, true);
                }
            }
        }
        m
    }

    #[test]
    fn fully_connected_when_all_pass() {
        let m = matrix();
        assert!(m.is_fully_connected());
        assert_eq!(m.probed_pairs(), 6);
    }

    #[test]
    fn failing_pairs_in_creation_order() {
        let mut m = matrix();
        m.record("w2", "m1", false);
        m.record("m1", "w2", false);
        assert_eq!(
            m.failing_pairs(),
            vec![
                ("m1".to_string(), "w2".to_string()),
                ("w2".to_string(), "m1".to_string()),
            ]
        );
    }

    #[test]
    fn render_marks_cells() {
        let mut m = ConnectivityMatrix::new(vec!["m1".into(), "w1".into()]);
        m.record("m1", "w1", false);
        let table = m.render();
        let rows: Vec<&str> = table.lines().collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[1].starts_with("m1"));
        assert!(rows[1].contains("FAIL"));
        assert!(rows[2].contains('.'));
    }

    #[test]
    fn serializes_to_nested_map() {
        let mut m = ConnectivityMatrix::new(vec!["a".into(), "b".into()]);
        m.record("a", "b", true);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["results"]["a"]["b"], true);
    }
}
