//! Parsing of the `KIND|field|field` lines remote scripts print.
//!
//! Scripts may print arbitrary progress output around these lines; only
//! lines starting with a known kind followed by `|` are records.

/// One structured output line, split on `|`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<'a> {
    fields: Vec<&'a str>,
}

impl<'a> Record<'a> {
    /// Field `n` (0-based, after the kind), or "" when absent.
    pub fn field(&self, n: usize) -> &'a str {
        self.fields.get(n).copied().unwrap_or("")
    }

    /// All fields from `n` on, rejoined. Used for free-text details that
    /// may themselves contain `|`.
    pub fn rest(&self, n: usize) -> String {
        self.fields.get(n..).map(|f| f.join("|")).unwrap_or_default()
    }
}

/// All records of `kind` in `output`, in order.
pub fn records<'a>(output: &'a str, kind: &str) -> Vec<Record<'a>> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix(kind)?.strip_prefix('|')?;
            Some(Record {
                fields: rest.split('|').map(str::trim).collect(),
            })
        })
        .collect()
}

/// Last `lines` lines of `output`, for diagnostics.
pub fn tail(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
