//! Remote script execution.
//!
//! [`RemoteExecutor`] is the only way the pipeline touches machines. A
//! script either runs to a zero exit status (`Ok`) or the call fails with a
//! typed [`RemoteError`]. Executors retry the connection, never the script.

mod protocol;
mod ssh;

pub use protocol::{Record, records, tail};
pub use ssh::SshExecutor;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshkube_shared::constants::steps;
use meshkube_shared::errors::RemoteError;

use crate::node::Node;
use crate::options::SshOptions;

/// Where and as whom a script runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Node name, used in errors and logs.
    pub node: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Jump host every connection is tunneled through.
    pub proxy: Option<ProxyHop>,
}

impl RemoteTarget {
    pub fn new(node: impl Into<String>, host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            host: host.into(),
            port: meshkube_shared::constants::ssh::PORT,
            user: user.into(),
            proxy: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn via(mut self, proxy: Option<ProxyHop>) -> Self {
        self.proxy = proxy;
        self
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {}@{}:{}", proxy.user, proxy.host, proxy.port)?;
        }
        Ok(())
    }
}

/// Maps registered nodes to SSH targets, applying the user override,
/// node port and bastion hop uniformly.
#[derive(Clone, Debug, Default)]
pub struct TargetResolver {
    user: Option<String>,
    port: u16,
    proxy: Option<ProxyHop>,
}

impl TargetResolver {
    pub fn new(ssh: &SshOptions, proxy: Option<ProxyHop>) -> Self {
        Self {
            user: ssh.user.clone(),
            port: ssh.port,
            proxy,
        }
    }

    pub fn target(&self, node: &Node) -> RemoteTarget {
        RemoteTarget::new(
            &node.name,
            node.public_ip.to_string(),
            node.ssh_user(self.user.as_deref()),
        )
        .with_port(self.port)
        .via(self.proxy.clone())
    }

    pub fn proxy(&self) -> Option<&ProxyHop> {
        self.proxy.as_ref()
    }
}

/// Bastion hop. Authenticates with the same identity as the final target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyHop {
    pub host: String,
    pub port: u16,
    pub user: String,
}

/// A shell script tagged with the step it performs.
#[derive(Clone, Debug)]
pub struct RemoteScript {
    step: &'static str,
    text: String,
}

impl RemoteScript {
    /// Wrap `body` with an interpreter line and the step marker.
    pub fn new(step: &'static str, body: impl AsRef<str>) -> Self {
        let text = format!(
            "#!/usr/bin/env bash\n{}{}\nset -o pipefail\n{}\n",
            steps::MARKER_PREFIX,
            step,
            body.as_ref().trim_start_matches('\n')
        );
        Self { step, text }
    }

    pub fn step(&self) -> &'static str {
        self.step
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Step named by a script's marker line.
pub fn step_of(script: &str) -> Option<&str> {
    script
        .lines()
        .find_map(|line| line.strip_prefix(steps::MARKER_PREFIX))
        .map(str::trim)
}

/// Captured output of a successful script run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Runs scripts on remote machines.
///
/// Implementations retry only the connection, up to their dial budget,
/// and report a script's non-zero exit status as
/// [`RemoteError::ScriptFailed`] without retrying it.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(
        &self,
        target: &RemoteTarget,
        script: &RemoteScript,
        timeout: Duration,
    ) -> Result<ExecOutput, RemoteError>;
}

pub type SharedExecutor = Arc<dyn RemoteExecutor>;

/// Single-quote `value` for safe interpolation into a shell command.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_carries_step_marker() {
        let script = RemoteScript::new(steps::MESH_KEYGEN, "\nwg genkey\n");
        assert_eq!(script.step(), "mesh.keygen");
        assert!(script.text().starts_with("#!/usr/bin/env bash\n# meshkube-step: mesh.keygen\n"));
        assert_eq!(step_of(script.text()), Some("mesh.keygen"));
        assert!(script.text().contains("\nwg genkey\n"));
    }

    #[test]
    fn step_of_unmarked_script_is_none() {
        assert_eq!(step_of("echo hi"), None);
    }

    #[test]
    fn target_display_includes_proxy() {
        let target = RemoteTarget::new("worker-1", "10.0.0.4", "root").via(Some(ProxyHop {
            host: "198.51.100.9".into(),
            port: 2222,
            user: "root".into(),
        }));
        assert_eq!(target.to_string(), "root@10.0.0.4:22 via root@198.51.100.9:2222");
    }

    #[test]
    fn resolver_applies_provider_user_and_hop() {
        use crate::node::{NodeIndex, NodeState, Provider};
        let node = Node {
            index: NodeIndex(0),
            name: "az-worker-1".into(),
            provider: Provider::Azure,
            region: String::new(),
            size: String::new(),
            public_ip: "203.0.113.20".parse().unwrap(),
            private_ip: None,
            mesh_ip: "10.8.0.10".parse().unwrap(),
            roles: Vec::new(),
            state: NodeState::new(),
        };
        let hop = ProxyHop {
            host: "198.51.100.9".into(),
            port: 22,
            user: "root".into(),
        };
        let target = TargetResolver::new(&SshOptions::default(), Some(hop.clone())).target(&node);
        assert_eq!(target.user, "azureuser");
        assert_eq!(target.host, "203.0.113.20");
        assert_eq!(target.proxy, Some(hop));

        let ssh = SshOptions {
            user: Some("ops".into()),
            ..Default::default()
        };
        assert_eq!(TargetResolver::new(&ssh, None).target(&node).user, "ops");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
