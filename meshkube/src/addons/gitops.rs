//! ArgoCD installation on the leader.

use std::time::Duration;

use meshkube_shared::constants::{addons, steps};
use meshkube_shared::errors::MeshkubeResult;

use crate::cluster::Distribution;
use crate::options::{GitOpsOptions, SshOptions};
use crate::remote::{RemoteScript, RemoteTarget, SharedExecutor, shell_quote};

fn application(options: &GitOpsOptions, repo_url: &str) -> String {
    format!(
        r#"apiVersion: argoproj.io/v1alpha1
kind: Application
metadata:
  name: app-of-apps
  namespace: {namespace}
spec:
  project: default
  source:
    repoURL: "{repo_url}"
    targetRevision: "{branch}"
    path: "{path}"
  destination:
    server: https://kubernetes.default.svc
    namespace: {namespace}
  syncPolicy:
    automated:
      prune: true
      selfHeal: true
"#,
        namespace = options.namespace,
        branch = options.branch,
        path = options.apps_path,
    )
}

pub fn install_script(options: &GitOpsOptions, distribution: Distribution) -> RemoteScript {
    let kubectl = distribution.kubectl();
    let namespace = shell_quote(&options.namespace);
    let manifest = format!(
        "https://raw.githubusercontent.com/argoproj/argo-cd/{}/manifests/install.yaml",
        options.version
    );
    let app = match &options.repo_url {
        Some(repo) => format!(
            "{kubectl} apply -f - <<'MESHKUBE_EOF'\n{}MESHKUBE_EOF\n",
            application(options, repo)
        ),
        None => String::new(),
    };
    RemoteScript::new(
        steps::ADDON_GITOPS,
        format!(
            r#"set -e
{kubectl} create namespace {namespace} --dry-run=client -o yaml | {kubectl} apply -f -
{kubectl} apply -n {namespace} -f {manifest}
{kubectl} -n {namespace} rollout status deployment/argocd-server --timeout={wait}s
{app}echo "argocd ready"
"#,
            manifest = shell_quote(&manifest),
            wait = addons::ARGOCD_READY_WAIT_SECS,
        ),
    )
}

pub struct GitOpsInstaller {
    executor: SharedExecutor,
    options: GitOpsOptions,
    distribution: Distribution,
    timeout: Duration,
}

impl GitOpsInstaller {
    pub fn new(
        executor: SharedExecutor,
        options: GitOpsOptions,
        distribution: Distribution,
        ssh: &SshOptions,
    ) -> Self {
        Self {
            executor,
            options,
            distribution,
            timeout: ssh.install_timeout() + Duration::from_secs(addons::ARGOCD_READY_WAIT_SECS),
        }
    }

    pub async fn install(&self, leader: &RemoteTarget) -> MeshkubeResult<()> {
        tracing::info!(
            leader = %leader.node,
            namespace = %self.options.namespace,
            version = %self.options.version,
            "Installing ArgoCD"
        );
        self.executor
            .run(leader, &install_script(&self.options, self.distribution), self.timeout)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installs_and_waits_without_application() {
        let text = install_script(&GitOpsOptions::default(), Distribution::K3s)
            .text()
            .to_string();
        assert!(text.contains("argo-cd/stable/manifests/install.yaml"));
        assert!(text.contains("rollout status deployment/argocd-server --timeout=300s"));
        assert!(!text.contains("kind: Application"));
    }

    #[test]
    fn registers_app_of_apps_when_repo_given() {
        let options = GitOpsOptions {
            repo_url: Some("https://git.example.org/platform.git".into()),
            ..Default::default()
        };
        let text = install_script(&options, Distribution::Rke2).text().to_string();
        assert!(text.contains("repoURL: \"https://git.example.org/platform.git\""));
        assert!(text.contains("path: \"argocd/apps\""));
        assert!(text.contains("/var/lib/rancher/rke2/bin/kubectl"));
    }
}
