//! NGINX ingress controller and cert-manager on the leader.

use std::time::Duration;

use meshkube_shared::constants::{addons, protocol, steps};
use meshkube_shared::errors::{MeshkubeResult, RemoteError};

use crate::cluster::Distribution;
use crate::options::{IngressOptions, SshOptions};
use crate::remote::{RemoteScript, RemoteTarget, SharedExecutor, records, shell_quote};

const INGRESS_COMPONENT: &str = "ingress-nginx";
const CERT_MANAGER_COMPONENT: &str = "cert-manager";

fn cluster_issuer(name: &str, server: &str, email: &str) -> String {
    format!(
        r#"apiVersion: cert-manager.io/v1
kind: ClusterIssuer
metadata:
  name: {name}
spec:
  acme:
    server: {server}
    email: "{email}"
    privateKeySecretRef:
      name: {name}
    solvers:
    - http01:
        ingress:
          class: nginx
"#
    )
}

fn cert_manager(options: &IngressOptions, kubectl: &str, email: Option<&str>) -> String {
    let namespace = shell_quote(addons::CERT_MANAGER_NAMESPACE);
    let version = &options.cert_manager_version;
    let crds = shell_quote(&format!(
        "https://github.com/cert-manager/cert-manager/releases/download/{version}/cert-manager.crds.yaml"
    ));
    let issuers = match email {
        Some(email) => format!(
            "{kubectl} apply -f - <<'MESHKUBE_EOF'\n{}---\n{}MESHKUBE_EOF\n",
            cluster_issuer(
                "letsencrypt-prod",
                "https://acme-v02.api.letsencrypt.org/directory",
                email
            ),
            cluster_issuer(
                "letsencrypt-staging",
                "https://acme-staging-v02.api.letsencrypt.org/directory",
                email
            ),
        ),
        None => String::new(),
    };
    format!(
        r#"
helm repo add jetstack https://charts.jetstack.io --force-update >/dev/null
{kubectl} create namespace {namespace} --dry-run=client -o yaml | {kubectl} apply -f -
{kubectl} apply -f {crds}
helm upgrade --install cert-manager jetstack/cert-manager \
  --namespace {namespace} \
  --version {version} \
  --set installCRDs=false \
  --set global.leaderElection.namespace={namespace} \
  --wait --timeout {wait}s
{issuers}echo "{record}|{CERT_MANAGER_COMPONENT}|ready"
"#,
        version = shell_quote(version),
        wait = addons::INGRESS_READY_WAIT_SECS,
        record = protocol::ADDON,
    )
}

/// Helm-based install of ingress-nginx, then cert-manager when enabled.
///
/// Helm is fetched when missing and talks to the cluster through the
/// distribution's kubeconfig. Every component prints an `ADDON` record once
/// it reports ready.
pub fn install_script(
    options: &IngressOptions,
    distribution: Distribution,
    acme_email: Option<&str>,
) -> RemoteScript {
    let kubectl = distribution.kubectl();
    let namespace = shell_quote(&options.namespace);
    let version = match &options.chart_version {
        Some(v) => format!(" \\\n  --version {}", shell_quote(v)),
        None => String::new(),
    };
    let cert_manager = if options.cert_manager {
        cert_manager(options, kubectl, acme_email)
    } else {
        String::new()
    };
    RemoteScript::new(
        steps::ADDON_INGRESS,
        format!(
            r#"set -e
export KUBECONFIG={kubeconfig}
if ! command -v helm >/dev/null 2>&1; then
  curl -fsSL {helm_url} | bash
fi

helm repo add ingress-nginx https://kubernetes.github.io/ingress-nginx --force-update >/dev/null
{kubectl} create namespace {namespace} --dry-run=client -o yaml | {kubectl} apply -f -
helm upgrade --install ingress-nginx ingress-nginx/ingress-nginx \
  --namespace {namespace} \
  --set controller.replicaCount={replicas} \
  --set controller.service.type=LoadBalancer \
  --set controller.metrics.enabled=true{version} \
  --wait --timeout {wait}s
echo "{record}|{INGRESS_COMPONENT}|ready"
{cert_manager}"#,
            kubeconfig = distribution.kubeconfig_path(),
            helm_url = shell_quote(addons::HELM_INSTALL_URL),
            replicas = options.replicas,
            wait = addons::INGRESS_READY_WAIT_SECS,
            record = protocol::ADDON,
        ),
    )
}

pub struct IngressInstaller {
    executor: SharedExecutor,
    options: IngressOptions,
    distribution: Distribution,
    acme_email: Option<String>,
    timeout: Duration,
}

impl IngressInstaller {
    pub fn new(
        executor: SharedExecutor,
        options: IngressOptions,
        distribution: Distribution,
        acme_email: Option<String>,
        ssh: &SshOptions,
    ) -> Self {
        // both charts wait on their own
        let wait = Duration::from_secs(2 * addons::INGRESS_READY_WAIT_SECS);
        Self {
            executor,
            options,
            distribution,
            acme_email,
            timeout: ssh.install_timeout() + wait,
        }
    }

    /// Install the charts and check every expected component said ready.
    ///
    /// # Errors
    ///
    /// `RemoteError::Protocol` when the script exits cleanly but a component
    /// never reported ready.
    pub async fn install(&self, leader: &RemoteTarget) -> MeshkubeResult<Vec<String>> {
        tracing::info!(
            leader = %leader.node,
            namespace = %self.options.namespace,
            replicas = self.options.replicas,
            cert_manager = self.options.cert_manager,
            "Installing ingress controller"
        );
        if self.options.cert_manager && self.acme_email.is_none() {
            tracing::warn!("No ACME email or DNS domain; skipping Let's Encrypt issuers");
        }

        let script = install_script(&self.options, self.distribution, self.acme_email.as_deref());
        let output = self.executor.run(leader, &script, self.timeout).await?;

        let ready: Vec<String> = records(&output.stdout, protocol::ADDON)
            .iter()
            .filter(|r| r.field(1) == "ready")
            .map(|r| r.field(0).to_string())
            .collect();

        let mut expected = vec![INGRESS_COMPONENT];
        if self.options.cert_manager {
            expected.push(CERT_MANAGER_COMPONENT);
        }
        if let Some(missing) = expected.iter().find(|c| !ready.iter().any(|r| r == *c)) {
            return Err(RemoteError::Protocol {
                node: leader.node.clone(),
                step: steps::ADDON_INGRESS.to_string(),
                detail: format!("{missing} never reported ready"),
            }
            .into());
        }

        tracing::info!(leader = %leader.node, components = ?ready, "Ingress ready");
        Ok(ready)
    }
}
