//! ufw script for a node's rule set.

use meshkube_shared::constants::{firewall, steps};

use super::rules::FirewallRule;
use crate::remote::RemoteScript;

/// Reset ufw, apply `rules` on top of deny-incoming and enable it.
///
/// Loopback and routed traffic stay open so pod networking keeps working.
/// The SSH rules come before `enable`, so the session applying the script
/// survives it.
pub fn apply(rules: &[FirewallRule]) -> RemoteScript {
    let allow: String = rules.iter().map(|r| format!("{}\n", r.ufw())).collect();
    RemoteScript::new(
        steps::FIREWALL_APPLY,
        format!(
            r#"set -e
export DEBIAN_FRONTEND=noninteractive
if ! command -v ufw >/dev/null 2>&1; then
  apt-get -o DPkg::Lock::Timeout=300 -q update -y
  apt-get -o DPkg::Lock::Timeout=300 -q install -y ufw
fi

ufw --force reset >/dev/null
ufw default deny incoming
ufw default allow outgoing
ufw default allow routed
sed -i 's/^DEFAULT_FORWARD_POLICY=.*/DEFAULT_FORWARD_POLICY="ACCEPT"/' /etc/default/ufw
ufw allow in on lo
{allow}ufw --force enable

state=$(ufw status | awk '/^Status:/ {{print $2}}')
echo "FIREWALL|${{state:-unknown}}|$(ufw show added | grep -c '{prefix}' || true)"
"#,
            prefix = firewall::COMMENT_PREFIX,
        ),
    )
}
