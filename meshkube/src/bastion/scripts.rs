//! Bastion hardening and validation scripts.

use meshkube_shared::constants::{bastion, steps};

use crate::options::BastionOptions;
use crate::remote::RemoteScript;

fn ufw_rules(options: &BastionOptions) -> String {
    let port = options.ssh_port;
    let mut rules = String::new();
    if options.allowed_cidrs.iter().any(|c| c.trim() == bastion::OPEN_CIDR) {
        rules.push_str(&format!("ufw allow {port}/tcp\n"));
    } else {
        for cidr in &options.allowed_cidrs {
            rules.push_str(&format!(
                "ufw allow from {} to any port {port} proto tcp\n",
                cidr.trim()
            ));
        }
    }
    rules
}

fn sshd_dropin(options: &BastionOptions) -> String {
    let mut lines = vec![
        "PermitRootLogin prohibit-password".to_string(),
        "PasswordAuthentication no".into(),
        "KbdInteractiveAuthentication no".into(),
        "PubkeyAuthentication yes".into(),
        "X11Forwarding no".into(),
        "AllowAgentForwarding yes".into(),
        "AllowTcpForwarding yes".into(),
        format!("MaxSessions {}", options.max_sessions),
    ];
    if options.idle_timeout_minutes > 0 {
        // ClientAliveCountMax keepalives, one per interval, before disconnecting
        lines.push(format!(
            "ClientAliveInterval {}",
            bastion::CLIENT_ALIVE_INTERVAL_SECS
        ));
        lines.push(format!("ClientAliveCountMax {}", options.idle_timeout_minutes));
    }
    if options.ssh_port != bastion::SSH_PORT {
        lines.push(format!("Port {}", options.ssh_port));
    }
    lines.join("\n")
}

/// Firewall, intrusion prevention and SSH lockdown.
///
/// Firewall rules for the SSH port land before sshd is reloaded so a port
/// change never cuts the session that applies it.
pub fn harden(options: &BastionOptions) -> RemoteScript {
    let audit = if options.audit_log {
        r#"
apt_get install -y auditd audispd-plugins
cat > /etc/audit/rules.d/bastion.rules <<'EOF'
-w /usr/sbin/sshd -p x -k bastion_ssh
-w /var/log/auth.log -p wa -k bastion_auth
EOF
augenrules --load || true
systemctl enable auditd
systemctl restart auditd
"#
    } else {
        ""
    };
    let mfa = if options.mfa {
        "\napt_get install -y libpam-google-authenticator\n"
    } else {
        ""
    };

    RemoteScript::new(
        steps::BASTION_HARDEN,
        format!(
            r#"set -e
export DEBIAN_FRONTEND=noninteractive
apt_get() {{ apt-get -o DPkg::Lock::Timeout=300 -q "$@"; }}

apt_get update -y
apt_get install -y ufw fail2ban

ufw --force reset >/dev/null
ufw default deny incoming
ufw default allow outgoing
{ufw_rules}ufw --force enable

cat > /etc/fail2ban/jail.local <<'EOF'
[DEFAULT]
bantime = {bantime}
findtime = {findtime}
maxretry = {maxretry}

[sshd]
enabled = true
port = {port}
maxretry = {sshd_maxretry}
EOF
systemctl enable fail2ban
systemctl restart fail2ban

mkdir -p "$(dirname {dropin})"
cat > {dropin} <<'EOF'
{sshd}
EOF
sshd -t
systemctl reload ssh 2>/dev/null || systemctl reload sshd
{audit}{mfa}
echo "bastion hardened"
"#,
            ufw_rules = ufw_rules(options),
            bantime = bastion::FAIL2BAN_BANTIME_SECS,
            findtime = bastion::FAIL2BAN_FINDTIME_SECS,
            maxretry = bastion::FAIL2BAN_MAXRETRY,
            sshd_maxretry = bastion::FAIL2BAN_SSHD_MAXRETRY,
            port = options.ssh_port,
            dropin = bastion::SSHD_DROPIN,
            sshd = sshd_dropin(options),
        ),
    )
}

/// Report the state of every service the hardened bastion depends on.
pub fn validate(options: &BastionOptions) -> RemoteScript {
    let audit = if options.audit_log {
        "echo \"SERVICE|auditd|$(systemctl is-active auditd 2>/dev/null)\"\n"
    } else {
        ""
    };
    RemoteScript::new(
        steps::BASTION_VALIDATE,
        format!(
            r#"sshd_state=$(systemctl is-active ssh 2>/dev/null || systemctl is-active sshd 2>/dev/null)
echo "SERVICE|sshd|${{sshd_state:-unknown}}"
if ufw status 2>/dev/null | grep -q "Status: active"; then
  echo "SERVICE|ufw|active"
else
  echo "SERVICE|ufw|inactive"
fi
echo "SERVICE|fail2ban|$(systemctl is-active fail2ban 2>/dev/null)"
{audit}"#
        ),
    )
}
