//! Remote scripts used to prepare a node.

use meshkube_shared::constants::{protocol, provision, steps};

use crate::remote::RemoteScript;

/// Shell helper printing one `CHECK|name|ok|detail` line per command.
const CHECK_FN: &str = r#"check() {
  name="$1"; shift
  if out=$("$@" 2>&1); then
    echo "CHECK|${name}|ok|$(printf '%s' "$out" | head -n1)"
  else
    echo "CHECK|${name}|fail|$(printf '%s' "$out" | head -n1)"
  fi
}"#;

pub fn cloud_init_wait(wait_secs: u64) -> RemoteScript {
    RemoteScript::new(
        steps::CLOUD_INIT_WAIT,
        format!(
            r#"if command -v cloud-init >/dev/null 2>&1; then
  if ! timeout {wait_secs} cloud-init status --wait >/dev/null 2>&1; then
    echo "cloud-init not done after {wait_secs}s, continuing"
  fi
fi
echo "cloud-init settled"
"#
        ),
    )
}

/// Wait for apt/dpkg locks, forcing recovery once the wait runs out.
///
/// Exits with [`provision::LOCK_HELD_EXIT_CODE`] if the lock survives
/// recovery.
pub fn lock_wait(wait_secs: u64, poll_secs: u64) -> RemoteScript {
    let locks = provision::LOCK_FILES.join(" ");
    let poll = poll_secs.max(1);
    let held_exit = provision::LOCK_HELD_EXIT_CODE;
    let forced = protocol::LOCK_FORCED;
    RemoteScript::new(
        steps::PROVISION_LOCK_WAIT,
        format!(
            r#"LOCKS="{locks}"
lock_held() {{
  command -v fuser >/dev/null 2>&1 || return 1
  for l in $LOCKS; do
    if [ -e "$l" ] && fuser "$l" >/dev/null 2>&1; then return 0; fi
  done
  return 1
}}
waited=0
while lock_held && [ "$waited" -lt {wait_secs} ]; do
  echo "package manager busy (${{waited}}s/{wait_secs}s)"
  sleep {poll}
  waited=$((waited + {poll}))
done
if lock_held; then
  echo "lock still held after {wait_secs}s, clearing stale locks"
  systemctl stop unattended-upgrades >/dev/null 2>&1 || true
  for p in apt apt-get dpkg unattended-upgrade; do pkill -9 -x "$p" >/dev/null 2>&1 || true; done
  sleep 2
  rm -f $LOCKS
  dpkg --configure -a || true
  echo "{forced}"
fi
if lock_held; then
  echo "package manager lock still held after recovery" >&2
  exit {held_exit}
fi
echo "package manager lock free"
"#
        ),
    )
}

/// Install container runtime, WireGuard tooling and kernel settings.
///
/// Every step converges: rerunning against a prepared node changes nothing.
pub fn install() -> RemoteScript {
    let modules = provision::KERNEL_MODULES.join("\n");
    RemoteScript::new(
        steps::PROVISION_INSTALL,
        format!(
            r#"set -e
export DEBIAN_FRONTEND=noninteractive
apt_get() {{ apt-get -o DPkg::Lock::Timeout=120 -q "$@"; }}

apt_get update -y
apt_get install -y ca-certificates curl gnupg psmisc netcat-openbsd wireguard wireguard-tools

if ! command -v docker >/dev/null 2>&1; then
  curl -fsSL https://get.docker.com | sh
fi
systemctl enable --now docker

swapoff -a
sed -i -E 's/^([^#].*[[:space:]]swap[[:space:]].*)$/#\1/' /etc/fstab

cat > /etc/modules-load.d/meshkube.conf <<'EOF'
{modules}
EOF
for m in {module_list}; do modprobe "$m"; done

cat > /etc/sysctl.d/99-meshkube.conf <<'EOF'
net.ipv4.ip_forward = 1
net.bridge.bridge-nf-call-iptables = 1
net.bridge.bridge-nf-call-ip6tables = 1
EOF
sysctl --system >/dev/null

echo "install finished"
"#,
            module_list = provision::KERNEL_MODULES.join(" "),
        ),
    )
}

/// Confirm the installer's work without trusting its exit status.
pub fn verify() -> RemoteScript {
    RemoteScript::new(
        steps::PROVISION_VERIFY,
        format!(
            r#"{CHECK_FN}
check docker docker --version
check docker-daemon systemctl is-active docker
check wireguard wg --version
"#
        ),
    )
}

/// Authoritative readiness gate, one check per prerequisite.
pub fn validate(disk_ceiling_percent: u8) -> RemoteScript {
    RemoteScript::new(
        steps::PROVISION_VALIDATE,
        format!(
            r#"{CHECK_FN}
check docker docker --version
check docker-daemon systemctl is-active docker
check wireguard wg --version
ipf=$(sysctl -n net.ipv4.ip_forward 2>/dev/null || echo 0)
if [ "$ipf" = "1" ]; then
  echo "CHECK|ip_forward|ok|net.ipv4.ip_forward=1"
else
  echo "CHECK|ip_forward|fail|net.ipv4.ip_forward=$ipf"
fi
for mod in {modules}; do
  if [ -d "/sys/module/$mod" ]; then
    echo "CHECK|$mod|ok|loaded"
  else
    echo "CHECK|$mod|fail|not loaded"
  fi
done
usage=$(df --output=pcent / 2>/dev/null | tail -n1 | tr -dc '0-9')
usage=${{usage:-100}}
if [ "$usage" -le {disk_ceiling_percent} ]; then
  echo "CHECK|disk|ok|root usage ${{usage}}%"
else
  echo "CHECK|disk|fail|root usage ${{usage}}% exceeds {disk_ceiling_percent}%"
fi
"#,
            modules = provision::KERNEL_MODULES.join(" "),
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::step_of;

    #[test]
    fn lock_wait_embeds_bounds_and_exit_code() {
        let script = lock_wait(300, 5);
        let text = script.text();
        assert_eq!(step_of(text), Some(steps::PROVISION_LOCK_WAIT));
        assert!(text.contains(r#"[ "$waited" -lt 300 ]"#));
        assert!(text.contains("sleep 5"));
        assert!(text.contains("exit 75"));
        assert!(text.contains("dpkg --configure -a"));
        assert!(text.contains("/var/lib/dpkg/lock-frontend"));
    }

    #[test]
    fn install_is_guarded() {
        let text = install().text().to_string();
        assert!(text.contains("if ! command -v docker"));
        assert!(text.contains("wireguard-tools"));
        assert!(text.contains("overlay\nbr_netfilter"));
        // overwrites rather than appends
        assert!(!text.contains(">> /etc/sysctl"));
    }

    #[test]
    fn validate_checks_every_prerequisite() {
        let text = validate(85).text().to_string();
        for needle in [
            "check docker docker --version",
            "check docker-daemon systemctl is-active docker",
            "check wireguard wg --version",
            "CHECK|ip_forward|ok",
            "for mod in overlay br_netfilter",
            "-le 85",
        ] {
            assert!(text.contains(needle), "missing {needle}");
        }
    }
}
