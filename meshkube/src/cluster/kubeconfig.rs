//! Kubeconfig rewriting.

use meshkube_shared::constants::cluster;

/// Point every loopback `server:` entry at `host`, keeping scheme and port.
pub fn rewrite_server(kubeconfig: &str, host: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    for line in kubeconfig.lines() {
        out.push(rewrite_line(line, host).unwrap_or_else(|| line.to_string()));
    }
    let mut text = out.join("\n");
    if kubeconfig.ends_with('\n') {
        text.push('\n');
    }
    text
}

fn rewrite_line(line: &str, host: &str) -> Option<String> {
    let (indent, value) = line.split_once("server:")?;
    if !indent.trim().is_empty() {
        return None;
    }
    let url = value.trim();
    let rest = url.strip_prefix("https://")?;
    let (current, port) = rest.rsplit_once(':')?;
    cluster::LOOPBACK_SERVERS
        .contains(&current)
        .then(|| format!("{indent}server: https://{host}:{port}"))
}

/// `server:` value of the first cluster entry.
pub fn server_of(kubeconfig: &str) -> Option<&str> {
    kubeconfig
        .lines()
        .find_map(|l| l.trim().strip_prefix("server:"))
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    const K3S_YAML: &str = "apiVersion: v1
clusters:
- cluster:
    certificate-authority-data: LS0t
    server: https://127.0.0.1:6443
  name: default
kind: Config
";

    #[test]
    fn rewrites_loopback_server() {
        let rewritten = rewrite_server(K3S_YAML, "10.8.0.10");
        assert_eq!(server_of(&rewritten), Some("https://10.8.0.10:6443"));
        assert!(rewritten.contains("    server: https://10.8.0.10:6443\n"));
        assert!(rewritten.contains("certificate-authority-data: LS0t"));
        assert!(rewritten.ends_with('\n'));
    }

    #[test]
    fn leaves_real_addresses_alone() {
        let yaml = "    server: https://203.0.113.9:6443\n";
        assert_eq!(rewrite_server(yaml, "10.8.0.10"), yaml);
    }

    #[test]
    fn rewrites_localhost_and_any_address() {
        for host in ["localhost", "0.0.0.0"] {
            let yaml = format!("    server: https://{host}:6443");
            assert_eq!(
                rewrite_server(&yaml, "10.8.0.10"),
                "    server: https://10.8.0.10:6443"
            );
        }
    }
}
