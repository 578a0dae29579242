//! DNS records for the API endpoint and every node.

use std::net::IpAddr;

use async_trait::async_trait;
use meshkube_shared::constants::addons;
use meshkube_shared::errors::MeshkubeResult;
use serde::{Deserialize, Serialize};

use crate::node::Node;
use crate::options::DnsOptions;

/// DNS provider collaborator.
#[async_trait]
pub trait DnsRegistrar: Send + Sync {
    /// Create or replace the A/AAAA record `fqdn` → `ip`.
    async fn upsert_a_record(&self, fqdn: &str, ip: IpAddr) -> MeshkubeResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub fqdn: String,
    pub ip: IpAddr,
}

/// `api.<domain>` → leader public IP, then `<node>.<domain>` per node.
pub fn plan_records(options: &DnsOptions, leader: &Node, nodes: &[Node]) -> Vec<DnsRecord> {
    if !options.is_enabled() {
        return Vec::new();
    }
    let domain = options.domain.trim().trim_end_matches('.');
    let mut records = vec![DnsRecord {
        fqdn: format!("{}.{domain}", addons::API_RECORD),
        ip: leader.public_ip,
    }];
    records.extend(nodes.iter().map(|n| DnsRecord {
        fqdn: format!("{}.{domain}", n.name),
        ip: n.public_ip,
    }));
    records
}

/// Upsert every record. Failures are returned as warnings, one per record.
pub async fn register(registrar: &dyn DnsRegistrar, records: &[DnsRecord]) -> Vec<String> {
    let mut warnings = Vec::new();
    for record in records {
        match registrar.upsert_a_record(&record.fqdn, record.ip).await {
            Ok(()) => tracing::info!(fqdn = %record.fqdn, ip = %record.ip, "DNS record upserted"),
            Err(e) => {
                tracing::warn!(fqdn = %record.fqdn, error = %e, "DNS record failed");
                warnings.push(format!("dns {}: {e}", record.fqdn));
            }
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeRegistry, NodeSpec, Provider};
    use crate::options::MeshOptions;
    use meshkube_shared::errors::MeshkubeError;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        records: Mutex<Vec<(String, IpAddr)>>,
    }

    #[async_trait]
    impl DnsRegistrar for Recorder {
        async fn upsert_a_record(&self, fqdn: &str, ip: IpAddr) -> MeshkubeResult<()> {
            if fqdn.starts_with("bad") {
                return Err(MeshkubeError::Infrastructure("zone not found".into()));
            }
            self.records.lock().push((fqdn.to_string(), ip));
            Ok(())
        }
    }

    fn nodes(names: &[&str]) -> Vec<Node> {
        let registry = NodeRegistry::new();
        registry
            .register(
                names
                    .iter()
                    .enumerate()
                    .map(|(i, n)| NodeSpec::new(*n, Provider::Linode, format!("203.0.113.{}", i + 1).parse().unwrap()))
                    .collect(),
                &MeshOptions::default(),
                1,
            )
            .unwrap();
        registry.snapshot()
    }

    #[test]
    fn placeholder_domain_plans_nothing() {
        let nodes = nodes(&["m1"]);
        for domain in ["", "example.com"] {
            let options = DnsOptions {
                domain: domain.into(),
            };
            assert!(plan_records(&options, &nodes[0], &nodes).is_empty());
        }
    }

    #[tokio::test]
    async fn api_record_points_at_leader() {
        let nodes = nodes(&["m1", "bad-w1", "w2"]);
        let options = DnsOptions {
            domain: "k8s.acme.dev.".into(),
        };
        let records = plan_records(&options, &nodes[0], &nodes);
        assert_eq!(records[0].fqdn, "api.k8s.acme.dev");
        assert_eq!(records[0].ip, nodes[0].public_ip);
        assert_eq!(records.len(), 4);

        let recorder = Recorder::default();
        let warnings = register(&recorder, &records).await;
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("bad-w1.k8s.acme.dev"));
        assert_eq!(recorder.records.lock().len(), 3);
    }
}
