//! Optional post-bootstrap work. Every failure here is a warning.

mod dns;
mod gitops;
mod ingress;

pub use dns::{DnsRecord, DnsRegistrar, plan_records, register};
pub use gitops::{GitOpsInstaller, install_script};
pub use ingress::IngressInstaller;
