//! meshkube shared definitions
//!
//! Error taxonomy and constants used by the provisioning pipeline and by
//! anything that needs to speak its remote step protocols (simulated fleets,
//! report consumers).

pub mod constants;
pub mod errors;

pub use errors::{
    BastionError, ClusterError, HandshakeShortfall, MeshError, MeshkubeError, MeshkubeResult,
    ProvisionError, RemoteError,
};
