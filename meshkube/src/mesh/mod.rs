//! WireGuard full mesh: every node peers with every other node.

mod builder;
mod config;
mod keys;
mod matrix;
mod validator;

pub use builder::{MeshBuild, MeshBuilder, MeshSummary};
pub use config::{MeshMember, MeshPeer, MeshPlan, render, tunnel_count};
pub use keys::{KeyRing, PublicKey};
pub use matrix::ConnectivityMatrix;
pub use validator::{
    HandshakeSample, MeshValidation, MeshValidator, count_active_handshakes, handshake_ready,
};
