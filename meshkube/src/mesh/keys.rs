//! WireGuard public keys and the key-generation barrier output.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use meshkube_shared::constants::{mesh, steps};
use meshkube_shared::errors::MeshError;
use serde::{Deserialize, Serialize};

use crate::node::NodeIndex;
use crate::remote::RemoteScript;

/// Base64-encoded Curve25519 public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(String);

impl PublicKey {
    /// Parse the key a node printed, rejecting anything that is not 32
    /// base64-encoded bytes.
    pub fn parse(node: &str, raw: &str) -> Result<Self, MeshError> {
        let key = raw.trim();
        match STANDARD.decode(key) {
            Ok(bytes) if bytes.len() == mesh::KEY_LEN => Ok(Self(key.to_string())),
            _ => Err(MeshError::InvalidKey {
                node: node.to_string(),
                key: key.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Every mesh member's public key. Complete by construction: a ring is
/// only built once all keys are in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRing {
    keys: BTreeMap<NodeIndex, PublicKey>,
}

impl KeyRing {
    pub fn from_keys(keys: impl IntoIterator<Item = (NodeIndex, PublicKey)>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    pub fn get(&self, index: NodeIndex) -> Option<&PublicKey> {
        self.keys.get(&index)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Generate a keypair once and print the public half.
///
/// An existing private key is reused, so reruns keep peers' configs valid.
pub fn keygen_script() -> RemoteScript {
    RemoteScript::new(
        steps::MESH_KEYGEN,
        format!(
            r#"set -e
umask 077
mkdir -p {dir}
cd {dir}
if [ ! -s privatekey ]; then
  wg genkey > privatekey
fi
wg pubkey < privatekey > publickey
cat publickey
"#,
            dir = mesh::CONFIG_DIR
        ),
    )
}

/// Public key from keygen output: the last non-empty line.
pub fn parse_keygen_output(node: &str, stdout: &str) -> Result<PublicKey, MeshError> {
    let line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("");
    PublicKey::parse(node, line)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";

    #[test]
    fn parses_valid_key() {
        let key = PublicKey::parse("n1", &format!("  {KEY}\n")).unwrap();
        assert_eq!(key.as_str(), KEY);
    }

    #[test]
    fn rejects_wrong_length_and_garbage() {
        assert!(PublicKey::parse("n1", "aGVsbG8=").is_err());
        assert!(PublicKey::parse("n1", "not a key").is_err());
        assert!(PublicKey::parse("n1", "").is_err());
    }

    #[test]
    fn keygen_output_uses_last_line() {
        let out = format!("some warning\n{KEY}\n\n");
        assert_eq!(parse_keygen_output("n1", &out).unwrap().as_str(), KEY);
    }

    #[test]
    fn keygen_reuses_existing_private_key() {
        let text = keygen_script().text().to_string();
        assert!(text.contains("if [ ! -s privatekey ]"));
        assert!(text.contains("umask 077"));
    }

    #[test]
    fn ring_is_keyed_by_node_index() {
        let ring = KeyRing::from_keys([(NodeIndex(3), PublicKey(KEY.into()))]);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.get(NodeIndex(3)).map(PublicKey::as_str), Some(KEY));
        assert!(ring.get(NodeIndex(0)).is_none());
    }
}
