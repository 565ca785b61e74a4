//! Shared-secret authentication for the raft transport.
//!
//! When a `ClusterSecret` is configured, every raft TCP frame carries an
//! HMAC-SHA256 tag over its payload. Frames with a bad tag are dropped
//! before deserialization.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// HMAC tag length (SHA-256 output).
pub const TAG_LEN: usize = 32;

/// The cluster-wide raft transport secret.
///
/// `Debug` redacts the key.
pub struct ClusterSecret {
    key: Vec<u8>,
}

impl ClusterSecret {
    pub fn from_password(password: &str) -> Self {
        Self {
            key: password.as_bytes().to_vec(),
        }
    }

    /// Reads the password from a file, ignoring trailing whitespace.
    pub fn from_file(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        let password = contents.trim_end();
        if password.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "cluster auth password file is empty",
            ));
        }
        Ok(Self::from_password(password))
    }

    pub fn sign(&self, payload: &[u8]) -> [u8; TAG_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(payload);
        mac.finalize().into_bytes().into()
    }

    /// Constant-time tag check.
    pub fn verify(&self, payload: &[u8], tag: &[u8]) -> bool {
        if tag.len() != TAG_LEN {
            return false;
        }
        bool::from(self.sign(payload).ct_eq(tag))
    }
}

impl std::fmt::Debug for ClusterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSecret")
            .field("key", &"[redacted]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_checks() {
        let secret = ClusterSecret::from_password("raft-secret");
        let tag = secret.sign(b"append entries");
        assert!(secret.verify(b"append entries", &tag));
        assert!(!secret.verify(b"vote", &tag));
        assert!(!secret.verify(b"append entries", &tag[..16]));
        assert!(!ClusterSecret::from_password("other").verify(b"append entries", &tag));
    }

    #[test]
    fn password_file_is_trimmed() {
        let path = std::env::temp_dir().join(format!("tessera-secret-{}", std::process::id()));
        std::fs::write(&path, "hunter2\n").unwrap();
        let from_file = ClusterSecret::from_file(&path).unwrap();
        std::fs::write(&path, "  \n").unwrap();
        assert!(ClusterSecret::from_file(&path).is_err());
        std::fs::remove_file(&path).unwrap();

        let tag = ClusterSecret::from_password("hunter2").sign(b"x");
        assert!(from_file.verify(b"x", &tag));
    }

    #[test]
    fn debug_redacts_secret() {
        let debug = format!("{:?}", ClusterSecret::from_password("super-secret"));
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("redacted"));
    }
}
