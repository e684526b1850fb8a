//! Session identity keys.

use std::fmt;

use sha2::{Digest, Sha256};

/// Hash of a recorded session cookie value.
///
/// Recorded identifiers never leave the archive side; the store only sees
/// their digests. The derived ordering fixes the lock order used by re-keying.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_value(value: &str) -> Self {
        Self(Sha256::digest(value.as_bytes()).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_values_hash_equal() {
        assert_eq!(SessionKey::from_value("abc"), SessionKey::from_value("abc"));
        assert_ne!(SessionKey::from_value("abc"), SessionKey::from_value("abd"));
    }

    #[test]
    fn display_is_short_hex() {
        let key = SessionKey::from_value("abc");
        assert_eq!(key.to_string(), "ba7816bf8f01");
    }
}
