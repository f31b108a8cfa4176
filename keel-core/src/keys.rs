//! SSH public key parsing and fingerprints.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::error::{ProvisionError, Result};

/// An OpenSSH public key line (`<type> <base64 blob> [comment]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    line: String,
}

impl PublicKey {
    pub fn parse(line: &str) -> Result<Self> {
        decode_blob(line)?;
        Ok(Self {
            line: line.trim().to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.line
    }

    pub fn key_type(&self) -> &str {
        self.line.split_whitespace().next().unwrap_or_default()
    }

    pub fn fingerprint(&self) -> String {
        // Parsed on construction, so the blob decodes.
        fingerprint(&self.line).unwrap_or_default()
    }
}

/// OpenSSH `SHA256:` fingerprint of a public key line. The comment is ignored.
pub fn fingerprint(line: &str) -> Result<String> {
    let blob = decode_blob(line)?;
    let digest = Sha256::digest(&blob);
    Ok(format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)))
}

fn decode_blob(line: &str) -> Result<Vec<u8>> {
    let mut parts = line.split_whitespace();
    let (Some(key_type), Some(encoded)) = (parts.next(), parts.next()) else {
        return Err(ProvisionError::Validation(
            "public key must be '<type> <base64> [comment]'".to_string(),
        ));
    };

    let blob = STANDARD
        .decode(encoded)
        .map_err(|e| ProvisionError::Validation(format!("public key is not valid base64: {}", e)))?;

    // The blob starts with the length-prefixed key type and must agree with the line.
    let embedded = blob
        .get(..4)
        .map(|len| u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize)
        .and_then(|len| blob.get(4..4 + len));
    if embedded != Some(key_type.as_bytes()) {
        return Err(ProvisionError::Validation(format!(
            "public key blob does not match key type '{}'",
            key_type
        )));
    }

    Ok(blob)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a structurally valid ed25519 public key line from a seed byte.
    pub(crate) fn sample_key(seed: u8, comment: &str) -> String {
        let key_type = b"ssh-ed25519";
        let mut blob = Vec::new();
        blob.extend_from_slice(&(key_type.len() as u32).to_be_bytes());
        blob.extend_from_slice(key_type);
        blob.extend_from_slice(&32u32.to_be_bytes());
        blob.extend_from_slice(&[seed; 32]);
        format!("ssh-ed25519 {} {}", STANDARD.encode(blob), comment)
    }

    #[test]
    fn test_fingerprint_ignores_comment() {
        let a = fingerprint(&sample_key(1, "alice@laptop")).unwrap();
        let b = fingerprint(&sample_key(1, "deploy")).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("SHA256:"));
        assert!(!a.ends_with('='));
    }

    #[test]
    fn test_different_keys_differ() {
        let a = fingerprint(&sample_key(1, "x")).unwrap();
        let b = fingerprint(&sample_key(2, "x")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            fingerprint("not-a-key"),
            Err(ProvisionError::Validation(_))
        ));
        assert!(matches!(
            fingerprint("ssh-ed25519 !!!notbase64"),
            Err(ProvisionError::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_type_mismatch() {
        let line = sample_key(1, "x").replacen("ssh-ed25519", "ssh-rsa", 1);
        assert!(matches!(fingerprint(&line), Err(ProvisionError::Validation(_))));
    }

    #[test]
    fn test_public_key_parse() {
        let key = PublicKey::parse(&format!("  {}\n", sample_key(3, "c"))).unwrap();
        assert_eq!(key.key_type(), "ssh-ed25519");
        assert_eq!(key.fingerprint(), fingerprint(&sample_key(3, "c")).unwrap());
    }
}
