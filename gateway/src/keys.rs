//! Client key checks and SSH username parsing.
//!
//! This module handles:
//! - Parsing OpenSSH public key lines and authorized_keys files
//! - Matching a presented key against the keys allowed for an upstream
//! - Computing key fingerprints for logging

use std::collections::HashSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Parse an SSH public key string into (type, base64_data).
///
/// Handles formats like:
/// - "ssh-ed25519 AAAA... comment"
/// - "ssh-rsa AAAA... comment"
pub fn parse_ssh_key(key: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = key.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(anyhow!("Invalid SSH key format: too few parts"));
    }

    let key_type = parts[0].to_string();
    let key_data = parts[1].to_string();

    base64::engine::general_purpose::STANDARD
        .decode(&key_data)
        .with_context(|| "Invalid base64 in SSH key")?;

    Ok((key_type, key_data))
}

/// Reduce a key line to "type base64", dropping the comment.
pub fn normalize_key(key: &str) -> Result<String> {
    let (key_type, key_data) = parse_ssh_key(key)?;
    Ok(format!("{} {}", key_type, key_data))
}

/// Compute the SHA256 fingerprint of an SSH public key.
///
/// Returns the fingerprint in "SHA256:..." format used by `ssh-keygen -l`.
pub fn compute_fingerprint(public_key: &str) -> Result<String> {
    let (_, key_data) = parse_ssh_key(public_key)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&key_data)
        .with_context(|| "Invalid base64 in SSH key")?;
    Ok(compute_fingerprint_from_bytes(&decoded))
}

/// SSH fingerprint = SHA256 of the key in wire format, unpadded base64.
pub fn compute_fingerprint_from_bytes(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();

    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", b64)
}

pub fn compute_fingerprint_from_pubkey(key: &russh::keys::PublicKey) -> String {
    use russh::keys::PublicKeyBase64;
    compute_fingerprint_from_bytes(&key.public_key_bytes())
}

/// Convert a russh public key to "ssh-ed25519 AAAA..." form.
pub fn public_key_to_openssh(key: &russh::keys::PublicKey) -> String {
    use russh::keys::PublicKeyBase64;

    let key_type = match key.algorithm() {
        russh::keys::Algorithm::Ed25519 => "ssh-ed25519",
        russh::keys::Algorithm::Rsa { .. } => "ssh-rsa",
        russh::keys::Algorithm::Ecdsa { curve } => match curve {
            russh::keys::EcdsaCurve::NistP256 => "ecdsa-sha2-nistp256",
            russh::keys::EcdsaCurve::NistP384 => "ecdsa-sha2-nistp384",
            russh::keys::EcdsaCurve::NistP521 => "ecdsa-sha2-nistp521",
        },
        _ => "unknown",
    };

    format!("{} {}", key_type, key.public_key_base64())
}

/// Parse the SSH username a client logged in with.
///
/// Supports formats:
/// - "upstream" -> (upstream, None)
/// - "user+upstream" -> (upstream, Some(user))
pub fn parse_ssh_username(username: &str) -> (String, Option<String>) {
    match username.rsplit_once('+') {
        Some((user, upstream)) => (upstream.to_string(), Some(user.to_string())),
        None => (username.to_string(), None),
    }
}

/// Public keys allowed to log in, normalised to "type base64".
#[derive(Debug, Default, Clone)]
pub struct AuthorizedKeys {
    keys: HashSet<String>,
}

impl AuthorizedKeys {
    /// Collect keys from authorized_keys style lines.
    ///
    /// Blank lines and `#` comments are skipped. A line starting with an
    /// options field (`no-pty ssh-ed25519 AAAA...`) is accepted as long as
    /// the options contain no spaces. Unparseable lines are logged and skipped.
    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> Self {
        let mut keys = HashSet::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parsed = normalize_key(line).or_else(|_| {
                let (_, rest) = line
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| anyhow!("Invalid SSH key format"))?;
                normalize_key(rest)
            });
            match parsed {
                Ok(key) => {
                    if let Ok(fingerprint) = compute_fingerprint(&key) {
                        debug!("Authorized key {}", fingerprint);
                    }
                    keys.insert(key);
                }
                Err(e) => debug!("Skipping authorized key line: {}", e),
            }
        }
        Self { keys }
    }

    /// Read an OpenSSH authorized_keys file.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read authorized keys: {}", path.display()))?;
        Ok(Self::from_lines(content.lines()))
    }

    pub fn extend(&mut self, other: AuthorizedKeys) {
        self.keys.extend(other.keys);
    }

    /// Whether `public_key` (any OpenSSH form) is listed.
    pub fn contains(&self, public_key: &str) -> bool {
        normalize_key(public_key)
            .map(|key| self.keys.contains(&key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
