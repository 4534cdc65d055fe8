//! SSH key material: thumbprints, OpenSSH encoding, authorized keys.
//!
//! The thumbprint is the stable identity of a tunneling client. It doubles
//! as the secondary registry index and as the session-cookie scoping key,
//! so it must be deterministic across reconnects.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use russh::keys::PublicKey;
use sha2::{Digest, Sha256};
use tracing::info;

/// Compute a thumbprint from raw key bytes (SSH wire format).
///
/// SHA256 of the wire-format key, base64 without padding: the same shape
/// `ssh-keygen -l` prints, minus the `SHA256:` prefix so it is safe inside
/// cookie names and URL path segments.
pub fn thumbprint_from_bytes(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hash)
}

/// Compute the thumbprint of a russh public key.
pub fn thumbprint(key: &PublicKey) -> String {
    use russh::keys::PublicKeyBase64;
    thumbprint_from_bytes(&key.public_key_bytes())
}

/// Render a russh public key in OpenSSH one-line format.
pub fn public_key_to_openssh(key: &PublicKey) -> String {
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

/// Parse an OpenSSH-format public key line into a [`PublicKey`].
///
/// Accepts the usual `<type> <base64> [comment]` shape; blank lines and
/// `#` comments return an error so callers can skip them explicitly.
pub fn parse_openssh_public_key(line: &str) -> Result<PublicKey> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Err(anyhow!("not a key line"));
    }
    if trimmed.split_whitespace().nth(1).is_none() {
        return Err(anyhow!("invalid public key line: too few parts"));
    }
    PublicKey::from_openssh(trimmed).map_err(|e| anyhow!("invalid public key: {}", e))
}

/// Load an authorized-keys file into a list of public keys.
///
/// Missing file is not an error at this layer; the caller decides whether
/// an absent allow-list means "open registration".
pub fn load_authorized_keys(path: &Path) -> Result<Vec<PublicKey>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read authorized keys from {}", path.display()))?;

    let mut keys = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let key = parse_openssh_public_key(trimmed)
            .with_context(|| format!("Invalid key in {}", path.display()))?;
        keys.push(key);
    }
    Ok(keys)
}

/// Load a private key from file or generate a new Ed25519 one.
///
/// Used for the gateway host key and for the agent client key.
pub async fn load_or_generate_key(path: &Path) -> Result<russh::keys::PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    if path.exists() {
        info!("Loading key from {}", path.display());
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load key from {}", path.display()))?;
        return Ok(key);
    }

    info!("Generating new Ed25519 key at {}", path.display());
    let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .context("Failed to generate key")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let key_bytes = key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode key")?;
    tokio::fs::write(path, key_bytes.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }

    Ok(key)
}

/// Validate an environment id (safe for DNS labels and tunnel names).
pub fn validate_env_id(env_id: &str) -> Result<()> {
    if env_id.is_empty() {
        return Err(anyhow!("Environment id cannot be empty"));
    }

    if env_id.len() > 64 {
        return Err(anyhow!("Environment id too long (max 64 chars)"));
    }

    for c in env_id.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' {
            return Err(anyhow!(
                "Invalid character '{}' in environment id (only alphanumeric and dash allowed)",
                c
            ));
        }
    }

    if env_id.starts_with('-') || env_id.ends_with('-') {
        return Err(anyhow!("Environment id cannot start or end with '-'"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl test@example.com";

    #[test]
    fn test_thumbprint_deterministic() {
        let a = thumbprint_from_bytes(b"same bytes");
        let b = thumbprint_from_bytes(b"same bytes");
        assert_eq!(a, b);
        assert_ne!(a, thumbprint_from_bytes(b"other bytes"));
        // URL-safe alphabet, no padding
        assert!(!a.contains('='));
        assert!(!a.contains('+'));
        assert!(!a.contains('/'));
    }

    #[test]
    fn test_parse_openssh_public_key() {
        let key = parse_openssh_public_key(TEST_KEY).unwrap();
        assert_eq!(key.algorithm(), russh::keys::Algorithm::Ed25519);

        assert!(parse_openssh_public_key("").is_err());
        assert!(parse_openssh_public_key("# comment").is_err());
        assert!(parse_openssh_public_key("ssh-ed25519").is_err());
    }

    #[test]
    fn test_openssh_round_trip() {
        let key = parse_openssh_public_key(TEST_KEY).unwrap();
        let rendered = public_key_to_openssh(&key);
        let reparsed = parse_openssh_public_key(&rendered).unwrap();
        assert_eq!(thumbprint(&key), thumbprint(&reparsed));
    }

    #[test]
    fn test_validate_env_id() {
        assert!(validate_env_id("my-env-123").is_ok());
        assert!(validate_env_id("abc").is_ok());

        assert!(validate_env_id("").is_err());
        assert!(validate_env_id("-leading").is_err());
        assert!(validate_env_id("trailing-").is_err());
        assert!(validate_env_id("under_score").is_err());
        assert!(validate_env_id("has space").is_err());
    }
}
