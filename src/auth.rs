//! Per-environment signed-cookie sessions.
//!
//! A session binds authenticated-user claims to exactly one
//! (environment, client-key-thumbprint) pair. The cookie is named
//! `preevy-<thumbprint>`, HMAC-SHA256 signed, and domain-scoped to the
//! environment's subdomain, so a session for one pair never authorizes
//! another.

use base64::Engine;
use chrono::Utc;
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

const B64: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Claims carried by a session cookie or a login token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Client-key thumbprint the session is scoped to.
    pub profile: String,
    /// Environment the session is scoped to.
    pub env_id: String,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// Signs and verifies session cookies and login tokens.
pub struct SessionManager {
    key: hmac::Key,
    saas_login_url: Option<String>,
    session_ttl_secs: u64,
}

impl SessionManager {
    pub fn new(secret: &[u8], saas_login_url: Option<String>, session_ttl_secs: u64) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            saas_login_url,
            session_ttl_secs,
        }
    }

    /// Cookie name for a client-key thumbprint.
    pub fn cookie_name(thumbprint: &str) -> String {
        format!("preevy-{}", thumbprint)
    }

    /// Mint claims for a (profile, environment) pair with the configured TTL.
    pub fn claims_for(&self, profile: &str, env_id: &str) -> SessionClaims {
        SessionClaims {
            profile: profile.to_string(),
            env_id: env_id.to_string(),
            exp: Utc::now().timestamp() + self.session_ttl_secs as i64,
        }
    }

    /// Serialize and sign claims into a cookie/token value:
    /// `base64url(json) "." base64url(hmac)`.
    pub fn sign(&self, claims: &SessionClaims) -> String {
        // SessionClaims always serializes
        let payload = serde_json::to_vec(claims).unwrap_or_default();
        let tag = hmac::sign(&self.key, &payload);
        format!("{}.{}", B64.encode(&payload), B64.encode(tag.as_ref()))
    }

    /// Verify a signed value and return its claims (signature + expiry).
    pub fn verify(&self, value: &str) -> Result<SessionClaims, GatewayError> {
        let (payload_b64, tag_b64) = value
            .split_once('.')
            .ok_or_else(|| GatewayError::Unauthorized("malformed session".into()))?;
        let payload = B64
            .decode(payload_b64)
            .map_err(|_| GatewayError::Unauthorized("malformed session".into()))?;
        let tag = B64
            .decode(tag_b64)
            .map_err(|_| GatewayError::Unauthorized("malformed session".into()))?;

        hmac::verify(&self.key, &payload, &tag)
            .map_err(|_| GatewayError::Unauthorized("invalid session signature".into()))?;

        let claims: SessionClaims = serde_json::from_slice(&payload)
            .map_err(|_| GatewayError::Unauthorized("malformed session claims".into()))?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(GatewayError::Unauthorized("session expired".into()));
        }

        Ok(claims)
    }

    /// Verify a session for a specific (environment, thumbprint) pair.
    ///
    /// A valid session for the wrong pair is Forbidden, never silently
    /// accepted.
    pub fn verify_scoped(
        &self,
        value: &str,
        env_id: &str,
        thumbprint: &str,
    ) -> Result<SessionClaims, GatewayError> {
        let claims = self.verify(value)?;
        if claims.env_id != env_id || claims.profile != thumbprint {
            return Err(GatewayError::Forbidden(
                "session not valid for this environment".into(),
            ));
        }
        Ok(claims)
    }

    /// `Set-Cookie` header value for a session, scoped to the tunnel's
    /// subdomain.
    pub fn set_cookie(&self, claims: &SessionClaims, domain: &str) -> String {
        format!(
            "{}={}; Domain={}; Path=/; Max-Age={}; HttpOnly; Secure; SameSite=Lax",
            Self::cookie_name(&claims.profile),
            self.sign(claims),
            domain,
            self.session_ttl_secs,
        )
    }

    /// Login redirect for an unauthenticated request to a private tunnel.
    ///
    /// `None` when no SaaS identity provider is configured; the caller
    /// responds 401.
    pub fn login_redirect(&self, env_id: &str, return_path: &str) -> Option<String> {
        self.saas_login_url.as_ref().map(|base| {
            format!(
                "{}/login?env={}&returnPath={}",
                base.trim_end_matches('/'),
                urlencode(env_id),
                urlencode(return_path),
            )
        })
    }
}

/// Extract a cookie value from a `Cookie` header.
pub fn extract_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then_some(v)
    })
}

/// Minimal percent-encoding for query-string values.
pub fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Decode a percent-encoded query-string value.
pub fn urldecode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = &s[i + 1..i + 3];
                if let Ok(v) = u8::from_str_radix(hex, 16) {
                    out.push(v);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(saas: Option<&str>) -> SessionManager {
        SessionManager::new(b"test-secret", saas.map(String::from), 3600)
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let m = manager(None);
        let claims = m.claims_for("tp1", "env1");
        let value = m.sign(&claims);
        assert_eq!(m.verify(&value).unwrap(), claims);
        assert_eq!(m.verify_scoped(&value, "env1", "tp1").unwrap(), claims);
    }

    #[test]
    fn test_tampered_session_rejected() {
        let m = manager(None);
        let value = m.sign(&m.claims_for("tp1", "env1"));
        let mut tampered = value.clone();
        tampered.pop();
        tampered.push('A');
        assert!(m.verify(&tampered).is_err());

        // Signed by a different secret
        let other = SessionManager::new(b"other-secret", None, 3600);
        assert!(other.verify(&value).is_err());
    }

    #[test]
    fn test_session_never_authorizes_other_pair() {
        let m = manager(None);
        let value = m.sign(&m.claims_for("tp1", "env1"));

        let err = m.verify_scoped(&value, "env2", "tp1").unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
        let err = m.verify_scoped(&value, "env1", "tp2").unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[test]
    fn test_expired_session_rejected() {
        let m = manager(None);
        let claims = SessionClaims {
            profile: "tp1".into(),
            env_id: "env1".into(),
            exp: Utc::now().timestamp() - 10,
        };
        let value = m.sign(&claims);
        assert!(matches!(
            m.verify(&value),
            Err(GatewayError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_login_redirect() {
        let m = manager(Some("https://auth.example.com"));
        let url = m.login_redirect("env1", "/some/path?q=1").unwrap();
        assert!(url.starts_with("https://auth.example.com/login?env=env1&returnPath="));
        assert!(url.contains("%2Fsome%2Fpath%3Fq%3D1"));

        assert!(manager(None).login_redirect("env1", "/").is_none());
    }

    #[test]
    fn test_extract_cookie() {
        let header = "a=1; preevy-tp1=abc.def; b=2";
        assert_eq!(extract_cookie(header, "preevy-tp1"), Some("abc.def"));
        assert_eq!(extract_cookie(header, "preevy-tp2"), None);
    }

    #[test]
    fn test_urlencode_decode_round_trip() {
        let original = "/some/path?q=hello world&x=1";
        assert_eq!(urldecode(&urlencode(original)), original);
    }
}
