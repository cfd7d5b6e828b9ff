//! Token payloads and stored revocation records.

use serde::{Deserialize, Serialize};

/// Caller-supplied claims attached to a new token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub email: Option<String>,
    pub roles: Vec<String>,
}

/// Claims carried inside every access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (user id).
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Issued-at, seconds since epoch.
    pub iat: u64,
    /// Issued-at, milliseconds since epoch. Compared against user
    /// invalidation marks, so second precision is not enough.
    pub iat_ms: u64,
    /// Expiry, seconds since epoch.
    pub exp: u64,
    /// Unique token id.
    pub jti: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

impl AccessClaims {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Result of a successful issuance.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub access_token: String,
    pub token_type: &'static str,
    /// Lifetime in seconds.
    pub expires_in: u64,
    /// Expiry, seconds since epoch.
    pub expires_at: u64,
}

/// Value stored under `revoked:{token hash}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedTokenEntry {
    pub owner_user_id: Option<String>,
    /// The token's own expiry, seconds since epoch.
    pub expires_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_skip_empty_optionals() {
        let claims = AccessClaims {
            sub: "u-1".into(),
            email: None,
            roles: vec!["editor".into()],
            iat: 10,
            iat_ms: 10_500,
            exp: 70,
            jti: "j".into(),
            iss: None,
        };
        let json = serde_json::to_value(&claims).unwrap();
        assert!(json.get("email").is_none());
        assert!(json.get("iss").is_none());
        assert_eq!(json["iat_ms"], 10_500);
        assert!(claims.has_role("editor"));
        assert!(!claims.has_role("admin"));
    }
}
