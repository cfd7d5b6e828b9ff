//! Username and password verification.

use std::collections::HashMap;
use std::sync::Arc;

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use async_trait::async_trait;
use rand::rngs::OsRng;

use crate::config::UserConfig;

/// Algorithm identifier every stored hash must carry.
pub const PASSWORD_ALGORITHM: &str = "argon2id";

/// The identity behind a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
}

/// Checks a username and password pair.
///
/// The gateway owns no user database; deployments plug their own verifier
/// in here. The bundled [`StaticCredentials`] reads users from config.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, username: &str, password: &str) -> Option<Principal>;
}

struct StoredUser {
    /// PHC string, e.g. `$argon2id$v=19$m=19456,t=2,p=1$...`.
    password_hash: Arc<str>,
    principal: Principal,
}

/// Users declared in the `[[users]]` config tables.
pub struct StaticCredentials {
    users: HashMap<String, StoredUser>,
}

impl StaticCredentials {
    pub fn from_config(users: &[UserConfig]) -> Self {
        let users = users
            .iter()
            .map(|user| {
                let stored = StoredUser {
                    password_hash: Arc::from(user.password_hash.trim()),
                    principal: Principal {
                        user_id: user.id.clone(),
                        email: user.email.clone(),
                        roles: user.roles.clone(),
                    },
                };
                (normalize_username(&user.username), stored)
            })
            .collect();
        Self { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Lowercased, trimmed username. Also the lockout identifier.
pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

/// OWASP baseline for Argon2id: 19 MiB, two passes, one lane.
pub fn default_params() -> Params {
    Params::default()
}

/// Hash `password` into a PHC string with a fresh random salt.
pub fn hash_password(password: &str, params: Params) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
}

/// Verify against a stored PHC string. Parameters come from the string.
pub fn verify_password(password: &str, phc: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(phc) else {
        tracing::warn!("Stored password hash is not a valid PHC string");
        return false;
    };
    if parsed.algorithm.as_str() != PASSWORD_ALGORITHM {
        tracing::warn!(algorithm = %parsed.algorithm, "Stored password hash uses an unsupported algorithm");
        return false;
    }
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[async_trait]
impl CredentialVerifier for StaticCredentials {
    async fn verify(&self, username: &str, password: &str) -> Option<Principal> {
        let user = self.users.get(&normalize_username(username))?;
        let phc = user.password_hash.clone();
        let password = password.to_owned();

        // Argon2 is CPU-bound; keep it off the async workers.
        let matched = tokio::task::spawn_blocking(move || verify_password(&password, &phc))
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "Password verification task failed");
                false
            });
        matched.then(|| user.principal.clone())
    }
}
