use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::{
    config::AuthConfig,
    error::{RegistryError, Result},
};

/// Identity the engine threads through every mutation it performs on the
/// caller's behalf.
#[derive(Debug, Clone)]
pub struct CallerClaims {
    pub user_id: String,
}

/// The only authentication capability the core consumes: map a bearer
/// credential to a caller, or refuse. Issuing credentials belongs to the
/// identity provider, not this crate.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, bearer: &str) -> Result<CallerClaims>;
}

pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Accepts the bearer tokens listed in the configuration, stored as sha-256
/// digests so the config file never holds a usable credential.
pub struct StaticTokenAuthorizer {
    tokens: BTreeMap<String, String>,
    allow_anonymous: bool,
}

impl StaticTokenAuthorizer {
    pub fn from_config(config: &AuthConfig) -> Self {
        let tokens = config
            .tokens
            .iter()
            .map(|entry| (entry.sha256.to_lowercase(), entry.user_id.clone()))
            .collect();
        Self {
            tokens,
            allow_anonymous: config.allow_anonymous,
        }
    }

    /// Single plain-text token, hashed here. Test and bootstrap helper.
    pub fn single(token: &str, user_id: &str) -> Self {
        let mut tokens = BTreeMap::new();
        tokens.insert(sha256_hex(token), user_id.to_string());
        Self {
            tokens,
            allow_anonymous: false,
        }
    }
}

impl Authorizer for StaticTokenAuthorizer {
    fn authorize(&self, bearer: &str) -> Result<CallerClaims> {
        if bearer.is_empty() {
            if self.allow_anonymous {
                return Ok(CallerClaims {
                    user_id: "anonymous".to_string(),
                });
            }
            return Err(RegistryError::Unauthorized);
        }
        match self.tokens.get(&sha256_hex(bearer)) {
            Some(user_id) => Ok(CallerClaims {
                user_id: user_id.clone(),
            }),
            None => Err(RegistryError::Unauthorized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthTokenConfig;

    #[test]
    fn authorizes_known_tokens_only() {
        let authorizer = StaticTokenAuthorizer::single("letmein", "clerk-1");
        assert_eq!(authorizer.authorize("letmein").unwrap().user_id, "clerk-1");
        assert!(matches!(
            authorizer.authorize("wrong"),
            Err(RegistryError::Unauthorized)
        ));
        assert!(matches!(
            authorizer.authorize(""),
            Err(RegistryError::Unauthorized)
        ));
    }

    #[test]
    fn anonymous_access_is_opt_in() {
        let config = AuthConfig {
            allow_anonymous: true,
            tokens: vec![AuthTokenConfig {
                sha256: sha256_hex("secret"),
                user_id: "clerk-2".to_string(),
            }],
        };
        let authorizer = StaticTokenAuthorizer::from_config(&config);
        assert_eq!(authorizer.authorize("").unwrap().user_id, "anonymous");
        assert_eq!(authorizer.authorize("secret").unwrap().user_id, "clerk-2");
    }
}
