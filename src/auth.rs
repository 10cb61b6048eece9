//! Access policy of the admin API. The runtime (`/api/...`) routes are public:
//! who may call an endpoint is part of what its flow does.

use crate::config::schema::{str_to_hex_hash, AccessSettings, HttpFrontend};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Anonymous,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// A token is required and none was sent
    Unauthorized,
    /// The token doesn't match
    WrongPassword,
    /// The admin API is switched off
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    pub admin: AccessSettings,
}

impl AccessPolicy {
    pub fn from_config(config: &HttpFrontend) -> Self {
        Self {
            admin: config.admin_access.clone(),
        }
    }

    pub fn free_for_all() -> Self {
        Self {
            admin: AccessSettings::Any,
        }
    }

    pub fn with_admin_disabled(self) -> Self {
        Self {
            admin: AccessSettings::Off,
        }
    }

    pub fn with_admin_password(self, password: &str) -> Self {
        Self {
            admin: AccessSettings::Password {
                sha256_hash: str_to_hex_hash(password),
            },
        }
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: Option<&str>) -> Option<String> {
    header
        .and_then(|h| h.strip_prefix("Bearer ").or_else(|| h.strip_prefix("bearer ")))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

pub fn token_to_principal(
    token: Option<String>,
    policy: &AccessPolicy,
) -> Result<Principal, AuthError> {
    match (token, &policy.admin) {
        (_, AccessSettings::Off) => Err(AuthError::Disabled),
        // A stray token is ignored when anyone may administer
        (_, AccessSettings::Any) => Ok(Principal::Anonymous),
        (None, AccessSettings::Password { .. }) => Err(AuthError::Unauthorized),
        (Some(t), AccessSettings::Password { sha256_hash })
            if str_to_hex_hash(&t) == sha256_hash.as_str() =>
        {
            Ok(Principal::Admin)
        }
        (Some(_), AccessSettings::Password { .. }) => Err(AuthError::WrongPassword),
    }
}
