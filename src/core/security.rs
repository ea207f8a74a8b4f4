use std::collections::HashMap;
use std::env;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::core::config::AuthSettings;
use crate::core::errors::ApiError;

const BEARER_PREFIX: &str = "Bearer ";
const ENV_ADMIN_TOKEN: &str = "TABULA_ADMIN_TOKEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

/// Identity resolved from a bearer credential.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub role: Role,
}

/// Token table acting as the opaque credential-validation seam.
///
/// Tokens come from settings; `TABULA_ADMIN_TOKEN` adds an admin entry
/// for bootstrap deployments without a config file.
#[derive(Debug, Clone)]
pub struct Authenticator {
    tokens: HashMap<String, AuthUser>,
}

impl Authenticator {
    pub fn from_settings(auth: &AuthSettings) -> Self {
        let mut tokens = HashMap::new();
        for entry in &auth.tokens {
            if entry.token.trim().is_empty() {
                continue;
            }
            tokens.insert(
                entry.token.clone(),
                AuthUser {
                    user_id: entry.user_id.clone(),
                    role: entry.role,
                },
            );
        }

        if let Ok(token) = env::var(ENV_ADMIN_TOKEN) {
            if !token.trim().is_empty() {
                tokens.insert(
                    token,
                    AuthUser {
                        user_id: "admin".to_string(),
                        role: Role::Admin,
                    },
                );
            }
        }

        Authenticator { tokens }
    }

    /// Resolve the bearer credential to a user, 401 otherwise.
    pub fn require_user(&self, headers: &HeaderMap) -> Result<AuthUser, ApiError> {
        let header_value = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");

        let Some(token) = header_value.strip_prefix(BEARER_PREFIX) else {
            return Err(ApiError::Unauthorized);
        };

        self.tokens
            .get(token.trim())
            .cloned()
            .ok_or(ApiError::Unauthorized)
    }

    /// Like `require_user`, but 403 for valid non-admin users.
    pub fn require_admin(&self, headers: &HeaderMap) -> Result<AuthUser, ApiError> {
        let user = self.require_user(headers)?;
        if user.role != Role::Admin {
            return Err(ApiError::Forbidden);
        }
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TokenEntry;
    use axum::http::HeaderValue;

    fn authenticator() -> Authenticator {
        Authenticator::from_settings(&AuthSettings {
            tokens: vec![
                TokenEntry {
                    token: "admin-secret".to_string(),
                    user_id: "root".to_string(),
                    role: Role::Admin,
                },
                TokenEntry {
                    token: "user-secret".to_string(),
                    user_id: "alice".to_string(),
                    role: Role::User,
                },
            ],
        })
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn require_user_accepts_valid_bearer_token() {
        let auth = authenticator();
        let user = auth.require_user(&bearer("user-secret")).unwrap();
        assert_eq!(user.user_id, "alice");
        assert_eq!(user.role, Role::User);
    }

    #[test]
    fn require_user_rejects_missing_or_invalid_credential() {
        let auth = authenticator();

        let missing = auth.require_user(&HeaderMap::new());
        assert!(matches!(missing, Err(ApiError::Unauthorized)));

        let invalid = auth.require_user(&bearer("wrong"));
        assert!(matches!(invalid, Err(ApiError::Unauthorized)));

        let mut malformed = HeaderMap::new();
        malformed.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("user-secret"),
        );
        assert!(matches!(
            auth.require_user(&malformed),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn require_admin_rejects_plain_users_with_forbidden() {
        let auth = authenticator();

        let admin = auth.require_admin(&bearer("admin-secret"));
        assert!(admin.is_ok());

        let user = auth.require_admin(&bearer("user-secret"));
        assert!(matches!(user, Err(ApiError::Forbidden)));
    }
}
