use std::error::Error;
use std::fmt;
use tracing::{info, warn};

use crate::agent::state::{ContextError, Role, UserContext};
use crate::config::AuthConfig;

/// Attempts the terminal front end allows before giving up.
pub const MAX_LOGIN_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum AuthError {
    InvalidCredentials,
    InvalidContext(ContextError),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::InvalidCredentials => write!(f, "Incorrect password"),
            AuthError::InvalidContext(e) => write!(f, "{}", e),
        }
    }
}

impl Error for AuthError {}

impl From<ContextError> for AuthError {
    fn from(e: ContextError) -> Self {
        AuthError::InvalidContext(e)
    }
}

pub fn expected_password(role: Role, owner_id: Option<i64>, config: &AuthConfig) -> String {
    match role {
        Role::Admin => config.admin_password.to_lowercase(),
        Role::Viewer => config.viewer_password.to_lowercase(),
        Role::Owner => format!(
            "{}{}",
            config.owner_password_prefix.to_lowercase(),
            owner_id.unwrap_or_default()
        ),
    }
}

/// Checks a password for the requested identity. Comparison ignores case and
/// surrounding whitespace.
pub fn authenticate(
    role: Role,
    owner_id: Option<i64>,
    password: &str,
    config: &AuthConfig,
) -> Result<UserContext, AuthError> {
    let context = UserContext::new(role, owner_id)?;
    if let Some(id) = owner_id {
        if id <= 0 {
            return Err(AuthError::InvalidCredentials);
        }
    }

    if password.trim().to_lowercase() != expected_password(role, owner_id, config) {
        warn!("Failed login attempt for role {}", role);
        return Err(AuthError::InvalidCredentials);
    }

    info!("Authenticated as {}", context.display_name());
    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_passwords_match_roles() {
        let config = AuthConfig::default();
        assert_eq!(authenticate(Role::Admin, None, "admin", &config).unwrap().role, Role::Admin);
        assert_eq!(authenticate(Role::Viewer, None, " Viewer ", &config).unwrap().role, Role::Viewer);

        let owner = authenticate(Role::Owner, Some(3), "LLC3", &config).unwrap();
        assert_eq!(owner.owner_id, Some(3));
    }

    #[test]
    fn owner_password_is_bound_to_owner_id() {
        let config = AuthConfig::default();
        assert_eq!(
            authenticate(Role::Owner, Some(2), "llc3", &config),
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(
            authenticate(Role::Owner, Some(0), "llc0", &config),
            Err(AuthError::InvalidCredentials)
        );
    }

    #[test]
    fn identity_errors_surface_before_password_check() {
        let config = AuthConfig::default();
        assert_eq!(
            authenticate(Role::Owner, None, "llc", &config),
            Err(AuthError::InvalidContext(ContextError::MissingOwnerId))
        );
        assert!(matches!(
            authenticate(Role::Admin, Some(1), "admin", &config),
            Err(AuthError::InvalidContext(ContextError::UnexpectedOwnerId(Role::Admin)))
        ));
    }

    #[test]
    fn configured_passwords_replace_defaults() {
        let config = AuthConfig {
            admin_password: "S3cret".to_string(),
            ..AuthConfig::default()
        };
        assert!(authenticate(Role::Admin, None, "admin", &config).is_err());
        assert!(authenticate(Role::Admin, None, "s3cret", &config).is_ok());
    }
}
