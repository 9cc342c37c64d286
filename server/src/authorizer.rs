use crate::claims::Identity;
use crate::error::AuthorizationError;

/// Credential lookup consulted before any token is issued.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, username: &str, password: &str) -> Result<Identity, AuthorizationError>;
}

/// Accepts any non-empty username regardless of password.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubAuthorizer;

impl Authorizer for StubAuthorizer {
    fn authorize(&self, username: &str, _password: &str) -> Result<Identity, AuthorizationError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AuthorizationError {
                username: username.to_string(),
                reason: "username must not be empty".to_string(),
            });
        }
        Ok(Identity::new(username))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_accepts_any_password() {
        let identity = StubAuthorizer.authorize("grevian", "").unwrap();
        assert_eq!(identity.user, "grevian");
    }

    #[test]
    fn test_stub_rejects_blank_username() {
        let err = StubAuthorizer.authorize("  ", "hunter2").unwrap_err();
        assert_eq!(err.reason, "username must not be empty");
    }
}
