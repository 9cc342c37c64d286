use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Who a credential was issued to, as established by the authorizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
}

impl Identity {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

/// Token body. Timestamps are seconds since the Unix epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub user: String,
    pub iat: u64,
    pub nbf: u64,
    pub exp: u64,
}

impl Claims {
    /// Claims for a token issued at `now`.
    ///
    /// `nbf` is backdated by `not_before_skew` so clients with slightly
    /// lagging clocks can use the token straight away.
    pub fn issue(
        identity: &Identity,
        now: u64,
        expiration: Duration,
        not_before_skew: Duration,
    ) -> Self {
        Self {
            user: identity.user.clone(),
            iat: now,
            nbf: now.saturating_sub(not_before_skew.as_secs()),
            exp: now + expiration.as_secs(),
        }
    }

    pub fn is_valid_at(&self, now: u64) -> bool {
        self.nbf <= now && now < self.exp
    }
}
