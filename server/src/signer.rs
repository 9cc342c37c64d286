//! Token signing with the server's RSA private key.

use crate::claims::{Claims, Identity};
use crate::config::TokenConfig;
use crate::error::{ConfigError, TokenError};
use jsonwebtoken::{encode, get_current_timestamp, Algorithm, EncodingKey, Header};
use std::path::Path;
use std::time::Duration;

/// Algorithm every issued token is signed with.
pub const ALGORITHM: Algorithm = Algorithm::RS512;

/// Source of the current time in seconds since the epoch.
pub type Clock = Box<dyn Fn() -> u64 + Send + Sync>;

pub struct TokenSigner {
    key: EncodingKey,
    expiration: Duration,
    not_before_skew: Duration,
    clock: Clock,
}

impl TokenSigner {
    pub fn new(key: EncodingKey, config: &TokenConfig) -> Self {
        Self {
            key,
            expiration: config.expiration,
            not_before_skew: config.not_before_skew,
            clock: Box::new(get_current_timestamp),
        }
    }

    pub fn from_rsa_pem(pem: &[u8], config: &TokenConfig) -> Result<Self, jsonwebtoken::errors::Error> {
        Ok(Self::new(EncodingKey::from_rsa_pem(pem)?, config))
    }

    /// Replaces the wall clock used by [`TokenSigner::sign`].
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn from_pem_file(path: &Path, config: &TokenConfig) -> Result<Self, ConfigError> {
        let pem = std::fs::read(path).map_err(|source| ConfigError::ReadKey {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_rsa_pem(&pem, config).map_err(|source| ConfigError::ParseKey {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Signs a fresh token for `identity` valid from now.
    pub fn sign(&self, identity: &Identity) -> Result<String, TokenError> {
        self.sign_at(identity, (self.clock)())
    }

    /// Signs a token as if issued at `now` (seconds since the epoch).
    pub fn sign_at(&self, identity: &Identity, now: u64) -> Result<String, TokenError> {
        let claims = Claims::issue(identity, now, self.expiration, self.not_before_skew);
        Ok(encode(&Header::new(ALGORITHM), &claims, &self.key)?)
    }
}
