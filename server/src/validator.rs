//! Bearer token verification for game stream establishment.

use crate::claims::Claims;
use crate::error::{AuthError, ConfigError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::debug;
use serde::Deserialize;
use shared::{Metadata, AUTHORIZATION_KEY};
use std::path::Path;

const BEARER_PREFIX: &str = "Bearer ";

/// Only the header field needed to reject non-RSA tokens before decoding.
#[derive(Deserialize)]
struct RawHeader {
    alg: String,
}

pub struct TokenValidator {
    key: DecodingKey,
}

impl TokenValidator {
    pub fn from_rsa_pem(pem: &[u8]) -> Result<Self, jsonwebtoken::errors::Error> {
        Ok(Self {
            key: DecodingKey::from_rsa_pem(pem)?,
        })
    }

    pub fn from_pem_file(path: &Path) -> Result<Self, ConfigError> {
        let pem = std::fs::read(path).map_err(|source| ConfigError::ReadKey {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_rsa_pem(&pem).map_err(|source| ConfigError::ParseKey {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Extracts the bearer token from stream metadata and validates it.
    pub fn validate(&self, metadata: &Metadata) -> Result<Claims, AuthError> {
        let raw = metadata
            .get(AUTHORIZATION_KEY)
            .ok_or(AuthError::MissingMetadata)?;
        let token = raw.strip_prefix(BEARER_PREFIX).unwrap_or(raw.as_str()).trim();
        if token.is_empty() {
            return Err(AuthError::MissingMetadata);
        }
        self.validate_token(token)
    }

    /// Checks the signature, algorithm family and validity window of `token`.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let algorithm = rsa_algorithm(token)?;

        let mut validation = Validation::new(algorithm);
        validation.leeway = 0;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "nbf"]);

        let data = decode::<Claims>(token, &self.key, &validation).map_err(|e| {
            debug!("token rejected: {}", e);
            match e.kind() {
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::ImmatureSignature => AuthError::NotYetValid,
                ErrorKind::InvalidAlgorithm => {
                    AuthError::UnexpectedAlgorithm(format!("{:?}", algorithm))
                }
                _ => AuthError::Malformed(e.to_string()),
            }
        })?;

        Ok(data.claims)
    }
}

/// Reads the `alg` header and accepts only the RSA signature family.
///
/// The header is parsed by hand so that algorithms the decoding library does
/// not model at all, such as `none`, are reported the same way as HMAC ones.
fn rsa_algorithm(token: &str) -> Result<Algorithm, AuthError> {
    let header = token
        .split('.')
        .next()
        .filter(|segment| !segment.is_empty())
        .ok_or_else(|| AuthError::Malformed("token has no header".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|e| AuthError::Malformed(e.to_string()))?;
    let header: RawHeader =
        serde_json::from_slice(&bytes).map_err(|e| AuthError::Malformed(e.to_string()))?;

    match header.alg.as_str() {
        "RS256" => Ok(Algorithm::RS256),
        "RS384" => Ok(Algorithm::RS384),
        "RS512" => Ok(Algorithm::RS512),
        other => Err(AuthError::UnexpectedAlgorithm(other.to_string())),
    }
}
