//! Run configuration read from the process environment.
//!
//! All required values are validated before any connection is opened.
//! The credential blob is decoded and parsed here so that a malformed key
//! fails the run up front with the offending variable's name.

use crate::storage::gcs::ServiceAccountKey;
use crate::util::env as env_util;
use base64::alphabet;
use base64::engine::general_purpose::GeneralPurposeConfig;
use base64::engine::{DecodePaddingMode, GeneralPurpose};
use base64::Engine as _;
use thiserror::Error;

pub const DB_URI_VAR: &str = "DB_URI";
pub const CREDENTIALS_VAR: &str = "GOOGLE_CLOUD_KEY_BASE64";
pub const BUCKET_VAR: &str = "BUCKET_NAME";
pub const SCHEMA_VAR: &str = "DB_SCHEMA";

pub const DEFAULT_SCHEMA: &str = "events_db";

/// Variables that must be present for a run.
pub const REQUIRED_VARS: [&str; 3] = [DB_URI_VAR, CREDENTIALS_VAR, BUCKET_VAR];

const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No {0} env variable")]
    Missing(&'static str),
    #[error("{var} is not valid base64: {source}")]
    InvalidBase64 {
        var: &'static str,
        #[source]
        source: base64::DecodeError,
    },
    #[error("{var} does not decode to a service account key: {source}")]
    InvalidCredentials {
        var: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub db_uri: String,
    pub credentials: ServiceAccountKey,
    pub bucket: String,
    pub schema: String,
}

impl MigrationConfig {
    /// Load from the process environment (after `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_util::env_opt)
    }

    /// Load using `lookup` for each variable. Empty values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |var: &'static str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(var))
        };

        let db_uri = require(DB_URI_VAR)?;
        let encoded = require(CREDENTIALS_VAR)?;
        let bucket = require(BUCKET_VAR)?.trim().to_string();
        let schema = lookup(SCHEMA_VAR)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SCHEMA.to_string());

        let credentials = decode_credentials(&encoded)?;

        Ok(Self {
            db_uri,
            credentials,
            bucket,
            schema,
        })
    }
}

/// Base64-decode then parse a service-account JSON key.
pub fn decode_credentials(encoded: &str) -> Result<ServiceAccountKey, ConfigError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let raw = LENIENT_BASE64
        .decode(compact.as_bytes())
        .map_err(|source| ConfigError::InvalidBase64 {
            var: CREDENTIALS_VAR,
            source,
        })?;
    serde_json::from_slice(&raw).map_err(|source| ConfigError::InvalidCredentials {
        var: CREDENTIALS_VAR,
        source,
    })
}
