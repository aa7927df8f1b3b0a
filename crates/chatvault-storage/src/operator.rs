//! OpenDAL Operator factories for backup destinations

use std::collections::BTreeMap;
use std::str::FromStr;

use opendal::{Operator, Scheme};

use chatvault_core::config::{StorageConfig, ThirdPartyConfig};

use crate::error::StorageError;

/// S3 credentials, read from the environment only
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

impl S3Credentials {
    /// `CHATVAULT_ACCESS_KEY_ID` / `CHATVAULT_SECRET_ACCESS_KEY`, falling back
    /// to the standard `AWS_*` variables.
    pub fn from_env() -> Result<Self, StorageError> {
        let get = |primary: &str, fallback: &str| {
            std::env::var(primary)
                .or_else(|_| std::env::var(fallback))
                .map_err(|_| StorageError::Config(format!("{primary} (or {fallback}) is not set")))
        };
        Ok(Self {
            access_key_id: get("CHATVAULT_ACCESS_KEY_ID", "AWS_ACCESS_KEY_ID")?,
            secret_access_key: get("CHATVAULT_SECRET_ACCESS_KEY", "AWS_SECRET_ACCESS_KEY")?,
        })
    }
}

/// Build an S3 operator for the first-party backup bucket.
///
/// Path-style addressing (the opendal default) so MinIO and SeaweedFS work
/// for local development. No RetryLayer: the orchestrator owns retries and
/// needs to see every failure to count attempts.
pub fn build_s3_operator(
    storage: &StorageConfig,
    creds: &S3Credentials,
) -> Result<Operator, StorageError> {
    let builder = opendal::services::S3::default()
        .endpoint(&storage.endpoint)
        .region(&storage.region)
        .bucket(&storage.bucket)
        .access_key_id(&creds.access_key_id)
        .secret_access_key(&creds.secret_access_key);

    let op = Operator::new(builder)
        .map_err(|e| StorageError::Config(format!("creating S3 operator: {e}")))?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();
    Ok(op)
}

/// Build the first-party operator, enforcing the TLS policy.
///
/// With `enforce_tls` an HTTP endpoint is an error; without it, a warning.
pub fn build_from_core_config(
    storage: &StorageConfig,
    creds: &S3Credentials,
) -> Result<Operator, StorageError> {
    if storage.endpoint.starts_with("http://") {
        if storage.enforce_tls {
            return Err(StorageError::Config(format!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                storage.endpoint
            )));
        }
        tracing::warn!(
            endpoint = %storage.endpoint,
            "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted. \
             Set storage.enforce_tls = true and use HTTPS in production."
        );
    }
    build_s3_operator(storage, creds)
}

/// Build an operator for a third-party provider from its OpenDAL scheme and
/// options map.
pub fn build_third_party_operator(cfg: &ThirdPartyConfig) -> Result<Operator, StorageError> {
    let scheme = Scheme::from_str(&cfg.scheme)
        .map_err(|e| StorageError::Config(format!("unknown storage scheme '{}': {e}", cfg.scheme)))?;
    let options: BTreeMap<String, String> = cfg.options.clone();
    let op = Operator::via_iter(scheme, options)
        .map_err(|e| StorageError::Config(format!("creating {} operator: {e}", cfg.scheme)))?
        .layer(opendal::layers::LoggingLayer::default());
    Ok(op)
}
