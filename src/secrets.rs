//! Secure secret management module
//!
//! Loads the credential vault master key. Secrets come from the 1Password CLI
//! when available, with an environment variable fallback, and are held in
//! `Zeroizing` buffers so they are wiped when dropped.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::env;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

/// Required master key size (AES-256)
pub const MASTER_KEY_LEN: usize = 32;

pub const MASTER_KEY_ENV: &str = "VAULT_MASTER_KEY";
pub const MASTER_KEY_OP_REF_ENV: &str = "VAULT_MASTER_KEY_OP_REF";
const DEFAULT_MASTER_KEY_OP_REF: &str = "op://signal-dispatch/vault/master_key";

/// Error type for secret loading operations
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Secret not found: {0}")]
    NotFound(String),

    #[error("1Password CLI error: {0}")]
    OnePasswordError(String),

    #[error("Environment variable not set: {0}")]
    EnvVarNotSet(String),

    #[error("Secret validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for secret loading
#[derive(Debug, Clone)]
pub struct SecretConfig {
    /// Whether to allow loading secrets from environment variables
    pub allow_env_vars: bool,

    /// Whether to require 1Password CLI
    pub require_op_cli: bool,
}

impl Default for SecretConfig {
    fn default() -> Self {
        Self {
            allow_env_vars: true,
            require_op_cli: false,
        }
    }
}

impl SecretConfig {
    pub fn from_env() -> Self {
        let flag = |name: &str| {
            env::var(name)
                .ok()
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1"))
        };
        let defaults = Self::default();
        Self {
            allow_env_vars: flag("SECRETS_ALLOW_ENV").unwrap_or(defaults.allow_env_vars),
            require_op_cli: flag("SECRETS_REQUIRE_OP").unwrap_or(defaults.require_op_cli),
        }
    }
}

/// Load a secret from 1Password CLI or environment variable (with fallback)
pub fn load_secret(
    op_reference: &str,
    env_var_name: &str,
    config: &SecretConfig,
) -> Result<Zeroizing<String>, SecretError> {
    match load_from_op_cli(op_reference) {
        Ok(secret) => {
            info!("✓ Loaded secret from 1Password CLI: {}", env_var_name);
            return Ok(secret);
        }
        Err(e) => {
            if config.require_op_cli {
                error!("1Password CLI required but failed: {}", e);
                return Err(e);
            }
            warn!("1Password CLI not available: {}", e);
        }
    }

    if config.allow_env_vars {
        warn!("Loading secret from environment variable: {}", env_var_name);
        load_from_env(env_var_name)
    } else {
        error!(
            "Secret loading failed: 1Password CLI unavailable and env vars disabled for {}",
            env_var_name
        );
        Err(SecretError::NotFound(env_var_name.to_string()))
    }
}

/// Load a secret from 1Password CLI
fn load_from_op_cli(reference: &str) -> Result<Zeroizing<String>, SecretError> {
    use std::process::Command;

    let output = Command::new("op")
        .arg("read")
        .arg(reference)
        .output()
        .map_err(|e| {
            SecretError::OnePasswordError(format!("Failed to execute 'op' command: {}", e))
        })?;

    if !output.status.success() {
        let error_msg = String::from_utf8_lossy(&output.stderr);
        return Err(SecretError::OnePasswordError(format!(
            "1Password CLI failed: {}",
            error_msg
        )));
    }

    let secret = Zeroizing::new(
        String::from_utf8(output.stdout)
            .map_err(|e| {
                SecretError::OnePasswordError(format!("Invalid UTF-8 from 1Password: {}", e))
            })?
            .trim()
            .to_string(),
    );

    if secret.is_empty() {
        return Err(SecretError::OnePasswordError(
            "1Password returned empty secret".to_string(),
        ));
    }

    Ok(secret)
}

/// Load a secret from environment variable (wrapped in Zeroizing)
fn load_from_env(env_var_name: &str) -> Result<Zeroizing<String>, SecretError> {
    env::var(env_var_name)
        .map(Zeroizing::new)
        .map_err(|_| SecretError::EnvVarNotSet(env_var_name.to_string()))
}

/// Decode a master key given as base64 or hex; it must be exactly 32 bytes
pub fn decode_master_key(raw: &str) -> Result<Zeroizing<Vec<u8>>, SecretError> {
    let raw = raw.trim();
    let bytes = if raw.len() == MASTER_KEY_LEN * 2 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(raw).map_err(|e| SecretError::ValidationFailed(format!("bad hex: {}", e)))?
    } else {
        STANDARD
            .decode(raw)
            .map_err(|e| SecretError::ValidationFailed(format!("bad base64: {}", e)))?
    };
    let bytes = Zeroizing::new(bytes);

    if bytes.len() != MASTER_KEY_LEN {
        return Err(SecretError::ValidationFailed(format!(
            "master key must be {} bytes, got {}",
            MASTER_KEY_LEN,
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Load and decode the vault master key
pub fn load_master_key(config: &SecretConfig) -> Result<Zeroizing<Vec<u8>>, SecretError> {
    let op_reference = env::var(MASTER_KEY_OP_REF_ENV)
        .unwrap_or_else(|_| DEFAULT_MASTER_KEY_OP_REF.to_string());
    let raw = load_secret(&op_reference, MASTER_KEY_ENV, config)?;
    decode_master_key(&raw)
}
