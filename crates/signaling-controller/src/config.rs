//! Signaling controller configuration.
//!
//! Loaded from environment variables; every room and session receives an
//! immutable snapshot at construction.

use std::collections::HashMap;
use std::env;

use thiserror::Error;

use crate::permissions::{default_roles, PermissionSet};

/// Default directory prefix for recording URLs.
pub const DEFAULT_RECORDING_PATH: &str = "/tmp/";

/// Default codec/bandwidth profile name passed through to media nodes.
pub const DEFAULT_MEDIA_CONFIGURATION: &str = "default";

/// Signaling controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory prefix recordings are written under; the recording id
    /// and container extension are appended.
    pub recording_path: String,

    /// Media profile used when a request names none.
    pub default_media_configuration: String,

    /// Multiplex each client's streams onto one transport connection.
    pub single_pc: bool,

    /// Forward candidates as they gather instead of waiting for the
    /// complete description.
    pub trickle_ice: bool,

    /// Role name to permission set. Session roles not present here get
    /// an empty set and can do nothing.
    pub roles: HashMap<String, PermissionSet>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_bool(vars: &HashMap<String, String>, key: &str) -> Result<bool, ConfigError> {
    match vars.get(key) {
        None => Ok(false),
        Some(raw) => match raw.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(ConfigError::InvalidValue(format!(
                "{key} must be a boolean, got {other:?}"
            ))),
        },
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let recording_path = vars
            .get("SC_RECORDING_PATH")
            .cloned()
            .unwrap_or_else(|| DEFAULT_RECORDING_PATH.to_string());

        let default_media_configuration = vars
            .get("SC_DEFAULT_MEDIA_CONFIGURATION")
            .cloned()
            .unwrap_or_else(|| DEFAULT_MEDIA_CONFIGURATION.to_string());

        let single_pc = parse_bool(vars, "SC_SINGLE_PC")?;
        let trickle_ice = parse_bool(vars, "SC_TRICKLE_ICE")?;

        let roles = match vars.get("SC_ROLES") {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| ConfigError::InvalidValue(format!("SC_ROLES: {e}")))?,
            None => default_roles(),
        };

        Ok(Config {
            recording_path,
            default_media_configuration,
            single_pc,
            trickle_ice,
            roles,
        })
    }

    /// Recording URL for a recording id, `{path}{id}.mkv`.
    #[must_use]
    pub fn recording_url(&self, recording_id: &str) -> String {
        format!("{}{}.mkv", self.recording_path, recording_id)
    }
}
