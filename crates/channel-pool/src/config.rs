//! Static API configuration for a channel pool.
//!
//! The raw [`ApiConfig`] mirrors the JSON form client libraries ship with
//! (`channelPool` sizing plus per-method affinity rules). It is validated once
//! at pool construction into immutable [`PoolSettings`] and a typed
//! method-name to [`MethodAffinity`] map.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PoolError, Result};

/// Default maximum number of channels in a pool.
pub const DEFAULT_MAX_SIZE: usize = 10;

/// Default active-stream threshold below which a channel counts as not busy.
pub const DEFAULT_MAX_CONCURRENT_STREAMS_LOW_WATERMARK: usize = 100;

/// Affinity command attached to an RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AffinityCommand {
    /// No affinity handling.
    #[default]
    None,
    /// Bind the key found in the first response to the channel that served it.
    Bind,
    /// Route to the channel bound to the key found in the request.
    Bound,
    /// Route like `Bound`, then release the binding once the call succeeds.
    Unbind,
}

/// Raw affinity rule for a method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffinityConfig {
    /// Command to apply.
    #[serde(default)]
    pub command: AffinityCommand,
    /// Dot-separated field path locating the affinity key inside a message.
    #[serde(default, alias = "affinity_key")]
    pub affinity_key: String,
}

/// Raw per-method configuration: a set of method names sharing one rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodConfig {
    /// Fully-qualified method paths, e.g. `/google.spanner.v1.Spanner/GetSession`.
    #[serde(default, alias = "names")]
    pub name: Vec<String>,
    /// Affinity rule; methods without one are routed purely by load.
    #[serde(default)]
    pub affinity: Option<AffinityConfig>,
}

/// Raw channel pool sizing. Zero means "use the default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPoolConfig {
    /// Maximum number of channels.
    #[serde(default, alias = "max_size")]
    pub max_size: u32,
    /// Active-stream count at which a channel stops being preferred.
    #[serde(default, alias = "max_concurrent_streams_low_watermark")]
    pub max_concurrent_streams_low_watermark: u32,
}

/// API configuration supplied by the client library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// Pool sizing policy.
    #[serde(default, alias = "channel_pool")]
    pub channel_pool: Option<ChannelPoolConfig>,
    /// Per-method affinity rules.
    #[serde(default, alias = "methods")]
    pub method: Vec<MethodConfig>,
}

impl ApiConfig {
    /// Parses an API config from its JSON text form.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Builds an API config from an already-parsed JSON value.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Validated, immutable pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum number of channels, at least 1.
    pub max_size: usize,
    /// Active-stream threshold for fresh selection.
    pub max_concurrent_streams_low_watermark: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            max_concurrent_streams_low_watermark: DEFAULT_MAX_CONCURRENT_STREAMS_LOW_WATERMARK,
        }
    }
}

impl PoolSettings {
    /// Resolves sizing from the raw config, falling back to defaults for unset values.
    pub fn from_config(config: Option<&ChannelPoolConfig>) -> Self {
        let mut settings = Self::default();
        if let Some(pool) = config {
            if pool.max_size > 0 {
                settings.max_size = pool.max_size as usize;
            }
            if pool.max_concurrent_streams_low_watermark > 0 {
                settings.max_concurrent_streams_low_watermark =
                    pool.max_concurrent_streams_low_watermark as usize;
            }
        }
        settings
    }
}

/// Validated affinity rule for one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodAffinity {
    command: AffinityCommand,
    affinity_key: String,
}

impl MethodAffinity {
    /// Creates a rule. Used by validation and by tests.
    pub fn new(command: AffinityCommand, affinity_key: impl Into<String>) -> Self {
        Self {
            command,
            affinity_key: affinity_key.into(),
        }
    }

    /// The affinity command.
    pub fn command(&self) -> AffinityCommand {
        self.command
    }

    /// The dot-separated key path.
    pub fn affinity_key(&self) -> &str {
        &self.affinity_key
    }
}

/// Validates the method list and builds the method-name lookup table.
///
/// Rejects empty method names, a method name listed twice, and key paths with
/// empty segments such as `a..b`.
pub fn build_method_affinity(config: &ApiConfig) -> Result<HashMap<String, MethodAffinity>> {
    let mut map = HashMap::new();
    for method in &config.method {
        let Some(affinity) = &method.affinity else {
            continue;
        };
        validate_key_path(&affinity.affinity_key)?;
        if affinity.command != AffinityCommand::None && affinity.affinity_key.is_empty() {
            warn!(
                methods = ?method.name,
                command = ?affinity.command,
                "affinity rule has an empty key path; calls will route without affinity"
            );
        }
        for name in &method.name {
            if name.is_empty() {
                return Err(PoolError::InvalidConfig {
                    reason: "method name must not be empty".to_string(),
                });
            }
            let rule = MethodAffinity::new(affinity.command, affinity.affinity_key.clone());
            if map.insert(name.clone(), rule).is_some() {
                return Err(PoolError::InvalidConfig {
                    reason: format!("method {} has more than one affinity rule", name),
                });
            }
        }
    }
    Ok(map)
}

fn validate_key_path(path: &str) -> Result<()> {
    if !path.is_empty() && path.split('.').any(str::is_empty) {
        return Err(PoolError::InvalidConfig {
            reason: format!("affinity key path `{}` has an empty segment", path),
        });
    }
    Ok(())
}
