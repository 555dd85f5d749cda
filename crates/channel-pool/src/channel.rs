//! Transport channel capability consumed by the pool.
//!
//! The pool never opens sockets itself. It asks a [`ChannelFactory`] for
//! channels to a single target and drives them through the [`Channel`] trait.
//! Any RPC stack can plug in by implementing these two traits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::deadline::Deadline;
use crate::error::{PoolError, Result};

/// Channel option key the pool sets on every channel it creates.
///
/// Its value is the channel id, so the transport never merges two pooled
/// channels into one physical connection.
pub const CLIENT_CHANNEL_ID: &str = "grpc_gcp.client_channel.id";

/// Connectivity state of a channel, or of the pool as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityState {
    /// Not connected and not trying to connect.
    Idle,
    /// Establishing a connection.
    Connecting,
    /// Connected and able to carry calls.
    Ready,
    /// Connection attempt failed; will retry.
    TransientFailure,
    /// Closed for good.
    Shutdown,
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Idle => write!(f, "IDLE"),
            ConnectivityState::Connecting => write!(f, "CONNECTING"),
            ConnectivityState::Ready => write!(f, "READY"),
            ConnectivityState::TransientFailure => write!(f, "TRANSIENT_FAILURE"),
            ConnectivityState::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// A single channel option value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelOptionValue {
    /// Integer option.
    Int(i64),
    /// String option.
    Str(String),
}

impl From<i64> for ChannelOptionValue {
    fn from(value: i64) -> Self {
        ChannelOptionValue::Int(value)
    }
}

impl From<&str> for ChannelOptionValue {
    fn from(value: &str) -> Self {
        ChannelOptionValue::Str(value.to_string())
    }
}

impl From<String> for ChannelOptionValue {
    fn from(value: String) -> Self {
        ChannelOptionValue::Str(value)
    }
}

/// Channel options passed through to the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelOptions {
    entries: BTreeMap<String, ChannelOptionValue>,
}

impl ChannelOptions {
    /// Creates an empty option set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an option, returning the updated set.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ChannelOptionValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Adds or replaces an option.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ChannelOptionValue>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Looks up an option.
    pub fn get(&self, key: &str) -> Option<&ChannelOptionValue> {
        self.entries.get(key)
    }

    /// Iterates over options in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChannelOptionValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of options.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no options are set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds options from a loosely-typed JSON value.
    ///
    /// `null` is treated as no options. Anything other than an object whose
    /// values are strings or integers is rejected.
    pub fn from_json_value(value: &serde_json::Value) -> Result<Self> {
        let object = match value {
            serde_json::Value::Null => return Ok(Self::new()),
            serde_json::Value::Object(object) => object,
            other => {
                return Err(PoolError::InvalidChannelOptions {
                    reason: format!("expected an object, got {}", other),
                })
            }
        };
        let mut options = Self::new();
        for (key, value) in object {
            let value = match value {
                serde_json::Value::String(s) => ChannelOptionValue::Str(s.clone()),
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(i) => ChannelOptionValue::Int(i),
                    None => {
                        return Err(PoolError::InvalidChannelOptions {
                            reason: format!("option {} is not an integer: {}", key, n),
                        })
                    }
                },
                other => {
                    return Err(PoolError::InvalidChannelOptions {
                        reason: format!("option {} has unsupported value {}", key, other),
                    })
                }
            };
            options.insert(key.clone(), value);
        }
        Ok(options)
    }

    /// Checks the options are usable as the base for pooled channels.
    pub fn validate(&self) -> Result<()> {
        for key in self.entries.keys() {
            if key.is_empty() {
                return Err(PoolError::InvalidChannelOptions {
                    reason: "option keys must not be empty".to_string(),
                });
            }
            if key == CLIENT_CHANNEL_ID {
                return Err(PoolError::InvalidChannelOptions {
                    reason: format!("{} is reserved for the channel pool", CLIENT_CHANNEL_ID),
                });
            }
        }
        Ok(())
    }
}

/// A transport-level channel to one target.
///
/// Implementations must be cheap to query: the pool reads connectivity state
/// while aggregating and never expects these calls to block on I/O.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Current connectivity state. With `try_to_connect`, an idle channel
    /// starts connecting.
    fn connectivity_state(&self, try_to_connect: bool) -> ConnectivityState;

    /// Resolves once the state differs from `last_observed`.
    ///
    /// Returns [`PoolError::DeadlineExceeded`] if the deadline passes first.
    async fn watch_connectivity_state(
        &self,
        last_observed: ConnectivityState,
        deadline: Deadline,
    ) -> Result<()>;

    /// Closes the channel. Must be idempotent.
    fn close(&self);
}

/// Creates transport channels for the pool.
pub trait ChannelFactory: Send + Sync + 'static {
    /// Channel type produced.
    type Channel: Channel;
    /// Credentials handed to every new channel.
    type Credentials: Send + Sync + 'static;

    /// Constructs a channel. Called with the pool lock held, so it must not
    /// wait on the network; real connection setup belongs to the channel.
    fn new_channel(
        &self,
        target: &str,
        credentials: &Self::Credentials,
        options: &ChannelOptions,
    ) -> Result<Self::Channel>;
}
