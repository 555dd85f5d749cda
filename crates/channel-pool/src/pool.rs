//! Bounded channel pool with least-loaded selection and affinity bindings.
//!
//! All channels in a pool target the same address. The pool starts with one
//! channel and grows lazily: a new channel is created only when every existing
//! channel has reached the active-stream low watermark, and never beyond the
//! configured maximum. Once saturated, the least-loaded channel is returned
//! anyway.
//!
//! Affinity keys pin call sequences to a channel. A bound key is reference
//! counted on the channel it maps to, and the binding disappears when the
//! count drops back to zero.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::{ChannelFactory, ChannelOptions, CLIENT_CHANNEL_ID};
use crate::channel_ref::ChannelRef;
use crate::config::{build_method_affinity, ApiConfig, MethodAffinity, PoolSettings};
use crate::error::{PoolError, Result};

/// Construction options for a [`ChannelPool`].
#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    /// API config with sizing and per-method affinity rules.
    pub api_config: Option<ApiConfig>,
    /// Options passed to every channel, in addition to the channel id option.
    pub channel_options: ChannelOptions,
}

/// Per-channel counters in a [`PoolStats`] snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelStats {
    /// Channel id.
    pub id: usize,
    /// Admitted calls not yet completed.
    pub active_streams: usize,
    /// Affinity keys bound to the channel.
    pub affinity_count: usize,
}

/// Snapshot of pool state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Number of open channels.
    pub channels: usize,
    /// Configured maximum number of channels.
    pub max_size: usize,
    /// Configured active-stream low watermark.
    pub low_watermark: usize,
    /// Sum of active streams across channels.
    pub total_active_streams: usize,
    /// Number of bound affinity keys.
    pub bound_keys: usize,
    /// Whether the pool has been closed.
    pub closed: bool,
    /// Per-channel counters in creation order.
    pub per_channel: Vec<ChannelStats>,
}

struct PoolState<C> {
    // Creation order; a channel's index equals its id.
    channel_refs: Vec<Arc<ChannelRef<C>>>,
    // Values are channel ids. Bindings never own their channel.
    affinity_key_to_channel_ref: HashMap<String, usize>,
    closed: bool,
}

/// A pool of channels to one target.
pub struct ChannelPool<F: ChannelFactory> {
    factory: F,
    target: String,
    credentials: F::Credentials,
    channel_options: ChannelOptions,
    settings: PoolSettings,
    method_affinity: HashMap<String, MethodAffinity>,
    state: Mutex<PoolState<F::Channel>>,
    // Channel count, published on growth and close.
    membership: watch::Sender<usize>,
}

impl<F: ChannelFactory> std::fmt::Debug for ChannelPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("target", &self.target)
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<F: ChannelFactory> ChannelPool<F> {
    /// Creates a pool and its first channel.
    ///
    /// Fails if the API config or channel options are malformed, or if the
    /// first channel cannot be created.
    pub fn new(
        factory: F,
        target: impl Into<String>,
        credentials: F::Credentials,
        options: PoolOptions,
    ) -> Result<Self> {
        let target = target.into();
        if target.is_empty() {
            return Err(PoolError::InvalidConfig {
                reason: "target must not be empty".to_string(),
            });
        }
        options.channel_options.validate()?;
        let settings = PoolSettings::from_config(
            options
                .api_config
                .as_ref()
                .and_then(|config| config.channel_pool.as_ref()),
        );
        let method_affinity = match &options.api_config {
            Some(config) => build_method_affinity(config)?,
            None => HashMap::new(),
        };

        let pool = Self {
            factory,
            target,
            credentials,
            channel_options: options.channel_options,
            settings,
            method_affinity,
            state: Mutex::new(PoolState {
                channel_refs: Vec::new(),
                affinity_key_to_channel_ref: HashMap::new(),
                closed: false,
            }),
            membership: watch::Sender::new(0),
        };
        {
            let mut state = pool.lock_state();
            pool.create_channel_ref(&mut state)?;
        }
        info!(
            target_addr = %pool.target,
            max_size = pool.settings.max_size,
            low_watermark = pool.settings.max_concurrent_streams_low_watermark,
            methods = pool.method_affinity.len(),
            "Created channel pool"
        );
        Ok(pool)
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<F::Channel>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Target address shared by all channels.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Maximum number of channels.
    pub fn max_size(&self) -> usize {
        self.settings.max_size
    }

    /// Active-stream count at which a channel stops being preferred.
    pub fn max_concurrent_streams_low_watermark(&self) -> usize {
        self.settings.max_concurrent_streams_low_watermark
    }

    /// Number of channels currently in the pool.
    pub fn len(&self) -> usize {
        self.lock_state().channel_refs.len()
    }

    /// Returns true if the pool holds no channels, which only happens after close.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Snapshot of the channels in creation order.
    pub fn channel_refs(&self) -> Vec<Arc<ChannelRef<F::Channel>>> {
        self.lock_state().channel_refs.clone()
    }

    /// Receiver notified whenever a channel is added or the pool is closed.
    pub(crate) fn subscribe_membership(&self) -> watch::Receiver<usize> {
        self.membership.subscribe()
    }

    /// Affinity rule for a fully-qualified method path.
    pub fn affinity_config(&self, method: &str) -> Option<&MethodAffinity> {
        self.method_affinity.get(method)
    }

    /// Picks a channel for a call.
    ///
    /// A non-empty, bound `affinity_key` returns its bound channel regardless
    /// of load. Otherwise the least-loaded channel is returned if it is below
    /// the low watermark; failing that a new channel is created while the pool
    /// has room, and a saturated pool returns the least-loaded channel anyway.
    pub fn get_channel_ref(
        &self,
        affinity_key: Option<&str>,
    ) -> Result<Arc<ChannelRef<F::Channel>>> {
        let mut state = self.lock_state();
        self.select_locked(&mut state, affinity_key)
    }

    /// Picks a channel exactly like [`get_channel_ref`](Self::get_channel_ref)
    /// and counts a new active stream on it, under a single lock acquisition.
    pub fn acquire(&self, affinity_key: Option<&str>) -> Result<Arc<ChannelRef<F::Channel>>> {
        let mut state = self.lock_state();
        let channel_ref = self.select_locked(&mut state, affinity_key)?;
        channel_ref.active_streams_count_incr();
        Ok(channel_ref)
    }

    /// Releases an active stream counted by [`acquire`](Self::acquire).
    pub fn release(&self, channel_ref: &ChannelRef<F::Channel>) {
        let _state = self.lock_state();
        channel_ref.active_streams_count_decr();
    }

    /// Channel used by callers that bypass the call interceptor.
    pub fn pick_channel(&self) -> Result<Arc<ChannelRef<F::Channel>>> {
        self.get_channel_ref(None)
    }

    /// Channel currently bound to `affinity_key`, if any.
    pub fn bound_channel_ref(&self, affinity_key: &str) -> Option<Arc<ChannelRef<F::Channel>>> {
        let state = self.lock_state();
        let id = *state.affinity_key_to_channel_ref.get(affinity_key)?;
        state.channel_refs.get(id).cloned()
    }

    fn select_locked(
        &self,
        state: &mut PoolState<F::Channel>,
        affinity_key: Option<&str>,
    ) -> Result<Arc<ChannelRef<F::Channel>>> {
        if state.closed {
            return Err(PoolError::Closed {
                target: self.target.clone(),
            });
        }

        if let Some(key) = affinity_key.filter(|k| !k.is_empty()) {
            let bound = state
                .affinity_key_to_channel_ref
                .get(key)
                .and_then(|id| state.channel_refs.get(*id))
                .filter(|channel_ref| !channel_ref.is_closed());
            if let Some(channel_ref) = bound {
                debug!(affinity_key = key, channel_id = channel_ref.id(), "Selected bound channel");
                return Ok(channel_ref.clone());
            }
        }

        let least_loaded = state
            .channel_refs
            .iter()
            .filter(|channel_ref| !channel_ref.is_closed())
            .min_by_key(|channel_ref| channel_ref.active_streams_count())
            .cloned();

        if let Some(channel_ref) = &least_loaded {
            if channel_ref.active_streams_count()
                < self.settings.max_concurrent_streams_low_watermark
            {
                return Ok(channel_ref.clone());
            }
        }

        if state.channel_refs.len() < self.settings.max_size {
            match self.create_channel_ref(state) {
                Ok(channel_ref) => return Ok(channel_ref),
                Err(e) => match least_loaded {
                    Some(channel_ref) => {
                        warn!(
                            target_addr = %self.target,
                            error = %e,
                            fallback_channel_id = channel_ref.id(),
                            "Failed to grow channel pool, using least-loaded channel"
                        );
                        return Ok(channel_ref);
                    }
                    None => return Err(e),
                },
            }
        }

        match least_loaded {
            Some(channel_ref) => {
                debug!(
                    channel_id = channel_ref.id(),
                    active_streams = channel_ref.active_streams_count(),
                    "Channel pool saturated, using least-loaded channel"
                );
                Ok(channel_ref)
            }
            None => Err(PoolError::NoChannels {
                operation: "select a channel",
            }),
        }
    }

    fn create_channel_ref(
        &self,
        state: &mut PoolState<F::Channel>,
    ) -> Result<Arc<ChannelRef<F::Channel>>> {
        let id = state.channel_refs.len();
        let options = self
            .channel_options
            .clone()
            .with(CLIENT_CHANNEL_ID, id as i64);
        let channel = self
            .factory
            .new_channel(&self.target, &self.credentials, &options)?;
        let channel_ref = Arc::new(ChannelRef::new(id, channel));
        state.channel_refs.push(channel_ref.clone());
        self.membership.send_replace(state.channel_refs.len());
        debug!(
            target_addr = %self.target,
            channel_id = id,
            pool_size = state.channel_refs.len(),
            "Created pooled channel"
        );
        Ok(channel_ref)
    }

    /// Binds `affinity_key` to `channel_ref`.
    ///
    /// If the key is already bound, the existing binding is kept and its
    /// channel's affinity count is incremented instead. Empty keys and
    /// channels that do not belong to this pool are ignored.
    pub fn bind(&self, channel_ref: &ChannelRef<F::Channel>, affinity_key: &str) {
        if affinity_key.is_empty() {
            return;
        }
        let mut state = self.lock_state();
        let state = &mut *state;
        if let Some(&id) = state.affinity_key_to_channel_ref.get(affinity_key) {
            if let Some(existing) = state.channel_refs.get(id) {
                existing.affinity_count_incr();
                debug!(
                    affinity_key,
                    channel_id = id,
                    affinity_count = existing.affinity_count(),
                    "Rebound affinity key"
                );
            }
            return;
        }
        let owned = state
            .channel_refs
            .get(channel_ref.id())
            .is_some_and(|candidate| std::ptr::eq(Arc::as_ptr(candidate), channel_ref));
        if !owned {
            warn!(
                affinity_key,
                channel_id = channel_ref.id(),
                "Ignoring bind to a channel outside the pool"
            );
            return;
        }
        state
            .affinity_key_to_channel_ref
            .insert(affinity_key.to_string(), channel_ref.id());
        channel_ref.affinity_count_incr();
        debug!(affinity_key, channel_id = channel_ref.id(), "Bound affinity key");
    }

    /// Releases one reference on `affinity_key`, removing the binding when the
    /// channel's affinity count reaches zero. Absent keys are a no-op.
    pub fn unbind(&self, affinity_key: Option<&str>) {
        let Some(key) = affinity_key.filter(|k| !k.is_empty()) else {
            return;
        };
        let mut state = self.lock_state();
        let Some(&id) = state.affinity_key_to_channel_ref.get(key) else {
            return;
        };
        let remaining = match state.channel_refs.get(id) {
            Some(channel_ref) => channel_ref.affinity_count_decr(),
            None => 0,
        };
        if remaining == 0 {
            state.affinity_key_to_channel_ref.remove(key);
            debug!(affinity_key = key, channel_id = id, "Unbound affinity key");
        }
    }

    /// Closes every channel and empties the pool. Idempotent.
    ///
    /// Calls already in flight keep their channel reference and still release
    /// their stream slot; new selections fail with [`PoolError::Closed`].
    pub fn close(&self) {
        let channel_refs = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.affinity_key_to_channel_ref.clear();
            self.membership.send_replace(0);
            std::mem::take(&mut state.channel_refs)
        };
        for channel_ref in &channel_refs {
            channel_ref.close();
        }
        info!(target_addr = %self.target, channels = channel_refs.len(), "Closed channel pool");
    }

    /// Snapshot of pool counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        let per_channel: Vec<ChannelStats> = state
            .channel_refs
            .iter()
            .map(|channel_ref| ChannelStats {
                id: channel_ref.id(),
                active_streams: channel_ref.active_streams_count(),
                affinity_count: channel_ref.affinity_count(),
            })
            .collect();
        PoolStats {
            channels: per_channel.len(),
            max_size: self.settings.max_size,
            low_watermark: self.settings.max_concurrent_streams_low_watermark,
            total_active_streams: per_channel.iter().map(|c| c.active_streams).sum(),
            bound_keys: state.affinity_key_to_channel_ref.len(),
            closed: state.closed,
            per_channel,
        }
    }
}
