//! In-memory transport simulation for testing without a network.
//!
//! [`SimChannelFactory`] hands out [`SimChannel`]s whose connectivity state is
//! driven by the test, records every channel it created together with the
//! options it was given, and can be told to fail upcoming creations.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::channel::{
    Channel, ChannelFactory, ChannelOptionValue, ChannelOptions, ConnectivityState,
    CLIENT_CHANNEL_ID,
};
use crate::deadline::Deadline;
use crate::error::{PoolError, Result};

/// Credentials accepted by the simulated transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimCredentials {
    /// Free-form label, recorded on each channel.
    pub label: String,
}

struct SimChannelInner {
    target: String,
    options: ChannelOptions,
    state: watch::Sender<ConnectivityState>,
    closed: AtomicBool,
    close_count: AtomicUsize,
    connect_requests: AtomicUsize,
}

/// A simulated channel. Clones share state.
#[derive(Clone)]
pub struct SimChannel {
    inner: Arc<SimChannelInner>,
}

impl std::fmt::Debug for SimChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimChannel")
            .field("target", &self.inner.target)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SimChannel {
    /// Creates an idle channel.
    pub fn new(target: &str, options: ChannelOptions) -> Self {
        Self::with_state(target, options, ConnectivityState::Idle)
    }

    /// Creates a channel in the given state.
    pub fn with_state(target: &str, options: ChannelOptions, state: ConnectivityState) -> Self {
        let (state, _) = watch::channel(state);
        Self {
            inner: Arc::new(SimChannelInner {
                target: target.to_string(),
                options,
                state,
                closed: AtomicBool::new(false),
                close_count: AtomicUsize::new(0),
                connect_requests: AtomicUsize::new(0),
            }),
        }
    }

    /// Target this channel was created for.
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Options this channel was created with.
    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    /// The pool-assigned channel id, if the distinguishing option is present.
    pub fn client_channel_id(&self) -> Option<i64> {
        match self.inner.options.get(CLIENT_CHANNEL_ID) {
            Some(ChannelOptionValue::Int(id)) => Some(*id),
            _ => None,
        }
    }

    /// Current state without side effects.
    pub fn state(&self) -> ConnectivityState {
        *self.inner.state.borrow()
    }

    /// Moves the channel to a new state and wakes watchers.
    pub fn set_state(&self, state: ConnectivityState) {
        self.inner.state.send_replace(state);
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of times `close` was called.
    pub fn close_count(&self) -> usize {
        self.inner.close_count.load(Ordering::SeqCst)
    }

    /// Number of times a connect was requested on an idle channel.
    pub fn connect_requests(&self) -> usize {
        self.inner.connect_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for SimChannel {
    fn connectivity_state(&self, try_to_connect: bool) -> ConnectivityState {
        let state = self.state();
        if try_to_connect && state == ConnectivityState::Idle {
            self.inner.connect_requests.fetch_add(1, Ordering::SeqCst);
            self.set_state(ConnectivityState::Connecting);
        }
        state
    }

    async fn watch_connectivity_state(
        &self,
        last_observed: ConnectivityState,
        deadline: Deadline,
    ) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let changed = tokio::time::timeout_at(deadline.instant(), async move {
            rx.wait_for(|state| *state != last_observed)
                .await
                .map(|_| ())
        })
        .await;
        match changed {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PoolError::Transport {
                reason: "simulated channel dropped".to_string(),
            }),
            Err(_) => Err(PoolError::DeadlineExceeded {
                operation: "watching channel connectivity state",
            }),
        }
    }

    fn close(&self) {
        self.inner.close_count.fetch_add(1, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);
        self.set_state(ConnectivityState::Shutdown);
    }
}

#[derive(Default)]
struct SimFactoryInner {
    channels: Mutex<Vec<SimChannel>>,
    credentials: Mutex<Vec<SimCredentials>>,
    pending_failures: AtomicUsize,
}

/// Factory producing [`SimChannel`]s. Clones share the creation log.
#[derive(Clone)]
pub struct SimChannelFactory {
    initial_state: ConnectivityState,
    inner: Arc<SimFactoryInner>,
}

impl Default for SimChannelFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimChannelFactory {
    /// Creates a factory whose channels start idle.
    pub fn new() -> Self {
        Self {
            initial_state: ConnectivityState::Idle,
            inner: Arc::new(SimFactoryInner::default()),
        }
    }

    /// Sets the state new channels start in.
    pub fn with_initial_state(mut self, state: ConnectivityState) -> Self {
        self.initial_state = state;
        self
    }

    /// Makes the next `count` channel creations fail.
    pub fn fail_next(&self, count: usize) {
        self.inner.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Every channel created so far, in creation order.
    pub fn channels(&self) -> Vec<SimChannel> {
        lock(&self.inner.channels).clone()
    }

    /// Credentials passed to each creation, in creation order.
    pub fn credentials_seen(&self) -> Vec<SimCredentials> {
        lock(&self.inner.credentials).clone()
    }

    /// Number of channels created so far.
    pub fn created(&self) -> usize {
        lock(&self.inner.channels).len()
    }
}

impl ChannelFactory for SimChannelFactory {
    type Channel = SimChannel;
    type Credentials = SimCredentials;

    fn new_channel(
        &self,
        target: &str,
        credentials: &SimCredentials,
        options: &ChannelOptions,
    ) -> Result<SimChannel> {
        let failed = self
            .inner
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            let channel_id = match options.get(CLIENT_CHANNEL_ID) {
                Some(ChannelOptionValue::Int(id)) => *id as usize,
                _ => 0,
            };
            return Err(PoolError::ChannelCreation {
                target: target.to_string(),
                channel_id,
                reason: "simulated creation failure".to_string(),
            });
        }
        let channel = SimChannel::with_state(target, options.clone(), self.initial_state);
        lock(&self.inner.channels).push(channel.clone());
        lock(&self.inner.credentials).push(credentials.clone());
        Ok(channel)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
