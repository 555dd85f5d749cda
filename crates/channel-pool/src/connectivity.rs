//! Aggregate connectivity state across a pool's channels.

use std::sync::Arc;

use futures::future::select_all;
use tracing::debug;

use crate::channel::{Channel, ChannelFactory, ConnectivityState};
use crate::deadline::Deadline;
use crate::error::{PoolError, Result};
use crate::pool::ChannelPool;

/// Folds channel states into one pool state.
///
/// Priority is READY, then CONNECTING, TRANSIENT_FAILURE, IDLE and finally
/// SHUTDOWN. Returns `None` for an empty iterator.
pub fn aggregate_states<I>(states: I) -> Option<ConnectivityState>
where
    I: IntoIterator<Item = ConnectivityState>,
{
    states.into_iter().max_by_key(|state| priority(*state))
}

fn priority(state: ConnectivityState) -> u8 {
    match state {
        ConnectivityState::Ready => 4,
        ConnectivityState::Connecting => 3,
        ConnectivityState::TransientFailure => 2,
        ConnectivityState::Idle => 1,
        ConnectivityState::Shutdown => 0,
    }
}

impl<F: ChannelFactory> ChannelPool<F> {
    /// Aggregated connectivity state of all channels.
    ///
    /// With `try_to_connect`, idle channels are asked to start connecting.
    /// Fails with [`PoolError::NoChannels`] on an empty pool.
    pub fn connectivity_state(&self, try_to_connect: bool) -> Result<ConnectivityState> {
        let channel_refs = self.channel_refs();
        aggregate_states(
            channel_refs
                .iter()
                .map(|channel_ref| channel_ref.channel().connectivity_state(try_to_connect)),
        )
        .ok_or(PoolError::NoChannels {
            operation: "get the connectivity state",
        })
    }

    /// Resolves once the aggregated state differs from `current`.
    ///
    /// Every channel is watched concurrently from the state it had when the
    /// aggregate was computed. When one of them changes, or the pool gains a
    /// channel or is closed, the remaining watches are dropped and the
    /// aggregate is recomputed over a fresh snapshot.
    pub async fn wait_for_state_change(
        &self,
        current: ConnectivityState,
        deadline: Deadline,
    ) -> Result<()> {
        let mut membership = self.subscribe_membership();
        loop {
            // Mark seen before the snapshot so later growth wakes this round.
            membership.borrow_and_update();
            let channel_refs = self.channel_refs();
            let observed: Vec<ConnectivityState> = channel_refs
                .iter()
                .map(|channel_ref| channel_ref.channel().connectivity_state(false))
                .collect();
            let state = aggregate_states(observed.iter().copied()).ok_or(PoolError::NoChannels {
                operation: "watch connectivity state",
            })?;
            if state != current {
                debug!(from = %current, to = %state, "Pool connectivity state changed");
                return Ok(());
            }

            let watches = channel_refs
                .into_iter()
                .zip(observed)
                .map(|(channel_ref, observed)| {
                    Box::pin(async move {
                        channel_ref
                            .channel()
                            .watch_connectivity_state(observed, deadline)
                            .await
                    })
                });
            let round = async {
                tokio::select! {
                    (first, _, _) = select_all(watches) => first,
                    _ = membership.changed() => {
                        debug!("Pool membership changed while watching connectivity");
                        Ok(())
                    }
                }
            };
            tokio::time::timeout_at(deadline.instant(), round)
                .await
                .map_err(|_| PoolError::DeadlineExceeded {
                    operation: "watching pool connectivity state",
                })??;
        }
    }

    /// Callback form of [`wait_for_state_change`](Self::wait_for_state_change).
    ///
    /// An empty pool invokes `callback` with an error before returning. If the
    /// aggregate already differs from `current`, `callback` runs on a spawned
    /// task with no error. Otherwise the wait runs on a spawned task and
    /// `callback` is invoked exactly once with its outcome. Must be called
    /// from within a tokio runtime.
    pub fn watch_connectivity_state<CB>(
        self: &Arc<Self>,
        current: ConnectivityState,
        deadline: Deadline,
        callback: CB,
    ) where
        CB: FnOnce(Result<()>) + Send + 'static,
    {
        let state = match self.connectivity_state(false) {
            Ok(state) => state,
            Err(e) => {
                callback(Err(e));
                return;
            }
        };
        if state != current {
            tokio::spawn(async move { callback(Ok(())) });
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let result = pool.wait_for_state_change(current, deadline).await;
            callback(result);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiConfig, ChannelPoolConfig};
    use crate::pool::PoolOptions;
    use crate::sim::{SimChannelFactory, SimCredentials};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn pool_with(factory: SimChannelFactory, max_size: u32) -> Arc<ChannelPool<SimChannelFactory>> {
        let options = PoolOptions {
            api_config: Some(ApiConfig {
                channel_pool: Some(ChannelPoolConfig {
                    max_size,
                    max_concurrent_streams_low_watermark: 1,
                }),
                method: Vec::new(),
            }),
            ..Default::default()
        };
        Arc::new(
            ChannelPool::new(factory, "localhost:443", SimCredentials::default(), options)
                .unwrap(),
        )
    }

    #[test]
    fn test_aggregate_priority() {
        use ConnectivityState::*;
        assert_eq!(aggregate_states([Idle, Ready, Shutdown]), Some(Ready));
        assert_eq!(aggregate_states([Idle, TransientFailure, Connecting]), Some(Connecting));
        assert_eq!(aggregate_states([Idle, TransientFailure]), Some(TransientFailure));
        assert_eq!(aggregate_states([Shutdown, Idle]), Some(Idle));
        assert_eq!(aggregate_states([Shutdown]), Some(Shutdown));
        assert_eq!(aggregate_states(Vec::new()), None);
    }

    #[test]
    fn test_connectivity_state_aggregates_channels() {
        let factory = SimChannelFactory::new();
        let pool = pool_with(factory.clone(), 2);
        pool.acquire(None).unwrap();
        pool.acquire(None).unwrap();
        let channels = factory.channels();
        channels[0].set_state(ConnectivityState::TransientFailure);
        channels[1].set_state(ConnectivityState::Idle);
        assert_eq!(pool.connectivity_state(false).unwrap(), ConnectivityState::TransientFailure);
        channels[1].set_state(ConnectivityState::Ready);
        assert_eq!(pool.connectivity_state(false).unwrap(), ConnectivityState::Ready);
    }

    #[test]
    fn test_try_to_connect_kicks_idle_channels() {
        let factory = SimChannelFactory::new();
        let pool = pool_with(factory.clone(), 1);
        assert_eq!(pool.connectivity_state(true).unwrap(), ConnectivityState::Idle);
        assert_eq!(factory.channels()[0].connect_requests(), 1);
        assert_eq!(pool.connectivity_state(false).unwrap(), ConnectivityState::Connecting);
    }

    #[test]
    fn test_connectivity_state_after_close_fails() {
        let pool = pool_with(SimChannelFactory::new(), 1);
        pool.close();
        assert!(matches!(
            pool.connectivity_state(false),
            Err(PoolError::NoChannels { .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_resolves_when_channel_changes() {
        let factory = SimChannelFactory::new();
        let pool = pool_with(factory.clone(), 1);
        let waiter = Arc::clone(&pool);
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_state_change(
                    ConnectivityState::Idle,
                    Deadline::new(Duration::from_secs(5)),
                )
                .await
        });
        tokio::task::yield_now().await;
        factory.channels()[0].set_state(ConnectivityState::Ready);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ignores_changes_that_keep_aggregate() {
        let factory = SimChannelFactory::new();
        let pool = pool_with(factory.clone(), 2);
        pool.acquire(None).unwrap();
        pool.acquire(None).unwrap();
        let channels = factory.channels();
        channels[0].set_state(ConnectivityState::Ready);

        let waiter = Arc::clone(&pool);
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_state_change(
                    ConnectivityState::Ready,
                    Deadline::new(Duration::from_secs(1)),
                )
                .await
        });
        tokio::task::yield_now().await;
        // Aggregate stays READY.
        channels[1].set_state(ConnectivityState::Connecting);
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PoolError::DeadlineExceeded { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_deadline_exceeded() {
        let pool = pool_with(SimChannelFactory::new(), 1);
        let result = pool
            .wait_for_state_change(
                ConnectivityState::Idle,
                Deadline::new(Duration::from_millis(50)),
            )
            .await;
        assert!(matches!(result, Err(PoolError::DeadlineExceeded { .. })));
    }

    #[tokio::test]
    async fn test_watch_callback_immediate_when_state_differs() {
        let factory = SimChannelFactory::new().with_initial_state(ConnectivityState::Ready);
        let pool = pool_with(factory, 1);
        let (tx, rx) = oneshot::channel();
        pool.watch_connectivity_state(
            ConnectivityState::Idle,
            Deadline::new(Duration::from_secs(5)),
            move |result| {
                let _ = tx.send(result);
            },
        );
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_watch_callback_on_change() {
        let factory = SimChannelFactory::new();
        let pool = pool_with(factory.clone(), 1);
        let (tx, rx) = oneshot::channel();
        pool.watch_connectivity_state(
            ConnectivityState::Idle,
            Deadline::new(Duration::from_secs(5)),
            move |result| {
                let _ = tx.send(result);
            },
        );
        tokio::task::yield_now().await;
        factory.channels()[0].set_state(ConnectivityState::Connecting);
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_watch_on_empty_pool_fails_synchronously() {
        let pool = pool_with(SimChannelFactory::new(), 1);
        pool.close();
        let seen: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        pool.watch_connectivity_state(
            ConnectivityState::Ready,
            Deadline::new(Duration::from_secs(5)),
            move |result| {
                *slot.lock().unwrap() = Some(result);
            },
        );
        let result = seen.lock().unwrap().take();
        assert!(matches!(result, Some(Err(PoolError::NoChannels { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_sees_channel_added_after_start() {
        let factory = SimChannelFactory::new();
        let pool = pool_with(factory.clone(), 3);
        let (tx, rx) = oneshot::channel();
        pool.watch_connectivity_state(
            ConnectivityState::Idle,
            Deadline::new(Duration::from_secs(5)),
            move |result| {
                let _ = tx.send(result);
            },
        );
        tokio::task::yield_now().await;

        pool.acquire(None).unwrap();
        let grown = pool.acquire(None).unwrap();
        assert_eq!(grown.id(), 1);
        factory.channels()[1].set_state(ConnectivityState::Ready);

        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_resolves_when_pool_closes() {
        let pool = pool_with(SimChannelFactory::new(), 1);
        let waiter = Arc::clone(&pool);
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_state_change(
                    ConnectivityState::Idle,
                    Deadline::new(Duration::from_secs(5)),
                )
                .await
        });
        tokio::task::yield_now().await;
        pool.close();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PoolError::NoChannels { .. })));
    }

    // Reports IDLE on its first read and READY afterwards, without notifying
    // watchers, so a watch must start from the state the aggregate used.
    #[derive(Default)]
    struct SteppingChannel {
        reads: AtomicUsize,
    }

    #[async_trait]
    impl Channel for SteppingChannel {
        fn connectivity_state(&self, _try_to_connect: bool) -> ConnectivityState {
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                ConnectivityState::Idle
            } else {
                ConnectivityState::Ready
            }
        }

        async fn watch_connectivity_state(
            &self,
            last_observed: ConnectivityState,
            deadline: Deadline,
        ) -> Result<()> {
            if last_observed != ConnectivityState::Ready {
                return Ok(());
            }
            tokio::time::sleep_until(deadline.instant()).await;
            Err(PoolError::DeadlineExceeded {
                operation: "watching channel connectivity state",
            })
        }

        fn close(&self) {}
    }

    struct SteppingFactory;

    impl ChannelFactory for SteppingFactory {
        type Channel = SteppingChannel;
        type Credentials = ();

        fn new_channel(
            &self,
            _target: &str,
            _credentials: &(),
            _options: &crate::channel::ChannelOptions,
        ) -> Result<SteppingChannel> {
            Ok(SteppingChannel::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_starts_from_aggregated_state() {
        let pool = ChannelPool::new(SteppingFactory, "localhost:443", (), PoolOptions::default())
            .unwrap();
        let result = pool
            .wait_for_state_change(ConnectivityState::Idle, Deadline::new(Duration::from_secs(1)))
            .await;
        assert!(result.is_ok());
    }
}
