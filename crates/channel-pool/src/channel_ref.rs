//! Pooled channel wrapper with affinity and stream accounting.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::error;

use crate::channel::Channel;

/// A transport channel owned by the pool plus its load counters.
///
/// `ChannelRef` is a passive state holder: it never makes pool-level
/// decisions. Counter changes made on behalf of calls go through the pool so
/// they are serialized with channel selection.
pub struct ChannelRef<C> {
    id: usize,
    channel: C,
    affinity_count: AtomicUsize,
    active_streams_count: AtomicUsize,
    closed: AtomicBool,
}

impl<C> std::fmt::Debug for ChannelRef<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRef")
            .field("id", &self.id)
            .field("affinity_count", &self.affinity_count())
            .field("active_streams_count", &self.active_streams_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<C> ChannelRef<C> {
    pub(crate) fn new(id: usize, channel: C) -> Self {
        Self {
            id,
            channel,
            affinity_count: AtomicUsize::new(0),
            active_streams_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Id unique within the owning pool, assigned in creation order.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The underlying transport channel, used to issue the call.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Number of affinity keys bound to this channel.
    pub fn affinity_count(&self) -> usize {
        self.affinity_count.load(Ordering::SeqCst)
    }

    /// Number of admitted calls that have not completed yet.
    pub fn active_streams_count(&self) -> usize {
        self.active_streams_count.load(Ordering::SeqCst)
    }

    /// Increments the affinity count.
    pub fn affinity_count_incr(&self) {
        self.affinity_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the affinity count, returning the new value.
    pub fn affinity_count_decr(&self) -> usize {
        decrement(&self.affinity_count, self.id, "affinity_count")
    }

    /// Increments the active stream count.
    pub fn active_streams_count_incr(&self) {
        self.active_streams_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the active stream count, returning the new value.
    pub fn active_streams_count_decr(&self) -> usize {
        decrement(&self.active_streams_count, self.id, "active_streams_count")
    }

    /// Returns true once the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<C: Channel> ChannelRef<C> {
    /// Marks the ref closed and closes the channel. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.channel.close();
        }
    }
}

// Callers must pair decrements with increments. A decrement at zero is a
// bookkeeping defect: it is reported and the counter stays at zero.
fn decrement(counter: &AtomicUsize, channel_id: usize, counter_name: &'static str) -> usize {
    match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1)) {
        Ok(previous) => previous - 1,
        Err(_) => {
            error!(
                channel_id,
                counter = counter_name,
                "counter decremented below zero"
            );
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelOptions;
    use crate::sim::SimChannel;

    fn new_ref(id: usize) -> ChannelRef<SimChannel> {
        ChannelRef::new(id, SimChannel::new("localhost:443", ChannelOptions::new()))
    }

    #[test]
    fn test_new_ref_counts_zero() {
        let channel_ref = new_ref(3);
        assert_eq!(channel_ref.id(), 3);
        assert_eq!(channel_ref.affinity_count(), 0);
        assert_eq!(channel_ref.active_streams_count(), 0);
        assert!(!channel_ref.is_closed());
    }

    #[test]
    fn test_counter_incr_decr() {
        let channel_ref = new_ref(0);
        channel_ref.active_streams_count_incr();
        channel_ref.active_streams_count_incr();
        channel_ref.affinity_count_incr();
        assert_eq!(channel_ref.active_streams_count(), 2);
        assert_eq!(channel_ref.affinity_count(), 1);

        assert_eq!(channel_ref.active_streams_count_decr(), 1);
        assert_eq!(channel_ref.affinity_count_decr(), 0);
        assert_eq!(channel_ref.active_streams_count_decr(), 0);
    }

    #[test]
    fn test_decrement_at_zero_stays_zero() {
        let channel_ref = new_ref(0);
        assert_eq!(channel_ref.active_streams_count_decr(), 0);
        assert_eq!(channel_ref.affinity_count_decr(), 0);
        assert_eq!(channel_ref.active_streams_count(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let channel_ref = new_ref(0);
        channel_ref.close();
        channel_ref.close();
        assert!(channel_ref.is_closed());
        assert!(channel_ref.channel().is_closed());
        assert_eq!(channel_ref.channel().close_count(), 1);
    }

    #[test]
    fn test_debug_format() {
        let channel_ref = new_ref(7);
        let debug_str = format!("{:?}", channel_ref);
        assert!(debug_str.contains("ChannelRef"));
        assert!(debug_str.contains("id: 7"));
    }
}
