//! Per-call admission and completion around a pooled channel.
//!
//! [`CallInterceptor::pre_process`] picks a channel, counts a stream on it and
//! returns an [`AdmittedCall`]. The call then moves through
//! `Admitted -> InFlight -> Completed`. Completion applies the method's
//! affinity command and releases the stream slot. Dropping an unfinished call
//! counts as cancellation and still releases the slot.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::affinity::{affinity_key_from_message, AffinityMessage};
use crate::channel::ChannelFactory;
use crate::channel_ref::ChannelRef;
use crate::config::{AffinityCommand, MethodAffinity};
use crate::error::Result;
use crate::pool::ChannelPool;

/// Lifecycle phase of an admitted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// Channel chosen and stream counted; the call has not started.
    Admitted,
    /// The call is running on the transport.
    InFlight,
    /// Completion ran; the stream slot has been released.
    Completed,
}

#[derive(Debug)]
enum FirstResponse {
    Pending,
    // Key extracted for BIND, if any. Later responses never replace it.
    Seen(Option<String>),
}

/// Routes calls through a [`ChannelPool`].
pub struct CallInterceptor<F: ChannelFactory> {
    pool: Arc<ChannelPool<F>>,
}

impl<F: ChannelFactory> Clone for CallInterceptor<F> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<F: ChannelFactory> CallInterceptor<F> {
    /// Creates an interceptor over `pool`.
    pub fn new(pool: Arc<ChannelPool<F>>) -> Self {
        Self { pool }
    }

    /// The pool calls are routed through.
    pub fn pool(&self) -> &Arc<ChannelPool<F>> {
        &self.pool
    }

    /// Admits a call to `method`.
    ///
    /// For BOUND and UNBIND rules the affinity key is read from `request`;
    /// a missing request or an unresolvable key routes without affinity.
    /// Fails only if the pool cannot supply a channel.
    pub fn pre_process(
        &self,
        method: &str,
        request: Option<&dyn AffinityMessage>,
    ) -> Result<AdmittedCall<F>> {
        let affinity = self.pool.affinity_config(method).cloned();
        let bound_key = match (&affinity, request) {
            (Some(rule), Some(request))
                if matches!(rule.command(), AffinityCommand::Bound | AffinityCommand::Unbind)
                    && !rule.affinity_key().is_empty() =>
            {
                affinity_key_from_message(request, rule.affinity_key())
            }
            _ => None,
        };
        let channel_ref = self.pool.acquire(bound_key.as_deref())?;
        debug!(
            method,
            channel_id = channel_ref.id(),
            affinity_key = ?bound_key,
            "Admitted call"
        );
        Ok(AdmittedCall {
            pool: Arc::clone(&self.pool),
            method: method.to_string(),
            affinity,
            channel_ref,
            bound_key,
            first_response: FirstResponse::Pending,
            phase: CallPhase::Admitted,
        })
    }
}

/// A call holding a stream slot on a pooled channel.
pub struct AdmittedCall<F: ChannelFactory> {
    pool: Arc<ChannelPool<F>>,
    method: String,
    affinity: Option<MethodAffinity>,
    channel_ref: Arc<ChannelRef<F::Channel>>,
    bound_key: Option<String>,
    first_response: FirstResponse,
    phase: CallPhase,
}

impl<F: ChannelFactory> std::fmt::Debug for AdmittedCall<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmittedCall")
            .field("method", &self.method)
            .field("channel_id", &self.channel_ref.id())
            .field("bound_key", &self.bound_key)
            .field("phase", &self.phase)
            .finish()
    }
}

impl<F: ChannelFactory> AdmittedCall<F> {
    /// Transport channel to issue the call on.
    pub fn channel(&self) -> &F::Channel {
        self.channel_ref.channel()
    }

    /// The pooled channel chosen at admission.
    pub fn channel_ref(&self) -> &Arc<ChannelRef<F::Channel>> {
        &self.channel_ref
    }

    /// Fully-qualified method path.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Affinity command for the method; NONE when it has no rule.
    pub fn command(&self) -> AffinityCommand {
        self.affinity
            .as_ref()
            .map(MethodAffinity::command)
            .unwrap_or_default()
    }

    /// Key extracted from the request at admission.
    pub fn bound_key(&self) -> Option<&str> {
        self.bound_key.as_deref()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    /// Marks the call as running on the transport.
    pub fn start(&mut self) {
        if self.phase == CallPhase::Admitted {
            self.phase = CallPhase::InFlight;
        }
    }

    /// Observes a received response. Only the first one is kept.
    pub fn on_response(&mut self, message: &dyn AffinityMessage) {
        if self.phase == CallPhase::Completed {
            return;
        }
        self.start();
        if !matches!(self.first_response, FirstResponse::Pending) {
            return;
        }
        let key = match &self.affinity {
            Some(rule) if rule.command() == AffinityCommand::Bind => {
                affinity_key_from_message(message, rule.affinity_key())
            }
            _ => None,
        };
        trace!(method = %self.method, affinity_key = ?key, "Captured first response");
        self.first_response = FirstResponse::Seen(key);
    }

    /// Completes the call with its terminal status code.
    ///
    /// On `Ok`, BIND binds the key from the first response and UNBIND releases
    /// the key captured at admission. Other codes skip affinity changes. The
    /// stream slot is released in every case.
    pub fn complete(mut self, code: tonic::Code) {
        self.finish(code);
    }

    /// Completes the call as cancelled.
    pub fn cancel(self) {
        self.complete(tonic::Code::Cancelled);
    }

    fn finish(&mut self, code: tonic::Code) {
        if self.phase == CallPhase::Completed {
            return;
        }
        self.phase = CallPhase::Completed;
        if code == tonic::Code::Ok {
            match self.command() {
                AffinityCommand::Bind => match &self.first_response {
                    FirstResponse::Seen(Some(key)) => self.pool.bind(&self.channel_ref, key),
                    FirstResponse::Seen(None) => {}
                    FirstResponse::Pending => {
                        debug!(method = %self.method, "BIND call completed without a response")
                    }
                },
                AffinityCommand::Unbind => self.pool.unbind(self.bound_key.as_deref()),
                AffinityCommand::Bound | AffinityCommand::None => {}
            }
        }
        self.pool.release(&self.channel_ref);
        debug!(
            method = %self.method,
            channel_id = self.channel_ref.id(),
            code = ?code,
            "Completed call"
        );
    }
}

impl<F: ChannelFactory> Drop for AdmittedCall<F> {
    fn drop(&mut self) {
        if self.phase != CallPhase::Completed {
            debug!(method = %self.method, "Call dropped before completion");
            self.finish(tonic::Code::Cancelled);
        }
    }
}
