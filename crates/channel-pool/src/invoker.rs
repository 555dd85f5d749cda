//! Call-site hooks for RPC clients.
//!
//! A client is built either on a pool ([`channel_factory_override`]) or on a
//! single plain channel. [`call_invocation_transformer`] runs once per call
//! and returns a [`RoutedCall`] carrying the channel to use. Calls on a plain
//! client pass through untouched.

use std::future::Future;
use std::sync::Arc;

use tracing::trace;

use crate::affinity::AffinityMessage;
use crate::channel::ChannelFactory;
use crate::error::Result;
use crate::interceptor::{AdmittedCall, CallInterceptor};
use crate::pool::{ChannelPool, PoolOptions};

/// Shape of an RPC method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    /// Fully-qualified path, e.g. `/google.spanner.v1.Spanner/ExecuteSql`.
    pub path: String,
    /// Client sends a stream of requests.
    pub request_stream: bool,
    /// Server sends a stream of responses.
    pub response_stream: bool,
}

impl MethodDescriptor {
    /// Single request, single response.
    pub fn unary(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            request_stream: false,
            response_stream: false,
        }
    }

    /// Single request, response stream.
    pub fn server_streaming(path: impl Into<String>) -> Self {
        Self {
            response_stream: true,
            ..Self::unary(path)
        }
    }

    /// Request stream, single response.
    pub fn client_streaming(path: impl Into<String>) -> Self {
        Self {
            request_stream: true,
            ..Self::unary(path)
        }
    }

    /// Streams in both directions.
    pub fn bidi_streaming(path: impl Into<String>) -> Self {
        Self {
            request_stream: true,
            response_stream: true,
            ..Self::unary(path)
        }
    }
}

/// The channel a client was constructed on.
pub enum ClientChannel<F: ChannelFactory> {
    /// Calls are routed through a pool.
    Pooled(Arc<ChannelPool<F>>),
    /// Calls go straight to one channel.
    Plain(F::Channel),
}

impl<F: ChannelFactory> std::fmt::Debug for ClientChannel<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientChannel::Pooled(pool) => f.debug_tuple("Pooled").field(pool).finish(),
            ClientChannel::Plain(_) => f.write_str("Plain(..)"),
        }
    }
}

/// Builds the pool a client is constructed on. Invoked once per client.
pub fn channel_factory_override<F: ChannelFactory>(
    factory: F,
    target: &str,
    credentials: F::Credentials,
    options: PoolOptions,
) -> Result<Arc<ChannelPool<F>>> {
    Ok(Arc::new(ChannelPool::new(factory, target, credentials, options)?))
}

/// Routes one call.
///
/// Pooled clients admit the call through the interceptor, reading affinity
/// from `request` when the method is not client-streaming. Plain clients pass
/// through.
pub fn call_invocation_transformer<'a, F: ChannelFactory>(
    client: &'a ClientChannel<F>,
    method: &MethodDescriptor,
    request: Option<&dyn AffinityMessage>,
) -> Result<RoutedCall<'a, F>> {
    match client {
        ClientChannel::Pooled(pool) => {
            let request = if method.request_stream { None } else { request };
            let admitted =
                CallInterceptor::new(Arc::clone(pool)).pre_process(&method.path, request)?;
            Ok(RoutedCall::Pooled(admitted))
        }
        ClientChannel::Plain(channel) => {
            trace!(method = %method.path, "Passing call through to plain channel");
            Ok(RoutedCall::Passthrough(channel))
        }
    }
}

/// A call routed by [`call_invocation_transformer`].
pub enum RoutedCall<'a, F: ChannelFactory> {
    /// Admitted on a pooled channel.
    Pooled(AdmittedCall<F>),
    /// Issued on the client's plain channel.
    Passthrough(&'a F::Channel),
}

impl<F: ChannelFactory> std::fmt::Debug for RoutedCall<'_, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutedCall::Pooled(call) => f.debug_tuple("Pooled").field(call).finish(),
            RoutedCall::Passthrough(_) => f.write_str("Passthrough(..)"),
        }
    }
}

impl<F: ChannelFactory> RoutedCall<'_, F> {
    /// Channel to issue the call on.
    pub fn channel(&self) -> &F::Channel {
        match self {
            RoutedCall::Pooled(call) => call.channel(),
            RoutedCall::Passthrough(channel) => *channel,
        }
    }

    /// See [`AdmittedCall::start`].
    pub fn start(&mut self) {
        if let RoutedCall::Pooled(call) = self {
            call.start();
        }
    }

    /// See [`AdmittedCall::on_response`].
    pub fn on_response(&mut self, message: &dyn AffinityMessage) {
        if let RoutedCall::Pooled(call) = self {
            call.on_response(message);
        }
    }

    /// See [`AdmittedCall::complete`].
    pub fn complete(self, code: tonic::Code) {
        if let RoutedCall::Pooled(call) = self {
            call.complete(code);
        }
    }
}

/// Issues calls on a client channel.
pub struct CallInvoker<F: ChannelFactory> {
    client: ClientChannel<F>,
}

impl<F: ChannelFactory> std::fmt::Debug for CallInvoker<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallInvoker").field("client", &self.client).finish()
    }
}

impl<F: ChannelFactory> CallInvoker<F> {
    /// Wraps an existing client channel.
    pub fn new(client: ClientChannel<F>) -> Self {
        Self { client }
    }

    /// Builds a pooled invoker.
    pub fn pooled(
        factory: F,
        target: &str,
        credentials: F::Credentials,
        options: PoolOptions,
    ) -> Result<Self> {
        let pool = channel_factory_override(factory, target, credentials, options)?;
        Ok(Self::new(ClientChannel::Pooled(pool)))
    }

    /// The underlying client channel.
    pub fn client(&self) -> &ClientChannel<F> {
        &self.client
    }

    /// The pool, if this invoker is pooled.
    pub fn pool(&self) -> Option<&Arc<ChannelPool<F>>> {
        match &self.client {
            ClientChannel::Pooled(pool) => Some(pool),
            ClientChannel::Plain(_) => None,
        }
    }

    /// Routes a call whose body the caller drives.
    pub fn start_call(
        &self,
        method: &MethodDescriptor,
        request: Option<&dyn AffinityMessage>,
    ) -> Result<RoutedCall<'_, F>> {
        call_invocation_transformer(&self.client, method, request)
    }

    /// Runs a unary call.
    ///
    /// `op` receives a handle to the chosen channel and the request. Its
    /// outcome drives completion; dropping the returned future cancels the
    /// call and releases its stream slot.
    pub async fn unary<Req, Resp, Op, Fut>(
        &self,
        method: &MethodDescriptor,
        request: Req,
        op: Op,
    ) -> std::result::Result<Resp, tonic::Status>
    where
        F::Channel: Clone,
        Req: AffinityMessage,
        Resp: AffinityMessage,
        Op: FnOnce(F::Channel, Req) -> Fut,
        Fut: Future<Output = std::result::Result<Resp, tonic::Status>>,
    {
        let mut call = self.start_call(method, Some(&request))?;
        let channel = call.channel().clone();
        call.start();
        match op(channel, request).await {
            Ok(response) => {
                call.on_response(&response);
                call.complete(tonic::Code::Ok);
                Ok(response)
            }
            Err(status) => {
                call.complete(status.code());
                Err(status)
            }
        }
    }
}
