#![warn(missing_docs)]

//! Channel pooling for RPC clients: bounded least-loaded pool, call affinity and
//! connectivity aggregation.
//!
//! Admission: Call → Method rule → Affinity key (request) → Pool select → Stream count
//! Completion: Status → Bind (first response) / Unbind (admission key) → Stream release

pub mod affinity;
pub mod channel;
pub mod channel_ref;
pub mod config;
pub mod connectivity;
pub mod deadline;
pub mod error;
pub mod interceptor;
pub mod invoker;
pub mod pool;
pub mod sim;

pub use affinity::{affinity_key_from_message, resolve_affinity_key, AffinityMessage, FieldValue};
pub use channel::{
    Channel, ChannelFactory, ChannelOptionValue, ChannelOptions, ConnectivityState,
    CLIENT_CHANNEL_ID,
};
pub use channel_ref::ChannelRef;
pub use config::{
    AffinityCommand, AffinityConfig, ApiConfig, ChannelPoolConfig, MethodAffinity, MethodConfig,
    PoolSettings,
};
pub use connectivity::aggregate_states;
pub use deadline::Deadline;
pub use error::{PoolError, ResolveError, Result};
pub use interceptor::{AdmittedCall, CallInterceptor, CallPhase};
pub use invoker::{
    call_invocation_transformer, channel_factory_override, CallInvoker, ClientChannel,
    MethodDescriptor, RoutedCall,
};
pub use pool::{ChannelPool, ChannelStats, PoolOptions, PoolStats};
pub use sim::{SimChannel, SimChannelFactory, SimCredentials};
