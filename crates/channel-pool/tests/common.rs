//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use channel_pool::{
    ApiConfig, CallInterceptor, ChannelPool, PoolOptions, SimChannelFactory, SimCredentials,
};
use serde_json::json;

pub const TARGET: &str = "spanner.googleapis.com:443";

/// Installs a test subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Spanner-like API config with session affinity rules.
pub fn spanner_config(max_size: u32, watermark: u32) -> ApiConfig {
    ApiConfig::from_json_value(json!({
        "channelPool": {
            "maxSize": max_size,
            "maxConcurrentStreamsLowWatermark": watermark
        },
        "method": [
            {
                "name": ["/google.spanner.v1.Spanner/CreateSession"],
                "affinity": {"command": "BIND", "affinityKey": "name"}
            },
            {
                "name": [
                    "/google.spanner.v1.Spanner/GetSession",
                    "/google.spanner.v1.Spanner/ExecuteSql",
                    "/google.spanner.v1.Spanner/ExecuteStreamingSql"
                ],
                "affinity": {"command": "BOUND", "affinityKey": "session"}
            },
            {
                "name": ["/google.spanner.v1.Spanner/DeleteSession"],
                "affinity": {"command": "UNBIND", "affinityKey": "name"}
            }
        ]
    }))
    .expect("valid test config")
}

/// Pool over a fresh simulated factory.
pub fn pool(config: ApiConfig) -> (Arc<ChannelPool<SimChannelFactory>>, SimChannelFactory) {
    let factory = SimChannelFactory::new();
    let pool = ChannelPool::new(
        factory.clone(),
        TARGET,
        SimCredentials::default(),
        PoolOptions {
            api_config: Some(config),
            ..Default::default()
        },
    )
    .expect("pool construction");
    (Arc::new(pool), factory)
}

/// Interceptor over a fresh Spanner-configured pool.
pub fn interceptor(max_size: u32, watermark: u32) -> CallInterceptor<SimChannelFactory> {
    let (pool, _) = pool(spanner_config(max_size, watermark));
    CallInterceptor::new(pool)
}
