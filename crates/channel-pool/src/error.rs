use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid api config: {reason}")]
    InvalidConfig { reason: String },

    #[error(
        "channel options must be an object with string keys and integer or string values: {reason}"
    )]
    InvalidChannelOptions { reason: String },

    #[error("failed to create channel {channel_id} to {target}: {reason}")]
    ChannelCreation {
        target: String,
        channel_id: usize,
        reason: String,
    },

    #[error("channel pool for {target} is closed")]
    Closed { target: String },

    #[error("cannot {operation} because there are no channels")]
    NoChannels { operation: &'static str },

    #[error("deadline exceeded while {operation}")]
    DeadlineExceeded { operation: &'static str },

    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// Failure to extract an affinity key from a message.
///
/// Never fatal to a call: the interceptor logs it and routes without affinity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("affinity key path is empty")]
    EmptyPath,

    #[error("cannot find field `{segment}` at depth {depth} of affinity key path `{path}`")]
    FieldNotFound {
        path: String,
        segment: String,
        depth: usize,
    },

    #[error("affinity key path `{path}` resolves to a message, not a scalar value")]
    NotAScalar { path: String },
}

impl From<PoolError> for tonic::Status {
    fn from(err: PoolError) -> Self {
        let message = err.to_string();
        match err {
            PoolError::InvalidConfig { .. }
            | PoolError::InvalidChannelOptions { .. }
            | PoolError::ConfigParse(_) => tonic::Status::invalid_argument(message),
            PoolError::Closed { .. } | PoolError::NoChannels { .. } => {
                tonic::Status::unavailable(message)
            }
            PoolError::DeadlineExceeded { .. } => tonic::Status::deadline_exceeded(message),
            PoolError::ChannelCreation { .. } | PoolError::Transport { .. } => {
                tonic::Status::internal(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_channels_message() {
        let err = PoolError::NoChannels {
            operation: "watch connectivity state",
        };
        assert_eq!(
            err.to_string(),
            "cannot watch connectivity state because there are no channels"
        );
    }

    #[test]
    fn test_status_conversion_codes() {
        let status: tonic::Status = PoolError::DeadlineExceeded {
            operation: "watching connectivity state",
        }
        .into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);

        let status: tonic::Status = PoolError::Closed {
            target: "localhost:443".to_string(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert!(status.message().contains("localhost:443"));

        let status: tonic::Status = PoolError::InvalidConfig {
            reason: "bad".to_string(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn test_resolve_error_display() {
        let err = ResolveError::FieldNotFound {
            path: "session.name".to_string(),
            segment: "name".to_string(),
            depth: 1,
        };
        assert!(err.to_string().contains("`name`"));
        assert!(err.to_string().contains("session.name"));
    }
}
