/// Error types for the cluster cache adapter.
///
/// Two kinds cover I/O: a failed connection attempt and a failed command on an
/// established connection. Configuration errors are raised synchronously by
/// option construction and setters and never wrap an I/O cause.

/// A failure reported by a cluster client collaborator.
///
/// The `redis` backend converts every `redis::RedisError` into this type, so the
/// adapter never exposes the underlying client's error type.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ClientError {
    message: String,
    code: Option<String>,
    #[source]
    source: Option<redis::RedisError>,
}

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            source: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl From<redis::RedisError> for ClientError {
    fn from(err: redis::RedisError) -> Self {
        Self {
            message: err.to_string(),
            code: err.code().map(str::to_owned),
            source: Some(err),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Could not establish connection to redis cluster")]
    ConnectionFailed {
        #[source]
        source: ClientError,
    },

    #[error("{message}")]
    Operation {
        message: String,
        code: Option<String>,
        #[source]
        source: ClientError,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    pub fn connection_failed(source: ClientError) -> Self {
        Self::ConnectionFailed { source }
    }

    /// Wrap a failed command. The cluster's last reported error wins over the
    /// client error's own message.
    pub fn operation(source: ClientError, last_error: Option<String>) -> Self {
        let message = last_error.unwrap_or_else(|| source.message().to_owned());
        Self::Operation {
            message,
            code: source.code().map(str::to_owned),
            source,
        }
    }

    /// True for the argument/validation class of errors.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::InvalidConfiguration(_) | Self::InvalidArgument(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
