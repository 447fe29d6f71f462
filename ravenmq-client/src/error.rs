//! Error types for the RavenMQ client library

/// Main error type for RavenMQ client operations
#[derive(Debug, thiserror::Error)]
pub enum RavenClientError {
    /// Transient connection errors, these drive failover
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Reconnection attempts exhausted or the server went away for good
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    /// Operation on a closed connection, session, producer or consumer
    #[error("{object} is closed")]
    Closed { object: &'static str },

    /// Operation not allowed in the current state
    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    /// Session management call made from the session's own listener
    #[error("Illegal reentrant call: {message}")]
    Reentrancy { message: String },

    /// Neither the producer nor the send call names a destination
    #[error("Destination address is required: the producer has no fixed address and none was supplied")]
    DestinationRequired,

    /// The current transaction was rolled back and must be retried
    #[error("Transaction rolled back: {message}")]
    TransactionRolledBack { message: String },

    /// Acknowledgement could not be applied
    #[error("Acknowledgement failed: {message}")]
    Acknowledgement { message: String },

    /// Protocol-related errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Error reported by the server
    #[error("Server error {code:?}: {message}")]
    Server { code: ErrorCode, message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Index outside of a wire string
    #[error("Index {index} out of bounds for length {length}")]
    IndexOutOfBounds { index: usize, length: usize },

    /// Queue does not exist
    #[error("Queue '{queue}' does not exist")]
    QueueNotFound { queue: String },

    /// Queue already exists
    #[error("Queue '{queue}' already exists")]
    QueueExists { queue: String },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// No server could be reached
    #[error("No available servers")]
    NoServersAvailable,
}

impl RavenClientError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new connection lost error
    pub fn connection_lost<S: Into<String>>(message: S) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    /// Create a closed-object error
    pub fn closed(object: &'static str) -> Self {
        Self::Closed { object }
    }

    /// Create a new illegal state error
    pub fn illegal_state<S: Into<String>>(message: S) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Create a new reentrancy error
    pub fn reentrancy<S: Into<String>>(message: S) -> Self {
        Self::Reentrancy {
            message: message.into(),
        }
    }

    /// Create a new transaction rolled back error
    pub fn rolled_back<S: Into<String>>(message: S) -> Self {
        Self::TransactionRolledBack {
            message: message.into(),
        }
    }

    /// Create a new acknowledgement error
    pub fn acknowledgement<S: Into<String>>(message: S) -> Self {
        Self::Acknowledgement {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::NoServersAvailable | Self::Io(_)
        )
    }

    /// Check if this error signals a broken transport
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_) | Self::Timeout { .. })
    }

    /// Check if this error belongs to the illegal-state class
    pub fn is_illegal_state(&self) -> bool {
        matches!(
            self,
            Self::IllegalState { .. } | Self::Reentrancy { .. } | Self::Closed { .. }
        )
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Error codes carried in server responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No error
    None = 0,
    /// Unknown server error
    Internal = -1,
    /// Queue does not exist
    QueueDoesNotExist = 1,
    /// Queue already exists
    QueueExists = 2,
    /// Server is not connected
    NotConnected = 3,
    /// Connection timed out
    ConnectionTimedOut = 4,
    /// Server disconnected the client
    Disconnected = 5,
    /// Blocking call unblocked by failover
    UnblockedCall = 6,
    /// Server I/O failure
    IoError = 7,
    /// Server-side object already closed
    ObjectClosed = 8,
    /// Server state did not allow the call
    IllegalState = 9,
    /// Transaction was rolled back by the server
    TransactionRolledBack = 10,
    /// Session creation refused
    SessionCreationRejected = 11,
    /// Server does not recognise the message being acknowledged
    UnknownMessage = 12,
}

impl ErrorCode {
    /// Convert error code to a client error
    pub fn to_client_error(self, context: &str) -> RavenClientError {
        match self {
            ErrorCode::QueueDoesNotExist => RavenClientError::QueueNotFound {
                queue: context.to_string(),
            },
            ErrorCode::QueueExists => RavenClientError::QueueExists {
                queue: context.to_string(),
            },
            ErrorCode::NotConnected
            | ErrorCode::Disconnected
            | ErrorCode::IoError
            | ErrorCode::UnblockedCall => {
                RavenClientError::connection(format!("{:?}: {}", self, context))
            }
            ErrorCode::ConnectionTimedOut => RavenClientError::connection(format!(
                "Connection timed out: {}",
                context
            )),
            ErrorCode::ObjectClosed => RavenClientError::closed("server object"),
            ErrorCode::IllegalState => RavenClientError::illegal_state(context.to_string()),
            ErrorCode::TransactionRolledBack => RavenClientError::rolled_back(context.to_string()),
            ErrorCode::UnknownMessage => RavenClientError::acknowledgement(format!(
                "Message not recognised by server: {}",
                context
            )),
            ErrorCode::None | ErrorCode::Internal | ErrorCode::SessionCreationRejected => {
                RavenClientError::Server {
                    code: self,
                    message: context.to_string(),
                }
            }
        }
    }
}

impl From<i16> for ErrorCode {
    fn from(code: i16) -> Self {
        match code {
            0 => ErrorCode::None,
            1 => ErrorCode::QueueDoesNotExist,
            2 => ErrorCode::QueueExists,
            3 => ErrorCode::NotConnected,
            4 => ErrorCode::ConnectionTimedOut,
            5 => ErrorCode::Disconnected,
            6 => ErrorCode::UnblockedCall,
            7 => ErrorCode::IoError,
            8 => ErrorCode::ObjectClosed,
            9 => ErrorCode::IllegalState,
            10 => ErrorCode::TransactionRolledBack,
            11 => ErrorCode::SessionCreationRejected,
            12 => ErrorCode::UnknownMessage,
            _ => ErrorCode::Internal,
        }
    }
}
