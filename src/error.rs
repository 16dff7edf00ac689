//! Error types for the ChainSync library

use thiserror::Error;

/// Result type alias for ChainSync operations
pub type Result<T> = std::result::Result<T, ChainSyncError>;

/// Main error type for ChainSync operations
#[derive(Error, Debug)]
pub enum ChainSyncError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// A chain or block failed hash or linkage checks
    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// A chain without a genesis block was encountered
    #[error("Chain is empty")]
    EmptyChain,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network-specific error types
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Failed to bind the listening socket
    #[error("Failed to bind to {addr}: {source}")]
    BindFailed {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to connect to peer
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        source: std::io::Error,
    },

    /// Timeout occurred
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// Frame exceeds the configured maximum
    #[error("Message size {size} exceeds maximum {max_size}")]
    MessageTooLarge { size: usize, max_size: usize },

    /// Invalid message format
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// Peer address could not be parsed
    #[error("Invalid peer address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// Remote side closed the connection before sending a message
    #[error("Connection closed by {addr}")]
    ConnectionClosed { addr: String },

    /// Peer answered with a message of the wrong kind
    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },
}

/// Hash-chain integrity failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    /// Chain contains no blocks
    #[error("Chain has no genesis block")]
    Empty,

    /// First block is not a well-formed genesis block
    #[error("Invalid genesis block: index {index}, previous hash {previous_hash}")]
    InvalidGenesis { index: u64, previous_hash: String },

    /// Stored hash does not match the recomputed one
    #[error("Hash mismatch at index {index}: stored {stored}, computed {computed}")]
    HashMismatch {
        index: u64,
        stored: String,
        computed: String,
    },

    /// Block does not reference its predecessor's hash
    #[error("Broken link at index {index}: expected previous hash {expected}, got {actual}")]
    BrokenLink {
        index: u64,
        expected: String,
        actual: String,
    },

    /// Index is not the predecessor's index plus one
    #[error("Index gap: expected {expected}, got {actual}")]
    IndexGap { expected: u64, actual: u64 },

    /// Block sits at the largest representable index and cannot be followed
    #[error("No index follows {index}")]
    IndexOverflow { index: u64 },
}

/// Serialization error types
#[derive(Error, Debug)]
pub enum SerializationError {
    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChainSyncError {
    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        ChainSyncError::Config(msg.into())
    }

    /// Create an invalid message error
    pub fn invalid_message<T: Into<String>>(reason: T) -> Self {
        ChainSyncError::Network(NetworkError::InvalidMessage {
            reason: reason.into(),
        })
    }

    /// Whether this error came from the network layer
    pub fn is_network(&self) -> bool {
        matches!(self, ChainSyncError::Network(_) | ChainSyncError::Io(_))
    }
}

impl From<serde_json::Error> for ChainSyncError {
    fn from(err: serde_json::Error) -> Self {
        ChainSyncError::Serialization(SerializationError::Json(err))
    }
}
