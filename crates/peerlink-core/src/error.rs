//! Error types for Peerlink

use std::fmt;

use thiserror::Error;

/// Status used when a local error is reported through a correlator.
pub const STATUS_BAD_REQUEST: i32 = 400;

/// Status used when a wait on a correlator expires.
pub const STATUS_TIMEOUT: i32 = 408;

/// Failure tuple delivered through every asynchronous boundary.
///
/// Carries the id of the request that failed, the numeric status reported by
/// the server (or assigned locally) and a free-text detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgFailure {
    pub message_id: u32,
    pub status: i32,
    pub detail: String,
}

impl MsgFailure {
    pub fn new(message_id: u32, status: i32, detail: impl Into<String>) -> Self {
        Self {
            message_id,
            status,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for MsgFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message {} failed with status {}: {}",
            self.message_id, self.status, self.detail
        )
    }
}

/// Main error type for Peerlink operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    /// The session to the profile server is not up
    #[error("Connection not established: {0}")]
    ConnectionNotEstablished(String),

    /// The transport refused or failed to send a request
    #[error("Transport send failure: {0}")]
    TransportSend(String),

    /// The transport could not connect to the profile server
    #[error("Transport connect failure: {0}")]
    TransportConnect(String),

    /// An open call for the same (service, remote profile) already exists
    #[error("Call already exists")]
    DuplicateCall,

    /// The remote profile does not advertise the requested service
    #[error("Remote profile not accept service {0}")]
    ServiceNotSupported(String),

    /// The remote profile is not connected to its server
    #[error("Remote profile not online")]
    RemoteOffline,

    /// A message envelope could not be decoded
    #[error("Envelope decode error: {0}")]
    EnvelopeDecode(String),

    /// No outcome arrived before the wait expired
    #[error("Wait timed out after {0} ms")]
    WaitTimeout(u64),

    /// A request failed on the remote side (or was failed locally)
    #[error("Request {message_id} failed with status {status}: {detail}")]
    Request {
        message_id: u32,
        status: i32,
        detail: String,
    },

    /// The server no longer knows the call channel
    #[error("Call is not longer available")]
    CallUnavailable,

    /// The application service refused the call
    #[error("Call rejected: {0}")]
    CallRejected(String),

    /// Invalid operation for current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An external store failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// No orchestrator exists for the local profile
    #[error("Profile connection not established: {0}")]
    ProfileNotConnected(String),

    /// An orchestrator already exists for the local profile
    #[error("Profile connection already initialized: {0}")]
    AlreadyConnected(String),

    /// A required application service is not registered
    #[error("Application service not registered: {0}")]
    UnknownService(String),
}

impl LinkError {
    /// Numeric status used when this error crosses a correlator boundary.
    pub fn status_code(&self) -> i32 {
        match self {
            LinkError::Request { status, .. } => *status,
            LinkError::WaitTimeout(_) => STATUS_TIMEOUT,
            _ => STATUS_BAD_REQUEST,
        }
    }

    /// Convert into the failure tuple for `message_id`.
    pub fn to_failure(&self, message_id: u32) -> MsgFailure {
        match self {
            LinkError::Request {
                message_id,
                status,
                detail,
            } => MsgFailure::new(*message_id, *status, detail.clone()),
            other => MsgFailure::new(message_id, other.status_code(), other.detail()),
        }
    }

    /// Free-text detail without the variant prefix where one exists.
    pub fn detail(&self) -> String {
        match self {
            LinkError::Request { detail, .. } => detail.clone(),
            other => other.to_string(),
        }
    }
}

impl From<MsgFailure> for LinkError {
    fn from(failure: MsgFailure) -> Self {
        LinkError::Request {
            message_id: failure.message_id,
            status: failure.status,
            detail: failure.detail,
        }
    }
}

impl From<postcard::Error> for LinkError {
    fn from(err: postcard::Error) -> Self {
        LinkError::Serialization(err.to_string())
    }
}

/// Result type alias using LinkError
pub type LinkResult<T> = Result<T, LinkError>;
