//! Error types for the meta store.
//!
//! [`MetaError`] is what store callers see.  Failures coming out of the
//! consensus module ([`ConsensusError`]) and the join client
//! ([`JoinError`]) are carried through verbatim; validation failures of the
//! metadata document are [`DataError`].  `MetaError` implements
//! [`axum::response::IntoResponse`] so HTTP handlers can return it directly.

use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Validation failures raised while applying a command to the document.
///
/// These are deterministic: every replica rejects the same command the same
/// way, so a rejected command never changes the document on any node.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DataError {
    #[error("database name required")]
    DatabaseNameRequired,

    #[error("database already exists: {0}")]
    DatabaseExists(String),

    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    #[error("retention policy name required")]
    RetentionPolicyNameRequired,

    #[error("retention policy already exists: {database}.{name}")]
    RetentionPolicyExists { database: String, name: String },

    #[error("retention policy not found: {database}.{name}")]
    RetentionPolicyNotFound { database: String, name: String },

    #[error("retention policy duration must be at least {min_secs}s or infinite")]
    RetentionPolicyDurationTooLow { min_secs: u64 },

    #[error("replication factor must be greater than 0")]
    ReplicationFactorTooLow,

    #[error("username required")]
    UsernameRequired,

    #[error("user already exists: {0}")]
    UserExists(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node not found: {0}")]
    NodeNotFound(u64),
}

impl DataError {
    /// Return a short machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            DataError::DatabaseNameRequired => "DatabaseNameRequired",
            DataError::DatabaseExists(_) => "DatabaseExists",
            DataError::DatabaseNotFound(_) => "DatabaseNotFound",
            DataError::RetentionPolicyNameRequired => "RetentionPolicyNameRequired",
            DataError::RetentionPolicyExists { .. } => "RetentionPolicyExists",
            DataError::RetentionPolicyNotFound { .. } => "RetentionPolicyNotFound",
            DataError::RetentionPolicyDurationTooLow { .. } => "RetentionPolicyDurationTooLow",
            DataError::ReplicationFactorTooLow => "ReplicationFactorTooLow",
            DataError::UsernameRequired => "UsernameRequired",
            DataError::UserExists(_) => "UserExists",
            DataError::UserNotFound(_) => "UserNotFound",
            DataError::NodeExists(_) => "NodeExists",
            DataError::NodeNotFound(_) => "NodeNotFound",
        }
    }

    /// Return the HTTP status code this rejection maps to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            DataError::DatabaseExists(_)
            | DataError::RetentionPolicyExists { .. }
            | DataError::UserExists(_)
            | DataError::NodeExists(_) => StatusCode::CONFLICT,
            DataError::DatabaseNotFound(_)
            | DataError::RetentionPolicyNotFound { .. }
            | DataError::UserNotFound(_)
            | DataError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Failures reported by a consensus module.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// This node cannot accept writes; `leader` is the current leader's
    /// consensus address when one is known.
    #[error("node is not the leader")]
    NotLeader { leader: Option<String> },

    #[error("no quorum available")]
    NoQuorum,

    #[error("consensus module is shut down")]
    Shutdown,

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The state machine refused the committed command.
    #[error(transparent)]
    Rejected(#[from] DataError),

    #[error("consensus io: {0}")]
    Io(#[from] std::io::Error),

    #[error("consensus codec: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Failures reported by the join client.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("no meta servers configured")]
    NoServers,

    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {addr} failed: {source}")]
    Http {
        addr: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{addr} responded {status}: {body}")]
    Status {
        addr: String,
        status: u16,
        body: String,
    },

    #[error("encoding join request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("snapshot from {addr} has no meta nodes")]
    EmptySnapshot { addr: String },
}

/// Errors surfaced by the store and the meta service.
#[derive(Debug, Error)]
pub enum MetaError {
    /// The consensus listener never reported a bound address.
    #[error("unable to open without raft listener running")]
    ListenerTimeout,

    /// The service was opened without a consensus listener.
    #[error("no raft listener set")]
    NoRaftListener,

    #[error("store already open")]
    AlreadyOpen,

    #[error("store not open")]
    NotOpen,

    #[error("mkdir all {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("raft: {0}")]
    ConsensusOpen(#[source] ConsensusError),

    /// Shutdown was signaled while waiting.  Callers must not retry.
    #[error("closing")]
    Closing,

    /// A bounded wait expired.  Callers may retry.
    #[error("timeout")]
    Timeout,

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error("invalid command: {0}")]
    InvalidCommand(#[source] serde_json::Error),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("user not found")]
    UserNotFound,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MetaError {
    /// Return a short machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            MetaError::ListenerTimeout => "ListenerTimeout",
            MetaError::NoRaftListener => "NoRaftListener",
            MetaError::AlreadyOpen => "AlreadyOpen",
            MetaError::NotOpen => "NotOpen",
            MetaError::Directory { .. } => "DirectoryError",
            MetaError::ConsensusOpen(_) => "ConsensusOpenError",
            MetaError::Closing => "Closing",
            MetaError::Timeout => "Timeout",
            MetaError::Consensus(ConsensusError::NotLeader { .. }) => "NotLeader",
            MetaError::Consensus(ConsensusError::Rejected(e)) => e.code(),
            MetaError::Consensus(_) => "ConsensusError",
            MetaError::Join(_) => "JoinError",
            MetaError::InvalidCommand(_) => "InvalidCommand",
            MetaError::Data(e) => e.code(),
            MetaError::UserNotFound => "UserNotFound",
            MetaError::AuthenticationFailed => "AuthenticationFailed",
            MetaError::Internal(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            MetaError::NotOpen
            | MetaError::Closing
            | MetaError::Consensus(ConsensusError::NotLeader { .. })
            | MetaError::Consensus(ConsensusError::NoQuorum)
            | MetaError::Consensus(ConsensusError::Shutdown) => StatusCode::SERVICE_UNAVAILABLE,
            MetaError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            MetaError::Consensus(ConsensusError::Rejected(e)) => e.status_code(),
            MetaError::Data(e) => e.status_code(),
            MetaError::InvalidCommand(_) => StatusCode::BAD_REQUEST,
            MetaError::UserNotFound | MetaError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            MetaError::Join(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The leader's consensus address carried by a `NotLeader` rejection.
    pub fn leader_hint(&self) -> Option<&str> {
        match self {
            MetaError::Consensus(ConsensusError::NotLeader { leader }) => leader.as_deref(),
            _ => None,
        }
    }
}

impl IntoResponse for MetaError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "code": self.code(),
            "error": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
