//! Unified error handling for the reconciler library.
//!
//! Every reconciler returns [`ReconcileError`]. Fatal conditions abort the
//! current invocation immediately; nothing in this module retries.
//!
//! ## Error Categories
//!
//! - [`ReconcileError::Configuration`]: invalid desired state, detected before any network call
//! - [`ReconcileError::Credential`]: no usable authentication method
//! - [`ReconcileError::LookupUnauthorized`] / [`ReconcileError::LookupTransient`]:
//!   lookup failures surfaced by the strict lookup policy
//! - [`ReconcileError::RemoteOperation`]: a mutating call was rejected by the server
//! - [`ReconcileError::Consistency`]: a created entity could not be read back
//! - [`ReconcileError::OperationFailed`]: a long-running operation ended unsuccessfully
//! - [`ReconcileError::Cancelled`]: the caller cancelled the invocation
//!
//! ## Example
//!
//! ```rust
//! use azdo_reconciler::error::ReconcileError;
//!
//! let err = ReconcileError::RemoteOperation {
//!     action: "create repository 'app'".to_string(),
//!     status: 409,
//!     reason: "Conflict".to_string(),
//!     body: "{\"message\":\"exists\"}".to_string(),
//! };
//! assert!(err.to_string().contains("409"));
//! ```

use thiserror::Error;

/// The error type returned by every reconciler operation.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The desired state (or organization reference) is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No authentication method produced a usable token.
    #[error("Credential error: {message}")]
    Credential {
        /// Description of the failure, including remediation hints.
        message: String,
    },

    /// A lookup was rejected with 401/403 while the strict lookup policy is active.
    #[error("Lookup of {resource} was rejected with status {status}; check the token's scopes")]
    LookupUnauthorized {
        /// Description of what was being looked up.
        resource: String,
        /// HTTP status code.
        status: u16,
    },

    /// A lookup failed for a reason other than absence while the strict lookup policy is active.
    #[error("Lookup of {resource} failed: {message}")]
    LookupTransient {
        /// Description of what was being looked up.
        resource: String,
        /// Status line or transport error text.
        message: String,
    },

    /// A mutating call returned a non-success status.
    #[error("Failed to {action}: {status} {reason} {body}")]
    RemoteOperation {
        /// What the call was trying to do.
        action: String,
        /// HTTP status code.
        status: u16,
        /// HTTP reason phrase.
        reason: String,
        /// Response body, verbatim.
        body: String,
    },

    /// A create call succeeded but the entity could not be read back.
    #[error("{kind} '{name}' was not found immediately after it was created")]
    Consistency {
        /// Resource kind.
        kind: &'static str,
        /// Identifier of the missing entity.
        name: String,
    },

    /// A long-running operation reached a failed or cancelled terminal state.
    #[error("Operation {operation_id} finished with status '{status}': {message}")]
    OperationFailed {
        /// Operation identifier.
        operation_id: String,
        /// Terminal status reported by the server.
        status: String,
        /// Server supplied result message.
        message: String,
    },

    /// The HTTP transport failed before a response was received.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A request body could not be serialized.
    #[error("Failed to serialize request body: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A response body did not have the expected shape.
    #[error("Failed to parse response from {context}: {message}")]
    Parse {
        /// Request the response belongs to.
        context: String,
        /// Parser error message.
        message: String,
    },

    /// The invocation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Errors raised by an [`HttpTransport`](crate::api::HttpTransport) implementation.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    Build(String),

    /// The request could not be sent or the response could not be read.
    #[error("Request to {url} failed: {message}")]
    Request {
        /// Target URL.
        url: String,
        /// Underlying error text.
        message: String,
    },
}

impl ReconcileError {
    /// Returns true for errors raised from invalid input rather than remote state.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Type alias for Results using ReconcileError.
pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;
