//! Error taxonomy shared across the agent core.
//!
//! Every component surfaces faults through [`AgentError`] rather than letting
//! driver- or transport-specific error types cross a component boundary. The
//! RPC dispatcher is the only place that turns one of these into a wire-level
//! JSON-RPC error object.

use thiserror::Error;

/// Errors surfaced across component boundaries in the agent core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// Malformed wire frame or unparseable JSON-RPC envelope.
    #[error("transport parse error: {0}")]
    TransportParse(String),

    /// Request or response failed schema validation.
    #[error("schema violation in {field}: {message}")]
    SchemaViolation { field: String, message: String },

    /// `Class.verb` does not resolve against the method registry.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// A parameter's type or presence did not match the schema.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// A value was syntactically well-formed but out of the accepted
    /// range, e.g. starting a Periodic Operation with `period <= 0`.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Domain-specific failure reported by a facade, with a stable code.
    #[error("business error {code}: {message}")]
    Business { code: i64, message: String },

    /// The underlying virtualization driver connection is gone.
    #[error("driver unavailable: {0}")]
    DriverUnavailable(String),

    /// The guest-agent side channel failed to respond within its timeout.
    #[error("guest agent unresponsive: {0}")]
    AgentUnresponsive(String),

    /// A bounded queue (executor, HTTP image transport) is full.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The agent has not finished recovery; non-recovery RPCs are rejected.
    #[error("recovery in progress")]
    RecoveryInProgress,

    /// Anything else. Carries a stringified cause; the caller logs a
    /// backtrace at the point of conversion.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn schema_violation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn business(code: i64, message: impl Into<String>) -> Self {
        Self::Business {
            code,
            message: message.into(),
        }
    }

    /// JSON-RPC 2.0 error code for this variant (see §6, §7).
    pub fn rpc_code(&self) -> i64 {
        match self {
            AgentError::TransportParse(_) => -32700,
            AgentError::MethodNotFound(_) => -32601,
            AgentError::InvalidParams(_) => -32602,
            AgentError::InvalidValue(_) => -32602,
            AgentError::SchemaViolation { .. } => -32602,
            AgentError::RecoveryInProgress => -32000,
            AgentError::Business { code, .. } => *code,
            AgentError::DriverUnavailable(_) => -32001,
            AgentError::AgentUnresponsive(_) => -32002,
            AgentError::ResourceExhausted(_) => -32003,
            AgentError::Internal(_) => -32603,
        }
    }

    /// Whether this error should ever bring a connection or the agent down.
    /// None of these do — every variant is recoverable at the component that
    /// raised it (§7 propagation policy).
    pub fn is_fatal(&self) -> bool {
        false
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::TransportParse(e.to_string())
    }
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;
