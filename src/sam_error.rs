//! Error types for scenario loading, dispatching and simulation

use crate::sam_interface::{ClientId, MessageId};

/// Scenario configuration is unusable. Always fatal, raised before tick 0.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse scenario: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("failed to read scenario file: {0}")]
    Io(#[from] std::io::Error),
    #[error("scenario has no clients")]
    NoClients,
    #[error("group fractions must add up to 1 (got {0})")]
    GroupSum(f64),
    #[error("group fraction #{index} must be > 0 (got {value})")]
    GroupFraction { index: usize, value: f64 },
    #[error("{clients} clients cannot fill {groups} groups")]
    TooFewClients { clients: usize, groups: usize },
    #[error("group {group} would be empty after apportioning {clients} clients")]
    EmptyGroup { group: usize, clients: usize },
    #[error("range `{field}` is malformed: min {min} > max {max}")]
    Range { field: &'static str, min: f64, max: f64 },
    #[error("`{field}` must be within [0, 1] (got {value})")]
    Probability { field: &'static str, value: f64 },
    #[error("`{field}` must be positive and finite (got {value})")]
    NotPositive { field: &'static str, value: f64 },
}

/// Failure at the infrastructure boundary
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("registration of client {client} failed: {reason}")]
    Registration { client: ClientId, reason: String },
    #[error("transmit of message {message} failed: {reason}")]
    Transmit { message: MessageId, reason: String },
}

/// Top-level error for a scenario run
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("startup failed: {0}")]
    Registration(DispatchError),
    /// Reconciliation or scheduler bookkeeping mismatch; carries the full diagnostic.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
    #[error("report i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("report serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl SimError {
    /// Process exit code for the runner binary
    pub fn exit_code(&self) -> i32 {
        match self {
            SimError::Config(_) => 2,
            SimError::Registration(_) => 3,
            SimError::InternalInvariant(_) => 4,
            SimError::Io(_) | SimError::Serialize(_) => 1,
        }
    }
}
