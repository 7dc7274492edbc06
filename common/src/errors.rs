// Error types shared across the workspace

use thiserror::Error;

/// Schedule-related errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("No next occurrence for expression '{0}'")]
    NoNextOccurrence(String),

    #[error("Invalid window boundaries: {0}")]
    InvalidWindowBoundaries(String),

    #[error("Schedule calculation failed: {0}")]
    CalculationFailed(String),
}

/// Durable store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Store health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("Stored value invalid for {field}: {reason}")]
    InvalidStoredValue { field: String, reason: String },

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Errors surfaced by the settlement collaborators (ledger, policy
/// administration, payment feed)
#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("{collaborator} unavailable: {reason}")]
    Unavailable { collaborator: String, reason: String },

    #[error("{collaborator} rejected the request: {reason}")]
    Rejected { collaborator: String, reason: String },
}

impl CollaboratorError {
    pub fn unavailable(collaborator: impl Into<String>, reason: impl Into<String>) -> Self {
        CollaboratorError::Unavailable {
            collaborator: collaborator.into(),
            reason: reason.into(),
        }
    }

    pub fn rejected(collaborator: impl Into<String>, reason: impl Into<String>) -> Self {
        CollaboratorError::Rejected {
            collaborator: collaborator.into(),
            reason: reason.into(),
        }
    }

    /// An unavailable collaborator is worth another attempt; a rejection is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, CollaboratorError::Unavailable { .. })
    }
}

/// Job execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Execution timeout after {0} seconds")]
    Timeout(u64),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Execution token superseded")]
    TokenSuperseded,

    #[error("No handler registered for job kind: {0}")]
    UnknownJobKind(String),

    #[error("Invalid job configuration: {0}")]
    InvalidJobConfig(String),

    #[error("{0} item(s) failed during the run")]
    ItemFailures(u64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl ExecutionError {
    /// Whether another attempt could plausibly succeed. Permanent errors
    /// (unknown kind, bad configuration, superseded token) bypass the retry
    /// budget entirely.
    pub fn is_transient(&self) -> bool {
        match self {
            ExecutionError::Timeout(_) => true,
            ExecutionError::ItemFailures(_) => true,
            ExecutionError::Store(_) => true,
            ExecutionError::Collaborator(e) => e.is_transient(),
            ExecutionError::Cancelled
            | ExecutionError::TokenSuperseded
            | ExecutionError::UnknownJobKind(_)
            | ExecutionError::InvalidJobConfig(_) => false,
        }
    }
}

/// Errors returned by the operator-facing job service
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job name already in use: {0}")]
    DuplicateName(String),

    #[error("Job '{job}' is {status}; cannot {action}")]
    InvalidTransition {
        job: String,
        status: String,
        action: String,
    },

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// Implement From for common external errors
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                // Check for specific database error codes
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => StoreError::DuplicateKey(db_err.message().to_string()),
                        "23503" => StoreError::ForeignKeyViolation(db_err.message().to_string()),
                        _ => StoreError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    StoreError::QueryFailed(db_err.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::ConnectionFailed(err.to_string())
            }
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::MigrationFailed(err.to_string())
    }
}

impl From<sqlx::Error> for CollaboratorError {
    fn from(err: sqlx::Error) -> Self {
        CollaboratorError::Unavailable {
            collaborator: "database".to_string(),
            reason: err.to_string(),
        }
    }
}
