// Error handling framework for the trigger scheduler

use thiserror::Error;

/// Errors raised while validating a schedule or one of its triggers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Invalid identifier '{value}' for {field}: must match [A-Za-z0-9_.-]+")]
    InvalidIdentifier { field: String, value: String },

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Trigger has no unit triggers and can never be satisfied")]
    EmptyTrigger,

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
}

/// Errors raised when a notification cannot be routed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    #[error("{notification_type} notification is missing property '{property}'")]
    MissingProperty {
        notification_type: String,
        property: String,
    },

    #[error("Invalid value '{value}' for notification property '{property}'")]
    InvalidProperty { property: String, value: String },
}

/// Schedule store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Schedule not found: {0}")]
    NotFound(String),

    #[error("Schedule already exists: {0}")]
    AlreadyExists(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Program runtime errors
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("Runtime request failed: {0}")]
    RequestFailed(String),

    #[error("Runtime returned status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Failed to decode runtime response: {0}")]
    InvalidResponse(String),

    #[error("Program not found: {0}")]
    ProgramNotFound(String),
}

/// Queue-related errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to connect to queue: {0}")]
    Connection(String),

    #[error("Failed to create stream: {0}")]
    StreamCreation(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Failed to create consumer: {0}")]
    ConsumerCreation(String),

    #[error("Failed to consume message: {0}")]
    ConsumeFailed(String),

    #[error("Failed to acknowledge message: {0}")]
    AckFailed(String),

    #[error("Failed to publish message: {0}")]
    PublishFailed(String),

    #[error("Message serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Queue operation timed out: {0}")]
    Timeout(String),

    #[error("Message deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Notification source closed")]
    Closed,
}

/// Scheduler control loop errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Notification(#[from] NotificationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Gave up updating schedule {schedule} after {attempts} conflicting writes")]
    CasExhausted { schedule: String, attempts: u32 },

    #[error("Launch of schedule {schedule} failed after {attempts} attempts: {source}")]
    LaunchFailed {
        schedule: String,
        attempts: u32,
        #[source]
        source: RuntimeError,
    },

    #[error("Worker panicked while processing schedule {0}")]
    WorkerPanicked(String),

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

impl StoreError {
    /// Failures that may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionFailed(_)
                | StoreError::QueryFailed(_)
                | StoreError::HealthCheckFailed(_)
        )
    }
}

impl SchedulerError {
    /// Whether handing the same input in again later could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::Store(e) => e.is_transient(),
            SchedulerError::CasExhausted { .. } | SchedulerError::ShuttingDown => true,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => StoreError::AlreadyExists(db_err.message().to_string()),
                        _ => StoreError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    StoreError::QueryFailed(db_err.message().to_string())
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
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

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        ValidationError::InvalidJson(err.to_string())
    }
}

impl From<reqwest::Error> for RuntimeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RuntimeError::InvalidResponse(err.to_string())
        } else {
            RuntimeError::RequestFailed(err.to_string())
        }
    }
}
