//! Error types for Teamcast

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TeamcastError>;

#[derive(Error, Debug)]
pub enum TeamcastError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Already exists: {0}")]
    Duplicate(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

impl TeamcastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            TeamcastError::Validation(_) => 3,
            TeamcastError::Authorization(_) => 2,
            TeamcastError::Credential(_) => 2,
            TeamcastError::Platform(PlatformError::Authentication(_)) => 2,
            TeamcastError::Platform(_) => 1,
            TeamcastError::Duplicate(_)
            | TeamcastError::NotFound(_)
            | TeamcastError::Conflict(_) => 1,
            TeamcastError::Config(_) => 1,
            TeamcastError::Database(_) => 1,
        }
    }

    /// Whether the operation that produced this error may succeed if attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            TeamcastError::Platform(e) => e.is_retryable(),
            TeamcastError::Database(_) => true,
            _ => false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("content text cannot be empty")]
    EmptyContent,

    #[error("scheduled time must be in the future")]
    ScheduleTimeInPast,

    #[error("a post must target at least one platform")]
    NoPlatforms,

    #[error("{platform} allows at most {max} characters (got {actual})")]
    ContentTooLong {
        platform: String,
        max: usize,
        actual: usize,
    },

    #[error("{platform} allows at most {max} media attachments (got {actual})")]
    TooManyMedia {
        platform: String,
        max: usize,
        actual: usize,
    },

    #[error("{platform} requires at least one media attachment")]
    MediaRequired { platform: String },

    #[error("{platform} does not accept media of type {media_type}")]
    UnsupportedMediaType { platform: String, media_type: String },

    #[error("cannot {action} a {entity} in state {from}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        action: &'static str,
    },

    #[error("published posts cannot be edited")]
    CannotEditPublished,

    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("a team must keep at least one active owner")]
    LastOwner,

    #[error("{0}")]
    Invalid(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("stored credentials are corrupt: {0}")]
    Corrupt(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("no credentials stored for account {0}")]
    NotFound(String),

    #[error("the platform rejected the access token: {0}")]
    InvalidToken(String),

    #[error("credentials were encrypted with unknown key version {0}")]
    UnknownKeyVersion(u32),

    #[error("key ring error: {0}")]
    KeyRing(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// Credentials are no longer accepted and refreshing will not help
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// HTTP 401 on an expired access token; worth one attempt after a forced refresh
    #[error("Access token expired: {0}")]
    TokenExpired(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Request rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Platform server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Token refresh not supported: {0}")]
    RefreshNotSupported(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl PlatformError {
    /// Rate limits, 5xx responses and transport failures are transient
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlatformError::RateLimit { .. }
                | PlatformError::Server { .. }
                | PlatformError::Network(_)
        )
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, PlatformError::RateLimit { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PlatformError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// The account cannot recover without the user authorizing it again
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            PlatformError::Authentication(_) | PlatformError::RefreshNotSupported(_)
        )
    }
}
