//! Top-level error types.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Argument(#[from] ArgError),

    #[error(transparent)]
    Irc(#[from] IrcError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("failed to fetch input image: {0}")]
    InputFetch(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Bus (message broker) errors.
///
/// `Transient` corresponds to §7's *BusTransient*: the caller should return
/// `false` from `receive` so the message is redelivered. `Fatal` corresponds
/// to *BusFatal*: the process should exit and rely on a supervisor restart.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("transient bus error: {0}")]
    Transient(String),

    #[error("fatal bus error: {0}")]
    Fatal(String),

    #[error("consumer '{0}' already exists, a previous instance may not have expired yet")]
    DuplicateConsumer(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Prompt argument parsing outcomes (§4.2). `Usage` is not an error in the
/// user-facing sense — it surfaces as `Reply::Usage`.
#[derive(Debug, thiserror::Error)]
pub enum ArgError {
    #[error("{0}")]
    Usage(String),

    #[error("{0}")]
    Invalid(String),
}

/// IRC protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum IrcError {
    #[error("empty IRC line")]
    EmptyLine,

    #[error("malformed IRC line: {0}")]
    Malformed(String),

    #[error("connection error: {0}")]
    Connection(String),
}

/// Backend provider errors, mapped to stable user-facing categories (§7).
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("service unavailable, try again")]
    Unavailable,

    #[error("service error, ask your bot admin to check logs")]
    RateLimitOrAuth,

    #[error("request error, ask your bot admin to check logs")]
    InvalidRequest,

    #[error("unknown error, ask your bot admin to check logs")]
    Unknown,
}
