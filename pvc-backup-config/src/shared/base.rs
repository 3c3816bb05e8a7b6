use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A path setting was empty.
    #[error("`{0}` cannot be empty")]
    EmptyPath(&'static str),
    /// The helper image reference was empty.
    #[error("`helper.image` cannot be empty")]
    EmptyHelperImage,
    /// A timeout or interval setting was zero.
    #[error("`{0}` must be greater than zero")]
    ZeroDuration(&'static str),
    /// The namespace scan limit was zero.
    #[error("`discovery.max_namespace_scan` must be greater than zero")]
    ZeroNamespaceScan,
    /// The batch concurrency limit was zero.
    #[error("`batch.max_concurrency` must be greater than zero")]
    ZeroConcurrency,
    /// Retry settings cannot produce a single attempt.
    #[error("invalid retry config: {0}")]
    InvalidRetry(&'static str),
    /// A required remote destination field was missing.
    #[error("remote destination `{0}` is required")]
    MissingRemoteField(&'static str),
}
