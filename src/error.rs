//! Typed errors surfaced by the import pipeline.
//!
//! Every variant maps to a stable [`ImportError::reason`] string so callers
//! can pick a user-facing message without parsing the `Display` text.
//! Store implementations and the CLI propagate `anyhow`; the pipeline's public
//! entry points return these types.

/// Errors returned by the session import pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// The request did not complete within the configured timeout.
    #[error("request timed out after {timeout_secs}s: {url}")]
    Timeout { url: String, timeout_secs: u64 },

    /// The request failed before a response was received.
    #[error("network failure fetching {url}: {detail}")]
    Network { url: String, detail: String },

    /// The peer reset the connection.
    #[error("connection reset while fetching {url}")]
    ConnectionReset { url: String },

    /// The server answered with a non-success status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    /// The advertised or received body exceeds the configured cap.
    #[error("session is too large: {actual} bytes exceeds the {limit} byte limit")]
    TooLarge { limit: u64, actual: u64 },

    /// Every attempt failed with a retryable error.
    #[error("fetch failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ImportError>,
    },

    /// `metadata.format` is not a recognized session export tag.
    #[error("unsupported session format {found:?} (expected \"lexiconforge*\")")]
    InvalidFormat { found: String },

    /// The document ended without a `metadata` object.
    #[error("session document has no metadata")]
    MissingMetadata,

    /// The document is not well-formed JSON.
    #[error("malformed session JSON at byte {offset}: {detail}")]
    Parse { offset: u64, detail: String },

    /// The input URL could not be understood.
    #[error("invalid session url {url:?}: {detail}")]
    InvalidUrl { url: String, detail: String },

    /// The caller cancelled the import.
    #[error("import cancelled")]
    Cancelled,

    #[error("io error reading {what}: {source}")]
    Io {
        what: String,
        #[source]
        source: std::io::Error,
    },
}

impl ImportError {
    /// Stable, machine-readable discriminator for UI message selection.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Network { .. } => "network",
            Self::ConnectionReset { .. } => "connection-reset",
            Self::HttpStatus { .. } => "http-status",
            Self::TooLarge { .. } => "too-large",
            Self::RetriesExhausted { .. } => "retries-exhausted",
            Self::InvalidFormat { .. } => "invalid-format",
            Self::MissingMetadata => "missing-metadata",
            Self::Parse { .. } => "parse",
            Self::InvalidUrl { .. } => "invalid-url",
            Self::Cancelled => "cancelled",
            Self::Io { .. } => "io",
        }
    }

    /// Whether the transfer layer may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Network { .. } | Self::ConnectionReset { .. }
        )
    }
}
