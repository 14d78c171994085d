use thiserror::Error;

// ---------------------------------------------------------------------------
// Object store errors
// ---------------------------------------------------------------------------

/// Errors talking to the object-storage provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The account authorization endpoint answered with a non-success status.
    #[error("object store authorization failed with status {status}")]
    Auth { status: u16 },

    /// The account authorization endpoint could not be reached or answered garbage.
    #[error("object store authorization failed: {reason}")]
    AuthUnreachable { reason: String },

    #[error("object store {operation} request failed with status {status}")]
    UpstreamStatus { operation: &'static str, status: u16 },

    #[error("object store listing failed: {reason}")]
    Listing { reason: String },

    #[error("malformed object store response: {reason}")]
    MalformedResponse { reason: String },

    #[error("object store transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ProviderError {
    /// Whether this failure happened while obtaining a credential.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            ProviderError::Auth { .. } | ProviderError::AuthUnreachable { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Record storage errors
// ---------------------------------------------------------------------------

/// Errors from the catalog table backend.
#[derive(Debug, Error)]
pub enum RecordStorageError {
    #[error("record storage rejected request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("record storage returned malformed data: {reason}")]
    Malformed { reason: String },

    #[error("record storage error: {0}")]
    Backend(String),

    #[error("record storage transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

// ---------------------------------------------------------------------------
// Synchronization errors
// ---------------------------------------------------------------------------

/// Failures that abort a whole reconciliation run.
///
/// Per-object failures never surface here; they are recorded in the report.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to list bucket: {0}")]
    Listing(#[from] ProviderError),
}

// ---------------------------------------------------------------------------
// Delivery errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the HTTP handlers.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("missing required parameter: {name}")]
    MissingParameter { name: &'static str },

    #[error("failed to authorize with the object store")]
    UpstreamAuth,

    #[error("failed to stream audio file")]
    UpstreamFetch,
}

impl DeliveryError {
    pub fn status_code(&self) -> u16 {
        match self {
            DeliveryError::MissingParameter { .. } => 400,
            DeliveryError::UpstreamAuth => 502,
            DeliveryError::UpstreamFetch => 500,
        }
    }

    /// Return the error code string for JSON responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            DeliveryError::MissingParameter { .. } => "missing_parameter",
            DeliveryError::UpstreamAuth => "upstream_auth_failed",
            DeliveryError::UpstreamFetch => "stream_failed",
        }
    }
}

impl From<&ProviderError> for DeliveryError {
    fn from(err: &ProviderError) -> Self {
        if err.is_auth() {
            DeliveryError::UpstreamAuth
        } else {
            DeliveryError::UpstreamFetch
        }
    }
}
