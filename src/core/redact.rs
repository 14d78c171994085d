use std::fmt;

// ---------------------------------------------------------------------------
// Secret redaction for log output
// ---------------------------------------------------------------------------

/// A wrapper that redacts its contents when displayed or debug-printed.
///
/// Usage:
/// ```ignore
/// let key = Redacted::new(&config.provider.application_key);
/// tracing::info!(application_key = %key, "authorizing"); // logs: application_key=[REDACTED]
/// ```
#[derive(Clone)]
pub struct Redacted<T>(T);

impl<T> Redacted<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Redact an application key id: show the first 6 characters only.
///
/// `005ef3018aedce30000000002` becomes `005ef3***`.
pub fn redact_key_id(key_id: &str) -> String {
    if key_id.chars().count() <= 6 {
        return "****".to_string();
    }
    let visible: String = key_id.chars().take(6).collect();
    format!("{}***", visible)
}

/// Redact a bearer token for logging.
pub fn redact_bearer_token(header_value: &str) -> String {
    if header_value.starts_with("Bearer ") {
        "Bearer [REDACTED]".to_string()
    } else {
        "[REDACTED]".to_string()
    }
}
