use std::path::PathBuf;

/// Closed error set for the whole tool. Recoverable kinds (validation and
/// apply preconditions) are translated into model-facing retry prompts by
/// the workflow and never reach `main`; the rest map to typed exit codes.
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("config error: {0}")]
    Config(String),

    #[error("instructions file not found: {0}")]
    InstructionsNotFound(PathBuf),

    // ── validator ──────────────────────────────────────────────────────────
    #[error("malformed patch envelope: {0}")]
    MalformedEnvelope(String),

    #[error("patch schema violation: {0}")]
    SchemaViolation(String),

    #[error("unsafe path in patch: {0}")]
    UnsafePath(String),

    #[error("forbidden chmod mode: {0}")]
    ForbiddenMode(String),

    #[error("missing body/body_b64 for {0}")]
    MissingContent(String),

    // ── applier ────────────────────────────────────────────────────────────
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("git index corrupt: {0}")]
    GitIndexCorrupt(String),

    // ── transports ─────────────────────────────────────────────────────────
    #[error("transport timed out after {0}s")]
    TransportTimeout(u64),

    #[error("transient transport failure: {0}")]
    TransportTransient(String),

    #[error("transport authentication failed: {0}")]
    TransportAuth(String),

    #[error("browser transport UI failure: {0}")]
    TransportUiFailure(String),

    #[error("model violated the patch protocol: {0}")]
    ProtocolViolation(String),

    #[error("browser profile already in use: {0}")]
    ResourceInUse(PathBuf),

    // ── command runner / budgets ───────────────────────────────────────────
    #[error("verification command failed: {0}")]
    CommandFailed(String),

    #[error("verification command timed out after {0}s")]
    CommandTimeout(u64),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    // ── ambient ────────────────────────────────────────────────────────────
    #[error("git error: {0}")]
    Git(String),

    #[error("interrupted")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, ReviewError>;

impl ReviewError {
    /// Map an error escaping the workflow to the documented process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            ReviewError::Config(_) | ReviewError::InstructionsNotFound(_) => 2,
            ReviewError::UnsafePath(_) => 3,
            ReviewError::TransportTimeout(_)
            | ReviewError::TransportTransient(_)
            | ReviewError::TransportAuth(_)
            | ReviewError::TransportUiFailure(_)
            | ReviewError::ProtocolViolation(_) => 4,
            ReviewError::BudgetExceeded(_)
            | ReviewError::CommandFailed(_)
            | ReviewError::CommandTimeout(_) => 5,
            ReviewError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Kinds the workflow can feed back to the model as a retry prompt.
    pub fn is_retryable_with_model(&self) -> bool {
        matches!(
            self,
            ReviewError::MalformedEnvelope(_)
                | ReviewError::SchemaViolation(_)
                | ReviewError::UnsafePath(_)
                | ReviewError::ForbiddenMode(_)
                | ReviewError::MissingContent(_)
                | ReviewError::Precondition(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(ReviewError::Config("x".into()).exit_code(), 2);
        assert_eq!(ReviewError::UnsafePath("../x".into()).exit_code(), 3);
        assert_eq!(ReviewError::TransportTimeout(30).exit_code(), 4);
        assert_eq!(ReviewError::BudgetExceeded("rounds".into()).exit_code(), 5);
        assert_eq!(ReviewError::Git("boom".into()).exit_code(), 1);
        assert_eq!(ReviewError::Cancelled.exit_code(), 130);
    }

    #[test]
    fn validator_kinds_are_model_retryable() {
        assert!(ReviewError::SchemaViolation("bad op".into()).is_retryable_with_model());
        assert!(ReviewError::Precondition("exists".into()).is_retryable_with_model());
        assert!(!ReviewError::Git("fatal".into()).is_retryable_with_model());
    }
}
