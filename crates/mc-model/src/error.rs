use serde::{Deserialize, Serialize};

/// Errors raised while constructing or validating domain types — distinct
/// from `ErrorTag`, which classifies failures of a running execution.
#[derive(Debug, thiserror::Error)]
pub enum MongoClawModelError {
    #[error("invalid agent definition: {0}")]
    InvalidAgent(String),
    #[error("expression error: {0}")]
    Expr(#[from] mc_expr::ExprError),
}

/// Error taxonomy (§7): the fixed set of tags a worker can attach to a
/// failed execution, each carrying a fixed disposition rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorTag {
    ConfigurationError,
    FilterError,
    ModelTimeout,
    ModelRateLimited,
    Model5xx,
    Model4xx,
    ParseError,
    WriteConflict,
    TransientWriteError,
    AgentGone,
    Quarantined,
}

/// How the worker pool must handle a tagged failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Drop the item, no retry, no DLQ.
    Skip,
    /// Retry with standard backoff up to the attempt ceiling, then DLQ.
    RetryThenDlq,
    /// Retry with an elongated backoff schedule (e.g. rate limiting).
    RetryElongated,
    /// Send straight to the dead-letter queue, bypassing retry.
    DlqDirect,
    /// Treat as a successful no-op (already applied, idempotency hit).
    CompletedNoop,
    /// Nack without counting an attempt (queue/infra hiccup, not the agent's fault).
    NackNoAttempt,
}

impl ErrorTag {
    pub fn disposition(self) -> Disposition {
        match self {
            ErrorTag::ConfigurationError => Disposition::Skip,
            ErrorTag::FilterError => Disposition::Skip,
            ErrorTag::ModelTimeout => Disposition::RetryThenDlq,
            ErrorTag::ModelRateLimited => Disposition::RetryElongated,
            ErrorTag::Model5xx => Disposition::RetryThenDlq,
            ErrorTag::Model4xx => Disposition::DlqDirect,
            ErrorTag::ParseError => Disposition::RetryThenDlq,
            ErrorTag::WriteConflict => Disposition::CompletedNoop,
            ErrorTag::TransientWriteError => Disposition::RetryThenDlq,
            ErrorTag::AgentGone => Disposition::Skip,
            ErrorTag::Quarantined => Disposition::NackNoAttempt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_gets_elongated_retry() {
        assert_eq!(ErrorTag::ModelRateLimited.disposition(), Disposition::RetryElongated);
    }

    #[test]
    fn write_conflict_is_noop_completion() {
        assert_eq!(ErrorTag::WriteConflict.disposition(), Disposition::CompletedNoop);
    }

    #[test]
    fn quarantined_nacks_without_attempt() {
        assert_eq!(ErrorTag::Quarantined.disposition(), Disposition::NackNoAttempt);
    }
}
