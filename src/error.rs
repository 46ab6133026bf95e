// =============================================================================
// Error taxonomy — every failure path carries a stable machine-readable code
// =============================================================================
//
// Three families:
//   - drops:     the signal leaves the system cleanly (validation, risk)
//   - deferrals: the pending signal stays in the watchlist and retries
//   - surfaced:  the position is marked FAILED and operators are alerted
//
// The `code()` string is what lands in logs and risk events; alerting keys
// off it, so codes are append-only.
// =============================================================================

use thiserror::Error;

/// Engine-level error. Each variant maps 1:1 onto a taxonomy code.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("signal failed to parse: {0}")]
    IngestParse(String),

    #[error("duplicate signal within idempotency window: {0}")]
    IngestDuplicate(String),

    #[error("signal older than the max age: {0}")]
    IngestStale(String),

    #[error("outside trading hours: {0}")]
    IngestOutOfHours(String),

    #[error("signal rejected by risk validation: {0}")]
    IngestRiskReject(String),

    #[error("move to target below minimum: {0}")]
    ValidationMinMove(String),

    #[error("stop distance above maximum: {0}")]
    ValidationStopTooFar(String),

    #[error("risk/reward below minimum: {0}")]
    ValidationMinRr(String),

    #[error("stop/entry/target ordering inconsistent with direction: {0}")]
    ValidationDirection(String),

    #[error("blocked by portfolio gate: {0}")]
    RiskBlocked(String),

    #[error("circuit breaker tripped: {0}")]
    RiskCircuitBreaker(String),

    #[error("pivot levels unavailable: {0}")]
    PivotUnavailable(String),

    #[error("market data stale: {0}")]
    MarketDataStale(String),

    #[error("position size computed as zero: {0}")]
    SizerZero(String),

    #[error("broker rejected the order: {0}")]
    BrokerReject(String),

    #[error("broker call timed out: {0}")]
    BrokerTimeout(String),

    #[error("order verification failed: {0}")]
    VerifyFail(String),

    #[error("engine shutting down")]
    Shutdown,
}

impl EngineError {
    /// Stable code for logs, risk events, and the admin error shape.
    pub fn code(&self) -> &'static str {
        match self {
            Self::IngestParse(_) => "INGEST_PARSE",
            Self::IngestDuplicate(_) => "INGEST_DUPLICATE",
            Self::IngestStale(_) => "INGEST_STALE",
            Self::IngestOutOfHours(_) => "INGEST_OUT_OF_HOURS",
            Self::IngestRiskReject(_) => "INGEST_RISK_REJECT",
            Self::ValidationMinMove(_) => "VALIDATION_MIN_MOVE",
            Self::ValidationStopTooFar(_) => "VALIDATION_STOP_TOO_FAR",
            Self::ValidationMinRr(_) => "VALIDATION_MIN_RR",
            Self::ValidationDirection(_) => "VALIDATION_DIRECTION",
            Self::RiskBlocked(_) => "RISK_BLOCKED",
            Self::RiskCircuitBreaker(_) => "RISK_CIRCUIT_BREAKER",
            Self::PivotUnavailable(_) => "PIVOT_UNAVAILABLE",
            Self::MarketDataStale(_) => "MARKET_DATA_STALE",
            Self::SizerZero(_) => "SIZER_ZERO",
            Self::BrokerReject(_) => "BROKER_REJECT",
            Self::BrokerTimeout(_) => "BROKER_TIMEOUT",
            Self::VerifyFail(_) => "VERIFY_FAIL",
            Self::Shutdown => "SHUTDOWN",
        }
    }

    /// Deferrals keep the pending signal in the watchlist; everything else
    /// either drops it or surfaces a failure.
    pub fn is_deferral(&self) -> bool {
        matches!(self, Self::PivotUnavailable(_) | Self::MarketDataStale(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            EngineError::ValidationStopTooFar("2.53%".into()).code(),
            "VALIDATION_STOP_TOO_FAR"
        );
        assert_eq!(EngineError::Shutdown.code(), "SHUTDOWN");
        assert_eq!(
            EngineError::BrokerTimeout("placement".into()).code(),
            "BROKER_TIMEOUT"
        );
    }

    #[test]
    fn deferral_classification() {
        assert!(EngineError::PivotUnavailable("503".into()).is_deferral());
        assert!(EngineError::MarketDataStale("quote 12s old".into()).is_deferral());
        assert!(!EngineError::RiskBlocked("exposure".into()).is_deferral());
    }
}
