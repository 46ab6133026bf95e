// =============================================================================
// Message Bus — partitioned topics with manual offset commit
// =============================================================================
//
// Upstream delivery is at-least-once: a record stays re-deliverable until the
// consumer commits its offset, and consumers must therefore be idempotent.
// Within a partition, records are always observed in offset order.
//
// The trait pair is the seam; `memory::InMemoryBus` is the in-process
// implementation the engine and tests run on, with the WebSocket bridge in
// `market_data::feed` acting as the external edge.
// =============================================================================

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Topic names (stable wire contract)
// ---------------------------------------------------------------------------

pub const TOPIC_SIGNALS: &str = "trading-signals-v2";
pub const TOPIC_SIGNALS_LEGACY: &str = "strategy-signals";
pub const TOPIC_MARKET_DATA: &str = "market-data";
pub const TOPIC_CANDLES_1M: &str = "candles-1m";
pub const TOPIC_TRADE_ENTRIES: &str = "trade-entries";
pub const TOPIC_TRADE_RESULTS: &str = "trade-results";
pub const TOPIC_PROFIT_LOSS: &str = "profit-loss";
pub const TOPIC_RISK_EVENTS: &str = "risk-events";

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A single record as observed by a consumer.
#[derive(Debug, Clone)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("topic not found: {0}")]
    UnknownTopic(String),

    #[error("partition {partition} out of range for topic {topic}")]
    UnknownPartition { topic: String, partition: u32 },

    #[error("bus closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TopicPublisher: Send + Sync {
    /// Append a record. The key selects the partition so that all records for
    /// one key stay ordered.
    async fn publish(&self, topic: &str, key: Option<&str>, payload: Value)
        -> Result<(), BusError>;
}

#[async_trait]
pub trait TopicConsumer: Send {
    /// Next uncommitted record in offset order, waiting until one is
    /// available.
    async fn next(&mut self) -> Result<Record, BusError>;

    /// Commit through `record`'s offset. Uncommitted records are redelivered
    /// to the next consumer of this partition.
    async fn commit(&mut self, record: &Record) -> Result<(), BusError>;
}
