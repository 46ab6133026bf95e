// =============================================================================
// Shared types used across the Meridian execution engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// How entries and exits are executed: against the real broker, against the
/// virtual wallet, or against the virtual wallet with notifications suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Paper,
    Live,
    Silent,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
            Self::Silent => write!(f, "silent"),
        }
    }
}

/// Trade direction. Upstream `BUY`/`BULLISH` map to `Bullish`, `SELL`/`BEARISH`
/// to `Bearish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Bullish,
    Bearish,
}

impl Direction {
    pub fn is_bullish(&self) -> bool {
        matches!(self, Self::Bullish)
    }

    /// +1.0 for bullish, -1.0 for bearish. Multiplying a price delta by this
    /// yields a signed favorable-move quantity.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Bullish => 1.0,
            Self::Bearish => -1.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "BULLISH"),
            Self::Bearish => write!(f, "BEARISH"),
        }
    }
}

/// Exchange an instrument trades on. Serialized using the broker's single
/// letter codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exchange {
    #[serde(rename = "N")]
    Nse,
    #[serde(rename = "B")]
    Bse,
    #[serde(rename = "M")]
    Mcx,
}

impl Exchange {
    /// Parse the broker's letter code, tolerating full names.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "N" | "NSE" => Some(Self::Nse),
            "B" | "BSE" => Some(Self::Bse),
            "M" | "MCX" => Some(Self::Mcx),
            _ => None,
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nse => write!(f, "N"),
            Self::Bse => write!(f, "B"),
            Self::Mcx => write!(f, "M"),
        }
    }
}

/// Exchange segment the instrument belongs to. `Derivative` and `Commodity`
/// instruments are quoted with wide spreads and always exit via limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Segment {
    #[serde(rename = "C")]
    Cash,
    #[serde(rename = "D")]
    Derivative,
    #[serde(rename = "U")]
    Commodity,
}

impl Segment {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "C" | "CASH" | "EQUITY" => Some(Self::Cash),
            "D" | "DERIVATIVE" | "OPTIONS" => Some(Self::Derivative),
            "U" | "COMMODITY" => Some(Self::Commodity),
            _ => None,
        }
    }

    /// True when the segment is quoted wide enough that market orders are
    /// unacceptable for exits.
    pub fn needs_limit_orders(&self) -> bool {
        matches!(self, Self::Derivative | Self::Commodity)
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cash => write!(f, "C"),
            Self::Derivative => write!(f, "D"),
            Self::Commodity => write!(f, "U"),
        }
    }
}

/// Severity attached to every emitted risk event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Round a price down to the given tick size. Ticks of zero or below pass the
/// price through unchanged.
pub fn round_to_tick(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return price;
    }
    (price / tick).floor() * tick
}
