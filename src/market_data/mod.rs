pub mod candle_history;
pub mod feed;
pub mod price_cache;

pub use candle_history::{Candle, CandleHistory};
pub use price_cache::{OrderbookSnapshot, PriceCache};
