pub mod bar;
pub mod buffer;
pub mod ingestor;

pub use bar::{Bar, Timeframe};
pub use buffer::{BarBuffer, PushOutcome, SeriesKey};
pub use ingestor::{FeedHealth, FeedIngestor, FeedStatus, IngestorSettings, MarketFeed};
