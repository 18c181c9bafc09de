pub mod errors;
pub mod instruments;
pub mod observer;
pub mod types;

pub use errors::{ConnectorError, Result};
pub use instruments::{Exchange, Instrument, InstrumentCatalog, InstrumentType, OptionFilter};
pub use observer::TickObserver;
pub use types::{Depth, DepthLevel, Mode, Ohlc, Segment, Tick, TradeSummary, MAX_DEPTH_LEVELS};
