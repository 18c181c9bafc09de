use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of price levels on each side of the market depth.
pub const MAX_DEPTH_LEVELS: usize = 5;

/// Which group of fields a tick carries, as implied by its payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Ltp,
    Quote,
    Full,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Ltp => "ltp",
            Mode::Quote => "quote",
            Mode::Full => "full",
        }
    }
}

/// Market segment, carried in the low byte of every instrument token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Segment {
    NseCm,
    NseFo,
    NseCd,
    BseCm,
    BseFo,
    BseCd,
    McxFo,
    McxSx,
    Indices,
    Unknown(u8),
}

impl Segment {
    pub fn from_token(token: u32) -> Self {
        Segment::from((token & 0xFF) as u8)
    }

    /// Raw integer prices on the wire are divided by this to get the decimal price.
    pub fn price_divisor(&self) -> f64 {
        match self {
            Segment::NseCd => 10_000_000.0,
            Segment::BseFo | Segment::BseCd => 10_000.0,
            Segment::NseCm
            | Segment::NseFo
            | Segment::BseCm
            | Segment::McxFo
            | Segment::McxSx
            | Segment::Indices
            | Segment::Unknown(_) => 100.0,
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, Segment::Indices)
    }
}

impl From<u8> for Segment {
    fn from(code: u8) -> Self {
        match code {
            1 => Segment::NseCm,
            2 => Segment::NseFo,
            3 => Segment::NseCd,
            4 => Segment::BseCm,
            5 => Segment::BseFo,
            6 => Segment::BseCd,
            7 => Segment::McxFo,
            8 => Segment::McxSx,
            9 => Segment::Indices,
            other => Segment::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: u32,
    pub orders: u16,
}

/// Best-first buy and sell levels; each side holds at most `MAX_DEPTH_LEVELS`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Depth {
    pub buy: Vec<DepthLevel>,
    pub sell: Vec<DepthLevel>,
}

impl Depth {
    pub fn is_empty(&self) -> bool {
        self.buy.is_empty() && self.sell.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Session trade statistics, present for tradable quote and full layouts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeSummary {
    pub last_traded_quantity: u32,
    pub average_trade_price: f64,
    pub volume_traded: u32,
    pub total_buy_quantity: u32,
    pub total_sell_quantity: u32,
}

/// One decoded market update.
///
/// Optional groups are `Some` only when the payload layout carried them, so a
/// consumer cannot mistake a missing field for a zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub mode: Mode,
    pub instrument_token: u32,
    pub segment: Segment,
    pub is_index: bool,
    pub is_tradable: bool,
    pub last_price: f64,
    pub close: Option<f64>,
    /// `last_price - close`, derived at decode time.
    pub net_change: Option<f64>,
    pub ohlc: Option<Ohlc>,
    pub trade: Option<TradeSummary>,
    pub oi: Option<u32>,
    pub oi_day_high: Option<u32>,
    pub oi_day_low: Option<u32>,
    pub last_trade_time: Option<DateTime<Utc>>,
    /// Exchange time for full layouts that carry it, receive time otherwise.
    pub timestamp: DateTime<Utc>,
    pub depth: Depth,
}

impl Tick {
    pub fn best_bid(&self) -> Option<&DepthLevel> {
        self.depth.buy.first()
    }

    pub fn best_ask(&self) -> Option<&DepthLevel> {
        self.depth.sell.first()
    }

    pub fn volume(&self) -> Option<u32> {
        self.trade.map(|t| t.volume_traded)
    }
}
