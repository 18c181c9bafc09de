//! Decodes one tick payload into a [`Tick`].
//!
//! The layout is chosen from the payload length alone; every integer is
//! big-endian and every price is divided by the segment divisor.

use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, TimeZone, Utc};
use connectors_common::{
    ConnectorError, Depth, DepthLevel, Mode, Ohlc, Result, Segment, Tick, TradeSummary,
    MAX_DEPTH_LEVELS,
};

/// Shortest payload that carries a token and a last price.
pub const MIN_PACKET_LEN: usize = 8;

const DEPTH_LEVEL_LEN: usize = 12;

/// Payload layouts, keyed by their byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// 8 bytes: token, last price.
    Ltp,
    /// 12 bytes: adds close.
    LtpClose,
    /// 16 bytes: adds open interest.
    LtpCloseOi,
    /// 28 bytes: index last price and OHLC.
    IndexQuote,
    /// 32 bytes: index quote plus exchange timestamp.
    IndexFull,
    /// 44 bytes: tradable quote with trade statistics and OHLC.
    Quote,
    /// 164 bytes: quote followed directly by market depth.
    QuoteDepth,
    /// 184 bytes: quote, OI and timestamps block, market depth.
    Full,
}

impl Layout {
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            8 => Some(Layout::Ltp),
            12 => Some(Layout::LtpClose),
            16 => Some(Layout::LtpCloseOi),
            28 => Some(Layout::IndexQuote),
            32 => Some(Layout::IndexFull),
            44 => Some(Layout::Quote),
            164 => Some(Layout::QuoteDepth),
            184 => Some(Layout::Full),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Layout::Ltp => 8,
            Layout::LtpClose => 12,
            Layout::LtpCloseOi => 16,
            Layout::IndexQuote => 28,
            Layout::IndexFull => 32,
            Layout::Quote => 44,
            Layout::QuoteDepth => 164,
            Layout::Full => 184,
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            Layout::Ltp | Layout::LtpClose | Layout::LtpCloseOi => Mode::Ltp,
            Layout::IndexQuote | Layout::Quote => Mode::Quote,
            Layout::IndexFull | Layout::QuoteDepth | Layout::Full => Mode::Full,
        }
    }
}

struct Reader<'a> {
    packet: &'a [u8],
    divisor: f64,
}

impl<'a> Reader<'a> {
    fn u32(&self, offset: usize) -> u32 {
        BigEndian::read_u32(&self.packet[offset..offset + 4])
    }

    fn u16(&self, offset: usize) -> u16 {
        BigEndian::read_u16(&self.packet[offset..offset + 2])
    }

    fn price(&self, offset: usize) -> f64 {
        self.u32(offset) as f64 / self.divisor
    }

    fn time(&self, offset: usize) -> Option<DateTime<Utc>> {
        match self.u32(offset) {
            0 => None,
            secs => Utc.timestamp_opt(secs as i64, 0).single(),
        }
    }

    fn ohlc(&self, open: usize, high: usize, low: usize, close: usize) -> Ohlc {
        Ohlc {
            open: self.price(open),
            high: self.price(high),
            low: self.price(low),
            close: self.price(close),
        }
    }

    fn depth(&self, start: usize) -> Depth {
        let level = |index: usize| {
            let at = start + index * DEPTH_LEVEL_LEN;
            DepthLevel {
                quantity: self.u32(at),
                price: self.price(at + 4),
                orders: self.u16(at + 8),
            }
        };
        Depth {
            buy: (0..MAX_DEPTH_LEVELS).map(level).collect(),
            sell: (MAX_DEPTH_LEVELS..2 * MAX_DEPTH_LEVELS).map(level).collect(),
        }
    }
}

/// Decodes one payload. `received_at` stands in for the exchange timestamp
/// when the layout does not carry one.
pub fn decode_tick(packet: &[u8], received_at: DateTime<Utc>) -> Result<Tick> {
    if packet.len() < MIN_PACKET_LEN {
        return Err(ConnectorError::MalformedPacket { len: packet.len() });
    }
    let layout = match Layout::from_len(packet.len()) {
        Some(layout) => layout,
        None => return Err(ConnectorError::MalformedPacket { len: packet.len() }),
    };

    let token = BigEndian::read_u32(&packet[0..4]);
    let segment = Segment::from_token(token);
    let r = Reader {
        packet,
        divisor: segment.price_divisor(),
    };

    let mut tick = Tick {
        mode: layout.mode(),
        instrument_token: token,
        segment,
        is_index: segment.is_index(),
        is_tradable: !segment.is_index(),
        last_price: r.price(4),
        close: None,
        net_change: None,
        ohlc: None,
        trade: None,
        oi: None,
        oi_day_high: None,
        oi_day_low: None,
        last_trade_time: None,
        timestamp: received_at,
        depth: Depth::default(),
    };

    match layout {
        Layout::Ltp => {}
        Layout::LtpClose | Layout::LtpCloseOi => {
            tick.close = Some(r.price(8));
            if layout == Layout::LtpCloseOi {
                tick.oi = Some(r.u32(12));
            }
        }
        Layout::IndexQuote | Layout::IndexFull => {
            let ohlc = r.ohlc(16, 8, 12, 20);
            tick.close = Some(ohlc.close);
            tick.ohlc = Some(ohlc);
            if layout == Layout::IndexFull {
                tick.timestamp = r.time(28).unwrap_or(received_at);
            }
        }
        Layout::Quote | Layout::QuoteDepth | Layout::Full => {
            tick.trade = Some(TradeSummary {
                last_traded_quantity: r.u32(8),
                average_trade_price: r.price(12),
                volume_traded: r.u32(16),
                total_buy_quantity: r.u32(20),
                total_sell_quantity: r.u32(24),
            });
            let ohlc = r.ohlc(28, 32, 36, 40);
            tick.close = Some(ohlc.close);
            tick.ohlc = Some(ohlc);

            match layout {
                Layout::QuoteDepth => tick.depth = r.depth(44),
                Layout::Full => {
                    tick.last_trade_time = r.time(44);
                    tick.oi = Some(r.u32(48));
                    tick.oi_day_high = Some(r.u32(52));
                    tick.oi_day_low = Some(r.u32(56));
                    tick.timestamp = r.time(60).unwrap_or(received_at);
                    tick.depth = r.depth(64);
                }
                _ => {}
            }
        }
    }

    tick.net_change = tick.close.map(|close| tick.last_price - close);
    Ok(tick)
}
