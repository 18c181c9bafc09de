use std::collections::HashMap;

use chrono::{DateTime, Utc};
use connectors_common::{Exchange, Instrument, Tick};
use log::trace;
use serde::Serialize;

use crate::{Change, Projection};

/// Latest state of one watched instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstrumentSnapshot {
    pub instrument_token: u32,
    pub tradingsymbol: Option<String>,
    pub exchange: Option<Exchange>,
    pub last_price: f64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
    pub volume: Option<u32>,
    pub average_price: Option<f64>,
    pub total_buy_quantity: Option<u32>,
    pub total_sell_quantity: Option<u32>,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub oi: Option<u32>,
    /// The OI value before the most recent change.
    pub previous_oi: Option<u32>,
    pub oi_day_high: Option<u32>,
    pub oi_day_low: Option<u32>,
    pub last_trade_time: Option<DateTime<Utc>>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl InstrumentSnapshot {
    fn new(instrument_token: u32) -> Self {
        InstrumentSnapshot {
            instrument_token,
            ..Default::default()
        }
    }

    pub fn change_in_oi(&self) -> Option<i64> {
        match (self.oi, self.previous_oi) {
            (Some(now), Some(before)) => Some(i64::from(now) - i64::from(before)),
            _ => None,
        }
    }

    fn update(&mut self, tick: &Tick) {
        self.last_price = tick.last_price;
        if let Some(ohlc) = tick.ohlc {
            self.open = Some(ohlc.open);
            self.high = Some(ohlc.high);
            self.low = Some(ohlc.low);
            self.close = Some(ohlc.close);
        }
        if let Some(close) = tick.close {
            self.close = Some(close);
        }
        if let Some(change) = tick.net_change {
            self.change = Some(change);
            self.change_percent = self
                .close
                .filter(|close| *close > 0.0)
                .map(|close| change / close * 100.0);
        }
        if let Some(trade) = tick.trade {
            self.volume = Some(trade.volume_traded);
            self.average_price = Some(trade.average_trade_price);
            self.total_buy_quantity = Some(trade.total_buy_quantity);
            self.total_sell_quantity = Some(trade.total_sell_quantity);
        }
        if let Some(oi) = tick.oi {
            if self.oi != Some(oi) {
                self.previous_oi = self.oi;
                self.oi = Some(oi);
            }
        }
        if tick.oi_day_high.is_some() {
            self.oi_day_high = tick.oi_day_high;
            self.oi_day_low = tick.oi_day_low;
        }
        if !tick.depth.is_empty() {
            self.bid_price = tick.best_bid().map(|level| level.price);
            self.ask_price = tick.best_ask().map(|level| level.price);
        }
        if tick.last_trade_time.is_some() {
            self.last_trade_time = tick.last_trade_time;
        }
        self.timestamp = Some(tick.timestamp);
    }
}

/// Snapshot per tracked token. Ticks for untracked tokens are ignored.
#[derive(Debug, Default)]
pub struct InstrumentBook {
    snapshots: HashMap<u32, InstrumentSnapshot>,
}

impl InstrumentBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the token was already tracked.
    pub fn track(&mut self, token: u32) -> bool {
        if self.snapshots.contains_key(&token) {
            return false;
        }
        self.snapshots.insert(token, InstrumentSnapshot::new(token));
        true
    }

    pub fn track_instrument(&mut self, instrument: &Instrument) -> bool {
        let fresh = self.track(instrument.instrument_token);
        if let Some(snapshot) = self.snapshots.get_mut(&instrument.instrument_token) {
            snapshot.tradingsymbol = Some(instrument.tradingsymbol.clone());
            snapshot.exchange = Some(instrument.exchange);
        }
        fresh
    }

    pub fn untrack(&mut self, token: u32) -> Option<InstrumentSnapshot> {
        self.snapshots.remove(&token)
    }

    pub fn get(&self, token: u32) -> Option<&InstrumentSnapshot> {
        self.snapshots.get(&token)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstrumentSnapshot> {
        self.snapshots.values()
    }
}

impl Projection for InstrumentBook {
    fn apply(&mut self, tick: &Tick) -> Vec<Change> {
        match self.snapshots.get_mut(&tick.instrument_token) {
            Some(snapshot) => {
                snapshot.update(tick);
                vec![Change::Instrument {
                    token: tick.instrument_token,
                }]
            }
            None => {
                trace!("instrument book ignoring token {}", tick.instrument_token);
                Vec::new()
            }
        }
    }

    fn tokens(&self) -> Vec<u32> {
        let mut tokens: Vec<u32> = self.snapshots.keys().copied().collect();
        tokens.sort_unstable();
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{full_tick, ltp_tick};

    #[test]
    fn untracked_tokens_are_ignored() {
        let mut book = InstrumentBook::new();
        assert!(book.apply(&ltp_tick(7, 10.0)).is_empty());
        assert!(book.is_empty());
    }

    #[test]
    fn full_tick_populates_everything() {
        let mut book = InstrumentBook::new();
        book.track(408065);
        let changes = book.apply(&full_tick(408065, 1510.0, 1500.0, 2000));
        assert_eq!(changes, vec![Change::Instrument { token: 408065 }]);

        let snap = book.get(408065).unwrap();
        assert_eq!(snap.last_price, 1510.0);
        assert_eq!(snap.close, Some(1500.0));
        assert_eq!(snap.change, Some(10.0));
        assert!((snap.change_percent.unwrap() - 0.6666666).abs() < 1e-6);
        assert_eq!(snap.bid_price, Some(1509.0));
        assert_eq!(snap.ask_price, Some(1511.0));
        assert_eq!(snap.oi, Some(2000));
        assert_eq!(snap.previous_oi, None);
    }

    #[test]
    fn ltp_tick_keeps_richer_fields() {
        let mut book = InstrumentBook::new();
        book.track(1);
        book.apply(&full_tick(1, 100.0, 98.0, 50));
        book.apply(&ltp_tick(1, 101.0));
        let snap = book.get(1).unwrap();
        assert_eq!(snap.last_price, 101.0);
        assert_eq!(snap.close, Some(98.0));
        assert_eq!(snap.volume, Some(1000));
    }

    #[test]
    fn previous_oi_tracks_changes_and_redelivery_is_idempotent() {
        let mut book = InstrumentBook::new();
        book.track(1);
        book.apply(&full_tick(1, 100.0, 98.0, 50));
        let second = full_tick(1, 100.5, 98.0, 80);
        book.apply(&second);
        let once = book.get(1).cloned();
        book.apply(&second);
        assert_eq!(book.get(1).cloned(), once);

        let snap = book.get(1).unwrap();
        assert_eq!(snap.previous_oi, Some(50));
        assert_eq!(snap.change_in_oi(), Some(30));
    }

    #[test]
    fn tracking_twice_keeps_live_data() {
        let mut book = InstrumentBook::new();
        assert!(book.track(1));
        book.apply(&ltp_tick(1, 5.0));
        assert!(!book.track(1));
        assert_eq!(book.get(1).unwrap().last_price, 5.0);
        assert_eq!(book.tokens(), vec![1]);
        assert!(book.untrack(1).is_some());
        assert!(book.apply(&ltp_tick(1, 6.0)).is_empty());
    }
}
