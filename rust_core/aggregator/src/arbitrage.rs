//! NSE/BSE price gaps for dual-listed stocks.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use connectors_common::{Exchange, InstrumentCatalog, Tick};
use log::{debug, trace};
use serde::Serialize;

use crate::{Change, Projection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Venue {
    Nse,
    Bse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opportunity {
    /// NSE trades higher.
    BuyBseSellNse,
    /// BSE trades higher.
    BuyNseSellBse,
    NoArbitrage,
    BseNotAvailable,
    NseNotAvailable,
    NoData,
}

pub fn classify(nse: Option<f64>, bse: Option<f64>) -> Opportunity {
    match (nse, bse) {
        (Some(nse), Some(bse)) => {
            let diff = nse - bse;
            if diff > 0.0 {
                Opportunity::BuyBseSellNse
            } else if diff < 0.0 {
                Opportunity::BuyNseSellBse
            } else {
                Opportunity::NoArbitrage
            }
        }
        (Some(_), None) => Opportunity::BseNotAvailable,
        (None, Some(_)) => Opportunity::NseNotAvailable,
        (None, None) => Opportunity::NoData,
    }
}

/// One listing of a tracked stock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub instrument_token: u32,
    pub tradingsymbol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VenuePrice {
    pub instrument_token: u32,
    pub tradingsymbol: String,
    pub exchange: Venue,
    pub last_price: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub volume: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArbitragePair {
    pub symbol: String,
    pub name: String,
    pub nse: Option<VenuePrice>,
    pub bse: Option<VenuePrice>,
    pub price_diff: f64,
    pub price_diff_percent: f64,
    pub opportunity: Opportunity,
}

impl ArbitragePair {
    fn new(symbol: String, name: String) -> Self {
        ArbitragePair {
            symbol,
            name,
            nse: None,
            bse: None,
            price_diff: 0.0,
            price_diff_percent: 0.0,
            opportunity: Opportunity::NoData,
        }
    }

    fn recompute(&mut self) {
        let nse = self.nse.as_ref().map(|p| p.last_price);
        let bse = self.bse.as_ref().map(|p| p.last_price);
        if let (Some(nse), Some(bse)) = (nse, bse) {
            self.price_diff = nse - bse;
            let average = (nse + bse) / 2.0;
            self.price_diff_percent = if average > 0.0 {
                self.price_diff / average * 100.0
            } else {
                0.0
            };
        }
        self.opportunity = classify(nse, bse);
    }
}

#[derive(Debug, Clone)]
struct Leg {
    symbol: String,
    venue: Venue,
    tradingsymbol: String,
}

#[derive(Debug, Default)]
pub struct ArbitrageBook {
    pairs: BTreeMap<String, ArbitragePair>,
    legs: HashMap<u32, Leg>,
}

impl ArbitrageBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or restarts) tracking `symbol`. Prices already held for it
    /// are discarded.
    pub fn track(&mut self, symbol: &str, name: &str, nse: Option<Listing>, bse: Option<Listing>) {
        let symbol = symbol.to_uppercase();
        self.untrack(&symbol);
        for (venue, listing) in [(Venue::Nse, nse), (Venue::Bse, bse)] {
            if let Some(listing) = listing {
                self.legs.insert(
                    listing.instrument_token,
                    Leg {
                        symbol: symbol.clone(),
                        venue,
                        tradingsymbol: listing.tradingsymbol,
                    },
                );
            }
        }
        self.pairs
            .insert(symbol.clone(), ArbitragePair::new(symbol, name.to_string()));
    }

    /// Looks up the NSE and BSE equity listings. False when neither exists.
    pub fn track_from_catalog(&mut self, catalog: &InstrumentCatalog, symbol: &str) -> bool {
        let nse = catalog.equity(symbol, Exchange::Nse);
        let bse = catalog.equity(symbol, Exchange::Bse);
        let name = match nse.or(bse) {
            Some(instrument) if !instrument.name.is_empty() => instrument.name.clone(),
            Some(_) => symbol.to_uppercase(),
            None => {
                debug!("no NSE or BSE listing for {}", symbol);
                return false;
            }
        };
        let listing = |i: &connectors_common::Instrument| Listing {
            instrument_token: i.instrument_token,
            tradingsymbol: i.tradingsymbol.clone(),
        };
        self.track(symbol, &name, nse.map(listing), bse.map(listing));
        true
    }

    pub fn untrack(&mut self, symbol: &str) -> Option<ArbitragePair> {
        let symbol = symbol.to_uppercase();
        self.legs.retain(|_, leg| leg.symbol != symbol);
        self.pairs.remove(&symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<&ArbitragePair> {
        self.pairs.get(&symbol.to_uppercase())
    }

    /// Sorted by symbol.
    pub fn pairs(&self) -> impl Iterator<Item = &ArbitragePair> {
        self.pairs.values()
    }
}

impl Projection for ArbitrageBook {
    fn apply(&mut self, tick: &Tick) -> Vec<Change> {
        let leg = match self.legs.get(&tick.instrument_token) {
            Some(leg) => leg,
            None => {
                trace!("arbitrage book ignoring token {}", tick.instrument_token);
                return Vec::new();
            }
        };
        let pair = match self.pairs.get_mut(&leg.symbol) {
            Some(pair) => pair,
            None => return Vec::new(),
        };

        let price = VenuePrice {
            instrument_token: tick.instrument_token,
            tradingsymbol: leg.tradingsymbol.clone(),
            exchange: leg.venue,
            last_price: tick.last_price,
            bid_price: tick.best_bid().map_or(0.0, |level| level.price),
            ask_price: tick.best_ask().map_or(0.0, |level| level.price),
            volume: tick.volume().unwrap_or(0),
            timestamp: tick.timestamp,
        };
        match leg.venue {
            Venue::Nse => pair.nse = Some(price),
            Venue::Bse => pair.bse = Some(price),
        }
        pair.recompute();
        vec![Change::Arbitrage {
            symbol: pair.symbol.clone(),
        }]
    }

    fn tokens(&self) -> Vec<u32> {
        let mut tokens: Vec<u32> = self.legs.keys().copied().collect();
        tokens.sort_unstable();
        tokens
    }
}
