//! Option chains per underlying and expiry.
//!
//! Rows live in a `BTreeMap` keyed by strike in integer hundredths, so a
//! chain always reads back sorted and a row's strike never moves.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use connectors_common::{Instrument, InstrumentCatalog, InstrumentType, OptionFilter, Tick};
use log::{debug, trace};
use serde::Serialize;

use crate::greeks::{
    greeks, implied_volatility, intrinsic_and_time_value, time_to_expiry, OptionInputs,
    DEFAULT_RISK_FREE_RATE,
};
use crate::{Change, Projection};

pub use crate::greeks::OptionType;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ChainKey {
    pub underlying: String,
    pub expiry: NaiveDate,
}

impl ChainKey {
    pub fn new(underlying: impl Into<String>, expiry: NaiveDate) -> Self {
        ChainKey {
            underlying: underlying.into(),
            expiry,
        }
    }
}

fn strike_key(strike: f64) -> i64 {
    (strike * 100.0).round() as i64
}

/// Static description of one option contract.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionContract {
    pub instrument_token: u32,
    pub tradingsymbol: String,
    pub underlying: String,
    pub expiry: NaiveDate,
    pub strike: f64,
    pub option_type: OptionType,
}

impl OptionContract {
    /// `None` unless the catalog row is a CE or PE with an expiry.
    pub fn from_instrument(instrument: &Instrument, underlying: &str) -> Option<Self> {
        let option_type = match instrument.instrument_type {
            InstrumentType::Ce => OptionType::Call,
            InstrumentType::Pe => OptionType::Put,
            _ => return None,
        };
        Some(OptionContract {
            instrument_token: instrument.instrument_token,
            tradingsymbol: instrument.tradingsymbol.clone(),
            underlying: underlying.to_string(),
            expiry: instrument.expiry?,
            strike: instrument.strike,
            option_type,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionData {
    pub instrument_token: u32,
    pub tradingsymbol: String,
    pub option_type: OptionType,
    pub strike: f64,
    pub expiry: NaiveDate,
    pub underlying: String,

    pub last_price: f64,
    /// First traded price seen by this process.
    pub open_price: Option<f64>,
    pub bid_price: f64,
    pub ask_price: f64,
    pub bid_qty: u32,
    pub ask_qty: u32,
    pub volume: u32,
    pub oi: Option<u32>,
    /// OI before the last change; `None` until OI has changed once.
    pub previous_oi: Option<u32>,
    pub last_updated: Option<DateTime<Utc>>,

    pub iv: f64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub intrinsic_value: f64,
    pub time_value: f64,
    pub underlying_price: Option<f64>,
}

impl OptionData {
    fn new(contract: &OptionContract) -> Self {
        OptionData {
            instrument_token: contract.instrument_token,
            tradingsymbol: contract.tradingsymbol.clone(),
            option_type: contract.option_type,
            strike: contract.strike,
            expiry: contract.expiry,
            underlying: contract.underlying.clone(),
            last_price: 0.0,
            open_price: None,
            bid_price: 0.0,
            ask_price: 0.0,
            bid_qty: 0,
            ask_qty: 0,
            volume: 0,
            oi: None,
            previous_oi: None,
            last_updated: None,
            iv: 0.0,
            delta: 0.0,
            gamma: 0.0,
            theta: 0.0,
            vega: 0.0,
            intrinsic_value: 0.0,
            time_value: 0.0,
            underlying_price: None,
        }
    }

    pub fn change_in_oi(&self) -> Option<i64> {
        match (self.oi, self.previous_oi) {
            (Some(now), Some(before)) => Some(i64::from(now) - i64::from(before)),
            _ => None,
        }
    }

    /// Mid when both sides of the book are quoted, else the last price.
    pub fn premium(&self) -> f64 {
        if self.bid_price > 0.0 && self.ask_price > 0.0 {
            (self.bid_price + self.ask_price) / 2.0
        } else {
            self.last_price
        }
    }

    fn update(&mut self, tick: &Tick, rate: f64) {
        self.last_price = tick.last_price;
        if self.open_price.is_none() {
            self.open_price = Some(tick.last_price);
        }
        if let Some(bid) = tick.best_bid() {
            self.bid_price = bid.price;
            self.bid_qty = bid.quantity;
        }
        if let Some(ask) = tick.best_ask() {
            self.ask_price = ask.price;
            self.ask_qty = ask.quantity;
        }
        if let Some(volume) = tick.volume() {
            self.volume = volume;
        }
        if let Some(oi) = tick.oi {
            if self.oi != Some(oi) {
                self.previous_oi = self.oi;
                self.oi = Some(oi);
            }
        }
        self.last_updated = Some(tick.timestamp);
        self.refresh_greeks(tick.timestamp, rate);
        self.refresh_values();
    }

    fn refresh_greeks(&mut self, now: DateTime<Utc>, rate: f64) {
        let spot = match self.underlying_price {
            Some(spot) if spot > 0.0 => spot,
            _ => return,
        };
        let inputs = OptionInputs {
            kind: self.option_type,
            spot,
            strike: self.strike,
            years: time_to_expiry(self.expiry, now),
            rate,
        };
        if inputs.years <= 0.0 || self.premium() <= 0.0 {
            return;
        }
        self.iv = implied_volatility(&inputs, self.premium()).unwrap_or(0.0);
        let g = greeks(&inputs, self.iv);
        self.delta = g.delta;
        self.gamma = g.gamma;
        self.theta = g.theta;
        self.vega = g.vega;
    }

    fn refresh_values(&mut self) {
        if let Some(spot) = self.underlying_price {
            let (intrinsic, time) =
                intrinsic_and_time_value(self.option_type, spot, self.strike, self.premium());
            self.intrinsic_value = intrinsic;
            self.time_value = time;
        }
    }
}

/// One strike of a chain. The strike is fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionChainRow {
    strike: f64,
    pub call: Option<OptionData>,
    pub put: Option<OptionData>,
}

impl OptionChainRow {
    pub fn strike(&self) -> f64 {
        self.strike
    }

    fn side_mut(&mut self, kind: OptionType) -> &mut Option<OptionData> {
        match kind {
            OptionType::Call => &mut self.call,
            OptionType::Put => &mut self.put,
        }
    }

    fn sides_mut(&mut self) -> impl Iterator<Item = &mut OptionData> {
        self.call.iter_mut().chain(self.put.iter_mut())
    }
}

#[derive(Debug, Clone)]
struct ContractSlot {
    key: ChainKey,
    strike: i64,
    kind: OptionType,
}

#[derive(Debug, Default)]
struct Underlying {
    token: Option<u32>,
    price: Option<f64>,
}

#[derive(Debug)]
pub struct OptionChains {
    rows: BTreeMap<ChainKey, BTreeMap<i64, OptionChainRow>>,
    contracts: HashMap<u32, ContractSlot>,
    underlyings: BTreeMap<ChainKey, Underlying>,
    rate: f64,
}

impl Default for OptionChains {
    fn default() -> Self {
        Self::new(DEFAULT_RISK_FREE_RATE)
    }
}

impl OptionChains {
    pub fn new(rate: f64) -> Self {
        OptionChains {
            rows: BTreeMap::new(),
            contracts: HashMap::new(),
            underlyings: BTreeMap::new(),
            rate,
        }
    }

    /// Adds the contract's row if needed. Registering a known token again
    /// keeps its live data and returns false.
    pub fn register(&mut self, contract: &OptionContract) -> bool {
        if self.contracts.contains_key(&contract.instrument_token) {
            return false;
        }
        let key = ChainKey::new(contract.underlying.clone(), contract.expiry);
        let strike = strike_key(contract.strike);
        let underlying_price = self.underlyings.get(&key).and_then(|u| u.price);

        let row = self
            .rows
            .entry(key.clone())
            .or_default()
            .entry(strike)
            .or_insert_with(|| OptionChainRow {
                strike: contract.strike,
                call: None,
                put: None,
            });
        let side = row.side_mut(contract.option_type);
        if let Some(replaced) = side.as_ref() {
            self.contracts.remove(&replaced.instrument_token);
        }
        let mut data = OptionData::new(contract);
        data.underlying_price = underlying_price;
        *side = Some(data);

        self.contracts.insert(
            contract.instrument_token,
            ContractSlot {
                key,
                strike,
                kind: contract.option_type,
            },
        );
        true
    }

    /// Registers every CE/PE contract the catalog lists for `name` and
    /// `expiry`. Returns how many were new.
    pub fn register_from_catalog(
        &mut self,
        catalog: &InstrumentCatalog,
        underlying: &str,
        name: &str,
        expiry: NaiveDate,
    ) -> usize {
        self.register_matching(catalog, underlying, &OptionFilter::chain(name, expiry), expiry)
    }

    /// Registers the catalog options `filter` selects, filed under
    /// `underlying`. Returns how many were new.
    pub fn register_matching(
        &mut self,
        catalog: &InstrumentCatalog,
        underlying: &str,
        filter: &OptionFilter,
        today: NaiveDate,
    ) -> usize {
        let added = catalog
            .filter_options(filter, today)
            .into_iter()
            .filter_map(|instrument| OptionContract::from_instrument(instrument, underlying))
            .filter(|contract| self.register(contract))
            .count();
        debug!("registered {} contracts for {} ({:?})", added, underlying, filter);
        added
    }

    /// Links the instrument whose ticks drive the chain's underlying price.
    pub fn set_underlying_token(&mut self, underlying: &str, expiry: NaiveDate, token: u32) {
        self.underlyings
            .entry(ChainKey::new(underlying, expiry))
            .or_default()
            .token = Some(token);
    }

    pub fn underlying_price(&self, underlying: &str, expiry: NaiveDate) -> Option<f64> {
        self.underlyings
            .get(&ChainKey::new(underlying, expiry))
            .and_then(|u| u.price)
    }

    /// Rows sorted by strike; empty for an unknown chain.
    pub fn chain(&self, underlying: &str, expiry: NaiveDate) -> Vec<&OptionChainRow> {
        self.rows
            .get(&ChainKey::new(underlying, expiry))
            .map(|rows| rows.values().collect())
            .unwrap_or_default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ChainKey> {
        self.rows.keys()
    }

    pub fn option(&self, token: u32) -> Option<&OptionData> {
        let slot = self.contracts.get(&token)?;
        let row = self.rows.get(&slot.key)?.get(&slot.strike)?;
        match slot.kind {
            OptionType::Call => row.call.as_ref(),
            OptionType::Put => row.put.as_ref(),
        }
    }

    /// Drops one chain with its contracts and underlying link.
    pub fn reset_chain(&mut self, underlying: &str, expiry: NaiveDate) -> bool {
        let key = ChainKey::new(underlying, expiry);
        self.contracts.retain(|_, slot| slot.key != key);
        let had_link = self.underlyings.remove(&key).is_some();
        self.rows.remove(&key).is_some() || had_link
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.contracts.clear();
        self.underlyings.clear();
    }

    fn apply_option(&mut self, tick: &Tick) -> Option<Change> {
        let slot = self.contracts.get(&tick.instrument_token)?;
        let row = self.rows.get_mut(&slot.key)?.get_mut(&slot.strike)?;
        let data = row.side_mut(slot.kind).as_mut()?;
        data.update(tick, self.rate);
        Some(Change::OptionChain {
            underlying: slot.key.underlying.clone(),
            expiry: slot.key.expiry,
            strike: row.strike,
        })
    }

    fn apply_underlying(&mut self, tick: &Tick) -> Vec<Change> {
        let mut changes = Vec::new();
        for (key, underlying) in self.underlyings.iter_mut() {
            if underlying.token != Some(tick.instrument_token) {
                continue;
            }
            underlying.price = Some(tick.last_price);
            if let Some(rows) = self.rows.get_mut(key) {
                for data in rows.values_mut().flat_map(|row| row.sides_mut()) {
                    data.underlying_price = Some(tick.last_price);
                    data.refresh_values();
                }
            }
            changes.push(Change::Underlying {
                underlying: key.underlying.clone(),
                expiry: key.expiry,
            });
        }
        changes
    }
}

impl Projection for OptionChains {
    fn apply(&mut self, tick: &Tick) -> Vec<Change> {
        if let Some(change) = self.apply_option(tick) {
            return vec![change];
        }
        let changes = self.apply_underlying(tick);
        if changes.is_empty() {
            trace!("option chains ignoring token {}", tick.instrument_token);
        }
        changes
    }

    fn tokens(&self) -> Vec<u32> {
        let mut tokens: Vec<u32> = self
            .contracts
            .keys()
            .copied()
            .chain(self.underlyings.values().filter_map(|u| u.token))
            .collect();
        tokens.sort_unstable();
        tokens.dedup();
        tokens
    }
}
