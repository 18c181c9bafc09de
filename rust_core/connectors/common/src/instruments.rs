use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Exchange {
    Nse,
    Bse,
    Nfo,
    Bfo,
    Cds,
    Bcd,
    Mcx,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstrumentType {
    Eq,
    Fut,
    Ce,
    Pe,
    #[serde(other)]
    Other,
}

/// One row of the static instrument catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub instrument_token: u32,
    #[serde(default)]
    pub exchange_token: u32,
    pub tradingsymbol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_expiry")]
    pub expiry: Option<NaiveDate>,
    #[serde(default)]
    pub strike: f64,
    #[serde(default)]
    pub tick_size: f64,
    #[serde(default)]
    pub lot_size: u32,
    pub instrument_type: InstrumentType,
    #[serde(default)]
    pub segment: String,
    pub exchange: Exchange,
}

impl Instrument {
    pub fn is_option(&self) -> bool {
        matches!(self.instrument_type, InstrumentType::Ce | InstrumentType::Pe)
    }
}

/// Scan criteria for [`InstrumentCatalog::filter_options`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionFilter {
    pub name: Option<String>,
    pub expiry: Option<NaiveDate>,
    pub min_strike: Option<f64>,
    pub max_strike: Option<f64>,
    /// `Ce` or `Pe`; anything else matches no option.
    pub option_type: Option<InstrumentType>,
    pub min_days_to_expiry: Option<i64>,
    pub max_days_to_expiry: Option<i64>,
}

impl OptionFilter {
    /// Every contract of `name` expiring on `expiry`.
    pub fn chain(name: impl Into<String>, expiry: NaiveDate) -> Self {
        OptionFilter {
            name: Some(name.into()),
            expiry: Some(expiry),
            ..OptionFilter::default()
        }
    }

    pub fn matches(&self, instrument: &Instrument, today: NaiveDate) -> bool {
        let listed = matches!(instrument.exchange, Exchange::Nfo | Exchange::Bfo);
        if !instrument.is_option() || !listed {
            return false;
        }
        if self.name.as_deref().map_or(false, |name| instrument.name != name) {
            return false;
        }
        if self.expiry.is_some() && instrument.expiry != self.expiry {
            return false;
        }
        if self.min_strike.map_or(false, |min| instrument.strike < min)
            || self.max_strike.map_or(false, |max| instrument.strike > max)
        {
            return false;
        }
        if self.option_type.map_or(false, |kind| instrument.instrument_type != kind) {
            return false;
        }
        if self.min_days_to_expiry.is_none() && self.max_days_to_expiry.is_none() {
            return true;
        }
        // Day bounds need an expiry to measure against.
        let days = match instrument.expiry {
            Some(expiry) => (expiry - today).num_days(),
            None => return false,
        };
        self.min_days_to_expiry.map_or(true, |min| days >= min)
            && self.max_days_to_expiry.map_or(true, |max| days <= max)
    }
}

// Catalog dumps carry "", "2024-01-25" or a full RFC 3339 timestamp.
fn deserialize_expiry<'de, D>(deserializer: D) -> std::result::Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => {
            let day = s.get(..10).unwrap_or(s);
            NaiveDate::parse_from_str(day, "%Y-%m-%d")
                .map(Some)
                .map_err(serde::de::Error::custom)
        }
    }
}

/// Token-indexed view over the static catalog supplied by the REST side.
#[derive(Debug, Clone, Default)]
pub struct InstrumentCatalog {
    by_token: HashMap<u32, Instrument>,
}

impl InstrumentCatalog {
    pub fn new(instruments: Vec<Instrument>) -> Self {
        let by_token = instruments
            .into_iter()
            .map(|i| (i.instrument_token, i))
            .collect();
        InstrumentCatalog { by_token }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let rows: Vec<Instrument> = serde_json::from_str(json)?;
        log::info!("loaded {} catalog instruments", rows.len());
        Ok(Self::new(rows))
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    pub fn get(&self, token: u32) -> Option<&Instrument> {
        self.by_token.get(&token)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instrument> {
        self.by_token.values()
    }

    /// Cash-market listing of `symbol` on one exchange, matched case-insensitively.
    pub fn equity(&self, symbol: &str, exchange: Exchange) -> Option<&Instrument> {
        self.iter().find(|i| {
            i.exchange == exchange
                && i.instrument_type == InstrumentType::Eq
                && i.tradingsymbol.eq_ignore_ascii_case(symbol)
        })
    }

    /// Exchange-traded option contracts for `name` expiring on `expiry`, sorted by strike.
    pub fn option_contracts(&self, name: &str, expiry: NaiveDate) -> Vec<&Instrument> {
        self.filter_options(&OptionFilter::chain(name, expiry), expiry)
    }

    /// Exchange-traded options matching `filter`, sorted by expiry, strike
    /// and token. Days to expiry are counted from `today`.
    pub fn filter_options(&self, filter: &OptionFilter, today: NaiveDate) -> Vec<&Instrument> {
        let mut contracts: Vec<&Instrument> =
            self.iter().filter(|i| filter.matches(i, today)).collect();
        contracts.sort_by(|a, b| {
            a.expiry
                .cmp(&b.expiry)
                .then(a.strike.total_cmp(&b.strike))
                .then(a.instrument_token.cmp(&b.instrument_token))
        });
        contracts
    }

    pub fn option_expiries(&self, name: &str) -> Vec<NaiveDate> {
        self.iter()
            .filter(|i| i.is_option() && i.name == name)
            .filter_map(|i| i.expiry)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"[
        {"instrument_token": 408065, "tradingsymbol": "INFY", "name": "INFOSYS", "instrument_type": "EQ", "exchange": "NSE"},
        {"instrument_token": 128053508, "tradingsymbol": "INFY", "name": "INFOSYS", "instrument_type": "EQ", "exchange": "BSE", "expiry": ""},
        {"instrument_token": 9001, "tradingsymbol": "NIFTY24JAN22000CE", "name": "NIFTY", "instrument_type": "CE", "exchange": "NFO", "expiry": "2024-01-25", "strike": 22000.0},
        {"instrument_token": 9002, "tradingsymbol": "NIFTY24JAN21500PE", "name": "NIFTY", "instrument_type": "PE", "exchange": "NFO", "expiry": "2024-01-25T00:00:00Z", "strike": 21500.0},
        {"instrument_token": 9003, "tradingsymbol": "NIFTY24FEB22000CE", "name": "NIFTY", "instrument_type": "CE", "exchange": "NFO", "expiry": "2024-02-29", "strike": 22000.0},
        {"instrument_token": 9004, "tradingsymbol": "NIFTY24JANFUT", "name": "NIFTY", "instrument_type": "FUT", "exchange": "NFO", "expiry": "2024-01-25"},
        {"instrument_token": 7, "tradingsymbol": "GOLD", "instrument_type": "COMMODITY", "exchange": "NCO"}
    ]"#;

    fn jan() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 25).unwrap()
    }

    #[test]
    fn loads_rows_with_mixed_expiry_formats() {
        let catalog = InstrumentCatalog::from_json(CATALOG).unwrap();
        assert_eq!(catalog.len(), 7);
        assert_eq!(catalog.get(9002).unwrap().expiry, Some(jan()));
        assert_eq!(catalog.get(128053508).unwrap().expiry, None);
        let odd = catalog.get(7).unwrap();
        assert_eq!(odd.exchange, Exchange::Other);
        assert_eq!(odd.instrument_type, InstrumentType::Other);
    }

    #[test]
    fn finds_equity_listings_per_exchange() {
        let catalog = InstrumentCatalog::from_json(CATALOG).unwrap();
        assert_eq!(catalog.equity("infy", Exchange::Nse).unwrap().instrument_token, 408065);
        assert_eq!(catalog.equity("INFY", Exchange::Bse).unwrap().instrument_token, 128053508);
        assert!(catalog.equity("TCS", Exchange::Nse).is_none());
    }

    #[test]
    fn option_contracts_are_filtered_and_sorted() {
        let catalog = InstrumentCatalog::from_json(CATALOG).unwrap();
        let tokens: Vec<u32> = catalog
            .option_contracts("NIFTY", jan())
            .iter()
            .map(|i| i.instrument_token)
            .collect();
        assert_eq!(tokens, vec![9002, 9001]);
        assert_eq!(catalog.option_expiries("NIFTY").len(), 2);
    }

    #[test]
    fn filters_options_by_window_type_and_days() {
        let catalog = InstrumentCatalog::from_json(CATALOG).unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 1, 20).unwrap();
        let tokens = |filter: &OptionFilter| -> Vec<u32> {
            catalog
                .filter_options(filter, today)
                .iter()
                .map(|i| i.instrument_token)
                .collect()
        };

        let all_nifty = OptionFilter {
            name: Some("NIFTY".into()),
            ..OptionFilter::default()
        };
        assert_eq!(tokens(&all_nifty), vec![9002, 9001, 9003]);

        let window = OptionFilter {
            min_strike: Some(21800.0),
            max_strike: Some(22200.0),
            ..all_nifty.clone()
        };
        assert_eq!(tokens(&window), vec![9001, 9003]);

        let puts = OptionFilter {
            option_type: Some(InstrumentType::Pe),
            ..all_nifty.clone()
        };
        assert_eq!(tokens(&puts), vec![9002]);

        // Jan expiry is 5 days out, Feb is 40.
        let near = OptionFilter {
            max_days_to_expiry: Some(7),
            ..all_nifty.clone()
        };
        assert_eq!(tokens(&near), vec![9002, 9001]);
        let far = OptionFilter {
            min_days_to_expiry: Some(30),
            ..all_nifty
        };
        assert_eq!(tokens(&far), vec![9003]);

        assert!(tokens(&OptionFilter::chain("BANKNIFTY", jan())).is_empty());
    }

    #[test]
    fn rejects_malformed_catalog() {
        assert!(InstrumentCatalog::from_json("{\"not\": \"a list\"}").is_err());
    }
}
