use std::env;
use std::fs;

use aggregator::{Aggregator, Change, OptionData};
use chrono::{NaiveDate, Utc};
use connector_kite::{FeedConfig, KiteTicker};
use connectors_common::{InstrumentCatalog, OptionFilter};
use log::{info, warn};
use tokio::sync::broadcast::error::RecvError;

fn print_usage() {
    eprintln!(
        "Usage: feed_monitor watch [--tokens 1,2,3] [--catalog instruments.json] \
         [--pair SYMBOL]... [--chain NAME:YYYY-MM-DD[:UNDERLYING_TOKEN]]... \
         [--strikes MIN-MAX]"
    );
}

#[derive(Debug, PartialEq)]
struct ChainArg {
    name: String,
    expiry: NaiveDate,
    underlying_token: Option<u32>,
}

#[derive(Debug, Default, PartialEq)]
struct WatchArgs {
    tokens: Vec<u32>,
    catalog: Option<String>,
    pairs: Vec<String>,
    chains: Vec<ChainArg>,
    /// Strike window applied to every `--chain`.
    strikes: Option<(f64, f64)>,
}

fn parse_tokens(raw: &str) -> Result<Vec<u32>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| t.parse().map_err(|_| format!("bad token {:?}", t)))
        .collect()
}

fn parse_chain(raw: &str) -> Result<ChainArg, String> {
    let mut parts = raw.split(':');
    let name = parts.next().unwrap_or_default().trim();
    if name.is_empty() {
        return Err(format!("bad chain {:?}", raw));
    }
    let expiry = parts
        .next()
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .ok_or_else(|| format!("chain {:?} needs an expiry as YYYY-MM-DD", raw))?;
    let underlying_token = match parts.next() {
        Some(t) => Some(t.parse().map_err(|_| format!("bad underlying token {:?}", t))?),
        None => None,
    };
    Ok(ChainArg {
        name: name.to_uppercase(),
        expiry,
        underlying_token,
    })
}

fn parse_strikes(raw: &str) -> Result<(f64, f64), String> {
    let bad = || format!("bad strike window {:?}, expected MIN-MAX", raw);
    let (min, max) = raw.split_once('-').ok_or_else(bad)?;
    let min: f64 = min.trim().parse().map_err(|_| bad())?;
    let max: f64 = max.trim().parse().map_err(|_| bad())?;
    if min > max {
        return Err(bad());
    }
    Ok((min, max))
}

fn parse_args(args: &[String]) -> Result<WatchArgs, String> {
    let mut watch = WatchArgs::default();
    let mut i = 0;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--tokens", Some(v)) => watch.tokens.extend(parse_tokens(v)?),
            ("--catalog", Some(v)) => watch.catalog = Some(v.clone()),
            ("--pair", Some(v)) => watch.pairs.push(v.to_uppercase()),
            ("--chain", Some(v)) => watch.chains.push(parse_chain(v)?),
            ("--strikes", Some(v)) => watch.strikes = Some(parse_strikes(v)?),
            (flag @ ("--tokens" | "--catalog" | "--pair" | "--chain" | "--strikes"), None) => {
                return Err(format!("{} needs a value", flag))
            }
            (other, _) => return Err(format!("unknown argument {:?}", other)),
        }
        i += 2;
    }
    if watch.catalog.is_none() && (!watch.pairs.is_empty() || !watch.chains.is_empty()) {
        return Err("--pair and --chain need --catalog".to_string());
    }
    Ok(watch)
}

fn seed(aggregator: &Aggregator, watch: &WatchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = match &watch.catalog {
        Some(path) => InstrumentCatalog::from_json(&fs::read_to_string(path)?)?,
        None => InstrumentCatalog::default(),
    };

    aggregator.instruments.update(|book| {
        for token in &watch.tokens {
            match catalog.get(*token) {
                Some(instrument) => book.track_instrument(instrument),
                None => book.track(*token),
            };
        }
    });
    aggregator.arbitrage.update(|book| {
        for symbol in &watch.pairs {
            if !book.track_from_catalog(&catalog, symbol) {
                warn!("{} has no NSE or BSE listing in the catalog", symbol);
            }
        }
    });
    let today = Utc::now().date_naive();
    aggregator.chains.update(|chains| {
        for chain in &watch.chains {
            let filter = OptionFilter {
                min_strike: watch.strikes.map(|(min, _)| min),
                max_strike: watch.strikes.map(|(_, max)| max),
                ..OptionFilter::chain(chain.name.as_str(), chain.expiry)
            };
            let added = chains.register_matching(&catalog, &chain.name, &filter, today);
            if added == 0 {
                warn!("no {} options expiring {} in the catalog", chain.name, chain.expiry);
            }
            if let Some(token) = chain.underlying_token {
                chains.set_underlying_token(&chain.name, chain.expiry, token);
            }
        }
    });
    Ok(())
}

fn log_change(aggregator: &Aggregator, change: &Change) {
    match change {
        Change::Instrument { token } => aggregator.instruments.read(|book| {
            if let Some(s) = book.get(*token) {
                info!(
                    "{} ltp={:.2} change={:?} volume={:?} oi={:?}",
                    s.tradingsymbol.as_deref().unwrap_or("?"),
                    s.last_price,
                    s.change,
                    s.volume,
                    s.oi
                );
            }
        }),
        Change::OptionChain {
            underlying,
            expiry,
            strike,
        } => aggregator.chains.read(|chains| {
            let row = chains
                .chain(underlying, *expiry)
                .into_iter()
                .find(|row| row.strike() == *strike);
            if let Some(row) = row {
                let ltp = |side: &Option<OptionData>| side.as_ref().map(|o| o.last_price);
                info!(
                    "{} {} {:.2}: CE={:?} PE={:?}",
                    underlying,
                    expiry,
                    strike,
                    ltp(&row.call),
                    ltp(&row.put)
                );
            }
        }),
        Change::Underlying { underlying, expiry } => {
            let price = aggregator.chains.read(|c| c.underlying_price(underlying, *expiry));
            info!("{} {} underlying={:?}", underlying, expiry, price);
        }
        Change::Arbitrage { symbol } => aggregator.arbitrage.read(|book| {
            if let Some(pair) = book.get(symbol) {
                info!(
                    "{} diff={:.2} ({:.3}%) {:?}",
                    pair.symbol, pair.price_diff, pair.price_diff_percent, pair.opportunity
                );
            }
        }),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args[1] != "watch" {
        print_usage();
        return Ok(());
    }
    let watch = match parse_args(&args[2..]) {
        Ok(watch) => watch,
        Err(e) => {
            eprintln!("{}", e);
            print_usage();
            return Ok(());
        }
    };

    let config = FeedConfig::from_env()?;
    let aggregator = Aggregator::new(1024);
    seed(&aggregator, &watch)?;

    let mut tokens = aggregator.tokens_to_subscribe();
    tokens.extend(&watch.tokens);
    tokens.sort_unstable();
    tokens.dedup();
    if tokens.is_empty() {
        eprintln!("Nothing to watch");
        print_usage();
        return Ok(());
    }

    let ticker = KiteTicker::new(config);
    for observer in aggregator.observers() {
        ticker.add_tick_observer(observer);
    }
    ticker.on_status_change(|status| info!("feed status: {:?}", status));
    ticker.subscribe(&tokens);
    info!("watching {} tokens", tokens.len());
    ticker.connect();

    let mut changes = aggregator.subscribe();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            change = changes.recv() => match change {
                Ok(change) => log_change(&aggregator, &change),
                Err(RecvError::Lagged(skipped)) => warn!("skipped {} change events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    ticker.disconnect();
    info!("stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_all_flags() {
        let watch = parse_args(&args(&[
            "--tokens", "256265, 408065",
            "--catalog", "instruments.json",
            "--pair", "infy",
            "--pair", "TCS",
            "--chain", "nifty:2024-03-28:256265",
            "--strikes", "21500-22500",
        ]))
        .unwrap();
        assert_eq!(watch.tokens, vec![256265, 408065]);
        assert_eq!(watch.catalog.as_deref(), Some("instruments.json"));
        assert_eq!(watch.pairs, vec!["INFY", "TCS"]);
        assert_eq!(
            watch.chains,
            vec![ChainArg {
                name: "NIFTY".into(),
                expiry: NaiveDate::from_ymd_opt(2024, 3, 28).unwrap(),
                underlying_token: Some(256265),
            }]
        );
        assert_eq!(watch.strikes, Some((21500.0, 22500.0)));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&args(&["--tokens"])).is_err());
        assert!(parse_args(&args(&["--tokens", "1,x"])).is_err());
        assert!(parse_args(&args(&["--pair", "INFY"])).is_err());
        assert!(parse_args(&args(&["--verbose", "1"])).is_err());
        assert!(parse_chain("NIFTY").is_err());
        assert!(parse_chain("NIFTY:28-03-2024").is_err());
        assert!(parse_chain("NIFTY:2024-03-28:abc").is_err());
        assert!(parse_strikes("22500-21500").is_err());
        assert!(parse_strikes("22000").is_err());
        assert!(parse_args(&args(&["--strikes"])).is_err());
    }

    #[test]
    fn chain_without_underlying_token() {
        let chain = parse_chain("BANKNIFTY:2024-03-27").unwrap();
        assert_eq!(chain.underlying_token, None);
    }
}
