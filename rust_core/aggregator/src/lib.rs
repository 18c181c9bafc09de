//! Live read models built from the tick stream.
//!
//! Each projection is plain data plus an `apply` step; [`LiveView`] adds the
//! locking and change notification so it can sit behind a ticker as an
//! observer.

pub mod arbitrage;
pub mod greeks;
pub mod option_chain;
pub mod snapshot;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::NaiveDate;
use connectors_common::{Tick, TickObserver};
use log::info;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

pub use arbitrage::{
    classify, ArbitrageBook, ArbitragePair, Listing, Opportunity, Venue, VenuePrice,
};
pub use option_chain::{
    ChainKey, OptionChainRow, OptionChains, OptionContract, OptionData, OptionType,
};
pub use snapshot::{InstrumentBook, InstrumentSnapshot};

/// What a tick touched.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    Instrument { token: u32 },
    OptionChain { underlying: String, expiry: NaiveDate, strike: f64 },
    Underlying { underlying: String, expiry: NaiveDate },
    Arbitrage { symbol: String },
}

pub trait Projection: Send + 'static {
    /// Folds one tick in. Unknown tokens yield no changes. Applying the same
    /// tick twice leaves the same state as applying it once.
    fn apply(&mut self, tick: &Tick) -> Vec<Change>;

    /// Tokens this projection needs a subscription for.
    fn tokens(&self) -> Vec<u32>;
}

pub struct LiveView<P> {
    state: Mutex<P>,
    tx: broadcast::Sender<Change>,
}

impl<P: Projection> LiveView<P> {
    pub fn new(projection: P, tx: broadcast::Sender<Change>) -> Self {
        LiveView {
            state: Mutex::new(projection),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, P> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        f(&*self.lock())
    }

    /// Registration and other edits. No change events are sent for these.
    pub fn update<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut *self.lock())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.tx.subscribe()
    }
}

impl<P: Projection> TickObserver for LiveView<P> {
    fn on_tick(&self, tick: &Tick) {
        let changes = self.lock().apply(tick);
        for change in changes {
            // No receivers is fine.
            let _ = self.tx.send(change);
        }
    }
}

/// The three projections over one change channel.
pub struct Aggregator {
    tx: broadcast::Sender<Change>,
    pub instruments: Arc<LiveView<InstrumentBook>>,
    pub chains: Arc<LiveView<OptionChains>>,
    pub arbitrage: Arc<LiveView<ArbitrageBook>>,
}

impl Aggregator {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Aggregator {
            instruments: Arc::new(LiveView::new(InstrumentBook::new(), tx.clone())),
            chains: Arc::new(LiveView::new(OptionChains::default(), tx.clone())),
            arbitrage: Arc::new(LiveView::new(ArbitrageBook::new(), tx.clone())),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.tx.subscribe()
    }

    /// One observer per projection, to register with a ticker.
    pub fn observers(&self) -> Vec<Arc<dyn TickObserver>> {
        vec![
            self.instruments.clone() as Arc<dyn TickObserver>,
            self.chains.clone() as Arc<dyn TickObserver>,
            self.arbitrage.clone() as Arc<dyn TickObserver>,
        ]
    }

    pub fn apply(&self, tick: &Tick) {
        for observer in self.observers() {
            observer.on_tick(tick);
        }
    }

    /// Sorted union of every projection's tokens.
    pub fn tokens_to_subscribe(&self) -> Vec<u32> {
        let mut tokens = self.instruments.read(|p| p.tokens());
        tokens.extend(self.chains.read(|p| p.tokens()));
        tokens.extend(self.arbitrage.read(|p| p.tokens()));
        tokens.sort_unstable();
        tokens.dedup();
        tokens
    }

    /// Feeds ticks sent on the returned channel into every projection.
    pub fn create_input_channel(self: &Arc<Self>, buffer: usize) -> mpsc::Sender<Tick> {
        let (tx, mut rx) = mpsc::channel::<Tick>(buffer.max(1));
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(tick) = rx.recv().await {
                aggregator.apply(&tick);
            }
            info!("aggregator input channel closed");
        });
        tx
    }
}
