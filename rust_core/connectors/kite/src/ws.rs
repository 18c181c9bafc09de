//! Async connection manager for the Kite ticker socket.
//!
//! One task per connection attempt owns the socket. Outbound requests go
//! through an unbounded queue held in the shared state, so recording a
//! subscription and queueing its wire message happen under one lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use connectors_common::{ConnectorError, Tick, TickObserver};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tungstenite::Message;

use crate::config::FeedConfig;
use crate::decode::decode_tick;
use crate::frame::split_packets;
use crate::protocol::{self, Request};
use crate::session::{ConnectionStatus, Reconnect, Session};

type StatusObserver = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

#[derive(Default)]
struct Observers {
    ticks: Vec<Arc<dyn TickObserver>>,
    status: Vec<StatusObserver>,
}

struct State {
    session: Session,
    /// Bumped on every connection attempt and on disconnect; tasks holding
    /// an older value are stale and must not touch anything.
    generation: u64,
    outbound: Option<UnboundedSender<Message>>,
    connection: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

impl State {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && !self.session.is_halted()
    }

    fn send(&self, requests: Vec<Request>) {
        if let Some(tx) = &self.outbound {
            for request in requests {
                let _ = tx.send(Message::Text(request.to_json()));
            }
        }
    }
}

struct Inner {
    config: FeedConfig,
    // Lock order: observers before state.
    observers: Mutex<Observers>,
    state: Mutex<State>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Streaming market-data client.
///
/// Observers run on the socket task in registration order. They must not
/// register observers or call `disconnect` from inside a callback.
pub struct KiteTicker {
    inner: Arc<Inner>,
}

impl KiteTicker {
    pub fn new(config: FeedConfig) -> Self {
        let session = Session::new(config.reconnect_policy());
        KiteTicker {
            inner: Arc::new(Inner {
                config,
                observers: Mutex::new(Observers::default()),
                state: Mutex::new(State {
                    session,
                    generation: 0,
                    outbound: None,
                    connection: None,
                    retry: None,
                }),
            }),
        }
    }

    pub fn on_tick<O: TickObserver + 'static>(&self, observer: O) {
        self.add_tick_observer(Arc::new(observer));
    }

    pub fn add_tick_observer(&self, observer: Arc<dyn TickObserver>) {
        lock(&self.inner.observers).ticks.push(observer);
    }

    pub fn on_status_change<F>(&self, observer: F)
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        lock(&self.inner.observers).status.push(Arc::new(observer));
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.inner.state).session.status()
    }

    pub fn subscriptions(&self) -> Vec<u32> {
        lock(&self.inner.state).session.subscriptions()
    }

    /// Opens the socket unless it is already open or connecting, or the
    /// ticker was disconnected. A pending retry is superseded.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        Inner::start(&self.inner);
    }

    pub fn subscribe(&self, tokens: &[u32]) {
        let mut state = lock(&self.inner.state);
        let requests = state.session.subscribe(tokens);
        state.send(requests);
    }

    pub fn unsubscribe(&self, tokens: &[u32]) {
        let mut state = lock(&self.inner.state);
        let requests = state.session.unsubscribe(tokens);
        state.send(requests);
    }

    /// Stops the feed for good. No tick or status callback from the old
    /// connection runs after this returns.
    pub fn disconnect(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.session.is_halted() {
                return;
            }
            state.session.disconnect();
            state.generation += 1;
            if let Some(retry) = state.retry.take() {
                retry.abort();
            }
            let connection = state.connection.take();
            match state.outbound.take() {
                Some(tx) => {
                    let _ = tx.send(Message::Close(None));
                }
                None => {
                    if let Some(connection) = connection {
                        connection.abort();
                    }
                }
            }
        }
        info!("feed disconnected by request");
        // Taking the observer lock waits out any dispatch still in flight.
        let observers = lock(&self.inner.observers);
        for observer in &observers.status {
            observer(ConnectionStatus::Disconnected);
        }
    }
}

impl Drop for KiteTicker {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Inner {
    fn start(self: &Arc<Self>) {
        let generation = {
            let mut state = lock(&self.state);
            if !state.session.begin_connect() {
                debug!("connect ignored in state {:?}", state.session.status());
                return;
            }
            if let Some(retry) = state.retry.take() {
                retry.abort();
            }
            state.generation += 1;
            state.generation
        };
        self.notify_status(generation, ConnectionStatus::Connecting);

        let mut state = lock(&self.state);
        if state.is_current(generation) {
            let inner = Arc::clone(self);
            state.connection = Some(tokio::spawn(async move { inner.run(generation).await }));
        }
    }

    async fn run(self: Arc<Self>, generation: u64) {
        info!("connecting to {}", self.config.redacted_url());
        let connected = timeout(
            self.config.connect_timeout(),
            connect_async(self.config.url.as_str()),
        )
        .await;
        let ws = match connected {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => {
                warn!("connection failed before opening: {}", e);
                self.closed(generation, true, false);
                return;
            }
            Err(_) => {
                warn!(
                    "connection did not open within {:?}",
                    self.config.connect_timeout()
                );
                self.closed(generation, true, false);
                return;
            }
        };

        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut state = lock(&self.state);
            if !state.is_current(generation) {
                return;
            }
            let replay = state.session.on_open();
            state.outbound = Some(tx);
            info!("feed connected, replaying {} tokens", state.session.subscriptions().len());
            state.send(replay);
        }
        self.notify_status(generation, ConnectionStatus::Connected);

        let read_timeout = self.config.read_timeout();
        let outcome: Result<(), ConnectorError> = loop {
            tokio::select! {
                outgoing = rx.recv() => match outgoing {
                    Some(msg) => {
                        let closing = matches!(msg, Message::Close(_));
                        if let Err(e) = write.send(msg).await {
                            break Err(ConnectorError::Network(e.to_string()));
                        }
                        if closing {
                            break Ok(());
                        }
                    }
                    None => break Ok(()),
                },
                incoming = timeout(read_timeout, read.next()) => match incoming {
                    Err(_) => {
                        break Err(ConnectorError::Network(format!(
                            "no data for {:?}",
                            read_timeout
                        )))
                    }
                    Ok(None) => break Ok(()),
                    Ok(Some(Ok(Message::Binary(data)))) => self.dispatch(generation, &data),
                    Ok(Some(Ok(Message::Text(text)))) => protocol::handle_text(&text),
                    Ok(Some(Ok(Message::Ping(payload)))) => {
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            break Err(ConnectorError::Network(e.to_string()));
                        }
                    }
                    Ok(Some(Ok(Message::Close(frame)))) => {
                        info!("server closed the feed: {:?}", frame);
                        break Ok(());
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => break Err(ConnectorError::Network(e.to_string())),
                },
            }
        };

        match outcome {
            Ok(()) => self.closed(generation, false, true),
            Err(e) => {
                warn!("feed connection lost: {}", e);
                self.closed(generation, true, true);
            }
        }
    }

    fn dispatch(&self, generation: u64, message: &[u8]) {
        let received_at = Utc::now();
        let ticks: Vec<Tick> = split_packets(message)
            .into_iter()
            .filter_map(|packet| match decode_tick(packet, received_at) {
                Ok(tick) => Some(tick),
                Err(e) => {
                    debug!("skipping packet: {}", e);
                    None
                }
            })
            .collect();
        if ticks.is_empty() {
            return;
        }

        let observers = lock(&self.observers);
        if !lock(&self.state).is_current(generation) {
            return;
        }
        for tick in &ticks {
            for observer in &observers.ticks {
                observer.on_tick(tick);
            }
        }
    }

    fn notify_status(&self, generation: u64, status: ConnectionStatus) {
        let observers = lock(&self.observers);
        if !lock(&self.state).is_current(generation) {
            return;
        }
        for observer in &observers.status {
            observer(status);
        }
    }

    fn closed(self: &Arc<Self>, generation: u64, failed: bool, was_open: bool) {
        let (step, status) = {
            let mut state = lock(&self.state);
            if !state.is_current(generation) {
                return;
            }
            state.outbound = None;
            state.connection = None;
            let step = state.session.on_closed(failed);
            (step, state.session.status())
        };

        match step {
            Reconnect::Retry { attempt, delay } => {
                if was_open {
                    warn!("feed closed, reconnecting in {:?} (attempt {})", delay, attempt);
                } else {
                    warn!(
                        "feed never opened, retrying in {:?} (attempt {}); \
                         check the endpoint and credentials",
                        delay, attempt
                    );
                }
            }
            Reconnect::GiveUp { attempts } => {
                error!("giving up on the feed after {} reconnect attempts", attempts);
            }
            Reconnect::Halted => return,
        }
        self.notify_status(generation, status);

        if let Reconnect::Retry { delay, .. } = step {
            let mut state = lock(&self.state);
            if state.is_current(generation) {
                let inner = Arc::clone(self);
                state.retry = Some(tokio::spawn(async move {
                    sleep(delay).await;
                    inner.retry(generation);
                }));
            }
        }
    }

    fn retry(self: &Arc<Self>, generation: u64) {
        {
            let mut state = lock(&self.state);
            if !state.is_current(generation) {
                return;
            }
            // Our own handle; dropping it detaches rather than aborts.
            state.retry = None;
        }
        self.start();
    }
}
