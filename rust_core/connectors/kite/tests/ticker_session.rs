use std::sync::{Arc, Mutex};
use std::time::Duration;

use connector_kite::{ConnectionStatus, FeedConfig, KiteTicker};
use connectors_common::Tick;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

fn ltp_frame(token: u32, raw_price: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&8u16.to_be_bytes());
    buf.extend_from_slice(&token.to_be_bytes());
    buf.extend_from_slice(&raw_price.to_be_bytes());
    buf
}

/// Packs raw payloads into one frame: a count, then length-prefixed payloads.
fn frame(payloads: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(payloads.len() as u16).to_be_bytes());
    for payload in payloads {
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(payload);
    }
    buf
}

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return text,
            Some(Ok(_)) => continue,
            other => panic!("expected a text frame, got {:?}", other),
        }
    }
}

fn record_statuses(ticker: &KiteTicker) -> Arc<Mutex<Vec<ConnectionStatus>>> {
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    ticker.on_status_change(move |status| sink.lock().unwrap().push(status));
    statuses
}

#[tokio::test]
async fn delivers_ticks_and_replays_subscriptions_after_drop() {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        seen_tx.send(next_text(&mut ws).await).unwrap();
        seen_tx.send(next_text(&mut ws).await).unwrap();
        ws.send(Message::Binary(ltp_frame(11, 12345))).await.unwrap();
        ws.send(Message::Text(r#"{"type":"error","data":"bad token"}"#.into()))
            .await
            .unwrap();
        ws.send(Message::Binary(ltp_frame(11, 12400))).await.unwrap();
        // Vanish without a close handshake.
        drop(ws);

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        seen_tx.send(next_text(&mut ws).await).unwrap();
        seen_tx.send(next_text(&mut ws).await).unwrap();
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Close(_)) => return true,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        false
    });

    let mut config = FeedConfig::new(format!("ws://{}", addr));
    config.reconnect_base_ms = 10;
    let ticker = KiteTicker::new(config);
    let statuses = record_statuses(&ticker);
    let (tick_tx, mut tick_rx) = mpsc::unbounded_channel::<Tick>();
    ticker.on_tick(move |tick: &Tick| {
        let _ = tick_tx.send(tick.clone());
    });

    ticker.subscribe(&[11]);
    ticker.connect();

    let subscribe = r#"{"a":"subscribe","v":[11]}"#;
    let mode = r#"{"a":"mode","v":["full",[11]]}"#;
    assert_eq!(timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap(), subscribe);
    assert_eq!(timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap(), mode);

    let first = timeout(WAIT, tick_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.instrument_token, 11);
    assert!((first.last_price - 123.45).abs() < 1e-9);
    let second = timeout(WAIT, tick_rx.recv()).await.unwrap().unwrap();
    assert!((second.last_price - 124.0).abs() < 1e-9);

    // Reconnected without any new subscribe call.
    assert_eq!(timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap(), subscribe);
    assert_eq!(timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap(), mode);

    ticker.disconnect();
    assert_eq!(ticker.status(), ConnectionStatus::Disconnected);
    assert!(timeout(WAIT, server).await.unwrap().unwrap());

    sleep(Duration::from_millis(50)).await;
    assert!(tick_rx.try_recv().is_err());
    let statuses = statuses.lock().unwrap().clone();
    assert_eq!(statuses.first(), Some(&ConnectionStatus::Connecting));
    assert_eq!(statuses.last(), Some(&ConnectionStatus::Disconnected));
    assert!(
        statuses
            .iter()
            .filter(|s| **s == ConnectionStatus::Connected)
            .count()
            >= 1
    );
    assert_eq!(ticker.subscriptions(), vec![11]);
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let _ = env_logger::builder().is_test(true).try_init();
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let mut config = FeedConfig::new(format!("ws://{}", addr));
    config.reconnect_base_ms = 5;
    config.max_reconnect_attempts = 2;
    let ticker = KiteTicker::new(config);
    let statuses = record_statuses(&ticker);
    ticker.connect();

    let settled = timeout(WAIT, async {
        loop {
            if statuses.lock().unwrap().len() >= 6 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(settled.is_ok(), "statuses: {:?}", statuses.lock().unwrap());

    use ConnectionStatus::*;
    assert_eq!(
        *statuses.lock().unwrap(),
        vec![Connecting, Error, Connecting, Error, Connecting, Disconnected]
    );
    assert_eq!(ticker.status(), Disconnected);

    // Nothing else is scheduled once the cap is hit.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(statuses.lock().unwrap().len(), 6);
}

#[tokio::test]
async fn connect_after_disconnect_is_a_noop() {
    let ticker = KiteTicker::new(FeedConfig::new("ws://127.0.0.1:9"));
    let statuses = record_statuses(&ticker);
    ticker.disconnect();
    ticker.connect();
    sleep(Duration::from_millis(20)).await;
    assert_eq!(ticker.status(), ConnectionStatus::Disconnected);
    assert_eq!(*statuses.lock().unwrap(), vec![ConnectionStatus::Disconnected]);
}

#[tokio::test]
async fn bad_payload_skips_only_itself() {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let ltp = |token: u32, raw: u32| {
            let mut payload = token.to_be_bytes().to_vec();
            payload.extend_from_slice(&raw.to_be_bytes());
            payload
        };
        let mixed = frame(&[ltp(21, 10_000), vec![0u8; 9], ltp(22, 20_050)]);
        ws.send(Message::Binary(mixed)).await.unwrap();
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    });

    let ticker = KiteTicker::new(FeedConfig::new(format!("ws://{}", addr)));
    let statuses = record_statuses(&ticker);
    let (tick_tx, mut tick_rx) = mpsc::unbounded_channel::<Tick>();
    ticker.on_tick(move |tick: &Tick| {
        let _ = tick_tx.send(tick.clone());
    });
    ticker.connect();

    let first = timeout(WAIT, tick_rx.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, tick_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.instrument_token, 21);
    assert!((first.last_price - 100.0).abs() < 1e-9);
    assert_eq!(second.instrument_token, 22);
    assert!((second.last_price - 200.5).abs() < 1e-9);

    sleep(Duration::from_millis(50)).await;
    assert!(tick_rx.try_recv().is_err());
    assert_eq!(ticker.status(), ConnectionStatus::Connected);
    assert_eq!(
        *statuses.lock().unwrap(),
        vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
    );

    ticker.disconnect();
    timeout(WAIT, server).await.unwrap().unwrap();
}
