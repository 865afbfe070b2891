// ===============================
// src/feed.rs
// ===============================
//
// Market and account event adapters:
// - run_mock            : random-walk ticks per symbol
// - run_bybit           : Bybit v5 public `tickers.{symbol}` WS, one connection for all symbols
// - run_account_stream  : keeps the port's private stream alive, brackets drops with
//                         StreamDown / StreamUp so engines know to resync
//
// Everything is normalised into domain::{Tick, OrderUpdate} here; nothing downstream
// sees Bybit field names.
//
use std::time::Duration;

use ahash::AHashMap as HashMap;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::{
    sync::{mpsc, watch},
    time::{interval, sleep, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bybit::{num, subscribe_message, BybitOrder, TickerData, WsMessage};
use crate::domain::{now_ms, AccountEvent, ClientOrderId, ExchangeStatus, MarketEvent, OrderUpdate, Side, Tick};
use crate::metrics::{STREAM_CONNECTED, STREAM_RECONNECTS, TICKS};
use crate::port::SharedPort;

const PING_EVERY: Duration = Duration::from_secs(20);

/// Reconnect delay: 0.5s * 2^min(attempt, 6) plus up to 250ms jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.min(6);
    let base_ms = 500u64.saturating_mul(1u64 << shift);
    let jitter = rand::thread_rng().gen_range(0..=250);
    Duration::from_millis(base_ms + jitter)
}

/// Random walk around `start_px`, one tick per `every`.
pub async fn run_mock(
    tx: mpsc::Sender<MarketEvent>,
    symbol: String,
    start_px: f64,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut px = start_px;
    let mut tick = interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    if tx.send(MarketEvent::FeedUp).await.is_err() {
        return;
    }
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                // keep ThreadRng out of the .await
                let shock: f64 = rand::thread_rng().gen_range(-1.0..1.0);
                px = (px * (1.0 + shock * 0.0015) + (start_px - px) * 0.01).max(start_px * 0.1);
                let spread = px * 0.0001;
                let t = Tick { symbol: symbol.clone(), ts_ms: now_ms(), bid: px - spread, ask: px + spread, mark_price: px };
                TICKS.with_label_values(&[symbol.as_str()]).inc();
                if tx.send(MarketEvent::Tick(t)).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!(%symbol, "mock feed stopped");
}

/// Last known ticker fields per symbol; Bybit deltas only carry changes.
#[derive(Default)]
pub struct TickerBook {
    last: HashMap<String, TickerData>,
}

impl TickerBook {
    pub fn clear(&mut self) { self.last.clear(); }
}

/// Merge a `tickers.*` message into `book` and build a Tick once bid/ask or
/// mark are known.
pub fn normalize_ticker(book: &mut TickerBook, msg: &WsMessage) -> Option<Tick> {
    let topic = msg.topic.as_deref()?;
    if !topic.starts_with("tickers.") {
        return None;
    }
    let data: TickerData = serde_json::from_value(msg.data.clone()?).ok()?;
    let entry = book.last.entry(data.symbol.clone()).or_insert_with(|| TickerData {
        symbol: data.symbol.clone(),
        ..TickerData::default()
    });
    if msg.kind.as_deref() == Some("snapshot") {
        *entry = data.clone();
    } else {
        if data.bid1_price.is_some() { entry.bid1_price = data.bid1_price.clone(); }
        if data.ask1_price.is_some() { entry.ask1_price = data.ask1_price.clone(); }
        if data.mark_price.is_some() { entry.mark_price = data.mark_price.clone(); }
        if data.last_price.is_some() { entry.last_price = data.last_price.clone(); }
    }

    let field = |v: &Option<String>| v.as_deref().and_then(num).unwrap_or(0.0);
    let bid = field(&entry.bid1_price);
    let ask = field(&entry.ask1_price);
    let mut mark = field(&entry.mark_price);
    if mark <= 0.0 {
        mark = field(&entry.last_price);
    }
    if (bid <= 0.0 || ask <= 0.0) && mark <= 0.0 {
        return None;
    }
    Some(Tick { symbol: entry.symbol.clone(), ts_ms: msg.ts.unwrap_or_else(now_ms), bid, ask, mark_price: mark })
}

pub async fn run_bybit(
    ws_url: String,
    routes: HashMap<String, mpsc::Sender<MarketEvent>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = match Url::parse(&ws_url) {
        Ok(u) => u,
        Err(e) => {
            error!(?e, %ws_url, "bad ws url");
            return;
        }
    };
    let topics: Vec<String> = routes.keys().map(|s| format!("tickers.{s}")).collect();
    let mut book = TickerBook::default();
    let mut attempt: u32 = 0;

    loop {
        info!(%ws_url, ?topics, "connecting bybit tickers");
        match connect_async(url.clone()).await {
            Ok((ws, _resp)) => {
                let (mut write, mut read) = ws.split();
                if let Err(e) = write.send(Message::Text(subscribe_message(&topics).to_string())).await {
                    error!(?e, "subscribe failed");
                } else {
                    attempt = 0;
                    STREAM_CONNECTED.with_label_values(&["market"]).set(1);
                    for tx in routes.values() {
                        let _ = tx.send(MarketEvent::FeedUp).await;
                    }
                    let mut ping = interval(PING_EVERY);
                    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => {
                                let _ = write.close().await;
                                return;
                            }
                            _ = ping.tick() => {
                                if let Err(e) = write.send(Message::Text(r#"{"op":"ping"}"#.to_string())).await {
                                    warn!(?e, "ping failed");
                                    break;
                                }
                            }
                            frame = read.next() => {
                                match frame {
                                    Some(Ok(Message::Text(txt))) => {
                                        let Ok(msg) = serde_json::from_str::<WsMessage>(&txt) else {
                                            debug!(%txt, "unparsed frame");
                                            continue;
                                        };
                                        if msg.op.as_deref() == Some("subscribe") && msg.success == Some(false) {
                                            error!(ret_msg = ?msg.ret_msg, "subscription refused");
                                        }
                                        if let Some(tick) = normalize_ticker(&mut book, &msg) {
                                            if let Some(tx) = routes.get(&tick.symbol) {
                                                TICKS.with_label_values(&[tick.symbol.as_str()]).inc();
                                                let _ = tx.send(MarketEvent::Tick(tick)).await;
                                            }
                                        }
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        error!(?e, "ws read error");
                                        break;
                                    }
                                    None => break,
                                }
                            }
                        }
                    }
                }
                STREAM_CONNECTED.with_label_values(&["market"]).set(0);
                for tx in routes.values() {
                    let _ = tx.send(MarketEvent::FeedDown).await;
                }
                book.clear();
                info!("tickers disconnected, will reconnect");
            }
            Err(e) => error!(?e, "connect failed"),
        }

        attempt = attempt.saturating_add(1);
        STREAM_RECONNECTS.with_label_values(&["market"]).inc();
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(backoff_delay(attempt)) => {}
        }
    }
}

/// Normalise a Bybit order object. `None` for foreign categories or junk.
pub fn normalize_order(o: &BybitOrder) -> Option<OrderUpdate> {
    let side = match o.side.as_str() {
        "Buy" => Side::Buy,
        "Sell" => Side::Sell,
        _ => return None,
    };
    let status = match o.order_status.as_str() {
        "Created" | "New" | "Untriggered" | "Triggered" => ExchangeStatus::New,
        "PartiallyFilled" => ExchangeStatus::PartiallyFilled,
        "Filled" => ExchangeStatus::Filled,
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => ExchangeStatus::Cancelled,
        "Rejected" => ExchangeStatus::Rejected,
        other => {
            warn!(status = other, "unknown order status");
            return None;
        }
    };
    let seq = o.updated_time.parse::<u64>().unwrap_or(0);
    let cum = num(&o.cum_exec_qty).unwrap_or(0.0);
    let reason = match o.reject_reason.as_str() {
        "" | "EC_NoError" => None,
        r => Some(r.to_string()),
    };
    Some(OrderUpdate {
        symbol: o.symbol.clone(),
        client_order_id: (!o.order_link_id.is_empty()).then(|| ClientOrderId::new(o.order_link_id.clone())),
        exchange_order_id: (!o.order_id.is_empty()).then(|| o.order_id.clone()),
        event_id: format!("{}:{}:{}:{}", o.order_id, o.updated_time, o.order_status, o.cum_exec_qty),
        seq,
        side,
        status,
        qty: num(&o.qty).unwrap_or(0.0),
        price: num(&o.price).filter(|p| *p > 0.0),
        cum_filled: cum,
        avg_price: num(&o.avg_price).unwrap_or(0.0),
        reduce_only: o.reduce_only,
        reason,
    })
}

/// Keep the account stream of `port` running; reconnect with backoff and
/// bracket every outage with StreamDown.
pub async fn run_account_stream(port: SharedPort, tx: mpsc::Sender<AccountEvent>, mut shutdown: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;
    loop {
        let started = tokio::time::Instant::now();
        STREAM_CONNECTED.with_label_values(&["account"]).set(1);
        let res = tokio::select! {
            _ = shutdown.changed() => return,
            r = port.stream_account_events(tx.clone()) => r,
        };
        STREAM_CONNECTED.with_label_values(&["account"]).set(0);
        match res {
            Ok(()) => warn!(venue = port.name(), "account stream ended"),
            Err(e) => error!(venue = port.name(), err = %e, "account stream failed"),
        }
        if tx.send(AccountEvent::StreamDown).await.is_err() {
            return;
        }
        // a connection that held for a while resets the backoff
        if started.elapsed() > Duration::from_secs(60) {
            attempt = 0;
        }
        attempt = attempt.saturating_add(1);
        STREAM_RECONNECTS.with_label_values(&["account"]).inc();
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = sleep(backoff_delay(attempt)) => {}
        }
    }
}
