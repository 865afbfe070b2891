// ===============================
// src/notifier.rs
// ===============================
use std::fmt;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::domain::{ClientOrderId, Side};

#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Started { symbols: Vec<String>, venue: String },
    OrderFilled { symbol: String, cl_id: ClientOrderId, side: Side, size: f64, avg_price: f64 },
    OrderRejected { symbol: String, cl_id: ClientOrderId, reason: String },
    OrderExpired { symbol: String, cl_id: ClientOrderId },
    RiskRejected { symbol: String, reason: String },
    CooldownEngaged { symbol: String, daily_pnl: f64, until_ms: i64 },
    CooldownElapsed { symbol: String },
    RetryExhausted { symbol: String, op: &'static str, cl_id: Option<ClientOrderId>, error: String },
    Halted { symbol: String, reason: String },
    Resumed { symbol: String },
    ShutdownSummary { symbol: String, net_size: f64, realized_pnl: f64, cancelled: usize, failed: usize },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Started { symbols, venue } => write!(f, "started on {venue}: {}", symbols.join(", ")),
            Notice::OrderFilled { symbol, cl_id, side, size, avg_price } => {
                write!(f, "{symbol} {} {size} filled @ {avg_price:.4} ({cl_id})", side.as_str())
            }
            Notice::OrderRejected { symbol, cl_id, reason } => write!(f, "{symbol} order {cl_id} rejected: {reason}"),
            Notice::OrderExpired { symbol, cl_id } => write!(f, "{symbol} order {cl_id} expired"),
            Notice::RiskRejected { symbol, reason } => write!(f, "{symbol} risk blocked new orders: {reason}"),
            Notice::CooldownEngaged { symbol, daily_pnl, until_ms } => {
                let until = chrono::DateTime::from_timestamp_millis(*until_ms)
                    .map(|t| t.format("%H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| until_ms.to_string());
                write!(f, "{symbol} daily loss {daily_pnl:.2} breached limit, cooldown until {until}")
            }
            Notice::CooldownElapsed { symbol } => write!(f, "{symbol} cooldown elapsed"),
            Notice::RetryExhausted { symbol, op, cl_id, error } => match cl_id {
                Some(id) => write!(f, "{symbol} {op} for {id} gave up: {error}"),
                None => write!(f, "{symbol} {op} gave up: {error}"),
            },
            Notice::Halted { symbol, reason } => write!(f, "{symbol} HALTED: {reason}"),
            Notice::Resumed { symbol } => write!(f, "{symbol} resumed after resync"),
            Notice::ShutdownSummary { symbol, net_size, realized_pnl, cancelled, failed } => write!(
                f,
                "{symbol} shutdown: position {net_size}, realized {realized_pnl:.2}, cancelled {cancelled}, cancel failures {failed}"
            ),
        }
    }
}

/// Fire-and-forget handle. Never blocks the caller.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notice>,
}

impl Notifier {
    pub fn notify(&self, notice: Notice) {
        match self.tx.try_send(notice) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(n)) => warn!(notice = %n, "notifier: queue full, dropped"),
            Err(mpsc::error::TrySendError::Closed(n)) => debug!(notice = %n, "notifier: closed"),
        }
    }
}

pub fn channel(capacity: usize) -> (Notifier, mpsc::Receiver<Notice>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Notifier { tx }, rx)
}

pub enum Backend {
    Telegram { http: reqwest::Client, token: String, chat_id: String },
    Log,
}

impl Backend {
    pub fn from_settings(token: Option<&str>, chat_id: Option<&str>) -> Self {
        match (token, chat_id) {
            (Some(t), Some(c)) if !t.is_empty() && !c.is_empty() => {
                let http = reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new());
                Backend::Telegram { http, token: t.to_string(), chat_id: c.to_string() }
            }
            _ => Backend::Log,
        }
    }

    async fn deliver(&self, text: &str) {
        match self {
            Backend::Log => info!(target: "notice", "{text}"),
            Backend::Telegram { http, token, chat_id } => {
                let url = format!("https://api.telegram.org/bot{token}/sendMessage");
                let body = json!({ "chat_id": chat_id, "text": text });
                match http.post(url).json(&body).send().await {
                    Ok(rsp) if rsp.status().is_success() => debug!("telegram: sent"),
                    Ok(rsp) => error!(status = %rsp.status(), "telegram send failed"),
                    Err(e) => error!(?e, "telegram send failed"),
                }
            }
        }
    }
}

/// Deliver notices until every `Notifier` is dropped.
pub async fn run(mut rx: mpsc::Receiver<Notice>, backend: Backend) {
    while let Some(n) = rx.recv().await {
        backend.deliver(&n.to_string()).await;
    }
    debug!("notifier: stopped");
}
