// ===============================
// src/gateway.rs (paper venue)
// ===============================
//
// In-memory venue behind the same ExecutionPort as Bybit. Orders are acked at
// once and, when a fill delay is configured, filled in full after it at their
// limit price (market orders at the signal basis). Submit is idempotent on the
// client order id, like `orderLinkId` on the real venue.
//
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use tokio::{
    sync::{mpsc, Mutex},
    time::{sleep, Duration},
};
use tracing::{debug, info};

use crate::domain::{
    AccountEvent, ClientOrderId, ExchangeStatus, OrderIntent, OrderUpdate, Position, PositionSnapshot, Side,
};
use crate::port::{ExecutionPort, PortError, SubmitAck};

#[derive(Debug, Clone)]
struct PaperOrder {
    exchange_order_id: String,
    symbol: String,
    side: Side,
    qty: f64,
    price: f64,
    reduce_only: bool,
    status: ExchangeStatus,
    cum_filled: f64,
    avg_price: f64,
    seq: u64,
}

impl PaperOrder {
    fn is_open(&self) -> bool {
        matches!(self.status, ExchangeStatus::New | ExchangeStatus::PartiallyFilled)
    }

    fn snapshot(&self, cl_id: &ClientOrderId) -> OrderUpdate {
        OrderUpdate {
            symbol: self.symbol.clone(),
            client_order_id: Some(cl_id.clone()),
            exchange_order_id: Some(self.exchange_order_id.clone()),
            event_id: format!("paper-{}", self.seq),
            seq: self.seq,
            side: self.side,
            status: self.status,
            qty: self.qty,
            price: Some(self.price),
            cum_filled: self.cum_filled,
            avg_price: self.avg_price,
            reduce_only: self.reduce_only,
            reason: None,
        }
    }
}

#[derive(Default)]
struct Book {
    orders: HashMap<ClientOrderId, PaperOrder>,
    positions: HashMap<String, Position>,
    seq: u64,
    next_id: u64,
    subscribers: Vec<mpsc::Sender<AccountEvent>>,
    submits: usize,
}

impl Book {
    fn publish(&mut self, update: OrderUpdate) {
        self.subscribers.retain(|tx| match tx.try_send(AccountEvent::Order(update.clone())) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("paper: subscriber lagging, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn fill(&mut self, id: &ClientOrderId, qty: f64, price: f64) -> Option<OrderUpdate> {
        self.seq += 1;
        let seq = self.seq;
        let o = self.orders.get_mut(id).filter(|o| o.is_open())?;
        let qty = qty.min(o.qty - o.cum_filled);
        if qty <= 0.0 {
            return None;
        }
        o.avg_price = (o.avg_price * o.cum_filled + price * qty) / (o.cum_filled + qty);
        o.cum_filled += qty;
        o.status = if o.cum_filled >= o.qty - 1e-12 { ExchangeStatus::Filled } else { ExchangeStatus::PartiallyFilled };
        o.seq = seq;
        let (symbol, side) = (o.symbol.clone(), o.side);
        let update = o.snapshot(id);
        self.positions
            .entry(symbol.clone())
            .or_insert_with(|| Position::flat(symbol))
            .apply_fill(side, qty, price, 0);
        self.publish(update.clone());
        Some(update)
    }
}

#[derive(Clone)]
pub struct PaperPort {
    book: Arc<Mutex<Book>>,
    fill_delay: Option<Duration>,
}

impl PaperPort {
    /// `fill_delay = None` leaves orders resting until `fill` is called.
    pub fn new(fill_delay: Option<Duration>) -> Self {
        Self { book: Arc::new(Mutex::new(Book::default())), fill_delay }
    }

    /// Fill (part of) a resting order.
    pub async fn fill(&self, id: &ClientOrderId, qty: f64, price: f64) -> Option<OrderUpdate> {
        self.book.lock().await.fill(id, qty, price)
    }

    /// Seed a position, as if it was opened before this process started.
    pub async fn set_position(&self, symbol: &str, net_size: f64, avg_entry_price: f64) {
        let mut book = self.book.lock().await;
        book.positions.insert(
            symbol.to_string(),
            Position { net_size, avg_entry_price, ..Position::flat(symbol) },
        );
    }

    /// Distinct create requests seen (repeats of a known id are not counted).
    pub async fn submit_count(&self) -> usize {
        self.book.lock().await.submits
    }
}

#[async_trait]
impl ExecutionPort for PaperPort {
    fn name(&self) -> &str { "paper" }

    async fn submit(&self, intent: &OrderIntent) -> Result<SubmitAck, PortError> {
        let mut book = self.book.lock().await;
        if let Some(existing) = book.orders.get(&intent.client_order_id) {
            return Ok(SubmitAck { exchange_order_id: existing.exchange_order_id.clone() });
        }
        if !(intent.size > 0.0) {
            return Err(PortError::Permanent("qty must be positive".into()));
        }
        book.submits += 1;
        book.next_id += 1;
        book.seq += 1;
        let order = PaperOrder {
            exchange_order_id: format!("paper-{}", book.next_id),
            symbol: intent.symbol.clone(),
            side: intent.side,
            qty: intent.size,
            price: intent.kind.limit_price().unwrap_or(intent.reason.basis_price),
            reduce_only: intent.reduce_only,
            status: ExchangeStatus::New,
            cum_filled: 0.0,
            avg_price: 0.0,
            seq: book.seq,
        };
        let ack = SubmitAck { exchange_order_id: order.exchange_order_id.clone() };
        let update = order.snapshot(&intent.client_order_id);
        let (qty, price) = (order.qty, order.price);
        book.orders.insert(intent.client_order_id.clone(), order);
        book.publish(update);
        drop(book);
        info!(cl_id = %intent.client_order_id, side = intent.side.as_str(), qty, price, "paper: order accepted");

        if let Some(delay) = self.fill_delay {
            let book = self.book.clone();
            let id = intent.client_order_id.clone();
            tokio::spawn(async move {
                sleep(delay).await;
                book.lock().await.fill(&id, qty, price);
            });
        }
        Ok(ack)
    }

    async fn cancel(&self, _symbol: &str, id: &ClientOrderId) -> Result<(), PortError> {
        let mut book = self.book.lock().await;
        book.seq += 1;
        let seq = book.seq;
        let Some(o) = book.orders.get_mut(id) else {
            return Err(PortError::Permanent(format!("order {id} not found")));
        };
        if !o.is_open() {
            return Ok(());
        }
        o.status = ExchangeStatus::Cancelled;
        o.seq = seq;
        let update = o.snapshot(id);
        book.publish(update);
        Ok(())
    }

    async fn query_status(&self, _symbol: &str, id: &ClientOrderId) -> Result<Option<OrderUpdate>, PortError> {
        let book = self.book.lock().await;
        Ok(book.orders.get(id).map(|o| o.snapshot(id)))
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderUpdate>, PortError> {
        let book = self.book.lock().await;
        Ok(book
            .orders
            .iter()
            .filter(|(_, o)| o.symbol == symbol && o.is_open())
            .map(|(id, o)| o.snapshot(id))
            .collect())
    }

    async fn position(&self, symbol: &str) -> Result<PositionSnapshot, PortError> {
        let book = self.book.lock().await;
        let (net_size, avg_entry_price) =
            book.positions.get(symbol).map(|p| (p.net_size, p.avg_entry_price)).unwrap_or((0.0, 0.0));
        Ok(PositionSnapshot { symbol: symbol.to_string(), net_size, avg_entry_price })
    }

    async fn stream_account_events(&self, tx: mpsc::Sender<AccountEvent>) -> Result<(), PortError> {
        if tx.send(AccountEvent::StreamUp).await.is_err() {
            return Ok(());
        }
        self.book.lock().await.subscribers.push(tx.clone());
        tx.closed().await;
        Ok(())
    }
}
