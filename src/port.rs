// ===============================
// src/port.rs (exchange boundary)
// ===============================
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::{AccountEvent, ClientOrderId, OrderIntent, OrderUpdate, PositionSnapshot};

/// Failure classification every venue adapter must map into.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PortError {
    /// Request was not applied (rate limit, connect refused); safe to repeat.
    #[error("transient: {0}")]
    Transient(String),
    /// Outcome unknown (timeout after send, 5xx). Only idempotent calls repeat it.
    #[error("timeout: {0}")]
    Timeout(String),
    /// Validation / auth / business rejection. Never retried.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl PortError {
    pub fn kind(&self) -> &'static str {
        match self {
            PortError::Transient(_) => "transient",
            PortError::Timeout(_) => "timeout",
            PortError::Permanent(_) => "permanent",
        }
    }

    pub fn is_retryable(&self, idempotent: bool) -> bool {
        match self {
            PortError::Transient(_) => true,
            PortError::Timeout(_) => idempotent,
            PortError::Permanent(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitAck {
    pub exchange_order_id: String,
}

/// Order entry + account stream of one venue. Every mutating call is keyed by
/// the client order id so a repeated call cannot create a second order.
#[async_trait]
pub trait ExecutionPort: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, intent: &OrderIntent) -> Result<SubmitAck, PortError>;

    async fn cancel(&self, symbol: &str, id: &ClientOrderId) -> Result<(), PortError>;

    /// `Ok(None)` means the venue confirms it has no such order.
    async fn query_status(&self, symbol: &str, id: &ClientOrderId) -> Result<Option<OrderUpdate>, PortError>;

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderUpdate>, PortError>;

    async fn position(&self, symbol: &str) -> Result<PositionSnapshot, PortError>;

    /// Pump account events into `tx` until the stream drops. Sends
    /// `AccountEvent::StreamUp` once subscribed; the caller reconnects.
    async fn stream_account_events(&self, tx: mpsc::Sender<AccountEvent>) -> Result<(), PortError>;
}

pub type SharedPort = Arc<dyn ExecutionPort>;
