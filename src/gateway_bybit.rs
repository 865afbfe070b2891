// ===============================
// src/gateway_bybit.rs
// ===============================
//
// Bybit v5 linear perpetuals behind ExecutionPort.
// - REST (signed headers) for create / cancel / query / open orders / position
// - private WS `order` topic for the account stream
// Every create and cancel is keyed by `orderLinkId` = client order id.
//
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::{sync::mpsc, time::{interval, MissedTickBehavior}};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::bybit::{
    classify_ret_code, num, rest_signature, subscribe_message, timestamp_ms, ws_auth_message, BybitOrder, BybitPosition,
    CreateResult, Envelope, List, WsMessage, CATEGORY, RET_ORDER_NOT_FOUND,
};
use crate::domain::{format_step, AccountEvent, ClientOrderId, OrderIntent, OrderKind, OrderUpdate, PositionSnapshot};
use crate::feed::normalize_order;
use crate::port::{ExecutionPort, PortError, SubmitAck};

/// "OrderLinkedID is duplicate": the create already landed.
const RET_DUPLICATE_LINK_ID: i64 = 110072;

#[derive(Debug, Clone)]
pub struct BybitConfig {
    pub rest_url: String,
    pub ws_private_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub recv_window: u64,
    pub request_timeout: Duration,
    pub qty_step: f64,
    pub price_tick: f64,
}

pub struct BybitPort {
    cfg: BybitConfig,
    http: reqwest::Client,
}

/// `k=v&k=v` in the given order; the same string is signed and sent.
pub fn build_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn map_transport(e: reqwest::Error) -> PortError {
    if e.is_connect() {
        PortError::Transient(format!("connect: {e}"))
    } else if e.is_timeout() {
        PortError::Timeout(format!("timeout: {e}"))
    } else {
        // sent but no usable answer; outcome unknown
        PortError::Timeout(e.to_string())
    }
}

pub fn classify_status(status: StatusCode, body: &str) -> PortError {
    let text = format!("http {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS {
        PortError::Transient(text)
    } else if status.is_server_error() {
        PortError::Timeout(text)
    } else {
        PortError::Permanent(text)
    }
}

impl BybitPort {
    pub fn new(cfg: BybitConfig) -> Result<Self, PortError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .map_err(|e| PortError::Permanent(format!("http client: {e}")))?;
        Ok(Self { cfg, http })
    }

    fn signed(&self, rb: reqwest::RequestBuilder, payload: &str) -> Result<reqwest::RequestBuilder, PortError> {
        let ts = timestamp_ms();
        let sig = rest_signature(&self.cfg.api_secret, ts, &self.cfg.api_key, self.cfg.recv_window, payload)?;
        Ok(rb
            .header("X-BAPI-API-KEY", &self.cfg.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", self.cfg.recv_window.to_string())
            .header("X-BAPI-SIGN", sig))
    }

    async fn envelope<T: DeserializeOwned>(rsp: reqwest::Response) -> Result<Envelope<T>, PortError> {
        let status = rsp.status();
        let body = rsp.text().await.map_err(map_transport)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        serde_json::from_str::<Envelope<T>>(&body).map_err(|e| PortError::Timeout(format!("bad response: {e}")))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> Result<Envelope<T>, PortError> {
        let query = build_query(params);
        let url = format!("{}{}?{}", self.cfg.rest_url, path, query);
        let rsp = self.signed(self.http.get(url), &query)?.send().await.map_err(map_transport)?;
        Self::envelope(rsp).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<Envelope<T>, PortError> {
        let payload = body.to_string();
        let url = format!("{}{}", self.cfg.rest_url, path);
        let rb = self.http.post(url).header("Content-Type", "application/json").body(payload.clone());
        let rsp = self.signed(rb, &payload)?.send().await.map_err(map_transport)?;
        Self::envelope(rsp).await
    }

    async fn orders(&self, path: &str, params: &[(&str, String)]) -> Result<Vec<OrderUpdate>, PortError> {
        let list = self.get::<List<BybitOrder>>(path, params).await?.into_result()?;
        Ok(list.map(|l| l.list).unwrap_or_default().iter().filter_map(normalize_order).collect())
    }

    fn create_body(&self, intent: &OrderIntent) -> Value {
        let mut body = json!({
            "category": CATEGORY,
            "symbol": intent.symbol,
            "side": intent.side.as_str(),
            "qty": format_step(intent.size, self.cfg.qty_step),
            "orderLinkId": intent.client_order_id.as_str(),
            "reduceOnly": intent.reduce_only,
            "positionIdx": 0,
        });
        match intent.kind {
            OrderKind::Market => {
                body["orderType"] = json!("Market");
                body["timeInForce"] = json!("IOC");
            }
            OrderKind::Limit(px) => {
                body["orderType"] = json!("Limit");
                body["price"] = json!(format_step(px, self.cfg.price_tick));
                body["timeInForce"] = json!("GTC");
            }
        }
        if let Some(sl) = intent.stop_loss.filter(|px| *px > 0.0 && !intent.reduce_only) {
            body["stopLoss"] = json!(format_step(sl, self.cfg.price_tick));
        }
        body
    }
}

#[async_trait]
impl ExecutionPort for BybitPort {
    fn name(&self) -> &str { "bybit" }

    async fn submit(&self, intent: &OrderIntent) -> Result<SubmitAck, PortError> {
        let env = self.post::<CreateResult>("/v5/order/create", &self.create_body(intent)).await?;
        if env.ret_code == RET_DUPLICATE_LINK_ID {
            // already on the book from an earlier attempt
            return match self.query_status(&intent.symbol, &intent.client_order_id).await? {
                Some(u) => Ok(SubmitAck { exchange_order_id: u.exchange_order_id.unwrap_or_default() }),
                None => Err(PortError::Timeout("duplicate link id but order not visible yet".into())),
            };
        }
        let res = env.into_result()?.ok_or_else(|| PortError::Timeout("create without result".into()))?;
        info!(cl_id = %intent.client_order_id, order_id = %res.order_id, link = %res.order_link_id, "bybit: order accepted");
        Ok(SubmitAck { exchange_order_id: res.order_id })
    }

    async fn cancel(&self, symbol: &str, id: &ClientOrderId) -> Result<(), PortError> {
        let body = json!({ "category": CATEGORY, "symbol": symbol, "orderLinkId": id.as_str() });
        let env = self.post::<Value>("/v5/order/cancel", &body).await?;
        if env.ret_code == RET_ORDER_NOT_FOUND {
            return Err(PortError::Permanent(format!("cancel {id}: order not found or already closed")));
        }
        env.into_result().map(|_| ())
    }

    async fn query_status(&self, symbol: &str, id: &ClientOrderId) -> Result<Option<OrderUpdate>, PortError> {
        let params = [
            ("category", CATEGORY.to_string()),
            ("symbol", symbol.to_string()),
            ("orderLinkId", id.as_str().to_string()),
        ];
        if let Some(u) = self.orders("/v5/order/realtime", &params).await?.into_iter().next() {
            return Ok(Some(u));
        }
        Ok(self.orders("/v5/order/history", &params).await?.into_iter().next())
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OrderUpdate>, PortError> {
        let params = [
            ("category", CATEGORY.to_string()),
            ("symbol", symbol.to_string()),
            ("openOnly", "0".to_string()),
            ("limit", "50".to_string()),
        ];
        self.orders("/v5/order/realtime", &params).await
    }

    async fn position(&self, symbol: &str) -> Result<PositionSnapshot, PortError> {
        let params = [("category", CATEGORY.to_string()), ("symbol", symbol.to_string())];
        let list = self.get::<List<BybitPosition>>("/v5/position/list", &params).await?.into_result()?;
        let mut snap = PositionSnapshot { symbol: symbol.to_string(), net_size: 0.0, avg_entry_price: 0.0 };
        for p in list.map(|l| l.list).unwrap_or_default().iter().filter(|p| p.symbol == symbol) {
            let size = num(&p.size).unwrap_or(0.0);
            let sign = match p.side.as_str() {
                "Buy" => 1.0,
                "Sell" => -1.0,
                _ => 0.0,
            };
            snap.net_size += sign * size;
            if size > 0.0 {
                snap.avg_entry_price = num(&p.avg_price).unwrap_or(0.0);
            }
        }
        Ok(snap)
    }

    async fn stream_account_events(&self, tx: mpsc::Sender<AccountEvent>) -> Result<(), PortError> {
        let url = Url::parse(&self.cfg.ws_private_url).map_err(|e| PortError::Permanent(format!("bad ws url: {e}")))?;
        let (ws, _) = connect_async(url).await.map_err(|e| PortError::Transient(format!("ws connect: {e}")))?;
        let (mut write, mut read) = ws.split();

        let expires = timestamp_ms() + 10_000;
        let auth = ws_auth_message(&self.cfg.api_key, &self.cfg.api_secret, expires)?;
        write.send(Message::Text(auth.to_string())).await.map_err(|e| PortError::Transient(format!("ws auth: {e}")))?;

        let mut ping = interval(Duration::from_secs(20));
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut subscribed = false;

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    write.send(Message::Text(r#"{"op":"ping"}"#.to_string())).await
                        .map_err(|e| PortError::Transient(format!("ws ping: {e}")))?;
                }
                frame = read.next() => {
                    let txt = match frame {
                        Some(Ok(Message::Text(t))) => t,
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(PortError::Transient(format!("ws read: {e}"))),
                    };
                    let Ok(msg) = serde_json::from_str::<WsMessage>(&txt) else {
                        debug!(%txt, "private ws: unparsed frame");
                        continue;
                    };
                    match msg.op.as_deref() {
                        Some("auth") => {
                            if msg.success != Some(true) {
                                return Err(PortError::Permanent(format!("ws auth refused: {:?}", msg.ret_msg)));
                            }
                            write.send(Message::Text(subscribe_message(&["order".to_string()]).to_string())).await
                                .map_err(|e| PortError::Transient(format!("ws subscribe: {e}")))?;
                        }
                        Some("subscribe") => {
                            if msg.success != Some(true) {
                                return Err(PortError::Permanent(format!("order topic refused: {:?}", msg.ret_msg)));
                            }
                            if !subscribed {
                                subscribed = true;
                                info!("bybit: private order stream live");
                                if tx.send(AccountEvent::StreamUp).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        _ => {}
                    }
                    if msg.topic.as_deref() == Some("order") {
                        let orders: Vec<Value> = match msg.data {
                            Some(Value::Array(items)) => items,
                            _ => Vec::new(),
                        };
                        for raw in orders {
                            if raw.get("category").and_then(|c| c.as_str()).map_or(false, |c| c != CATEGORY) {
                                continue;
                            }
                            match serde_json::from_value::<BybitOrder>(raw) {
                                Ok(o) => {
                                    if let Some(u) = normalize_order(&o) {
                                        if tx.send(AccountEvent::Order(u)).await.is_err() {
                                            return Ok(());
                                        }
                                    }
                                }
                                Err(e) => warn!(?e, "private ws: bad order payload"),
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, Side, Signal};

    fn port() -> BybitPort {
        BybitPort::new(BybitConfig {
            rest_url: "https://api-testnet.bybit.com".into(),
            ws_private_url: "wss://stream-testnet.bybit.com/v5/private".into(),
            api_key: "key".into(),
            api_secret: "secret".into(),
            recv_window: 5000,
            request_timeout: Duration::from_secs(5),
            qty_step: 0.001,
            price_tick: 0.1,
        })
        .expect("client")
    }

    fn intent(kind: OrderKind) -> OrderIntent {
        OrderIntent {
            client_order_id: ClientOrderId::new("mr-1700000000000-1-beef"),
            symbol: "BTCUSDT".into(),
            side: Side::Sell,
            size: 0.30000000000000004,
            kind,
            reduce_only: true,
            stop_loss: None,
            reason: Signal {
                ts_ms: 0,
                symbol: "BTCUSDT".into(),
                direction: Direction::Short,
                strength: 1.0,
                basis_price: 27000.0,
                zscore: 3.1,
                mean: 26900.0,
            },
            created_at_ms: 0,
        }
    }

    #[test]
    fn query_string_is_encoded_in_order() {
        let q = build_query(&[("category", "linear".into()), ("orderLinkId", "a b".into())]);
        assert_eq!(q, "category=linear&orderLinkId=a%20b");
    }

    #[test]
    fn create_body_carries_link_id_and_rounded_numbers() {
        let p = port();
        let b = p.create_body(&intent(OrderKind::Limit(27000.04)));
        assert_eq!(b["orderLinkId"], "mr-1700000000000-1-beef");
        assert_eq!(b["qty"], "0.300");
        assert_eq!(b["price"], "27000.0");
        assert_eq!(b["orderType"], "Limit");
        assert_eq!(b["reduceOnly"], true);

        let m = p.create_body(&intent(OrderKind::Market));
        assert_eq!(m["orderType"], "Market");
        assert!(m.get("price").is_none());
        assert!(m.get("stopLoss").is_none());
    }

    #[test]
    fn entry_carries_stop_loss_and_exit_does_not() {
        let p = port();
        let mut entry = intent(OrderKind::Limit(27000.0));
        entry.reduce_only = false;
        entry.stop_loss = Some(27405.04);
        let b = p.create_body(&entry);
        assert_eq!(b["stopLoss"], "27405.0");
        assert_eq!(b["reduceOnly"], false);

        let mut exit = entry;
        exit.reduce_only = true;
        assert!(p.create_body(&exit).get("stopLoss").is_none());
    }

    #[test]
    fn http_status_classification() {
        assert!(matches!(classify_status(StatusCode::TOO_MANY_REQUESTS, ""), PortError::Transient(_)));
        assert!(matches!(classify_status(StatusCode::BAD_GATEWAY, ""), PortError::Timeout(_)));
        assert!(matches!(classify_status(StatusCode::UNAUTHORIZED, ""), PortError::Permanent(_)));
        assert!(matches!(classify_ret_code(10006, "rate"), PortError::Transient(_)));
    }
}
