// ===============================
// src/bybit.rs
// ===============================
//
// Bybit v5 plumbing shared by the REST gateway and the WS feeds:
// request signing, envelope/order/position/ticker models, retCode mapping.
//
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;

use crate::port::PortError;

pub const CATEGORY: &str = "linear";

pub const TESTNET_REST: &str = "https://api-testnet.bybit.com";
pub const TESTNET_WS_PUBLIC: &str = "wss://stream-testnet.bybit.com/v5/public/linear";
pub const TESTNET_WS_PRIVATE: &str = "wss://stream-testnet.bybit.com/v5/private";
pub const MAINNET_REST: &str = "https://api.bybit.com";
pub const MAINNET_WS_PUBLIC: &str = "wss://stream.bybit.com/v5/public/linear";
pub const MAINNET_WS_PRIVATE: &str = "wss://stream.bybit.com/v5/private";

pub fn timestamp_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub fn sign(secret: &str, payload: &str) -> Result<String, PortError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| PortError::Permanent(format!("hmac key: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// `X-BAPI-SIGN`: HMAC over timestamp + key + recv_window + (query string | json body).
pub fn rest_signature(secret: &str, ts: u64, api_key: &str, recv_window: u64, payload: &str) -> Result<String, PortError> {
    sign(secret, &format!("{ts}{api_key}{recv_window}{payload}"))
}

/// `{"op":"auth","args":[key, expires, sig]}` for the private stream.
pub fn ws_auth_message(api_key: &str, secret: &str, expires_ms: u64) -> Result<Value, PortError> {
    let sig = sign(secret, &format!("GET/realtime{expires_ms}"))?;
    Ok(json!({ "op": "auth", "args": [api_key, expires_ms, sig] }))
}

pub fn subscribe_message(topics: &[String]) -> Value {
    json!({ "op": "subscribe", "args": topics })
}

/// Map a non-zero retCode onto the port taxonomy.
pub fn classify_ret_code(code: i64, msg: &str) -> PortError {
    let text = format!("retCode {code}: {msg}");
    match code {
        // rate limit, server busy / internal error, recv_window exceeded
        10006 | 10016 | 10018 | 10002 | 170146 => PortError::Transient(text),
        10000 => PortError::Timeout(text),
        _ => PortError::Permanent(text),
    }
}

/// "order not exists or too late to cancel"
pub const RET_ORDER_NOT_FOUND: i64 = 110001;

// ---- REST models ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub ret_code: i64,
    #[serde(default)]
    pub ret_msg: String,
    pub result: Option<T>,
}

impl<T> Envelope<T> {
    pub fn into_result(self) -> Result<Option<T>, PortError> {
        if self.ret_code != 0 {
            return Err(classify_ret_code(self.ret_code, &self.ret_msg));
        }
        Ok(self.result)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResult {
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
}

#[derive(Debug, Deserialize)]
pub struct List<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
}

/// Order object as returned by `/v5/order/realtime`, `/v5/order/history`
/// and the private `order` topic (numbers arrive as strings).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitOrder {
    pub symbol: String,
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    pub side: String,
    pub order_status: String,
    #[serde(default)]
    pub qty: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub cum_exec_qty: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub reject_reason: String,
    #[serde(default)]
    pub updated_time: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitPosition {
    pub symbol: String,
    /// "Buy" | "Sell" | "" (flat)
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub avg_price: String,
}

// ---- WS models ----

#[derive(Debug, Deserialize)]
pub struct WsMessage {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub ret_msg: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub ts: Option<i64>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// `tickers.{symbol}` payload. Deltas only carry the fields that changed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerData {
    pub symbol: String,
    #[serde(default)]
    pub bid1_price: Option<String>,
    #[serde(default)]
    pub ask1_price: Option<String>,
    #[serde(default)]
    pub mark_price: Option<String>,
    #[serde(default)]
    pub last_price: Option<String>,
}

/// Bybit sends "" for absent numbers.
pub fn num(s: &str) -> Option<f64> {
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok().filter(|x| x.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_signature_matches_reference_vector() {
        let sig = rest_signature("test-secret", 1_700_000_000_000, "key", 5000, "category=linear&symbol=BTCUSDT")
            .expect("sign");
        assert_eq!(sig, "6da17647992a973742a3aae949ea105b66a4cdcc29310bf1039f10acb3949c6e");
    }

    #[test]
    fn ws_auth_signs_get_realtime() {
        let msg = ws_auth_message("key", "test-secret", 1_700_000_001_000).expect("auth");
        assert_eq!(msg["op"], "auth");
        assert_eq!(msg["args"][1], 1_700_000_001_000u64);
        assert_eq!(msg["args"][2], "e7062a96990cc1676f387a02bdc7e57a49e7965357a1faf97594b308ad957e39");
    }

    #[test]
    fn ret_codes_map_to_port_errors() {
        assert!(matches!(classify_ret_code(10006, "too many visits"), PortError::Transient(_)));
        assert!(matches!(classify_ret_code(10004, "error sign"), PortError::Permanent(_)));
        assert!(matches!(classify_ret_code(110007, "insufficient balance"), PortError::Permanent(_)));
    }

    #[test]
    fn envelope_and_order_parse() {
        let raw = r#"{"retCode":0,"retMsg":"OK","result":{"list":[{"symbol":"BTCUSDT","orderId":"abc","orderLinkId":"mr-1","side":"Buy","orderStatus":"PartiallyFilled","qty":"0.010","price":"27000.5","cumExecQty":"0.004","avgPrice":"27000.5","reduceOnly":false,"rejectReason":"EC_NoError","updatedTime":"1700000000123"}]},"time":1700000000200}"#;
        let env: Envelope<List<BybitOrder>> = serde_json::from_str(raw).expect("parse");
        let list = env.into_result().expect("ok").expect("result").list;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].order_link_id, "mr-1");
        assert_eq!(num(&list[0].cum_exec_qty), Some(0.004));
        assert_eq!(num(""), None);

        let err: Envelope<CreateResult> =
            serde_json::from_str(r#"{"retCode":10001,"retMsg":"params error","result":{}}"#).expect("parse");
        assert!(matches!(err.into_result(), Err(PortError::Permanent(_))));
    }
}
