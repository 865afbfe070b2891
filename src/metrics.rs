// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::{info, warn};

// Single custom registry (everything is registered here by `init`)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter definition")
}

fn int_gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    IntGaugeVec::new(Opts::new(name, help), labels).expect("valid gauge definition")
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    GaugeVec::new(Opts::new(name, help), labels).expect("valid gauge definition")
}

// -------- market / signal --------
pub static TICKS: Lazy<IntCounterVec> = Lazy::new(|| counter_vec("ticks_total", "market data ticks", &["symbol"]));

pub static SIGNALS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("signals_total", "signals by direction", &["symbol", "direction"]));

// -------- orders --------
pub static INTENTS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("order_intents_total", "intents approved by risk", &["symbol", "side"]));

pub static RISK_REJECTS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("risk_rejects_total", "intents refused by risk", &["symbol", "reason"]));

pub static TRANSITIONS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("order_transitions_total", "lifecycle transitions by target state", &["symbol", "state"]));

pub static PORT_ERRORS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("port_errors_total", "execution port failures", &["op", "kind"]));

pub static PORT_RETRIES: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("port_retries_total", "execution port retries", &["op"]));

// Latency from submit -> acknowledgement (milliseconds)
pub static LAT_SUBMIT_ACK: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("latency_submit_to_ack_ms", "Latency from submit to ack (ms)")
            .buckets(vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]),
        &["symbol"],
    )
    .expect("valid histogram definition")
});

// -------- state --------
pub static OPEN_ORDERS: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("open_orders", "non-terminal orders", &["symbol"]));

pub static POSITION: Lazy<GaugeVec> = Lazy::new(|| gauge_vec("position_net_size", "signed net position", &["symbol"]));

pub static PNL_REALIZED: Lazy<GaugeVec> =
    Lazy::new(|| gauge_vec("pnl_realized", "realized PnL since start", &["symbol"]));

pub static PNL_UNREALIZED: Lazy<GaugeVec> =
    Lazy::new(|| gauge_vec("pnl_unrealized", "unrealized PnL at last mark", &["symbol"]));

pub static HALTED: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("instrument_halted", "1 while the instrument is halted", &["symbol"]));

pub static COOLDOWN: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("risk_cooldown_active", "1 while the loss cooldown runs", &["symbol"]));

// -------- stream health (labels: stream = market | account) --------
pub static STREAM_CONNECTED: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("stream_connected", "1 if the WS stream is connected", &["stream"]));

pub static STREAM_RECONNECTS: Lazy<IntCounterVec> =
    Lazy::new(|| counter_vec("stream_reconnects_total", "WS reconnect attempts", &["stream"]));

// ---- config visibility ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("config_feed_mode", "feed mode (label: mode)", &["mode"]));

pub static CONFIG_VENUE_MODE: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("config_venue_mode", "venue mode (label: mode)", &["mode"]));

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> =
    Lazy::new(|| int_gauge_vec("config_symbol", "configured symbols (label: symbol)", &["symbol"]));

pub fn init() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(TICKS.clone()),
        Box::new(SIGNALS.clone()),
        Box::new(INTENTS.clone()),
        Box::new(RISK_REJECTS.clone()),
        Box::new(TRANSITIONS.clone()),
        Box::new(PORT_ERRORS.clone()),
        Box::new(PORT_RETRIES.clone()),
        Box::new(LAT_SUBMIT_ACK.clone()),
        Box::new(OPEN_ORDERS.clone()),
        Box::new(POSITION.clone()),
        Box::new(PNL_REALIZED.clone()),
        Box::new(PNL_UNREALIZED.clone()),
        Box::new(HALTED.clone()),
        Box::new(COOLDOWN.clone()),
        Box::new(STREAM_CONNECTED.clone()),
        Box::new(STREAM_RECONNECTS.clone()),
        Box::new(CONFIG_FEED_MODE.clone()),
        Box::new(CONFIG_VENUE_MODE.clone()),
        Box::new(CONFIG_SYMBOL.clone()),
    ];
    for c in collectors {
        if let Err(e) = REGISTRY.register(c) {
            warn!(?e, "metric registration skipped");
        }
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let mut rsp = match req.uri().path() {
        "/" | "/metrics" => {
            let mut r = Response::new(Body::from(encode_metrics()));
            r.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"));
            r
        }
        "/healthz" => Response::new(Body::from("ok\n")),
        _ => Response::new(Body::empty()),
    };
    if !matches!(req.uri().path(), "/" | "/metrics" | "/healthz") {
        *rsp.status_mut() = StatusCode::NOT_FOUND;
    }
    Ok(rsp)
}

/// Serve `/metrics` (and `/healthz`) until the process exits.
pub async fn serve_metrics(port: u16) -> Result<(), hyper::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = Server::try_bind(&addr)?.serve(make);
    info!(%addr, "metrics listening on http://{addr}/metrics");
    server.await
}
