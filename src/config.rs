// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : perp_revert_bot — unattended mean-reversion agent for perpetuals
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Streams tickers (mock/Bybit), turns z-score extremes into orders,
          gates them through risk limits, drives every order through an
          idempotent lifecycle, exposes Prometheus metrics, and records
          JSONL events.
=============================================================================
*/
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::bybit;
use crate::domain::RiskLimits;
use crate::engine::{EngineConfig, OrderType, PartialFillPolicy};
use crate::retry::RetryPolicy;
use crate::strategy::SignalParams;

#[derive(Debug, Parser)]
#[command(name = "perp_revert_bot", version, about = "Mean-reversion agent for linear perpetuals")]
pub struct Cli {
    /// Read settings from this file instead of ./.env
    #[arg(long)]
    pub env_file: Option<String>,
    /// Log filter, e.g. "info" or "perp_revert_bot=debug" (overrides RUST_LOG)
    #[arg(long)]
    pub log: Option<String>,
    /// Validate the configuration, print it and exit
    #[arg(long)]
    pub check_config: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid { key: &'static str, value: String, reason: String },
}

/// Market data source / trading venue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarketMode {
    Mock,
    BybitTestnet,
    BybitMainnet,
}

impl MarketMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" | "paper" => Some(MarketMode::Mock),
            "bybit_testnet" | "testnet" => Some(MarketMode::BybitTestnet),
            "bybit_mainnet" | "mainnet" => Some(MarketMode::BybitMainnet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketMode::Mock => "mock",
            MarketMode::BybitTestnet => "bybit_testnet",
            MarketMode::BybitMainnet => "bybit_mainnet",
        }
    }

    pub fn is_bybit(&self) -> bool { !matches!(self, MarketMode::Mock) }

    // mainnet endpoints are only used when asked for explicitly
    pub fn default_rest_url(&self) -> &'static str {
        match self {
            MarketMode::BybitMainnet => bybit::MAINNET_REST,
            _ => bybit::TESTNET_REST,
        }
    }

    pub fn default_ws_public_url(&self) -> &'static str {
        match self {
            MarketMode::BybitMainnet => bybit::MAINNET_WS_PUBLIC,
            _ => bybit::TESTNET_WS_PUBLIC,
        }
    }

    pub fn default_ws_private_url(&self) -> &'static str {
        match self {
            MarketMode::BybitMainnet => bybit::MAINNET_WS_PRIVATE,
            _ => bybit::TESTNET_WS_PRIVATE,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub symbols: Vec<String>,
    pub feed_mode: MarketMode,
    pub venue_mode: MarketMode,

    // bybit
    pub bybit_rest_url: String,
    pub bybit_ws_public_url: String,
    pub bybit_ws_private_url: String,
    pub bybit_api_key: Option<String>,
    pub bybit_api_secret: Option<String>,
    pub bybit_recv_window: u64,
    pub request_timeout: Duration,

    // mock feed / paper venue
    pub mock_start_price: f64,
    pub mock_tick: Duration,
    pub paper_fill_delay: Option<Duration>,

    pub signal: SignalParams,
    pub limits: RiskLimits,
    pub engine: EngineConfig,

    // notifications / output
    pub telegram_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub metrics_port: u16,
    pub record_file: Option<String>,
}

impl Settings {
    /// Credentials are never printed.
    pub fn redacted(&self) -> String {
        let mask = |s: &Option<String>| match s {
            Some(v) if v.len() > 4 => format!("{}***", v.chars().take(4).collect::<String>()),
            Some(_) => "***".to_string(),
            None => "-".to_string(),
        };
        format!(
            "symbols={:?} feed={} venue={} rest={} ws_public={} ws_private={} key={} secret={} \
             order_size={} order_type={:?} max_position={} max_open_orders={} daily_loss_limit={} \
             telegram={} metrics_port={} record_file={:?}",
            self.symbols,
            self.feed_mode.as_str(),
            self.venue_mode.as_str(),
            self.bybit_rest_url,
            self.bybit_ws_public_url,
            self.bybit_ws_private_url,
            mask(&self.bybit_api_key),
            self.bybit_api_secret.as_ref().map_or("-", |_| "***"),
            self.engine.order_size,
            self.engine.order_type,
            self.limits.max_position_size,
            self.limits.max_open_orders,
            self.limits.daily_loss_limit,
            self.telegram_token.is_some() && self.telegram_chat_id.is_some(),
            self.metrics_port,
            self.record_file,
        )
    }
}

struct Reader<F: Fn(&str) -> Option<String>> {
    get: F,
}

impl<F: Fn(&str) -> Option<String>> Reader<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.get)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(key) {
            None => Ok(default),
            Some(v) => v.parse::<T>().map_err(|e| ConfigError::Invalid { key, value: v, reason: e.to_string() }),
        }
    }

    fn positive(&self, key: &'static str, default: f64) -> Result<f64, ConfigError> {
        let x: f64 = self.parse(key, default)?;
        if !(x > 0.0) || !x.is_finite() {
            return Err(invalid(key, x, "must be a positive number"));
        }
        Ok(x)
    }

    fn non_negative(&self, key: &'static str, default: f64) -> Result<f64, ConfigError> {
        let x: f64 = self.parse(key, default)?;
        if !(x >= 0.0) || !x.is_finite() {
            return Err(invalid(key, x, "must not be negative"));
        }
        Ok(x)
    }

    fn millis(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_millis(self.parse(key, default)?))
    }

    fn secs(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_secs(self.parse(key, default)?))
    }

    fn mode(&self, key: &'static str) -> Result<MarketMode, ConfigError> {
        match self.raw(key) {
            None => Ok(MarketMode::Mock),
            Some(v) => MarketMode::parse(&v)
                .ok_or_else(|| invalid(key, v, "expected mock, bybit_testnet or bybit_mainnet")),
        }
    }
}

fn invalid(key: &'static str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::Invalid { key, value: value.to_string(), reason: reason.to_string() }
}

/// Build `Settings` from any key lookup (the process environment in `load`).
pub fn load_from<F>(get: F) -> Result<Settings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let r = Reader { get };

    // SYMBOLS=BTCUSDT,ETHUSDT
    let mut symbols: Vec<String> = r
        .string("SYMBOLS", "BTCUSDT")
        .split(',')
        .map(|x| x.trim().to_ascii_uppercase())
        .filter(|x| !x.is_empty())
        .collect();
    symbols.dedup();
    if symbols.is_empty() {
        return Err(ConfigError::Missing("SYMBOLS"));
    }

    let feed_mode = r.mode("FEED_MODE")?;
    let venue_mode = r.mode("VENUE_MODE")?;
    let net = if venue_mode.is_bybit() { venue_mode } else { feed_mode };

    let bybit_api_key = r.raw("BYBIT_API_KEY");
    let bybit_api_secret = r.raw("BYBIT_API_SECRET");
    if venue_mode.is_bybit() {
        if bybit_api_key.is_none() {
            return Err(ConfigError::Missing("BYBIT_API_KEY"));
        }
        if bybit_api_secret.is_none() {
            return Err(ConfigError::Missing("BYBIT_API_SECRET"));
        }
    }

    let signal = SignalParams {
        window: r.parse("SIGNAL_WINDOW", 20)?,
        band_k: r.positive("SIGNAL_BAND_K", 2.0)?,
        saturation_z: r.positive("SIGNAL_SATURATION_Z", 3.0)?,
        rsi_period: r.parse("SIGNAL_RSI_PERIOD", 0)?,
        rsi_oversold: r.parse("SIGNAL_RSI_OVERSOLD", 30.0)?,
        rsi_overbought: r.parse("SIGNAL_RSI_OVERBOUGHT", 70.0)?,
        atr_period: r.parse("SIGNAL_ATR_PERIOD", 14)?,
        adx_period: r.parse("SIGNAL_ADX_PERIOD", 0)?,
        adx_max: r.positive("SIGNAL_ADX_MAX", 25.0)?,
    };
    if signal.window < 2 {
        return Err(invalid("SIGNAL_WINDOW", signal.window, "needs at least 2 samples"));
    }

    let limits = RiskLimits {
        max_position_size: r.positive("MAX_POSITION_SIZE", 1.0)?,
        max_open_orders: r.parse("MAX_OPEN_ORDERS", 2)?,
        daily_loss_limit: r.positive("DAILY_LOSS_LIMIT", 100.0)?,
        loss_cooldown_ms: r.secs("LOSS_COOLDOWN_SECS", 3600)?.as_millis() as i64,
        max_daily_trades: r.parse("MAX_DAILY_TRADES", 0)?,
        profit_lock: r.non_negative("PROFIT_LOCK", 0.0)?,
    };

    let order_type = match r.string("ORDER_TYPE", "limit").to_ascii_lowercase().as_str() {
        "limit" => OrderType::Limit,
        "market" => OrderType::Market,
        other => return Err(invalid("ORDER_TYPE", other, "expected limit or market")),
    };
    let partial_fill_policy = match r.string("PARTIAL_FILL_POLICY", "hold").to_ascii_lowercase().as_str() {
        "hold" => PartialFillPolicy::Hold,
        "reevaluate" => PartialFillPolicy::Reevaluate,
        other => return Err(invalid("PARTIAL_FILL_POLICY", other, "expected hold or reevaluate")),
    };

    let retry = RetryPolicy {
        max_attempts: r.parse("RETRY_MAX_ATTEMPTS", 5)?,
        base_delay: r.millis("RETRY_BASE_MS", 200)?,
        max_delay: r.millis("RETRY_MAX_MS", 5000)?,
    };

    let engine = EngineConfig {
        order_size: r.positive("ORDER_SIZE", 0.01)?,
        order_type,
        qty_step: r.positive("QTY_STEP", 0.001)?,
        price_tick: r.positive("PRICE_TICK", 0.1)?,
        min_strength: r.non_negative("MIN_STRENGTH", 0.6)?,
        exit_z: r.parse("EXIT_Z", 0.0)?,
        stop_loss_pct: r.non_negative("STOP_LOSS_PCT", 0.015)?,
        stop_loss_atr_mult: r.non_negative("STOP_LOSS_ATR_MULT", 1.5)?,
        trailing_atr_mult: r.non_negative("TRAILING_ATR_MULT", 1.2)?,
        ack_timeout: r.millis("ACK_TIMEOUT_MS", 5000)?,
        order_ttl: r.secs("ORDER_TTL_SECS", 120)?,
        stale_threshold: r.positive("STALE_THRESHOLD", 0.005)?,
        partial_fill_policy,
        max_resubmits: r.parse("MAX_RESUBMITS", 2)?,
        housekeeping: r.millis("HOUSEKEEPING_MS", 1000)?,
        resync_interval: r.secs("RESYNC_INTERVAL_SECS", 60)?,
        shutdown_grace: r.secs("SHUTDOWN_GRACE_SECS", 10)?,
        retry,
    };
    engine.validate().map_err(|e| invalid("ENGINE", "-", &e.to_string()))?;

    let paper_delay_ms: u64 = r.parse("PAPER_FILL_DELAY_MS", 500)?;

    Ok(Settings {
        symbols,
        feed_mode,
        venue_mode,
        bybit_rest_url: r.string("BYBIT_REST_URL", net.default_rest_url()),
        bybit_ws_public_url: r.string("BYBIT_WS_PUBLIC_URL", feed_mode.default_ws_public_url()),
        bybit_ws_private_url: r.string("BYBIT_WS_PRIVATE_URL", net.default_ws_private_url()),
        bybit_api_key,
        bybit_api_secret,
        bybit_recv_window: r.parse("BYBIT_RECV_WINDOW", 5000)?,
        request_timeout: r.millis("REQUEST_TIMEOUT_MS", 5000)?,
        mock_start_price: r.positive("MOCK_START_PRICE", 30_000.0)?,
        mock_tick: r.millis("MOCK_TICK_MS", 500)?,
        paper_fill_delay: (paper_delay_ms > 0).then(|| Duration::from_millis(paper_delay_ms)),
        signal,
        limits,
        engine,
        telegram_token: r.raw("TELEGRAM_BOT_TOKEN"),
        telegram_chat_id: r.raw("TELEGRAM_CHAT_ID"),
        metrics_port: r.parse("METRICS_PORT", 9898)?,
        record_file: r.raw("RECORD_FILE"),
    })
}

/// Read `.env` (or `--env-file`), then the process environment.
pub fn load(cli: &Cli) -> Result<Settings, ConfigError> {
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_filename(path).map_err(|e| invalid("--env-file", path, &e.to_string()))?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }
    load_from(|k| std::env::var(k).ok())
}
