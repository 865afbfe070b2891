// ===============================
// src/main.rs
// ===============================
/*
 # what is running
 curl -s localhost:9898/metrics | egrep '^config_(feed_mode|venue_mode|symbol)'

 # order flow per symbol
 curl -s localhost:9898/metrics | egrep '^(order_transitions_total|risk_rejects_total|instrument_halted)'
*/
/*
=============================================================================
Project : perp_revert_bot — unattended mean-reversion agent for perpetuals
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Streams tickers (mock/Bybit), turns z-score extremes into orders,
          gates them through risk limits, drives every order through an
          idempotent lifecycle, exposes Prometheus metrics, and records
          JSONL events.
=============================================================================
*/
mod domain;
mod config;
mod metrics;
mod recorder;
mod feed;
mod strategy;
mod risk;
mod lifecycle;
mod port;
mod retry;
mod gateway;        // paper venue (in-process book)
mod bybit;          // helper (signer/models) for Bybit v5
mod gateway_bybit;  // Bybit linear perps (REST + private WS)
mod notifier;
mod engine;

use std::process::ExitCode;
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use clap::Parser;
use tokio::{
    select,
    sync::{mpsc, watch},
    task::JoinSet,
    time::{interval, timeout, Duration},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, MarketMode, Settings};
use crate::domain::{AccountEvent, Event, MarketEvent};
use crate::engine::Engine;
use crate::notifier::{Backend, Notice};
use crate::port::SharedPort;
use crate::recorder::Journal;

const CHANNEL_CAP: usize = 2048;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ---- Logging ----
    let filter = cli
        .log
        .as_deref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Config ----
    let settings = match config::load(&cli) {
        Ok(s) => s,
        Err(e) => {
            error!(err = %e, "configuration error");
            return ExitCode::from(2);
        }
    };
    info!(config = %settings.redacted(), "startup config");
    if cli.check_config {
        println!("{}", settings.redacted());
        return ExitCode::SUCCESS;
    }

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(err = %e, "fatal");
            ExitCode::from(1)
        }
    }
}

async fn run(settings: Settings) -> Result<(), port::PortError> {
    // ---- Metrics ----
    metrics::init();
    let metrics_port = settings.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::serve_metrics(metrics_port).await {
            error!(?e, port = metrics_port, "metrics server stopped");
        }
    });
    metrics::CONFIG_FEED_MODE.with_label_values(&[settings.feed_mode.as_str()]).set(1);
    metrics::CONFIG_VENUE_MODE.with_label_values(&[settings.venue_mode.as_str()]).set(1);
    for s in &settings.symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[s.as_str()]).set(1);
    }

    let (stop_tx, stop_rx) = watch::channel(false);

    // ---- Notifications ----
    let (notes, notes_rx) = notifier::channel(256);
    let backend = Backend::from_settings(settings.telegram_token.as_deref(), settings.telegram_chat_id.as_deref());
    let notifier_task = tokio::spawn(notifier::run(notes_rx, backend));

    // ---- Recorder (optional) ----
    let (journal, recorder_task) = match settings.record_file.clone() {
        Some(path) => {
            let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
            (Journal::new(rec_tx), Some(tokio::spawn(recorder::run(rec_rx, path))))
        }
        None => (Journal::disabled(), None),
    };

    // ---- Venue ----
    let port: SharedPort = match settings.venue_mode {
        MarketMode::Mock => Arc::new(gateway::PaperPort::new(settings.paper_fill_delay)),
        MarketMode::BybitTestnet | MarketMode::BybitMainnet => {
            let cfg = gateway_bybit::BybitConfig {
                rest_url: settings.bybit_rest_url.clone(),
                ws_private_url: settings.bybit_ws_private_url.clone(),
                api_key: settings.bybit_api_key.clone().unwrap_or_default(),
                api_secret: settings.bybit_api_secret.clone().unwrap_or_default(),
                recv_window: settings.bybit_recv_window,
                request_timeout: settings.request_timeout,
                qty_step: settings.engine.qty_step,
                price_tick: settings.engine.price_tick,
            };
            Arc::new(gateway_bybit::BybitPort::new(cfg)?)
        }
    };
    info!(venue = port.name(), mode = settings.venue_mode.as_str(), "venue ready");

    // ---- Per-symbol channels ----
    let mut md_txs: HashMap<String, mpsc::Sender<MarketEvent>> = HashMap::new();
    let mut acct_txs: HashMap<String, mpsc::Sender<AccountEvent>> = HashMap::new();
    let mut engines = JoinSet::new();
    for sym in settings.symbols.iter().cloned() {
        let (md_tx, md_rx) = mpsc::channel::<MarketEvent>(CHANNEL_CAP);
        let (acct_tx, acct_rx) = mpsc::channel::<AccountEvent>(CHANNEL_CAP);
        md_txs.insert(sym.clone(), md_tx);
        acct_txs.insert(sym.clone(), acct_tx);

        let engine = Engine::new(
            sym,
            settings.engine.clone(),
            settings.signal.clone(),
            &settings.limits,
            port.clone(),
            notes.clone(),
            journal.clone(),
        );
        engines.spawn(engine.run(md_rx, acct_rx, stop_rx.clone()));
    }

    // ---- FEED (Market Data) ----
    match settings.feed_mode {
        MarketMode::Mock => {
            for (sym, tx) in md_txs {
                tokio::spawn(feed::run_mock(
                    tx,
                    sym,
                    settings.mock_start_price,
                    settings.mock_tick,
                    stop_rx.clone(),
                ));
            }
        }
        MarketMode::BybitTestnet | MarketMode::BybitMainnet => {
            tokio::spawn(feed::run_bybit(settings.bybit_ws_public_url.clone(), md_txs, stop_rx.clone()));
        }
    }

    // ---- Account stream + dispatcher ----
    let (acct_central_tx, mut acct_central_rx) = mpsc::channel::<AccountEvent>(CHANNEL_CAP * 2);
    tokio::spawn(feed::run_account_stream(port.clone(), acct_central_tx, stop_rx.clone()));
    tokio::spawn(async move {
        while let Some(ev) = acct_central_rx.recv().await {
            match ev {
                AccountEvent::Order(u) => match acct_txs.get(&u.symbol) {
                    Some(tx) => {
                        let _ = tx.send(AccountEvent::Order(u)).await;
                    }
                    None => tracing::debug!(symbol = %u.symbol, "order update for an unconfigured symbol"),
                },
                other => {
                    for tx in acct_txs.values() {
                        let _ = tx.send(other.clone()).await;
                    }
                }
            }
        }
    });

    notes.notify(Notice::Started { symbols: settings.symbols.clone(), venue: port.name().to_string() });

    // ---- Heartbeat until Ctrl-C ----
    let mut heartbeat = interval(Duration::from_secs(30));
    loop {
        select! {
            r = tokio::signal::ctrl_c() => {
                if let Err(e) = r {
                    warn!(?e, "ctrl_c handler failed, shutting down");
                }
                info!("shutdown requested");
                break;
            }
            Some(done) = engines.join_next() => {
                // an engine only returns early if its task failed
                warn!(?done, "engine exited before shutdown");
                if engines.is_empty() {
                    break;
                }
            }
            _ = heartbeat.tick() => info!(engines = engines.len(), "heartbeat"),
        }
    }

    // ---- Shutdown ----
    let _ = stop_tx.send(true);
    while let Some(done) = engines.join_next().await {
        match done {
            Ok(summary) => info!(?summary, "engine summary"),
            Err(e) => error!(?e, "engine task failed"),
        }
    }

    drop(notes);
    drop(journal);
    if timeout(Duration::from_secs(5), notifier_task).await.is_err() {
        warn!("notifier did not drain in time");
    }
    if let Some(task) = recorder_task {
        let _ = timeout(Duration::from_secs(5), task).await;
    }
    info!("bye");
    Ok(())
}
