// ===============================
// src/main.rs
// ===============================
/*
=============================================================================
Project : ladder_bot_rust — intraday ladder/pyramiding engine for NSE equities
Module  : main.rs

Summary : Streams real-time ticks for a pre-screened symbol universe, runs a
          per-symbol bidirectional ladder state machine (momentum entry,
          percentage add-ons, trailing stop, target, flip-on-stop), applies
          global admission control and kill switches, rate-limits broker
          calls, exposes Prometheus metrics, and records JSONL events.

 # cek cepat:
 curl -s localhost:9898/metrics | egrep '^(ticks_total|active_positions|global_pnl)'
=============================================================================
*/
mod config;
mod domain;
mod engine;
mod feed;
mod gateway; // trait + mock session (paper mode)
mod gateway_dhan; // broker session live (REST)
mod instruments;
mod ladder;
mod ledger;
mod metrics;
mod recorder;
mod store;
mod throttle;

use std::sync::Arc;
use tokio::{select, sync::mpsc, time::Duration};
use tracing::{error, info, warn};

use crate::config::MarketMode;
use crate::domain::Event;
use crate::gateway::BrokerSession;
use crate::instruments::InstrumentMap;
use crate::throttle::RateGate;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ---- Load config & settings ----
    let (args, mut settings) = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));
    metrics::CONFIG_MODE
        .with_label_values(&["feed", args.feed_mode.as_str()])
        .set(1);
    metrics::CONFIG_MODE
        .with_label_values(&["venue", args.venue_mode.as_str()])
        .set(1);

    info!(
        feed_mode = args.feed_mode.as_str(),
        venue_mode = args.venue_mode.as_str(),
        candidates = %args.candidates_file,
        metrics_port = args.metrics_port,
        "startup config"
    );

    // ---- Credentials ----
    let creds = store::load_credentials(&args.credentials_file);
    if let Some(c) = &creds {
        settings.client_id = c.client_id.clone();
        settings.access_token = c.access_token.clone();
        // kredensial dari env dipersist supaya run berikutnya tanpa env
        if c.saved_at.is_none() {
            if let Err(e) = store::save_credentials(&args.credentials_file, &c.client_id, &c.access_token) {
                warn!(?e, "could not persist credentials");
            }
        }
    }

    // ---- Broker session (live / mock) ----
    let gate = Arc::new(RateGate::new(args.max_requests_per_sec, args.max_connections));
    let mut instruments: Option<Arc<InstrumentMap>> = None;

    let gateway: Arc<dyn BrokerSession> = match args.venue_mode {
        MarketMode::Mock => Arc::new(gateway::MockSession::new()),
        MarketMode::Live => {
            let Some(c) = &creds else {
                error!("VENUE_MODE=live but no credentials (file or BROKER_CLIENT_ID/BROKER_ACCESS_TOKEN)");
                return;
            };
            match gateway_dhan::DhanSession::connect(
                &args.rest_base,
                &args.scrip_master_url,
                &c.client_id,
                &c.access_token,
                gate.clone(),
            )
            .await
            {
                Ok(session) => {
                    let session = Arc::new(session);
                    instruments = Some(session.instruments());
                    session
                }
                Err(e) => {
                    // session invalid = fatal; tidak ada auto-retry login
                    error!(%e, "broker connect failed");
                    return;
                }
            }
        }
    };

    // Feed live tanpa venue live tetap butuh instrument master
    if args.feed_mode == MarketMode::Live && instruments.is_none() {
        let http = match reqwest::Client::builder().timeout(std::time::Duration::from_secs(30)).build() {
            Ok(c) => c,
            Err(e) => {
                error!(?e, "http client build failed");
                return;
            }
        };
        match InstrumentMap::fetch(&http, &args.scrip_master_url).await {
            Ok(map) => instruments = Some(Arc::new(map)),
            Err(e) => {
                error!(%e, "scrip master load failed");
                return;
            }
        }
    }

    // ---- Recorder (optional) ----
    let recorder_tx = args.record_file.clone().map(|path| {
        let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
        tokio::spawn(recorder::run(rec_rx, path));
        rec_tx
    });

    // ---- Engine ----
    // Mock feed boleh jalan di luar jam pasar (paper trading kapan saja)
    let ignore_market_hours = args.feed_mode == MarketMode::Mock;
    let engine = engine::LadderEngine::new(
        gateway,
        settings,
        args.candidates_file.clone(),
        ignore_market_hours,
        recorder_tx,
    );
    engine.set_connected(true);

    let handle = match engine.start_strategy().await {
        Ok(h) => h,
        Err(e) => {
            error!(%e, "cannot start strategy");
            return;
        }
    };

    // ---- FEED ----
    match args.feed_mode {
        MarketMode::Mock => {
            for (symbol, prev_close) in handle.universe.iter().cloned() {
                let tx = handle.tick_tx.clone();
                let shutdown = engine.feed_shutdown();
                tokio::spawn(async move {
                    feed::run_mock(tx, symbol, prev_close, shutdown).await;
                });
            }
        }
        MarketMode::Live => {
            let Some(map) = instruments.clone() else {
                error!("instrument master missing for live feed");
                return;
            };
            let mut ids = Vec::with_capacity(handle.universe.len());
            for (symbol, _) in &handle.universe {
                match map.security_id(symbol) {
                    Some(id) => ids.push(id),
                    None => warn!(%symbol, "could not map symbol for subscription"),
                }
            }
            if ids.is_empty() {
                error!("no subscribable instruments in universe");
                return;
            }
            let s = engine.settings();
            let cfg = feed::ReconnectCfg {
                base_secs: args.reconnect_base_secs,
                max_attempts: args.max_reconnect_attempts,
            };
            let tx = handle.tick_tx.clone();
            let shutdown = engine.feed_shutdown();
            let ws_base = args.ws_base.clone();
            tokio::spawn(async move {
                feed::run_live(tx, ws_base, s.client_id, s.access_token, map, ids, cfg, shutdown)
                    .await;
            });
        }
    }

    // ---- Heartbeat + shutdown ----
    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, stopping engine");
                engine.stop();
                engine.halt_feed();
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(5)) => {
                let st = engine.status();
                info!(
                    running = st.running,
                    active = st.active_positions,
                    symbols = st.total_symbols,
                    global_pnl = st.global_pnl,
                    market_open = st.market_open,
                    "heartbeat"
                );
                if !st.running {
                    info!("engine stopped (session over), exiting");
                    break;
                }
            }
        }
    }

    let m = engine.metrics_snapshot();
    info!(
        ticks = m.tick_latency.count,
        tick_avg_ms = m.tick_latency.avg_ms,
        order_avg_ms = m.order_latency.avg_ms,
        order_success_rate = m.order_success_rate,
        uptime_s = m.uptime_seconds,
        "session metrics"
    );
}
