// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : ladder_bot_rust — intraday ladder/pyramiding engine for NSE equities
Module  : config.rs

Summary : Streams real-time ticks for a pre-screened symbol universe, runs a
          per-symbol bidirectional ladder state machine (momentum entry,
          percentage add-ons, trailing stop, target, flip-on-stop), applies
          global admission control and kill switches, rate-limits broker
          calls, exposes Prometheus metrics, and records JSONL events.
=============================================================================
*/
use clap::Parser;
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;

/// Mode sumber market data / venue order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarketMode {
    Mock,
    Live,
}

impl MarketMode {
    pub fn from_env(key: &str, default_mode: MarketMode) -> MarketMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock" => MarketMode::Mock,
            "live" => MarketMode::Live,
            _ => default_mode,
        }
    }

    pub fn parse_one(s: &str) -> Option<MarketMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Some(MarketMode::Mock),
            "live" => Some(MarketMode::Live),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketMode::Mock => "mock",
            MarketMode::Live => "live",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "ladder_bot_rust", about = "Intraday NSE ladder/pyramiding engine")]
struct Cli {
    /// Feed source: mock | live
    #[arg(long)]
    feed_mode: Option<String>,
    /// Order venue: mock | live
    #[arg(long)]
    venue_mode: Option<String>,
    /// Prometheus metrics port
    #[arg(long)]
    metrics_port: Option<u16>,
    /// Pre-market candidates JSON (symbol -> prev close)
    #[arg(long)]
    candidates_file: Option<String>,
    /// JSONL event recording path (optional)
    #[arg(long)]
    record_file: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Args {
    // files/metrics
    pub candidates_file: String,
    pub credentials_file: String,
    pub record_file: Option<String>,
    pub metrics_port: u16,

    // market mode
    pub feed_mode: MarketMode,
    pub venue_mode: MarketMode,
    pub rest_base: String,
    pub ws_base: String,
    pub scrip_master_url: String,

    // broker ceilings / feed discipline
    pub max_requests_per_sec: f64,
    pub max_connections: usize,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_secs: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

pub fn load() -> (Args, StrategySettings) {
    // Pastikan .env dibaca (CANDIDATES_FILE, FEED_MODE, dll ter-load)
    let _ = dotenv();
    let cli = Cli::parse();

    let candidates_file = cli
        .candidates_file
        .or_else(|| env::var("CANDIDATES_FILE").ok())
        .unwrap_or_else(|| "filtered_stocks.json".to_string());
    let credentials_file =
        env::var("CREDENTIALS_FILE").unwrap_or_else(|_| "broker_credentials.json".to_string());
    let record_file = cli.record_file.or_else(|| env::var("RECORD_FILE").ok());
    let metrics_port = cli.metrics_port.unwrap_or_else(|| env_parse("METRICS_PORT", 9898));

    let feed_mode = cli
        .feed_mode
        .as_deref()
        .and_then(MarketMode::parse_one)
        .unwrap_or_else(|| MarketMode::from_env("FEED_MODE", MarketMode::Mock));
    let venue_mode = cli
        .venue_mode
        .as_deref()
        .and_then(MarketMode::parse_one)
        .unwrap_or_else(|| MarketMode::from_env("VENUE_MODE", MarketMode::Mock));

    let rest_base =
        env::var("BROKER_REST_URL").unwrap_or_else(|_| "https://api.dhan.co/v2".to_string());
    let ws_base =
        env::var("BROKER_WS_URL").unwrap_or_else(|_| "wss://api-feed.dhan.co".to_string());
    let scrip_master_url = env::var("SCRIP_MASTER_URL")
        .unwrap_or_else(|_| "https://images.dhan.co/api-data/api-scrip-master.csv".to_string());

    let args = Args {
        candidates_file,
        credentials_file,
        record_file,
        metrics_port,
        feed_mode,
        venue_mode,
        rest_base,
        ws_base,
        scrip_master_url,
        max_requests_per_sec: env_parse("MAX_REQUESTS_PER_SEC", 1.0),
        max_connections: env_parse("MAX_CONNECTIONS", 5),
        max_reconnect_attempts: env_parse("MAX_RECONNECT_ATTEMPTS", 10),
        reconnect_base_secs: env_parse("RECONNECT_BASE_SECS", 5),
    };

    let settings = StrategySettings::default().normalized();
    (args, settings)
}

/// Satu record settings untuk seluruh proses. Di-replace utuh lewat watch
/// channel (single writer); pembaca selalu lihat versi konsisten.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StrategySettings {
    // Credentials
    pub client_id: String,
    pub access_token: String,

    // Ladder
    pub no_of_add_ons: u32,
    pub add_on_percentage: f64,
    pub initial_stop_loss_pct: f64,
    pub trailing_stop_loss_pct: f64,
    pub target_percentage: f64,

    // Selection
    pub max_ladder_stocks: u32,
    pub top_n_gainers: u32,
    pub top_n_losers: u32,
    pub min_turnover_crores: f64,
    pub max_open_gap_pct_long: f64,
    pub min_open_gap_pct_short: f64,

    // Bidirectional cycles
    pub cycles_per_stock: u32,

    // Risk
    pub trade_capital: f64,
    pub profit_target_per_stock: f64,
    pub loss_limit_per_stock: f64,
    pub global_profit_exit: f64,
    pub global_loss_exit: f64,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            access_token: String::new(),
            no_of_add_ons: 5,
            add_on_percentage: 0.5,
            initial_stop_loss_pct: 0.5,
            trailing_stop_loss_pct: 0.5,
            target_percentage: 2.0,
            max_ladder_stocks: 20,
            top_n_gainers: 10,
            top_n_losers: 10,
            min_turnover_crores: 1.0,
            max_open_gap_pct_long: 3.0,
            min_open_gap_pct_short: -3.0,
            cycles_per_stock: 3,
            trade_capital: 1000.0,
            profit_target_per_stock: 5000.0,
            loss_limit_per_stock: 2000.0,
            global_profit_exit: 25_000.0,
            global_loss_exit: 10_000.0,
        }
    }
}

impl StrategySettings {
    /// Clamp kombinasi tidak valid dari UI/file. Jangan percaya input mentah.
    pub fn normalized(mut self) -> Self {
        self.max_ladder_stocks = self.max_ladder_stocks.max(1);

        // top_n_gainers + top_n_losers tidak boleh melebihi max_ladder_stocks.
        // Gainers dipertahankan, losers dipangkas dulu.
        if self.top_n_gainers + self.top_n_losers > self.max_ladder_stocks {
            self.top_n_losers = self.max_ladder_stocks.saturating_sub(self.top_n_gainers);
            if self.top_n_losers == 0 && self.top_n_gainers > self.max_ladder_stocks {
                self.top_n_gainers = self.max_ladder_stocks;
            }
        }

        self.cycles_per_stock = self.cycles_per_stock.max(1);

        let defaults = StrategySettings::default();
        if self.add_on_percentage <= 0.0 {
            self.add_on_percentage = defaults.add_on_percentage;
        }
        if self.initial_stop_loss_pct <= 0.0 {
            self.initial_stop_loss_pct = defaults.initial_stop_loss_pct;
        }
        if self.trailing_stop_loss_pct <= 0.0 {
            self.trailing_stop_loss_pct = defaults.trailing_stop_loss_pct;
        }
        if self.target_percentage <= 0.0 {
            self.target_percentage = defaults.target_percentage;
        }
        if self.trade_capital <= 0.0 {
            self.trade_capital = defaults.trade_capital;
        }
        self
    }

    pub fn min_turnover(&self) -> f64 {
        // 1 crore = 1e7
        self.min_turnover_crores * 10_000_000.0
    }

    /// Versi aman untuk logging: token disensor.
    pub fn redacted(&self) -> StrategySettings {
        let mut s = self.clone();
        if !s.access_token.is_empty() {
            s.access_token = "***".to_string();
        }
        s
    }
}
