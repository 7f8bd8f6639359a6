// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::thread;
use std::time::Instant;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Feed --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "market data ticks").unwrap());

pub static TICKS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("ticks_dropped_total", "ticks dropped because engine queue was full").unwrap()
});

pub static FEED_CONNECTED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("feed_connected", "1 if market feed ws connected").unwrap());

pub static FEED_RECONNECTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("feed_reconnects_total", "market feed reconnect attempts").unwrap());

// -------- Orders / positions --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "orders by final status"),
        &["status"],
    )
    .unwrap()
});

pub static ACTIVE_POSITIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("active_positions", "open ladder positions").unwrap());

pub static SESSION_SYMBOLS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("session_symbols", "distinct symbols started this session").unwrap()
});

pub static GLOBAL_PNL: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("global_pnl", "aggregate PnL, rounded to whole currency").unwrap());

// -------- Latency --------
pub static TICK_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("tick_latency_ms", "per-tick processing latency (ms)")
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 50.0, 100.0]),
    )
    .unwrap()
});

pub static ORDER_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("order_latency_ms", "order round-trip latency (ms)")
            .buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]),
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_MODE: Lazy<prometheus::IntGaugeVec> = Lazy::new(|| {
    prometheus::IntGaugeVec::new(
        Opts::new("config_mode", "feed/venue mode (labels: role, mode)"),
        &["role", "mode"],
    )
    .unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICKS_DROPPED.clone())),
        REGISTRY.register(Box::new(FEED_CONNECTED.clone())),
        REGISTRY.register(Box::new(FEED_RECONNECTS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(ACTIVE_POSITIONS.clone())),
        REGISTRY.register(Box::new(SESSION_SYMBOLS.clone())),
        REGISTRY.register(Box::new(GLOBAL_PNL.clone())),
        REGISTRY.register(Box::new(TICK_LATENCY_MS.clone())),
        REGISTRY.register(Box::new(ORDER_LATENCY_MS.clone())),
        REGISTRY.register(Box::new(CONFIG_MODE.clone())),
    ] {
        let _ = m;
    }
}

// -------- Latency stats untuk snapshot read-only (min/avg/max) --------
// Prometheus histogram tidak menyimpan min/max, jadi dicatat terpisah.

#[derive(Debug, Default)]
struct LatencyAcc {
    count: u64,
    sum_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

impl LatencyAcc {
    fn record(&mut self, ms: f64) {
        if self.count == 0 || ms < self.min_ms {
            self.min_ms = ms;
        }
        if ms > self.max_ms {
            self.max_ms = ms;
        }
        self.count += 1;
        self.sum_ms += ms;
    }

    fn report(&self) -> LatencyReport {
        LatencyReport {
            count: self.count,
            avg_ms: if self.count > 0 { self.sum_ms / self.count as f64 } else { 0.0 },
            min_ms: self.min_ms,
            max_ms: self.max_ms,
        }
    }
}

static TICK_ACC: Lazy<Mutex<LatencyAcc>> = Lazy::new(|| Mutex::new(LatencyAcc::default()));
static ORDER_ACC: Lazy<Mutex<LatencyAcc>> = Lazy::new(|| Mutex::new(LatencyAcc::default()));
static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

pub fn record_tick_latency(ms: f64) {
    TICK_LATENCY_MS.observe(ms);
    TICK_ACC.lock().unwrap_or_else(|e| e.into_inner()).record(ms);
}

pub fn record_order_latency(ms: f64) {
    ORDER_LATENCY_MS.observe(ms);
    ORDER_ACC.lock().unwrap_or_else(|e| e.into_inner()).record(ms);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyReport {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tick_latency: LatencyReport,
    pub order_latency: LatencyReport,
    pub order_success_rate: f64,
    pub uptime_seconds: u64,
}

/// Snapshot read-only untuk control surface; success rate diambil dari
/// summary ledger oleh pemanggil.
pub fn snapshot(order_success_rate: f64) -> MetricsSnapshot {
    MetricsSnapshot {
        tick_latency: TICK_ACC.lock().unwrap_or_else(|e| e.into_inner()).report(),
        order_latency: ORDER_ACC.lock().unwrap_or_else(|e| e.into_inner()).report(),
        order_success_rate,
        uptime_seconds: STARTED_AT.elapsed().as_secs(),
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, ?e, "metrics bind failed, metrics endpoint disabled");
                return;
            }
        };
        tracing::info!(%addr, "metrics listening");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}
