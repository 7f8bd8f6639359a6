// ===============================
// src/gateway.rs
// ===============================
//
// Seam broker session: trait + tipe bersama, plus MockSession untuk paper
// mode dan test (fill instan, tanpa network).
//
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::domain::{OrderKind, Side};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("scrip master parse error: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid session: {0}")]
    InvalidSession(String),
    #[error("broker rejected: {0}")]
    Broker(String),
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
    #[error("rate limit retries exhausted")]
    RateLimited,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: i64,
    pub kind: OrderKind,
}

/// Hasil terstruktur penempatan order. Kegagalan broker bukan panic dan
/// bukan stack trace — selalu pesan yang bisa dibaca manusia.
#[derive(Debug, Clone)]
pub struct OrderReply {
    pub success: bool,
    pub order_id: Option<String>,
    pub message: String,
}

impl OrderReply {
    pub fn ok(order_id: String) -> Self {
        Self { success: true, order_id: Some(order_id), message: "placed".to_string() }
    }
    pub fn failed(message: impl Into<String>) -> Self {
        Self { success: false, order_id: None, message: message.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Posisi apa adanya dari broker (pass-through untuk dashboard).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub net_qty: i64,
    pub buy_avg: f64,
    pub sell_avg: f64,
}

#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn place_order(&self, req: &OrderRequest) -> OrderReply;
    async fn fund_limits(&self) -> Result<f64, GatewayError>;
    async fn positions(&self) -> Result<Vec<BrokerPosition>, GatewayError>;
    async fn historical_daily(&self, symbol: &str, days: u32) -> Result<Vec<DailyBar>, GatewayError>;
}

/// Venue tiruan: semua order langsung dianggap placed, id berurutan.
/// Dipakai paper mode dan unit test engine.
pub struct MockSession {
    seq: AtomicU64,
}

impl MockSession {
    pub fn new() -> Self {
        Self { seq: AtomicU64::new(1) }
    }
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerSession for MockSession {
    async fn place_order(&self, req: &OrderRequest) -> OrderReply {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        tracing::info!(symbol = %req.symbol, side = req.side.as_str(), qty = req.quantity, "mock order placed");
        OrderReply::ok(format!("MOCK-{n}"))
    }

    async fn fund_limits(&self) -> Result<f64, GatewayError> {
        Ok(1_000_000.0)
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, GatewayError> {
        Ok(Vec::new())
    }

    async fn historical_daily(&self, _symbol: &str, days: u32) -> Result<Vec<DailyBar>, GatewayError> {
        // Bar sintetis datar; cukup untuk jalur paper mode
        Ok((0..days)
            .map(|i| DailyBar {
                date: format!("day-{i}"),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 10_000.0,
            })
            .collect())
    }
}
