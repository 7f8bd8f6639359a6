// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};

pub fn now_ns() -> i128 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as i128
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side { Buy, Sell }
impl Side {
    pub fn opposite(&self) -> Side { match self { Side::Buy => Side::Sell, Side::Sell => Side::Buy } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
}

/// Arah posisi per symbol. `None` = flat (tidak pegang posisi).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode { None, Long, Short }
impl Mode {
    /// +1 untuk long, -1 untuk short, 0 kalau flat. Dipakai rumus PnL.
    pub fn sign(&self) -> f64 { match self { Mode::Long => 1.0, Mode::Short => -1.0, Mode::None => 0.0 } }
    pub fn entry_side(&self) -> Side { match self { Mode::Short => Side::Sell, _ => Side::Buy } }
    pub fn flipped(&self) -> Mode { match self { Mode::Long => Mode::Short, Mode::Short => Mode::Long, Mode::None => Mode::None } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Idle,
    Active,
    ClosedProfit,
    Stopped,
    ClosedManual,
    ClosedGlobalLimit,
    ClosedEmergency,
}

impl PositionStatus {
    /// Terminal = posisi selesai untuk sesi ini; tick berikutnya di-skip.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PositionStatus::Idle | PositionStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind { Market, Limit }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus { Pending, Executed, Rejected, Cancelled }
impl OrderStatus {
    pub fn is_final(&self) -> bool { !matches!(self, OrderStatus::Pending) }
}

/// Event market data dari feed: security id sudah di-resolve ke symbol domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedEvent { pub ts_ns: i128, pub symbol: String, pub ltp: f64, pub volume: f64 }

/// Status satu symbol dalam universe. Dibuat saat start (IDLE), dimutasi
/// oleh tiap tick dan transisi, dan tetap hidup sampai sesi berakhir
/// walaupun sudah terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub mode: Mode,
    pub status: PositionStatus,

    // Market state
    pub ltp: f64,
    pub prev_close: f64,
    pub change_pct: f64,
    pub day_open: f64,
    pub open_gap_pct: f64,
    pub turnover: f64,

    // Ladder state
    pub ladder_level: u32,
    pub next_add_on: f64,
    pub stop_loss: f64,
    pub target: f64,
    pub high_watermark: f64,

    // Entry / PnL
    pub entry_price: f64,
    pub avg_entry_price: f64,
    pub quantity: i64,
    pub pnl: f64,

    // Bidirectional cycle budget
    pub cycle_index: u32,
    pub cycle_total: u32,
    pub cycle_start_mode: Mode,

    pub order_ids: Vec<String>,
}

impl Position {
    pub fn new(symbol: String, prev_close: f64) -> Self {
        Self {
            symbol,
            mode: Mode::None,
            status: PositionStatus::Idle,
            ltp: 0.0,
            prev_close,
            change_pct: 0.0,
            day_open: 0.0,
            open_gap_pct: 0.0,
            turnover: 0.0,
            ladder_level: 0,
            next_add_on: 0.0,
            stop_loss: 0.0,
            target: 0.0,
            high_watermark: 0.0,
            entry_price: 0.0,
            avg_entry_price: 0.0,
            quantity: 0,
            pnl: 0.0,
            cycle_index: 0,
            cycle_total: 0,
            cycle_start_mode: Mode::None,
            order_ids: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool { self.mode != Mode::None }
}

/// Snapshot ringkas untuk endpoint status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub connected: bool,
    pub running: bool,
    pub active_positions: usize,
    pub total_symbols: usize,
    pub global_pnl: f64,
    pub market_open: bool,
}

/// Snapshot lengkap yang dipush ke observer pasif (~2x per detik).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub ts_ns: i128,
    pub running: bool,
    pub trading_halted: bool,
    pub global_pnl: f64,
    pub positions: Vec<Position>,
}

// ---- Recorder events (JSONL) ----
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderNote { pub symbol: String, pub side: Side, pub qty: i64, pub order_id: String }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionNote { pub symbol: String, pub status: PositionStatus, pub reason: String }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event { Tick(FeedEvent), Ord(OrderNote), Transition(TransitionNote), Note(String) }
