// ===============================
// src/engine.rs
// ===============================
//
// Orkestrator ladder: pemilik map symbol -> posisi, ledger, gateway, dan
// settings. Tiga konteks eksekusi berbagi state ini (tick pump, control
// loop, perintah eksternal); mutasi per-symbol diserialisasi lewat satu
// tokio::Mutex per posisi, sehingga symbol lain tetap jalan independen.
//
// Lock discipline:
// - map posisi: RwLock, tidak pernah dipegang melewati .await
// - started_symbols: Mutex sinkron, reserve slot SEBELUM order entry,
//   rollback kalau order gagal (entry gagal tidak memakan jatah sesi)
// - ledger: mutex internal, hanya selama mutasi map
//
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use chrono::{FixedOffset, NaiveTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::StrategySettings;
use crate::domain::{
    now_ns, EngineSnapshot, EngineStatus, Event, FeedEvent, Mode, OrderKind, OrderNote, Position,
    PositionStatus, Side, TransitionNote,
};
use crate::gateway::{BrokerPosition, BrokerSession, GatewayError, OrderRequest};
use crate::ladder::{self, CycleSeed, Multipliers, TickAction};
use crate::ledger::OrderLedger;
use crate::metrics::{self, ACTIVE_POSITIONS, GLOBAL_PNL, ORDERS, SESSION_SYMBOLS};

const TICK_QUEUE: usize = 8192;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("broker not connected")]
    NotConnected,
    #[error("outside market hours")]
    MarketClosed,
    #[error("engine already running")]
    AlreadyRunning,
    #[error("candidates: {0}")]
    Candidates(#[from] crate::store::StoreError),
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
    #[error("no active position for {0}")]
    NoActivePosition(String),
    #[error("gateway: {0}")]
    Gateway(#[from] GatewayError),
}

/// Hasil start: universe yang dimuat + sender tick untuk feed adapter.
pub struct StartHandle {
    pub tick_tx: mpsc::Sender<FeedEvent>,
    pub universe: Vec<(String, f64)>,
}

enum SlotReservation {
    AlreadyStarted,
    Reserved,
    Refused,
}

pub struct LadderEngine {
    gateway: Arc<dyn BrokerSession>,
    ledger: OrderLedger,

    positions: RwLock<HashMap<String, Arc<Mutex<Position>>>>,
    started_symbols: StdMutex<HashSet<String>>,

    settings_tx: watch::Sender<StrategySettings>,
    settings_rx: watch::Receiver<StrategySettings>,

    running: AtomicBool,
    connected: AtomicBool,
    trading_halted: AtomicBool,
    squared_off: AtomicBool,
    ignore_market_hours: bool,

    candidates_file: String,
    global_pnl: StdMutex<f64>,

    snapshot_tx: watch::Sender<EngineSnapshot>,
    feed_shutdown_tx: watch::Sender<bool>,
    recorder_tx: Option<mpsc::Sender<Event>>,
}

impl LadderEngine {
    pub fn new(
        gateway: Arc<dyn BrokerSession>,
        settings: StrategySettings,
        candidates_file: String,
        ignore_market_hours: bool,
        recorder_tx: Option<mpsc::Sender<Event>>,
    ) -> Arc<Self> {
        let (settings_tx, settings_rx) = watch::channel(settings.normalized());
        let (snapshot_tx, _) = watch::channel(EngineSnapshot::default());
        let (feed_shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            gateway,
            ledger: OrderLedger::new(),
            positions: RwLock::new(HashMap::new()),
            started_symbols: StdMutex::new(HashSet::new()),
            settings_tx,
            settings_rx,
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            trading_halted: AtomicBool::new(false),
            squared_off: AtomicBool::new(false),
            ignore_market_hours,
            candidates_file,
            global_pnl: StdMutex::new(0.0),
            snapshot_tx,
            feed_shutdown_tx,
            recorder_tx,
        })
    }

    // ---- Control surface ----

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Settings di-replace utuh (copy-on-write); pembaca ambil snapshot
    /// konsisten dari watch channel.
    pub fn update_settings(&self, settings: StrategySettings) {
        let normalized = settings.normalized();
        info!(settings = ?normalized.redacted(), "settings updated");
        let _ = self.settings_tx.send(normalized);
    }

    pub fn settings(&self) -> StrategySettings {
        self.settings_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn feed_shutdown(&self) -> watch::Receiver<bool> {
        self.feed_shutdown_tx.subscribe()
    }

    pub fn metrics_snapshot(&self) -> metrics::MetricsSnapshot {
        metrics::snapshot(self.ledger.summary().success_rate)
    }

    pub fn status(&self) -> EngineStatus {
        let positions = self.positions.read().unwrap_or_else(|e| e.into_inner());
        let total_symbols = positions.len();
        drop(positions);
        EngineStatus {
            connected: self.connected.load(Ordering::SeqCst),
            running: self.is_running(),
            active_positions: ACTIVE_POSITIONS.get().max(0) as usize,
            total_symbols,
            global_pnl: *self.global_pnl.lock().unwrap_or_else(|e| e.into_inner()),
            market_open: self.market_open(),
        }
    }

    /// Listing posisi sisi broker, pass-through untuk dashboard.
    pub async fn broker_positions(&self) -> Result<Vec<BrokerPosition>, EngineError> {
        Ok(self.gateway.positions().await?)
    }

    pub async fn positions_snapshot(&self) -> Vec<Position> {
        let arcs: Vec<_> = {
            let map = self.positions.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(arcs.len());
        for arc in arcs {
            out.push(arc.lock().await.clone());
        }
        out
    }

    /// Jam pasar NSE: 09:15–15:30 IST (offset tetap +05:30).
    pub fn market_open(&self) -> bool {
        if self.ignore_market_hours {
            return true;
        }
        // IST = UTC+05:30 (offset tetap, tanpa DST)
        let Some(ist) = FixedOffset::east_opt(5 * 3600 + 30 * 60) else { return false };
        let now = Utc::now().with_timezone(&ist).time();
        let open = NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default();
        let close = NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default();
        now >= open && now <= close
    }

    // ---- Lifecycle ----

    /// Muat universe kandidat, inisialisasi posisi IDLE, nyalakan tick pump,
    /// control loop, dan snapshot push. Feed adapter disambungkan caller
    /// lewat `StartHandle.tick_tx`.
    pub async fn start_strategy(self: &Arc<Self>) -> Result<StartHandle, EngineError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(EngineError::NotConnected);
        }
        if self.is_running() {
            return Err(EngineError::AlreadyRunning);
        }
        if !self.market_open() {
            return Err(EngineError::MarketClosed);
        }

        let candidates = crate::store::load_candidates(&self.candidates_file)?;
        self.init_universe(&candidates);

        // Reset state per-sesi
        self.started_symbols.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.trading_halted.store(false, Ordering::SeqCst);
        self.squared_off.store(false, Ordering::SeqCst);
        // send_replace: nilai harus ter-update walau belum ada receiver
        self.feed_shutdown_tx.send_replace(false);
        self.running.store(true, Ordering::SeqCst);
        info!(symbols = candidates.len(), "strategy engine started");

        let (tick_tx, mut tick_rx) = mpsc::channel::<FeedEvent>(TICK_QUEUE);

        // Tick pump: satu konsumen; mutasi per-symbol tetap dijaga mutex
        // masing-masing posisi.
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(ev) = tick_rx.recv().await {
                if !engine.is_running() {
                    continue; // drain; feed berhenti lewat feed_shutdown
                }
                if let Some(rec) = &engine.recorder_tx {
                    let _ = rec.try_send(Event::Tick(ev.clone()));
                }
                engine.process_tick(ev).await;
            }
        });

        // Control loop 1 Hz
        let engine = self.clone();
        tokio::spawn(async move {
            let mut iv = interval(Duration::from_secs(1));
            iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                iv.tick().await;
                if !engine.is_running() {
                    break;
                }
                engine.run_control_pass().await;
            }
            info!("control loop stopped");
        });

        // Status push ~2 Hz ke observer pasif
        let engine = self.clone();
        tokio::spawn(async move {
            let mut iv = interval(Duration::from_millis(500));
            iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
            while engine.is_running() {
                iv.tick().await;
                engine.push_snapshot().await;
            }
            engine.push_snapshot().await;
        });

        let universe: Vec<(String, f64)> = candidates.into_iter().collect();
        Ok(StartHandle { tick_tx, universe })
    }

    fn init_universe(&self, candidates: &HashMap<String, f64>) {
        let mut map = self.positions.write().unwrap_or_else(|e| e.into_inner());
        map.clear();
        for (symbol, prev_close) in candidates {
            map.insert(
                symbol.clone(),
                Arc::new(Mutex::new(Position::new(symbol.clone(), *prev_close))),
            );
        }
    }

    /// Clear flag running; tick pump & control loop berhenti di iterasi
    /// berikutnya. Broker call yang sedang jalan tidak dibatalkan paksa.
    pub fn stop(&self) {
        info!("engine stop requested");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Matikan feed (reconnect loop ikut berhenti). Dipakai saat tutup pasar
    /// dan kill switch global.
    pub fn halt_feed(&self) {
        self.feed_shutdown_tx.send_replace(true);
    }

    // ---- Tick path ----

    fn position_arc(&self, symbol: &str) -> Option<Arc<Mutex<Position>>> {
        self.positions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(symbol)
            .cloned()
    }

    /// Satu-satunya pintu masuk tick. No-op kalau engine tidak running,
    /// symbol tidak dikenal, atau posisi sudah terminal.
    pub async fn process_tick(&self, ev: FeedEvent) {
        if !self.is_running() {
            return;
        }
        let Some(arc) = self.position_arc(&ev.symbol) else { return };
        let started = Instant::now();

        let mut pos = arc.lock().await;
        if pos.status.is_terminal() {
            return;
        }

        ladder::apply_market_tick(&mut pos, ev.ltp, ev.volume);

        let settings = self.settings();
        let mult = Multipliers::from_settings(&settings);

        if pos.is_open() {
            let avg = self.ledger.average_entry_price(&pos.symbol, pos.mode.entry_side());
            ladder::recompute_pnl(&mut pos, avg);

            // Kegagalan transisi satu symbol tidak boleh menjalar: semua
            // jalur eksekusi di bawah menangani error-nya sendiri.
            match ladder::evaluate(&pos, &settings) {
                Some(TickAction::CloseProfit) => {
                    self.close_leg(&mut pos, "Target hit", PositionStatus::ClosedProfit).await;
                }
                Some(TickAction::StopOut { flip }) => {
                    let seed = CycleSeed::Flip {
                        prev_index: pos.cycle_index,
                        total: pos.cycle_total,
                        start_mode: pos.cycle_start_mode,
                    };
                    let next_mode = pos.mode.flipped();
                    self.close_leg(&mut pos, "Stop loss hit", PositionStatus::Stopped).await;
                    if flip && !self.trading_halted.load(Ordering::SeqCst) {
                        self.start_ladder(&mut pos, next_mode, seed, &mult, &settings).await;
                    }
                }
                Some(TickAction::AddOn { qty }) => {
                    self.execute_add_on(&mut pos, qty, &mult).await;
                    ladder::tighten_trailing_stop(&mut pos, &mult);
                }
                None => ladder::tighten_trailing_stop(&mut pos, &mult),
            }

            // Cap PnL per-stock: tutup paksa berapapun level laddernya
            if pos.status == PositionStatus::Active
                && (pos.pnl >= settings.profit_target_per_stock
                    || pos.pnl <= -settings.loss_limit_per_stock)
            {
                self.close_leg(&mut pos, "Per-stock PnL cap", PositionStatus::ClosedGlobalLimit)
                    .await;
            }
        }

        metrics::record_tick_latency(started.elapsed().as_secs_f64() * 1000.0);
    }

    // ---- Order execution ----

    /// Tempatkan order lewat ledger + gateway dengan kebijakan retry ledger:
    /// rejected dicoba ulang sampai budget habis, lalu surfaced sebagai
    /// rejected (tidak pernah dibuang diam-diam).
    async fn place_tracked_order(
        &self,
        symbol: &str,
        side: Side,
        qty: i64,
        fill_price: f64,
    ) -> Option<String> {
        let rec = self.ledger.create_order(symbol, side, qty, OrderKind::Market);
        let mut order_id = rec.order_id.clone();
        let req = OrderRequest { symbol: symbol.to_string(), side, quantity: qty, kind: OrderKind::Market };

        loop {
            let started = Instant::now();
            let reply = self.gateway.place_order(&req).await;
            metrics::record_order_latency(started.elapsed().as_secs_f64() * 1000.0);

            if reply.success {
                if let Some(real_id) = reply.order_id {
                    self.ledger.replace_order_id(&order_id, &real_id);
                    order_id = real_id;
                }
                self.ledger.update_status(
                    &order_id,
                    crate::domain::OrderStatus::Executed,
                    fill_price,
                    qty,
                    "",
                );
                ORDERS.with_label_values(&["executed"]).inc();
                if let Some(rec_tx) = &self.recorder_tx {
                    let _ = rec_tx.try_send(Event::Ord(OrderNote {
                        symbol: symbol.to_string(),
                        side,
                        qty,
                        order_id: order_id.clone(),
                    }));
                }
                return Some(order_id);
            }

            self.ledger.update_status(
                &order_id,
                crate::domain::OrderStatus::Rejected,
                0.0,
                0,
                &reply.message,
            );
            if self.ledger.should_retry(&order_id) {
                self.ledger.mark_retry(&order_id);
                warn!(symbol, message = %reply.message, "order rejected, retrying");
                continue;
            }
            ORDERS.with_label_values(&["rejected"]).inc();
            error!(symbol, message = %reply.message, "order rejected, retries exhausted");
            return None;
        }
    }

    fn try_reserve_session_slot(&self, symbol: &str, max_ladder_stocks: u32) -> SlotReservation {
        let mut set = self.started_symbols.lock().unwrap_or_else(|e| e.into_inner());
        if set.contains(symbol) {
            return SlotReservation::AlreadyStarted;
        }
        if set.len() >= max_ladder_stocks as usize {
            return SlotReservation::Refused;
        }
        set.insert(symbol.to_string());
        SESSION_SYMBOLS.set(set.len() as i64);
        SlotReservation::Reserved
    }

    fn release_session_slot(&self, symbol: &str) {
        let mut set = self.started_symbols.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(symbol);
        SESSION_SYMBOLS.set(set.len() as i64);
    }

    /// Mulai leg ladder (entry baru atau flip). Caller memegang lock posisi.
    async fn start_ladder(
        &self,
        pos: &mut Position,
        mode: Mode,
        seed: CycleSeed,
        mult: &Multipliers,
        settings: &StrategySettings,
    ) {
        if pos.ltp <= 0.0 || mode == Mode::None {
            return;
        }

        // Cap symbol unik per sesi: slot direservasi dulu supaya dua entry
        // paralel tidak sama-sama lolos cek (check-then-act).
        let reservation = self.try_reserve_session_slot(&pos.symbol, settings.max_ladder_stocks);
        if matches!(reservation, SlotReservation::Refused) {
            info!(symbol = %pos.symbol, max = settings.max_ladder_stocks, "skip entry: max ladder stocks reached");
            return;
        }

        let qty = ladder::trade_qty(settings.trade_capital, pos.ltp);
        let side = mode.entry_side();
        info!(symbol = %pos.symbol, ?mode, qty, ltp = pos.ltp, "starting ladder leg");

        match self.place_tracked_order(&pos.symbol, side, qty, pos.ltp).await {
            Some(order_id) => {
                ladder::apply_entry_fill(pos, mode, pos.ltp, qty, mult, settings, seed);
                pos.order_ids.push(order_id);
                self.record_transition(pos, "ladder leg started");
            }
            None => {
                // Entry gagal: symbol tetap IDLE dan slot sesi dikembalikan
                if matches!(reservation, SlotReservation::Reserved) {
                    self.release_session_slot(&pos.symbol);
                }
                warn!(symbol = %pos.symbol, ?mode, "entry order failed, leaving symbol idle");
            }
        }
    }

    async fn execute_add_on(&self, pos: &mut Position, qty: i64, mult: &Multipliers) {
        let side = pos.mode.entry_side();
        info!(symbol = %pos.symbol, level = pos.ladder_level + 1, qty, "executing add-on");
        if let Some(order_id) = self.place_tracked_order(&pos.symbol, side, qty, pos.ltp).await {
            let fill = pos.ltp;
            ladder::apply_add_on_fill(pos, fill, qty, mult);
            pos.order_ids.push(order_id);
        }
        // add-on gagal: level tidak naik, trigger tidak bergeser — dicoba
        // lagi di tick berikutnya selama harga masih di atas trigger
    }

    /// Tutup leg aktif: order keluar, ledger dibersihkan, status diset.
    /// Posisi selalu berakhir flat meskipun order keluar gagal (biar tidak
    /// wedged); kegagalan tercatat di ledger sebelum dibersihkan dan di log.
    async fn close_leg(&self, pos: &mut Position, reason: &str, status: PositionStatus) {
        info!(symbol = %pos.symbol, reason, ?status, pnl = pos.pnl, "closing position");

        if pos.quantity > 0 {
            let side = pos.mode.entry_side().opposite();
            if self
                .place_tracked_order(&pos.symbol, side, pos.quantity, pos.ltp)
                .await
                .is_none()
            {
                error!(symbol = %pos.symbol, "exit order failed; position marked flat, reconcile with broker positions");
            }
        }

        self.ledger.clear_symbol(&pos.symbol);
        ladder::mark_flat(pos);
        pos.status = status;
        pos.order_ids.clear();
        self.record_transition(pos, reason);
    }

    fn record_transition(&self, pos: &Position, reason: &str) {
        if let Some(rec_tx) = &self.recorder_tx {
            let _ = rec_tx.try_send(Event::Transition(TransitionNote {
                symbol: pos.symbol.clone(),
                status: pos.status,
                reason: reason.to_string(),
            }));
        }
    }

    // ---- Control loop ----

    /// Satu iterasi control loop: agregat PnL, kill switch global, selection
    /// pass, dan square-off setelah jam pasar.
    pub async fn run_control_pass(&self) {
        let settings = self.settings();
        let (total_pnl, active) = self.aggregate_pnl().await;
        *self.global_pnl.lock().unwrap_or_else(|e| e.into_inner()) = total_pnl;
        GLOBAL_PNL.set(total_pnl.round() as i64);
        ACTIVE_POSITIONS.set(active as i64);

        let halted = self.trading_halted.load(Ordering::SeqCst);
        if !halted
            && (total_pnl >= settings.global_profit_exit
                || total_pnl <= -settings.global_loss_exit)
        {
            warn!(total_pnl, "global PnL kill switch tripped — squaring off and halting");
            self.trading_halted.store(true, Ordering::SeqCst);
            self.square_off_all(PositionStatus::ClosedGlobalLimit, "Global PnL limit").await;
            self.halt_feed();
        } else if !halted {
            self.select_top_movers().await;
        }

        if !self.market_open() && self.is_running() && !self.squared_off.swap(true, Ordering::SeqCst) {
            info!("market closed — auto square-off and feed halt");
            self.square_off_all(PositionStatus::ClosedEmergency, "Market close square-off").await;
            self.halt_feed();
            self.running.store(false, Ordering::SeqCst);
        }
    }

    async fn aggregate_pnl(&self) -> (f64, usize) {
        let arcs: Vec<_> = {
            let map = self.positions.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        let mut total = 0.0;
        let mut active = 0usize;
        for arc in arcs {
            let pos = arc.lock().await;
            total += pos.pnl;
            if pos.is_open() {
                active += 1;
            }
        }
        (total, active)
    }

    /// Selection pass: ranking idle symbol dan aktivasi top movers di bawah
    /// semua ceiling kapasitas. Skip = normal, bukan error.
    pub async fn select_top_movers(&self) {
        let settings = self.settings();
        let max_ladders = settings.max_ladder_stocks as usize;

        let started = self.started_symbols.lock().unwrap_or_else(|e| e.into_inner()).len();
        if started >= max_ladders {
            return;
        }

        let arcs: Vec<_> = {
            let map = self.positions.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };

        let mut active_longs = 0usize;
        let mut active_shorts = 0usize;
        // (symbol, change_pct) kandidat idle yang lolos filter kelayakan
        let mut long_candidates: Vec<(Arc<Mutex<Position>>, f64)> = Vec::new();
        let mut short_candidates: Vec<(Arc<Mutex<Position>>, f64)> = Vec::new();
        let min_turnover = settings.min_turnover();

        for arc in &arcs {
            let pos = arc.lock().await;
            if pos.is_open() {
                match pos.mode {
                    Mode::Long => active_longs += 1,
                    Mode::Short => active_shorts += 1,
                    Mode::None => {}
                }
                continue;
            }
            if pos.status != PositionStatus::Idle || pos.ltp <= 0.0 || pos.turnover < min_turnover {
                continue;
            }
            // Band gap pembukaan: symbol yang sudah gap melewati batas entry
            // tidak pernah diaktifkan walaupun ranking teratas
            if pos.change_pct > 0.0 && pos.open_gap_pct <= settings.max_open_gap_pct_long {
                long_candidates.push((arc.clone(), pos.change_pct));
            } else if pos.change_pct < 0.0 && pos.open_gap_pct >= settings.min_open_gap_pct_short {
                short_candidates.push((arc.clone(), pos.change_pct));
            }
        }

        let active_total = active_longs + active_shorts;
        if active_total >= max_ladders {
            return;
        }

        let mut need_longs =
            (settings.top_n_gainers as usize).saturating_sub(active_longs);
        let mut need_shorts =
            (settings.top_n_losers as usize).saturating_sub(active_shorts);

        // Clip ke sisa kapasitas; long diprioritaskan saat rebutan
        let remaining = max_ladders - active_total;
        if need_longs + need_shorts > remaining {
            need_longs = need_longs.min(remaining);
            need_shorts = need_shorts.min(remaining - need_longs);
        }
        if need_longs == 0 && need_shorts == 0 {
            return;
        }

        // Ranking %change; tie persis mengikuti urutan iterasi (diterima,
        // terdokumentasi)
        long_candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        short_candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mult = Multipliers::from_settings(&settings);

        for (arc, change) in long_candidates.into_iter().take(need_longs) {
            let mut pos = arc.lock().await;
            // re-check setelah ambil lock: tick path bisa saja mendahului
            if pos.status != PositionStatus::Idle {
                continue;
            }
            info!(symbol = %pos.symbol, change_pct = change, "activating LONG");
            self.start_ladder(&mut pos, Mode::Long, CycleSeed::Fresh, &mult, &settings).await;
        }
        for (arc, change) in short_candidates.into_iter().take(need_shorts) {
            let mut pos = arc.lock().await;
            if pos.status != PositionStatus::Idle {
                continue;
            }
            info!(symbol = %pos.symbol, change_pct = change, "activating SHORT");
            self.start_ladder(&mut pos, Mode::Short, CycleSeed::Fresh, &mult, &settings).await;
        }
    }

    // ---- External commands ----

    /// Square-off semua posisi terbuka. Error satu symbol tidak menghentikan
    /// symbol lain.
    pub async fn square_off_all(&self, status: PositionStatus, reason: &str) {
        warn!(reason, "square off all triggered");
        let arcs: Vec<_> = {
            let map = self.positions.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        for arc in arcs {
            let mut pos = arc.lock().await;
            if pos.is_open() {
                self.close_leg(&mut pos, reason, status).await;
            }
        }
        info!("all positions squared off");
    }

    /// Tutup manual satu symbol dari control surface.
    pub async fn close_symbol(&self, symbol: &str) -> Result<(), EngineError> {
        let arc = self
            .position_arc(symbol)
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.to_string()))?;
        let mut pos = arc.lock().await;
        if !pos.is_open() {
            return Err(EngineError::NoActivePosition(symbol.to_string()));
        }
        self.close_leg(&mut pos, "Manual close", PositionStatus::ClosedManual).await;
        Ok(())
    }

    async fn push_snapshot(&self) {
        let global_pnl = *self.global_pnl.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = EngineSnapshot {
            ts_ns: now_ns(),
            running: self.is_running(),
            trading_halted: self.trading_halted.load(Ordering::SeqCst),
            global_pnl,
            positions: self.positions_snapshot().await,
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{DailyBar, MockSession, OrderReply};
    use async_trait::async_trait;

    /// Broker yang selalu menolak order — untuk jalur entry gagal.
    struct RejectingSession;

    #[async_trait]
    impl BrokerSession for RejectingSession {
        async fn place_order(&self, _req: &OrderRequest) -> OrderReply {
            OrderReply::failed("RMS rejection")
        }
        async fn fund_limits(&self) -> Result<f64, GatewayError> {
            Ok(0.0)
        }
        async fn positions(&self) -> Result<Vec<BrokerPosition>, GatewayError> {
            Ok(Vec::new())
        }
        async fn historical_daily(&self, _s: &str, _d: u32) -> Result<Vec<DailyBar>, GatewayError> {
            Ok(Vec::new())
        }
    }

    fn test_settings() -> StrategySettings {
        StrategySettings {
            min_turnover_crores: 1.0,
            ..Default::default()
        }
    }

    fn engine_with(settings: StrategySettings, gateway: Arc<dyn BrokerSession>) -> Arc<LadderEngine> {
        let engine = LadderEngine::new(gateway, settings, "unused.json".to_string(), true, None);
        engine.set_connected(true);
        engine.running.store(true, Ordering::SeqCst);
        engine
    }

    fn mock_engine(settings: StrategySettings) -> Arc<LadderEngine> {
        engine_with(settings, Arc::new(MockSession::new()))
    }

    fn seed(engine: &LadderEngine, symbols: &[(&str, f64)]) {
        let candidates: HashMap<String, f64> =
            symbols.iter().map(|(s, pc)| (s.to_string(), *pc)).collect();
        engine.init_universe(&candidates);
    }

    async fn tick(engine: &LadderEngine, symbol: &str, ltp: f64, volume: f64) {
        engine
            .process_tick(FeedEvent { ts_ns: 0, symbol: symbol.to_string(), ltp, volume })
            .await;
    }

    async fn pos_of(engine: &LadderEngine, symbol: &str) -> Position {
        engine.position_arc(symbol).unwrap().lock().await.clone()
    }

    // 2 Cr turnover dengan sekali tick: volume * ltp >= 1 Cr minimum
    const VOL: f64 = 1_000_000.0;

    #[tokio::test]
    async fn repeated_selection_activates_exactly_top_n_distinct_symbols() {
        let engine = mock_engine(StrategySettings {
            max_ladder_stocks: 20,
            top_n_gainers: 10,
            top_n_losers: 10,
            ..test_settings()
        });

        let symbols: Vec<(String, f64)> =
            (0..60).map(|i| (format!("G{i:02}"), 100.0)).collect();
        let refs: Vec<(&str, f64)> = symbols.iter().map(|(s, pc)| (s.as_str(), *pc)).collect();
        seed(&engine, &refs);

        // Tick pembuka kecil dulu (gap dalam band), lalu rally: 60 gainer
        // eligible dengan %change menurun
        for (i, (sym, _)) in symbols.iter().enumerate() {
            tick(&engine, sym, 100.5, VOL).await;
            tick(&engine, sym, 105.0 - i as f64 * 0.01, VOL).await;
        }

        for _ in 0..5 {
            engine.select_top_movers().await;
        }

        let snapshot = engine.positions_snapshot().await;
        let active: Vec<_> = snapshot.iter().filter(|p| p.is_open()).collect();
        assert_eq!(active.len(), 10, "exactly top_n_gainers distinct symbols");
        assert!(active.iter().all(|p| p.mode == Mode::Long));
        assert_eq!(
            engine.started_symbols.lock().unwrap().len(),
            10,
            "session set matches activations"
        );
    }

    #[tokio::test]
    async fn gap_filter_excludes_runaway_gainer_even_if_ranked_first() {
        let engine = mock_engine(StrategySettings {
            top_n_gainers: 1,
            top_n_losers: 1,
            max_open_gap_pct_long: 3.0,
            min_open_gap_pct_short: -3.0,
            ..test_settings()
        });
        seed(
            &engine,
            &[("GAPBAD", 100.0), ("GAPOK", 100.0), ("LOSBAD", 100.0), ("LOSOK", 100.0)],
        );

        // Tick pertama menetapkan day_open -> gap
        tick(&engine, "GAPBAD", 105.0, VOL).await; // gap +5%, change +5% (rank 1)
        tick(&engine, "GAPOK", 102.0, VOL).await; // gap +2%
        tick(&engine, "LOSBAD", 95.0, VOL).await; // gap -5%
        tick(&engine, "LOSOK", 98.5, VOL).await; // gap -1.5%

        engine.select_top_movers().await;

        assert_eq!(pos_of(&engine, "GAPBAD").await.status, PositionStatus::Idle);
        assert_eq!(pos_of(&engine, "GAPOK").await.mode, Mode::Long);
        assert_eq!(pos_of(&engine, "LOSBAD").await.status, PositionStatus::Idle);
        assert_eq!(pos_of(&engine, "LOSOK").await.mode, Mode::Short);
    }

    #[tokio::test]
    async fn turnover_filter_gates_eligibility() {
        let engine = mock_engine(StrategySettings { top_n_gainers: 2, ..test_settings() });
        seed(&engine, &[("LIQ", 100.0), ("ILLIQ", 100.0)]);

        tick(&engine, "LIQ", 102.0, VOL).await;
        tick(&engine, "ILLIQ", 103.0, 100.0).await; // turnover jauh di bawah 1 Cr

        engine.select_top_movers().await;
        assert_eq!(pos_of(&engine, "LIQ").await.mode, Mode::Long);
        assert_eq!(pos_of(&engine, "ILLIQ").await.status, PositionStatus::Idle);
    }

    #[tokio::test]
    async fn session_cap_blocks_new_symbols_even_when_capacity_frees_up() {
        let engine = mock_engine(StrategySettings {
            max_ladder_stocks: 5,
            top_n_gainers: 3,
            top_n_losers: 2,
            ..test_settings()
        });
        seed(&engine, &[("X1", 100.0)]);
        {
            let mut set = engine.started_symbols.lock().unwrap();
            for s in ["A", "B", "C", "D", "E"] {
                set.insert(s.to_string());
            }
        }

        tick(&engine, "X1", 102.0, VOL).await;
        engine.select_top_movers().await;
        assert_eq!(pos_of(&engine, "X1").await.status, PositionStatus::Idle);
    }

    #[tokio::test]
    async fn three_stop_outs_flip_twice_then_terminal() {
        let engine = mock_engine(StrategySettings {
            top_n_gainers: 1,
            top_n_losers: 0,
            cycles_per_stock: 3,
            ..test_settings()
        });
        seed(&engine, &[("TST", 99.0)]);

        tick(&engine, "TST", 100.0, VOL).await; // change +1.01%
        engine.select_top_movers().await;
        let p = pos_of(&engine, "TST").await;
        assert_eq!(p.mode, Mode::Long);
        assert_eq!(p.cycle_index, 1);

        // Stop-out 1: flip ke short
        tick(&engine, "TST", 99.4, VOL).await;
        let p = pos_of(&engine, "TST").await;
        assert_eq!(p.mode, Mode::Short);
        assert_eq!(p.status, PositionStatus::Active);
        assert_eq!(p.cycle_index, 2);
        assert_eq!(p.cycle_start_mode, Mode::Long);

        // Stop-out 2: flip balik ke long (SL short = 99.4 * 1.005 ≈ 99.897)
        tick(&engine, "TST", 100.0, VOL).await;
        let p = pos_of(&engine, "TST").await;
        assert_eq!(p.mode, Mode::Long);
        assert_eq!(p.cycle_index, 3);

        // Stop-out 3: budget cycle habis -> terminal
        tick(&engine, "TST", 99.4, VOL).await;
        let p = pos_of(&engine, "TST").await;
        assert_eq!(p.status, PositionStatus::Stopped);
        assert_eq!(p.mode, Mode::None);
        assert_eq!(p.quantity, 0);

        // Terminal: tick berikutnya tidak menghidupkan lagi
        tick(&engine, "TST", 150.0, VOL).await;
        assert_eq!(pos_of(&engine, "TST").await.status, PositionStatus::Stopped);
    }

    #[tokio::test]
    async fn target_hit_is_terminal_closed_profit() {
        let engine = mock_engine(StrategySettings { top_n_gainers: 1, ..test_settings() });
        seed(&engine, &[("TGT", 99.0)]);
        tick(&engine, "TGT", 100.0, VOL).await;
        engine.select_top_movers().await;

        tick(&engine, "TGT", 102.1, VOL).await; // target = 102
        let p = pos_of(&engine, "TGT").await;
        assert_eq!(p.status, PositionStatus::ClosedProfit);
        assert_eq!(p.quantity, 0);
    }

    #[tokio::test]
    async fn add_on_pyramids_and_pnl_uses_ledger_vwap() {
        let engine = mock_engine(StrategySettings { top_n_gainers: 1, ..test_settings() });
        seed(&engine, &[("PYR", 99.0)]);
        tick(&engine, "PYR", 100.0, VOL).await;
        engine.select_top_movers().await;

        // lewati trigger add-on (entry * 1.005)
        tick(&engine, "PYR", 100.51, VOL).await;
        let p = pos_of(&engine, "PYR").await;
        assert_eq!(p.ladder_level, 2);
        assert_eq!(p.quantity, 20);
        assert!((p.next_add_on - 100.51 * 1.005).abs() < 1e-9);

        // VWAP = (100*10 + 100.51*10) / 20 = 100.255
        tick(&engine, "PYR", 100.6, VOL).await;
        let p = pos_of(&engine, "PYR").await;
        assert!((p.avg_entry_price - 100.255).abs() < 1e-9);
        assert!((p.pnl - (100.6 - 100.255) * 20.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn per_stock_loss_cap_forces_close_regardless_of_ladder() {
        let engine = mock_engine(StrategySettings {
            top_n_gainers: 1,
            trade_capital: 100_000.0,
            loss_limit_per_stock: 8000.0,
            ..test_settings()
        });
        seed(&engine, &[("CAP", 99.0)]);
        tick(&engine, "CAP", 100.0, VOL).await;
        engine.select_top_movers().await;
        assert_eq!(pos_of(&engine, "CAP").await.quantity, 1000);

        // Lumpuhkan SL/target supaya hanya cap PnL yang bisa menutup
        {
            let arc = engine.position_arc("CAP").unwrap();
            let mut p = arc.lock().await;
            p.stop_loss = 0.0;
            p.target = f64::MAX;
        }

        tick(&engine, "CAP", 91.9, VOL).await; // pnl = -8100
        let p = pos_of(&engine, "CAP").await;
        assert_eq!(p.status, PositionStatus::ClosedGlobalLimit);
        assert_eq!(p.quantity, 0);
    }

    #[tokio::test]
    async fn failed_entry_leaves_symbol_idle_and_frees_slot() {
        let engine = engine_with(
            StrategySettings { top_n_gainers: 1, ..test_settings() },
            Arc::new(RejectingSession),
        );
        seed(&engine, &[("REJ", 99.0)]);
        tick(&engine, "REJ", 100.0, VOL).await;
        engine.select_top_movers().await;

        let p = pos_of(&engine, "REJ").await;
        assert_eq!(p.status, PositionStatus::Idle);
        assert_eq!(p.quantity, 0);
        assert!(engine.started_symbols.lock().unwrap().is_empty(), "failed entry consumes no slot");
        // rejected + retries tercatat di ledger summary
        assert!(engine.ledger.summary().rejected >= 1);
    }

    #[tokio::test]
    async fn manual_close_and_square_off_statuses() {
        let engine = mock_engine(StrategySettings {
            top_n_gainers: 2,
            ..test_settings()
        });
        seed(&engine, &[("M1", 99.0), ("M2", 99.0)]);
        tick(&engine, "M1", 100.0, VOL).await;
        tick(&engine, "M2", 100.0, VOL).await;
        engine.select_top_movers().await;

        engine.close_symbol("M1").await.unwrap();
        assert_eq!(pos_of(&engine, "M1").await.status, PositionStatus::ClosedManual);

        engine.square_off_all(PositionStatus::ClosedEmergency, "test").await;
        assert_eq!(pos_of(&engine, "M2").await.status, PositionStatus::ClosedEmergency);

        // unknown & sudah flat -> error terstruktur
        assert!(matches!(
            engine.close_symbol("NOPE").await,
            Err(EngineError::UnknownSymbol(_))
        ));
        assert!(matches!(
            engine.close_symbol("M1").await,
            Err(EngineError::NoActivePosition(_))
        ));
    }

    #[tokio::test]
    async fn global_kill_switch_squares_off_and_halts_trading() {
        let engine = mock_engine(StrategySettings {
            top_n_gainers: 1,
            global_profit_exit: 8000.0,
            ..test_settings()
        });
        seed(&engine, &[("GKS", 99.0), ("IDLE", 99.0)]);
        tick(&engine, "GKS", 100.0, VOL).await;
        engine.select_top_movers().await;

        {
            let arc = engine.position_arc("GKS").unwrap();
            arc.lock().await.pnl = 9000.0;
        }
        engine.run_control_pass().await;

        assert!(engine.trading_halted.load(Ordering::SeqCst));
        assert_eq!(pos_of(&engine, "GKS").await.status, PositionStatus::ClosedGlobalLimit);

        // Setelah halt, selection tidak mengaktifkan symbol baru
        tick(&engine, "IDLE", 101.0, VOL).await;
        engine.run_control_pass().await;
        assert_eq!(pos_of(&engine, "IDLE").await.status, PositionStatus::Idle);
    }

    #[tokio::test]
    async fn quantity_mode_invariant_holds_across_lifecycle() {
        let engine = mock_engine(StrategySettings {
            top_n_gainers: 2,
            top_n_losers: 1,
            ..test_settings()
        });
        seed(&engine, &[("I1", 99.0), ("I2", 101.0), ("I3", 99.0)]);
        tick(&engine, "I1", 100.0, VOL).await;
        tick(&engine, "I2", 100.0, VOL).await; // loser
        tick(&engine, "I3", 100.5, VOL).await;
        engine.select_top_movers().await;
        tick(&engine, "I1", 99.4, VOL).await; // stop + flip

        for p in engine.positions_snapshot().await {
            assert_eq!(p.is_open(), p.quantity > 0, "invariant broken for {}", p.symbol);
        }
    }

    #[tokio::test]
    async fn ticks_ignored_when_not_running_or_unknown() {
        let engine = mock_engine(test_settings());
        seed(&engine, &[("KNOWN", 100.0)]);

        tick(&engine, "UNKNOWN", 100.0, VOL).await; // tidak panik, tidak efek

        engine.running.store(false, Ordering::SeqCst);
        tick(&engine, "KNOWN", 105.0, VOL).await;
        assert_eq!(pos_of(&engine, "KNOWN").await.ltp, 0.0, "tick skipped while stopped");
    }

    #[tokio::test]
    async fn status_push_carries_full_position_fields() {
        let engine = mock_engine(StrategySettings { top_n_gainers: 1, ..test_settings() });
        seed(&engine, &[("PSH", 99.0)]);
        tick(&engine, "PSH", 100.0, VOL).await;
        engine.select_top_movers().await;

        let rx = engine.subscribe_status();
        engine.push_snapshot().await;
        let snap = rx.borrow().clone();
        assert!(snap.running);
        assert_eq!(snap.positions.len(), 1);
        let p = &snap.positions[0];
        assert_eq!(p.mode, Mode::Long);
        assert!(p.stop_loss > 0.0 && p.target > p.stop_loss);
    }

    #[tokio::test]
    async fn broker_positions_pass_through() {
        let engine = mock_engine(test_settings());
        assert!(engine.broker_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_strategy_refuses_when_disconnected() {
        let engine = LadderEngine::new(
            Arc::new(MockSession::new()),
            test_settings(),
            "does_not_exist.json".to_string(),
            true,
            None,
        );
        assert!(matches!(engine.start_strategy().await, Err(EngineError::NotConnected)));
    }
}
