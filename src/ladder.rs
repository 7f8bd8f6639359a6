// ===============================
// src/ladder.rs
// ===============================
//
// Logika keputusan per-tick untuk satu posisi ladder — murni, tanpa broker
// dan tanpa I/O, supaya bisa diuji berdiri sendiri. Engine yang mengeksekusi
// aksi hasil evaluasi (order, ledger, transisi status).
//
// Urutan evaluasi long (short = cermin terbalik harga):
// 1. target tercapai          -> CloseProfit (terminal)
// 2. stop loss tersentuh      -> StopOut; flip kalau budget cycle masih ada
// 3. trigger add-on terlewati -> AddOn (pyramiding)
// 4. (setelahnya) trailing stop diketatkan dari high watermark
//
use crate::config::StrategySettings;
use crate::domain::{Mode, Position};

/// Multiplier persentase di-precompute sekali per update settings.
#[derive(Debug, Clone, Copy)]
pub struct Multipliers {
    pub add_on: f64,
    pub init_sl: f64,
    pub tsl: f64,
    pub target: f64,
}

impl Multipliers {
    pub fn from_settings(s: &StrategySettings) -> Self {
        Self {
            add_on: s.add_on_percentage / 100.0,
            init_sl: s.initial_stop_loss_pct / 100.0,
            tsl: s.trailing_stop_loss_pct / 100.0,
            target: s.target_percentage / 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Target tercapai: tutup, CLOSED_PROFIT, terminal.
    CloseProfit,
    /// Stop loss: tutup leg ini; `flip` true kalau masih boleh balik arah.
    StopOut { flip: bool },
    /// Tambah posisi di level berikutnya.
    AddOn { qty: i64 },
}

/// Qty = max(1, floor(modal_per_trade / harga)). Harga tidak valid -> 1 lot.
pub fn trade_qty(trade_capital: f64, price: f64) -> i64 {
    if price > 0.0 {
        ((trade_capital / price).floor() as i64).max(1)
    } else {
        1
    }
}

/// Update field market dari tick: ltp, turnover, %change, gap pembukaan.
/// Tick pertama hari ini menetapkan day_open (dan open gap).
pub fn apply_market_tick(pos: &mut Position, ltp: f64, volume: f64) {
    pos.ltp = ltp;
    if volume > 0.0 {
        pos.turnover = volume * ltp;
    }
    if pos.day_open == 0.0 && ltp > 0.0 {
        pos.day_open = ltp;
        if pos.prev_close > 0.0 {
            pos.open_gap_pct = (pos.day_open - pos.prev_close) / pos.prev_close * 100.0;
        }
    }
    if pos.prev_close > 0.0 {
        pos.change_pct = (ltp - pos.prev_close) / pos.prev_close * 100.0;
    }
    update_watermark(pos);
}

/// High watermark = harga terbaik searah posisi sejak entry.
fn update_watermark(pos: &mut Position) {
    match pos.mode {
        Mode::Long if pos.ltp > pos.high_watermark => pos.high_watermark = pos.ltp,
        Mode::Short if pos.high_watermark == 0.0 || pos.ltp < pos.high_watermark => {
            pos.high_watermark = pos.ltp
        }
        _ => {}
    }
}

/// PnL dihitung ulang tiap tick dari VWAP entry ledger, bukan running total,
/// supaya konsisten dengan partial fill dari add-on.
pub fn recompute_pnl(pos: &mut Position, avg_entry: f64) {
    if pos.is_open() && pos.quantity > 0 && avg_entry > 0.0 {
        pos.avg_entry_price = avg_entry;
        pos.pnl = (pos.ltp - avg_entry) * pos.quantity as f64 * pos.mode.sign();
    }
}

/// Evaluasi aturan ladder. Mengembalikan aksi yang harus dieksekusi engine,
/// atau None kalau tidak ada transisi tick ini.
pub fn evaluate(pos: &Position, settings: &StrategySettings) -> Option<TickAction> {
    match pos.mode {
        Mode::Long => {
            if pos.ltp >= pos.target {
                return Some(TickAction::CloseProfit);
            }
            if pos.ltp <= pos.stop_loss {
                return Some(TickAction::StopOut { flip: pos.cycle_index < pos.cycle_total });
            }
            if pos.ladder_level < settings.no_of_add_ons && pos.ltp >= pos.next_add_on {
                return Some(TickAction::AddOn { qty: trade_qty(settings.trade_capital, pos.entry_price) });
            }
            None
        }
        Mode::Short => {
            if pos.ltp <= pos.target {
                return Some(TickAction::CloseProfit);
            }
            if pos.ltp >= pos.stop_loss {
                return Some(TickAction::StopOut { flip: pos.cycle_index < pos.cycle_total });
            }
            if pos.ladder_level < settings.no_of_add_ons && pos.ltp <= pos.next_add_on {
                return Some(TickAction::AddOn { qty: trade_qty(settings.trade_capital, pos.entry_price) });
            }
            None
        }
        Mode::None => None,
    }
}

/// Trailing stop dari high watermark. Hanya diadopsi kalau MENGETATKAN stop
/// yang ada — long tidak pernah turun, short tidak pernah naik.
pub fn tighten_trailing_stop(pos: &mut Position, mult: &Multipliers) {
    if pos.high_watermark <= 0.0 {
        return;
    }
    match pos.mode {
        Mode::Long => {
            let candidate = pos.high_watermark * (1.0 - mult.tsl);
            if candidate > pos.stop_loss {
                pos.stop_loss = candidate;
            }
        }
        Mode::Short => {
            let candidate = pos.high_watermark * (1.0 + mult.tsl);
            if candidate < pos.stop_loss || pos.stop_loss == 0.0 {
                pos.stop_loss = candidate;
            }
        }
        Mode::None => {}
    }
}

/// Seed budget cycle untuk entry: fresh mulai di cycle 1; flip melanjutkan
/// index leg sebelumnya + 1.
#[derive(Debug, Clone, Copy)]
pub enum CycleSeed {
    Fresh,
    Flip { prev_index: u32, total: u32, start_mode: Mode },
}

/// Terapkan fill entry ke posisi: level 1, SL/target/trigger dari harga fill.
pub fn apply_entry_fill(
    pos: &mut Position,
    mode: Mode,
    fill_price: f64,
    qty: i64,
    mult: &Multipliers,
    settings: &StrategySettings,
    seed: CycleSeed,
) {
    pos.mode = mode;
    pos.status = crate::domain::PositionStatus::Active;
    pos.ladder_level = 1;
    pos.entry_price = fill_price;
    pos.avg_entry_price = fill_price;
    pos.quantity = qty;
    pos.high_watermark = fill_price;
    pos.pnl = 0.0;

    let sign = mode.sign();
    pos.stop_loss = fill_price * (1.0 - sign * mult.init_sl);
    pos.target = fill_price * (1.0 + sign * mult.target);
    pos.next_add_on = fill_price * (1.0 + sign * mult.add_on);

    match seed {
        CycleSeed::Fresh => {
            pos.cycle_index = 1;
            pos.cycle_total = settings.cycles_per_stock;
            pos.cycle_start_mode = mode;
        }
        CycleSeed::Flip { prev_index, total, start_mode } => {
            pos.cycle_index = prev_index + 1;
            pos.cycle_total = total;
            pos.cycle_start_mode = start_mode;
        }
    }
}

/// Terapkan fill add-on: naikkan level dan geser trigger berikutnya.
pub fn apply_add_on_fill(pos: &mut Position, fill_price: f64, qty: i64, mult: &Multipliers) {
    pos.quantity += qty;
    pos.ladder_level += 1;
    pos.next_add_on = fill_price * (1.0 + pos.mode.sign() * mult.add_on);
}

/// Posisi flat setelah close leg; status diset oleh engine sesuai alasan.
pub fn mark_flat(pos: &mut Position) {
    pos.quantity = 0;
    pos.mode = Mode::None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PositionStatus;

    fn settings() -> StrategySettings {
        StrategySettings::default().normalized()
    }

    fn mult() -> Multipliers {
        Multipliers::from_settings(&settings())
    }

    fn active_long(entry: f64) -> Position {
        let mut pos = Position::new("TST".to_string(), entry);
        apply_entry_fill(&mut pos, Mode::Long, entry, 10, &mult(), &settings(), CycleSeed::Fresh);
        pos
    }

    fn active_short(entry: f64) -> Position {
        let mut pos = Position::new("TST".to_string(), entry);
        apply_entry_fill(&mut pos, Mode::Short, entry, 10, &mult(), &settings(), CycleSeed::Fresh);
        pos
    }

    #[test]
    fn entry_fill_seeds_levels() {
        let pos = active_long(100.0);
        assert_eq!(pos.status, PositionStatus::Active);
        assert_eq!(pos.ladder_level, 1);
        assert!((pos.stop_loss - 99.5).abs() < 1e-9);
        assert!((pos.target - 102.0).abs() < 1e-9);
        assert!((pos.next_add_on - 100.5).abs() < 1e-9);
        assert_eq!(pos.cycle_index, 1);
        assert_eq!(pos.cycle_total, 3);
    }

    #[test]
    fn short_entry_mirrors_levels() {
        let pos = active_short(100.0);
        assert!((pos.stop_loss - 100.5).abs() < 1e-9);
        assert!((pos.target - 98.0).abs() < 1e-9);
        assert!((pos.next_add_on - 99.5).abs() < 1e-9);
    }

    #[test]
    fn trade_qty_floor_and_minimum() {
        assert_eq!(trade_qty(1000.0, 90.0), 11);
        assert_eq!(trade_qty(1000.0, 3000.0), 1);
        assert_eq!(trade_qty(1000.0, 0.0), 1);
    }

    #[test]
    fn first_tick_sets_day_open_and_gap() {
        let mut pos = Position::new("TST".to_string(), 100.0);
        apply_market_tick(&mut pos, 105.0, 0.0);
        assert_eq!(pos.day_open, 105.0);
        assert!((pos.open_gap_pct - 5.0).abs() < 1e-9);
        // tick berikutnya tidak menggeser day_open
        apply_market_tick(&mut pos, 101.0, 0.0);
        assert_eq!(pos.day_open, 105.0);
        assert!((pos.open_gap_pct - 5.0).abs() < 1e-9);
        assert!((pos.change_pct - 1.0).abs() < 1e-9);
    }

    #[test]
    fn turnover_tracks_cumulative_volume_times_price() {
        let mut pos = Position::new("TST".to_string(), 100.0);
        apply_market_tick(&mut pos, 100.0, 50_000.0);
        assert!((pos.turnover - 5_000_000.0).abs() < 1e-6);
        // volume 0 (ticker packet) tidak menimpa turnover terakhir
        apply_market_tick(&mut pos, 101.0, 0.0);
        assert!((pos.turnover - 5_000_000.0).abs() < 1e-6);
    }

    #[test]
    fn long_watermark_only_rises() {
        let mut pos = active_long(100.0);
        apply_market_tick(&mut pos, 104.0, 0.0);
        assert_eq!(pos.high_watermark, 104.0);
        apply_market_tick(&mut pos, 101.0, 0.0);
        assert_eq!(pos.high_watermark, 104.0);
    }

    #[test]
    fn short_watermark_only_falls() {
        let mut pos = active_short(100.0);
        apply_market_tick(&mut pos, 96.0, 0.0);
        assert_eq!(pos.high_watermark, 96.0);
        apply_market_tick(&mut pos, 99.0, 0.0);
        assert_eq!(pos.high_watermark, 96.0);
    }

    #[test]
    fn long_trailing_stop_never_loosens() {
        let m = mult();
        let mut pos = active_long(100.0);
        apply_market_tick(&mut pos, 110.0, 0.0);
        tighten_trailing_stop(&mut pos, &m);
        let tightened = pos.stop_loss;
        assert!((tightened - 110.0 * 0.995).abs() < 1e-9);

        // harga turun: watermark tetap, stop tidak boleh turun
        apply_market_tick(&mut pos, 109.8, 0.0);
        tighten_trailing_stop(&mut pos, &m);
        assert_eq!(pos.stop_loss, tightened);
    }

    #[test]
    fn short_trailing_stop_never_rises() {
        let m = mult();
        let mut pos = active_short(100.0);
        apply_market_tick(&mut pos, 90.0, 0.0);
        tighten_trailing_stop(&mut pos, &m);
        let tightened = pos.stop_loss;
        assert!((tightened - 90.0 * 1.005).abs() < 1e-9);

        apply_market_tick(&mut pos, 90.2, 0.0);
        tighten_trailing_stop(&mut pos, &m);
        assert_eq!(pos.stop_loss, tightened);
    }

    #[test]
    fn target_hit_closes_profit() {
        let mut pos = active_long(100.0);
        apply_market_tick(&mut pos, 102.1, 0.0);
        assert_eq!(evaluate(&pos, &settings()), Some(TickAction::CloseProfit));

        let mut pos = active_short(100.0);
        apply_market_tick(&mut pos, 97.9, 0.0);
        assert_eq!(evaluate(&pos, &settings()), Some(TickAction::CloseProfit));
    }

    #[test]
    fn stop_out_flips_while_cycle_budget_remains() {
        let mut pos = active_long(100.0);
        apply_market_tick(&mut pos, 99.4, 0.0);
        assert_eq!(evaluate(&pos, &settings()), Some(TickAction::StopOut { flip: true }));

        pos.cycle_index = pos.cycle_total;
        assert_eq!(evaluate(&pos, &settings()), Some(TickAction::StopOut { flip: false }));
    }

    #[test]
    fn add_on_triggers_until_max_level() {
        let s = settings();
        let mut pos = active_long(100.0);
        apply_market_tick(&mut pos, 100.51, 0.0);
        match evaluate(&pos, &s) {
            Some(TickAction::AddOn { qty }) => assert_eq!(qty, 10),
            other => panic!("expected add-on, got {other:?}"),
        }

        pos.ladder_level = s.no_of_add_ons;
        assert_eq!(evaluate(&pos, &s), None);
    }

    #[test]
    fn add_on_fill_advances_trigger() {
        let m = mult();
        let mut pos = active_long(100.0);
        apply_market_tick(&mut pos, 100.5, 0.0);
        apply_add_on_fill(&mut pos, 100.5, 10, &m);
        assert_eq!(pos.quantity, 20);
        assert_eq!(pos.ladder_level, 2);
        assert!((pos.next_add_on - 100.5 * 1.005).abs() < 1e-9);
    }

    #[test]
    fn flip_seed_continues_cycle_count() {
        let m = mult();
        let s = settings();
        let mut pos = active_long(100.0);
        mark_flat(&mut pos);
        apply_entry_fill(
            &mut pos,
            Mode::Short,
            99.5,
            10,
            &m,
            &s,
            CycleSeed::Flip { prev_index: 1, total: 3, start_mode: Mode::Long },
        );
        assert_eq!(pos.cycle_index, 2);
        assert_eq!(pos.cycle_total, 3);
        assert_eq!(pos.cycle_start_mode, Mode::Long);
        assert_eq!(pos.mode, Mode::Short);
    }

    #[test]
    fn pnl_sign_follows_mode() {
        let mut long = active_long(100.0);
        apply_market_tick(&mut long, 101.0, 0.0);
        recompute_pnl(&mut long, 100.0);
        assert!((long.pnl - 10.0).abs() < 1e-9);

        let mut short = active_short(100.0);
        apply_market_tick(&mut short, 101.0, 0.0);
        recompute_pnl(&mut short, 100.0);
        assert!((short.pnl + 10.0).abs() < 1e-9);
    }

    #[test]
    fn quantity_mode_invariant_through_lifecycle() {
        let mut pos = Position::new("TST".to_string(), 100.0);
        assert!(!pos.is_open() && pos.quantity == 0);
        apply_entry_fill(&mut pos, Mode::Long, 100.0, 10, &mult(), &settings(), CycleSeed::Fresh);
        assert!(pos.is_open() == (pos.quantity > 0));
        mark_flat(&mut pos);
        assert!(pos.is_open() == (pos.quantity > 0));
    }
}
