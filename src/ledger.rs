// ===============================
// src/ledger.rs
// ===============================
//
// Order ledger: satu-satunya pemilik record order. Map dijaga Mutex yang
// dipegang hanya selama mutasi map — tidak pernah melewati broker call.
// Agregat (VWAP entry, total fill) dihitung ulang dari record, bukan
// running total, supaya update status idempoten.
//
use ahash::AHashMap as HashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;

use crate::domain::{now_ns, OrderKind, OrderStatus, Side};

const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: i64,
    pub kind: OrderKind,
    pub status: OrderStatus,
    pub executed_price: f64,
    pub executed_quantity: i64,
    pub retry_count: u32,
    pub error_message: String,
    pub created_ns: i128,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub total_orders: usize,
    pub executed: usize,
    pub pending: usize,
    pub rejected: usize,
    pub success_rate: f64,
}

#[derive(Default)]
struct Inner {
    orders: HashMap<String, OrderRecord>,
    by_symbol: HashMap<String, Vec<String>>,
}

pub struct OrderLedger {
    inner: Mutex<Inner>,
}

impl OrderLedger {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Buat record baru dengan id sementara; diganti id broker via
    /// `replace_order_id` begitu respons datang.
    pub fn create_order(&self, symbol: &str, side: Side, quantity: i64, kind: OrderKind) -> OrderRecord {
        let temp_id = format!("TMP-{}-{}-{}", symbol, now_ns(), rand::thread_rng().gen::<u32>());
        let rec = OrderRecord {
            order_id: temp_id.clone(),
            symbol: symbol.to_string(),
            side,
            quantity,
            kind,
            status: OrderStatus::Pending,
            executed_price: 0.0,
            executed_quantity: 0,
            retry_count: 0,
            error_message: String::new(),
            created_ns: now_ns(),
        };

        let mut inner = self.lock();
        inner.orders.insert(temp_id.clone(), rec.clone());
        inner.by_symbol.entry(symbol.to_string()).or_default().push(temp_id);
        rec
    }

    /// Re-key record + index symbol secara atomik; field lain dipertahankan.
    pub fn replace_order_id(&self, temp_id: &str, real_id: &str) {
        let mut inner = self.lock();
        let Some(mut rec) = inner.orders.remove(temp_id) else { return };
        rec.order_id = real_id.to_string();
        let symbol = rec.symbol.clone();
        inner.orders.insert(real_id.to_string(), rec);
        if let Some(ids) = inner.by_symbol.get_mut(&symbol) {
            if let Some(slot) = ids.iter_mut().find(|id| id.as_str() == temp_id) {
                *slot = real_id.to_string();
            }
        }
    }

    /// Idempoten: status final yang sama diterapkan dua kali tidak mengubah
    /// agregat — aplikasi pertama yang menang.
    pub fn update_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        executed_price: f64,
        executed_quantity: i64,
        error_message: &str,
    ) {
        let mut inner = self.lock();
        let Some(rec) = inner.orders.get_mut(order_id) else { return };
        if rec.status.is_final() && rec.status == status {
            return;
        }
        rec.status = status;
        rec.executed_price = executed_price;
        rec.executed_quantity = executed_quantity;
        rec.error_message = error_message.to_string();
        info!(order_id, ?status, "order updated");
    }

    /// VWAP harga fill order executed untuk symbol+side. 0.0 kalau belum ada.
    pub fn average_entry_price(&self, symbol: &str, side: Side) -> f64 {
        let inner = self.lock();
        let mut value = 0.0;
        let mut qty: i64 = 0;
        for rec in executed(&inner, symbol, side) {
            value += rec.executed_price * rec.executed_quantity as f64;
            qty += rec.executed_quantity;
        }
        if qty > 0 { value / qty as f64 } else { 0.0 }
    }

    pub fn total_filled_quantity(&self, symbol: &str, side: Side) -> i64 {
        let inner = self.lock();
        executed(&inner, symbol, side).map(|r| r.executed_quantity).sum()
    }

    pub fn should_retry(&self, order_id: &str) -> bool {
        let inner = self.lock();
        inner
            .orders
            .get(order_id)
            .map(|r| r.status == OrderStatus::Rejected && r.retry_count < MAX_RETRIES)
            .unwrap_or(false)
    }

    pub fn mark_retry(&self, order_id: &str) {
        let mut inner = self.lock();
        if let Some(rec) = inner.orders.get_mut(order_id) {
            rec.retry_count += 1;
        }
    }

    /// Full close: record symbol ini dibuang seluruhnya — riwayat tidak
    /// dibutuhkan setelah exit, dan leg cycle berikutnya mulai bersih.
    pub fn clear_symbol(&self, symbol: &str) {
        let mut inner = self.lock();
        if let Some(ids) = inner.by_symbol.remove(symbol) {
            for id in ids {
                inner.orders.remove(&id);
            }
        }
    }

    pub fn orders_for(&self, symbol: &str) -> Vec<OrderRecord> {
        let inner = self.lock();
        inner
            .by_symbol
            .get(symbol)
            .map(|ids| ids.iter().filter_map(|id| inner.orders.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> LedgerSummary {
        let inner = self.lock();
        let total = inner.orders.len();
        let mut executed = 0usize;
        let mut pending = 0usize;
        let mut rejected = 0usize;
        for rec in inner.orders.values() {
            match rec.status {
                OrderStatus::Executed => executed += 1,
                OrderStatus::Pending => pending += 1,
                OrderStatus::Rejected => rejected += 1,
                OrderStatus::Cancelled => {}
            }
        }
        LedgerSummary {
            total_orders: total,
            executed,
            pending,
            rejected,
            success_rate: if total > 0 { executed as f64 / total as f64 * 100.0 } else { 0.0 },
        }
    }
}

impl Default for OrderLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn executed<'a>(inner: &'a Inner, symbol: &'a str, side: Side) -> impl Iterator<Item = &'a OrderRecord> {
    inner
        .by_symbol
        .get(symbol)
        .into_iter()
        .flatten()
        .filter_map(move |id| inner.orders.get(id))
        .filter(move |r| r.status == OrderStatus::Executed && r.side == side)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(ledger: &OrderLedger, symbol: &str, side: Side, qty: i64, px: f64) -> String {
        let rec = ledger.create_order(symbol, side, qty, OrderKind::Market);
        ledger.update_status(&rec.order_id, OrderStatus::Executed, px, qty, "");
        rec.order_id
    }

    #[test]
    fn vwap_over_partial_fills() {
        let ledger = OrderLedger::new();
        fill(&ledger, "TST", Side::Buy, 10, 100.0);
        fill(&ledger, "TST", Side::Buy, 5, 106.0);
        assert!((ledger.average_entry_price("TST", Side::Buy) - 102.0).abs() < 1e-9);
        assert_eq!(ledger.total_filled_quantity("TST", Side::Buy), 15);
    }

    #[test]
    fn average_is_zero_without_fills() {
        let ledger = OrderLedger::new();
        assert_eq!(ledger.average_entry_price("TST", Side::Buy), 0.0);
    }

    #[test]
    fn sides_are_tracked_separately() {
        let ledger = OrderLedger::new();
        fill(&ledger, "TST", Side::Buy, 10, 100.0);
        fill(&ledger, "TST", Side::Sell, 10, 110.0);
        assert_eq!(ledger.average_entry_price("TST", Side::Buy), 100.0);
        assert_eq!(ledger.average_entry_price("TST", Side::Sell), 110.0);
    }

    #[test]
    fn repeated_terminal_update_does_not_double_count() {
        let ledger = OrderLedger::new();
        let id = fill(&ledger, "TST", Side::Buy, 10, 100.0);
        let before = ledger.total_filled_quantity("TST", Side::Buy);
        ledger.update_status(&id, OrderStatus::Executed, 100.0, 10, "");
        assert_eq!(ledger.total_filled_quantity("TST", Side::Buy), before);
        assert_eq!(ledger.average_entry_price("TST", Side::Buy), 100.0);
    }

    #[test]
    fn replace_order_id_rekeys_and_preserves_fields() {
        let ledger = OrderLedger::new();
        let rec = ledger.create_order("TST", Side::Buy, 7, OrderKind::Market);
        ledger.replace_order_id(&rec.order_id, "112233");
        ledger.update_status("112233", OrderStatus::Executed, 50.0, 7, "");

        let orders = ledger.orders_for("TST");
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_id, "112233");
        assert_eq!(orders[0].quantity, 7);
        assert_eq!(ledger.total_filled_quantity("TST", Side::Buy), 7);
    }

    #[test]
    fn retry_allowed_until_budget_spent() {
        let ledger = OrderLedger::new();
        let rec = ledger.create_order("TST", Side::Buy, 1, OrderKind::Market);
        ledger.update_status(&rec.order_id, OrderStatus::Rejected, 0.0, 0, "margin");
        for _ in 0..MAX_RETRIES {
            assert!(ledger.should_retry(&rec.order_id));
            ledger.mark_retry(&rec.order_id);
        }
        assert!(!ledger.should_retry(&rec.order_id));
    }

    #[test]
    fn executed_orders_never_retry() {
        let ledger = OrderLedger::new();
        let id = fill(&ledger, "TST", Side::Buy, 1, 10.0);
        assert!(!ledger.should_retry(&id));
    }

    #[test]
    fn clear_symbol_removes_history() {
        let ledger = OrderLedger::new();
        fill(&ledger, "TST", Side::Buy, 10, 100.0);
        fill(&ledger, "OTH", Side::Buy, 5, 50.0);
        ledger.clear_symbol("TST");
        assert!(ledger.orders_for("TST").is_empty());
        assert_eq!(ledger.average_entry_price("TST", Side::Buy), 0.0);
        // symbol lain tidak terpengaruh
        assert_eq!(ledger.total_filled_quantity("OTH", Side::Buy), 5);
    }

    #[test]
    fn summary_success_rate() {
        let ledger = OrderLedger::new();
        fill(&ledger, "A", Side::Buy, 1, 10.0);
        let rec = ledger.create_order("B", Side::Sell, 1, OrderKind::Market);
        ledger.update_status(&rec.order_id, OrderStatus::Rejected, 0.0, 0, "rms");
        let s = ledger.summary();
        assert_eq!(s.total_orders, 2);
        assert_eq!(s.executed, 1);
        assert_eq!(s.rejected, 1);
        assert!((s.success_rate - 50.0).abs() < 1e-9);
    }
}
