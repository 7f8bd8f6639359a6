// ===============================
// src/instruments.rs
// ===============================
//
// Instrument master: mapping symbol <-> security id, dimuat sekali dari
// scrip master CSV broker saat connect. Setelah itu read-only, kecuali
// cache per-symbol yang diisi lazy (idempotent, race aman last-write-wins).
//
use ahash::AHashMap as HashMap;
use serde::Deserialize;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::gateway::GatewayError;

#[derive(Debug, Deserialize)]
struct ScripRow {
    #[serde(rename = "SEM_EXM_EXCH_ID")]
    exchange: String,
    #[serde(rename = "SEM_INSTRUMENT_NAME")]
    instrument: String,
    #[serde(rename = "SEM_TRADING_SYMBOL")]
    trading_symbol: String,
    #[serde(rename = "SEM_SMST_SECURITY_ID")]
    security_id: u32,
}

pub struct InstrumentMap {
    symbol_to_id: HashMap<String, u32>,
    id_to_symbol: HashMap<u32, String>,
    // cache hasil resolve per symbol domain (termasuk fallback -EQ)
    cache: Mutex<HashMap<String, u32>>,
}

impl InstrumentMap {
    /// Download scrip master dan bangun kedua mapping.
    pub async fn fetch(http: &reqwest::Client, url: &str) -> Result<Self, GatewayError> {
        info!(%url, "fetching scrip master CSV");
        let body = http.get(url).send().await?.error_for_status()?.text().await?;
        Self::from_csv(&body)
    }

    /// Parse CSV teks. Baris NSE EQUITY saja; kalau hasilnya kosong, fallback
    /// ke semua baris (format file kadang berubah).
    pub fn from_csv(text: &str) -> Result<Self, GatewayError> {
        let mut strict: HashMap<String, u32> = HashMap::new();
        let mut broad: HashMap<String, u32> = HashMap::new();

        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(text.as_bytes());
        for row in rdr.deserialize::<ScripRow>() {
            let row = match row {
                Ok(r) => r,
                // satu baris rusak tidak boleh menggagalkan seluruh load
                Err(_) => continue,
            };
            if row.exchange == "NSE" && row.instrument == "EQUITY" {
                strict.insert(row.trading_symbol.clone(), row.security_id);
            }
            broad.insert(row.trading_symbol, row.security_id);
        }

        let symbol_to_id = if strict.is_empty() {
            warn!("no NSE EQUITY rows found, using broad scrip filter");
            broad
        } else {
            strict
        };

        if symbol_to_id.is_empty() {
            return Err(GatewayError::Broker("empty scrip master".to_string()));
        }

        let id_to_symbol: HashMap<u32, String> =
            symbol_to_id.iter().map(|(sym, id)| (*id, sym.clone())).collect();
        info!(mappings = symbol_to_id.len(), "scrip master loaded");

        Ok(Self { symbol_to_id, id_to_symbol, cache: Mutex::new(HashMap::new()) })
    }

    /// Security id untuk symbol domain. Coba match langsung, lalu suffix
    /// "-EQ" untuk bare symbol. Hit di-cache.
    pub fn security_id(&self, symbol: &str) -> Option<u32> {
        if let Some(id) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(symbol) {
            return Some(*id);
        }

        let id = self
            .symbol_to_id
            .get(symbol)
            .or_else(|| self.symbol_to_id.get(&format!("{symbol}-EQ")))
            .copied()?;

        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(symbol.to_string(), id);
        Some(id)
    }

    /// Reverse lookup untuk jalur tick: id -> symbol.
    pub fn symbol_for(&self, id: u32) -> Option<&str> {
        self.id_to_symbol.get(&id).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.symbol_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbol_to_id.is_empty()
    }
}
