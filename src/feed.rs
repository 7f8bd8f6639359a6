// ===============================
// src/feed.rs
// ===============================
//
// Market data adapters:
// - run_mock : random-walk generator per symbol (paper mode)
// - run_live : WebSocket feed binary v2 (quote/ticker packets)
//
// Loop socket di sini HANYA parse + resolve + kirim event ke channel engine.
// Keputusan trading tidak pernah jalan di jalur ini: tick yang macet di
// engine tidak boleh menahan read loop (try_send, drop kalau penuh).
//
// Reconnect: delay = base * 2^(attempts-1), cap 60 detik, menyerah setelah
// max attempts — setelah itu universe tidak dapat tick sampai restart manual.
//
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::domain::{now_ns, FeedEvent};
use crate::instruments::InstrumentMap;
use crate::metrics::{FEED_CONNECTED, FEED_RECONNECTS, TICKS, TICKS_DROPPED};

// Response codes dari feed binary
const PACKET_TICKER: u8 = 2;
const PACKET_QUOTE: u8 = 4;
const PACKET_DISCONNECT: u8 = 50;

const SUBSCRIBE_QUOTE: u32 = 17;
const SUBSCRIBE_CHUNK: usize = 100;

#[derive(Clone, Debug)]
pub struct ReconnectCfg {
    pub base_secs: u64,
    pub max_attempts: u32,
}

#[derive(Debug, PartialEq)]
struct RawTick {
    security_id: u32,
    ltp: f64,
    volume: f64,
}

/// Generator mock: random walk mulai dari prev_close, ~10 tick/detik.
pub async fn run_mock(
    tx: mpsc::Sender<FeedEvent>,
    symbol: String,
    prev_close: f64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut px = if prev_close > 0.0 { prev_close } else { 100.0 };
    let mut volume: f64 = 0.0;
    loop {
        if *shutdown.borrow() {
            return;
        }
        // jangan simpan ThreadRng melewati .await
        let (step_pct, lot) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-0.10..=0.10), rng.gen_range(50.0..500.0))
        };
        px = (px * (1.0 + step_pct / 100.0)).max(1.0);
        volume += lot;

        let ev = FeedEvent { ts_ns: now_ns(), symbol: symbol.clone(), ltp: px, volume };
        if tx.try_send(ev).is_ok() {
            TICKS.inc();
        } else {
            TICKS_DROPPED.inc();
        }

        tokio::select! {
            _ = sleep(Duration::from_millis(100)) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// Feed live. Subscribe quote packets untuk security id yang diminta,
/// resolve id -> symbol lewat reverse map, lalu dorong FeedEvent ke engine.
pub async fn run_live(
    tx: mpsc::Sender<FeedEvent>,
    ws_base: String,
    client_id: String,
    access_token: String,
    instruments: Arc<InstrumentMap>,
    security_ids: Vec<u32>,
    cfg: ReconnectCfg,
    mut shutdown: watch::Receiver<bool>,
) {
    let ws_url = format!(
        "{}?version=2&token={}&clientId={}&authType=2",
        ws_base.trim_end_matches('/'),
        access_token,
        client_id
    );
    if Url::parse(&ws_url).is_err() {
        error!(%ws_base, "bad ws url");
        return;
    }

    let mut attempts: u32 = 0;
    loop {
        if *shutdown.borrow() {
            info!("feed shutdown requested");
            return;
        }

        info!(instruments = security_ids.len(), "connecting market feed");
        match connect_async(ws_url.as_str()).await {
            Ok((mut ws, _resp)) => {
                info!("market feed connected");
                attempts = 0; // sukses -> reset backoff
                FEED_CONNECTED.set(1);

                // Subscribe per chunk (batas upstream 100 instrumen per request)
                for chunk in security_ids.chunks(SUBSCRIBE_CHUNK) {
                    let req = json!({
                        "RequestCode": SUBSCRIBE_QUOTE,
                        "InstrumentCount": chunk.len(),
                        "InstrumentList": chunk.iter().map(|id| json!({
                            "ExchangeSegment": "NSE_EQ",
                            "SecurityId": id.to_string(),
                        })).collect::<Vec<_>>(),
                    });
                    if let Err(e) = ws.send(Message::Text(req.to_string())).await {
                        error!(?e, "subscribe send failed");
                        break;
                    }
                }

                loop {
                    tokio::select! {
                        frame = ws.next() => {
                            match frame {
                                Some(Ok(Message::Binary(buf))) => {
                                    for raw in parse_packets(&buf) {
                                        match instruments.symbol_for(raw.security_id) {
                                            Some(symbol) => {
                                                let ev = FeedEvent {
                                                    ts_ns: now_ns(),
                                                    symbol: symbol.to_string(),
                                                    ltp: raw.ltp,
                                                    volume: raw.volume,
                                                };
                                                if tx.try_send(ev).is_ok() {
                                                    TICKS.inc();
                                                } else {
                                                    TICKS_DROPPED.inc();
                                                }
                                            }
                                            // id tak dikenal: drop, jangan pernah panik di jalur feed
                                            None => debug!(id = raw.security_id, "tick for unmapped security id"),
                                        }
                                    }
                                }
                                Some(Ok(_)) => {} // ignore text/ping frames
                                Some(Err(e)) => {
                                    error!(?e, "ws read error");
                                    break;
                                }
                                None => {
                                    warn!("market feed closed by peer");
                                    break;
                                }
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                info!("feed shutdown requested, closing ws");
                                let _ = ws.close(None).await;
                                FEED_CONNECTED.set(0);
                                return;
                            }
                        }
                    }
                }
                FEED_CONNECTED.set(0);
            }
            Err(e) => {
                error!(?e, "feed connect failed");
            }
        }

        attempts = attempts.saturating_add(1);
        if attempts > cfg.max_attempts {
            error!(
                attempts,
                max = cfg.max_attempts,
                "feed reconnect attempts exhausted — universe unfed until manual restart"
            );
            return;
        }
        FEED_RECONNECTS.inc();
        let delay = reconnect_delay(cfg.base_secs, attempts);
        warn!(attempt = attempts, delay_secs = delay, "reconnecting market feed");

        tokio::select! {
            _ = sleep(Duration::from_secs(delay)) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// delay = base * 2^(attempts-1), cap 60 detik
fn reconnect_delay(base_secs: u64, attempts: u32) -> u64 {
    let shift = attempts.saturating_sub(1).min(16);
    base_secs.saturating_mul(1u64 << shift).min(60)
}

/// Satu frame binary bisa berisi beberapa packet berurutan.
/// Packet rusak di-drop dengan log, tidak pernah di-raise.
fn parse_packets(buf: &[u8]) -> Vec<RawTick> {
    let mut out = Vec::new();
    let mut off = 0usize;

    while off + 8 <= buf.len() {
        let code = buf[off];
        let msg_len = u16::from_le_bytes([buf[off + 1], buf[off + 2]]) as usize;
        if msg_len < 8 || off + msg_len > buf.len() {
            debug!(code, msg_len, "malformed feed packet, dropping frame remainder");
            break;
        }
        let pkt = &buf[off..off + msg_len];

        match code {
            PACKET_TICKER if msg_len >= 12 => {
                if let Some(tick) = parse_price_packet(pkt, false) {
                    out.push(tick);
                }
            }
            PACKET_QUOTE if msg_len >= 26 => {
                if let Some(tick) = parse_price_packet(pkt, true) {
                    out.push(tick);
                }
            }
            PACKET_DISCONNECT => {
                let reason = if msg_len >= 10 {
                    u16::from_le_bytes([pkt[8], pkt[9]])
                } else {
                    0
                };
                warn!(reason, "feed sent disconnect packet");
            }
            _ => debug!(code, "ignoring feed packet"),
        }
        off += msg_len;
    }
    out
}

/// Header: code u8, len u16 LE, segment u8, security id u32 LE.
/// Ticker: LTP f32 di offset 8. Quote: + volume i32 di offset 22.
fn parse_price_packet(pkt: &[u8], with_volume: bool) -> Option<RawTick> {
    let security_id = u32::from_le_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]);
    let ltp = f32::from_le_bytes([pkt[8], pkt[9], pkt[10], pkt[11]]) as f64;
    if !(ltp.is_finite() && ltp > 0.0) {
        debug!(security_id, ltp, "dropping tick without usable price");
        return None;
    }
    let volume = if with_volume {
        i32::from_le_bytes([pkt[22], pkt[23], pkt[24], pkt[25]]).max(0) as f64
    } else {
        0.0
    };
    Some(RawTick { security_id, ltp, volume })
}
