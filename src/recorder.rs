// ===============================
// src/recorder.rs
// ===============================
//
// JSONL recorder untuk audit sesi: tick, order, transisi posisi.
// Aktif kalau RECORD_FILE diset (lihat main.rs). Buffered, flush tiap detik
// atau tiap 500 event; gagal tulis dicoba reopen sekali lalu event di-drop.
//
use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::Event;

const FLUSH_EVERY_N_EVENTS: u32 = 500;

async fn open_writer(path: &str) -> Option<BufWriter<tokio::fs::File>> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(BufWriter::new(file)),
        Err(e) => {
            error!(?e, %path, "recorder: open failed, recording disabled");
            None
        }
    }
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    let Some(mut writer) = open_writer(&path).await else { return };
    info!(%path, "recorder started");

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut since_flush: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    return;
                };
                let mut line = match serde_json::to_vec(&ev) {
                    Ok(v) => v,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skipping event");
                        continue;
                    }
                };
                line.push(b'\n');

                if writer.write_all(&line).await.is_err() {
                    // coba reopen sekali; kalau tetap gagal, event hilang
                    match open_writer(&path).await {
                        Some(w) => {
                            writer = w;
                            if let Err(e) = writer.write_all(&line).await {
                                error!(?e, "recorder: write failed after reopen, dropping event");
                            }
                        }
                        None => return,
                    }
                }

                since_flush += 1;
                if since_flush >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    since_flush = 0;
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_flush = 0;
            }
        }
    }
}
