// ===============================
// src/throttle.rs
// ===============================
//
// Admission gate untuk semua outbound broker call:
// - Token bucket (refill = N request/detik, burst = 1) dengan retry terbatas.
//   Kalau retry habis, caller harus SKIP — jangan block tanpa batas.
// - Counting semaphore membatasi jumlah call yang sedang in-flight.
//   Permit bersifat RAII: dilepas di semua exit path, termasuk saat error.
//
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateGate {
    max_requests_per_sec: f64,
    max_retries: u32,
    bucket: Mutex<BucketState>,
    conn: Arc<Semaphore>,
}

impl RateGate {
    pub fn new(max_requests_per_sec: f64, max_connections: usize) -> Self {
        Self {
            max_requests_per_sec: max_requests_per_sec.max(0.001),
            max_retries: 3,
            bucket: Mutex::new(BucketState { tokens: 1.0, last_refill: Instant::now() }),
            conn: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }

    /// Refill bucket lalu coba ambil satu token. Return sisa waktu tunggu
    /// (detik) kalau token belum tersedia.
    fn try_take(&self) -> Result<(), f64> {
        let mut b = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(b.last_refill).as_secs_f64();
        // burst = 1: token tidak pernah menumpuk lebih dari satu
        b.tokens = (b.tokens + elapsed * self.max_requests_per_sec).min(1.0);
        b.last_refill = now;

        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            Ok(())
        } else {
            Err((1.0 - b.tokens) / self.max_requests_per_sec)
        }
    }

    /// Ambil token tanpa menunggu.
    pub fn try_acquire(&self) -> bool {
        self.try_take().is_ok()
    }

    /// Ambil token, menunggu refill di antara retry. `false` setelah retry
    /// habis — sinyal untuk skip call ini.
    pub async fn acquire(&self) -> bool {
        for attempt in 0..self.max_retries {
            match self.try_take() {
                Ok(()) => return true,
                Err(wait_secs) => {
                    debug!(
                        wait_secs,
                        attempt = attempt + 1,
                        max = self.max_retries,
                        "rate limit reached, waiting"
                    );
                    sleep(Duration::from_secs_f64(wait_secs)).await;
                }
            }
        }
        // Satu kesempatan terakhir setelah sleep ronde terakhir
        if self.try_take().is_ok() {
            return true;
        }
        warn!(max_retries = self.max_retries, "rate gate retries exhausted, skipping call");
        false
    }

    /// Slot koneksi in-flight. Drop permit = release.
    pub async fn acquire_connection(&self) -> OwnedSemaphorePermit {
        // Semaphore tidak pernah di-close selama proses hidup
        self.conn
            .clone()
            .acquire_owned()
            .await
            .expect("connection semaphore closed")
    }

    pub fn available_connections(&self) -> usize {
        self.conn.available_permits()
    }
}
