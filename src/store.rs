// ===============================
// src/store.rs
// ===============================
//
// Loader untuk dua artefak milik kolaborator eksternal:
// - kandidat premarket (symbol -> prev close) hasil screening di luar proses
// - pasangan kredensial broker (file JSON atau env)
// Persistensinya sendiri bukan urusan engine; di sini cuma baca/tulis file.
//
use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("candidates file has no candidates")]
    NoCandidates,
}

#[derive(Debug, Deserialize)]
struct CandidatesFile {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    candidates: std::collections::HashMap<String, f64>,
}

/// Baca kandidat hasil screening premarket: mapping symbol -> prev close.
pub fn load_candidates(path: &str) -> Result<HashMap<String, f64>, StoreError> {
    let text = std::fs::read_to_string(path)?;
    let file: CandidatesFile = serde_json::from_str(&text)?;
    if file.candidates.is_empty() {
        return Err(StoreError::NoCandidates);
    }
    info!(
        count = file.candidates.len(),
        timestamp = file.timestamp.as_deref().unwrap_or("unknown"),
        %path,
        "loaded premarket candidates"
    );
    Ok(file.candidates.into_iter().collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub client_id: String,
    pub access_token: String,
    #[serde(default)]
    pub saved_at: Option<String>,
}

/// Env menang atas file, supaya deployment tanpa file kredensial tetap jalan.
pub fn load_credentials(path: &str) -> Option<Credentials> {
    let from_env = (
        std::env::var("BROKER_CLIENT_ID").ok(),
        std::env::var("BROKER_ACCESS_TOKEN").ok(),
    );
    if let (Some(client_id), Some(access_token)) = from_env {
        if !client_id.is_empty() && !access_token.is_empty() {
            return Some(Credentials { client_id, access_token, saved_at: None });
        }
    }

    let text = std::fs::read_to_string(path).ok()?;
    let creds: Credentials = serde_json::from_str(&text).ok()?;
    if creds.client_id.is_empty() || creds.access_token.is_empty() {
        return None;
    }
    Some(creds)
}

/// Tulis atomik: tmp + rename, supaya file tidak pernah setengah jadi.
pub fn save_credentials(path: &str, client_id: &str, access_token: &str) -> Result<(), StoreError> {
    if client_id.is_empty() || access_token.is_empty() {
        return Ok(());
    }
    let payload = Credentials {
        client_id: client_id.to_string(),
        access_token: access_token.to_string(),
        saved_at: Some(chrono::Utc::now().to_rfc3339()),
    };
    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&payload)?)?;
    std::fs::rename(Path::new(&tmp), Path::new(path))?;
    Ok(())
}
