// ===============================
// src/gateway_dhan.rs
// ===============================
//
// Broker session live (REST v2). Auth pakai header access-token/client-id.
// Koneksi divalidasi sekali lewat fundlimit saat connect: session invalid
// adalah fatal, tidak ada auto-retry login.
//
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};

use crate::gateway::{BrokerPosition, BrokerSession, DailyBar, GatewayError, OrderReply, OrderRequest};
use crate::instruments::InstrumentMap;
use crate::throttle::RateGate;

pub struct DhanSession {
    http: reqwest::Client,
    rest_base: String,
    client_id: String,
    access_token: String,
    instruments: Arc<InstrumentMap>,
    gate: Arc<RateGate>,
}

impl DhanSession {
    /// Bangun session: muat scrip master, lalu probe fundlimit untuk
    /// memvalidasi kredensial sebelum engine boleh start.
    pub async fn connect(
        rest_base: &str,
        scrip_master_url: &str,
        client_id: &str,
        access_token: &str,
        gate: Arc<RateGate>,
    ) -> Result<Self, GatewayError> {
        if client_id.is_empty() || access_token.is_empty() {
            return Err(GatewayError::InvalidSession("missing credentials".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let instruments = Arc::new(InstrumentMap::fetch(&http, scrip_master_url).await?);

        let session = Self {
            http,
            rest_base: rest_base.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            access_token: access_token.to_string(),
            instruments,
            gate,
        };

        // Verifikasi session dengan call paling ringan
        let balance = session.fund_limits().await?;
        info!(balance, "broker session connected");
        Ok(session)
    }

    pub fn instruments(&self) -> Arc<InstrumentMap> {
        self.instruments.clone()
    }

    fn auth(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        rb.header("access-token", &self.access_token)
            .header("client-id", &self.client_id)
    }

    async fn get_json(&self, path: &str) -> Result<Value, GatewayError> {
        let url = format!("{}/{}", self.rest_base, path);
        let rsp = self.auth(self.http.get(&url)).send().await?;
        if rsp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(GatewayError::InvalidSession("access token rejected".to_string()));
        }
        let rsp = rsp.error_for_status()?;
        Ok(rsp.json::<Value>().await?)
    }
}

#[async_trait]
impl BrokerSession for DhanSession {
    async fn place_order(&self, req: &OrderRequest) -> OrderReply {
        let Some(security_id) = self.instruments.security_id(&req.symbol) else {
            error!(symbol = %req.symbol, "cannot place order: security id not found");
            return OrderReply::failed(format!("security id not found for {}", req.symbol));
        };

        if !self.gate.acquire().await {
            return OrderReply::failed("rate limit retries exhausted");
        }
        let _permit = self.gate.acquire_connection().await;

        let body = json!({
            "dhanClientId": self.client_id,
            "transactionType": req.side.as_str(),
            "exchangeSegment": "NSE_EQ",
            "productType": "INTRADAY",
            "orderType": match req.kind {
                crate::domain::OrderKind::Market => "MARKET",
                crate::domain::OrderKind::Limit => "LIMIT",
            },
            "validity": "DAY",
            "securityId": security_id.to_string(),
            "quantity": req.quantity,
            "price": 0.0,
        });

        let url = format!("{}/orders", self.rest_base);
        match self.auth(self.http.post(&url)).json(&body).send().await {
            Ok(rsp) if rsp.status().is_success() => {
                let v = rsp.json::<Value>().await.unwrap_or(Value::Null);
                match v.get("orderId").and_then(|x| x.as_str()) {
                    Some(oid) => {
                        info!(symbol = %req.symbol, side = req.side.as_str(), qty = req.quantity, order_id = %oid, "order placed");
                        OrderReply::ok(oid.to_string())
                    }
                    None => OrderReply::failed(format!("no orderId in response: {v}")),
                }
            }
            Ok(rsp) => {
                let code = rsp.status();
                let text = rsp.text().await.unwrap_or_default();
                error!(%code, %text, symbol = %req.symbol, "order rejected");
                OrderReply::failed(format!("{code}: {text}"))
            }
            Err(e) => {
                error!(?e, symbol = %req.symbol, "order send failed");
                OrderReply::failed(e.to_string())
            }
        }
    }

    async fn fund_limits(&self) -> Result<f64, GatewayError> {
        let v = self.get_json("fundlimit").await?;
        // field name berubah antar versi API; coba beberapa kunci
        let balance = v
            .get("availabelBalance")
            .or_else(|| v.get("availableBalance"))
            .or_else(|| v.get("sodLimit"))
            .and_then(|x| x.as_f64())
            .unwrap_or(0.0);
        Ok(balance)
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, GatewayError> {
        let v = self.get_json("positions").await?;
        let rows = v.as_array().cloned().unwrap_or_default();
        Ok(rows
            .iter()
            .map(|r| BrokerPosition {
                symbol: r
                    .get("tradingSymbol")
                    .and_then(|x| x.as_str())
                    .unwrap_or_default()
                    .to_string(),
                net_qty: r.get("netQty").and_then(|x| x.as_i64()).unwrap_or(0),
                buy_avg: r.get("buyAvg").and_then(|x| x.as_f64()).unwrap_or(0.0),
                sell_avg: r.get("sellAvg").and_then(|x| x.as_f64()).unwrap_or(0.0),
            })
            .collect())
    }

    /// Daily bar N hari terakhir, digate lewat rate gate supaya
    /// scan beruntun tidak kena throttle upstream.
    async fn historical_daily(&self, symbol: &str, days: u32) -> Result<Vec<DailyBar>, GatewayError> {
        let security_id = self
            .instruments
            .security_id(symbol)
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))?;

        if !self.gate.acquire().await {
            return Err(GatewayError::RateLimited);
        }
        let _permit = self.gate.acquire_connection().await;

        let to = Utc::now().date_naive();
        let from = to - ChronoDuration::days(days as i64);
        let body = json!({
            "securityId": security_id.to_string(),
            "exchangeSegment": "NSE_EQ",
            "instrument": "EQUITY",
            "fromDate": from.format("%Y-%m-%d").to_string(),
            "toDate": to.format("%Y-%m-%d").to_string(),
        });

        let url = format!("{}/charts/historical", self.rest_base);
        let rsp = self
            .auth(self.http.post(&url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let v = rsp.json::<Value>().await?;

        let col = |name: &str| -> Vec<f64> {
            v.get(name)
                .and_then(|x| x.as_array())
                .map(|a| a.iter().filter_map(|x| x.as_f64()).collect())
                .unwrap_or_default()
        };
        let (open, high, low, close, volume, ts) = (
            col("open"),
            col("high"),
            col("low"),
            col("close"),
            col("volume"),
            col("timestamp"),
        );

        let n = close.len();
        if n == 0 || open.len() != n || high.len() != n || low.len() != n {
            return Err(GatewayError::Broker(format!("malformed history for {symbol}")));
        }

        Ok((0..n)
            .map(|i| DailyBar {
                date: ts
                    .get(i)
                    .and_then(|t| chrono::DateTime::from_timestamp(*t as i64, 0))
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_default(),
                open: open[i],
                high: high[i],
                low: low[i],
                close: close[i],
                volume: volume.get(i).copied().unwrap_or(0.0),
            })
            .collect())
    }
}
