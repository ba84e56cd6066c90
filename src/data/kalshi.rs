//! Kalshi REST adapter: market quotes in, orders out.
//!
//! Prices on the wire are integer cents; everything past this module works in
//! fractions of the $1 payout.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::{BlindedSigningKey, Signature};
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::data::types::{Market, Strike};
use crate::data::{QuoteSource, StrikeSource};
use crate::error::{DataError, ExchangeError};
use crate::execution::types::{OrderIntent, OrderOutcome};
use crate::execution::ExchangeTransport;
use crate::strategies::types::Side;

const MARKETS_PATH: &str = "/trade-api/v2/markets";
const ORDERS_PATH: &str = "/trade-api/v2/portfolio/orders";

/// Date and strike encoded in a weather ticker such as `KXHIGHPHIL-25JAN01-T45`.
#[derive(Debug, Clone, PartialEq)]
pub struct TickerInfo {
    pub series: String,
    pub date: NaiveDate,
    pub strike: Strike,
}

/// Parse series, resolution date and strike out of a market ticker.
///
/// `T` strikes are read as "above"; `B` strikes are 2°F buckets centred on the value.
/// The ticker cannot tell a low-tail threshold from a high one, so the traded
/// strike comes from [`market_strike`] whenever market metadata is available.
pub fn parse_ticker(ticker: &str) -> Result<TickerInfo, DataError> {
    let re = regex::Regex::new(r"^([A-Z0-9]+)-(\d{2}[A-Z]{3}\d{2})-([TB])(\d+(?:\.\d+)?)$")
        .map_err(|e| DataError::malformed(ticker, e.to_string()))?;
    let caps = re
        .captures(ticker)
        .ok_or_else(|| DataError::malformed(ticker, "unrecognised ticker format"))?;

    let date = NaiveDate::parse_from_str(&caps[2], "%y%b%d")
        .map_err(|e| DataError::malformed(ticker, format!("bad ticker date {}: {}", &caps[2], e)))?;
    let value: f64 = caps[4]
        .parse()
        .map_err(|e| DataError::malformed(ticker, format!("bad strike {}: {}", &caps[4], e)))?;

    let strike = match &caps[3] {
        "B" => Strike::Between(value - 1.0, value + 1.0),
        _ => Strike::Above(value),
    };

    Ok(TickerInfo {
        series: caps[1].to_string(),
        date,
        strike,
    })
}

/// Strike from Kalshi's `strike_type`/`floor_strike`/`cap_strike` fields.
///
/// Markets without structured strikes fall back to the ticker value, with the
/// direction of a `T` threshold taken from `<` or `>` in the title.
fn market_strike(market: &KalshiMarket) -> Result<Strike, DataError> {
    let bounds = (market.floor_strike, market.cap_strike);
    let structured = match (market.strike_type.as_deref(), bounds) {
        (Some("greater" | "greater_or_equal"), (Some(floor), _)) => Some(Strike::Above(floor)),
        (Some("less" | "less_or_equal"), (_, Some(cap))) => Some(Strike::Below(cap)),
        (Some("between"), (Some(floor), Some(cap))) => Some(Strike::Between(floor, cap)),
        _ => None,
    };
    if let Some(strike) = structured {
        return Ok(strike);
    }

    let ticker = parse_ticker(&market.ticker)?;
    Ok(match ticker.strike {
        Strike::Above(value) if market.title.contains('<') => Strike::Below(value),
        strike => strike,
    })
}

/// RSA-PSS request signer for the `KALSHI-ACCESS-*` headers.
#[derive(Clone)]
pub struct KalshiAuth {
    api_key: String,
    signing_key: BlindedSigningKey<Sha256>,
}

impl std::fmt::Debug for KalshiAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KalshiAuth")
            .field("api_key", &self.api_key)
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

impl KalshiAuth {
    /// Accepts PKCS#1 or PKCS#8 PEM; literal `\n` sequences are normalised.
    pub fn new(api_key: &str, pem: &str) -> Result<Self> {
        let pem = pem.replace("\\n", "\n");
        let pem = pem.trim();

        let private_key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .context("Failed to parse Kalshi RSA private key")?;

        Ok(Self {
            api_key: api_key.to_string(),
            signing_key: BlindedSigningKey::<Sha256>::new(private_key),
        })
    }

    /// Signs `{timestamp_ms}{METHOD}{path without query}`.
    fn sign(&self, method: &str, path: &str, timestamp_ms: i64) -> String {
        let path = path.split('?').next().unwrap_or(path);
        let message = format!("{}{}{}", timestamp_ms, method, path);
        let mut rng = rand::thread_rng();
        let signature: Signature = self.signing_key.sign_with_rng(&mut rng, message.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
    }

    fn headers(
        &self,
        method: &str,
        path: &str,
    ) -> Result<HeaderMap, reqwest::header::InvalidHeaderValue> {
        let timestamp_ms = Utc::now().timestamp_millis();
        let signature = self.sign(method, path, timestamp_ms);

        let mut headers = HeaderMap::new();
        headers.insert("KALSHI-ACCESS-KEY", HeaderValue::from_str(&self.api_key)?);
        headers.insert(
            "KALSHI-ACCESS-TIMESTAMP",
            HeaderValue::from_str(&timestamp_ms.to_string())?,
        );
        headers.insert("KALSHI-ACCESS-SIGNATURE", HeaderValue::from_str(&signature)?);
        Ok(headers)
    }
}

#[derive(Debug, Deserialize)]
struct KalshiMarket {
    ticker: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    yes_bid: i64,
    #[serde(default)]
    yes_ask: i64,
    #[serde(default)]
    close_time: Option<DateTime<Utc>>,
    #[serde(default)]
    tick_size: Option<i64>,
    #[serde(default)]
    strike_type: Option<String>,
    #[serde(default)]
    floor_strike: Option<f64>,
    #[serde(default)]
    cap_strike: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MarketResponse {
    market: KalshiMarket,
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    ticker: &'a str,
    side: Side,
    action: &'static str,
    client_order_id: &'a str,
    count: u64,
    #[serde(rename = "type")]
    order_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    yes_price: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    no_price: Option<i64>,
    time_in_force: &'static str,
}

#[derive(Debug, Deserialize)]
struct KalshiOrder {
    #[serde(default)]
    client_order_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    yes_price: i64,
    #[serde(default)]
    no_price: i64,
    #[serde(default)]
    fill_count: u64,
    #[serde(default)]
    initial_count: u64,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order: KalshiOrder,
}

#[derive(Debug, Deserialize)]
struct OrdersResponse {
    #[serde(default)]
    orders: Vec<KalshiOrder>,
    #[serde(default)]
    cursor: Option<String>,
}

const ORDERS_PAGE_LIMIT: &str = "200";

/// Result of scanning one page of the order list.
#[derive(Debug, PartialEq)]
enum PageScan {
    Found(OrderOutcome),
    Next(String),
    Exhausted,
}

fn scan_page(page: &OrdersResponse, intent: &OrderIntent) -> PageScan {
    if let Some(order) = page
        .orders
        .iter()
        .find(|o| o.client_order_id == intent.idempotency_key)
    {
        return PageScan::Found(order_outcome(order, intent));
    }
    match page.cursor.as_deref() {
        Some(cursor) if !cursor.is_empty() => PageScan::Next(cursor.to_string()),
        _ => PageScan::Exhausted,
    }
}

fn cents(price: f64) -> i64 {
    (price * 100.0).round() as i64
}

/// Map a terminal immediate-or-cancel order to an outcome.
fn order_outcome(order: &KalshiOrder, intent: &OrderIntent) -> OrderOutcome {
    let price_cents = match intent.side {
        Side::Yes => order.yes_price,
        Side::No => order.no_price,
    };
    let price = if price_cents > 0 {
        price_cents as f64 / 100.0
    } else {
        intent.limit_price
    };
    let wanted = if order.initial_count > 0 { order.initial_count } else { intent.quantity };

    match order.fill_count {
        0 => OrderOutcome::Rejected {
            reason: format!("unfilled at limit (status {})", order.status),
        },
        n if n >= wanted => OrderOutcome::Filled { quantity: n, price },
        n => OrderOutcome::PartiallyFilled { quantity: n, price },
    }
}

fn classify_status(status: StatusCode, body: String) -> ExchangeError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ExchangeError::Transient(format!("HTTP {}: {}", status.as_u16(), body))
    } else {
        ExchangeError::Rejected(format!("HTTP {}: {}", status.as_u16(), body))
    }
}

pub struct KalshiClient {
    client: Client,
    base_url: String,
    auth: Option<KalshiAuth>,
    /// Strikes never change for a ticker; filled as quotes are fetched.
    strikes: DashMap<String, Strike>,
}

impl KalshiClient {
    pub fn new(base_url: &str, auth: Option<KalshiAuth>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            auth,
            strikes: DashMap::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth_headers(&self, method: &str, path: &str) -> Result<HeaderMap, ExchangeError> {
        match &self.auth {
            Some(auth) => auth
                .headers(method, path)
                .map_err(|e| ExchangeError::Rejected(format!("invalid auth header: {}", e))),
            None => Ok(HeaderMap::new()),
        }
    }

    fn require_auth(&self) -> Result<(), ExchangeError> {
        if self.auth.is_none() {
            return Err(ExchangeError::Rejected("no Kalshi credentials configured".to_string()));
        }
        Ok(())
    }
}

impl KalshiClient {
    async fn fetch_market(&self, market_id: &str) -> Result<KalshiMarket, DataError> {
        let path = format!("{}/{}", MARKETS_PATH, market_id);
        let headers = self
            .auth_headers("GET", &path)
            .map_err(|e| DataError::unavailable(market_id, e.to_string()))?;

        let response = self
            .client
            .get(self.url(&path))
            .headers(headers)
            .send()
            .await
            .map_err(|e| DataError::unavailable(market_id, format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(DataError::unavailable(
                market_id,
                format!("HTTP {}", response.status().as_u16()),
            ));
        }

        let body: MarketResponse = response
            .json()
            .await
            .map_err(|e| DataError::malformed(market_id, format!("bad market body: {}", e)))?;

        match market_strike(&body.market) {
            Ok(strike) => {
                self.strikes.insert(market_id.to_string(), strike);
            }
            Err(e) => debug!(market_id, "No strike for market: {}", e),
        }
        Ok(body.market)
    }
}

#[async_trait]
impl QuoteSource for KalshiClient {
    async fn get_quote(&self, market_id: &str) -> Result<Market, DataError> {
        let m = self.fetch_market(market_id).await?;

        if m.status != "open" && m.status != "active" {
            return Err(DataError::unavailable(market_id, format!("market status {}", m.status)));
        }
        if m.yes_ask <= 0 {
            return Err(DataError::unavailable(market_id, "empty order book"));
        }

        let market = Market {
            id: m.ticker,
            condition: m.title,
            expiration: m.close_time.unwrap_or_else(Utc::now),
            bid: m.yes_bid as f64 / 100.0,
            ask: m.yes_ask as f64 / 100.0,
            tick_size: m.tick_size.unwrap_or(1) as f64 / 100.0,
            quoted_at: Utc::now(),
        };
        market.check()?;

        debug!(market_id, bid = market.bid, ask = market.ask, "Quote fetched");
        Ok(market)
    }
}

#[async_trait]
impl StrikeSource for KalshiClient {
    async fn strike(&self, market_id: &str) -> Result<Strike, DataError> {
        if let Some(strike) = self.strikes.get(market_id) {
            return Ok(*strike);
        }
        let market = self.fetch_market(market_id).await?;
        market_strike(&market)
    }
}

#[async_trait]
impl ExchangeTransport for KalshiClient {
    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderOutcome, ExchangeError> {
        self.require_auth()?;
        let headers = self.auth_headers("POST", ORDERS_PATH)?;

        let price = cents(intent.limit_price);
        let (yes_price, no_price) = match intent.side {
            Side::Yes => (Some(price), None),
            Side::No => (None, Some(price)),
        };
        let body = CreateOrderRequest {
            ticker: &intent.market_id,
            side: intent.side,
            action: "buy",
            client_order_id: &intent.idempotency_key,
            count: intent.quantity,
            order_type: "limit",
            yes_price,
            no_price,
            time_in_force: "immediate_or_cancel",
        };

        info!(
            market_id = %intent.market_id,
            key = %intent.idempotency_key,
            side = %intent.side,
            quantity = intent.quantity,
            price_cents = price,
            "Submitting order"
        );

        let response = self
            .client
            .post(self.url(ORDERS_PATH))
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            // Same client_order_id already accepted
            warn!(key = %intent.idempotency_key, "Duplicate order id, querying existing order");
            return self.lookup_order(intent).await?.ok_or_else(|| {
                ExchangeError::Transient("duplicate order id not found".to_string())
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let order: OrderResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("unreadable order response: {}", e)))?;

        Ok(order_outcome(&order.order, intent))
    }

    /// Find an order by client order id, following the cursor until the
    /// order turns up or the pages run out.
    async fn lookup_order(
        &self,
        intent: &OrderIntent,
    ) -> Result<Option<OrderOutcome>, ExchangeError> {
        self.require_auth()?;
        let mut cursor: Option<String> = None;

        loop {
            let headers = self.auth_headers("GET", ORDERS_PATH)?;
            let mut query = vec![
                ("ticker", intent.market_id.as_str()),
                ("client_order_id", intent.idempotency_key.as_str()),
                ("limit", ORDERS_PAGE_LIMIT),
            ];
            if let Some(c) = cursor.as_deref() {
                query.push(("cursor", c));
            }

            let response = self
                .client
                .get(self.url(ORDERS_PATH))
                .headers(headers)
                .query(&query)
                .send()
                .await
                .map_err(|e| ExchangeError::Transient(format!("request failed: {}", e)))?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(classify_status(status, text));
            }

            let page: OrdersResponse = response.json().await.map_err(|e| {
                ExchangeError::Transient(format!("unreadable orders response: {}", e))
            })?;

            match scan_page(&page, intent) {
                PageScan::Found(outcome) => return Ok(Some(outcome)),
                PageScan::Exhausted => return Ok(None),
                PageScan::Next(next) => {
                    if cursor.as_deref() == Some(next.as_str()) {
                        return Err(ExchangeError::Transient(format!(
                            "order list cursor {} did not advance",
                            next
                        )));
                    }
                    debug!(
                        key = %intent.idempotency_key,
                        "Order not on this page, following cursor"
                    );
                    cursor = Some(next);
                }
            }
        }
    }
}
