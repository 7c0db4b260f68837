// =============================================================================
// Broker REST client — Tradier-style brokerage facade
// =============================================================================
//
// Semantic surface over the brokerage: quotes, chains, positions, balances,
// orders, placements, gain/loss. Every response is validated and converted
// into a closed struct at this boundary; `serde_json::Value` never leaks to
// callers.
//
// SECURITY: the access token is sent as a Bearer header and never logged or
// serialized.
// =============================================================================

use std::time::Duration;

use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::types::{OptionType, TradingMode};

/// Per-request deadline. Broker calls are tick-scoped; a hung request must
/// not stall the cycle past this.
const REQUEST_TIMEOUT_SECS: u64 = 20;

const PRODUCTION_BASE_URL: &str = "https://api.tradier.com";
const SANDBOX_BASE_URL: &str = "https://sandbox.tradier.com";

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Failures from the broker boundary, split so callers can classify
/// transient network trouble apart from rejected requests and malformed
/// payloads.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("broker returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("unexpected broker payload: {0}")]
    Decode(String),
}

impl BrokerError {
    /// Transient failures are retried on the next tick, never inline.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Http { status, .. } => *status >= 500,
            Self::Decode(_) => false,
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

// ---------------------------------------------------------------------------
// Response models
// ---------------------------------------------------------------------------

/// Top-of-book for an underlying.
#[derive(Debug, Clone, Serialize)]
pub struct UnderlyingQuote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
}

impl UnderlyingQuote {
    pub fn is_valid(&self) -> bool {
        self.bid > 0.0 && self.ask > 0.0 && self.last > 0.0 && self.bid <= self.ask
    }
}

/// One option leg from a chain fetch.
#[derive(Debug, Clone, Serialize)]
pub struct OptionQuote {
    /// OCC symbol.
    pub symbol: String,
    pub strike: f64,
    pub option_type: OptionType,
    pub bid: f64,
    pub ask: f64,
    pub last: Option<f64>,
    pub delta: Option<f64>,
    pub implied_volatility: Option<f64>,
    /// YYYY-MM-DD.
    pub expiration_date: String,
}

impl OptionQuote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    pub fn has_valid_quote(&self) -> bool {
        self.bid > 0.0 && self.ask > 0.0 && self.bid < self.ask
    }
}

/// A broker-held position (option or equity), quantity signed.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: f64,
    pub cost_basis_per_contract: Option<f64>,
    pub market_value: Option<f64>,
}

/// Account balances.
#[derive(Debug, Clone, Serialize)]
pub struct Balances {
    pub cash: f64,
    pub buying_power: f64,
    pub equity: f64,
    pub margin_requirement: f64,
}

/// An order as the broker reports it. `status` stays a raw string here; the
/// reconciler owns the normalization table.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerOrder {
    pub id: String,
    pub client_order_id: Option<String>,
    pub status: String,
    pub avg_fill_price: Option<f64>,
    pub filled_quantity: Option<f64>,
    pub remaining_quantity: Option<f64>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// One daily OHLC bar from the history endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DailyBar {
    pub date: String,
    pub close: f64,
}

/// Realized gain/loss line item.
#[derive(Debug, Clone, Serialize)]
pub struct GainLossItem {
    pub symbol: String,
    pub cost: f64,
    pub proceeds: f64,
    pub gain_loss: f64,
    pub close_date: String,
}

/// Acknowledgement of a placed order.
#[derive(Debug, Clone, Serialize)]
pub struct PlacedOrder {
    pub id: String,
}

// ---------------------------------------------------------------------------
// Order requests
// ---------------------------------------------------------------------------

/// Per-leg action on an option order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LegAction {
    BuyToOpen,
    SellToOpen,
    BuyToClose,
    SellToClose,
}

impl LegAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuyToOpen => "buy_to_open",
            Self::SellToOpen => "sell_to_open",
            Self::BuyToClose => "buy_to_close",
            Self::SellToClose => "sell_to_close",
        }
    }
}

/// One leg of a multileg order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderLeg {
    pub option_symbol: String,
    pub side: LegAction,
    pub quantity: i64,
}

/// The pricing style of a multileg order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpreadPricing {
    /// Limit order collecting at least `price` net credit.
    Credit(f64),
    /// Limit order paying at most `price` net debit.
    Debit(f64),
    Market,
}

/// A multileg spread order.
#[derive(Debug, Clone)]
pub struct SpreadOrderRequest {
    pub symbol: String,
    pub legs: Vec<OrderLeg>,
    pub pricing: SpreadPricing,
    /// Locally generated id, echoed back by the broker as the order tag.
    pub client_order_id: String,
    pub tag: String,
}

/// A single-leg market close.
#[derive(Debug, Clone)]
pub struct SingleLegCloseRequest {
    pub symbol: String,
    pub option_symbol: String,
    pub side: LegAction,
    pub quantity: i64,
    pub client_order_id: String,
    pub tag: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Brokerage REST client. Cheap to clone. The access token lives only in
/// the prebuilt Authorization header.
#[derive(Clone)]
pub struct BrokerClient {
    base_url: String,
    client: reqwest::Client,
}

impl BrokerClient {
    /// Create a client for the given trading mode. SANDBOX_PAPER talks to the
    /// broker's sandbox host; DRY_RUN and LIVE use production market data
    /// (DRY_RUN never places orders — the executor simulates them).
    pub fn new(token: impl Into<String>, mode: TradingMode) -> Self {
        let token = token.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&format!("Bearer {token}")) {
            default_headers.insert("Authorization", val);
        }
        default_headers.insert("Accept", HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        let base_url = match mode {
            TradingMode::SandboxPaper => SANDBOX_BASE_URL.to_string(),
            TradingMode::DryRun | TradingMode::Live => PRODUCTION_BASE_URL.to_string(),
        };

        debug!(base_url = %base_url, "BrokerClient initialised");

        Self { base_url, client }
    }

    // -------------------------------------------------------------------------
    // Transport helpers
    // -------------------------------------------------------------------------

    async fn get_json(&self, path_and_query: &str) -> BrokerResult<Value> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let resp = self.client.get(&url).send().await?;
        Self::read_body(resp).await
    }

    async fn post_form(&self, path: &str, form: &[(String, String)]) -> BrokerResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.post(&url).form(form).send().await?;
        Self::read_body(resp).await
    }

    async fn read_body(resp: reqwest::Response) -> BrokerResult<Value> {
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(BrokerError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text)
            .map_err(|e| BrokerError::Decode(format!("invalid JSON ({e}): {text}")))
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    /// Top-of-book quote for one underlying.
    #[instrument(skip(self), name = "broker::get_underlying_quote")]
    pub async fn get_underlying_quote(&self, symbol: &str) -> BrokerResult<UnderlyingQuote> {
        let body = self
            .get_json(&format!("/v1/markets/quotes?symbols={symbol}"))
            .await?;

        let quote = body
            .pointer("/quotes/quote")
            .ok_or_else(|| BrokerError::Decode(format!("no quote for {symbol}")))?;
        // A multi-symbol request returns an array; we only ever ask for one.
        let quote = quote.as_array().and_then(|a| a.first()).unwrap_or(quote);

        Ok(UnderlyingQuote {
            symbol: str_field(quote, "symbol").unwrap_or_else(|| symbol.to_string()),
            bid: num_field(quote, "bid").unwrap_or(0.0),
            ask: num_field(quote, "ask").unwrap_or(0.0),
            last: num_field(quote, "last").unwrap_or(0.0),
        })
    }

    /// Full option chain for one expiration, with greeks when available.
    #[instrument(skip(self), name = "broker::get_option_chain")]
    pub async fn get_option_chain(
        &self,
        symbol: &str,
        expiration: NaiveDate,
    ) -> BrokerResult<Vec<OptionQuote>> {
        let body = self
            .get_json(&format!(
                "/v1/markets/options/chains?symbol={symbol}&expiration={}&greeks=true",
                expiration.format("%Y-%m-%d")
            ))
            .await?;

        let options = match body.pointer("/options/option") {
            Some(v) => one_or_many(v),
            // "options": null means an empty chain, not an error.
            None => Vec::new(),
        };

        let mut out = Vec::with_capacity(options.len());
        for opt in options {
            let Some(option_type) = str_field(opt, "option_type")
                .and_then(|s| s.parse::<OptionType>().ok())
            else {
                continue;
            };
            let Some(strike) = num_field(opt, "strike") else {
                continue;
            };

            out.push(OptionQuote {
                symbol: str_field(opt, "symbol").unwrap_or_default(),
                strike,
                option_type,
                bid: num_field(opt, "bid").unwrap_or(0.0),
                ask: num_field(opt, "ask").unwrap_or(0.0),
                last: num_field(opt, "last"),
                delta: opt.pointer("/greeks/delta").and_then(Value::as_f64),
                implied_volatility: opt.pointer("/greeks/mid_iv").and_then(Value::as_f64),
                expiration_date: str_field(opt, "expiration_date")
                    .unwrap_or_else(|| expiration.format("%Y-%m-%d").to_string()),
            });
        }

        debug!(symbol, count = out.len(), "option chain fetched");
        Ok(out)
    }

    /// Daily closing bars, most recent last.
    #[instrument(skip(self), name = "broker::get_daily_history")]
    pub async fn get_daily_history(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BrokerResult<Vec<DailyBar>> {
        let body = self
            .get_json(&format!(
                "/v1/markets/history?symbol={symbol}&interval=daily&start={}&end={}",
                start.format("%Y-%m-%d"),
                end.format("%Y-%m-%d")
            ))
            .await?;

        let days = match body.pointer("/history/day") {
            Some(v) => one_or_many(v),
            None => Vec::new(),
        };

        let mut out = Vec::with_capacity(days.len());
        for day in days {
            if let (Some(date), Some(close)) = (str_field(day, "date"), num_field(day, "close")) {
                out.push(DailyBar { date, close });
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "broker::get_positions")]
    pub async fn get_positions(&self, account_id: &str) -> BrokerResult<Vec<BrokerPosition>> {
        let body = self
            .get_json(&format!("/v1/accounts/{account_id}/positions"))
            .await?;

        let positions = match body.pointer("/positions/position") {
            Some(v) => one_or_many(v),
            None => Vec::new(),
        };

        let mut out = Vec::with_capacity(positions.len());
        for pos in positions {
            let Some(symbol) = str_field(pos, "symbol") else {
                continue;
            };
            let quantity = num_field(pos, "quantity").unwrap_or(0.0);
            let cost_basis = num_field(pos, "cost_basis");
            let cost_basis_per_contract = cost_basis.and_then(|cb| {
                if quantity.abs() > 0.0 {
                    Some(cb / quantity.abs())
                } else {
                    None
                }
            });

            out.push(BrokerPosition {
                symbol,
                quantity,
                cost_basis_per_contract,
                market_value: num_field(pos, "market_value"),
            });
        }

        debug!(account_id, count = out.len(), "positions fetched");
        Ok(out)
    }

    #[instrument(skip(self), name = "broker::get_balances")]
    pub async fn get_balances(&self, account_id: &str) -> BrokerResult<Balances> {
        let body = self
            .get_json(&format!("/v1/accounts/{account_id}/balances"))
            .await?;

        let balances = body
            .pointer("/balances")
            .ok_or_else(|| BrokerError::Decode("balances missing from response".to_string()))?;

        Ok(Balances {
            cash: num_field(balances, "total_cash").unwrap_or(0.0),
            buying_power: balances
                .pointer("/margin/option_buying_power")
                .and_then(Value::as_f64)
                .or_else(|| num_field(balances, "option_buying_power"))
                .unwrap_or(0.0),
            equity: num_field(balances, "total_equity").unwrap_or(0.0),
            margin_requirement: num_field(balances, "margin_requirement").unwrap_or(0.0),
        })
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// All orders in the account within the given window.
    #[instrument(skip(self), name = "broker::get_all_orders")]
    pub async fn get_all_orders(
        &self,
        account_id: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> BrokerResult<Vec<BrokerOrder>> {
        let mut path = format!("/v1/accounts/{account_id}/orders?includeTags=true");
        if let Some(f) = from {
            path.push_str(&format!("&start={}", f.format("%Y-%m-%d")));
        }
        if let Some(t) = to {
            path.push_str(&format!("&end={}", t.format("%Y-%m-%d")));
        }

        let body = self.get_json(&path).await?;
        let orders = match body.pointer("/orders/order") {
            Some(v) => one_or_many(v),
            None => Vec::new(),
        };

        Ok(orders.iter().map(|o| parse_broker_order(o)).collect())
    }

    #[instrument(skip(self), name = "broker::get_order")]
    pub async fn get_order(&self, account_id: &str, broker_order_id: &str) -> BrokerResult<BrokerOrder> {
        let body = self
            .get_json(&format!(
                "/v1/accounts/{account_id}/orders/{broker_order_id}?includeTags=true"
            ))
            .await?;

        let order = body
            .pointer("/order")
            .ok_or_else(|| BrokerError::Decode(format!("order {broker_order_id} missing from response")))?;
        Ok(parse_broker_order(order))
    }

    /// Place a multileg spread order.
    #[instrument(skip(self, request), name = "broker::place_spread_order")]
    pub async fn place_spread_order(
        &self,
        account_id: &str,
        request: &SpreadOrderRequest,
    ) -> BrokerResult<PlacedOrder> {
        let mut form: Vec<(String, String)> = vec![
            ("class".into(), "multileg".into()),
            ("symbol".into(), request.symbol.clone()),
            ("duration".into(), "day".into()),
            ("tag".into(), request.client_order_id.clone()),
        ];

        match request.pricing {
            SpreadPricing::Credit(price) => {
                form.push(("type".into(), "credit".into()));
                form.push(("price".into(), format!("{price:.2}")));
            }
            SpreadPricing::Debit(price) => {
                form.push(("type".into(), "debit".into()));
                form.push(("price".into(), format!("{price:.2}")));
            }
            SpreadPricing::Market => {
                form.push(("type".into(), "market".into()));
            }
        }

        for (i, leg) in request.legs.iter().enumerate() {
            form.push((format!("option_symbol[{i}]"), leg.option_symbol.clone()));
            form.push((format!("side[{i}]"), leg.side.as_str().to_string()));
            form.push((format!("quantity[{i}]"), leg.quantity.to_string()));
        }

        let body = self
            .post_form(&format!("/v1/accounts/{account_id}/orders"), &form)
            .await?;
        extract_order_ack(&body)
    }

    /// Place a single-leg market close.
    #[instrument(skip(self, request), name = "broker::place_single_leg_close")]
    pub async fn place_single_leg_close_order(
        &self,
        account_id: &str,
        request: &SingleLegCloseRequest,
    ) -> BrokerResult<PlacedOrder> {
        let form: Vec<(String, String)> = vec![
            ("class".into(), "option".into()),
            ("symbol".into(), request.symbol.clone()),
            ("option_symbol".into(), request.option_symbol.clone()),
            ("side".into(), request.side.as_str().to_string()),
            ("quantity".into(), request.quantity.to_string()),
            ("type".into(), "market".into()),
            ("duration".into(), "day".into()),
            ("tag".into(), request.client_order_id.clone()),
        ];

        let body = self
            .post_form(&format!("/v1/accounts/{account_id}/orders"), &form)
            .await?;
        extract_order_ack(&body)
    }

    /// Realized gain/loss line items for a closed-date window.
    #[instrument(skip(self), name = "broker::get_gain_loss")]
    pub async fn get_gain_loss(
        &self,
        account_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BrokerResult<Vec<GainLossItem>> {
        let body = self
            .get_json(&format!(
                "/v1/accounts/{account_id}/gainloss?start={}&end={}",
                start.format("%Y-%m-%d"),
                end.format("%Y-%m-%d")
            ))
            .await?;

        let items = match body.pointer("/gainloss/closed_position") {
            Some(v) => one_or_many(v),
            None => Vec::new(),
        };

        Ok(items
            .iter()
            .filter_map(|i| {
                Some(GainLossItem {
                    symbol: str_field(i, "symbol")?,
                    cost: num_field(i, "cost")?,
                    proceeds: num_field(i, "proceeds")?,
                    gain_loss: num_field(i, "gain_loss")?,
                    close_date: str_field(i, "close_date")?,
                })
            })
            .collect())
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Boundary parsing helpers
// ---------------------------------------------------------------------------

/// The broker collapses single-element arrays into bare objects; normalize
/// both shapes to a slice of values.
fn one_or_many(v: &Value) -> Vec<&Value> {
    match v {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Numeric fields arrive as numbers or numeric strings depending on endpoint.
fn num_field(v: &Value, key: &str) -> Option<f64> {
    match v.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

fn parse_broker_order(order: &Value) -> BrokerOrder {
    let id = match order.get("id") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    };

    BrokerOrder {
        id,
        client_order_id: str_field(order, "tag"),
        status: str_field(order, "status").unwrap_or_default(),
        avg_fill_price: num_field(order, "avg_fill_price"),
        filled_quantity: num_field(order, "exec_quantity"),
        remaining_quantity: num_field(order, "remaining_quantity"),
        created_at: str_field(order, "create_date"),
        updated_at: str_field(order, "transaction_date"),
    }
}

fn extract_order_ack(body: &Value) -> BrokerResult<PlacedOrder> {
    let id = body
        .pointer("/order/id")
        .map(|v| match v {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .ok_or_else(|| BrokerError::Decode(format!("order ack missing id: {body}")))?;
    Ok(PlacedOrder { id })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_or_many_handles_both_shapes() {
        let single = serde_json::json!({"a": 1});
        assert_eq!(one_or_many(&single).len(), 1);

        let many = serde_json::json!([{"a": 1}, {"a": 2}]);
        assert_eq!(one_or_many(&many).len(), 2);

        assert!(one_or_many(&Value::Null).is_empty());
    }

    #[test]
    fn num_field_accepts_strings_and_numbers() {
        let v = serde_json::json!({"a": "1.25", "b": 2.5, "c": "junk"});
        assert_eq!(num_field(&v, "a"), Some(1.25));
        assert_eq!(num_field(&v, "b"), Some(2.5));
        assert_eq!(num_field(&v, "c"), None);
        assert_eq!(num_field(&v, "missing"), None);
    }

    #[test]
    fn broker_order_parsing_maps_tag_to_client_id() {
        let raw = serde_json::json!({
            "id": 228175,
            "status": "filled",
            "tag": "c-abc123",
            "avg_fill_price": 0.65,
            "exec_quantity": 1.0,
            "remaining_quantity": 0.0,
            "create_date": "2025-01-17T14:31:02.000Z",
            "transaction_date": "2025-01-17T14:31:08.000Z"
        });
        let order = parse_broker_order(&raw);
        assert_eq!(order.id, "228175");
        assert_eq!(order.client_order_id.as_deref(), Some("c-abc123"));
        assert_eq!(order.status, "filled");
        assert_eq!(order.avg_fill_price, Some(0.65));
        assert_eq!(order.remaining_quantity, Some(0.0));
    }

    #[test]
    fn order_ack_extraction() {
        let ok = serde_json::json!({"order": {"id": 99, "status": "ok"}});
        assert_eq!(extract_order_ack(&ok).unwrap().id, "99");

        let bad = serde_json::json!({"errors": {"error": "quantity must be positive"}});
        assert!(extract_order_ack(&bad).is_err());
    }

    #[test]
    fn quote_validity() {
        let good = UnderlyingQuote { symbol: "SPY".into(), bid: 580.1, ask: 580.2, last: 580.15 };
        assert!(good.is_valid());
        let crossed = UnderlyingQuote { symbol: "SPY".into(), bid: 580.3, ask: 580.2, last: 580.15 };
        assert!(!crossed.is_valid());
        let empty = UnderlyingQuote { symbol: "SPY".into(), bid: 0.0, ask: 580.2, last: 580.15 };
        assert!(!empty.is_valid());
    }

    #[test]
    fn option_quote_mid_and_spread() {
        let q = OptionQuote {
            symbol: "SPY   250117P00580000".into(),
            strike: 580.0,
            option_type: OptionType::Put,
            bid: 1.00,
            ask: 1.10,
            last: None,
            delta: Some(-0.28),
            implied_volatility: Some(0.21),
            expiration_date: "2025-01-17".into(),
        };
        assert!((q.mid() - 1.05).abs() < 1e-9);
        assert!((q.spread() - 0.10).abs() < 1e-9);
        assert!(q.has_valid_quote());
    }

    #[test]
    fn http_error_transience() {
        let server = BrokerError::Http { status: 502, body: "bad gateway".into() };
        assert!(server.is_transient());
        let client = BrokerError::Http { status: 400, body: "bad request".into() };
        assert!(!client.is_transient());
        let decode = BrokerError::Decode("oops".into());
        assert!(!decode.is_transient());
    }
}
