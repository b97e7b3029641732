//! A `QuoteSource` implementation against a J-Quants-shaped daily-bars API
//! (§4.2, §6). Transport only: no rate limiting or retry of its own — the
//! concurrency ceiling and retry policy both live at the caller layer
//! (§5), a deliberate deviation from this crate's ancestor.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use screener_core::{AuthError, Bar, BarSeries, FetchError, MarketSegment, QuoteSource, ScreenerError, Symbol};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const CREDENTIAL_WARN_AGE_DAYS: i64 = 5;
const CREDENTIAL_ERROR_AGE_DAYS: i64 = 7;

/// Opaque long-lived credential plus the moment it was issued, so
/// [`JQuantsSource::authenticate`] can enforce the 5/7-day age policy.
#[derive(Clone)]
pub struct Credential {
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
}

struct TokenState {
    id_token: Option<String>,
    fetched_at: Option<DateTime<Utc>>,
}

/// Coalesces concurrent token refreshes behind a single mutex: the first
/// caller to observe a stale token performs the HTTP round trip while
/// later callers block on the same lock and then see the fresh value.
struct TokenManager {
    state: Mutex<TokenState>,
    ttl: Duration,
}

impl TokenManager {
    fn new(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(TokenState { id_token: None, fetched_at: None }),
            ttl,
        }
    }

    fn is_fresh(state: &TokenState, ttl: Duration) -> bool {
        match (&state.id_token, state.fetched_at) {
            (Some(_), Some(at)) => Utc::now().signed_duration_since(at).to_std().unwrap_or(ttl) < ttl,
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct JQuantsSource {
    base_url: String,
    credential: Credential,
    client: Client,
    tokens: Arc<TokenManager>,
}

impl JQuantsSource {
    pub fn new(base_url: impl Into<String>, credential: Credential, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            base_url: base_url.into(),
            credential,
            client,
            tokens: Arc::new(TokenManager::new(Duration::from_secs(23 * 3600))),
        }
    }

    async fn refresh_id_token(&self) -> Result<String, AuthError> {
        let mut state = self.tokens.state.lock().await;
        if TokenManager::is_fresh(&state, self.tokens.ttl) {
            return Ok(state.id_token.clone().expect("checked fresh"));
        }

        let url = format!("{}/v1/token/auth_refresh", self.base_url);
        let response = self
            .client
            .post(&url)
            .query(&[("refreshtoken", self.credential.refresh_token.as_str())])
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 401 {
            return Err(AuthError::BadCredential);
        }
        if !status.is_success() {
            return Err(AuthError::Transport(format!("HTTP {status}")));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        state.id_token = Some(body.id_token.clone());
        state.fetched_at = Some(Utc::now());
        Ok(body.id_token)
    }

    fn credential_age_days(&self) -> i64 {
        Utc::now().signed_duration_since(self.credential.issued_at).num_days()
    }
}

#[async_trait]
impl QuoteSource for JQuantsSource {
    async fn authenticate(&self) -> Result<(), ScreenerError> {
        let age = self.credential_age_days();
        if age >= CREDENTIAL_ERROR_AGE_DAYS {
            tracing::error!(age_days = age, "quoteSourceCredential is stale, refresh is overdue");
            return Err(AuthError::Expired.into());
        } else if age >= CREDENTIAL_WARN_AGE_DAYS {
            tracing::warn!(age_days = age, "quoteSourceCredential is aging");
        }

        self.refresh_id_token().await.map_err(ScreenerError::from)?;
        Ok(())
    }

    async fn list_symbols(&self) -> Result<Vec<Symbol>, ScreenerError> {
        let token = self.refresh_id_token().await.map_err(ScreenerError::from)?;
        let url = format!("{}/v1/listed/info", self.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(classify_transport_error)?;

        if response.status().as_u16() == 401 {
            // Single coalesced retry after a forced refresh; mirrors §4.2's
            // "refreshes on Unauthorized" without looping indefinitely.
            let token = self.refresh_id_token().await.map_err(ScreenerError::from)?;
            return self.list_symbols_with_token(&token).await;
        }

        self.parse_symbols(response).await
    }

    async fn fetch_bars(
        &self,
        symbol: &Symbol,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Option<BarSeries>, ScreenerError> {
        let token = self.refresh_id_token().await.map_err(ScreenerError::from)?;
        let url = format!("{}/v1/prices/daily_quotes", self.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .query(&[
                ("code", symbol.code.as_str()),
                ("from", &from.format("%Y-%m-%d").to_string()),
                ("to", &to.format("%Y-%m-%d").to_string()),
            ])
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited(format!("HTTP 429 for {}", symbol.code)).into());
        }
        if status.as_u16() >= 500 {
            return Err(FetchError::NetworkTransient(format!("HTTP {status}")).into());
        }
        if !status.is_success() {
            return Err(FetchError::NetworkPermanent(format!("HTTP {status}")).into());
        }

        let body: DailyQuotesResponse = response
            .json()
            .await
            .map_err(|e| FetchError::NetworkPermanent(e.to_string()))?;

        if body.daily_quotes.is_empty() {
            return Ok(None);
        }

        let bars: Vec<Bar> = body
            .daily_quotes
            .into_iter()
            .filter_map(|q| q.into_bar())
            .collect();

        if bars.is_empty() {
            return Ok(None);
        }

        Ok(Some(BarSeries::new(bars)))
    }

    async fn is_trading_day(&self, date: NaiveDate) -> Result<bool, ScreenerError> {
        let token = self.refresh_id_token().await.map_err(ScreenerError::from)?;
        let url = format!("{}/v1/markets/trading_calendar", self.base_url);
        let date_str = date.format("%Y-%m-%d").to_string();

        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .query(&[("from", date_str.as_str()), ("to", date_str.as_str())])
            .send()
            .await
            .map_err(classify_transport_error)?;

        if !response.status().is_success() {
            return Err(FetchError::NetworkTransient(format!("HTTP {}", response.status())).into());
        }

        let body: TradingCalendarResponse = response
            .json()
            .await
            .map_err(|e| FetchError::NetworkPermanent(e.to_string()))?;

        Ok(body
            .trading_calendar
            .first()
            .map(|d| d.holiday_division == "1")
            .unwrap_or(false))
    }
}

impl JQuantsSource {
    async fn list_symbols_with_token(&self, token: &str) -> Result<Vec<Symbol>, ScreenerError> {
        let url = format!("{}/v1/listed/info", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(classify_transport_error)?;
        self.parse_symbols(response).await
    }

    async fn parse_symbols(&self, response: reqwest::Response) -> Result<Vec<Symbol>, ScreenerError> {
        if !response.status().is_success() {
            return Err(FetchError::NetworkPermanent(format!("HTTP {}", response.status())).into());
        }

        let body: ListedInfoResponse = response
            .json()
            .await
            .map_err(|e| FetchError::NetworkPermanent(e.to_string()))?;

        Ok(body
            .info
            .into_iter()
            .filter_map(|entry| entry.into_symbol())
            .collect())
    }
}

fn classify_transport_error(err: reqwest::Error) -> ScreenerError {
    if err.is_timeout() || err.is_connect() {
        FetchError::NetworkTransient(err.to_string()).into()
    } else {
        FetchError::NetworkPermanent(err.to_string()).into()
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(rename = "idToken")]
    id_token: String,
}

#[derive(Debug, Deserialize)]
struct ListedInfoResponse {
    #[serde(default)]
    info: Vec<ListedInfoEntry>,
}

#[derive(Debug, Deserialize)]
struct ListedInfoEntry {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "CompanyName")]
    company_name: String,
    #[serde(rename = "MarketCode")]
    market_code: String,
}

impl ListedInfoEntry {
    fn into_symbol(self) -> Option<Symbol> {
        let market_segment = match self.market_code.as_str() {
            "0111" => MarketSegment::Prime,
            "0112" => MarketSegment::Standard,
            "0113" => MarketSegment::Growth,
            _ => return None,
        };
        Some(Symbol {
            code: self.code,
            display_name: self.company_name,
            market_segment,
        })
    }
}

#[derive(Debug, Deserialize)]
struct DailyQuotesResponse {
    #[serde(default, rename = "daily_quotes")]
    daily_quotes: Vec<DailyQuoteEntry>,
}

#[derive(Debug, Deserialize)]
struct DailyQuoteEntry {
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Open")]
    open: Option<f64>,
    #[serde(rename = "High")]
    high: Option<f64>,
    #[serde(rename = "Low")]
    low: Option<f64>,
    #[serde(rename = "Close")]
    close: Option<f64>,
    #[serde(rename = "Volume")]
    volume: Option<f64>,
}

impl DailyQuoteEntry {
    fn into_bar(self) -> Option<Bar> {
        let date = NaiveDate::parse_from_str(&self.date, "%Y-%m-%d").ok()?;
        Some(Bar {
            date,
            open: self.open?,
            high: self.high?,
            low: self.low?,
            close: self.close?,
            volume: self.volume.unwrap_or(0.0).max(0.0) as u64,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TradingCalendarResponse {
    #[serde(default, rename = "trading_calendar")]
    trading_calendar: Vec<TradingCalendarEntry>,
}

#[derive(Debug, Deserialize)]
struct TradingCalendarEntry {
    #[serde(rename = "HolidayDivision")]
    holiday_division: String,
}
