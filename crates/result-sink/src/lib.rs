//! A `ResultSink` (§4.9) backed by a relational store via `sqlx`.
//!
//! Schema lives under `migrations/` and is applied with `sqlx::migrate!`,
//! matching the teacher's own `sqlx` + SQLite stack (see
//! `portfolio-manager`'s schema setup) rather than introducing a second
//! persistence dependency. The `Detection::attrs` bag's well-known keys
//! are unpacked into named columns per §6's row shape; anything a rule
//! puts in `attrs` beyond those columns rides along as `attrs_json`.

use std::collections::HashMap;

use async_trait::async_trait;
use screener_core::{AttrValue, Detection, ResultSink, RunId, RunSummary, ScreenerError};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Named columns every rule may populate (§6). Anything in a `Detection`'s
/// `attrs` outside this set is serialized into `attrs_json` instead.
const NAMED_ATTR_KEYS: &[&str] = &[
    "ema10",
    "ema20",
    "ema50",
    "sma200",
    "sma200Position",
    "high52w",
    "pullbackPct",
    "touchEMA",
    "bbMid",
    "bbUpper",
    "bbLower",
    "touchDirection",
    "stochK",
    "stochD",
];

pub struct SqlResultSink {
    pool: SqlitePool,
    user_id: String,
}

impl SqlResultSink {
    /// Connects (creating the database file if missing) and applies
    /// pending migrations.
    pub async fn new(database_url: &str, user_id: impl Into<String>) -> Result<Self, ScreenerError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| ScreenerError::Config(format!("invalid resultSinkCredential: {e}")))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| ScreenerError::SinkSummaryError(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| ScreenerError::SinkSummaryError(e.to_string()))?;

        Ok(Self { pool, user_id: user_id.into() })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn number_attr(attrs: &HashMap<String, AttrValue>, key: &str) -> Option<f64> {
    match attrs.get(key) {
        Some(AttrValue::Number(n)) => Some(*n),
        _ => None,
    }
}

fn text_attr(attrs: &HashMap<String, AttrValue>, key: &str) -> Option<String> {
    match attrs.get(key) {
        Some(AttrValue::Text(s)) => Some(s.clone()),
        Some(AttrValue::Number(n)) => Some(n.to_string()),
        None => None,
    }
}

fn leftover_attrs_json(attrs: &HashMap<String, AttrValue>) -> String {
    let leftover: HashMap<&str, serde_json::Value> = attrs
        .iter()
        .filter(|(k, _)| !NAMED_ATTR_KEYS.contains(&k.as_str()))
        .map(|(k, v)| {
            let value = match v {
                AttrValue::Number(n) => serde_json::Value::from(*n),
                AttrValue::Text(s) => serde_json::Value::String(s.clone()),
            };
            (k.as_str(), value)
        })
        .collect();
    serde_json::to_string(&leftover).unwrap_or_else(|_| "{}".to_string())
}

#[async_trait]
impl ResultSink for SqlResultSink {
    async fn save_run(&self, summary: &RunSummary) -> Result<RunId, ScreenerError> {
        let row = sqlx::query(
            "INSERT INTO run_summary (user_id, rule, trading_date, market_filter, total_matched, exec_millis)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.user_id)
        .bind(summary.rule.as_str())
        .bind(summary.trading_date.format("%Y-%m-%d").to_string())
        .bind(&summary.market_filter)
        .bind(summary.total_matched as i64)
        .bind(summary.exec_millis as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| ScreenerError::SinkSummaryError(e.to_string()))?;

        Ok(RunId(row.last_insert_rowid()))
    }

    async fn save_detections(&self, run_id: RunId, detections: &[Detection]) -> Result<(), ScreenerError> {
        if detections.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ScreenerError::SinkDetectionError(e.to_string()))?;

        for d in detections {
            let attrs = &d.attrs;
            sqlx::query(
                "INSERT INTO detections (
                    run_id, code, name, market, bar_date, close_price, volume,
                    ema10, ema20, ema50, sma200, sma200_position, week52_high,
                    touch_ema, pullback_pct, bb_upper, bb_lower, bb_mid,
                    touch_direction, stoch_k, stoch_d, attrs_json
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(run_id.0)
            .bind(&d.symbol.code)
            .bind(&d.symbol.display_name)
            .bind(d.symbol.market_segment.as_str())
            .bind(d.bar_date.format("%Y-%m-%d").to_string())
            .bind(d.price)
            .bind(d.volume as i64)
            .bind(number_attr(attrs, "ema10"))
            .bind(number_attr(attrs, "ema20"))
            .bind(number_attr(attrs, "ema50"))
            .bind(number_attr(attrs, "sma200"))
            .bind(text_attr(attrs, "sma200Position"))
            .bind(number_attr(attrs, "high52w"))
            .bind(text_attr(attrs, "touchEMA"))
            .bind(number_attr(attrs, "pullbackPct"))
            .bind(number_attr(attrs, "bbUpper"))
            .bind(number_attr(attrs, "bbLower"))
            .bind(number_attr(attrs, "bbMid"))
            .bind(text_attr(attrs, "touchDirection"))
            .bind(number_attr(attrs, "stochK"))
            .bind(number_attr(attrs, "stochD"))
            .bind(leftover_attrs_json(attrs))
            .execute(&mut *tx)
            .await
            .map_err(|e| ScreenerError::SinkDetectionError(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| ScreenerError::SinkDetectionError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use screener_core::{MarketSegment, RuleName, Symbol};

    fn symbol() -> Symbol {
        Symbol {
            code: "7203".to_string(),
            display_name: "Toyota".to_string(),
            market_segment: MarketSegment::Prime,
        }
    }

    async fn sink() -> SqlResultSink {
        SqlResultSink::new("sqlite::memory:", "test-user").await.unwrap()
    }

    #[tokio::test]
    async fn save_run_returns_an_id() {
        let sink = sink().await;
        let summary = RunSummary {
            rule: RuleName::PerfectOrder,
            trading_date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            market_filter: "all".to_string(),
            total_matched: 42,
            exec_millis: 1234,
        };
        let run_id = sink.save_run(&summary).await.unwrap();
        assert!(run_id.0 > 0);
    }

    #[tokio::test]
    async fn save_detections_unpacks_named_attrs_and_keeps_leftovers_as_json() {
        let sink = sink().await;
        let summary = RunSummary {
            rule: RuleName::Squeeze,
            trading_date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            market_filter: "all".to_string(),
            total_matched: 1,
            exec_millis: 10,
        };
        let run_id = sink.save_run(&summary).await.unwrap();

        let mut attrs = HashMap::new();
        attrs.insert("ema50".to_string(), AttrValue::from(1000.0));
        attrs.insert("bbwRatio".to_string(), AttrValue::from(1.1));
        attrs.insert("duration".to_string(), AttrValue::from(7.0));

        let detection = Detection {
            symbol: symbol(),
            rule: RuleName::Squeeze,
            bar_date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            price: 1000.0,
            volume: 5000,
            attrs,
        };

        sink.save_detections(run_id, &[detection]).await.unwrap();

        let row: (Option<f64>, String) = sqlx::query_as("SELECT ema50, attrs_json FROM detections WHERE run_id = ?")
            .bind(run_id.0)
            .fetch_one(sink.pool())
            .await
            .unwrap();

        assert_eq!(row.0, Some(1000.0));
        assert!(row.1.contains("bbwRatio"));
        assert!(row.1.contains("duration"));
        assert!(!row.1.contains("ema50"));
    }

    #[tokio::test]
    async fn save_detections_is_a_noop_for_an_empty_slice() {
        let sink = sink().await;
        let summary = RunSummary {
            rule: RuleName::BollingerTouch,
            trading_date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            market_filter: "all".to_string(),
            total_matched: 0,
            exec_millis: 5,
        };
        let run_id = sink.save_run(&summary).await.unwrap();
        sink.save_detections(run_id, &[]).await.unwrap();
    }
}
