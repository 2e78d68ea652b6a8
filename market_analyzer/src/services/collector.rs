use chrono::Utc;
use reqwest::Client;
use serde_json::Value;

use crate::config::MarketConfig;
use crate::errors::{AnalyzerError, Result};
use crate::models::{Candle, MarketSnapshot};

/// Перевод метки таймфрейма в параметр `interval` Bybit v5.
pub fn exchange_interval(timeframe: &str) -> Option<&'static str> {
    let interval = match timeframe {
        "1m" => "1",
        "3m" => "3",
        "5m" => "5",
        "15m" => "15",
        "30m" => "30",
        "1h" => "60",
        "2h" => "120",
        "4h" => "240",
        "6h" => "360",
        "12h" => "720",
        "1d" => "D",
        "1w" => "W",
        _ => return None,
    };
    Some(interval)
}

fn timeframe_millis(timeframe: &str) -> i64 {
    let minutes = match timeframe {
        "1m" => 1,
        "3m" => 3,
        "15m" => 15,
        "30m" => 30,
        "1h" => 60,
        "2h" => 120,
        "4h" => 240,
        "6h" => 360,
        "12h" => 720,
        "1d" => 1440,
        "1w" => 10080,
        _ => 5,
    };
    minutes * 60 * 1000
}

#[derive(Clone)]
pub struct MarketDataCollector {
    client: Client,
    config: MarketConfig,
}

impl MarketDataCollector {
    pub fn new(config: MarketConfig) -> Self {
        MarketDataCollector {
            client: Client::new(),
            config,
        }
    }

    pub async fn fetch_snapshot(&self, symbol: &str, timeframe: &str) -> Result<MarketSnapshot> {
        let interval = exchange_interval(timeframe).ok_or_else(|| {
            AnalyzerError::DataUnavailable(format!("unsupported timeframe '{}'", timeframe))
        })?;

        let url = format!("{}/v5/market/kline", self.config.base_url.trim_end_matches('/'));
        let limit = self.config.limit.to_string();

        tracing::info!("Получение {} свечей {} {} с биржи", limit, symbol, timeframe);
        tracing::debug!("URL: {}", url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("category", self.config.category.as_str()),
                ("symbol", symbol),
                ("interval", interval),
                ("limit", limit.as_str()),
            ])
            .timeout(std::time::Duration::from_secs(self.config.timeout_secs))
            .send()
            .await
            .map_err(|e| AnalyzerError::DataUnavailable(format!("exchange request failed: {}", e)))?;
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Неизвестная ошибка".to_string());
            let snippet: String = error_text.chars().take(300).collect();
            return Err(AnalyzerError::DataUnavailable(format!(
                "exchange API error: {} - {}",
                status, snippet
            )));
        }

        let json: Value = response.json().await.map_err(|e| {
            AnalyzerError::DataUnavailable(format!("exchange returned invalid JSON: {}", e))
        })?;

        let candles = parse_kline_payload(&json)?;
        let snapshot = MarketSnapshot::from_candles(symbol, timeframe, candles)?;

        tracing::info!(
            "Получено {} свечей {}, цена {:.2}, изменение {:+.2}%",
            snapshot.candles.len(),
            symbol,
            snapshot.last_price,
            snapshot.pct_change_over_window
        );
        Ok(snapshot)
    }

    /// Детерминированная замена рыночных данных для режима fallback.
    pub fn synthetic_snapshot(&self, symbol: &str, timeframe: &str) -> Result<MarketSnapshot> {
        tracing::warn!("Генерация синтетических данных {} {}", symbol, timeframe);

        let count = self.config.limit.max(1);
        let step = timeframe_millis(timeframe);
        let end_time = Utc::now().timestamp_millis() / step * step;

        let mut base_price = self.config.fallback_base_price;
        let mut previous_close = base_price;
        let mut candles = Vec::with_capacity(count);

        for i in 0..count {
            let x = i as f64;
            // Плавный тренд, короткие колебания и шум
            let change = (x * 0.1).sin() * 0.003
                + (x * 0.7).cos() * 0.0015
                + (x.powf(1.2) * 0.01).sin() * 0.001;

            let close = base_price * (1.0 + change);
            base_price = close * 0.98 + base_price * 0.02;

            let open = previous_close;
            candles.push(Candle {
                time: end_time - (count - i - 1) as i64 * step,
                open,
                high: open.max(close) * 1.0005,
                low: open.min(close) * 0.9995,
                close,
                volume: 100.0 + (x * 0.3).sin().abs() * 50.0,
            });
            previous_close = close;
        }

        Ok(MarketSnapshot::from_candles(symbol, timeframe, candles)?.into_synthetic())
    }
}

/// Разбор ответа `/v5/market/kline`: строки приходят от новой свечи к старой,
/// числа строками.
pub fn parse_kline_payload(json: &Value) -> Result<Vec<Candle>> {
    let ret_code = json["retCode"].as_i64().ok_or_else(|| {
        AnalyzerError::DataUnavailable("missing retCode in exchange response".to_string())
    })?;
    if ret_code != 0 {
        let message = json["retMsg"].as_str().unwrap_or("unknown error");
        return Err(AnalyzerError::DataUnavailable(format!(
            "exchange API error {}: {}",
            ret_code, message
        )));
    }

    let rows = json["result"]["list"].as_array().ok_or_else(|| {
        AnalyzerError::DataUnavailable("missing result.list in exchange response".to_string())
    })?;

    if rows.is_empty() {
        return Err(AnalyzerError::DataUnavailable(
            "exchange returned an empty candle list".to_string(),
        ));
    }

    rows.iter().map(parse_kline_row).collect()
}

fn parse_kline_row(row: &Value) -> Result<Candle> {
    let fields = row.as_array().ok_or_else(|| {
        AnalyzerError::DataUnavailable("candle row is not an array".to_string())
    })?;

    if fields.len() < 6 {
        return Err(AnalyzerError::DataUnavailable(format!(
            "candle row has {} fields, expected at least 6",
            fields.len()
        )));
    }

    let number = |index: usize, name: &str| -> Result<f64> {
        let value = &fields[index];
        let parsed = match value {
            Value::String(s) => s.parse::<f64>().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        };
        parsed.ok_or_else(|| {
            AnalyzerError::DataUnavailable(format!("invalid {} value: {}", name, value))
        })
    };

    Ok(Candle {
        time: number(0, "timestamp")? as i64,
        open: number(1, "open")?,
        high: number(2, "high")?,
        low: number(3, "low")?,
        close: number(4, "close")?,
        volume: number(5, "volume")?,
    })
}
