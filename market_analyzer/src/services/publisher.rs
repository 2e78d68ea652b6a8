use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;

use crate::config::WebhookConfig;
use crate::models::{
    KeyFactors, Recommendation, RiskLevel, SignalAnalysis, TargetZones, TradeSignal, TradeStatus,
    TradeUpdate,
};

const SOURCE: &str = "market_analyzer";
const EXCHANGE: &str = "bybit";

#[derive(Debug, Serialize)]
pub struct SignalPayload<'a> {
    pub timestamp: DateTime<Utc>,
    pub signal: SignalBody<'a>,
    pub indicators: BTreeMap<String, f64>,
    pub source: &'static str,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_analysis: Option<AiSummary<'a>>,
}

#[derive(Debug, Serialize)]
pub struct SignalBody<'a> {
    pub strategy: &'a str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub symbol: &'a str,
    pub price: f64,
    pub exchange: &'static str,
    pub timeframe: &'a str,
    pub reason: &'a str,
}

#[derive(Debug, Serialize)]
pub struct AiSummary<'a> {
    pub recommendation: Recommendation,
    pub confidence: u8,
    pub risk_level: RiskLevel,
    pub summary: &'a str,
    pub key_factors: &'a KeyFactors,
    pub target_zones: &'a TargetZones,
}

#[derive(Debug, Serialize)]
pub struct TradePayload<'a> {
    pub timestamp: DateTime<Utc>,
    pub trade_result: TradeBody<'a>,
    pub source: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct TradeBody<'a> {
    pub symbol: &'a str,
    pub strategy: &'a str,
    pub status: TradeStatus,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub pnl: f64,
    pub duration_secs: Option<u64>,
    pub result: &'static str,
}

pub fn signal_payload<'a>(
    signal: &'a TradeSignal,
    analysis: Option<&'a SignalAnalysis>,
    indicators: BTreeMap<String, f64>,
) -> SignalPayload<'a> {
    SignalPayload {
        timestamp: Utc::now(),
        signal: SignalBody {
            strategy: &signal.strategy,
            kind: signal.signal_type.as_str(),
            symbol: &signal.symbol,
            price: signal.price,
            exchange: EXCHANGE,
            timeframe: &signal.timeframe,
            reason: &signal.reason,
        },
        indicators,
        source: SOURCE,
        version: env!("CARGO_PKG_VERSION"),
        ai_analysis: analysis.map(|a| AiSummary {
            recommendation: a.recommendation,
            confidence: a.confidence_percent,
            risk_level: a.risk_level,
            summary: &a.summary,
            key_factors: &a.key_factors,
            target_zones: &a.target_zones,
        }),
    }
}

pub fn trade_payload(update: &TradeUpdate) -> TradePayload<'_> {
    TradePayload {
        timestamp: Utc::now(),
        trade_result: TradeBody {
            symbol: &update.symbol,
            strategy: &update.strategy,
            status: update.status,
            entry_price: update.entry_price,
            exit_price: update.exit_price,
            pnl: update.pnl,
            duration_secs: update.duration_secs,
            result: if update.pnl > 0.0 { "PROFIT" } else { "LOSS" },
        },
        source: SOURCE,
        version: env!("CARGO_PKG_VERSION"),
    }
}

/// Рассылка сигналов и итогов сделок на внешние вебхуки.
/// Ошибки только логируются, вызывающий получает `bool`.
#[derive(Clone)]
pub struct SignalPublisher {
    client: Client,
    config: WebhookConfig,
}

impl SignalPublisher {
    pub fn new(config: WebhookConfig) -> Self {
        SignalPublisher {
            client: Client::new(),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.config.urls.is_empty()
    }

    pub async fn publish_signal(
        &self,
        signal: &TradeSignal,
        analysis: Option<&SignalAnalysis>,
        indicators: BTreeMap<String, f64>,
    ) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let payload = signal_payload(signal, analysis, indicators);
        let delivered = self.broadcast(&payload).await;
        if delivered {
            tracing::info!(
                "Сигнал {} {} опубликован",
                signal.strategy,
                signal.signal_type.as_str()
            );
        } else {
            tracing::error!("Сигнал {} не доставлен ни на один вебхук", signal.strategy);
        }
        delivered
    }

    pub async fn publish_trade_result(&self, update: &TradeUpdate) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let delivered = self.broadcast(&trade_payload(update)).await;
        if !delivered {
            tracing::error!("Итог сделки {} не доставлен ни на один вебхук", update.strategy);
        }
        delivered
    }

    // Успех, если хотя бы один получатель принял
    async fn broadcast<T: Serialize>(&self, payload: &T) -> bool {
        let mut delivered = false;
        for url in &self.config.urls {
            if self.post_with_retry(url, payload).await {
                delivered = true;
            }
        }
        delivered
    }

    async fn post_with_retry<T: Serialize>(&self, url: &str, payload: &T) -> bool {
        let attempts = self.config.max_retries.max(1);

        for attempt in 1..=attempts {
            let result = self
                .client
                .post(url)
                .timeout(Duration::from_secs(self.config.timeout_secs))
                .header(reqwest::header::USER_AGENT, concat!("market_analyzer/", env!("CARGO_PKG_VERSION")))
                .json(payload)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!("Вебхук {} принял данные", url);
                    return true;
                }
                Ok(response) => tracing::warn!(
                    "Вебхук {} ответил {} (попытка {}/{})",
                    url,
                    response.status().as_u16(),
                    attempt,
                    attempts
                ),
                Err(e) => tracing::warn!(
                    "Ошибка отправки на вебхук {} (попытка {}/{}): {}",
                    url,
                    attempt,
                    attempts,
                    e
                ),
            }

            if attempt < attempts {
                let delay = Duration::from_millis(self.config.retry_base_delay_ms)
                    * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }
        }
        false
    }
}
