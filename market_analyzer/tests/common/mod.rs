#![allow(dead_code)]

use chrono::Utc;
use serde_json::{json, Value};

use market_analyzer::config::AppConfig;
use market_analyzer::models::{
    AnalysisMode, Candle, MarketSnapshot, SignalLabel, SignalType, StrategySignal, TradeSignal,
};

pub const START_TIME: i64 = 1_700_000_000_000;
pub const STEP_MS: i64 = 300_000;

pub fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
    closes
        .iter()
        .enumerate()
        .map(|(i, close)| {
            let open = if i == 0 { *close } else { closes[i - 1] };
            Candle {
                time: START_TIME + i as i64 * STEP_MS,
                open,
                high: open.max(*close) * 1.001,
                low: open.min(*close) * 0.999,
                close: *close,
                volume: 10.0,
            }
        })
        .collect()
}

pub fn snapshot_from_closes(closes: &[f64]) -> MarketSnapshot {
    MarketSnapshot::from_candles("BTCUSDT", "5m", candles_from_closes(closes)).unwrap()
}

pub fn flat_closes(count: usize, price: f64) -> Vec<f64> {
    vec![price; count]
}

pub fn rising_closes(count: usize, start: f64, step: f64) -> Vec<f64> {
    (0..count).map(|i| start + i as f64 * step).collect()
}

/// Ответ `/v5/market/kline`: строки от новой свечи к старой, числа строками.
pub fn kline_body(closes: &[f64]) -> Value {
    let rows: Vec<Value> = candles_from_closes(closes)
        .iter()
        .rev()
        .map(|c| {
            json!([
                c.time.to_string(),
                c.open.to_string(),
                c.high.to_string(),
                c.low.to_string(),
                c.close.to_string(),
                c.volume.to_string(),
                (c.volume * c.close).to_string(),
            ])
        })
        .collect();

    json!({
        "retCode": 0,
        "retMsg": "OK",
        "result": { "category": "linear", "symbol": "BTCUSDT", "list": rows },
    })
}

pub fn completion_body(content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [
            { "index": 0, "message": { "role": "assistant", "content": content }, "finish_reason": "stop" }
        ],
    })
}

pub fn analysis_json(phase: &str, confidence: i64) -> String {
    json!({
        "market_phase": phase,
        "confidence": confidence,
        "key_insights": ["Объёмы растут"],
        "recommendations": ["Держать позицию"],
        "risk_level": "LOW",
        "summary": "Рынок спокоен.",
    })
    .to_string()
}

pub fn signal_analysis_json(recommendation: &str, confidence: i64) -> String {
    json!({
        "recommendation": recommendation,
        "confidence": confidence,
        "risk_level": "MEDIUM",
        "key_factors": { "bullish": ["EMA выстроены вверх"], "bearish": ["Объём падает"] },
        "market_analysis": "Восходящий тренд.",
        "strategy_assessment": "Сигнал согласован с трендом.",
        "risk_warnings": ["Близко сопротивление"],
        "target_zones": { "entry_optimal": "44900", "stop_loss": 44500, "take_profit_1": "45800" },
        "summary": "Вход допустим.",
    })
    .to_string()
}

pub fn test_config(exchange_url: &str, ai_url: &str, mode: AnalysisMode) -> AppConfig {
    let mut config = AppConfig::default();
    config.analysis_mode = mode;
    config.market.base_url = exchange_url.to_string();
    config.market.limit = 100;
    config.market.timeout_secs = 5;
    config.ai.enabled = true;
    config.ai.api_url = ai_url.to_string();
    config.ai.api_key = Some("test-key".to_string());
    config.ai.model = "test-model".to_string();
    config.ai.timeout_secs = 5;
    config.ai.retry_base_delay_ms = 10;
    config.webhook.retry_base_delay_ms = 10;
    config
}

pub fn telegram_config(config: &mut AppConfig, api_url: &str) {
    config.telegram.enabled = true;
    config.telegram.api_url = api_url.to_string();
    config.telegram.bot_token = Some("123456:TEST".to_string());
    config.telegram.chat_id = Some("42".to_string());
    config.telegram.retry_attempts = 3;
    config.telegram.retry_base_delay_ms = 10;
    config.telegram.timeout_secs = 5;
}

pub fn signal(name: &str, label: SignalLabel) -> StrategySignal {
    StrategySignal {
        strategy_name: name.to_string(),
        timeframe_label: "5m".to_string(),
        signal_label: label,
        confidence_percent: 60,
        indicators: Default::default(),
    }
}

pub fn trade_signal(strategy: &str) -> TradeSignal {
    TradeSignal {
        strategy: strategy.to_string(),
        signal_type: SignalType::Long,
        symbol: "BTCUSDT".to_string(),
        timeframe: "5m".to_string(),
        price: 45000.0,
        reason: "EMA cross".to_string(),
        timestamp: Utc::now(),
    }
}
