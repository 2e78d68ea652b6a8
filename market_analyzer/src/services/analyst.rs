use std::fmt::Write as _;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AiConfig;
use crate::errors::{AnalyzerError, Result};
use crate::models::{
    AnalysisSource, ExternalAnalysisResult, KeyFactors, MarketContext, MarketPhase,
    MarketSnapshot, Recommendation, RiskLevel, SignalAnalysis, StrategySignal, TargetZones,
    TradeSignal,
};

const STRATEGY_LINE_PREFIX: &str = "[strategy] ";

pub const SYSTEM_PROMPT: &str = "Ты - эксперт по анализу криптовалютных рынков.

ЗАДАЧА: Проанализировать общее состояние рынка на основе данных от нескольких торговых стратегий.

ФОРМАТ ОТВЕТА (строго JSON, без текста вокруг):
{
    \"market_phase\": \"BULLISH|BEARISH|NEUTRAL|VOLATILE\",
    \"confidence\": 0-100,
    \"key_insights\": [\"инсайт1\", \"инсайт2\", \"инсайт3\"],
    \"recommendations\": [\"рекомендация1\", \"рекомендация2\"],
    \"risk_level\": \"LOW|MEDIUM|HIGH\",
    \"summary\": \"краткая сводка в 2-3 предложения\"
}

Анализируй объективно, учитывая все данные.";

pub const SIGNAL_SYSTEM_PROMPT: &str = "Ты - эксперт по техническому анализу криптовалютных рынков.

ЗАДАЧА: Оценить конкретный торговый сигнал стратегии с учётом рыночного контекста.

ФОРМАТ ОТВЕТА (строго JSON, без текста вокруг):
{
    \"recommendation\": \"BUY|SELL|HOLD|AVOID\",
    \"confidence\": 0-100,
    \"risk_level\": \"LOW|MEDIUM|HIGH\",
    \"key_factors\": {\"bullish\": [\"фактор\"], \"bearish\": [\"фактор\"]},
    \"market_analysis\": \"краткий анализ рыночной ситуации\",
    \"strategy_assessment\": \"оценка качества сигнала\",
    \"risk_warnings\": [\"предупреждение\"],
    \"target_zones\": {
        \"entry_optimal\": \"цена входа\",
        \"stop_loss\": \"стоп-лосс\",
        \"take_profit_1\": \"первая цель\",
        \"take_profit_2\": \"вторая цель\"
    },
    \"summary\": \"итоговое заключение в 2-3 предложения\"
}

Не бойся отвечать AVOID при плохих условиях. Confidence это реальная уверенность в сигнале.";

/// Сколько последних свечей попадает в запрос по сигналу
const PROMPT_CANDLES: usize = 5;

/// Текст запроса к модели. Одинаковые входные данные дают одинаковый текст.
pub fn build_prompt(snapshot: &MarketSnapshot, signals: &[StrategySignal]) -> String {
    let mut prompt = String::new();

    let _ = writeln!(prompt, "АНАЛИЗ РЫНКА {} ({}):", snapshot.symbol, snapshot.timeframe);
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "=== ТЕКУЩИЕ ДАННЫЕ ===");
    let _ = writeln!(prompt, "Цена: ${:.2}", snapshot.last_price);
    let _ = writeln!(
        prompt,
        "Изменение за {} свечей: {:+.2}%",
        snapshot.candles.len(),
        snapshot.pct_change_over_window
    );
    let _ = writeln!(prompt, "Объем за окно: {:.0}", snapshot.rolling_volume_sum);
    let _ = writeln!(prompt);
    let _ = writeln!(prompt, "=== АНАЛИЗ ПО СТРАТЕГИЯМ ===");

    for signal in signals {
        let indicators = signal
            .indicators
            .iter()
            .map(|(name, value)| format!("{}={:.2}", name, value))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(
            prompt,
            "{}{} | {} | {} | {}% | {}",
            STRATEGY_LINE_PREFIX,
            signal.strategy_name,
            signal.timeframe_label,
            signal.signal_label,
            signal.confidence_percent,
            indicators
        );
    }

    let _ = writeln!(prompt);
    prompt.push_str("ПРОАНАЛИЗИРУЙ общее состояние рынка и дай рекомендации.");
    prompt
}

/// Имена стратегий в том порядке, в котором они попали в запрос.
pub fn strategy_names_from_prompt(prompt: &str) -> Vec<String> {
    prompt
        .lines()
        .filter_map(|line| line.strip_prefix(STRATEGY_LINE_PREFIX))
        .map(|rest| rest.split(" | ").next().unwrap_or(rest).to_string())
        .collect()
}

/// Запрос по одному сигналу. Одинаковые входные данные дают одинаковый текст.
pub fn build_signal_prompt(
    signal: &TradeSignal,
    snapshot: &MarketSnapshot,
    context: &MarketContext,
    strategy_signal: Option<&StrategySignal>,
) -> String {
    let mut prompt = String::from("АНАЛИЗ ТОРГОВОГО СИГНАЛА:\n\n=== ОСНОВНЫЕ ДАННЫЕ ===\n");

    let _ = writeln!(prompt, "Стратегия: {}", signal.strategy);
    let _ = writeln!(prompt, "Сигнал: {} на {}", signal.signal_type.as_str(), signal.symbol);
    let _ = writeln!(prompt, "Таймфрейм: {}", signal.timeframe);
    let _ = writeln!(prompt, "Цена сигнала: ${:.2}", signal.price);
    if !signal.reason.trim().is_empty() {
        let _ = writeln!(prompt, "Причина сигнала: {}", signal.reason.trim());
    }
    let _ = writeln!(prompt, "Время: {}", signal.timestamp.format("%Y-%m-%d %H:%M:%S"));

    if let Some(own) = strategy_signal {
        let _ = writeln!(prompt, "\n=== ИНДИКАТОРЫ СТРАТЕГИИ ===");
        let _ = writeln!(
            prompt,
            "Оценка профиля: {} ({}%)",
            own.signal_label, own.confidence_percent
        );
        for (name, value) in &own.indicators {
            let _ = writeln!(prompt, "{}: {:.2}", name.to_uppercase(), value);
        }
    }

    let _ = writeln!(prompt, "\n=== РЫНОЧНЫЕ УСЛОВИЯ ===");
    let _ = writeln!(prompt, "Текущая цена: ${:.2}", context.last_price);
    match &context.candles {
        Some(c) => {
            let _ = writeln!(prompt, "Тренд: {}", c.price_trend.as_str());
            let _ = writeln!(
                prompt,
                "Поддержка: ${:.2} (сила {}), сопротивление: ${:.2} (сила {})",
                c.levels.nearest_support,
                c.levels.support_strength,
                c.levels.nearest_resistance,
                c.levels.resistance_strength
            );
            let patterns = if c.patterns.is_empty() {
                "нет".to_string()
            } else {
                c.patterns.join(", ")
            };
            let _ = writeln!(prompt, "Свечные паттерны: {}", patterns);
            let _ = writeln!(
                prompt,
                "Моментум: 5 свечей {:+.2}%, 10 свечей {:+.2}%, ROC {:+.2}% ({})",
                c.momentum.momentum_5,
                c.momentum.momentum_10,
                c.momentum.rate_of_change,
                c.momentum.direction.as_str()
            );
            let _ = writeln!(
                prompt,
                "Объёмы: {} ({:+.1}%){}",
                c.volume_trend.as_str(),
                c.volume_change_pct,
                if c.volume_spike { ", всплеск" } else { "" }
            );
            let _ = writeln!(
                prompt,
                "Волатильность: {} ({:.2}%), ATR {:.2} ({:.2}%)",
                c.volatility.as_str(),
                c.volatility_pct,
                c.atr,
                c.atr_pct
            );
        }
        None => {
            let _ = writeln!(prompt, "Недостаточно свечей для разбора контекста");
        }
    }

    let start = snapshot.candles.len().saturating_sub(PROMPT_CANDLES);
    let recent = &snapshot.candles[start..];
    if !recent.is_empty() {
        let _ = writeln!(prompt, "\n=== ПОСЛЕДНИЕ {} СВЕЧЕЙ ===", recent.len());
        for (i, c) in recent.iter().enumerate() {
            let change = (c.close - c.open) / c.open * 100.0;
            let _ = writeln!(
                prompt,
                "#{}: O${:.2} H${:.2} L${:.2} C${:.2} ({:+.2}%) Vol:{:.0}",
                i + 1,
                c.open,
                c.high,
                c.low,
                c.close,
                change,
                c.volume
            );
        }
    }

    prompt.push_str("\nПРОВЕДИ ПОЛНЫЙ АНАЛИЗ ЭТОГО СИГНАЛА И ВЕРНИ РЕЗУЛЬТАТ В ФОРМАТЕ JSON!");
    prompt
}

/// От первой `{` до последней `}` включительно.
pub fn extract_json_span(text: &str) -> Result<&str> {
    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => Ok(&text[start..=end]),
        _ => Err(AnalyzerError::AnalysisFailed("JSON not found".to_string())),
    }
}

/// Первый полный JSON объект в ответе. Объект читается потоковым
/// парсером с каждой `{` по очереди, так что текст после объекта
/// и фигурные скобки в нём не мешают.
pub fn extract_json_object(text: &str) -> Result<Value> {
    let span = extract_json_span(text)?;

    for (start, _) in text.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            if value.is_object() {
                return Ok(value);
            }
        }
    }

    serde_json::from_str(span)
        .map_err(|e| AnalyzerError::AnalysisFailed(format!("JSON parse error: {}", e)))
}

pub fn parse_analysis(text: &str, model: &str) -> Result<ExternalAnalysisResult> {
    let json = extract_json_object(text)?;

    let object = json
        .as_object()
        .ok_or_else(|| AnalyzerError::AnalysisFailed("JSON root is not an object".to_string()))?;

    let raw_phase = object
        .get("market_phase")
        .and_then(Value::as_str)
        .ok_or_else(|| missing_field("market_phase"))?;
    let market_phase = MarketPhase::parse(raw_phase).ok_or_else(|| {
        AnalyzerError::AnalysisFailed(format!("unknown market_phase '{}'", raw_phase))
    })?;

    Ok(ExternalAnalysisResult {
        market_phase,
        confidence_percent: confidence_field(object)?,
        key_insights: string_list(object.get("key_insights")),
        recommendations: string_list(object.get("recommendations")),
        risk_level: risk_field(object),
        summary: summary_field(object)?,
        source: AnalysisSource::External {
            model: model.to_string(),
        },
    })
}

/// Ответ по сигналу. Обязательны `recommendation`, `confidence` и `summary`.
pub fn parse_signal_analysis(text: &str, model: &str) -> Result<SignalAnalysis> {
    let json = extract_json_object(text)?;
    let object = json
        .as_object()
        .ok_or_else(|| AnalyzerError::AnalysisFailed("JSON root is not an object".to_string()))?;

    let raw = object
        .get("recommendation")
        .and_then(Value::as_str)
        .ok_or_else(|| missing_field("recommendation"))?;
    let recommendation = Recommendation::parse(raw).ok_or_else(|| {
        AnalyzerError::AnalysisFailed(format!("unknown recommendation '{}'", raw))
    })?;

    let factors = object.get("key_factors");
    let zones = object.get("target_zones");

    Ok(SignalAnalysis {
        recommendation,
        confidence_percent: confidence_field(object)?,
        risk_level: risk_field(object),
        key_factors: KeyFactors {
            bullish: string_list(factors.and_then(|f| f.get("bullish"))),
            bearish: string_list(factors.and_then(|f| f.get("bearish"))),
        },
        market_analysis: text_field(object, "market_analysis"),
        strategy_assessment: text_field(object, "strategy_assessment"),
        risk_warnings: string_list(object.get("risk_warnings")),
        target_zones: TargetZones {
            entry_optimal: zone(zones, "entry_optimal"),
            stop_loss: zone(zones, "stop_loss"),
            take_profit_1: zone(zones, "take_profit_1"),
            take_profit_2: zone(zones, "take_profit_2"),
        },
        summary: summary_field(object)?,
        source: AnalysisSource::External {
            model: model.to_string(),
        },
    })
}

type JsonObject = serde_json::Map<String, Value>;

fn missing_field(name: &str) -> AnalyzerError {
    AnalyzerError::AnalysisFailed(format!("missing field '{}'", name))
}

fn confidence_field(object: &JsonObject) -> Result<u8> {
    let confidence = object
        .get("confidence")
        .ok_or_else(|| missing_field("confidence"))?
        .as_f64()
        .ok_or_else(|| AnalyzerError::AnalysisFailed("confidence is not a number".to_string()))?;
    if !confidence.is_finite() || !(0.0..=100.0).contains(&confidence) {
        return Err(AnalyzerError::AnalysisFailed(format!(
            "confidence {} is outside 0..=100",
            confidence
        )));
    }
    Ok(confidence.round() as u8)
}

fn summary_field(object: &JsonObject) -> Result<String> {
    object
        .get("summary")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| missing_field("summary"))
}

// Неизвестный или отсутствующий уровень риска считается средним
fn risk_field(object: &JsonObject) -> RiskLevel {
    object
        .get("risk_level")
        .and_then(Value::as_str)
        .and_then(RiskLevel::parse)
        .unwrap_or(RiskLevel::Medium)
}

fn text_field(object: &JsonObject, name: &str) -> String {
    object
        .get(name)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn zone(zones: Option<&Value>, name: &str) -> Option<String> {
    match zones?.get(name)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

enum CompletionFailure {
    /// 429 от сервиса
    RateLimited(AnalyzerError),
    Failed(AnalyzerError),
}

impl CompletionFailure {
    fn into_error(self) -> AnalyzerError {
        match self {
            CompletionFailure::RateLimited(e) | CompletionFailure::Failed(e) => e,
        }
    }
}

/// Клиент OpenAI-совместимого сервиса chat completions.
#[derive(Clone)]
pub struct MarketAnalyst {
    client: Client,
    config: AiConfig,
}

impl MarketAnalyst {
    pub fn new(config: AiConfig) -> Self {
        MarketAnalyst {
            client: Client::new(),
            config,
        }
    }

    fn api_key(&self) -> Result<&str> {
        if !self.config.enabled {
            return Err(AnalyzerError::AnalysisFailed("AI analysis disabled".to_string()));
        }
        self.config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AnalyzerError::AnalysisFailed("API key missing".to_string()))
    }

    /// Обзор рынка: один запрос без повторов.
    pub async fn analyze(
        &self,
        snapshot: &MarketSnapshot,
        signals: &[StrategySignal],
    ) -> Result<ExternalAnalysisResult> {
        let api_key = self.api_key()?;
        tracing::info!("Запрос ИИ анализа {} ({})", snapshot.symbol, self.config.model);

        let content = self
            .complete(api_key, SYSTEM_PROMPT, build_prompt(snapshot, signals))
            .await
            .map_err(CompletionFailure::into_error)?;

        let analysis = parse_analysis(&content, &self.config.model)?;
        tracing::info!(
            "ИИ анализ {}: фаза {}, уверенность {}%",
            snapshot.symbol,
            analysis.market_phase,
            analysis.confidence_percent
        );
        Ok(analysis)
    }

    /// Оценка одного сигнала. На 429 повторяет запрос с экспоненциальной
    /// задержкой, не больше `signal_retry_attempts` попыток.
    pub async fn analyze_signal(
        &self,
        signal: &TradeSignal,
        snapshot: &MarketSnapshot,
        context: &MarketContext,
        strategy_signal: Option<&StrategySignal>,
    ) -> Result<SignalAnalysis> {
        let api_key = self.api_key()?;
        let prompt = build_signal_prompt(signal, snapshot, context, strategy_signal);
        let attempts = self.config.signal_retry_attempts.max(1);

        let mut attempt = 1;
        let content = loop {
            tracing::info!(
                "Запрос ИИ анализа сигнала {} {} (попытка {}/{})",
                signal.strategy,
                signal.signal_type.as_str(),
                attempt,
                attempts
            );
            match self.complete(api_key, SIGNAL_SYSTEM_PROMPT, prompt.clone()).await {
                Ok(content) => break content,
                Err(CompletionFailure::RateLimited(e)) if attempt < attempts => {
                    let delay = self.retry_delay(attempt);
                    tracing::warn!(
                        "Лимит запросов ИИ, повтор через {} мс: {}",
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(failure) => return Err(failure.into_error()),
            }
        };

        let analysis = parse_signal_analysis(&content, &self.config.model)?;
        tracing::info!(
            "ИИ анализ сигнала {}: {} ({}%)",
            signal.strategy,
            analysis.recommendation,
            analysis.confidence_percent
        );
        Ok(analysis)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.config.retry_base_delay_ms)
            * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    async fn complete(
        &self,
        api_key: &str,
        system: &str,
        user: String,
    ) -> std::result::Result<String, CompletionFailure> {
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user,
                },
            ],
            temperature: Some(self.config.temperature),
            max_tokens: Some(self.config.max_tokens),
            response_format: self
                .config
                .json_response_format
                .then(|| ResponseFormat { kind: "json_object" }),
        };

        let url = format!("{}/chat/completions", self.config.api_url.trim_end_matches('/'));
        let start = Instant::now();

        let response = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", api_key))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                CompletionFailure::Failed(AnalyzerError::AnalysisFailed(format!(
                    "completion request failed: {}",
                    e
                )))
            })?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let snippet: String = body.chars().take(300).collect();
            let error = AnalyzerError::AnalysisFailed(format!(
                "completion API error: {} - {}",
                status.as_u16(),
                snippet
            ));
            return Err(if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                CompletionFailure::RateLimited(error)
            } else {
                CompletionFailure::Failed(error)
            });
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
            CompletionFailure::Failed(AnalyzerError::AnalysisFailed(format!(
                "invalid completion response: {}",
                e
            )))
        })?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        tracing::debug!(
            "Ответ ИИ получен за {} мс, {} символов",
            start.elapsed().as_millis(),
            content.len()
        );
        Ok(content)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    #[serde(default)]
    content: String,
}
