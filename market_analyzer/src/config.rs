use std::collections::HashSet;
use std::env;

use anyhow::Result;
use config::Config;
use serde::Deserialize;

use crate::models::{default_profiles, AnalysisMode, ScoringRule, StrategyProfile};
use crate::services::collector::exchange_interval;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub base_url: String,
    pub category: String,
    pub symbol: String,
    pub timeframe: String,
    pub limit: usize,
    pub timeout_secs: u64,
    /// Базовая цена синтетической серии в режиме fallback
    pub fallback_base_price: f64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        MarketConfig {
            base_url: "https://api-testnet.bybit.com".to_string(),
            category: "linear".to_string(),
            symbol: "BTCUSDT".to_string(),
            timeframe: "5m".to_string(),
            limit: 288,
            timeout_secs: 10,
            fallback_base_price: 45000.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub enabled: bool,
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f64,
    pub max_tokens: u32,
    /// `response_format = json_object` в запросе
    pub json_response_format: bool,
    pub min_analysis_gap_secs: u64,
    /// Попыток запроса по сигналу при ответе 429
    pub signal_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        AiConfig {
            enabled: false,
            api_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4".to_string(),
            timeout_secs: 30,
            temperature: 0.3,
            max_tokens: 1000,
            json_response_format: true,
            min_analysis_gap_secs: 300,
            signal_retry_attempts: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub api_url: String,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub max_message_length: usize,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub timeout_secs: u64,
    pub poll_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        TelegramConfig {
            enabled: false,
            api_url: "https://api.telegram.org".to_string(),
            bot_token: None,
            chat_id: None,
            max_message_length: 4096,
            retry_attempts: 3,
            retry_base_delay_ms: 2000,
            timeout_secs: 10,
            poll_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            worker_count: 2,
            queue_capacity: 32,
        }
    }
}

/// Внешние получатели сигналов. Пустой список отключает публикацию.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub urls: Vec<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        WebhookConfig {
            urls: Vec::new(),
            timeout_secs: 10,
            max_retries: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server_addr: String,
    pub analysis_mode: AnalysisMode,
    pub market: MarketConfig,
    pub ai: AiConfig,
    pub telegram: TelegramConfig,
    pub dispatcher: DispatcherConfig,
    pub webhook: WebhookConfig,
    pub strategies: Vec<StrategyProfile>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            server_addr: "0.0.0.0:3000".to_string(),
            analysis_mode: AnalysisMode::Strict,
            market: MarketConfig::default(),
            ai: AiConfig::default(),
            telegram: TelegramConfig::default(),
            dispatcher: DispatcherConfig::default(),
            webhook: WebhookConfig::default(),
            strategies: default_profiles(),
        }
    }
}

impl AppConfig {
    /// Валидация конфигурации
    pub fn validate(&self) -> Result<()> {
        check_timeout("market.timeout_secs", self.market.timeout_secs)?;
        check_timeout("ai.timeout_secs", self.ai.timeout_secs)?;
        check_timeout("telegram.timeout_secs", self.telegram.timeout_secs)?;
        check_timeout("telegram.poll_timeout_secs", self.telegram.poll_timeout_secs)?;
        check_timeout("webhook.timeout_secs", self.webhook.timeout_secs)?;

        if self.market.symbol.trim().is_empty() {
            return Err(anyhow::anyhow!("market.symbol cannot be empty"));
        }
        if self.market.limit == 0 || self.market.limit > 1000 {
            return Err(anyhow::anyhow!("market.limit must be between 1 and 1000"));
        }
        check_timeframe("market.timeframe", &self.market.timeframe)?;
        if !(self.market.fallback_base_price > 0.0) {
            return Err(anyhow::anyhow!("market.fallback_base_price must be positive"));
        }

        if self.ai.enabled && self.ai.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(anyhow::anyhow!(
                "AI analysis is enabled but OPENAI_API_KEY is not set"
            ));
        }
        if !(0.0..=2.0).contains(&self.ai.temperature) {
            return Err(anyhow::anyhow!("ai.temperature must be between 0 and 2"));
        }
        if self.ai.signal_retry_attempts == 0 || self.ai.signal_retry_attempts > 10 {
            return Err(anyhow::anyhow!(
                "ai.signal_retry_attempts must be between 1 and 10"
            ));
        }

        if self.telegram.enabled {
            if self.telegram.bot_token.as_deref().map_or(true, str::is_empty) {
                return Err(anyhow::anyhow!(
                    "Telegram is enabled but TELEGRAM_BOT_TOKEN is not set"
                ));
            }
            if self.telegram.chat_id.as_deref().map_or(true, str::is_empty) {
                return Err(anyhow::anyhow!(
                    "Telegram is enabled but TELEGRAM_CHAT_ID is not set"
                ));
            }
        }
        if self.telegram.max_message_length < 100 || self.telegram.max_message_length > 4096 {
            return Err(anyhow::anyhow!(
                "telegram.max_message_length must be between 100 and 4096"
            ));
        }
        if self.telegram.retry_attempts == 0 || self.telegram.retry_attempts > 10 {
            return Err(anyhow::anyhow!(
                "telegram.retry_attempts must be between 1 and 10"
            ));
        }

        if self.dispatcher.worker_count == 0 || self.dispatcher.worker_count > 32 {
            return Err(anyhow::anyhow!(
                "dispatcher.worker_count must be between 1 and 32"
            ));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(anyhow::anyhow!("dispatcher.queue_capacity must be positive"));
        }

        for url in &self.webhook.urls {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(anyhow::anyhow!("webhook url '{}' must be http or https", url));
            }
        }
        if self.webhook.max_retries == 0 || self.webhook.max_retries > 10 {
            return Err(anyhow::anyhow!("webhook.max_retries must be between 1 and 10"));
        }

        self.validate_strategies()
    }

    fn validate_strategies(&self) -> Result<()> {
        if self.strategies.is_empty() {
            return Err(anyhow::anyhow!("strategies cannot be empty"));
        }

        let mut seen = HashSet::new();
        for profile in &self.strategies {
            let valid_name = !profile.name.is_empty()
                && profile
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
            if !valid_name {
                return Err(anyhow::anyhow!(
                    "strategy name '{}' must be non-empty ASCII letters, digits, '_' or '-'",
                    profile.name
                ));
            }
            if !seen.insert(profile.name.as_str()) {
                return Err(anyhow::anyhow!("duplicate strategy name '{}'", profile.name));
            }
            check_timeframe(&format!("strategy '{}' timeframe", profile.name), &profile.timeframe)?;
            validate_rule(&profile.name, &profile.rule)?;
        }
        Ok(())
    }

    pub fn ai_analysis_enabled(&self) -> bool {
        self.ai.enabled && self.ai.api_key.is_some()
    }

    pub fn telegram_enabled(&self) -> bool {
        self.telegram.enabled && self.telegram.bot_token.is_some() && self.telegram.chat_id.is_some()
    }

    pub fn log_summary(&self) {
        tracing::info!("Конфигурация системы:");
        tracing::info!("  Режим анализа: {}", self.analysis_mode.as_str());
        tracing::info!(
            "  ИИ анализ: {} (модель {}, таймаут {}с)",
            if self.ai_analysis_enabled() { "включен" } else { "отключен" },
            self.ai.model,
            self.ai.timeout_secs
        );
        tracing::info!(
            "  Telegram: {}",
            if self.telegram_enabled() { "включен" } else { "отключен" }
        );
        tracing::info!("  Вебхуки сигналов: {}", self.webhook.urls.len());
        tracing::info!(
            "  Рынок: {} {} ({} свечей)",
            self.market.symbol,
            self.market.timeframe,
            self.market.limit
        );
        for profile in &self.strategies {
            tracing::info!("  Стратегия {} ({})", profile.name, profile.timeframe);
        }
    }
}

fn check_timeout(name: &str, secs: u64) -> Result<()> {
    if secs == 0 || secs > 60 {
        return Err(anyhow::anyhow!("{} must be between 1 and 60 seconds", name));
    }
    Ok(())
}

fn check_timeframe(name: &str, timeframe: &str) -> Result<()> {
    if exchange_interval(timeframe).is_none() {
        return Err(anyhow::anyhow!("{} '{}' is not a supported timeframe", name, timeframe));
    }
    Ok(())
}

fn validate_rule(name: &str, rule: &ScoringRule) -> Result<()> {
    let periods_ok = match rule {
        ScoringRule::SmaDeviation { period, threshold_pct } => {
            if !(*threshold_pct > 0.0) {
                return Err(anyhow::anyhow!(
                    "strategy '{}': threshold_pct must be positive",
                    name
                ));
            }
            *period > 0
        }
        ScoringRule::EmaStack { fast, mid, slow } => 0 < *fast && fast < mid && mid < slow,
        ScoringRule::EmaTrend { fast, slow, rsi_period } => {
            0 < *fast && fast < slow && *rsi_period > 0
        }
        ScoringRule::TrendQuality { fast, mid, slow, rsi_period } => {
            0 < *fast && fast < mid && mid < slow && *rsi_period > 0
        }
    };
    if !periods_ok {
        return Err(anyhow::anyhow!(
            "strategy '{}': indicator periods must be positive and ordered fast < slow",
            name
        ));
    }
    Ok(())
}

fn env_flag(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on" | "enabled"))
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn load_config() -> Result<AppConfig> {
    // Загружаем .env файл
    dotenvy::dotenv().ok();

    let settings = Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(
            config::Environment::with_prefix("MARKET_ANALYZER")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let mut config: AppConfig = settings.try_deserialize()?;

    // Привычные имена переменных окружения имеют приоритет
    if let Some(mode) = env_non_empty("ANALYSIS_MODE") {
        config.analysis_mode = match mode.to_lowercase().as_str() {
            "strict" => AnalysisMode::Strict,
            "fallback" => AnalysisMode::Fallback,
            other => return Err(anyhow::anyhow!("ANALYSIS_MODE must be strict or fallback, got '{}'", other)),
        };
    }
    if let Some(enabled) = env_flag("AI_ANALYSIS_ENABLED") {
        config.ai.enabled = enabled;
    }
    if let Some(key) = env_non_empty("OPENAI_API_KEY") {
        config.ai.api_key = Some(key);
    }
    if let Some(model) = env_non_empty("OPENAI_MODEL") {
        config.ai.model = model;
    }
    if let Some(enabled) = env_flag("TELEGRAM_ENABLED") {
        config.telegram.enabled = enabled;
    }
    if let Some(token) = env_non_empty("TELEGRAM_BOT_TOKEN") {
        config.telegram.bot_token = Some(token);
    }
    if let Some(chat_id) = env_non_empty("TELEGRAM_CHAT_ID") {
        config.telegram.chat_id = Some(chat_id);
    }

    if let Some(urls) = env_non_empty("SIGNAL_WEBHOOKS") {
        config.webhook.urls = urls
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(timeout) = env_non_empty("SIGNAL_TIMEOUT") {
        config.webhook.timeout_secs = timeout.parse()?;
    }
    if let Some(retries) = env_non_empty("SIGNAL_MAX_RETRIES") {
        config.webhook.max_retries = retries.parse()?;
    }

    config.validate()?;

    Ok(config)
}
