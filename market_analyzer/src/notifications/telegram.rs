use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::TelegramConfig;
use crate::errors::{AnalyzerError, Result};

const TRUNCATION_MARKER: &str = "\n\n<i>... сообщение обрезано</i>";
/// Дольше не ждём, даже если Telegram просит
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

fn tag_regex() -> Option<&'static Regex> {
    static TAG: OnceLock<Option<Regex>> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"<(/?)([a-zA-Z]+)[^<>]*>").ok())
        .as_ref()
}

/// Обрезка до `max_chars` символов с маркером в конце. Не оставляет
/// разрезанных тегов и сущностей, незакрытые теги закрываются.
pub fn truncate_message(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    let mut budget = max_chars.saturating_sub(marker_len);

    loop {
        let mut cut: String = text.chars().take(budget).collect();

        // Разрезанный тег
        if let Some(open) = cut.rfind('<') {
            if !cut[open..].contains('>') {
                cut.truncate(open);
            }
        }
        // Разрезанная сущность вида &amp;
        if let Some(amp) = cut.rfind('&') {
            if !cut[amp..].contains(';') {
                cut.truncate(amp);
            }
        }

        let mut open_tags: Vec<String> = Vec::new();
        let tags = tag_regex().into_iter().flat_map(|re| re.captures_iter(&cut));
        for caps in tags {
            let name = caps[2].to_ascii_lowercase();
            if &caps[1] == "/" {
                if let Some(pos) = open_tags.iter().rposition(|t| *t == name) {
                    open_tags.truncate(pos);
                }
            } else {
                open_tags.push(name);
            }
        }

        let closers: String = open_tags
            .iter()
            .rev()
            .map(|t| format!("</{}>", t))
            .collect();
        let result = format!("{}{}{}", cut.trim_end(), closers, TRUNCATION_MARKER);

        if result.chars().count() <= max_chars || budget == 0 {
            return result;
        }
        budget = budget.saturating_sub(result.chars().count() - max_chars);
    }
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

enum SendFailure {
    Retry { reason: String, wait: Option<Duration> },
    Fatal(String),
}

/// Отправка сообщений в один чат через Bot API.
#[derive(Clone)]
pub struct TelegramNotifier {
    http: Client,
    api_url: String,
    bot_token: String,
    chat_id: String,
    max_message_length: usize,
    retry_attempts: u32,
    retry_base_delay: Duration,
    timeout: Duration,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let bot_token = config
            .bot_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AnalyzerError::InvalidConfig("TELEGRAM_BOT_TOKEN is not set".to_string()))?;
        let chat_id = config
            .chat_id
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AnalyzerError::InvalidConfig("TELEGRAM_CHAT_ID is not set".to_string()))?;

        Ok(TelegramNotifier {
            http: Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            bot_token,
            chat_id,
            max_message_length: config.max_message_length.min(4096),
            retry_attempts: config.retry_attempts.max(1),
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// `None`, если уведомления отключены.
    pub fn from_config(config: &TelegramConfig) -> Result<Option<Self>> {
        if !config.enabled {
            tracing::info!("Telegram уведомления отключены");
            return Ok(None);
        }
        let notifier = Self::new(config)?;
        tracing::info!(
            "Telegram уведомления включены (токен {}..., чат {})",
            notifier.token_hint(),
            notifier.chat_id
        );
        Ok(Some(notifier))
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_url, self.bot_token, method)
    }

    fn token_hint(&self) -> String {
        self.bot_token.chars().take(6).collect()
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Отправка с повторами: 429 ждёт `retry_after`, 5xx и сетевые ошибки
    /// ждут с экспоненциальной задержкой, прочие 4xx не повторяются.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let text = truncate_message(text, self.max_message_length);
        let request = SendMessageRequest {
            chat_id: &self.chat_id,
            text: &text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };

        let mut last_reason = String::new();
        for attempt in 1..=self.retry_attempts {
            match self.try_send(&request).await {
                Ok(()) => {
                    tracing::debug!("Сообщение отправлено в Telegram (попытка {})", attempt);
                    return Ok(());
                }
                Err(SendFailure::Fatal(reason)) => {
                    tracing::error!("Telegram отклонил сообщение: {}", reason);
                    return Err(AnalyzerError::NotificationFailed(reason));
                }
                Err(SendFailure::Retry { reason, wait }) => {
                    tracing::warn!(
                        "Ошибка отправки в Telegram (попытка {}/{}): {}",
                        attempt,
                        self.retry_attempts,
                        reason
                    );
                    if attempt < self.retry_attempts {
                        let delay = wait.unwrap_or_else(|| self.backoff(attempt));
                        tokio::time::sleep(delay).await;
                    }
                    last_reason = reason;
                }
            }
        }

        Err(AnalyzerError::NotificationFailed(format!(
            "gave up after {} attempts: {}",
            self.retry_attempts, last_reason
        )))
    }

    async fn try_send(&self, request: &SendMessageRequest<'_>) -> std::result::Result<(), SendFailure> {
        let response = self
            .http
            .post(self.method_url("sendMessage"))
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| SendFailure::Retry {
                reason: format!("network error: {}", e.without_url()),
                wait: None,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let parsed: Option<ApiErrorBody> = serde_json::from_str(&body).ok();
        let description = parsed
            .as_ref()
            .and_then(|b| b.description.clone())
            .unwrap_or_else(|| body.chars().take(200).collect());
        let reason = format!("{} - {}", status.as_u16(), description);

        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = parsed
                .and_then(|b| b.parameters)
                .and_then(|p| p.retry_after)
                .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER));
            return Err(SendFailure::Retry { reason, wait });
        }
        if status.is_server_error() {
            return Err(SendFailure::Retry { reason, wait: None });
        }
        Err(SendFailure::Fatal(reason))
    }

    /// Ошибка отправки логируется и не пробрасывается.
    pub async fn notify(&self, text: &str) -> bool {
        match self.send_message(text).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Уведомление не доставлено: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_is_untouched() {
        assert_eq!(truncate_message("<b>hi</b>", 100), "<b>hi</b>");
    }

    #[test]
    fn truncation_closes_open_tags() {
        let text = format!("<b>{}</b>", "x".repeat(300));
        let result = truncate_message(&text, 100);
        assert!(result.chars().count() <= 100);
        assert!(result.ends_with(TRUNCATION_MARKER));
        assert!(result.contains("</b>"));
    }

    #[test]
    fn truncation_drops_partial_tag_and_entity() {
        let body = "a".repeat(60);
        let text = format!("{}&amp;<code>{}</code>", body, "y".repeat(200));
        for limit in 90..100 {
            let result = truncate_message(&text, limit);
            let head = result.trim_end_matches(TRUNCATION_MARKER);
            assert!(result.chars().count() <= limit);
            assert_eq!(head.matches('<').count(), head.matches('>').count());
            if let Some(amp) = head.rfind('&') {
                assert!(head[amp..].contains(';'));
            }
        }
    }
}
