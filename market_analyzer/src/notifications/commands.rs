//! Команды из чата через long-poll `getUpdates`.
//!
//! Обслуживается только настроенный чат: /start, /help, /status, /analyze.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Deserialize;
use tokio::sync::watch;

use crate::config::AppConfig;
use crate::errors::{AnalyzerError, Result};
use crate::notifications::formatter;
use crate::notifications::telegram::TelegramNotifier;
use crate::services::MarketAnalyzer;

const POLL_ERROR_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Help,
    Status,
    Analyze {
        symbol: Option<String>,
        timeframe: Option<String>,
    },
    Unknown(String),
}

fn command_regex() -> Option<&'static Regex> {
    static COMMAND: OnceLock<Option<Regex>> = OnceLock::new();
    COMMAND
        .get_or_init(|| Regex::new(r"(?s)^/(\w+)(?:@\w+)?(?:\s+(.*))?$").ok())
        .as_ref()
}

/// Разбор текста сообщения. Не команда → `None`.
pub fn parse_command(text: &str) -> Option<BotCommand> {
    let caps = command_regex()?.captures(text.trim())?;
    let name = caps.get(1)?.as_str().to_lowercase();
    let mut args = caps
        .get(2)
        .map(|m| m.as_str())
        .unwrap_or("")
        .split_whitespace();

    let command = match name.as_str() {
        "start" => BotCommand::Start,
        "help" => BotCommand::Help,
        "status" => BotCommand::Status,
        "analyze" => BotCommand::Analyze {
            symbol: args.next().map(|s| s.to_uppercase()),
            timeframe: args.next().map(|s| s.to_lowercase()),
        },
        _ => BotCommand::Unknown(name),
    };
    Some(command)
}

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<TelegramUpdate>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

pub struct CommandListener {
    notifier: TelegramNotifier,
    analyzer: Arc<MarketAnalyzer>,
    config: Arc<AppConfig>,
    started_at: Instant,
    poll_timeout: Duration,
    offset: i64,
}

impl CommandListener {
    pub fn new(
        notifier: TelegramNotifier,
        analyzer: Arc<MarketAnalyzer>,
        config: Arc<AppConfig>,
        started_at: Instant,
    ) -> Self {
        let poll_timeout = Duration::from_secs(config.telegram.poll_timeout_secs);
        CommandListener {
            notifier,
            analyzer,
            config,
            started_at,
            poll_timeout,
            offset: 0,
        }
    }

    /// Цикл опроса до сигнала остановки.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Запуск обработчика команд Telegram");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let updates = tokio::select! {
                _ = shutdown.changed() => break,
                updates = self.poll_updates() => updates,
            };

            match updates {
                Ok(updates) => {
                    for update in updates {
                        self.offset = update.update_id + 1;
                        if let Some(message) = update.message {
                            if let Some(text) = message.text {
                                self.handle_message(message.chat.id, &text).await;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Не удалось получить обновления Telegram: {}", e);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(POLL_ERROR_DELAY) => {}
                    }
                }
            }
        }

        tracing::info!("Обработчик команд Telegram остановлен");
    }

    async fn poll_updates(&self) -> Result<Vec<TelegramUpdate>> {
        let response: GetUpdatesResponse = self
            .notifier
            .http()
            .get(self.notifier.method_url("getUpdates"))
            .query(&[
                ("offset", self.offset.to_string()),
                ("timeout", self.poll_timeout.as_secs().to_string()),
            ])
            .timeout(self.poll_timeout + Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| AnalyzerError::HttpError(e.without_url()))?
            .json()
            .await
            .map_err(|e| AnalyzerError::HttpError(e.without_url()))?;

        if !response.ok {
            return Err(AnalyzerError::NotificationFailed(
                response
                    .description
                    .unwrap_or_else(|| "getUpdates returned ok=false".to_string()),
            ));
        }
        Ok(response.result)
    }

    /// Возвращает `false`, если сообщение проигнорировано.
    pub async fn handle_message(&self, chat_id: i64, text: &str) -> bool {
        if chat_id.to_string() != self.notifier.chat_id() {
            tracing::warn!("Сообщение из чужого чата {} проигнорировано", chat_id);
            return false;
        }
        let Some(command) = parse_command(text) else {
            return false;
        };

        tracing::info!("Получена команда: {:?}", command);

        let reply = match command {
            BotCommand::Start => formatter::format_welcome(),
            BotCommand::Help => formatter::format_help(),
            BotCommand::Status => {
                formatter::format_status(&self.config, self.started_at.elapsed())
            }
            BotCommand::Analyze { symbol, timeframe } => {
                let symbol = symbol.unwrap_or_else(|| self.analyzer.default_symbol().to_string());
                let timeframe =
                    timeframe.unwrap_or_else(|| self.analyzer.default_timeframe().to_string());

                match self.analyzer.analyze(&symbol, &timeframe).await {
                    Ok(report) => formatter::format_market_report(&report),
                    Err(e) => {
                        tracing::error!("Анализ по команде не удался: {}", e);
                        formatter::format_error_alert("/analyze", &e)
                    }
                }
            }
            BotCommand::Unknown(name) => format!(
                "❓ Неизвестная команда: /{}\nИспользуйте /help",
                formatter::escape_html(&name)
            ),
        };

        self.notifier.notify(&reply).await;
        true
    }
}
