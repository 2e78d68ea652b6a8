// errors.rs
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("Рыночные данные недоступны: {0}")]
    DataUnavailable(String),

    #[error("Ошибка ИИ анализа: {0}")]
    AnalysisFailed(String),

    #[error("Не удалось отправить уведомление: {0}")]
    NotificationFailed(String),

    #[error("Ошибка HTTP запроса: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Ошибка парсинга JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Некорректная конфигурация: {0}")]
    InvalidConfig(String),

    #[error("Некорректные входные данные: {0}")]
    InvalidInput(String),

    #[error("Ошибка расчёта индикатора: {0}")]
    IndicatorError(String),

    #[error("Сервис недоступен: {0}")]
    ServiceUnavailable(String),

    #[error("Ошибка выполнения задачи: {0}")]
    TaskError(#[from] JoinError),
}

impl AnalyzerError {
    /// Стабильное имя категории, которое видит оператор.
    pub fn category(&self) -> &'static str {
        match self {
            AnalyzerError::DataUnavailable(_) => "DataUnavailable",
            AnalyzerError::AnalysisFailed(_) => "AnalysisFailed",
            AnalyzerError::NotificationFailed(_) => "NotificationFailed",
            AnalyzerError::HttpError(_) => "HttpError",
            AnalyzerError::JsonError(_) => "JsonError",
            AnalyzerError::InvalidConfig(_) => "ConfigError",
            AnalyzerError::InvalidInput(_) => "InvalidInput",
            AnalyzerError::IndicatorError(_) => "IndicatorError",
            AnalyzerError::ServiceUnavailable(_) => "ServiceUnavailable",
            AnalyzerError::TaskError(_) => "TaskError",
        }
    }

    /// Текст ошибки без русского префикса категории.
    pub fn detail(&self) -> String {
        match self {
            AnalyzerError::DataUnavailable(msg)
            | AnalyzerError::AnalysisFailed(msg)
            | AnalyzerError::NotificationFailed(msg)
            | AnalyzerError::InvalidConfig(msg)
            | AnalyzerError::InvalidInput(msg)
            | AnalyzerError::ServiceUnavailable(msg)
            | AnalyzerError::IndicatorError(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

// Псевдоним Result с фиксированным типом ошибки
pub type Result<T> = std::result::Result<T, AnalyzerError>;
