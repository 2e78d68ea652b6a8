use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::errors::AnalyzerError;
use crate::models::{TradeSignal, TradeUpdate};
use crate::notifications::formatter;
use crate::services::SubmitOutcome;
use crate::AppState;

#[derive(Deserialize)]
pub struct AnalysisQuery {
    pub symbol: Option<String>,
    pub timeframe: Option<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct StrategyInfo {
    pub name: String,
    pub timeframe: String,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub analysis_mode: String,
    pub ai_enabled: bool,
    pub telegram_enabled: bool,
    pub webhooks_enabled: bool,
    pub uptime_secs: u64,
    pub symbol: String,
    pub timeframe: String,
    pub strategies: Vec<StrategyInfo>,
    pub available_endpoints: Vec<String>,
}

fn error_status(error: &AnalyzerError) -> StatusCode {
    match error {
        AnalyzerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        AnalyzerError::DataUnavailable(_) | AnalyzerError::ServiceUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        AnalyzerError::AnalysisFailed(_) | AnalyzerError::NotificationFailed(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &AnalyzerError) -> (StatusCode, Json<Value>) {
    (
        error_status(error),
        Json(json!({
            "status": "error",
            "error_type": error.category(),
            "message": error.detail(),
        })),
    )
}

fn bad_request(message: String) -> (StatusCode, Json<Value>) {
    error_response(&AnalyzerError::InvalidInput(message))
}

// Проверка здоровья сервиса
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        message: "Market Analyzer API is running".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let config = &state.config;

    Json(StatusResponse {
        status: "ready".to_string(),
        analysis_mode: config.analysis_mode.as_str().to_string(),
        ai_enabled: config.ai_analysis_enabled(),
        telegram_enabled: state.notifier.is_some(),
        webhooks_enabled: state.publisher.is_enabled(),
        uptime_secs: state.uptime().as_secs(),
        symbol: config.market.symbol.clone(),
        timeframe: config.market.timeframe.clone(),
        strategies: state
            .analyzer
            .profiles()
            .iter()
            .map(|p| StrategyInfo {
                name: p.name.clone(),
                timeframe: p.timeframe.clone(),
            })
            .collect(),
        available_endpoints: vec![
            "/".to_string(),
            "/status".to_string(),
            "/api/market-analysis".to_string(),
            "/api/signals".to_string(),
            "/api/trades".to_string(),
        ],
    })
}

// Полный анализ рынка по запросу
pub async fn market_analysis(
    State(state): State<AppState>,
    Query(query): Query<AnalysisQuery>,
) -> (StatusCode, Json<Value>) {
    let symbol = query
        .symbol
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| state.analyzer.default_symbol().to_string());
    let timeframe = query
        .timeframe
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| state.analyzer.default_timeframe().to_string());

    tracing::info!("Запрос анализа рынка {} {}", symbol, timeframe);

    match state.analyzer.analyze(&symbol, &timeframe).await {
        Ok(report) => match serde_json::to_value(&report) {
            Ok(body) => (StatusCode::OK, Json(body)),
            Err(e) => error_response(&AnalyzerError::JsonError(e)),
        },
        Err(e) => {
            tracing::error!("Ошибка анализа рынка: {}", e);
            error_response(&e)
        }
    }
}

// Сигнал от торгового хоста, анализ в фоне
pub async fn submit_signal(
    State(state): State<AppState>,
    payload: Result<Json<TradeSignal>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let Json(signal) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::warn!("Некорректный сигнал: {}", rejection);
            return bad_request(rejection.body_text());
        }
    };

    match state.dispatcher.submit(signal).await {
        Ok(SubmitOutcome::Queued) => (StatusCode::ACCEPTED, Json(json!({ "status": "queued" }))),
        Ok(SubmitOutcome::RateLimited { retry_in }) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "status": "rate_limited",
                "retry_in_secs": retry_in.as_secs(),
            })),
        ),
        Ok(SubmitOutcome::QueueFull) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "queue_full" })),
        ),
        Err(e) => error_response(&e),
    }
}

// Обновление по сделке, сразу в чат
pub async fn trade_update(
    State(state): State<AppState>,
    payload: Result<Json<TradeUpdate>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let Json(update) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    // Доставка best effort: сбой канала не делает запрос ошибочным
    let published = state.publisher.publish_trade_result(&update).await;

    let Some(notifier) = state.notifier.as_ref() else {
        return (
            StatusCode::OK,
            Json(json!({
                "status": "skipped",
                "reason": "notifications disabled",
                "published": published,
            })),
        );
    };

    let sent = notifier.notify(&formatter::format_trade_update(&update)).await;
    if !sent {
        tracing::warn!("Обновление сделки {} не доставлено в Telegram", update.strategy);
    }
    (
        StatusCode::OK,
        Json(json!({
            "status": if sent { "sent" } else { "failed" },
            "published": published,
        })),
    )
}

// Создание маршрутов
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/status", get(get_status))
        .route("/api/market-analysis", get(market_analysis))
        .route("/api/signals", post(submit_signal))
        .route("/api/trades", post(trade_update))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
