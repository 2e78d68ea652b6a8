mod common;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use market_analyzer::config::MarketConfig;
use market_analyzer::models::*;
use market_analyzer::services::collector::{parse_kline_payload, MarketDataCollector};
use market_analyzer::services::MarketAnalyzer;

use common::*;

async fn mount_klines(server: &MockServer, closes: &[f64]) {
    Mock::given(method("GET"))
        .and(path("/v5/market/kline"))
        .respond_with(ResponseTemplate::new(200).set_body_json(kline_body(closes)))
        .mount(server)
        .await;
}

async fn mount_completion(server: &MockServer, content: &str, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(content)))
        .expect(expected_calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_fetch_snapshot_sends_exchange_query() {
    let exchange = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/kline"))
        .and(query_param("category", "linear"))
        .and(query_param("symbol", "ETHUSDT"))
        .and(query_param("interval", "15"))
        .and(query_param("limit", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(kline_body(&[10.0, 11.0, 12.0])))
        .expect(1)
        .mount(&exchange)
        .await;

    let config = MarketConfig {
        base_url: exchange.uri(),
        limit: 100,
        ..MarketConfig::default()
    };
    let collector = MarketDataCollector::new(config);

    let snapshot = collector.fetch_snapshot("ETHUSDT", "15m").await.unwrap();
    assert_eq!(snapshot.symbol, "ETHUSDT");
    assert_eq!(snapshot.timeframe, "15m");
    assert_eq!(snapshot.candles.len(), 3);
    // Биржа отдаёт новые свечи первыми, в снимке порядок хронологический
    assert_eq!(snapshot.candles[0].close, 10.0);
    assert_eq!(snapshot.last_price, 12.0);
    assert!((snapshot.pct_change_over_window - 20.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_fetch_snapshot_rejects_bad_payloads() {
    let collector = MarketDataCollector::new(MarketConfig::default());
    let err = collector.fetch_snapshot("BTCUSDT", "7m").await.unwrap_err();
    assert_eq!(err.category(), "DataUnavailable");

    let err = parse_kline_payload(&json!({ "retCode": 10001, "retMsg": "params error" })).unwrap_err();
    assert!(err.detail().contains("params error"));

    let empty = json!({ "retCode": 0, "result": { "list": [] } });
    assert_eq!(parse_kline_payload(&empty).unwrap_err().category(), "DataUnavailable");

    let short_row = json!({ "retCode": 0, "result": { "list": [["1", "2", "3"]] } });
    assert!(parse_kline_payload(&short_row).is_err());

    let not_a_number = json!({ "retCode": 0, "result": { "list": [["1", "x", "3", "1", "2", "5"]] } });
    assert!(parse_kline_payload(&not_a_number).is_err());
}

#[tokio::test]
async fn test_strict_mode_full_report() {
    let exchange = MockServer::start().await;
    let ai = MockServer::start().await;
    mount_klines(&exchange, &rising_closes(100, 40000.0, 20.0)).await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "test-model",
            "response_format": { "type": "json_object" },
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body(&analysis_json("BULLISH", 77))),
        )
        .expect(1)
        .mount(&ai)
        .await;

    let config = test_config(&exchange.uri(), &ai.uri(), AnalysisMode::Strict);
    let analyzer = MarketAnalyzer::new(&config);

    let report = analyzer.analyze("BTCUSDT", "5m").await.unwrap();
    assert_eq!(report.mode, AnalysisMode::Strict);
    assert!(!report.degraded);
    assert!(!report.snapshot.synthetic);
    assert_eq!(report.signals.len(), 4);
    assert_eq!(report.analysis.market_phase, MarketPhase::Bullish);
    assert_eq!(report.analysis.confidence_percent, 77);
    assert_eq!(
        report.analysis.source,
        AnalysisSource::External { model: "test-model".to_string() }
    );
}

#[tokio::test]
async fn test_analysis_without_json_fails_in_strict_mode() {
    let exchange = MockServer::start().await;
    let ai = MockServer::start().await;
    mount_klines(&exchange, &rising_closes(60, 40000.0, 5.0)).await;
    mount_completion(&ai, "Извините, не могу дать анализ в таком формате.", 1).await;

    let config = test_config(&exchange.uri(), &ai.uri(), AnalysisMode::Strict);
    let err = MarketAnalyzer::new(&config)
        .analyze("BTCUSDT", "5m")
        .await
        .unwrap_err();

    assert_eq!(err.category(), "AnalysisFailed");
    assert!(err.detail().contains("JSON not found"));
}

#[tokio::test]
async fn test_exchange_500_fails_in_strict_mode() {
    let exchange = MockServer::start().await;
    let ai = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/kline"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .mount(&exchange)
        .await;
    mount_completion(&ai, &analysis_json("BULLISH", 70), 0).await;

    let config = test_config(&exchange.uri(), &ai.uri(), AnalysisMode::Strict);
    let err = MarketAnalyzer::new(&config)
        .analyze("BTCUSDT", "5m")
        .await
        .unwrap_err();

    assert_eq!(err.category(), "DataUnavailable");
    assert!(err.detail().contains("500"));
}

#[tokio::test]
async fn test_exchange_500_degrades_in_fallback_mode() {
    let exchange = MockServer::start().await;
    let ai = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/kline"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&exchange)
        .await;
    // Модель не вызывается на синтетических данных
    mount_completion(&ai, &analysis_json("BULLISH", 70), 0).await;

    let config = test_config(&exchange.uri(), &ai.uri(), AnalysisMode::Fallback);
    let report = MarketAnalyzer::new(&config)
        .analyze("BTCUSDT", "5m")
        .await
        .unwrap();

    assert!(report.degraded);
    assert!(report.snapshot.synthetic);
    assert_eq!(report.mode, AnalysisMode::Fallback);
    assert_eq!(report.analysis.confidence_percent, 30);
    match &report.analysis.source {
        AnalysisSource::Fallback { reason } => assert!(reason.starts_with("DataUnavailable")),
        other => panic!("expected fallback source, got {:?}", other),
    }

    let change = report.snapshot.pct_change_over_window;
    let expected = if change > 0.0 {
        MarketPhase::Bullish
    } else if change < 0.0 {
        MarketPhase::Bearish
    } else {
        MarketPhase::Neutral
    };
    assert_eq!(report.analysis.market_phase, expected);
}

#[tokio::test]
async fn test_analysis_failure_degrades_in_fallback_mode() {
    let exchange = MockServer::start().await;
    let ai = MockServer::start().await;
    mount_klines(&exchange, &rising_closes(60, 40000.0, -10.0)).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(1)
        .mount(&ai)
        .await;

    let config = test_config(&exchange.uri(), &ai.uri(), AnalysisMode::Fallback);
    let report = MarketAnalyzer::new(&config)
        .analyze("BTCUSDT", "5m")
        .await
        .unwrap();

    // Данные настоящие, деградировал только анализ
    assert!(!report.snapshot.synthetic);
    assert!(report.degraded);
    assert_eq!(report.analysis.market_phase, MarketPhase::Bearish);
    match &report.analysis.source {
        AnalysisSource::Fallback { reason } => {
            assert!(reason.starts_with("AnalysisFailed"));
            assert!(reason.contains("503"));
        }
        other => panic!("expected fallback source, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_api_key_is_explicit() {
    let exchange = MockServer::start().await;
    mount_klines(&exchange, &flat_closes(30, 45000.0)).await;

    let mut config = test_config(&exchange.uri(), "http://127.0.0.1:9", AnalysisMode::Strict);
    config.ai.api_key = None;
    let err = MarketAnalyzer::new(&config)
        .analyze("BTCUSDT", "5m")
        .await
        .unwrap_err();
    assert_eq!(err.detail(), "API key missing");

    config.ai.enabled = false;
    let err = MarketAnalyzer::new(&config)
        .analyze_default()
        .await
        .unwrap_err();
    assert_eq!(err.detail(), "AI analysis disabled");
}

#[tokio::test]
async fn test_signal_analysis_retries_rate_limit() {
    let exchange = MockServer::start().await;
    let ai = MockServer::start().await;
    mount_klines(&exchange, &rising_closes(100, 40000.0, 20.0)).await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limit"))
        .up_to_n_times(2)
        .expect(2)
        .mount(&ai)
        .await;
    mount_completion(&ai, &signal_analysis_json("BUY", 74), 1).await;

    let config = test_config(&exchange.uri(), &ai.uri(), AnalysisMode::Strict);
    let analyzer = MarketAnalyzer::new(&config);

    let report = analyzer.analyze_signal(&trade_signal("ActiveScalper")).await.unwrap();
    assert!(!report.degraded);
    assert_eq!(report.analysis.recommendation, Recommendation::Buy);
    assert_eq!(report.analysis.confidence_percent, 74);
    assert_eq!(report.analysis.key_factors.bullish.len(), 1);
    assert_eq!(report.analysis.target_zones.stop_loss.as_deref(), Some("44500"));
    assert_eq!(
        report.strategy_signal.as_ref().map(|s| s.strategy_name.as_str()),
        Some("ActiveScalper")
    );
    assert!(report.context.candles.is_some());

    // Запрос несёт данные сигнала и рыночный контекст
    let requests = ai.received_requests().await.unwrap();
    let body = String::from_utf8_lossy(&requests[2].body).to_string();
    assert!(body.contains("ActiveScalper"));
    assert!(body.contains("РЫНОЧНЫЕ УСЛОВИЯ"));
}

#[tokio::test]
async fn test_signal_analysis_rate_limit_is_bounded() {
    let exchange = MockServer::start().await;
    let ai = MockServer::start().await;
    mount_klines(&exchange, &rising_closes(100, 40000.0, 20.0)).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&ai)
        .await;

    let config = test_config(&exchange.uri(), &ai.uri(), AnalysisMode::Strict);
    let err = MarketAnalyzer::new(&config)
        .analyze_signal(&trade_signal("QualityTrader"))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "AnalysisFailed");
    assert!(err.detail().contains("429"));

    // В fallback тот же отказ даёт упрощённую оценку
    let ai_fallback = MockServer::start().await;
    let config = test_config(&exchange.uri(), &ai_fallback.uri(), AnalysisMode::Fallback);
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&ai_fallback)
        .await;
    let report = MarketAnalyzer::new(&config)
        .analyze_signal(&trade_signal("QualityTrader"))
        .await
        .unwrap();
    assert!(report.degraded);
    assert_eq!(report.analysis.recommendation, Recommendation::Hold);
    match &report.analysis.source {
        AnalysisSource::Fallback { reason } => assert!(reason.starts_with("AnalysisFailed")),
        other => panic!("expected fallback source, got {:?}", other),
    }
}

#[tokio::test]
async fn test_signal_analysis_on_synthetic_data_skips_model() {
    let exchange = MockServer::start().await;
    let ai = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v5/market/kline"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&exchange)
        .await;
    mount_completion(&ai, &signal_analysis_json("BUY", 90), 0).await;

    let config = test_config(&exchange.uri(), &ai.uri(), AnalysisMode::Fallback);
    let report = MarketAnalyzer::new(&config)
        .analyze_signal(&trade_signal("BalancedTrader"))
        .await
        .unwrap();
    assert!(report.degraded);
    assert!(report.context.synthetic);
    assert_eq!(report.analysis.recommendation, Recommendation::Hold);
    assert!(report.analysis.is_degraded());

    let config = test_config(&exchange.uri(), &ai.uri(), AnalysisMode::Strict);
    let err = MarketAnalyzer::new(&config)
        .analyze_signal(&trade_signal("BalancedTrader"))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "DataUnavailable");
}
