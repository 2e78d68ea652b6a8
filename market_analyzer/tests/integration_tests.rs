mod common;

use std::time::Duration;

use market_analyzer::config::AppConfig;
use market_analyzer::holders::AnalysisGate;
use market_analyzer::models::*;
use market_analyzer::services::analyst::{build_prompt, parse_analysis, strategy_names_from_prompt};
use market_analyzer::services::decision::{assemble_report, determine_market_phase};
use market_analyzer::services::context::{build_market_context, price_trend};
use market_analyzer::services::pipeline::{fallback_analysis, fallback_signal_analysis};
use market_analyzer::services::scorer::{confidence_for, score_profile, SignalScorer};

use common::*;
use tokio_test::{assert_err, assert_ok};

fn profile(name: &str) -> StrategyProfile {
    default_profiles()
        .into_iter()
        .find(|p| p.name == name)
        .unwrap()
}

#[tokio::test]
async fn test_analysis_gate() {
    let gate = AnalysisGate::new(Duration::from_millis(100));

    // Первый запуск проходит, повтор сразу же нет
    assert!(gate.try_acquire("ActiveScalper").await);
    assert!(!gate.try_acquire("ActiveScalper").await);
    assert!(gate.remaining("ActiveScalper").await > Duration::ZERO);

    // Другие стратегии не затронуты
    assert!(gate.try_acquire("QualityTrader").await);
    assert_eq!(gate.len().await, 2);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(gate.remaining("ActiveScalper").await, Duration::ZERO);
    assert!(gate.try_acquire("ActiveScalper").await);
}

#[tokio::test]
async fn test_analysis_gate_forgets_expired_stamps() {
    let gate = AnalysisGate::new(Duration::from_millis(50));

    for i in 0..100 {
        assert!(gate.try_acquire(&format!("Strategy{}", i)).await);
    }
    assert_eq!(gate.len().await, 100);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(gate.try_acquire("ActiveScalper").await);
    assert_eq!(gate.len().await, 1);
}

#[tokio::test]
async fn test_analysis_gate_concurrent_acquire() {
    let gate = AnalysisGate::new(Duration::from_secs(60));

    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let gate = gate.clone();
            tokio::spawn(async move { gate.try_acquire("BalancedTrader").await })
        })
        .collect();

    let mut granted = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);
}

#[test]
fn test_config_validation() {
    let mut config = AppConfig::default();

    // Конфигурация по умолчанию валидна
    assert_ok!(config.validate());

    // ИИ без ключа
    config.ai.enabled = true;
    assert_err!(config.validate());
    config.ai.api_key = Some("sk-test".to_string());
    assert_ok!(config.validate());

    // Таймауты
    config.ai.timeout_secs = 0;
    assert!(config.validate().is_err());
    config.ai.timeout_secs = 61;
    assert!(config.validate().is_err());
    config.ai.timeout_secs = 60;
    assert!(config.validate().is_ok());

    // Количество свечей
    config.market.limit = 0;
    assert!(config.validate().is_err());
    config.market.limit = 1001;
    assert!(config.validate().is_err());
    config.market.limit = 288;

    // Telegram без токена и чата
    config.telegram.enabled = true;
    assert!(config.validate().is_err());
    config.telegram.bot_token = Some("123:abc".to_string());
    assert!(config.validate().is_err());
    config.telegram.chat_id = Some("42".to_string());
    assert!(config.validate().is_ok());

    config.telegram.max_message_length = 4097;
    assert!(config.validate().is_err());
    config.telegram.max_message_length = 99;
    assert!(config.validate().is_err());
    config.telegram.max_message_length = 100;
    assert!(config.validate().is_ok());
    config.telegram.max_message_length = 4096;

    config.telegram.retry_attempts = 0;
    assert!(config.validate().is_err());
    config.telegram.retry_attempts = 3;

    config.dispatcher.worker_count = 0;
    assert!(config.validate().is_err());
    config.dispatcher.worker_count = 33;
    assert!(config.validate().is_err());
    config.dispatcher.worker_count = 2;
    assert!(config.validate().is_ok());

    config.ai.signal_retry_attempts = 0;
    assert!(config.validate().is_err());
    config.ai.signal_retry_attempts = 3;

    // Таймфрейм должен поддерживаться биржей
    config.market.timeframe = "7m".to_string();
    assert_err!(config.validate());
    config.market.timeframe = "15m".to_string();
    assert_ok!(config.validate());

    config.webhook.urls = vec!["ftp://hooks.local".to_string()];
    assert!(config.validate().is_err());
    config.webhook.urls = vec!["https://hooks.local/signal".to_string()];
    assert!(config.validate().is_ok());
    config.webhook.max_retries = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_strategy_config_validation() {
    let mut config = AppConfig::default();

    config.strategies.push(profile("ActiveScalper"));
    assert!(config.validate().is_err(), "duplicate names must be rejected");

    config.strategies = vec![StrategyProfile::new(
        "bad name",
        "5m",
        ScoringRule::SmaDeviation { period: 5, threshold_pct: 0.2 },
    )];
    assert!(config.validate().is_err());

    config.strategies = vec![StrategyProfile::new(
        "Unordered",
        "5m",
        ScoringRule::EmaStack { fast: 21, mid: 13, slow: 8 },
    )];
    assert!(config.validate().is_err());

    config.strategies = vec![StrategyProfile::new(
        "ZeroThreshold",
        "5m",
        ScoringRule::SmaDeviation { period: 5, threshold_pct: 0.0 },
    )];
    assert!(config.validate().is_err());

    config.strategies = vec![StrategyProfile::new(
        "OddTimeframe",
        "10m",
        ScoringRule::SmaDeviation { period: 5, threshold_pct: 0.2 },
    )];
    assert!(config.validate().is_err());

    config.strategies = Vec::new();
    assert!(config.validate().is_err());
}

#[test]
fn test_market_context_on_trends() {
    let rising = snapshot_from_closes(&rising_closes(60, 40000.0, 400.0));
    let context = build_market_context(&rising).unwrap();
    let candles = context.candles.unwrap();
    assert_eq!(candles.price_trend, PriceTrend::StrongUptrend);
    assert_eq!(candles.momentum.direction, MomentumDirection::Bullish);
    assert_eq!(candles.volume_trend, VolumeTrend::Stable);
    assert!(!candles.volume_spike);
    assert!(candles.atr > 0.0);

    let flat = snapshot_from_closes(&flat_closes(60, 45000.0));
    let candles = build_market_context(&flat).unwrap().candles.unwrap();
    assert_eq!(candles.price_trend, PriceTrend::Sideways);
    assert_eq!(candles.volatility, RiskLevel::Low);

    // Короткое окно без разбора свечей
    let short = snapshot_from_closes(&rising_closes(10, 40000.0, 40.0));
    let context = build_market_context(&short).unwrap();
    assert!(context.candles.is_none());
    assert_eq!(context.last_price, 40360.0);

    assert_eq!(price_trend(&rising_closes(20, 100.0, -0.01)).unwrap(), PriceTrend::Sideways);
}

#[test]
fn test_fallback_signal_analysis_holds() {
    let snapshot = snapshot_from_closes(&rising_closes(60, 40000.0, 100.0));
    let context = build_market_context(&snapshot).unwrap();
    let analysis = fallback_signal_analysis(&snapshot, &context, "AnalysisFailed: timeout");

    assert_eq!(analysis.recommendation, Recommendation::Hold);
    assert_eq!(analysis.confidence_percent, 30);
    // +14.75% за окно
    assert_eq!(analysis.risk_level, RiskLevel::High);
    assert!(analysis.is_degraded());
    assert!(!analysis.risk_warnings.is_empty());
}

#[test]
fn test_snapshot_from_candles() {
    let mut candles = candles_from_closes(&[100.0, 110.0, 99.0]);
    candles.reverse();

    let snapshot = MarketSnapshot::from_candles("BTCUSDT", "5m", candles).unwrap();
    assert_eq!(snapshot.candles[0].close, 100.0);
    assert_eq!(snapshot.last_price, 99.0);
    assert_eq!(snapshot.timestamp, START_TIME + 2 * STEP_MS);
    assert_eq!(snapshot.rolling_volume_sum, 30.0);
    assert!((snapshot.pct_change_over_window - -1.0).abs() < 1e-9);
    assert!(!snapshot.synthetic);

    assert!(MarketSnapshot::from_candles("BTCUSDT", "5m", Vec::new()).is_err());

    let mut broken = candles_from_closes(&[100.0, 101.0]);
    broken[1].high = 50.0;
    let err = MarketSnapshot::from_candles("BTCUSDT", "5m", broken).unwrap_err();
    assert_eq!(err.category(), "DataUnavailable");

    let mut negative = candles_from_closes(&[100.0]);
    negative[0].volume = -1.0;
    assert!(MarketSnapshot::from_candles("BTCUSDT", "5m", negative).is_err());
}

#[test]
fn test_flat_price_is_neutral() {
    let snapshot = snapshot_from_closes(&flat_closes(50, 45000.0));
    let signal = score_profile(&profile("TestSignalStrategy"), &snapshot).unwrap();

    assert_eq!(signal.signal_label, SignalLabel::Neutral);
    assert_eq!(signal.confidence_percent, 30);
    assert_eq!(signal.strategy_name, "TestSignalStrategy");
    assert_eq!(signal.timeframe_label, "5m");
}

#[test]
fn test_sma_deviation_thresholds() {
    let rule = StrategyProfile::new(
        "Deviation",
        "5m",
        ScoringRule::SmaDeviation { period: 5, threshold_pct: 0.2 },
    );

    // Последняя цена на 0.5% выше средней: BUY
    let mut closes = flat_closes(10, 100.0);
    closes.push(100.625);
    let signal = score_profile(&rule, &snapshot_from_closes(&closes)).unwrap();
    assert_eq!(signal.signal_label, SignalLabel::Buy);

    // Выше на 5x порога: STRONG_BUY
    let mut closes = flat_closes(10, 100.0);
    closes.push(110.0);
    let signal = score_profile(&rule, &snapshot_from_closes(&closes)).unwrap();
    assert_eq!(signal.signal_label, SignalLabel::StrongBuy);
    assert_eq!(signal.confidence_percent, 80);

    let mut closes = flat_closes(10, 100.0);
    closes.push(90.0);
    let signal = score_profile(&rule, &snapshot_from_closes(&closes)).unwrap();
    assert_eq!(signal.signal_label, SignalLabel::StrongSell);
}

#[test]
fn test_trend_rules_on_uptrend() {
    let snapshot = snapshot_from_closes(&rising_closes(120, 40000.0, 50.0));

    let scalper = score_profile(&profile("ActiveScalper"), &snapshot).unwrap();
    assert_eq!(scalper.signal_label, SignalLabel::StrongBuy);
    assert!(scalper.indicators.contains_key("bb_upper"));
    assert!(scalper.indicators.contains_key("ema21"));

    // RSI 100 на монотонном росте: перекупленность
    let balanced = score_profile(&profile("BalancedTrader"), &snapshot).unwrap();
    assert_eq!(balanced.signal_label, SignalLabel::Hold);
    assert!(balanced.indicators.contains_key("atr"));

    let quality = score_profile(&profile("QualityTrader"), &snapshot).unwrap();
    assert_eq!(quality.signal_label, SignalLabel::Buy);
}

#[test]
fn test_trend_rules_on_downtrend() {
    let snapshot = snapshot_from_closes(&rising_closes(120, 46000.0, -50.0));

    let scalper = score_profile(&profile("ActiveScalper"), &snapshot).unwrap();
    assert_eq!(scalper.signal_label, SignalLabel::StrongSell);

    let balanced = score_profile(&profile("BalancedTrader"), &snapshot).unwrap();
    assert_eq!(balanced.signal_label, SignalLabel::Hold);

    let quality = score_profile(&profile("QualityTrader"), &snapshot).unwrap();
    assert_eq!(quality.signal_label, SignalLabel::Sell);
}

#[test]
fn test_scorer_is_idempotent() {
    let closes: Vec<f64> = (0..200)
        .map(|i| 45000.0 + (i as f64 * 0.3).sin() * 400.0 + i as f64 * 2.0)
        .collect();
    let snapshot = snapshot_from_closes(&closes);
    let scorer = SignalScorer::new(default_profiles());

    let first = scorer.score(&snapshot).unwrap();
    let second = scorer.score(&snapshot).unwrap();

    assert_eq!(first, second);
    let names: Vec<_> = first.iter().map(|s| s.strategy_name.as_str()).collect();
    assert_eq!(
        names,
        ["ActiveScalper", "BalancedTrader", "QualityTrader", "TestSignalStrategy"]
    );
}

#[test]
fn test_confidence_table() {
    assert_eq!(confidence_for(SignalLabel::StrongBuy), 80);
    assert_eq!(confidence_for(SignalLabel::StrongSell), 80);
    assert_eq!(confidence_for(SignalLabel::Buy), 60);
    assert_eq!(confidence_for(SignalLabel::Sell), 60);
    assert_eq!(confidence_for(SignalLabel::Hold), 30);
    assert_eq!(confidence_for(SignalLabel::Neutral), 30);
}

#[test]
fn test_market_phase_vote() {
    let labels = [
        SignalLabel::StrongBuy,
        SignalLabel::Buy,
        SignalLabel::Hold,
        SignalLabel::Neutral,
        SignalLabel::Sell,
        SignalLabel::StrongSell,
    ];

    // Все комбинации до четырёх сигналов
    for len in 0..=4u32 {
        for code in 0..labels.len().pow(len) {
            let mut rest = code;
            let signals: Vec<_> = (0..len)
                .map(|i| {
                    let label = labels[rest % labels.len()];
                    rest /= labels.len();
                    signal(&format!("S{}", i), label)
                })
                .collect();

            let buys = signals.iter().filter(|s| s.signal_label.as_str().contains("BUY")).count();
            let sells = signals.iter().filter(|s| s.signal_label.as_str().contains("SELL")).count();
            let expected = if buys > sells + 1 {
                MarketPhase::Bullish
            } else if sells > buys + 1 {
                MarketPhase::Bearish
            } else {
                MarketPhase::Neutral
            };

            assert_eq!(determine_market_phase(&signals), expected, "{:?}", signals);
        }
    }
}

#[test]
fn test_assemble_report_ignores_external_phase() {
    let snapshot = snapshot_from_closes(&rising_closes(30, 100.0, 1.0));
    let signals = vec![
        signal("A", SignalLabel::Buy),
        signal("B", SignalLabel::StrongBuy),
        signal("C", SignalLabel::Neutral),
    ];
    let analysis = parse_analysis(&analysis_json("BEARISH", 90), "test-model").unwrap();

    let report = assemble_report(snapshot, signals, analysis, AnalysisMode::Strict);
    assert_eq!(report.overall_phase, MarketPhase::Bullish);
    assert_eq!(report.analysis.market_phase, MarketPhase::Bearish);
    assert!(!report.degraded);
    assert_eq!(report.symbol, "BTCUSDT");
}

#[test]
fn test_fallback_analysis_uses_price_sign() {
    let up = snapshot_from_closes(&rising_closes(10, 100.0, 1.0));
    let analysis = fallback_analysis(&up, "AnalysisFailed: JSON not found");
    assert_eq!(analysis.market_phase, MarketPhase::Bullish);
    assert_eq!(analysis.confidence_percent, 30);
    assert_eq!(analysis.risk_level, RiskLevel::High);
    assert!(analysis.is_degraded());

    let flat = snapshot_from_closes(&flat_closes(10, 100.0));
    let analysis = fallback_analysis(&flat, "reason");
    assert_eq!(analysis.market_phase, MarketPhase::Neutral);
    assert_eq!(analysis.risk_level, RiskLevel::Medium);

    let down = snapshot_from_closes(&[100.0, 99.0, 98.0]);
    let analysis = fallback_analysis(&down, "reason");
    assert_eq!(analysis.market_phase, MarketPhase::Bearish);
    assert_eq!(analysis.risk_level, RiskLevel::Medium);

    let report = assemble_report(down, Vec::new(), analysis, AnalysisMode::Fallback);
    assert!(report.degraded);
}

#[test]
fn test_prompt_round_trip() {
    let snapshot = snapshot_from_closes(&rising_closes(60, 45000.0, 10.0));
    let signals = SignalScorer::new(default_profiles()).score(&snapshot).unwrap();

    let prompt = build_prompt(&snapshot, &signals);
    let expected: Vec<String> = signals.iter().map(|s| s.strategy_name.clone()).collect();
    assert_eq!(strategy_names_from_prompt(&prompt), expected);

    // Детерминированность
    assert_eq!(prompt, build_prompt(&snapshot, &signals));

    let reversed: Vec<_> = signals.iter().rev().cloned().collect();
    let names = strategy_names_from_prompt(&build_prompt(&snapshot, &reversed));
    assert_eq!(names.first().map(String::as_str), Some("TestSignalStrategy"));
}

#[test]
fn test_confidence_boundaries() {
    for confidence in [0, 100] {
        let result = parse_analysis(&analysis_json("NEUTRAL", confidence), "m").unwrap();
        assert_eq!(result.confidence_percent as i64, confidence);
    }

    for confidence in [-1, 101] {
        let err = parse_analysis(&analysis_json("NEUTRAL", confidence), "m").unwrap_err();
        assert_eq!(err.category(), "AnalysisFailed");
    }
}

#[test]
fn test_parse_analysis_validation() {
    let err = parse_analysis("Рынок выглядит бычьим, рекомендую покупать.", "m").unwrap_err();
    assert_eq!(err.category(), "AnalysisFailed");
    assert!(err.detail().contains("JSON not found"));

    let err = parse_analysis(&analysis_json("MOON", 50), "m").unwrap_err();
    assert!(err.detail().contains("market_phase"));

    let err = parse_analysis(r#"{"market_phase":"BULLISH","confidence":"80","summary":"x"}"#, "m")
        .unwrap_err();
    assert!(err.detail().contains("confidence"));

    let err = parse_analysis(r#"{"market_phase":"BULLISH","confidence":80}"#, "m").unwrap_err();
    assert!(err.detail().contains("summary"));

    // Старые названия фаз и текст вокруг JSON
    let text = format!("Вот анализ:\n{}\nУдачи!", analysis_json("BULL_TREND", 72));
    let result = parse_analysis(&text, "gpt-test").unwrap();
    assert_eq!(result.market_phase, MarketPhase::Bullish);
    assert_eq!(result.risk_level, RiskLevel::Low);
    assert_eq!(result.key_insights, vec!["Объёмы растут".to_string()]);
    assert_eq!(
        result.source,
        AnalysisSource::External { model: "gpt-test".to_string() }
    );
}
