use chrono::Utc;

use crate::models::{
    AnalysisMode, AnalysisReport, ExternalAnalysisResult, MarketPhase, MarketSnapshot,
    StrategySignal,
};

/// Общая фаза рынка по голосам стратегий. Нужен перевес больше одного голоса.
/// Анализ модели здесь не участвует.
pub fn determine_market_phase(signals: &[StrategySignal]) -> MarketPhase {
    let buys = signals.iter().filter(|s| s.signal_label.is_buy()).count();
    let sells = signals.iter().filter(|s| s.signal_label.is_sell()).count();

    if buys > sells + 1 {
        MarketPhase::Bullish
    } else if sells > buys + 1 {
        MarketPhase::Bearish
    } else {
        MarketPhase::Neutral
    }
}

/// Сборка итогового отчёта
pub fn assemble_report(
    snapshot: MarketSnapshot,
    signals: Vec<StrategySignal>,
    analysis: ExternalAnalysisResult,
    mode: AnalysisMode,
) -> AnalysisReport {
    let overall_phase = determine_market_phase(&signals);
    let degraded = snapshot.synthetic || analysis.is_degraded();

    tracing::debug!(
        "Отчёт {} {}: фаза {}, сигналов {}, деградирован: {}",
        snapshot.symbol,
        snapshot.timeframe,
        overall_phase,
        signals.len(),
        degraded
    );

    AnalysisReport {
        symbol: snapshot.symbol.clone(),
        timeframe: snapshot.timeframe.clone(),
        generated_at: Utc::now(),
        mode,
        snapshot,
        signals,
        analysis,
        overall_phase,
        degraded,
    }
}
