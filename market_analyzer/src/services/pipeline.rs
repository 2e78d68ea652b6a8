use crate::config::AppConfig;
use crate::errors::{AnalyzerError, Result};
use chrono::Utc;

use crate::models::{
    AnalysisMode, AnalysisReport, AnalysisSource, ExternalAnalysisResult, KeyFactors,
    MarketContext, MarketPhase, MarketSnapshot, Recommendation, RiskLevel, SignalAnalysis,
    SignalReport, StrategyProfile, TargetZones, TradeSignal,
};
use crate::services::analyst::MarketAnalyst;
use crate::services::collector::MarketDataCollector;
use crate::services::context::build_market_context;
use crate::services::decision::assemble_report;
use crate::services::scorer::SignalScorer;

const FALLBACK_CONFIDENCE: u8 = 30;
/// Изменение за окно, после которого риск считается высоким, %
const HIGH_RISK_CHANGE_PCT: f64 = 5.0;

/// Деградированный анализ по знаку изменения цены за окно.
pub fn fallback_analysis(snapshot: &MarketSnapshot, reason: &str) -> ExternalAnalysisResult {
    let change = snapshot.pct_change_over_window;
    let market_phase = if change > 0.0 {
        MarketPhase::Bullish
    } else if change < 0.0 {
        MarketPhase::Bearish
    } else {
        MarketPhase::Neutral
    };
    let risk_level = if change.abs() > HIGH_RISK_CHANGE_PCT {
        RiskLevel::High
    } else {
        RiskLevel::Medium
    };

    let mut key_insights = vec![format!("Изменение цены за окно: {:+.2}%", change)];
    if snapshot.synthetic {
        key_insights.push("Рыночные данные недоступны, использована синтетическая серия".to_string());
    }

    ExternalAnalysisResult {
        market_phase,
        confidence_percent: FALLBACK_CONFIDENCE,
        key_insights,
        recommendations: vec!["Требуется ручная проверка".to_string()],
        risk_level,
        summary: format!(
            "Упрощённый анализ {}: фаза {} по изменению цены, ИИ анализ недоступен.",
            snapshot.symbol, market_phase
        ),
        source: AnalysisSource::Fallback {
            reason: reason.to_string(),
        },
    }
}

/// Оценка сигнала без модели: держать позицию до ручной проверки.
pub fn fallback_signal_analysis(
    snapshot: &MarketSnapshot,
    context: &MarketContext,
    reason: &str,
) -> SignalAnalysis {
    let volatile = context
        .candles
        .as_ref()
        .map_or(false, |c| c.volatility == RiskLevel::High);
    let risk_level = if volatile || snapshot.pct_change_over_window.abs() > HIGH_RISK_CHANGE_PCT {
        RiskLevel::High
    } else {
        RiskLevel::Medium
    };

    let mut risk_warnings = vec!["ИИ анализ недоступен, сигнал не проверен".to_string()];
    if snapshot.synthetic {
        risk_warnings.push("Рыночные данные недоступны, использована синтетическая серия".to_string());
    }

    SignalAnalysis {
        recommendation: Recommendation::Hold,
        confidence_percent: FALLBACK_CONFIDENCE,
        risk_level,
        key_factors: KeyFactors::default(),
        market_analysis: format!(
            "Изменение цены за окно: {:+.2}%",
            snapshot.pct_change_over_window
        ),
        strategy_assessment: String::new(),
        risk_warnings,
        target_zones: TargetZones::default(),
        summary: format!(
            "Упрощённая оценка сигнала по {}: требуется ручная проверка.",
            snapshot.symbol
        ),
        source: AnalysisSource::Fallback {
            reason: reason.to_string(),
        },
    }
}

fn fallback_reason(error: &AnalyzerError) -> String {
    format!("{}: {}", error.category(), error.detail())
}

/// Полный цикл анализа: данные, сигналы стратегий, ИИ, отчёт.
#[derive(Clone)]
pub struct MarketAnalyzer {
    collector: MarketDataCollector,
    scorer: SignalScorer,
    analyst: MarketAnalyst,
    mode: AnalysisMode,
    default_symbol: String,
    default_timeframe: String,
}

impl MarketAnalyzer {
    pub fn new(config: &AppConfig) -> Self {
        MarketAnalyzer {
            collector: MarketDataCollector::new(config.market.clone()),
            scorer: SignalScorer::new(config.strategies.clone()),
            analyst: MarketAnalyst::new(config.ai.clone()),
            mode: config.analysis_mode,
            default_symbol: config.market.symbol.clone(),
            default_timeframe: config.market.timeframe.clone(),
        }
    }

    pub fn profiles(&self) -> &[StrategyProfile] {
        self.scorer.profiles()
    }

    pub fn knows_strategy(&self, strategy: &str) -> bool {
        self.scorer.knows(strategy)
    }

    pub fn default_symbol(&self) -> &str {
        &self.default_symbol
    }

    pub fn default_timeframe(&self) -> &str {
        &self.default_timeframe
    }

    pub async fn analyze_default(&self) -> Result<AnalysisReport> {
        self.analyze(&self.default_symbol, &self.default_timeframe)
            .await
    }

    pub async fn analyze(&self, symbol: &str, timeframe: &str) -> Result<AnalysisReport> {
        tracing::info!(
            "Анализ рынка {} {} (режим {})",
            symbol,
            timeframe,
            self.mode.as_str()
        );

        let snapshot = match self.collector.fetch_snapshot(symbol, timeframe).await {
            Ok(snapshot) => snapshot,
            Err(e) if self.mode == AnalysisMode::Fallback => {
                tracing::warn!("Рыночные данные недоступны, переход на fallback: {}", e);
                // Модель не спрашиваем о синтетических данных
                let snapshot = self.collector.synthetic_snapshot(symbol, timeframe)?;
                let signals = self.scorer.score(&snapshot)?;
                let analysis = fallback_analysis(&snapshot, &fallback_reason(&e));
                return Ok(assemble_report(snapshot, signals, analysis, self.mode));
            }
            Err(e) => {
                tracing::error!("Рыночные данные недоступны: {}", e);
                return Err(e);
            }
        };

        let signals = self.scorer.score(&snapshot)?;
        for signal in &signals {
            tracing::debug!(
                "{} ({}): {} {}%",
                signal.strategy_name,
                signal.timeframe_label,
                signal.signal_label,
                signal.confidence_percent
            );
        }

        let analysis = match self.analyst.analyze(&snapshot, &signals).await {
            Ok(analysis) => analysis,
            Err(e) if self.mode == AnalysisMode::Fallback => {
                tracing::warn!("ИИ анализ не удался, используем упрощённый: {}", e);
                fallback_analysis(&snapshot, &fallback_reason(&e))
            }
            Err(e) => {
                tracing::error!("ИИ анализ не удался: {}", e);
                return Err(e);
            }
        };

        let report = assemble_report(snapshot, signals, analysis, self.mode);
        tracing::info!(
            "Анализ {} завершён: фаза {}, ИИ: {} ({}%)",
            symbol,
            report.overall_phase,
            report.analysis.market_phase,
            report.analysis.confidence_percent
        );
        Ok(report)
    }

    /// Разбор одного сигнала стратегии на его символе и таймфрейме.
    pub async fn analyze_signal(&self, signal: &TradeSignal) -> Result<SignalReport> {
        tracing::info!(
            "Анализ сигнала {} {} {} (режим {})",
            signal.strategy,
            signal.signal_type.as_str(),
            signal.symbol,
            self.mode.as_str()
        );

        let (snapshot, data_error) =
            match self.collector.fetch_snapshot(&signal.symbol, &signal.timeframe).await {
                Ok(snapshot) => (snapshot, None),
                Err(e) if self.mode == AnalysisMode::Fallback => {
                    tracing::warn!("Рыночные данные недоступны, переход на fallback: {}", e);
                    let snapshot = self
                        .collector
                        .synthetic_snapshot(&signal.symbol, &signal.timeframe)?;
                    (snapshot, Some(e))
                }
                Err(e) => {
                    tracing::error!("Рыночные данные недоступны: {}", e);
                    return Err(e);
                }
            };

        let context = build_market_context(&snapshot)?;
        let strategy_signal = self.scorer.score_strategy(&signal.strategy, &snapshot)?;

        let analysis = match data_error {
            // Модель не спрашиваем о синтетических данных
            Some(e) => fallback_signal_analysis(&snapshot, &context, &fallback_reason(&e)),
            None => match self
                .analyst
                .analyze_signal(signal, &snapshot, &context, strategy_signal.as_ref())
                .await
            {
                Ok(analysis) => analysis,
                Err(e) if self.mode == AnalysisMode::Fallback => {
                    tracing::warn!("ИИ анализ сигнала не удался, используем упрощённый: {}", e);
                    fallback_signal_analysis(&snapshot, &context, &fallback_reason(&e))
                }
                Err(e) => {
                    tracing::error!("ИИ анализ сигнала не удался: {}", e);
                    return Err(e);
                }
            },
        };

        let degraded = snapshot.synthetic || analysis.is_degraded();
        Ok(SignalReport {
            signal: signal.clone(),
            generated_at: Utc::now(),
            mode: self.mode,
            context,
            strategy_signal,
            analysis,
            degraded,
        })
    }
}
