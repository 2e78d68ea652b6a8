use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AnalyzerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    fn validate(&self) -> Result<()> {
        let values = [self.open, self.high, self.low, self.close, self.volume];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(AnalyzerError::DataUnavailable(format!(
                "non-finite value in candle {}",
                self.time
            )));
        }
        if self.open <= 0.0 || self.close <= 0.0 || self.low <= 0.0 {
            return Err(AnalyzerError::DataUnavailable(format!(
                "non-positive price in candle {}",
                self.time
            )));
        }
        if self.volume < 0.0 {
            return Err(AnalyzerError::DataUnavailable(format!(
                "negative volume in candle {}",
                self.time
            )));
        }
        if self.high < self.open.max(self.close) || self.low > self.open.min(self.close) {
            return Err(AnalyzerError::DataUnavailable(format!(
                "high/low do not bound open/close in candle {}",
                self.time
            )));
        }
        Ok(())
    }
}

/// Срез рынка за окно свечей. Создаётся на один вызов анализа и не меняется.
#[derive(Debug, Clone, Serialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub timeframe: String,
    /// Время открытия последней свечи, мс
    pub timestamp: i64,
    pub last_price: f64,
    /// В хронологическом порядке, самая старая первой
    pub candles: Vec<Candle>,
    pub rolling_volume_sum: f64,
    pub pct_change_over_window: f64,
    pub synthetic: bool,
}

impl MarketSnapshot {
    pub fn from_candles(symbol: &str, timeframe: &str, mut candles: Vec<Candle>) -> Result<Self> {
        if candles.is_empty() {
            return Err(AnalyzerError::DataUnavailable(
                "empty candle table".to_string(),
            ));
        }
        for candle in &candles {
            candle.validate()?;
        }
        candles.sort_by_key(|c| c.time);

        let first_close = candles[0].close;
        let last = candles[candles.len() - 1];
        let rolling_volume_sum = candles.iter().map(|c| c.volume).sum();
        let pct_change_over_window = (last.close - first_close) / first_close * 100.0;

        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            timestamp: last.time,
            last_price: last.close,
            candles,
            rolling_volume_sum,
            pct_change_over_window,
            synthetic: false,
        })
    }

    pub(crate) fn into_synthetic(mut self) -> Self {
        self.synthetic = true;
        self
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalLabel {
    StrongBuy,
    Buy,
    Hold,
    Neutral,
    Sell,
    StrongSell,
}

impl SignalLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalLabel::StrongBuy => "STRONG_BUY",
            SignalLabel::Buy => "BUY",
            SignalLabel::Hold => "HOLD",
            SignalLabel::Neutral => "NEUTRAL",
            SignalLabel::Sell => "SELL",
            SignalLabel::StrongSell => "STRONG_SELL",
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, SignalLabel::StrongBuy | SignalLabel::Buy)
    }

    pub fn is_sell(&self) -> bool {
        matches!(self, SignalLabel::StrongSell | SignalLabel::Sell)
    }
}

impl fmt::Display for SignalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Пороговое правило, по которому профиль стратегии выдаёт сигнал.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoringRule {
    SmaDeviation { period: usize, threshold_pct: f64 },
    EmaStack { fast: usize, mid: usize, slow: usize },
    EmaTrend { fast: usize, slow: usize, rsi_period: usize },
    TrendQuality { fast: usize, mid: usize, slow: usize, rsi_period: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyProfile {
    pub name: String,
    pub timeframe: String,
    pub rule: ScoringRule,
}

impl StrategyProfile {
    pub fn new(name: &str, timeframe: &str, rule: ScoringRule) -> Self {
        StrategyProfile {
            name: name.to_string(),
            timeframe: timeframe.to_string(),
            rule,
        }
    }
}

pub fn default_profiles() -> Vec<StrategyProfile> {
    vec![
        StrategyProfile::new(
            "ActiveScalper",
            "5m",
            ScoringRule::EmaStack { fast: 8, mid: 13, slow: 21 },
        ),
        StrategyProfile::new(
            "BalancedTrader",
            "15m",
            ScoringRule::EmaTrend { fast: 9, slow: 21, rsi_period: 14 },
        ),
        StrategyProfile::new(
            "QualityTrader",
            "1h",
            ScoringRule::TrendQuality { fast: 12, mid: 26, slow: 50, rsi_period: 14 },
        ),
        StrategyProfile::new(
            "TestSignalStrategy",
            "5m",
            ScoringRule::SmaDeviation { period: 5, threshold_pct: 0.2 },
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySignal {
    pub strategy_name: String,
    pub timeframe_label: String,
    pub signal_label: SignalLabel,
    pub confidence_percent: u8,
    pub indicators: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketPhase {
    Bullish,
    Bearish,
    Neutral,
    Volatile,
}

impl MarketPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketPhase::Bullish => "BULLISH",
            MarketPhase::Bearish => "BEARISH",
            MarketPhase::Neutral => "NEUTRAL",
            MarketPhase::Volatile => "VOLATILE",
        }
    }

    /// Сервис иногда отвечает старыми названиями фаз.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BULLISH" | "BULL_TREND" => Some(MarketPhase::Bullish),
            "BEARISH" | "BEAR_TREND" => Some(MarketPhase::Bearish),
            "NEUTRAL" | "SIDEWAYS" => Some(MarketPhase::Neutral),
            "VOLATILE" => Some(MarketPhase::Volatile),
            _ => None,
        }
    }
}

impl fmt::Display for MarketPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LOW" => Some(RiskLevel::Low),
            "MEDIUM" | "MED" => Some(RiskLevel::Medium),
            "HIGH" => Some(RiskLevel::High),
            _ => None,
        }
    }
}

/// Откуда взят результат анализа. `Fallback` означает деградированный ответ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisSource {
    External { model: String },
    Fallback { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalAnalysisResult {
    pub market_phase: MarketPhase,
    pub confidence_percent: u8,
    pub key_insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub risk_level: RiskLevel,
    pub summary: String,
    pub source: AnalysisSource,
}

impl ExternalAnalysisResult {
    pub fn is_degraded(&self) -> bool {
        matches!(self.source, AnalysisSource::Fallback { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    Strict,
    Fallback,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Strict => "strict",
            AnalysisMode::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub symbol: String,
    pub timeframe: String,
    pub generated_at: DateTime<Utc>,
    pub mode: AnalysisMode,
    pub snapshot: MarketSnapshot,
    pub signals: Vec<StrategySignal>,
    pub analysis: ExternalAnalysisResult,
    /// Голосование по сигналам стратегий, не зависит от `analysis`
    pub overall_phase: MarketPhase,
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    Long,
    Short,
    Exit,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Long => "LONG",
            SignalType::Short => "SHORT",
            SignalType::Exit => "EXIT",
        }
    }
}

/// Торговый сигнал, который присылает торговый хост при входе или выходе.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub strategy: String,
    pub signal_type: SignalType,
    pub symbol: String,
    pub timeframe: String,
    pub price: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Opened,
    Closed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeUpdate {
    pub strategy: String,
    pub symbol: String,
    pub status: TradeStatus,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub pnl: f64,
    pub duration_secs: Option<u64>,
}

/// Вердикт модели по конкретному сигналу стратегии.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    Buy,
    Sell,
    Hold,
    Avoid,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Buy => "BUY",
            Recommendation::Sell => "SELL",
            Recommendation::Hold => "HOLD",
            Recommendation::Avoid => "AVOID",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(Recommendation::Buy),
            "SELL" => Some(Recommendation::Sell),
            "HOLD" => Some(Recommendation::Hold),
            "AVOID" => Some(Recommendation::Avoid),
            _ => None,
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceTrend {
    StrongUptrend,
    Uptrend,
    Sideways,
    Downtrend,
    StrongDowntrend,
}

impl PriceTrend {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceTrend::StrongUptrend => "STRONG_UPTREND",
            PriceTrend::Uptrend => "UPTREND",
            PriceTrend::Sideways => "SIDEWAYS",
            PriceTrend::Downtrend => "DOWNTREND",
            PriceTrend::StrongDowntrend => "STRONG_DOWNTREND",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VolumeTrend {
    Increasing,
    Stable,
    Decreasing,
}

impl VolumeTrend {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeTrend::Increasing => "INCREASING",
            VolumeTrend::Stable => "STABLE",
            VolumeTrend::Decreasing => "DECREASING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MomentumDirection {
    Bullish,
    Bearish,
    Mixed,
}

impl MomentumDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MomentumDirection::Bullish => "BULLISH",
            MomentumDirection::Bearish => "BEARISH",
            MomentumDirection::Mixed => "MIXED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceLevels {
    pub nearest_support: f64,
    pub nearest_resistance: f64,
    /// Локальных минимумов в пределах 5% от цены
    pub support_strength: usize,
    pub resistance_strength: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Momentum {
    pub momentum_5: f64,
    pub momentum_10: f64,
    pub rate_of_change: f64,
    pub direction: MomentumDirection,
}

/// Разбор последних свечей окна.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandleContext {
    pub price_trend: PriceTrend,
    pub levels: PriceLevels,
    pub patterns: Vec<String>,
    pub momentum: Momentum,
    pub volume_trend: VolumeTrend,
    pub volume_change_pct: f64,
    pub volume_spike: bool,
    /// Стандартное отклонение доходностей, %
    pub volatility_pct: f64,
    pub volatility: RiskLevel,
    pub atr: f64,
    pub atr_pct: f64,
}

/// Рыночный контекст для анализа одного сигнала.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketContext {
    pub symbol: String,
    pub timeframe: String,
    pub last_price: f64,
    pub synthetic: bool,
    /// `None`, если свечей слишком мало
    pub candles: Option<CandleContext>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyFactors {
    pub bullish: Vec<String>,
    pub bearish: Vec<String>,
}

/// Уровни от модели. Модель отвечает то числами, то строками, храним текстом.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetZones {
    pub entry_optimal: Option<String>,
    pub stop_loss: Option<String>,
    pub take_profit_1: Option<String>,
    pub take_profit_2: Option<String>,
}

impl TargetZones {
    pub fn is_empty(&self) -> bool {
        self.entry_optimal.is_none()
            && self.stop_loss.is_none()
            && self.take_profit_1.is_none()
            && self.take_profit_2.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalAnalysis {
    pub recommendation: Recommendation,
    pub confidence_percent: u8,
    pub risk_level: RiskLevel,
    pub key_factors: KeyFactors,
    pub market_analysis: String,
    pub strategy_assessment: String,
    pub risk_warnings: Vec<String>,
    pub target_zones: TargetZones,
    pub summary: String,
    pub source: AnalysisSource,
}

impl SignalAnalysis {
    pub fn is_degraded(&self) -> bool {
        matches!(self.source, AnalysisSource::Fallback { .. })
    }
}

/// Результат фоновой обработки сигнала стратегии.
#[derive(Debug, Clone, Serialize)]
pub struct SignalReport {
    pub signal: TradeSignal,
    pub generated_at: DateTime<Utc>,
    pub mode: AnalysisMode,
    pub context: MarketContext,
    /// Оценка того же окна профилем стратегии, если профиль известен
    pub strategy_signal: Option<StrategySignal>,
    pub analysis: SignalAnalysis,
    pub degraded: bool,
}
