use std::collections::BTreeMap;

use ta::indicators::{
    AverageTrueRange, BollingerBands, ExponentialMovingAverage, RelativeStrengthIndex,
    SimpleMovingAverage,
};
use ta::{DataItem, Next};

use crate::errors::{AnalyzerError, Result};
use crate::models::{Candle, MarketSnapshot, ScoringRule, SignalLabel, StrategyProfile, StrategySignal};

const BB_PERIOD: usize = 20;
const BB_MULTIPLIER: f64 = 2.0;
const SCALPER_RSI_PERIOD: usize = 7;
const ATR_PERIOD: usize = 14;
/// Во сколько раз отклонение от SMA должно превысить порог для STRONG сигнала
const STRONG_DEVIATION_FACTOR: f64 = 5.0;

/// Фиксированная таблица уверенности по силе сигнала.
pub fn confidence_for(label: SignalLabel) -> u8 {
    match label {
        SignalLabel::StrongBuy | SignalLabel::StrongSell => 80,
        SignalLabel::Buy | SignalLabel::Sell => 60,
        SignalLabel::Hold | SignalLabel::Neutral => 30,
    }
}

#[derive(Clone)]
pub struct SignalScorer {
    profiles: Vec<StrategyProfile>,
}

impl SignalScorer {
    pub fn new(profiles: Vec<StrategyProfile>) -> Self {
        SignalScorer { profiles }
    }

    pub fn profiles(&self) -> &[StrategyProfile] {
        &self.profiles
    }

    /// Один сигнал на каждый профиль, в порядке профилей.
    pub fn score(&self, snapshot: &MarketSnapshot) -> Result<Vec<StrategySignal>> {
        self.profiles
            .iter()
            .map(|profile| score_profile(profile, snapshot))
            .collect()
    }

    pub fn knows(&self, strategy: &str) -> bool {
        self.profiles.iter().any(|p| p.name == strategy)
    }

    /// Сигнал одного профиля по имени. Неизвестная стратегия → `None`.
    pub fn score_strategy(
        &self,
        strategy: &str,
        snapshot: &MarketSnapshot,
    ) -> Result<Option<StrategySignal>> {
        self.profiles
            .iter()
            .find(|p| p.name == strategy)
            .map(|profile| score_profile(profile, snapshot))
            .transpose()
    }
}

pub fn score_profile(profile: &StrategyProfile, snapshot: &MarketSnapshot) -> Result<StrategySignal> {
    if snapshot.candles.is_empty() {
        return Err(AnalyzerError::DataUnavailable(
            "snapshot has no candles".to_string(),
        ));
    }

    let closes = snapshot.closes();
    let price = snapshot.last_price;
    let mut indicators = BTreeMap::new();

    let label = match &profile.rule {
        ScoringRule::SmaDeviation { period, threshold_pct } => {
            let sma = last_value(SimpleMovingAverage::new(*period).map_err(indicator_error)?, &closes);
            indicators.insert(format!("sma{}", period), sma);

            let deviation = (price - sma) / sma * 100.0;
            indicators.insert("sma_deviation_pct".to_string(), deviation);

            let strong = threshold_pct * STRONG_DEVIATION_FACTOR;
            if deviation > strong {
                SignalLabel::StrongBuy
            } else if deviation > *threshold_pct {
                SignalLabel::Buy
            } else if deviation < -strong {
                SignalLabel::StrongSell
            } else if deviation < -threshold_pct {
                SignalLabel::Sell
            } else {
                SignalLabel::Neutral
            }
        }
        ScoringRule::EmaStack { fast, mid, slow } => {
            let (f, m, s) = ema_triplet(&closes, *fast, *mid, *slow, &mut indicators)?;
            let (bb_upper, bb_lower) = bollinger(&closes)?;
            indicators.insert("bb_upper".to_string(), bb_upper);
            indicators.insert("bb_lower".to_string(), bb_lower);
            indicators.insert(
                "rsi".to_string(),
                last_value(RelativeStrengthIndex::new(SCALPER_RSI_PERIOD).map_err(indicator_error)?, &closes),
            );

            if price > f && f > m && m > s {
                SignalLabel::StrongBuy
            } else if price > s {
                SignalLabel::Buy
            } else if price < f && f < m && m < s {
                SignalLabel::StrongSell
            } else if price < s {
                SignalLabel::Sell
            } else {
                SignalLabel::Neutral
            }
        }
        ScoringRule::EmaTrend { fast, slow, rsi_period } => {
            let f = last_value(ExponentialMovingAverage::new(*fast).map_err(indicator_error)?, &closes);
            let s = last_value(ExponentialMovingAverage::new(*slow).map_err(indicator_error)?, &closes);
            let rsi = last_value(RelativeStrengthIndex::new(*rsi_period).map_err(indicator_error)?, &closes);
            indicators.insert(format!("ema{}", fast), f);
            indicators.insert(format!("ema{}", slow), s);
            indicators.insert("rsi".to_string(), rsi);
            indicators.insert("atr".to_string(), atr(&snapshot.candles)?);

            if f > s && price > f {
                if rsi > 70.0 {
                    SignalLabel::Hold
                } else if rsi >= 50.0 {
                    SignalLabel::StrongBuy
                } else {
                    SignalLabel::Buy
                }
            } else if f < s && price < f {
                if rsi < 30.0 {
                    SignalLabel::Hold
                } else if rsi <= 50.0 {
                    SignalLabel::StrongSell
                } else {
                    SignalLabel::Sell
                }
            } else {
                SignalLabel::Neutral
            }
        }
        ScoringRule::TrendQuality { fast, mid, slow, rsi_period } => {
            let (f, m, s) = ema_triplet(&closes, *fast, *mid, *slow, &mut indicators)?;
            let rsi = last_value(RelativeStrengthIndex::new(*rsi_period).map_err(indicator_error)?, &closes);
            indicators.insert("rsi".to_string(), rsi);

            if price > f && f > m && m > s {
                if (50.0..=70.0).contains(&rsi) {
                    SignalLabel::StrongBuy
                } else {
                    SignalLabel::Buy
                }
            } else if price < f && f < m && m < s {
                if (30.0..=50.0).contains(&rsi) {
                    SignalLabel::StrongSell
                } else {
                    SignalLabel::Sell
                }
            } else {
                SignalLabel::Neutral
            }
        }
    };

    Ok(StrategySignal {
        strategy_name: profile.name.clone(),
        timeframe_label: profile.timeframe.clone(),
        signal_label: label,
        confidence_percent: confidence_for(label),
        indicators,
    })
}

pub(crate) fn indicator_error(e: ta::errors::TaError) -> AnalyzerError {
    AnalyzerError::IndicatorError(format!("{:?}", e))
}

/// Прогоняет всю серию через индикатор и возвращает последнее значение.
pub(crate) fn last_value<I>(mut indicator: I, values: &[f64]) -> f64
where
    I: Next<f64, Output = f64>,
{
    values.iter().fold(f64::NAN, |_, v| indicator.next(*v))
}

fn ema_triplet(
    closes: &[f64],
    fast: usize,
    mid: usize,
    slow: usize,
    indicators: &mut BTreeMap<String, f64>,
) -> Result<(f64, f64, f64)> {
    let f = last_value(ExponentialMovingAverage::new(fast).map_err(indicator_error)?, closes);
    let m = last_value(ExponentialMovingAverage::new(mid).map_err(indicator_error)?, closes);
    let s = last_value(ExponentialMovingAverage::new(slow).map_err(indicator_error)?, closes);
    indicators.insert(format!("ema{}", fast), f);
    indicators.insert(format!("ema{}", mid), m);
    indicators.insert(format!("ema{}", slow), s);
    Ok((f, m, s))
}

fn bollinger(closes: &[f64]) -> Result<(f64, f64)> {
    let mut bands = BollingerBands::new(BB_PERIOD, BB_MULTIPLIER).map_err(indicator_error)?;
    let mut upper = f64::NAN;
    let mut lower = f64::NAN;
    for close in closes {
        let out = bands.next(*close);
        upper = out.upper;
        lower = out.lower;
    }
    Ok((upper, lower))
}

pub(crate) fn atr(candles: &[Candle]) -> Result<f64> {
    let mut atr = AverageTrueRange::new(ATR_PERIOD).map_err(indicator_error)?;
    let mut value = f64::NAN;
    for candle in candles {
        let item = DataItem::builder()
            .open(candle.open)
            .high(candle.high)
            .low(candle.low)
            .close(candle.close)
            .volume(candle.volume)
            .build()
            .map_err(indicator_error)?;
        value = atr.next(&item);
    }
    Ok(value)
}
