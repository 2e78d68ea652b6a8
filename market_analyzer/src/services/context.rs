//! Рыночный контекст для анализа отдельного сигнала: тренд, уровни,
//! свечные паттерны, моментум, объёмы и волатильность по последним
//! свечам окна.

use ta::indicators::{RateOfChange, SimpleMovingAverage, StandardDeviation};

use crate::errors::Result;
use crate::models::{
    Candle, CandleContext, MarketContext, MarketSnapshot, Momentum, MomentumDirection,
    PriceLevels, PriceTrend, RiskLevel, VolumeTrend,
};
use crate::services::scorer::{atr, indicator_error, last_value};

/// Столько последних свечей разбирается, меньше → контекста нет
pub const CONTEXT_WINDOW: usize = 20;
const TREND_SPAN: usize = 5;
const PATTERN_CANDLES: usize = 3;
const LEVEL_PROXIMITY: f64 = 0.05;

pub fn build_market_context(snapshot: &MarketSnapshot) -> Result<MarketContext> {
    let candles = if snapshot.candles.len() >= CONTEXT_WINDOW {
        let recent = &snapshot.candles[snapshot.candles.len() - CONTEXT_WINDOW..];
        Some(analyze_candles(recent)?)
    } else {
        None
    };

    Ok(MarketContext {
        symbol: snapshot.symbol.clone(),
        timeframe: snapshot.timeframe.clone(),
        last_price: snapshot.last_price,
        synthetic: snapshot.synthetic,
        candles,
    })
}

fn analyze_candles(recent: &[Candle]) -> Result<CandleContext> {
    let closes: Vec<f64> = recent.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = recent.iter().map(|c| c.volume).collect();
    let price = closes[closes.len() - 1];

    let (volume_trend, volume_change_pct, volume_spike) = volume_profile(&volumes)?;
    let (volatility, volatility_pct) = volatility(&closes)?;
    let atr = atr(recent)?;

    Ok(CandleContext {
        price_trend: price_trend(&closes)?,
        levels: price_levels(recent, price),
        patterns: candle_patterns(recent),
        momentum: momentum(&closes)?,
        volume_trend,
        volume_change_pct,
        volume_spike,
        volatility_pct,
        volatility,
        atr,
        atr_pct: atr / price * 100.0,
    })
}

/// Среднее последних и предыдущих `n` значений.
fn split_means(values: &[f64], n: usize) -> Result<(f64, f64)> {
    let recent = last_value(SimpleMovingAverage::new(n).map_err(indicator_error)?, values);
    let previous = last_value(
        SimpleMovingAverage::new(n).map_err(indicator_error)?,
        &values[..values.len() - n],
    );
    Ok((recent, previous))
}

fn pct_change(from: f64, to: f64) -> f64 {
    if from == 0.0 {
        0.0
    } else {
        (to - from) / from * 100.0
    }
}

pub fn price_trend(closes: &[f64]) -> Result<PriceTrend> {
    let (recent, previous) = split_means(closes, TREND_SPAN)?;
    let change = pct_change(previous, recent);

    let trend = if change > 2.0 {
        PriceTrend::StrongUptrend
    } else if change > 0.5 {
        PriceTrend::Uptrend
    } else if change < -2.0 {
        PriceTrend::StrongDowntrend
    } else if change < -0.5 {
        PriceTrend::Downtrend
    } else {
        PriceTrend::Sideways
    };
    Ok(trend)
}

/// Локальные экстремумы: выше (ниже) двух соседей с каждой стороны.
/// Без экстремумов уровни ставятся в 2% от цены.
pub fn price_levels(candles: &[Candle], price: f64) -> PriceLevels {
    let mut resistances = Vec::new();
    let mut supports = Vec::new();

    for window in candles.windows(5) {
        let mid = window[2];
        let others = [window[0], window[1], window[3], window[4]];
        if others.iter().all(|c| mid.high > c.high) {
            resistances.push(mid.high);
        }
        if others.iter().all(|c| mid.low < c.low) {
            supports.push(mid.low);
        }
    }

    let nearest = |levels: &[f64]| {
        levels
            .iter()
            .copied()
            .min_by(|a, b| (a - price).abs().total_cmp(&(b - price).abs()))
    };
    let strength = |levels: &[f64]| {
        levels
            .iter()
            .filter(|l| ((*l - price) / price).abs() < LEVEL_PROXIMITY)
            .count()
    };

    PriceLevels {
        nearest_support: nearest(&supports).unwrap_or(price * 0.98),
        nearest_resistance: nearest(&resistances).unwrap_or(price * 1.02),
        support_strength: strength(&supports),
        resistance_strength: strength(&resistances),
    }
}

/// Паттерны последних трёх свечей, суффикс это номер свечи (0 самая старая).
pub fn candle_patterns(candles: &[Candle]) -> Vec<String> {
    let start = candles.len().saturating_sub(PATTERN_CANDLES);
    let mut patterns = Vec::new();

    for (i, candle) in candles[start..].iter().enumerate() {
        let range = candle.high - candle.low;
        if range <= 0.0 {
            continue;
        }
        let body = (candle.close - candle.open).abs();
        let body_ratio = body / range;
        let upper_shadow = candle.high - candle.open.max(candle.close);
        let lower_shadow = candle.open.min(candle.close) - candle.low;

        if body_ratio < 0.1 {
            patterns.push(format!("DOJI_{}", i));
        }
        if lower_shadow > body * 2.0 && upper_shadow < body * 0.5 {
            patterns.push(format!("HAMMER_{}", i));
        }
        if upper_shadow > body * 2.0 && lower_shadow < body * 0.5 {
            patterns.push(format!("SHOOTING_STAR_{}", i));
        }
        if body_ratio > 0.7 {
            if candle.close > candle.open {
                patterns.push(format!("BIG_GREEN_{}", i));
            } else {
                patterns.push(format!("BIG_RED_{}", i));
            }
        }
    }
    patterns
}

fn momentum(closes: &[f64]) -> Result<Momentum> {
    let momentum_5 = last_value(RateOfChange::new(5).map_err(indicator_error)?, closes);
    let momentum_10 = last_value(RateOfChange::new(10).map_err(indicator_error)?, closes);
    let rate_of_change = last_value(RateOfChange::new(4).map_err(indicator_error)?, closes);

    let direction = if momentum_5 > 0.0 && momentum_10 > 0.0 {
        MomentumDirection::Bullish
    } else if momentum_5 < 0.0 && momentum_10 < 0.0 {
        MomentumDirection::Bearish
    } else {
        MomentumDirection::Mixed
    };

    Ok(Momentum {
        momentum_5,
        momentum_10,
        rate_of_change,
        direction,
    })
}

fn volume_profile(volumes: &[f64]) -> Result<(VolumeTrend, f64, bool)> {
    let (recent, previous) = split_means(volumes, TREND_SPAN)?;
    let change = pct_change(previous, recent);
    let trend = if change > 20.0 {
        VolumeTrend::Increasing
    } else if change < -20.0 {
        VolumeTrend::Decreasing
    } else {
        VolumeTrend::Stable
    };
    let current = volumes[volumes.len() - 1];
    Ok((trend, change, current > recent * 1.5))
}

/// Стандартное отклонение доходностей в процентах и его класс.
fn volatility(closes: &[f64]) -> Result<(RiskLevel, f64)> {
    let returns: Vec<f64> = closes.windows(2).map(|w| pct_change(w[0], w[1])).collect();
    let deviation = last_value(
        StandardDeviation::new(returns.len()).map_err(indicator_error)?,
        &returns,
    );

    let level = if deviation > 3.0 {
        RiskLevel::High
    } else if deviation > 1.0 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };
    Ok((level, deviation))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            time: 0,
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn patterns_classify_candle_shapes() {
        let candles = [
            candle(100.0, 101.0, 99.0, 100.05),
            candle(100.0, 100.12, 95.0, 100.1),
            candle(100.0, 110.0, 99.9, 109.0),
        ];
        let patterns = candle_patterns(&candles);
        assert!(patterns.contains(&"DOJI_0".to_string()));
        assert!(patterns.contains(&"HAMMER_1".to_string()));
        assert!(patterns.contains(&"BIG_GREEN_2".to_string()));
    }

    #[test]
    fn levels_default_without_extremes() {
        let candles: Vec<Candle> = (0..10)
            .map(|i| {
                let p = 100.0 + i as f64;
                candle(p, p + 0.5, p - 0.5, p)
            })
            .collect();
        let levels = price_levels(&candles, 110.0);
        assert_eq!(levels.nearest_support, 110.0 * 0.98);
        assert_eq!(levels.nearest_resistance, 110.0 * 1.02);
        assert_eq!(levels.support_strength, 0);
    }

    #[test]
    fn levels_pick_local_peak() {
        let highs = [10.0, 11.0, 15.0, 11.0, 10.0, 10.5];
        let candles: Vec<Candle> = highs.iter().map(|h| candle(9.5, *h, 9.0, 9.6)).collect();
        let levels = price_levels(&candles, 12.0);
        assert_eq!(levels.nearest_resistance, 15.0);
        assert_eq!(levels.resistance_strength, 0);
    }
}
