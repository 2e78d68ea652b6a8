//! HTML сообщения для Telegram (`parse_mode = HTML`).
//!
//! Весь текст извне (имена стратегий, ответы модели, тексты ошибок)
//! проходит через [`escape_html`].

use std::fmt::Write as _;
use std::time::Duration;

use crate::config::AppConfig;
use crate::errors::AnalyzerError;
use crate::models::{
    AnalysisReport, MarketPhase, Recommendation, RiskLevel, SignalLabel, SignalReport, SignalType,
    TradeStatus, TradeUpdate,
};

const MAX_INSIGHTS: usize = 3;
const MAX_RECOMMENDATIONS: usize = 2;
const MAX_INDICATORS: usize = 4;

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn phase_emoji(phase: MarketPhase) -> &'static str {
    match phase {
        MarketPhase::Bullish => "🐂",
        MarketPhase::Bearish => "🐻",
        MarketPhase::Neutral => "↔️",
        MarketPhase::Volatile => "⚡",
    }
}

fn risk_emoji(risk: RiskLevel) -> &'static str {
    match risk {
        RiskLevel::Low => "🟢",
        RiskLevel::Medium => "🟡",
        RiskLevel::High => "🔴",
    }
}

fn signal_emoji(label: SignalLabel) -> &'static str {
    match label {
        SignalLabel::StrongBuy => "🚀",
        SignalLabel::Buy => "🟢",
        SignalLabel::Hold => "⏳",
        SignalLabel::Neutral => "⚪",
        SignalLabel::Sell => "🔴",
        SignalLabel::StrongSell => "📉",
    }
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    if hours > 0 {
        format!("{}ч {}м", hours, minutes)
    } else {
        format!("{}м", minutes)
    }
}

fn write_analysis_body(message: &mut String, report: &AnalysisReport) {
    let analysis = &report.analysis;

    let _ = writeln!(
        message,
        "{} Фаза по стратегиям: <b>{}</b>",
        phase_emoji(report.overall_phase),
        report.overall_phase
    );
    let _ = writeln!(
        message,
        "🧠 Оценка ИИ: <b>{}</b> ({}%)",
        analysis.market_phase, analysis.confidence_percent
    );
    let _ = writeln!(
        message,
        "{} Риск: <b>{}</b>",
        risk_emoji(analysis.risk_level),
        analysis.risk_level.as_str()
    );
    if report.degraded {
        message.push_str("⚠️ <i>Упрощённый анализ, данные или ИИ недоступны</i>\n");
    }
    message.push('\n');

    message.push_str("📊 <b>СТРАТЕГИИ</b>\n");
    for signal in &report.signals {
        let _ = writeln!(
            message,
            "{} <code>{}</code> ({}): <b>{}</b> {}%",
            signal_emoji(signal.signal_label),
            escape_html(&signal.strategy_name),
            escape_html(&signal.timeframe_label),
            signal.signal_label,
            signal.confidence_percent
        );
    }
    message.push('\n');

    if !analysis.key_insights.is_empty() {
        message.push_str("💡 <b>КЛЮЧЕВЫЕ МОМЕНТЫ</b>\n");
        for insight in analysis.key_insights.iter().take(MAX_INSIGHTS) {
            let _ = writeln!(message, "  • {}", escape_html(insight));
        }
        message.push('\n');
    }

    if !analysis.recommendations.is_empty() {
        message.push_str("🎯 <b>РЕКОМЕНДАЦИИ</b>\n");
        for recommendation in analysis.recommendations.iter().take(MAX_RECOMMENDATIONS) {
            let _ = writeln!(message, "  • {}", escape_html(recommendation));
        }
        message.push('\n');
    }

    message.push_str("📝 <b>ЗАКЛЮЧЕНИЕ</b>\n");
    let _ = writeln!(message, "<i>{}</i>", escape_html(&analysis.summary));
}

pub fn format_market_report(report: &AnalysisReport) -> String {
    let mut message = String::new();
    let snapshot = &report.snapshot;

    let _ = writeln!(
        message,
        "📈 <b>АНАЛИЗ РЫНКА {}</b> ({})\n",
        escape_html(&report.symbol),
        escape_html(&report.timeframe)
    );
    let _ = writeln!(message, "💰 Цена: <b>${:.2}</b>", snapshot.last_price);
    let _ = writeln!(
        message,
        "📊 Изменение: <b>{:+.2}%</b>",
        snapshot.pct_change_over_window
    );
    let _ = writeln!(message, "📦 Объем: {:.0}", snapshot.rolling_volume_sum);
    if snapshot.synthetic {
        message.push_str("🧪 <i>Синтетические данные</i>\n");
    }
    message.push('\n');

    write_analysis_body(&mut message, report);

    let _ = write!(
        message,
        "\n⏰ {} UTC",
        report.generated_at.format("%Y-%m-%d %H:%M:%S")
    );
    message
}

fn recommendation_emoji(recommendation: Recommendation) -> &'static str {
    match recommendation {
        Recommendation::Buy => "🟢",
        Recommendation::Sell => "🔴",
        Recommendation::Hold => "⏳",
        Recommendation::Avoid => "⛔",
    }
}

pub fn format_signal_report(report: &SignalReport) -> String {
    let signal = &report.signal;
    let analysis = &report.analysis;
    let mut message = String::from("🤖 <b>ИИ АНАЛИЗ СИГНАЛА</b>\n\n");

    let type_emoji = match signal.signal_type {
        SignalType::Long => "🟢",
        SignalType::Short => "🔴",
        SignalType::Exit => "🟡",
    };
    let _ = writeln!(
        message,
        "{} <b>{}</b> • {} ({})",
        type_emoji,
        signal.signal_type.as_str(),
        escape_html(&signal.symbol),
        escape_html(&signal.timeframe)
    );
    let _ = writeln!(message, "🎯 Стратегия: <code>{}</code>", escape_html(&signal.strategy));
    let _ = writeln!(message, "💰 Цена: <b>${:.2}</b>", signal.price);
    if !signal.reason.trim().is_empty() {
        let _ = writeln!(message, "📌 Причина: {}", escape_html(&signal.reason));
    }
    let _ = writeln!(message, "⏰ Время: {}\n", signal.timestamp.format("%H:%M:%S"));

    let _ = writeln!(
        message,
        "{} Рекомендация: <b>{}</b> ({}%)",
        recommendation_emoji(analysis.recommendation),
        analysis.recommendation,
        analysis.confidence_percent
    );
    let _ = writeln!(
        message,
        "{} Риск: <b>{}</b>",
        risk_emoji(analysis.risk_level),
        analysis.risk_level.as_str()
    );
    if report.degraded {
        message.push_str("⚠️ <i>Упрощённый анализ, данные или ИИ недоступны</i>\n");
    }
    message.push('\n');

    if let Some(context) = &report.context.candles {
        message.push_str("📈 <b>РЫНОК</b>\n");
        let _ = writeln!(
            message,
            "Тренд: <b>{}</b>, моментум {}",
            context.price_trend.as_str(),
            context.momentum.direction.as_str()
        );
        let _ = writeln!(
            message,
            "Поддержка <code>${:.2}</code> • сопротивление <code>${:.2}</code>",
            context.levels.nearest_support,
            context.levels.nearest_resistance
        );
        let _ = writeln!(
            message,
            "Волатильность {} ({:.2}%), объём {}\n",
            context.volatility.as_str(),
            context.volatility_pct,
            context.volume_trend.as_str()
        );
    }

    let factors = &analysis.key_factors;
    if !factors.bullish.is_empty() || !factors.bearish.is_empty() {
        message.push_str("💡 <b>КЛЮЧЕВЫЕ ФАКТОРЫ</b>\n");
        for factor in factors.bullish.iter().take(MAX_INSIGHTS) {
            let _ = writeln!(message, "  🐂 {}", escape_html(factor));
        }
        for factor in factors.bearish.iter().take(MAX_INSIGHTS) {
            let _ = writeln!(message, "  🐻 {}", escape_html(factor));
        }
        message.push('\n');
    }

    if !analysis.risk_warnings.is_empty() {
        message.push_str("⚠️ <b>РИСКИ</b>\n");
        for warning in analysis.risk_warnings.iter().take(MAX_RECOMMENDATIONS) {
            let _ = writeln!(message, "  • {}", escape_html(warning));
        }
        message.push('\n');
    }

    let zones = &analysis.target_zones;
    if !zones.is_empty() {
        message.push_str("🎯 <b>ЦЕЛЕВЫЕ ЗОНЫ</b>\n");
        let rows = [
            ("Вход", &zones.entry_optimal),
            ("Стоп", &zones.stop_loss),
            ("TP1", &zones.take_profit_1),
            ("TP2", &zones.take_profit_2),
        ];
        for (label, value) in rows {
            if let Some(value) = value {
                let _ = writeln!(message, "  {}: <code>{}</code>", label, escape_html(value));
            }
        }
        message.push('\n');
    }

    message.push_str("📝 <b>ЗАКЛЮЧЕНИЕ</b>\n");
    let _ = writeln!(message, "<i>{}</i>", escape_html(&analysis.summary));

    if let Some(own) = &report.strategy_signal {
        if !own.indicators.is_empty() {
            let _ = writeln!(
                message,
                "\n📊 <b>ИНДИКАТОРЫ</b> ({} {}%)",
                own.signal_label, own.confidence_percent
            );
            for (name, value) in own.indicators.iter().take(MAX_INDICATORS) {
                let _ = write!(
                    message,
                    "{}: <code>{:.2}</code> ",
                    escape_html(&name.to_uppercase()),
                    value
                );
            }
            message.push('\n');
        }
    }

    message
}

pub fn format_trade_update(update: &TradeUpdate) -> String {
    let (status_emoji, status) = match update.status {
        TradeStatus::Opened => ("🎯", "OPENED"),
        TradeStatus::Closed => ("🏁", "CLOSED"),
        TradeStatus::Stopped => ("🛑", "STOPPED"),
    };

    let mut message = format!("{} <b>ОБНОВЛЕНИЕ СДЕЛКИ</b>\n\n", status_emoji);
    let _ = writeln!(message, "📈 {}", escape_html(&update.symbol));
    let _ = writeln!(message, "🎯 Стратегия: <code>{}</code>", escape_html(&update.strategy));
    let _ = writeln!(message, "📊 Статус: <b>{}</b>", status);

    if update.pnl != 0.0 {
        let pnl_emoji = if update.pnl > 0.0 { "💰" } else { "💸" };
        let _ = writeln!(message, "{} P&amp;L: <b>${:.2}</b>", pnl_emoji, update.pnl);
    }
    if let Some(entry) = update.entry_price {
        let _ = writeln!(message, "📍 Вход: <code>${:.2}</code>", entry);
    }
    if let Some(exit) = update.exit_price {
        let _ = writeln!(message, "🚪 Выход: <code>${:.2}</code>", exit);
    }
    if let Some(duration) = update.duration_secs.filter(|d| *d > 0) {
        let _ = writeln!(message, "⏱ Длительность: {}", format_duration(duration));
    }

    message
}

/// Уведомление об ошибке. Категория называется явно.
pub fn format_error_alert(component: &str, error: &AnalyzerError) -> String {
    let mut message = String::from("❌ <b>СИСТЕМНОЕ УВЕДОМЛЕНИЕ</b>\n\n");
    let _ = writeln!(message, "🔧 Компонент: <code>{}</code>", escape_html(component));
    let _ = writeln!(message, "📋 Тип: <code>{}</code>", error.category());
    let _ = writeln!(message, "📝 Описание:\n<i>{}</i>", escape_html(&error.detail()));

    message.push_str("\n🔧 <b>ТРЕБУЕТСЯ ВНИМАНИЕ</b>\n");
    message.push_str("• Проверьте логи системы\n");
    match error {
        AnalyzerError::DataUnavailable(_) | AnalyzerError::HttpError(_) => {
            message.push_str("• Убедитесь в стабильности соединения с биржей\n");
        }
        AnalyzerError::AnalysisFailed(_) => {
            message.push_str("• Проверьте API ключ и доступность сервиса ИИ\n");
        }
        _ => {}
    }
    message
}

pub fn format_status(config: &AppConfig, uptime: Duration) -> String {
    let on_off = |enabled: bool| if enabled { "✅ Включен" } else { "❌ Отключен" };

    let mut message = String::from("🤖 <b>СТАТУС СИСТЕМЫ</b>\n\n");
    let _ = writeln!(message, "⚙️ Режим анализа: <b>{}</b>", config.analysis_mode.as_str());
    let _ = writeln!(message, "🧠 ИИ анализ: {}", on_off(config.ai_analysis_enabled()));
    let _ = writeln!(message, "📨 Уведомления: {}", on_off(config.telegram_enabled()));
    let _ = writeln!(message, "⏰ Время работы: {}", format_duration(uptime.as_secs()));
    let _ = writeln!(
        message,
        "📈 Рынок: <code>{}</code> {}",
        escape_html(&config.market.symbol),
        escape_html(&config.market.timeframe)
    );

    message.push_str("\n📊 <b>СТРАТЕГИИ</b>\n");
    for profile in &config.strategies {
        let _ = writeln!(
            message,
            "🟢 <b>{}</b> ({})",
            escape_html(&profile.name),
            escape_html(&profile.timeframe)
        );
    }
    message
}

pub fn format_help() -> String {
    "🤖 <b>Команды бота</b>\n\n\
     /status - Статус системы\n\
     /analyze [SYMBOL] [TIMEFRAME] - Анализ рынка, например <code>/analyze BTCUSDT 15m</code>\n\
     /help - Это сообщение\n\n\
     Сигналы стратегий анализируются автоматически и приходят в этот чат."
        .to_string()
}

pub fn format_welcome() -> String {
    format!(
        "👋 <b>Анализатор рынка запущен</b>\n\n\
         Бот присылает ИИ анализ торговых сигналов и обзор рынка.\n\n{}",
        format_help()
    )
}
