use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::DispatcherConfig;
use crate::errors::{AnalyzerError, Result};
use crate::holders::AnalysisGate;
use crate::models::TradeSignal;
use crate::notifications::formatter;
use crate::notifications::TelegramNotifier;
use crate::services::collector::exchange_interval;
use crate::services::pipeline::MarketAnalyzer;
use crate::services::publisher::SignalPublisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    RateLimited { retry_in: Duration },
    QueueFull,
}

/// Проверка сигнала до постановки в очередь.
pub fn validate_signal(signal: &TradeSignal) -> Result<()> {
    if signal.strategy.trim().is_empty() {
        return Err(AnalyzerError::InvalidInput("strategy cannot be empty".to_string()));
    }
    if signal.symbol.trim().is_empty() {
        return Err(AnalyzerError::InvalidInput("symbol cannot be empty".to_string()));
    }
    if exchange_interval(&signal.timeframe).is_none() {
        return Err(AnalyzerError::InvalidInput(format!(
            "unsupported timeframe '{}'",
            signal.timeframe
        )));
    }
    if !signal.price.is_finite() || signal.price <= 0.0 {
        return Err(AnalyzerError::InvalidInput(format!(
            "price must be positive, got {}",
            signal.price
        )));
    }
    Ok(())
}

/// Очередь фонового анализа сигналов стратегий.
#[derive(Clone)]
pub struct SignalDispatcher {
    sender: mpsc::Sender<TradeSignal>,
    gate: AnalysisGate,
    analyzer: Arc<MarketAnalyzer>,
}

/// Рабочие задачи, которые разбирают очередь.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl SignalDispatcher {
    pub fn start(
        analyzer: Arc<MarketAnalyzer>,
        notifier: Option<TelegramNotifier>,
        publisher: SignalPublisher,
        gate: AnalysisGate,
        config: &DispatcherConfig,
    ) -> (Self, WorkerPool) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = (0..config.worker_count.max(1))
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    receiver.clone(),
                    analyzer.clone(),
                    notifier.clone(),
                    publisher.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        tracing::info!(
            "Запущено {} обработчиков сигналов, очередь {}",
            config.worker_count,
            config.queue_capacity
        );

        (
            SignalDispatcher {
                sender,
                gate,
                analyzer,
            },
            WorkerPool {
                shutdown_tx,
                handles,
            },
        )
    }

    pub fn gate(&self) -> &AnalysisGate {
        &self.gate
    }

    /// Место в очереди резервируется до отметки в лимитере, поэтому
    /// отказ по переполнению не сжигает интервал стратегии.
    pub async fn submit(&self, signal: TradeSignal) -> Result<SubmitOutcome> {
        validate_signal(&signal)?;
        // Лимитер хранит отметки только известных стратегий
        if !self.analyzer.knows_strategy(&signal.strategy) {
            return Err(AnalyzerError::InvalidInput(format!(
                "unknown strategy '{}'",
                signal.strategy
            )));
        }

        let permit = match self.sender.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                tracing::warn!("Очередь сигналов заполнена, сигнал {} отклонён", signal.strategy);
                return Ok(SubmitOutcome::QueueFull);
            }
            Err(TrySendError::Closed(())) => {
                return Err(AnalyzerError::ServiceUnavailable(
                    "signal queue is closed".to_string(),
                ));
            }
        };

        if !self.gate.try_acquire(&signal.strategy).await {
            let retry_in = self.gate.remaining(&signal.strategy).await;
            tracing::info!(
                "Сигнал {} пропущен: следующий анализ через {} с",
                signal.strategy,
                retry_in.as_secs()
            );
            return Ok(SubmitOutcome::RateLimited { retry_in });
        }

        tracing::info!(
            "Сигнал {} {} {} поставлен в очередь",
            signal.strategy,
            signal.signal_type.as_str(),
            signal.symbol
        );
        permit.send(signal);
        Ok(SubmitOutcome::Queued)
    }
}

impl WorkerPool {
    /// Текущие задачи дорабатывают, очередь дальше не разбирается.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Остановка обработчиков сигналов");
        let _ = self.shutdown_tx.send(true);

        for result in join_all(self.handles).await {
            result?;
        }
        Ok(())
    }
}

async fn worker_loop(
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<TradeSignal>>>,
    analyzer: Arc<MarketAnalyzer>,
    notifier: Option<TelegramNotifier>,
    publisher: SignalPublisher,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!("Обработчик {} запущен", id);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.changed() => None,
                signal = receiver.recv() => signal,
            }
        };

        let Some(signal) = next else {
            break;
        };
        process_signal(&analyzer, notifier.as_ref(), &publisher, &signal).await;
    }

    tracing::debug!("Обработчик {} остановлен", id);
}

async fn process_signal(
    analyzer: &MarketAnalyzer,
    notifier: Option<&TelegramNotifier>,
    publisher: &SignalPublisher,
    signal: &TradeSignal,
) {
    tracing::info!("Анализ сигнала {} по {}", signal.strategy, signal.symbol);

    let message = match analyzer.analyze_signal(signal).await {
        Ok(report) => {
            let indicators = report
                .strategy_signal
                .as_ref()
                .map(|s| s.indicators.clone())
                .unwrap_or_default();
            publisher
                .publish_signal(signal, Some(&report.analysis), indicators)
                .await;
            formatter::format_signal_report(&report)
        }
        Err(e) => {
            tracing::error!("Анализ сигнала {} не удался: {}", signal.strategy, e);
            publisher.publish_signal(signal, None, Default::default()).await;
            formatter::format_error_alert(&signal.strategy, &e)
        }
    };

    match notifier {
        Some(notifier) => {
            notifier.notify(&message).await;
        }
        None => tracing::debug!("Уведомления отключены, отчёт по {} не отправлен", signal.strategy),
    }
}
