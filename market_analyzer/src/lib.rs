use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod config;
pub mod errors;
pub mod holders;
pub mod models;
pub mod notifications;
pub mod routers;
pub mod services;

pub use config::{load_config, AppConfig};
pub use errors::{AnalyzerError, Result};
pub use holders::AnalysisGate;
pub use models::{AnalysisMode, AnalysisReport, MarketPhase, SignalLabel, TradeSignal};
pub use notifications::TelegramNotifier;
pub use services::{MarketAnalyzer, SignalDispatcher, SignalPublisher, SubmitOutcome, WorkerPool};

#[derive(Clone)]
pub struct AppState {
    pub analyzer: Arc<MarketAnalyzer>,
    pub dispatcher: SignalDispatcher,
    pub notifier: Option<TelegramNotifier>,
    pub publisher: SignalPublisher,
    pub config: Arc<AppConfig>,
    pub started_at: Instant,
}

impl AppState {
    /// Собирает сервисы и запускает обработчики сигналов.
    /// Нужен работающий tokio runtime.
    pub fn build(config: AppConfig) -> Result<(AppState, WorkerPool)> {
        let config = Arc::new(config);
        let analyzer = Arc::new(MarketAnalyzer::new(&config));
        let notifier = TelegramNotifier::from_config(&config.telegram)?;
        let publisher = SignalPublisher::new(config.webhook.clone());
        let gate = AnalysisGate::new(Duration::from_secs(config.ai.min_analysis_gap_secs));

        let (dispatcher, workers) = SignalDispatcher::start(
            analyzer.clone(),
            notifier.clone(),
            publisher.clone(),
            gate,
            &config.dispatcher,
        );

        let state = AppState {
            analyzer,
            dispatcher,
            notifier,
            publisher,
            config,
            started_at: Instant::now(),
        };
        Ok((state, workers))
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
