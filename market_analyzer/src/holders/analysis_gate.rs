use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Минимальный интервал между фоновыми анализами одной стратегии.
#[derive(Clone)]
pub struct AnalysisGate {
    last_run: Arc<Mutex<HashMap<String, Instant>>>,
    min_gap: Duration,
}

impl AnalysisGate {
    pub fn new(min_gap: Duration) -> Self {
        AnalysisGate {
            last_run: Arc::new(Mutex::new(HashMap::new())),
            min_gap,
        }
    }

    /// Проверка и отметка под одной блокировкой: два одновременных
    /// сигнала одной стратегии не пройдут оба.
    pub async fn try_acquire(&self, key: &str) -> bool {
        let mut last_run = self.last_run.lock().await;
        let now = Instant::now();

        // Просроченные отметки ничего не ограничивают
        let min_gap = self.min_gap;
        last_run.retain(|_, previous| now.duration_since(*previous) < min_gap);

        if let Some(previous) = last_run.get(key) {
            if now.duration_since(*previous) < self.min_gap {
                return false;
            }
        }

        last_run.insert(key.to_string(), now);
        true
    }

    /// Сколько ещё ждать до следующего разрешённого запуска.
    pub async fn remaining(&self, key: &str) -> Duration {
        let last_run = self.last_run.lock().await;
        match last_run.get(key) {
            Some(previous) => self.min_gap.saturating_sub(previous.elapsed()),
            None => Duration::ZERO,
        }
    }

    pub async fn len(&self) -> usize {
        let last_run = self.last_run.lock().await;
        last_run.len()
    }
}
