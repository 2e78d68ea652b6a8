use std::net::SocketAddr;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use market_analyzer::notifications::{formatter, CommandListener};
use market_analyzer::routers::create_routes;
use market_analyzer::{load_config, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Логи в консоль и в ежедневный файл
    let file_appender = tracing_appender::rolling::daily("logs", "market_analyzer.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("market_analyzer=info,warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true))
        .with(tracing_subscriber::fmt::layer()
            .json()
            .with_writer(file_writer)
            .with_ansi(false))
        .init();

    let config = load_config()?;
    config.log_summary();
    let addr: SocketAddr = config.server_addr.parse()?;

    let (state, workers) = AppState::build(config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = state.notifier.clone().map(|notifier| {
        let listener = CommandListener::new(
            notifier,
            state.analyzer.clone(),
            state.config.clone(),
            state.started_at,
        );
        tokio::spawn(listener.run(shutdown_rx.clone()))
    });

    if let Some(notifier) = &state.notifier {
        notifier
            .notify(&formatter::format_status(&state.config, state.uptime()))
            .await;
    }

    let app = create_routes(state);
    tracing::info!("Сервер запущен на http://{}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Не удалось дождаться сигнала остановки: {}", e);
            }
            tracing::info!("Получен сигнал остановки");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    workers.shutdown().await?;
    if let Some(handle) = listener {
        handle.await?;
    }

    tracing::info!("Сервер остановлен");
    Ok(())
}
