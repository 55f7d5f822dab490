use anyhow::{Context, Result};
use forecast_service::{api, bootstrap, config::ServiceConfig, orchestrator::spawn_scheduler};
use kubecast_core::{clear_ready, init_tracing, load_config, mark_ready, start_health_server};
use std::process::ExitCode;
use tracing::{error, info};

const SERVICE: &str = "forecast-service";

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, "forecast-service failed");
            eprintln!("{SERVICE}: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    init_tracing(SERVICE)?;
    let cfg: ServiceConfig = load_config(SERVICE)?;
    info!(?cfg, "config loaded");

    start_health_server(cfg.health_port).await?;
    let service = bootstrap(&cfg).await?;
    info!(updated = service.initial_report.updated.len(), "initial retrain done");
    mark_ready();

    let scheduler = spawn_scheduler(service.retrainer.clone(), cfg.retrain_interval());
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    info!(addr = %cfg.listen_addr, "serving predictions");
    axum::serve(listener, api::router(service.state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown");
        })
        .await?;

    clear_ready();
    scheduler.abort();
    Ok(())
}
