//! Vault Service entry point.

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use vault_service::config::VaultConfig;
use vault_service::services::{init_metrics, VaultStore};
use vault_service::startup::{self, Application};

use service_core::observability::init_tracing;

#[derive(Debug, Parser)]
#[command(name = "vault-service", version, about = "Consent registry service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API (default).
    Serve,
    /// Run one payment reconciliation pass and print its summary.
    ProcessPayments {
        /// Billing period as YYYY-MM; defaults to the current month.
        #[arg(long, env = "PAYMENT_PERIOD")]
        period: Option<String>,
    },
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match VaultConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );
    init_metrics();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        service_name = %config.service_name,
        http_port = %config.common.port,
        db_max_connections = %config.database.max_connections,
        db_min_connections = %config.database.min_connections,
        directory_service_url = %config.directory_service.url,
        balance_service_url = %config.balance_service.url,
        invoice_service_url = %config.invoice_service.url,
        "Configuration loaded"
    );

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::ProcessPayments { period } => process_payments(config, period).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "vault-service exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: VaultConfig) -> anyhow::Result<ExitCode> {
    let app = Application::build(config).await?;

    tokio::select! {
        result = app.run_until_stopped() => {
            result?;
        }
        _ = shutdown_signal() => {
            tracing::info!("Graceful shutdown initiated");
        }
    }

    tracing::info!("Service shutdown complete");
    Ok(ExitCode::SUCCESS)
}

/// One reconciliation pass. Fails when the run cannot start, or when every
/// billable organization failed.
async fn process_payments(config: VaultConfig, period: Option<String>) -> anyhow::Result<ExitCode> {
    let db = startup::connect(&config, true).await?;
    let store: Arc<dyn VaultStore> = Arc::new(db);
    let payments = startup::payment_service(&config, store)?;

    let report = payments.process_payments(period.as_deref()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    let failed = report.failed();
    if failed > 0 && report.succeeded() == 0 {
        tracing::error!(failed, "Every billable organization failed");
        return Ok(ExitCode::FAILURE);
    }
    if report.error.is_some() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
