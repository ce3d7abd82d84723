use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cleanbook_core::{CollaboratorLevel, PaymentAction, PaymentStage};
use cleanbook_settlement::SettlementConfig;
use cleanbook_storage::PgStore;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "cleanbook-cli")]
#[command(about = "Cleaning service booking settlement")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve,
    /// Apply database migrations (needs DATABASE_URL).
    Migrate,
    /// Show what a client can do for each payment stage of a service.
    Actions { service_id: Uuid },
    /// Print a collaborator's payout statement.
    Payouts { collaborator_id: Uuid },
    /// Print the effective payout table.
    Rates,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SettlementConfig::from_env();

    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from_str(&config.log_level).unwrap_or(LevelFilter::INFO))
        .init();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            cleanbook_web::serve(&config).await?;
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgStore::connect(url).await.context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
        Commands::Actions { service_id } => {
            let orchestrator = cleanbook_settlement::orchestrator_from_config(&config).await?;
            let view = orchestrator.payment_view(service_id).await?;
            println!(
                "service {} status={} payment={} price={}",
                view.service_id, view.status, view.payment_status, view.display_price
            );
            for stage in [PaymentStage::Signal, PaymentStage::Final] {
                let stage_view = view.stage(stage);
                let action = match &stage_view.action {
                    PaymentAction::Redirect { url } => format!("REDIRECT {url}"),
                    PaymentAction::CollectProof => "COLLECT_PROOF".to_string(),
                    PaymentAction::Blocked => "BLOCKED".to_string(),
                };
                println!(
                    "  {:<6} amount={} action={action} progress={:?}",
                    stage.as_str(),
                    stage_view.display_amount,
                    stage_view.progress
                );
            }
        }
        Commands::Payouts { collaborator_id } => {
            let orchestrator = cleanbook_settlement::orchestrator_from_config(&config).await?;
            let statement = orchestrator.payout_statement_markdown(collaborator_id).await?;
            print!("{statement}");
        }
        Commands::Rates => {
            let orchestrator = cleanbook_settlement::orchestrator_from_config(&config).await?;
            let rates = orchestrator.rate_table().await?;
            println!("{:<7} {:>8} {:>8} {:>8}", "level", "<=4h", "<=6h", ">6h");
            for level in [
                CollaboratorLevel::Junior,
                CollaboratorLevel::Senior,
                CollaboratorLevel::Master,
            ] {
                let row = rates.row(level);
                println!(
                    "{:<7} {:>8} {:>8} {:>8}",
                    level.as_str(),
                    cleanbook_core::format_amount(row.hours4),
                    cleanbook_core::format_amount(row.hours6),
                    cleanbook_core::format_amount(row.hours8)
                );
            }
        }
    }

    Ok(())
}
