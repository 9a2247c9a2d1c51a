use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use consultbook_booking::{
    collaborators::{LoggingNotifier, NoMeetingLinks},
    config::BookingConfig,
    gateways::RazorpayGateway,
    jobs::run_maintenance_once,
    AppState,
};
use consultbook_common::DatabaseConfig;
use consultbook_database::{close_pool, create_pool, DbPool, MigrationRunner, PgBookingStore};

#[derive(Parser)]
#[command(name = "db-cli")]
#[command(about = "Consultbook database and maintenance tool")]
struct Cli {
    /// Database host override
    #[arg(long, global = true)]
    host: Option<String>,
    /// Database name override
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Check migration status
    Status,
    /// Seed a demo consultant with a Monday morning window
    Seed,
    /// Run one reservation sweep and session progression pass
    Sweep {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = DatabaseConfig::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(database) = cli.database {
        config.database = database;
    }

    let pool = create_pool(&config).await.context("cannot connect to the database")?;
    let result = run(cli.command, &pool, config).await;
    close_pool(&pool).await;
    result
}

async fn run(command: Commands, pool: &DbPool, database: DatabaseConfig) -> anyhow::Result<()> {
    let runner = MigrationRunner::new(pool.clone());

    match command {
        Commands::Migrate => {
            runner.run_all_migrations().await?;
            println!("Migrations completed successfully");
        }
        Commands::Status => {
            let status = runner.check_migration_status().await?;
            println!("{}", status);
            if status.is_up_to_date {
                println!("Database is up to date");
            } else {
                println!("Database needs migration");
            }
        }
        Commands::Seed => {
            let consultant_id = runner.seed_demo_data().await?;
            println!("Demo consultant: {}", consultant_id);
        }
        Commands::Sweep { json } => {
            let mut config = BookingConfig::from_env().context("invalid booking configuration")?;
            config.database = database;

            let state = AppState::new(
                config.clone(),
                Arc::new(PgBookingStore::new(pool.clone())),
                Arc::new(RazorpayGateway::new(config.razorpay.clone())),
                Arc::new(NoMeetingLinks),
                Arc::new(LoggingNotifier),
            );
            let report = run_maintenance_once(&state.reservations, &state.sessions, chrono::Utc::now()).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let sweep = &report.sweep;
                println!(
                    "Swept {} expired reservations: {} abandoned, {} cancelled, {} confirmed, {} deferred, {} errors",
                    sweep.examined, sweep.abandoned, sweep.cancelled, sweep.confirmed, sweep.deferred, sweep.errors
                );
                let progress = &report.progress;
                println!(
                    "Sessions: {} started, {} completed, {} meeting links created, {} errors",
                    progress.started, progress.completed, progress.meeting_links, progress.errors
                );
            }
        }
    }

    Ok(())
}
