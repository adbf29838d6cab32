//! Spot Trader CLI
//!
//! Operate the trading engine from the command line.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use spot_trader::api::{create_app, AppState};
use spot_trader::types::OperationType;
use spot_trader::Config;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "spot-trader")]
#[command(about = "Capital-bounded spot trading automation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the automation loops and the HTTP API
    Serve {
        /// Override the configured API port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a single automation cycle now
    Evaluate,

    /// Show recent execution records
    History {
        /// Maximum number of records to show
        #[arg(short, long, default_value = "20")]
        limit: u32,

        /// Only show BUY, SELL or DAILY_BUY records
        #[arg(short = 't', long)]
        operation_type: Option<String>,
    },

    /// Show recent trading operations
    Operations {
        /// Maximum number of operations to show
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Manage exchange credentials
    Credentials {
        #[command(subcommand)]
        action: CredentialCommands,
    },
}

#[derive(Subcommand)]
enum CredentialCommands {
    /// Validate and store a key pair, making it active
    Set {
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        api_secret: String,
        /// PRODUCTION or TESTNET
        #[arg(short, long, default_value = "PRODUCTION")]
        environment: String,
    },
    /// Switch to the stored key pair of another environment
    Activate { environment: String },
    /// Re-check the active key pair against the exchange
    Revalidate,
    /// Show the active environment and masked key
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    // Load configuration
    let config = Config::from_env()?;

    match cli.command {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Evaluate => evaluate(config).await?,
        Commands::History { limit, operation_type } => show_history(config, limit, operation_type).await?,
        Commands::Operations { limit } => show_operations(config, limit).await?,
        Commands::Credentials { action } => manage_credentials(config, action).await?,
    }

    Ok(())
}

async fn serve(mut config: Config, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.api_port = port;
    }
    config.log_summary();

    let state = AppState::new(config.clone()).await?;
    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let handles = state.start_background_tasks(&shutdown_tx).await;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Server listening on http://{}", addr);

    let signal_tx = shutdown_tx.clone();
    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Could not listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            let _ = signal_tx.send(());
        })
        .await?;

    let _ = shutdown_tx.send(());
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

async fn evaluate(config: Config) -> Result<()> {
    let state = AppState::new(config).await?;
    state.credentials.initialize().await;
    if !state.credentials.has_valid_credentials().await {
        bail!("exchange credentials are missing or not validated; run `spot-trader credentials set` first");
    }

    println!("\n{}", "=".repeat(70));
    println!("  AUTOMATION CYCLE - {}", state.config.trade_symbol);
    println!("{}\n", "=".repeat(70));

    let outcome = state.automation.clone().run_manual().await?;
    match outcome.current_price {
        Some(price) => println!("  Current price:     {}", price),
        None => println!("  Current price:     unavailable"),
    }
    println!(
        "  Scheduled slot:    {}",
        outcome
            .scheduled_operation_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    println!("  Positions closed:  {}", outcome.closed_operations);
    println!("  Quantity sold:     {}", outcome.quantity_sold);
    println!("  Value sold:        {}", outcome.value_sold);
    if let Some(error) = &outcome.error {
        println!("  Error:             {}", error);
    }
    println!();
    Ok(())
}

async fn show_history(config: Config, limit: u32, operation_type: Option<String>) -> Result<()> {
    let operation_type = operation_type.map(|t| t.parse::<OperationType>()).transpose()?;
    let state = AppState::new(config).await?;
    let records = state.schedule.list_recent(limit, operation_type).await?;

    println!("\n{}", "=".repeat(70));
    println!("  EXECUTION HISTORY ({} records)", records.len());
    println!("{}\n", "=".repeat(70));

    for record in &records {
        let status = if record.success { "OK  " } else { "FAIL" };
        println!(
            "  [{}] {} {:<9} {} qty {} @ {} = {}",
            status,
            record.executed_at.format("%Y-%m-%d %H:%M:%S"),
            record.operation_type.as_str(),
            record.symbol,
            record.quantity,
            record.unit_price,
            record.total_value
        );
        if let Some(message) = &record.error_message {
            println!("         {}", message);
        }
    }
    Ok(())
}

async fn show_operations(config: Config, limit: u32) -> Result<()> {
    let state = AppState::new(config).await?;
    let operations = state.ledger.list_operations(limit).await?;
    let open_total = state.ledger.open_allocation_total().await?;
    let threshold = state.settings.current().await.capital_threshold;

    println!("\n{}", "=".repeat(70));
    println!("  TRADING OPERATIONS | Open allocation {} / {}", open_total, threshold);
    println!("{}\n", "=".repeat(70));

    for op in &operations {
        let sold = match (op.sell_price, op.sold_at) {
            (Some(price), Some(at)) => format!("sold @ {} on {}", price, at.format("%Y-%m-%d %H:%M")),
            _ => format!("target {}", op.target_price()),
        };
        println!(
            "  #{:<5} {} {} {} @ {} ({})",
            op.id,
            op.status.as_str(),
            op.quantity,
            op.symbol,
            op.purchase_price,
            sold
        );
    }
    Ok(())
}

async fn manage_credentials(config: Config, action: CredentialCommands) -> Result<()> {
    let state = AppState::new(config).await?;
    let credentials = state.credentials.clone();

    match action {
        CredentialCommands::Set {
            api_key,
            api_secret,
            environment,
        } => {
            let record = credentials.validate_and_persist(&api_key, &api_secret, &environment).await?;
            println!("Credentials validated and active for {}", record.environment);
        }
        CredentialCommands::Activate { environment } => {
            let record = credentials.activate_environment(&environment).await?;
            println!("Switched to {} ({})", record.environment, record.api_base_url);
        }
        CredentialCommands::Revalidate => {
            credentials.initialize().await;
            if credentials.revalidate().await? {
                println!("Credentials are valid");
            } else {
                println!("Credentials were rejected by the exchange");
            }
        }
        CredentialCommands::Show => {
            credentials.initialize().await;
            let status = credentials.status().await;
            println!("Environment:       {}", status.environment);
            println!("Base URL:          {}", status.api_base_url);
            println!("Valid:             {}", status.has_valid_credentials);
            println!("Supplied:          {}", status.has_supplied_credentials);
            println!("API key:           {}", status.masked_api_key);
        }
    }
    Ok(())
}
