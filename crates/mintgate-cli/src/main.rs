// ============================================================================
// mintgate - NFT-gated group bot and ledger inspection tool
// ============================================================================
// Usage:
//   mintgate run [--collections FILE]      Run the bot (dispatcher + watchdog)
//   mintgate stats                         Show ledger statistics
//   mintgate list [--collection ID]        List recorded owners
//   mintgate export --format json          Export the ledger as JSON
//   mintgate forget <MINT>                 Drop one ownership record
//   mintgate cursor                        Show the last processed update id
// ============================================================================

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use clap::{Args, Parser, Subcommand};
use mintgate_core::{
    AssetDirectory, GateContext, GateSettings, Ledger, ShutdownController, SolanaChain,
    TelegramBot, UpdateDispatcher, Watchdog,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::filter::{Directive, EnvFilter};

/// NFT-gated Telegram group access
#[derive(Parser)]
#[command(name = "mintgate", version, about = "Gate Telegram groups by Solana NFT ownership")]
struct Cli {
    /// Path to the ledger file (default: ~/.mintgate/ledger.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot until SIGINT/SIGTERM
    Run(RunArgs),

    /// Show ledger statistics
    Stats,

    /// List recorded owners
    List {
        /// Only records of this collection id
        #[arg(long)]
        collection: Option<String>,

        /// Collection definitions, used to label records
        #[arg(long, default_value = "collections.json")]
        collections: PathBuf,
    },

    /// Export ledger contents as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Drop the ownership record of one mint
    Forget {
        mint: String,
    },

    /// Show the last processed update id
    Cursor,
}

#[derive(Args)]
struct RunArgs {
    /// Telegram bot token
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    token: String,

    /// Solana JSON-RPC endpoint
    #[arg(long, env = "SOLANA_RPC_URL", default_value = "https://api.mainnet-beta.solana.com")]
    rpc_url: String,

    /// Collection definitions
    #[arg(long, default_value = "collections.json")]
    collections: PathBuf,

    /// Optional JSON file overriding gate settings
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Watchdog period in hours
    #[arg(long)]
    watchdog_hours: Option<u64>,
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

fn init_logging(debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { "info" };
    let core: Directive = format!("mintgate_core={}", level).parse()?;
    let bin: Directive = format!("mintgate={}", level).parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(core).add_directive(bin))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    let cli = Cli::parse();
    init_logging(cli.debug)?;

    let db_path = cli.db_path.as_deref();
    match cli.command {
        Commands::Run(args) => cmd_run(db_path, args).await,
        Commands::Stats => cmd_stats(&Ledger::open(db_path)?),
        Commands::List {
            collection,
            collections,
        } => cmd_list(&Ledger::open(db_path)?, collection.as_deref(), &collections),
        Commands::Export { format } => cmd_export(&Ledger::open(db_path)?, &format),
        Commands::Forget { mint } => cmd_forget(&Ledger::open(db_path)?, &mint),
        Commands::Cursor => cmd_cursor(&Ledger::open(db_path)?),
    }
}

fn load_settings(args: &RunArgs) -> Result<GateSettings> {
    let mut settings = match &args.settings {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| anyhow!("Failed to read settings {}: {}", path.display(), e))?;
            serde_json::from_str(&raw)
                .map_err(|e| anyhow!("Failed to parse settings {}: {}", path.display(), e))?
        }
        None => GateSettings::default(),
    };

    if let Some(hours) = args.watchdog_hours {
        settings.watchdog_interval_secs = hours.saturating_mul(3600);
    }
    settings.validate()?;
    Ok(settings)
}

async fn cmd_run(db_path: Option<&str>, args: RunArgs) -> Result<()> {
    info!("Starting MintGate");

    // Anything failing before the loops start is fatal
    let directory = AssetDirectory::load(&args.collections)?;
    let settings = load_settings(&args)?;
    let ledger = Ledger::open(db_path)?;

    let bot = Arc::new(TelegramBot::new(args.token.clone())?);
    bot.get_me()
        .await
        .map_err(|e| anyhow!("Telegram rejected the bot token: {}", e))?;

    let chain = Arc::new(SolanaChain::new(&args.rpc_url));
    let ctx = GateContext::new(directory, ledger, chain, bot.clone(), settings);

    let controller = Arc::new(ShutdownController::new());
    let signals = controller.clone();
    tokio::spawn(async move { signals.wait_for_signal().await });

    let watchdog = tokio::spawn(Watchdog::new(ctx.clone(), controller.subscribe()).run());

    let result = UpdateDispatcher::new(ctx, bot, controller.subscribe()).run().await;

    // Dispatcher only returns early on a broken ledger; take the watchdog down with it
    controller.shutdown();
    if let Err(e) = watchdog.await {
        warn!("Watchdog task ended abnormally: {}", e);
    }

    info!("MintGate stopped");
    result
}

fn cmd_stats(ledger: &Ledger) -> Result<()> {
    let stats = ledger.stats()?;

    println!("=== MintGate Ledger Stats ===");
    match ledger.path() {
        Some(path) => println!("Database: {}", path.display()),
        None => println!("Database: (in memory)"),
    }
    println!();
    println!("Records:  {}", stats.total_records);
    println!("Users:    {}", stats.distinct_users);
    println!("Wallets:  {}", stats.distinct_wallets);
    match stats.cursor {
        Some(cursor) => println!("Cursor:   {}", cursor),
        None => println!("Cursor:   (none)"),
    }

    Ok(())
}

fn cmd_list(ledger: &Ledger, collection: Option<&str>, collections: &Path) -> Result<()> {
    // Labels are a convenience; a missing directory only matters when filtering
    let directory = match AssetDirectory::load(collections) {
        Ok(directory) => Some(directory),
        Err(e) if collection.is_none() => {
            warn!("Listing without collection names: {}", e);
            None
        }
        Err(e) => return Err(e),
    };

    let records = ledger.list_all()?;
    let rows: Vec<_> = records
        .iter()
        .map(|(mint, record)| {
            let owner = directory
                .as_ref()
                .and_then(|d| d.collection_of(mint))
                .map(|c| c.id.as_str());
            (mint, record, owner)
        })
        .filter(|(_, _, owner)| collection.is_none() || *owner == collection)
        .collect();

    if rows.is_empty() {
        println!("No records found.");
        return Ok(());
    }

    println!(
        "{:<44}  {:<44}  {:<12}  {:<10}  {}",
        "MINT", "WALLET", "USER", "COLLECTION", "VERIFIED AT"
    );
    println!("{}", "-".repeat(140));

    for (mint, record, owner) in &rows {
        println!(
            "{:<44}  {:<44}  {:<12}  {:<10}  {}",
            mint,
            record.wallet,
            record.user,
            owner.unwrap_or("-"),
            format_timestamp(record.verified_at)
        );
    }

    println!("\nTotal: {} records", rows.len());
    Ok(())
}

fn cmd_export(ledger: &Ledger, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": ledger.stats()?,
        "records": ledger.list_all()?,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

fn cmd_forget(ledger: &Ledger, mint: &str) -> Result<()> {
    match ledger.get(mint)? {
        Some(record) => {
            ledger.delete(mint)?;
            println!(
                "Forgot {} (wallet {}, user {}). Group access is not revoked.",
                mint, record.wallet, record.user
            );
        }
        None => println!("No record for {}", mint),
    }
    Ok(())
}

fn cmd_cursor(ledger: &Ledger) -> Result<()> {
    match ledger.cursor()? {
        Some(cursor) => println!("{}", cursor),
        None => println!("No update processed yet"),
    }
    Ok(())
}
