//! Paper-trading ledger
//!
//! Simulated equity accounts: cash balances, weighted-average-cost positions
//! and an append-only transaction journal, written together in one atomic unit
//! per trade.

mod config;
mod db;
mod error;
mod http;
mod ledger;
mod models;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::{LedgerConfig, QuantityMode};
use crate::db::Database;
use crate::http::AppState;
use crate::ledger::{AccountQuery, HistoryFilter, Reconciler, TradeEngine};
use crate::models::{CashKind, CashRequest, TradeRequest, TradeSide, TransactionKind, TransactionRecord};

/// Paper-trading ledger CLI.
#[derive(Parser)]
#[command(name = "paper-ledger")]
#[command(about = "Simulated equity trading ledger with atomic trade execution", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "LEDGER_DATABASE_URL", default_value = "sqlite:./paper_ledger.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LEDGER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Fee charged on gross trade value (0.001 = 0.1%)
    #[arg(long, env = "LEDGER_FEE_RATE", default_value = "0.001")]
    fee_rate: Decimal,

    /// Decimal places of the currency's minor unit
    #[arg(long, env = "LEDGER_CURRENCY_SCALE", default_value = "2")]
    currency_scale: u32,

    /// Share quantities: whole or fractional
    #[arg(long, env = "LEDGER_QUANTITY_MODE", default_value = "whole")]
    quantity_mode: QuantityMode,

    /// Upper bound on one atomic unit in milliseconds
    #[arg(long, env = "LEDGER_TRADE_TIMEOUT_MS", default_value = "5000")]
    trade_timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TradeArgs {
    /// Account id
    #[arg(short, long)]
    account: String,

    /// Ticker symbol
    #[arg(short, long)]
    symbol: String,

    /// Number of shares
    #[arg(short, long)]
    quantity: Decimal,

    /// Unit price
    #[arg(short, long)]
    price: Decimal,

    /// Idempotency key (generated when omitted)
    #[arg(long)]
    key: Option<String>,
}

#[derive(Args)]
struct CashArgs {
    /// Account id
    #[arg(short, long)]
    account: String,

    /// Amount in currency units
    #[arg(long)]
    amount: Decimal,

    /// Free-form note stored on the record
    #[arg(short, long)]
    note: Option<String>,

    /// Idempotency key (generated when omitted)
    #[arg(long)]
    key: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Address to listen on
        #[arg(short, long, env = "LEDGER_BIND", default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
    },

    /// Open a new account
    Open {
        /// Account id
        #[arg(short, long)]
        account: String,

        /// Opening deposit
        #[arg(long, default_value = "0")]
        deposit: Decimal,
    },

    /// Credit cash to an account
    Deposit(CashArgs),

    /// Debit cash from an account
    Withdraw(CashArgs),

    /// Credit a reward to an account
    Reward(CashArgs),

    /// Buy shares
    Buy(TradeArgs),

    /// Sell shares
    Sell(TradeArgs),

    /// Show balance, positions and recent transactions
    Wallet {
        /// Account id
        #[arg(short, long)]
        account: String,
    },

    /// List transaction history, newest first
    History {
        /// Account id
        #[arg(short, long)]
        account: String,

        /// Only this symbol
        #[arg(short, long)]
        symbol: Option<String>,

        /// Only this type (BUY, SELL, DEPOSIT, WITHDRAW, REWARD)
        #[arg(short, long)]
        kind: Option<TransactionKind>,

        /// Page size
        #[arg(long, default_value = "50")]
        limit: u32,

        /// Records to skip
        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Replay the journal and compare it with stored balance and positions
    Reconcile {
        /// Account id
        #[arg(short, long)]
        account: String,
    },

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = LedgerConfig {
        fee_rate: cli.fee_rate,
        currency_scale: cli.currency_scale,
        quantity_mode: cli.quantity_mode,
        trade_timeout: Duration::from_millis(cli.trade_timeout_ms),
        ..LedgerConfig::default()
    };
    config.validate()?;

    if let Commands::Config = cli.command {
        print_config(&cli.database, &config);
        return Ok(());
    }

    // Initialize database
    let db = Database::new(&cli.database).await?;
    let engine = TradeEngine::new(db.clone(), config.clone())?;
    let query = AccountQuery::new(db.clone(), config);

    match cli.command {
        Commands::Serve { bind } => {
            info!(bind = %bind, "Starting ledger API");
            http::serve(bind, AppState::new(engine)).await?;
        }

        Commands::Open { account, deposit } => {
            let opened = engine.open_account(&account, deposit).await?;
            println!("Opened account {} with balance {}", opened.id, opened.balance);
        }

        Commands::Deposit(args) => apply_cash(&engine, CashKind::Deposit, args).await?,
        Commands::Withdraw(args) => apply_cash(&engine, CashKind::Withdraw, args).await?,
        Commands::Reward(args) => apply_cash(&engine, CashKind::Reward, args).await?,

        Commands::Buy(args) => trade(&engine, TradeSide::Buy, args).await?,
        Commands::Sell(args) => trade(&engine, TradeSide::Sell, args).await?,

        Commands::Wallet { account } => {
            let wallet = query.wallet(&account).await?;

            println!("\n=== Wallet: {} ===\n", wallet.account_id);
            println!("  Cash Balance:         {}", wallet.balance);
            println!("  Total Deposited:      {}", wallet.summary.total_deposited);
            println!("  Total Withdrawn:      {}", wallet.summary.total_withdrawn);
            println!("  Total Rewards:        {}", wallet.summary.total_rewards);
            println!("  Fees Paid:            {}", wallet.summary.total_fees);
            println!("  Realized P&L:         {}", wallet.summary.realized_pnl);
            println!("  Trades:               {}", wallet.summary.trade_count);

            if wallet.portfolio.is_empty() {
                println!("\nNo open positions.");
            } else {
                println!("\n{:<12} {:>14} {:>18} {:>20}", "SYMBOL", "QUANTITY", "AVG COST", "COST BASIS");
                println!("{}", "-".repeat(67));
                for position in &wallet.portfolio {
                    println!(
                        "{:<12} {:>14} {:>18} {:>20}",
                        position.symbol,
                        position.quantity,
                        position.avg_price.round_dp(4),
                        position.cost_basis().round_dp(2)
                    );
                }
            }

            println!("\nRecent transactions:");
            print_records(&wallet.transactions);
        }

        Commands::History {
            account,
            symbol,
            kind,
            limit,
            offset,
        } => {
            let filter = HistoryFilter {
                symbol,
                kind,
                limit: Some(limit),
                offset: Some(offset),
                ..Default::default()
            };
            let page = query.history(&account, &filter).await?;
            print_records(&page.items);
            println!(
                "\nShowing {} of {} (offset {})",
                page.items.len(),
                page.total,
                page.offset
            );
        }

        Commands::Reconcile { account } => {
            let report = Reconciler::reconcile(&db, &account).await?;
            println!(
                "Account {}: balance {}, {} journal entries",
                report.account_id, report.balance, report.journal_entries
            );
            if !report.is_clean() {
                for drift in &report.drifts {
                    println!("  DRIFT {}", serde_json::to_string(drift)?);
                }
                anyhow::bail!("{} drift(s) found for {}", report.drifts.len(), report.account_id);
            }
            println!("Journal, balance and positions agree.");
        }

        // Printed before the database was opened.
        Commands::Config => {}
    }

    Ok(())
}

async fn trade(engine: &TradeEngine, side: TradeSide, args: TradeArgs) -> Result<()> {
    let request = TradeRequest {
        account_id: args.account,
        symbol: args.symbol,
        side,
        quantity: args.quantity,
        price: args.price,
        idempotency_key: args.key,
    };
    let outcome = engine.execute_with_retry(request).await?;
    if outcome.replayed {
        println!("Already committed under this key:");
    }
    print_records(std::slice::from_ref(&outcome.record));
    if let Some(pnl) = outcome.record.realized_pnl {
        println!("\nRealized P&L: {}", pnl);
    }
    Ok(())
}

async fn apply_cash(engine: &TradeEngine, kind: CashKind, args: CashArgs) -> Result<()> {
    let request = CashRequest {
        account_id: args.account,
        kind,
        amount: args.amount,
        note: args.note,
        idempotency_key: args.key,
    };
    let outcome = engine.apply_cash_with_retry(request).await?;
    if outcome.replayed {
        println!("Already committed under this key:");
    }
    print_records(std::slice::from_ref(&outcome.record));
    Ok(())
}

fn print_records(records: &[TransactionRecord]) {
    if records.is_empty() {
        println!("No transactions.");
        return;
    }

    println!(
        "\n{:<20} {:<9} {:<10} {:>10} {:>14} {:>16} {:>10} {:>16}",
        "TIME", "TYPE", "SYMBOL", "QTY", "PRICE", "CASH", "FEE", "BALANCE"
    );
    println!("{}", "-".repeat(112));

    for record in records {
        println!("{}", record_row(record));
    }
}

/// The CASH column is the signed effect on the balance, fee included.
fn record_row(record: &TransactionRecord) -> String {
    format!(
        "{:<20} {:<9} {:<10} {:>10} {:>14} {:>16} {:>10} {:>16}",
        record.created_at.format("%Y-%m-%d %H:%M:%S"),
        record.kind,
        record.symbol.as_deref().unwrap_or("-"),
        record.quantity.map(|q| q.to_string()).unwrap_or_else(|| "-".to_string()),
        record.price.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
        record.cash_impact,
        record.fee,
        record.balance_after
    )
}

fn print_config(database: &str, config: &LedgerConfig) {
    println!("\n=== Ledger Configuration ===\n");
    println!("Storage:");
    println!("  Database:             {}", database);

    println!("\nFees & Rounding:");
    println!("  Fee Rate:             {}%", config.fee_rate * Decimal::ONE_HUNDRED);
    println!("  Currency Scale:       {} dp", config.currency_scale);
    println!("  Average Cost Scale:   {} dp", config::AVG_COST_SCALE);
    println!("  Max Price Scale:      {} dp", config::PRICE_SCALE);

    println!("\nOrders:");
    println!("  Quantity Mode:        {}", config.quantity_mode);
    if config.quantity_mode == QuantityMode::Fractional {
        println!("  Quantity Scale:       {} dp", config.quantity_scale);
    }

    println!("\nConcurrency:");
    println!("  Trade Timeout:        {}ms", config.trade_timeout_ms());
    println!("  Retry Budget:         {}s", config.retry_budget.as_secs());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountId;
    use rust_decimal_macros::dec;

    #[test]
    fn test_record_row_shows_signed_cash() {
        let record = TransactionRecord {
            id: uuid::Uuid::new_v4(),
            account_id: AccountId::parse("u1").unwrap(),
            kind: TransactionKind::Buy,
            symbol: Some("VNM".to_string()),
            quantity: Some(dec!(100)),
            price: Some(dec!(72400)),
            amount: dec!(7240000),
            fee: dec!(7240),
            cash_impact: dec!(-7247240),
            balance_after: dec!(2752760),
            realized_pnl: None,
            note: None,
            idempotency_key: None,
            created_at: chrono::Utc::now(),
        };

        let row = record_row(&record);
        let columns: Vec<&str> = row.split_whitespace().collect();
        // Date and time occupy the first two fields.
        assert_eq!(
            &columns[2..],
            &["BUY", "VNM", "100", "72400", "-7247240", "7240", "2752760"]
        );
    }
}
