use std::path::PathBuf;

use anyhow::Result;
use bcc_config::BlockchatConfig;
use bcc_rpc::{init_logging, run_node, NodeOptions};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::runtime::Runtime;

#[derive(Parser)]
#[command(name = "blockchat", version, about = "BlockChat proof-of-stake chat chain")]
struct Cli {
    /// Base URL of the node the client commands talk to
    #[arg(long, global = true, default_value = "http://127.0.0.1:5000")]
    api: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node daemon
    Node {
        /// Port to listen on
        #[arg(short = 'p')]
        port: u16,
        /// Number of nodes in the ring
        #[arg(short = 'n')]
        nodes: u64,
        /// Transactions per block
        #[arg(long)]
        capacity: usize,
        /// Run as the bootstrap node
        #[arg(long)]
        bootstrap: bool,
        /// Optional TOML config with the bootstrap address
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Send BCCs to a peer, optionally with a message
    Send {
        receiver: u64,
        amount: i64,
        #[arg(short, long, default_value = "")]
        message: String,
    },
    /// Send a message only
    Message { receiver: u64, text: String },
    /// Raise (positive) or refund (negative) this node's stake
    Stake { amount: i64 },
    /// Show the current soft balance
    Balance,
    /// Show the transactions of the last block
    View,
    /// Show this wallet's transaction history
    History,
    /// Show this node's ring id
    Id,
    /// Show chain metrics
    Metrics,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = cli.api.clone();
    let rt = Runtime::new()?;
    match cli.command {
        Commands::Node {
            port,
            nodes,
            capacity,
            bootstrap,
            config,
        } => {
            init_logging();
            let config = BlockchatConfig::load(config.as_deref())?;
            rt.block_on(run_node(NodeOptions {
                port,
                total_nodes: nodes,
                capacity,
                bootstrap,
                config,
            }))?;
        }
        Commands::Send {
            receiver,
            amount,
            message,
        } => rt.block_on(create_transaction(&api, Some(receiver), amount, &message, false))?,
        Commands::Message { receiver, text } => {
            rt.block_on(create_transaction(&api, Some(receiver), 0, &text, false))?
        }
        Commands::Stake { amount } => {
            rt.block_on(create_transaction(&api, None, amount, "", true))?
        }
        Commands::Balance => rt.block_on(print_get(&api, "/api/get_balance"))?,
        Commands::View => rt.block_on(print_get(&api, "/api/view_block"))?,
        Commands::History => rt.block_on(print_get(&api, "/api/get_my_transactions"))?,
        Commands::Id => rt.block_on(print_get(&api, "/api/get_id"))?,
        Commands::Metrics => rt.block_on(print_get(&api, "/api/get_metrics"))?,
    }
    Ok(())
}

async fn create_transaction(
    api: &str,
    receiver: Option<u64>,
    amount: i64,
    message: &str,
    stake: bool,
) -> Result<()> {
    let body = serde_json::json!({
        "receiver": receiver,
        "amount": amount,
        "message": message,
        "stake": stake,
    });
    let response = reqwest::Client::new()
        .post(format!("{api}/api/create_transaction"))
        .json(&body)
        .send()
        .await?;
    let reply: Value = response.json().await?;
    if let Some(message) = reply.get("message").and_then(Value::as_str) {
        println!("{message}");
    }
    if let (Some(balance), Some(stake)) = (reply.get("balance"), reply.get("stake")) {
        println!("balance: {balance}  stake: {stake}");
    }
    Ok(())
}

async fn print_get(api: &str, path: &str) -> Result<()> {
    let response = reqwest::Client::new()
        .get(format!("{api}{path}"))
        .send()
        .await?;
    let reply: Value = response.json().await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}
