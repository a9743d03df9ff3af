use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use txcoord_rpc::AdminClient;

#[derive(Parser)]
#[command(name = "txcoord_admin")]
#[command(about = "Admin client for transaction coordinator nodes", long_about = None)]
struct Cli {
    /// Base URL of the node to talk to
    #[arg(long, default_value = "http://127.0.0.1:27100")]
    node: String,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the node is serving
    Health,

    /// List in-flight coordinator RPCs, router waits and live coordinators
    CurrentOp,

    /// Coordinator counters
    ServerStatus,

    /// Interrupt one operation by opid
    KillOp { opid: u64 },

    /// Buffer one JSON document inside a transaction on this node's shard
    Insert {
        #[arg(long)]
        lsid: Uuid,
        #[arg(long)]
        txn_number: i64,
        #[arg(long, default_value = "test.user")]
        ns: String,
        document: String,
    },

    /// Committed documents of a namespace on this node's shard
    Find {
        #[arg(long, default_value = "test.user")]
        ns: String,
    },

    /// Ask the node to coordinate a commit across the given shards
    CoordinateCommit {
        #[arg(long)]
        lsid: Uuid,
        #[arg(long)]
        txn_number: i64,
        #[arg(required = true)]
        participants: Vec<String>,
    },

    /// Abort a transaction on this node's shard
    Abort {
        #[arg(long)]
        lsid: Uuid,
        #[arg(long)]
        txn_number: i64,
    },

    /// Abandon all coordinators and refuse new commits
    StepDown,

    /// Recover incomplete coordinators and accept commits again
    StepUp,

    /// Print a fresh session id
    NewSession,
}

fn print(reply: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(reply)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let client = AdminClient::new(&cli.node, Duration::from_secs(cli.timeout))
        .with_context(|| format!("invalid node url {}", cli.node))?;
    info!("Talking to {}", client.base_url());

    let reply = match cli.command {
        Commands::Health => client.health().await?,
        Commands::CurrentOp => client.current_op().await?,
        Commands::ServerStatus => client.server_status().await?,
        Commands::KillOp { opid } => client.run_command("killOp", &json!({ "op": opid })).await?,
        Commands::Insert { lsid, txn_number, ns, document } => {
            let document: Value = serde_json::from_str(&document).context("document is not JSON")?;
            if !document.is_object() {
                bail!("document must be a JSON object");
            }
            let body = json!({ "lsid": lsid, "txnNumber": txn_number, "ns": ns, "documents": [document] });
            client.run_command("insert", &body).await?
        }
        Commands::Find { ns } => client.run_command("find", &json!({ "ns": ns })).await?,
        Commands::CoordinateCommit { lsid, txn_number, participants } => {
            let body = json!({ "lsid": lsid, "txnNumber": txn_number, "participants": participants });
            client.run_command("coordinateCommitTransaction", &body).await?
        }
        Commands::Abort { lsid, txn_number } => {
            let body = json!({ "lsid": lsid, "txnNumber": txn_number });
            client.run_command("abortTransaction", &body).await?
        }
        Commands::StepDown => client.run_command("replSetStepDown", &json!({})).await?,
        Commands::StepUp => client.run_command("replSetStepUp", &json!({})).await?,
        Commands::NewSession => json!({ "lsid": Uuid::new_v4() }),
    };

    print(&reply)
}
