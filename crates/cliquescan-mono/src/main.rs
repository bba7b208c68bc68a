//! cliquescan-mono: block metadata synchronizer for a clique
//! proof-of-authority chain.
//!
//! One binary, five modes:
//! - `forward`: catch up to the live chain head and keep following it
//! - `backward`: fill history down to genesis, then exit
//! - `stage`: walk blocks into an append-only staging CSV file
//! - `load`: bulk-load a staging CSV file into the store
//! - `serve`: answer signer-liveness queries from the store
//!
//! The sync logic lives in the generic `cliquescan-sync` framework; this
//! crate contributes the concrete adapters (HTTP JSON-RPC, PostgreSQL) and
//! the CLI wiring.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use log::info;

use cliquescan_sync::{
    BackwardSync, CsvBulkLoader, CsvStagingWriter, ForwardSync, NodeClient, StagingSync,
    SyncConfig,
};

mod adapters;
mod server;

use adapters::{HttpRpcClient, PgBlockStore};
use server::AllowedSigners;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct RpcOpts {
    /// JSON-RPC endpoint of the node.
    #[arg(long, env = "RPC_URL")]
    rpc_url: String,
}

#[derive(Args, Debug, Clone)]
struct StoreOpts {
    /// PostgreSQL connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
    /// Connection pool size.
    #[arg(long, default_value_t = 5)]
    db_connections: u32,
}

#[derive(Args, Debug, Clone)]
struct ControllerOpts {
    /// Block number both watermarks fall back to when the store is empty.
    #[arg(long, env = "DEFAULT_START_BLOCK", default_value_t = 4_834_000)]
    start_block: u64,
    /// Blocks withheld below the chain head.
    #[arg(long, default_value_t = 10)]
    confirmation_lag: u64,
    /// Minimum pause between blocks, in milliseconds.
    #[arg(long, default_value_t = 100)]
    block_delay_ms: u64,
    /// Sleep when caught up to the lagged head, in seconds.
    #[arg(long, default_value_t = 10)]
    idle_interval_secs: u64,
    /// Sleep after a range-level failure, in seconds.
    #[arg(long, default_value_t = 5)]
    backoff_secs: u64,
}

impl ControllerOpts {
    fn to_config(&self) -> SyncConfig {
        SyncConfig {
            default_start_block: self.start_block,
            confirmation_lag: self.confirmation_lag,
            block_delay: Duration::from_millis(self.block_delay_ms),
            idle_interval: Duration::from_secs(self.idle_interval_secs),
            backoff_delay: Duration::from_secs(self.backoff_secs),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Catch up to the live chain head and keep following it.
    Forward {
        #[command(flatten)]
        rpc: RpcOpts,
        #[command(flatten)]
        store: StoreOpts,
        #[command(flatten)]
        controller: ControllerOpts,
    },
    /// Fill history from the low watermark down to genesis, then exit.
    Backward {
        #[command(flatten)]
        rpc: RpcOpts,
        #[command(flatten)]
        store: StoreOpts,
        #[command(flatten)]
        controller: ControllerOpts,
    },
    /// Stage resolved blocks into an append-only CSV file.
    Stage {
        #[command(flatten)]
        rpc: RpcOpts,
        #[command(flatten)]
        controller: ControllerOpts,
        /// Staging file path.
        #[arg(long, default_value = "blocks.csv")]
        csv_path: PathBuf,
        /// Rows buffered between flushes.
        #[arg(long, default_value_t = 10)]
        batch_size: usize,
    },
    /// Bulk-load a staging CSV file into the store.
    Load {
        #[command(flatten)]
        store: StoreOpts,
        /// Staging file path.
        #[arg(long, default_value = "blocks.csv")]
        csv_path: PathBuf,
        /// Rows per upsert statement.
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,
        /// Stop before inserting any block number above this bound.
        #[arg(long, env = "MAX_BLOCK")]
        max_block: Option<u64>,
    },
    /// Serve the signer-liveness endpoint.
    Serve {
        #[command(flatten)]
        store: StoreOpts,
        #[arg(long, env = "HOST", default_value = "127.0.0.1")]
        host: String,
        #[arg(long, env = "PORT", default_value_t = 3002)]
        port: u16,
        /// Whitelist file of `address,expiry_unix` lines.
        #[arg(long, default_value = "allowedsigner.txt")]
        allowed_signers: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let cli = Cli::parse();

    match cli.command {
        Command::Forward {
            rpc,
            store,
            controller,
        } => {
            let store = connect(&store).await?;
            let node = NodeClient::new(HttpRpcClient::new(rpc.rpc_url));
            let mut sync = ForwardSync::new(node, store, controller.to_config());
            sync.run().await;
        }
        Command::Backward {
            rpc,
            store,
            controller,
        } => {
            let store = connect(&store).await?;
            let node = NodeClient::new(HttpRpcClient::new(rpc.rpc_url));
            let mut sync = BackwardSync::new(node, store, controller.to_config());
            sync.run().await;
        }
        Command::Stage {
            rpc,
            controller,
            csv_path,
            batch_size,
        } => {
            let node = NodeClient::new(HttpRpcClient::new(rpc.rpc_url));
            let writer = CsvStagingWriter::new(csv_path, batch_size);
            let mut sync =
                StagingSync::new(node, writer, controller.start_block, controller.to_config());
            sync.run().await;
        }
        Command::Load {
            store,
            csv_path,
            batch_size,
            max_block,
        } => {
            let store = connect(&store).await?;
            let loader = CsvBulkLoader::new(store, batch_size, max_block);
            let outcome = loader.load(&csv_path).await?;
            info!(
                "bulk load finished: {} rows read, {} upserted, {} dropped{}",
                outcome.rows_read,
                outcome.rows_upserted,
                outcome.rows_dropped,
                if outcome.reached_bound {
                    " (halted at max block)"
                } else {
                    ""
                }
            );
        }
        Command::Serve {
            store,
            host,
            port,
            allowed_signers,
        } => {
            let store = connect(&store).await?;
            server::serve(store, AllowedSigners::new(allowed_signers), host, port).await?;
        }
    }

    Ok(())
}

async fn connect(opts: &StoreOpts) -> Result<PgBlockStore> {
    let store = PgBlockStore::connect(&opts.database_url, opts.db_connections).await?;
    store.ensure_schema().await?;
    Ok(store)
}
