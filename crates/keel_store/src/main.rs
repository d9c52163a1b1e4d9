// KeelStore node binary entry point.
//
// Wires together the shard stores, session tracking, replication state
// surface, and the RESP listener, and hosts the CLI and logging setup.

use std::fs;
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

mod command;
mod commands;
mod repl;
mod resp;
mod server;
mod session;

use server::ServerEntry;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "keel-store")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Node(NodeArgs),
}

/// CLI options for running a node.
#[derive(Parser, Debug)]
struct NodeArgs {
    /// RESP listen address for client and operator commands.
    #[arg(long, env = "KEEL_LISTEN", default_value = "127.0.0.1:6380")]
    listen: SocketAddr,

    /// Directory holding shard data and binlogs.
    #[arg(long)]
    data_dir: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => run_node(args).await,
    }
}

/// Open storage, build the server state, and serve until ctrl-c.
async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    let data_dir = PathBuf::from(&args.data_dir);
    fs::create_dir_all(&data_dir).context("create data dir")?;
    let storage_dir = data_dir.join("storage");
    let binlog_dir = data_dir.join("binlog");

    let keyspace = Arc::new(
        fjall::Config::new(&storage_dir)
            .open()
            .context("open fjall keyspace")?,
    );
    let shards =
        keel_engine::ShardSet::open(&keyspace, &binlog_dir).context("open shard stores")?;
    let server = Arc::new(ServerEntry::new(shards));

    tracing::info!(
        listen = %args.listen,
        shards = keel_engine::INSTANCE_NUM,
        commands = command::registry().len(),
        "keel-store ready"
    );

    tokio::select! {
        res = resp::run(args.listen, server) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            Ok(())
        }
    }
}
