use clap::{Parser, Subcommand};

use common::telemetry::init_telemetry;
use coord::command::gc::{GcArgs, gc};
use coord::command::nodes::{NodesArgs, nodes};
use coord::command::serve::{ServeArgs, serve};

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
enum Cmd {
    /// Run the HTTP server and background workers
    Serve(ServeArgs),
    /// List registered storage nodes
    Nodes(NodesArgs),
    /// Expire and purge retired files offline
    Gc(GcArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry("coord");

    let args = Args::parse();

    match args.cmd {
        Cmd::Serve(serve_args) => serve(serve_args).await?,
        Cmd::Nodes(nodes_args) => nodes(nodes_args).await?,
        Cmd::Gc(gc_args) => gc(gc_args).await?,
    }

    Ok(())
}
