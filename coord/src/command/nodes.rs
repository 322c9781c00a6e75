use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use crate::core::meta::{KvDb, MetaStore};

#[derive(Parser, Debug, Clone)]
pub struct NodesArgs {
    #[arg(long, env = "DFS_INDEX", default_value = "./data/index")]
    pub index: PathBuf,

    /// Print JSON instead of a table
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

/// Lists the persisted node registry. Health shown is the last state the
/// running coordinator wrote.
pub async fn nodes(args: NodesArgs) -> Result<()> {
    let db = KvDb::open(&args.index)?;
    let nodes = db.list_nodes()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&nodes)?);
        return Ok(());
    }

    println!(
        "{:<16} {:<32} {:<8} {:>14} {:>14} {:>8}",
        "ID", "ENDPOINT", "HEALTH", "USED", "CAPACITY", "FILES"
    );
    for node in nodes {
        println!(
            "{:<16} {:<32} {:<8} {:>14} {:>14} {:>8}",
            node.id,
            node.endpoint,
            format!("{:?}", node.health).to_lowercase(),
            node.used_bytes,
            node.capacity_bytes,
            node.file_count
        );
    }

    Ok(())
}
