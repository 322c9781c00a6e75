use axum_server::Server;
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, warn};

use common::url_utils::parse_socket_addr;

use crate::command::common::{ClusterArgs, open_cluster};
use crate::core::expiry::{DeletionWorker, ExpirySweeper};
use crate::core::health::HealthMonitor;
use crate::core::postprocess::PostProcessor;
use crate::core::replication::ReplicationEngine;
use crate::core::routes::router;

#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    /// RocksDB directory holding file records, nodes and tasks
    #[arg(long, env = "DFS_INDEX", default_value = "./data/index")]
    index: PathBuf,

    /// Address to listen on
    #[arg(long, env = "DFS_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    #[command(flatten)]
    cluster: ClusterArgs,
}

pub async fn serve(serve_args: ServeArgs) -> anyhow::Result<()> {
    let state = open_cluster(&serve_args.index, &serve_args.cluster)?;

    let (shutdown_tx, shutdown_rx) = watch::channel::<bool>(false);
    let workers = vec![
        tokio::spawn(
            HealthMonitor::new(state.registry.clone(), state.connector.clone(), &state.cfg)
                .run(shutdown_rx.clone()),
        ),
        tokio::spawn(ReplicationEngine::new(state.clone()).run(shutdown_rx.clone())),
        tokio::spawn(PostProcessor::new(state.clone()).run(shutdown_rx.clone())),
        tokio::spawn(DeletionWorker::new(state.clone()).run(shutdown_rx.clone())),
        tokio::spawn(ExpirySweeper::new(state.clone()).run(shutdown_rx)),
    ];

    // consumers are attached, hand them whatever the last run left behind
    let recovered = state.queue.recover().await?;
    if recovered > 0 {
        info!(recovered, "unfinished tasks re-dispatched");
    }

    let app = router(state);

    let socket_addr = parse_socket_addr(&serve_args.listen)?;
    let server = Server::bind(socket_addr).serve(app.into_make_service());

    info!("listening on {}", serve_args.listen);

    // Graceful shutdown: ctrl+c
    tokio::select! {
        res = server => { res?; }
        _ = tokio::signal::ctrl_c() => {}
    }

    let _ = shutdown_tx.send(true);
    for handle in workers {
        match handle.await {
            Ok(Err(e)) => warn!(error = %e, "background worker failed"),
            Err(e) => warn!(error = %e, "background worker panicked"),
            Ok(Ok(())) => {}
        }
    }

    Ok(())
}
