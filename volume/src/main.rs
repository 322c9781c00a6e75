use axum_server::Server;
use clap::Parser;
use std::path::PathBuf;
use tokio::time::Duration;
use tracing::{info, warn};

use common::file_utils::init_dirs;
use common::schemas::RegisterNodeRequest;
use common::telemetry::init_telemetry;
use common::trace_middleware::inject_trace_context;
use common::url_utils::{parse_socket_addr, sanitize_url};

use volume::routes::router;
use volume::state::{DurabilityLevel, VolumeState};
use volume::store::{disk_usage, sweep_tmp};

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
struct Args {
    #[arg(long, env = "VOLUME_DATA", default_value = "./data")]
    data: PathBuf,
    #[arg(long, env = "VOLUME_NODE_ID", default_value = "vol-1")]
    node_id: String,
    #[arg(long, env = "VOLUME_LISTEN", default_value = "0.0.0.0:3001")]
    listen: String,
    /// URL the coordinator uses to reach this node
    #[arg(long, default_value = "http://127.0.0.1:3001")]
    public_url: String,
    /// Register with this coordinator on startup
    #[arg(long, env = "COORDINATOR_URL")]
    coordinator_url: Option<String>,
    /// Advertised capacity; defaults to the filesystem size
    #[arg(long)]
    capacity_bytes: Option<u64>,
    #[arg(long, default_value_t = 1024 * 1024 * 1024u64)]
    max_object_bytes: u64,
    /// Skip fsync on writes
    #[arg(long, default_value_t = false)]
    no_fsync: bool,
    /// Expose /admin/fail/* and friends
    #[arg(long, default_value_t = false)]
    enable_fault_injection: bool,
    #[arg(long, default_value_t = 5)]
    http_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry("volume");

    let args = Args::parse();
    init_dirs(&args.data).await?;

    let swept = sweep_tmp(&args.data).await?;
    if swept > 0 {
        info!(swept, "removed leftover temp files");
    }

    let mut state = VolumeState::new(args.data.clone(), args.node_id.clone());
    state.capacity_bytes = args.capacity_bytes;
    state.max_object_bytes = args.max_object_bytes;
    state.fault_admin = args.enable_fault_injection;
    if args.no_fsync {
        state.durability_level = DurabilityLevel::OS;
    }

    let (used, count) = state.usage.snapshot();
    info!(node_id = %state.node_id, used, count, "blob store opened");

    if let Some(coordinator_url) = &args.coordinator_url {
        let http_client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_secs(args.http_timeout_secs))
            .build()?;
        if let Err(e) = join_cluster(&http_client, coordinator_url, &args, &state).await {
            // the coordinator may list this node statically instead
            warn!(error = %e, "registration with coordinator failed");
        }
    }

    let app = router(state);

    let socket_addr = parse_socket_addr(&args.listen)?;
    let server = Server::bind(socket_addr).serve(app.into_make_service());

    info!("listening on {}", args.listen);

    // Graceful shutdown: ctrl+c
    tokio::select! {
        res = server => { res?; }
        _ = tokio::signal::ctrl_c() => {}
    }

    Ok(())
}

async fn join_cluster(
    http_client: &reqwest::Client,
    coordinator_url: &str,
    args: &Args,
    state: &VolumeState,
) -> anyhow::Result<()> {
    let capacity_bytes = match state.capacity_bytes {
        Some(cap) => cap,
        None => disk_usage(&state.data_root)?.1.unwrap_or(0),
    };

    let payload = RegisterNodeRequest {
        id: state.node_id.clone(),
        endpoint: args.public_url.clone(),
        capacity_bytes,
    };

    let url = format!("{}/admin/nodes", sanitize_url(coordinator_url)?);
    let req = inject_trace_context(http_client.post(url).json(&payload));

    let resp = req.send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("join failed: {}", resp.status());
    }

    info!("joined coordinator as {}", state.node_id);

    Ok(())
}
