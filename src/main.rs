#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use overlay_relay_router::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "overlay-relay-router", about = "Overlay relay router: bridges overlay-network peers to local HTTP services")]
struct Cli {
    /// Path to the router config file (TOML or JSON, auto-detected by extension)
    #[arg(short, long, default_value = "router_config.json")]
    config: PathBuf,

    /// Admin API listen address (health/metrics/status)
    #[arg(long, default_value = "0.0.0.0:9091")]
    admin_listen: String,

    /// Disable the terminal dashboard (no-op: this build ships no dashboard)
    #[arg(long)]
    no_ui: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = server::runtime::get_container_cpu_limit();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        admin_listen: cli.admin_listen,
        no_ui: cli.no_ui,
    }))
}
