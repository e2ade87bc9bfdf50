use clap::Parser;
use log::info;
use server::config::ServerConfig;
use server::gateway::GatewayConfig;
use server::persistence::SnapshotSaver;
use server::scheduler::Scheduler;
use server::Server;
use std::path::PathBuf;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on
    #[clap(short, long, default_value = "43594")]
    port: u16,
    /// Simultaneous connections allowed per host
    #[clap(long, default_value = "1")]
    connection_limit: u32,
    /// Minimum time between connections from a connected host, in milliseconds
    #[clap(long, default_value = "1000")]
    rate_window_ms: u64,
    /// Only accept loopback connections
    #[clap(long)]
    restricted: bool,
    /// Task pool threads (defaults to one per core)
    #[clap(short, long)]
    workers: Option<usize>,
    /// Tick length in milliseconds
    #[clap(long, default_value = "600")]
    tick_ms: u64,
    /// Seconds without inbound data before a connection is dropped
    #[clap(long, default_value = "15")]
    idle_timeout_secs: u64,
    /// File with one banned address per line
    #[clap(long)]
    ban_list: Option<PathBuf>,
    /// Directory for player snapshots
    #[clap(long, default_value = "saves")]
    save_dir: PathBuf,
    /// Client revision to accept
    #[clap(long, default_value = "317")]
    revision: u16,
    /// Username granted administrator rights (repeatable)
    #[clap(long = "admin")]
    administrators: Vec<String>,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            host: self.host,
            port: self.port,
            tick: Duration::from_millis(self.tick_ms),
            workers: self.workers,
            gateway: GatewayConfig {
                connection_limit: self.connection_limit,
                rate_window: Duration::from_millis(self.rate_window_ms),
            },
            restricted: self.restricted,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            ban_list: self.ban_list,
            save_dir: self.save_dir,
            revision: self.revision,
            administrators: self.administrators,
            ..ServerConfig::default()
        }
    }
}

/// Main-method of the application.
/// Parses command-line arguments, builds the task pool, then runs the engine
/// until Ctrl+C.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .thread_name("task-pool")
        .enable_all()
        .build()?;
    let scheduler = Scheduler::new(runtime.handle().clone(), config.tick);
    let saver = SnapshotSaver::new(&config.save_dir);

    let mut server = Server::bind(config, scheduler)?;
    server.start()?;
    info!("Server running on {}", server.local_addr());

    runtime.block_on(tokio::signal::ctrl_c())?;
    info!("Received Ctrl+C, shutting down gracefully...");
    server.shutdown(&saver)?;
    Ok(())
}
