use clap::Parser;
use log::info;
use server::config::{
    default_workers, DEFAULT_BATTLE_TICK_MS, DEFAULT_HEARTBEAT_SECS, DEFAULT_HOST,
    DEFAULT_IO_WORKERS, DEFAULT_MAX_MISSED_HEARTBEATS, DEFAULT_ROOM_CAPACITY,
};
use server::{Server, ServerConfig};
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Address to bind to
    #[clap(short = 'H', long, default_value = DEFAULT_HOST)]
    host: String,
    /// Port to listen on
    #[clap(short, long, default_value_t = shared::DEFAULT_PORT)]
    port: u16,
    /// Threads driving socket I/O
    #[clap(long, default_value_t = DEFAULT_IO_WORKERS)]
    io_workers: usize,
    /// Threads running request handlers (defaults to available parallelism)
    #[clap(short, long)]
    workers: Option<usize>,
    /// Seconds between heartbeat checks
    #[clap(long, default_value_t = DEFAULT_HEARTBEAT_SECS)]
    heartbeat_secs: u64,
    /// Silent heartbeat periods tolerated before a client is dropped
    #[clap(long, default_value_t = DEFAULT_MAX_MISSED_HEARTBEATS)]
    max_missed_heartbeats: u32,
    /// Milliseconds between battle state broadcasts
    #[clap(long, default_value_t = DEFAULT_BATTLE_TICK_MS)]
    battle_tick_ms: u64,
    /// Players per room
    #[clap(long, default_value_t = DEFAULT_ROOM_CAPACITY)]
    room_capacity: usize,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            host: args.host,
            port: args.port,
            io_workers: args.io_workers.max(1),
            workers: args.workers.unwrap_or_else(default_workers).max(1),
            heartbeat_period: Duration::from_secs(args.heartbeat_secs),
            max_missed_heartbeats: args.max_missed_heartbeats,
            battle_tick: Duration::from_millis(args.battle_tick_ms),
            room_capacity: args.room_capacity.max(1),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());
    info!(
        "Starting server on {} with {} I/O workers and {} handler workers",
        config.bind_addr(),
        config.io_workers,
        config.workers
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.io_workers)
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let server = Server::bind(config).await?;
        server
            .run_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            })
            .await?;
        Ok::<(), server::error::ServerError>(())
    })?;

    info!("Server stopped");
    Ok(())
}
