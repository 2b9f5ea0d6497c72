use clap::Parser;
use log::{error, info};
use server::{BrokerConfig, BrokerServer};
use shared::{DEFAULT_HOST, DEFAULT_MAX_FRAME_LEN, DEFAULT_PORT};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address or host name to bind to
    #[clap(short = 'H', long, default_value = DEFAULT_HOST)]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Name used in log lines
    #[clap(short, long, default_value = "broker")]
    name: String,
    /// Channel prefix that selects round-robin delivery
    #[clap(long, default_value = "/queue")]
    queue_prefix: String,
    /// Largest accepted frame in bytes
    #[clap(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    max_frame_len: usize,
}

/// Main-method of the application.
/// Binds the broker, then serves until Ctrl+C cancels every connection.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = BrokerConfig::with_addr(&args.host, args.port)
        .name(args.name)
        .queue_prefix(args.queue_prefix)
        .max_frame_len(args.max_frame_len);

    let server = BrokerServer::start(config).await?;
    info!(
        "Started {} server on {}",
        server.config().name,
        server.local_addr()
    );

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully...");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    server.run().await;
    info!("Bye!");

    Ok(())
}
