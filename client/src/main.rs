use clap::{Parser, Subcommand};
use client::{client_label, BrokerClient};
use log::{info, warn};
use shared::{Channel, DEFAULT_HOST, DEFAULT_PORT};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Broker host to connect to
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    host: String,

    /// Broker port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a channel and print what arrives
    Listen {
        #[arg(short, long, default_value = "/topic/saskan_concept")]
        channel: String,
    },
    /// Publish a message to a channel at a fixed interval
    Publish {
        #[arg(short, long, default_value = "/topic/foo")]
        channel: String,

        /// Seconds between messages
        #[arg(short, long, default_value = "1", value_parser = parse_interval)]
        interval: Duration,

        /// Payload size in bytes; 0 sends a numbered text message instead
        #[arg(short, long, default_value = "0")]
        size: usize,

        /// Stop after this many messages (runs until interrupted when unset)
        #[arg(short = 'n', long)]
        count: Option<u64>,
    },
}

fn parse_interval(arg: &str) -> Result<Duration, String> {
    let secs: f64 = arg.parse().map_err(|e| format!("{}", e))?;
    Duration::try_from_secs_f64(secs).map_err(|_| format!("not a usable interval: {}", arg))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);
    let me = client_label();
    info!("Starting up {}", me);

    tokio::select! {
        result = run(&addr, &me, args.command) => result?,
        _ = tokio::signal::ctrl_c() => info!("Bye!"),
    }

    Ok(())
}

async fn run(addr: &str, me: &str, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Listen { channel } => {
            let mut client = BrokerClient::subscribe(addr, channel).await?;
            if let Some(local) = client.local_addr() {
                info!("{} listening on {} from {}", me, client.channel(), local);
            }
            while let Some(data) = client.recv().await? {
                let preview = &data[..data.len().min(20)];
                info!("Received by {}: {:?}", me, String::from_utf8_lossy(preview));
            }
            info!("Server closed.");
        }
        Command::Publish {
            channel,
            interval,
            size,
            count,
        } => {
            let channel = Channel::from(channel);
            let mut client = BrokerClient::publisher(addr).await?;
            let mut sent = 0u64;

            while count.map_or(true, |limit| sent < limit) {
                sleep(interval).await;
                let data = if size > 0 {
                    vec![b'X'; size]
                } else {
                    format!("Msg {} from {}", sent, me).into_bytes()
                };
                if let Err(e) = client.publish(&channel, &data).await {
                    warn!("Connection ended: {}", e);
                    return Ok(());
                }
                sent += 1;
            }

            client.close().await?;
            info!("Sent {} message(s) to {}", sent, channel);
        }
    }
    Ok(())
}
