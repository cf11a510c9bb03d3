use anyhow::Result;
use clap::Parser;

use rdtp::{ChannelCondition, ChatServer, ServerConfig};

#[derive(Parser)]
#[command(name = "rdtp-server")]
#[command(about = "Reliable-message broadcast chat server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = rdtp::DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value_t = rdtp::DEFAULT_MAX_FRAGMENT_SIZE,
          help = "Ceiling for negotiated fragment sizes")]
    max_fragment_size: usize,

    #[arg(long, default_value_t = rdtp::MAX_RETRIES,
          help = "Simulated failures tolerated per connection")]
    max_retries: u32,

    #[arg(long, default_value_t = 0.0, help = "Initial loss probability (0-1)")]
    loss_prob: f64,

    #[arg(long, default_value_t = 0.0, help = "Initial corruption probability (0-1)")]
    corruption_prob: f64,

    #[arg(long, default_value_t = 0.0, help = "Initial delay probability (0-1)")]
    delay_prob: f64,

    #[arg(long, default_value_t = 0.0, help = "Delay in seconds when the delay branch fires")]
    delay_time: f64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig {
        max_fragment_size: args.max_fragment_size,
        max_retries: args.max_retries,
        condition: ChannelCondition::clamped(
            args.loss_prob,
            args.corruption_prob,
            args.delay_prob,
            args.delay_time,
        ),
    };
    let mut server = ChatServer::bind(&format!("{}:{}", args.bind, args.port), config)?;
    log::info!(
        "serving on {} (fragment ceiling {}, retry ceiling {})",
        server.local_addr(),
        args.max_fragment_size,
        args.max_retries
    );
    server.run();
    Ok(())
}
