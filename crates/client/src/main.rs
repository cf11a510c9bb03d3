use std::io::{self, BufRead};

use anyhow::{Context, Result};
use clap::Parser;

use rdtp::{ChatClient, ConnectionParams, Protocol};

#[derive(Parser)]
#[command(name = "rdtp-client")]
#[command(about = "Line-driven client for the rdtp chat server")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, default_value_t = rdtp::DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value = "gbn", help = "Retransmission discipline (gbn or sr)")]
    protocol: Protocol,

    #[arg(long, default_value_t = rdtp::DEFAULT_MAX_FRAGMENT_SIZE)]
    max_fragment_size: usize,

    #[arg(long, default_value_t = rdtp::DEFAULT_WINDOW_SIZE)]
    window_size: usize,

    #[arg(short, long, help = "Nickname announced after connecting")]
    nickname: Option<String>,

    #[arg(short, long, help = "Send one message and exit instead of reading stdin")]
    message: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let params = ConnectionParams {
        protocol: args.protocol,
        max_fragment_size: args.max_fragment_size,
        window_size: args.window_size,
    };
    let mut client = ChatClient::new(args.host.clone(), args.port, params);
    client
        .connect()
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;

    if let Some(nickname) = args.nickname.as_deref() {
        client.set_nickname(nickname)?;
        log::info!("nickname set to {nickname}");
    }

    if let Some(message) = args.message.as_deref() {
        client.send_message(message)?;
        client.disconnect()?;
        return Ok(());
    }

    // One command per line:
    //   /list        print connected peers
    //   /nick NAME   change nickname
    //   /quit        disconnect and exit
    // Anything else is sent as a chat message.
    for line in io::stdin().lock().lines() {
        let line = line?;
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "/quit" {
            break;
        }
        if input == "/list" {
            for name in client.list_connected()? {
                println!("{name}");
            }
        } else if let Some(nickname) = input.strip_prefix("/nick ") {
            client.set_nickname(nickname.trim())?;
        } else {
            client.send_message(input)?;
        }
        for broadcast in client.take_broadcasts() {
            println!("{broadcast}");
        }
    }

    client.disconnect()?;
    Ok(())
}
