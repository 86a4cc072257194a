use std::{error::Error, time::Duration};

use clap::Parser;
use framewire::{
    BalancerKind, Connection, Handler, IdPolicy, Server, ServerConfig, cli::parse_key,
    crypto::validate_key,
};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(default_value = "127.0.0.1")]
    address: String,
    /// Port to listen on; 0 picks a free one
    #[arg(default_value_t = 7070)]
    port: u16,
    /// How connections are spread over threads
    #[arg(long, value_enum, default_value_t = BalancerKind::FixedPool)]
    balancer: BalancerKind,
    /// Pool size for the fixed-pool balancer, defaults to the number of CPUs
    #[arg(long)]
    threads: Option<usize>,
    /// How connection ids are handed out
    #[arg(long, value_enum, default_value_t = IdPolicy::ReuseLowest)]
    ids: IdPolicy,
    /// Largest accepted frame, in bytes
    #[arg(long)]
    max_frame_size: Option<u32>,
    /// Server-wide key as 64 hex digits; plaintext when omitted
    #[arg(long)]
    key: Option<String>,
}

/// Sends every message back to where it came from.
struct Echo;

impl Handler for Echo {
    fn on_connected(&mut self, connection: &Connection) {
        info!("{connection} connected");
    }

    fn on_message(&mut self, connection: &Connection, data: Vec<u8>) {
        info!("{connection} sent {} bytes", data.len());
        connection.write(data);
    }

    fn on_disconnected(&mut self, connection: &Connection) {
        info!("{connection} disconnected");
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = ServerConfig::default()
        .with_balancer(cli.balancer)
        .with_id_policy(cli.ids);
    if let Some(threads) = cli.threads {
        config = config.with_threads(threads);
    }
    if let Some(max) = cli.max_frame_size {
        config = config.with_max_frame_size(max);
    }
    if let Some(key) = cli.key {
        let key = parse_key(&key)?;
        if !validate_key(&key) {
            return Err(format!("key must be 32 bytes, got {}", key.len()).into());
        }
        config = config.with_default_key(key);
    }

    let mut server = Server::new(config);
    server.set_handler(Echo)?;
    let addr = server.start(&cli.address, cli.port)?;
    println!("echo server listening on {addr}, press Ctrl-C to stop");

    let handle = server.handle()?;
    ctrlc::set_handler(move || handle.close())?;

    while !server.wait(Duration::from_secs(1)) {}
    println!("server closed");
    Ok(())
}
