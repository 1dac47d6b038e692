use anyhow::Result;
use clap::Parser;
use socksd::{Config, Socks5Server};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "A lightweight SOCKS5 proxy server", long_about = None)]
struct Args {
    /// Config file (TOML); CLI flags override file values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listener address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Username for SOCKS5 proxy
    #[arg(short, long)]
    username: Option<String>,

    /// Password for SOCKS5 proxy
    #[arg(short, long)]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt::init();

    // Parse args
    let args = Args::parse();

    // Start from the config file when given, defaults otherwise
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if args.username.is_some() {
        config.user = args.username;
    }
    if args.password.is_some() {
        config.password = args.password;
    }
    config.validate()?;

    // Instantiate and run the server
    let mut server = Socks5Server::new(config);
    server.run().await
}
