use clap::Parser;
use client::network::Client;
use log::info;

/// Interactive client for the message-routing server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address
    ip: String,

    /// Server port
    port: u16,

    /// Identifier registered by the `connect` command
    ident: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("starting client with ident {}", args.ident);
    let client = Client::connect(&format!("{}:{}", args.ip, args.port), args.ident).await?;
    client.run().await?;

    Ok(())
}
