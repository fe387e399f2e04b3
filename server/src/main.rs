use clap::Parser;
use log::info;
use server::network::Server;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Message-routing server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Maximum number of concurrent client connections
    #[arg(default_value_t = 10)]
    max_clients: usize,

    /// Port to listen on
    #[arg(default_value_t = 8888)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let server = Server::bind(&format!("0.0.0.0:{}", args.port), args.max_clients).await?;
    let shutdown = server.shutdown_handle();

    // `q` on stdin triggers a graceful shutdown.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim() == "q" {
                    info!("shutdown requested from stdin");
                    shutdown.shutdown();
                    break;
                }
            }
        });
    }

    // So does Ctrl-C.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested via Ctrl-C");
            shutdown.shutdown();
        }
    });

    server.run().await?;

    Ok(())
}
