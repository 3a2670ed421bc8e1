//! codemeet session coordinator
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default 0.0.0.0:5000
//! cargo run -p codemeet-server
//!
//! # Small rooms, verbose logs
//! RUST_LOG=debug cargo run -p codemeet-server -- --bind 127.0.0.1:9000 --max-members 4
//! ```

use clap::Parser;
use codemeet_collab::{CollabServer, ServerConfig, DEFAULT_DOCUMENT};
use log::info;
use tokio::net::TcpListener;

/// codemeet session coordinator
///
/// Groups WebSocket participants into rooms, syncs the shared document and
/// chat, and relays WebRTC signaling between room members.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:5000", env = "CODEMEET_BIND")]
    bind: String,

    /// Maximum members per room
    #[arg(long, default_value_t = 100, env = "CODEMEET_MAX_MEMBERS")]
    max_members: usize,

    /// Outbound frames buffered per connection before deliveries are dropped
    #[arg(long, default_value_t = 256, env = "CODEMEET_OUTBOUND_CAPACITY")]
    outbound_capacity: usize,

    /// Largest inbound frame accepted, in bytes
    #[arg(long, default_value_t = 1024 * 1024, env = "CODEMEET_MAX_MESSAGE_BYTES")]
    max_message_bytes: usize,

    /// Document text of a newly created room
    #[arg(long, default_value = DEFAULT_DOCUMENT, env = "CODEMEET_DEFAULT_DOCUMENT")]
    default_document: String,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            bind_addr: args.bind,
            max_members_per_room: args.max_members,
            outbound_capacity: args.outbound_capacity.max(1),
            max_message_bytes: args.max_message_bytes,
            default_document: args.default_document,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());
    info!("Starting codemeet coordinator on {}...", config.bind_addr);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let server = CollabServer::new(config);

        server
            .run_until(listener, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    log::error!("Failed to listen for Ctrl+C: {e}");
                    std::future::pending::<()>().await;
                }
            })
            .await?;

        let stats = server.stats().await;
        info!(
            "Stopped after {} connection(s), {} frame(s) delivered, {} dropped",
            stats.total_connections, stats.messages_delivered, stats.messages_dropped
        );
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    })
}
