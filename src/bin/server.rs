// ABOUTME: SyncSong server binary
// ABOUTME: Standalone lobby server for synchronized listening sessions

use clap::Parser;
use syncsong::server::{ServerArgs, SyncSongServer};

#[derive(Parser, Debug)]
#[command(name = "syncsong-server")]
#[command(author, version, about = "Synchronized listening session server", long_about = None)]
struct Args {
    #[command(flatten)]
    server: ServerArgs,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Initialize tracing
    args.server.init_tracing();

    // Log startup info
    args.server.log_startup_info();

    // Create and run server
    let server = SyncSongServer::with_config(args.server.build_config());

    tracing::info!("Press Ctrl+C to stop");

    server.run().await
}
