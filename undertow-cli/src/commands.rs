//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use undertow_core::config::UndertowConfig;
use undertow_core::storage::FileStorage;
use undertow_core::torrent::parsing::BencodeTorrentParser;
use undertow_core::torrent::tracker::{
    NetworkTrackerFactory, SystemClock, TrackerContext, TrackerManager,
};
use undertow_core::torrent::{
    PeerId, PeerSession, PieceStore, SessionContext, TorrentDescriptor, TorrentParser,
};

use crate::swarm::{SwarmSettings, run_swarm};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Download a torrent into a directory
    Download {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Directory to write files under
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Maximum concurrent peer connections
        #[arg(long)]
        max_peers: Option<usize>,
    },
    /// Show the contents of a .torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of whichever command fails
pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Download {
            torrent,
            output,
            max_peers,
        } => download(&torrent, output, max_peers).await,
        Commands::Info { torrent } => show_info(&torrent).await,
    }
}

async fn load_descriptor(path: &Path) -> Result<TorrentDescriptor> {
    BencodeTorrentParser::new()
        .parse_torrent_file(path)
        .await
        .with_context(|| format!("Failed to load {}", path.display()))
}

/// Print the decoded torrent metadata
///
/// # Errors
/// - File could not be read or is not a valid torrent
pub async fn show_info(torrent: &Path) -> Result<()> {
    let descriptor = load_descriptor(torrent).await?;

    println!("Name:         {}", descriptor.name);
    println!("Info hash:    {}", descriptor.info_hash);
    println!(
        "Pieces:       {} x {} bytes",
        descriptor.piece_count(),
        descriptor.piece_length
    );
    println!("Total size:   {} bytes", descriptor.total_size);

    println!("Files:");
    for file in &descriptor.files {
        println!("  {} ({} bytes)", file.path.join("/"), file.length);
    }

    println!("Trackers:");
    for url in &descriptor.announce_urls {
        println!("  {url}");
    }
    Ok(())
}

/// Download a torrent from its swarm
///
/// # Errors
/// - Torrent could not be loaded or storage prepared
/// - Every tracker failed before the download completed
pub async fn download(
    torrent: &Path,
    output: Option<PathBuf>,
    max_peers: Option<usize>,
) -> Result<()> {
    let mut config = UndertowConfig::from_env();
    if let Some(dir) = output {
        config.storage.download_dir = dir;
    }
    if let Some(count) = max_peers {
        config.peer.max_peer_connections = count.max(1);
    }

    let descriptor = load_descriptor(torrent).await?;
    tracing::info!(
        "Download: {} ({} pieces, {} bytes)",
        descriptor.name,
        descriptor.piece_count(),
        descriptor.total_size
    );

    let storage = FileStorage::new(config.storage.download_dir.clone(), &descriptor.files)?;
    storage
        .prepare()
        .await
        .context("Failed to prepare download directory")?;
    let store = Arc::new(PieceStore::new(&descriptor, Arc::new(storage))?);

    let peer_id = PeerId::generate();
    let factory = NetworkTrackerFactory::new(TrackerContext {
        info_hash: descriptor.info_hash,
        peer_id,
        port: config.peer.listen_port,
        total_size: descriptor.total_size,
        progress: store.clone(),
        config: config.tracker.clone(),
        clock: Arc::new(SystemClock),
    });
    let mut trackers = TrackerManager::start(
        &descriptor.announce_urls,
        &factory,
        config.tracker.stop_poll_interval,
    )?;

    let session_context = SessionContext {
        info_hash: descriptor.info_hash,
        peer_id,
        allocator: store.clone(),
        config: config.peer.clone(),
    };

    let settings = SwarmSettings::from_config(&config);
    run_swarm(&mut trackers, &store, &settings, move |address| {
        let context = session_context.clone();
        async move {
            let mut session = PeerSession::connect(address, context).await?;
            session.run().await
        }
    })
    .await?;

    println!(
        "Downloaded {} ({} bytes) to {}",
        descriptor.name,
        descriptor.total_size,
        config.storage.download_dir.display()
    );
    Ok(())
}
