use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peerdrop::webrtc::{RtcConnectionFactory, WsSignaling};
use peerdrop::{
    AppState, Config, DirectorySink, DownloadableFile, LocalFile, ManagerHandle, PeerId,
    ShareManager, Store,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "peerdrop")]
#[command(about = "Peer-to-peer file sharing over WebRTC data channels", long_about = None)]
struct Cli {
    /// Relay URL (overrides the config file)
    #[arg(long, global = true)]
    relay: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Share files with everyone in the room until Ctrl-C
    Share {
        /// Files to share
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Download files advertised by peers in the room
    Receive {
        /// Only download files with this name
        #[arg(long)]
        name: Option<String>,
    },
    /// Show the config file location and contents
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging - default to info, override with RUST_LOG=peerdrop=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("peerdrop=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Share { files } => {
            let manager = start_manager(&config, cli.relay).await?;
            let handle = manager.handle();

            for path in files {
                let file = LocalFile::open(&path)
                    .await
                    .with_context(|| format!("Cannot share {}", path.display()))?;
                handle.add_file(file)?;
            }

            let states = watch_store(handle.store());
            tokio::spawn(render_states(states));

            run_until_ctrl_c(manager, handle).await?;
        }
        Commands::Receive { name } => {
            let manager = start_manager(&config, cli.relay).await?;
            let handle = manager.handle();
            println!("Downloads: {}", config.download_dir().display());

            tokio::spawn(render_states(watch_store(handle.store())));
            tokio::spawn(receive_files(
                handle.clone(),
                watch_store(handle.store()),
                name,
            ));

            run_until_ctrl_c(manager, handle).await?;
        }
        Commands::Config => {
            println!("Config file: {}", peerdrop::get_config_path().display());
            println!();
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn start_manager(config: &Config, relay: Option<String>) -> Result<ShareManager> {
    let url = relay.unwrap_or_else(|| config.signaling.url.clone());
    let (transport, events) = WsSignaling::connect(&url).await?;
    let factory = RtcConnectionFactory::new(config.webrtc.stun_servers.clone())?;
    let sink = DirectorySink::new(config.download_dir());

    Ok(ShareManager::new(
        Arc::new(factory),
        Arc::new(transport),
        events,
        Arc::new(sink),
        Store::default(),
    )
    .with_chunk_size(config.chunk_size())
    .with_channel_label(config.webrtc.channel_label.clone()))
}

async fn run_until_ctrl_c(mut manager: ShareManager, handle: ManagerHandle) -> Result<()> {
    let mut task = tokio::spawn(async move { manager.run().await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            handle.shutdown();
            task.await.context("Share manager task panicked")?
        }
        result = &mut task => result.context("Share manager task panicked")?,
    }
}

/// Mirror store snapshots into a watch channel
fn watch_store(store: &Store) -> watch::Receiver<AppState> {
    let (tx, rx) = watch::channel(store.get_state());
    // The subscription lives as long as the store
    let _subscription = store.subscribe(move |state| {
        let _ = tx.send(state.clone());
    });
    rx
}

/// Log the interesting differences between consecutive snapshots
async fn render_states(mut states: watch::Receiver<AppState>) {
    let mut prev = states.borrow().clone();
    while states.changed().await.is_ok() {
        let state = states.borrow_and_update().clone();

        if state.signaling != prev.signaling {
            info!("Relay: {:?}", state.signaling);
        }
        let open = state.peers.iter().filter(|p| p.negotiation.is_connected()).count();
        let prev_open = prev.peers.iter().filter(|p| p.negotiation.is_connected()).count();
        if state.peers.len() != prev.peers.len() || open != prev_open {
            info!("Peers: {} ({} connected)", state.peers.len(), open);
        }
        if state.downloadable_files.len() != prev.downloadable_files.len() {
            info!("Available files: {}", state.downloadable_files.len());
            for file in &state.downloadable_files {
                info!(
                    "  {} ({} bytes) from {}",
                    file.name(),
                    file.size(),
                    file.source_peer.short()
                );
            }
        }
        match (&prev.current_download, &state.current_download) {
            (_, Some(d)) => {
                let step = |p: f64| (p * 10.0).floor() as u32;
                let before = prev.current_download.as_ref().map(|d| step(d.progress()));
                if before != Some(step(d.progress())) {
                    info!("{}: {:.0}%", d.file.name(), d.progress() * 100.0);
                }
            }
            (Some(d), None) => info!("{}: finished", d.file.name()),
            (None, None) => {}
        }

        prev = state;
    }
}

/// Picks the next advertised file to fetch. Each `(peer, name)` pair is
/// requested once while it stays advertised.
struct AutoReceiver {
    name: Option<String>,
    requested: HashSet<(PeerId, String)>,
}

impl AutoReceiver {
    fn new(name: Option<String>) -> Self {
        Self {
            name,
            requested: HashSet::new(),
        }
    }

    fn next(&mut self, state: &AppState) -> Option<DownloadableFile> {
        // Files that disappeared (peer gone, withdrawn) may be fetched again if re-announced
        self.requested.retain(|(peer, name)| {
            state
                .downloadable_files
                .iter()
                .any(|f| &f.source_peer == peer && f.name() == name)
        });
        if state.current_download.is_some() {
            return None;
        }

        let file = state.downloadable_files.iter().find(|f| {
            self.name.as_deref().map_or(true, |n| f.name() == n)
                && !self.requested.contains(&(f.source_peer.clone(), f.name().to_string()))
        })?;
        self.requested
            .insert((file.source_peer.clone(), file.name().to_string()));
        Some(file.clone())
    }

    /// The request never went out; allow another attempt
    fn failed(&mut self, file: &DownloadableFile) {
        self.requested
            .remove(&(file.source_peer.clone(), file.name().to_string()));
    }
}

/// Request advertised files one at a time
async fn receive_files(
    handle: ManagerHandle,
    mut states: watch::Receiver<AppState>,
    name: Option<String>,
) {
    let mut receiver = AutoReceiver::new(name);
    while states.changed().await.is_ok() {
        let state = states.borrow_and_update().clone();
        let Some(file) = receiver.next(&state) else {
            continue;
        };

        if let Err(e) = handle.download(&file.source_peer, file.name()).await {
            warn!("Could not download {}: {}", file.name(), e);
            receiver.failed(&file);
        }
    }
}
