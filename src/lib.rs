pub mod config;
pub mod error;
pub mod files;
pub mod store;
pub mod transfer;
pub mod webrtc;

pub use config::{get_config_path, get_peerdrop_dir, Config};
pub use error::{Error, Result};
pub use files::{DirectorySink, FileMetadata, FileSink, FileSource, LocalFile, MemoryFile, SharedFile};
pub use store::{AppState, Download, DownloadableFile, Peer, SignalingStatus, StatePatch, Store, Subscription};
pub use transfer::TransferCoordinator;
pub use webrtc::{ManagerHandle, PeerId, ShareManager};
