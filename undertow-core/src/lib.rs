//! Undertow Core - a download-only BitTorrent client engine
//!
//! This crate provides the building blocks of the download pipeline:
//! metainfo parsing, the piece/block inventory, the peer wire protocol,
//! tracker announces, swarm scheduling, and the on-disk piece writer.

#![deny(missing_docs)]
#![deny(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]

pub mod config;
pub mod engine;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::UndertowConfig;
pub use engine::{ClientHandle, spawn_client};
pub use storage::{PieceWriter, StorageError};
pub use torrent::{InfoHash, Metainfo, TorrentError, TorrentProgress, TorrentState};
pub use tracing_setup::{CliLogLevel, init_tracing};

/// Errors that can bubble up from any undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    /// Torrent-related errors (parsing, tracker, peers, verification)
    #[error("torrent error: {0}")]
    Torrent(#[from] TorrentError),

    /// Storage layer errors (file I/O, finalization)
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Standard I/O errors from filesystem operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using UndertowError as the error type.
pub type Result<T> = std::result::Result<T, UndertowError>;
