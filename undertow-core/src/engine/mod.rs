//! Client orchestrator with an actor-based concurrency model.
//!
//! All interaction with the client happens through message passing via the
//! [`ClientHandle`]: the actor task owns every per-torrent scheduler and
//! processes commands sequentially, so there is no shared mutable state to
//! lock. The 20-byte peer id is chosen once when the actor is spawned and is
//! stable across all torrents in that run.
//!
//! # Usage
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::path::Path;
//!
//! use undertow_core::config::UndertowConfig;
//! use undertow_core::engine::spawn_client;
//!
//! let client = spawn_client(UndertowConfig::default());
//! client
//!     .download(Path::new("example.torrent"), Path::new("downloads"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod actor;
mod commands;
mod handle;

pub use actor::spawn_client;
pub use commands::ClientCommand;
pub use handle::ClientHandle;
