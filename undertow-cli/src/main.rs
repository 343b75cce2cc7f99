//! undertow CLI - thin driver over the client orchestrator.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use undertow_core::config::UndertowConfig;
use undertow_core::engine::spawn_client;
use undertow_core::torrent::{TorrentProgress, TorrentState};
use undertow_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "undertow")]
#[command(about = "A download-only BitTorrent client")]
struct Cli {
    /// Path to the .torrent metainfo file
    torrent: PathBuf,

    /// Destination directory for the download
    #[arg(short, long, default_value = ".")]
    dest: PathBuf,

    /// Port advertised to the tracker
    #[arg(short, long)]
    port: Option<u16>,

    /// Console log level
    #[arg(long, default_value_t = CliLogLevel::Warn)]
    log_level: CliLogLevel,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level())?;

    let mut config = UndertowConfig::from_env();
    if let Some(port) = cli.port {
        config.network.announce_port = port;
    }

    let client = spawn_client(config);
    client.download(&cli.torrent, &cli.dest).await?;

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                eprintln!("stopping...");
                client.stop().await?;
                println!("stopped; partial files were kept");
                return Ok(());
            }
            _ = ticker.tick() => {
                let torrents = client.progress().await?;
                let Some(progress) = torrents.first() else { continue };

                match &progress.state {
                    TorrentState::Running => print_progress(progress),
                    TorrentState::Completed => {
                        println!();
                        println!("'{}' completed ({} bytes)", progress.name, progress.bytes_total);
                        return Ok(());
                    }
                    TorrentState::Stopped => {
                        println!();
                        println!("stopped; partial files were kept");
                        return Ok(());
                    }
                    TorrentState::Failed { reason } => {
                        println!();
                        eprintln!("download aborted: {reason}");
                        std::process::exit(1);
                    }
                }
            }
        }
    }
}

fn print_progress(progress: &TorrentProgress) {
    let percent = if progress.bytes_total > 0 {
        progress.bytes_complete as f64 / progress.bytes_total as f64 * 100.0
    } else {
        0.0
    };
    print!(
        "\r{}: {percent:5.1}% ({}/{} pieces) | {} peers | {}/s | announce in {}s   ",
        progress.name,
        progress.complete_pieces,
        progress.total_pieces,
        progress.connected_peers,
        human_bytes(progress.download_rate),
        progress.next_announce_in.as_secs(),
    );
    let _ = std::io::stdout().flush();
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
