use anyhow::{Context, Result};
use clap::Parser;
use rlimit::{Resource, getrlimit, setrlimit};
use std::cmp::min;
use std::env::current_dir;
use std::path::Path;
use std::sync::Arc;
use std::{fmt, fs};
use tokio_util::sync::CancellationToken;

use manager::piece_scheduler::{FirstAvailable, PieceScheduler, PieceSelector, RarestFirst};
use manager::torrent_manager::{TorrentManager, TorrentManagerConfig};
use metadata::metainfo::Metainfo;
use persistence::file_manager::FileManager;
use tracker::TrackerClient;

mod bencoding;
mod manager;
mod metadata;
mod persistence;
mod torrent_protocol;
mod tracker;
mod util;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

#[derive(Parser, Debug)]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_COMMIT"), ")"), about, long_about = None)]
struct Args {
    /// Path to the .torrent file (single file torrents only)
    #[arg(short, long, env)]
    torrent_file: String,

    /// Optional base path where the file is downloaded (directory will be created if it does not exist)
    #[arg(short, long, env, default_value_t = current_dir().map(|d| d.to_string_lossy().to_string()).unwrap_or(".".to_string()))]
    base_path: String,

    /// Optional listening port for incoming peers
    #[arg(short, long, env, default_value_t = 6881)]
    port: u16,

    /// Maximum number of connected peers
    #[arg(short, long, env, default_value_t = 30, value_parser = clap::value_parser!(u16).range(1..=50))]
    max_peers: u16,

    /// Number of concurrent connection attempts
    #[arg(short, long, env, default_value_t = 10)]
    connectors: u16,

    /// Piece selection strategy
    #[arg(short, long, env, default_value_t = Strategy::FirstAvailable)]
    strategy: Strategy,

    /// Optional log level
    #[arg(short, long, env, default_value_t = LogLevels::Info)]
    log_level: LogLevels,
}

#[derive(clap::ValueEnum, Debug, Clone)]
enum Strategy {
    FirstAvailable,
    RarestFirst,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Strategy::FirstAvailable => write!(f, "first-available"),
            Strategy::RarestFirst => write!(f, "rarest-first"),
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone)]
enum LogLevels {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevels {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

const MAX_OPENED_FILES: u64 = 16384;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // init logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or("LOG_LEVEL", args.log_level.to_string()),
    );

    // bump ulimit if needed, one socket per peer
    match getrlimit(Resource::NOFILE) {
        Ok((soft_limit, hard_limit)) if soft_limit < MAX_OPENED_FILES => {
            if let Err(e) = setrlimit(
                Resource::NOFILE,
                min(hard_limit, MAX_OPENED_FILES),
                hard_limit,
            ) {
                log::warn!("could not increase NOFILE ulimit: {e}");
            }
        }
        Ok(_) => {}
        Err(e) => log::warn!("could not read current NOFILE ulimit: {e}"),
    }

    // read torrent file
    let contents = fs::read(&args.torrent_file)
        .with_context(|| format!("could not read .torrent file {}", args.torrent_file))?;
    let torrent_content =
        bencoding::Value::new(&contents).context("the .torrent file is not valid bencode")?;
    let metainfo = Arc::new(
        Metainfo::new(&torrent_content, &contents)
            .context("the .torrent file is invalid: could not parse metainfo")?,
    );
    log::info!("torrent file metainfo:\n{metainfo}");

    // check what is already on disk
    let mut file_manager = FileManager::new(
        Path::new(&args.base_path),
        &metainfo.name,
        metainfo.length,
        metainfo.piece_length,
        metainfo.pieces.clone(),
    )?;
    let already_completed = file_manager.verify_existing_pieces();

    let selector: Box<dyn PieceSelector> = match args.strategy {
        Strategy::FirstAvailable => Box::new(FirstAvailable),
        Strategy::RarestFirst => Box::new(RarestFirst),
    };
    let scheduler = Arc::new(PieceScheduler::new(
        metainfo.piece_length,
        metainfo.length,
        already_completed,
        selector,
        Box::new(file_manager),
    ));

    let peer_id = util::generate_peer_id();
    log::debug!("own peer id: {}", util::force_string(&peer_id));
    let tracker_client =
        TrackerClient::new(metainfo.announce.clone(), metainfo.info_hash, peer_id, args.port)?;

    let config = TorrentManagerConfig {
        max_peers: args.max_peers as usize,
        connectors: args.connectors.max(1) as usize,
        listen_port: args.port,
        ..Default::default()
    };
    let manager = TorrentManager::new(config, metainfo, peer_id, scheduler, tracker_client);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log::info!("interrupt received, stopping...");
                    cancel.cancel();
                }
                Err(e) => log::warn!("could not listen for interrupt signal: {e}"),
            }
        }
    });

    manager.run(cancel).await
}
