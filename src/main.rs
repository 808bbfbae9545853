//! The leechtorrent CLI: downloads a single torrent, leeching only — no
//! uploads to strangers, no resume, no magnet links.
//!
//! Usage: `leechtorrent <metainfo-path> [output-path] [max-pieces]`

use std::{env, fs, path::PathBuf, process};

use leechtorrent::{
    conf::Conf,
    engine::{Engine, EngineAlert, Progress},
    error::Error,
    metainfo::Metainfo,
    TorrentId,
};

/// The CLI only ever runs one torrent per process, so any id will do.
const TORRENT_ID: TorrentId = 1;

#[tokio::main]
async fn main() {
    env_logger::init();
    let code = run().await;
    process::exit(code);
}

async fn run() -> i32 {
    let mut args = env::args().skip(1);
    let metainfo_path = match args.next() {
        Some(path) => path,
        None => {
            eprintln!(
                "usage: leechtorrent <metainfo-path> [output-path] [max-pieces]"
            );
            return 1;
        }
    };
    let output_path = args.next();
    let max_pieces = args.next().and_then(|s| s.parse::<usize>().ok());

    let bytes = match fs::read(&metainfo_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!(
                "could not read metainfo file {}: {}",
                metainfo_path, e
            );
            return 4;
        }
    };

    let metainfo = match Metainfo::from_bytes(&bytes) {
        Ok(metainfo) => metainfo,
        Err(e) => {
            eprintln!("invalid metainfo file {}: {}", metainfo_path, e);
            return 1;
        }
    };

    let download_dir = output_path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("downloads"));

    let mut conf = Conf::new(download_dir);
    conf.torrent.max_pieces = max_pieces;

    let (handle, mut alert_port) = match Engine::spawn(conf) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("could not start engine: {}", e);
            return 4;
        }
    };

    if let Err(e) = handle.create_torrent(TORRENT_ID, metainfo) {
        eprintln!("could not start torrent: {}", e);
        return 4;
    }

    let mut downloaded = 0u64;
    let mut wasted = 0u64;
    let mut code = 0;

    while let Some(alert) = alert_port.recv().await {
        match alert {
            EngineAlert::Progress(Progress::PieceVerified {
                downloaded: d,
                ..
            }) => {
                downloaded = d;
            }
            EngineAlert::Progress(Progress::PieceFailed { wasted: w }) => {
                wasted += w;
            }
            EngineAlert::Progress(Progress::Stats {
                pieces_done,
                pieces_total,
                download_rate,
                peer_count,
            }) => {
                print_progress(
                    pieces_done,
                    pieces_total,
                    download_rate,
                    peer_count,
                );
            }
            EngineAlert::Complete(_) => {
                println!();
                println!(
                    "torrent complete: {} bytes downloaded, {} bytes wasted \
                    to failed verification",
                    downloaded, wasted
                );
                break;
            }
            EngineAlert::Error(_, e) => {
                println!();
                eprintln!("torrent stopped: {}", e);
                eprintln!(
                    "{} bytes downloaded, {} bytes wasted to failed \
                    verification",
                    downloaded, wasted
                );
                code = exit_code_for(&e);
                break;
            }
        }
    }

    let _ = handle.shutdown();
    code
}

fn print_progress(
    pieces_done: usize,
    pieces_total: usize,
    download_rate: f64,
    peer_count: usize,
) {
    print!(
        "\r{}/{} pieces complete, {:.1} KiB/s, {} peers",
        pieces_done,
        pieces_total,
        download_rate / 1024.0,
        peer_count
    );
    use std::io::Write;
    let _ = std::io::stdout().flush();
}

fn exit_code_for(e: &Error) -> i32 {
    match e {
        Error::Metainfo(_) => 1,
        Error::Tracker(_) => 2,
        Error::SwarmExhausted => 3,
        _ => 4,
    }
}
