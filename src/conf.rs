//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default cratetorrent client id.
pub const CRATETORRENT_CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default cratetorrent client id,
    /// [`CRATETORRENT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *CRATETORRENT_CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// How many peers to connect to right after the first successful
    /// announce, before any session has had a chance to close and be
    /// replaced.
    pub initial_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing at this interval.
    pub announce_interval: Duration,

    /// The base delay for the tracker announce exponential backoff. Doubled
    /// on each consecutive failure up to `tracker_backoff_cap`.
    pub tracker_backoff_base: Duration,

    /// The maximum delay between failed announce retries.
    pub tracker_backoff_cap: Duration,

    /// The HTTP tracker request timeout.
    pub tracker_timeout: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// The max number of block requests a session keeps outstanding with a
    /// single peer at a time.
    pub max_pipeline_len: usize,

    /// How long to wait for a peer's TCP handshake before aborting the
    /// session.
    pub handshake_timeout: Duration,

    /// How long a single block request may remain unanswered before its slot
    /// is reclaimed and the session is closed.
    pub request_timeout: Duration,

    /// How long a session may go without receiving any bytes before it's
    /// considered dead and closed.
    pub peer_idle_timeout: Duration,

    /// How often the coordinator re-ranks peers for choking/unchoking.
    pub choke_interval: Duration,

    /// Every this-many-th choke round is an optimistic unchoke round.
    pub optimistic_choke_ratio: usize,

    /// The number of peers kept unchoked by the tit-for-tat ranking (not
    /// counting the optimistic slot).
    pub unchoke_count: usize,

    /// How often session rate counters are sampled and folded into the
    /// rolling EWMA exposed to choke control.
    pub rate_sample_interval: Duration,

    /// If set, the torrent stops downloading once this many pieces have
    /// completed, even if the torrent is not otherwise finished.
    pub max_pieces: Option<usize>,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            initial_connected_peer_count: 5,
            announce_interval: Duration::from_secs(30),
            tracker_backoff_base: Duration::from_secs(1),
            tracker_backoff_cap: Duration::from_secs(30),
            tracker_timeout: Duration::from_secs(15),
            tracker_error_threshold: 15,
            max_pipeline_len: 5,
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            peer_idle_timeout: Duration::from_secs(120),
            choke_interval: Duration::from_secs(10),
            optimistic_choke_ratio: 3,
            unchoke_count: 4,
            rate_sample_interval: Duration::from_secs(1),
            max_pieces: None,
        }
    }
}
