//! The torrent coordinator.
//!
//! Owns the piece picker and the tracker client, spawns and replaces peer
//! sessions, and runs the tit-for-tat choke round that decides which
//! sessions get unchoked. This is the one task in the engine with a global
//! view of the swarm; everything else (peer sessions, the disk task) only
//! sees its own slice of the torrent.

use std::{cmp::Ordering, collections::HashMap, net::SocketAddr, sync::Arc};

use {
    futures::{select, FutureExt, StreamExt},
    rand::seq::IteratorRandom,
    tokio::{sync::mpsc, sync::RwLock, time},
};

use crate::{
    conf::TorrentConf,
    disk::{BatchWrite, DiskHandle, TorrentAlert, TorrentAlertReceiver},
    error::*,
    metainfo::Metainfo,
    peer::{self, PeerSession, SharedSessionInfo},
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    tracker::{self, Announce, Event},
    PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// Shared, read-only information about a torrent that the coordinator hands
/// out (behind an `Arc`) to every peer session it spawns.
pub(crate) struct SharedStatus {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub storage: StorageInfo,
    pub conf: TorrentConf,
}

/// A spawned peer session as tracked by the coordinator: its command
/// channel, for issuing choke/unchoke/shutdown, and its shared live info,
/// for choke ranking.
struct Peer {
    cmd_chan: peer::Sender,
    info: SharedSessionInfo,
}

/// Progress events the coordinator reports upward to the engine, which
/// turns them into CLI-facing output.
pub enum Progress {
    /// A piece just passed verification.
    PieceVerified { downloaded: u64, total: u64 },
    /// A piece failed its hash check and was discarded; `wasted` is the
    /// number of bytes that had to be re-downloaded as a result.
    PieceFailed { wasted: u64 },
    /// A periodic swarm-wide snapshot, taken once per choke round, for the
    /// CLI's progress line.
    Stats {
        pieces_done: usize,
        pieces_total: usize,
        /// The sum of every connected peer's download rate, in bytes/sec.
        download_rate: f64,
        peer_count: usize,
    },
}

/// Runs a single torrent: announce, connect, download, verify, reciprocate.
pub(crate) struct Torrent {
    torrent: Arc<SharedStatus>,
    metainfo: Metainfo,
    piece_picker: Arc<RwLock<PiecePicker>>,
    disk: DiskHandle,
    peers: HashMap<SocketAddr, Peer>,
    /// Peers the tracker has told us about but that we haven't connected to
    /// (or have disconnected from and may retry).
    known_peers: Vec<SocketAddr>,
    choke_round: usize,
    uploaded: u64,
    downloaded: u64,
    progress_chan: mpsc::UnboundedSender<Progress>,
}

impl Torrent {
    pub(crate) fn new(
        id: TorrentId,
        client_id: PeerId,
        metainfo: Metainfo,
        conf: TorrentConf,
        disk: DiskHandle,
        progress_chan: mpsc::UnboundedSender<Progress>,
    ) -> Self {
        let storage = StorageInfo::new(&metainfo, conf.download_dir.clone());
        let piece_count = storage.piece_count;
        let torrent = Arc::new(SharedStatus {
            id,
            info_hash: metainfo.info_hash,
            client_id,
            storage,
            conf,
        });
        Self {
            torrent,
            metainfo,
            piece_picker: Arc::new(RwLock::new(PiecePicker::new(piece_count))),
            disk,
            peers: HashMap::new(),
            known_peers: Vec::new(),
            choke_round: 0,
            uploaded: 0,
            downloaded: 0,
            progress_chan,
        }
    }

    /// Runs the torrent to completion (every piece verified), or until the
    /// swarm is exhausted and no peers remain to try.
    pub(crate) async fn start(
        &mut self,
        alert_port: TorrentAlertReceiver,
    ) -> Result<()> {
        let mut alert_port = alert_port.fuse();
        let (closed_chan, closed_port) = mpsc::unbounded_channel();
        let mut closed_port = closed_port.fuse();

        let announce_interval = self.announce(Some(Event::Started)).await?;
        self.connect_initial_peers(&closed_chan);

        let mut announce_ticker = time::interval(announce_interval);
        let mut choke_ticker = time::interval(self.torrent.conf.choke_interval);

        let mut stop_cause: Result<()> = Ok(());
        loop {
            let (have_count, is_complete) = {
                let picker = self.piece_picker.read().await;
                (picker.have_count(), picker.is_complete())
            };
            let reached_piece_limit = self
                .torrent
                .conf
                .max_pieces
                .map_or(false, |limit| have_count >= limit);
            if is_complete {
                log::info!("Torrent {} complete", self.torrent.id);
                break;
            }
            if reached_piece_limit {
                log::info!(
                    "Torrent {} reached the configured piece limit, stopping",
                    self.torrent.id
                );
                break;
            }
            if self.peers.is_empty() && self.known_peers.is_empty() {
                log::warn!(
                    "Torrent {} has no peers left and is incomplete",
                    self.torrent.id
                );
                stop_cause = Err(Error::SwarmExhausted);
                break;
            }

            select! {
                alert = alert_port.select_next_some() => {
                    match alert {
                        TorrentAlert::BatchWrite(Ok(batch)) => {
                            self.handle_batch_write(batch).await;
                        }
                        TorrentAlert::BatchWrite(Err(e)) => {
                            log::warn!("Disk write error: {}", e);
                        }
                    }
                }
                addr = closed_port.select_next_some() => {
                    self.peers.remove(&addr);
                    log::info!("Peer {} session closed", addr);
                    self.connect_replacement_peer(&closed_chan);
                }
                _ = choke_ticker.tick().fuse() => {
                    self.run_choke_round().await;
                }
                _ = announce_ticker.tick().fuse() => {
                    if let Err(e) = self.announce(None).await {
                        log::warn!("Re-announce failed: {}", e);
                    }
                    self.connect_replacement_peer(&closed_chan);
                }
            }
        }

        if self.piece_picker.read().await.is_complete() {
            let _ = self.announce(Some(Event::Completed)).await;
        } else if stop_cause.is_ok() {
            // reached the configured piece limit; not a real completion, but
            // not an error either, so let the tracker know we're leaving
            let _ = self.announce(Some(Event::Stopped)).await;
        }
        for peer in self.peers.values() {
            let _ = peer.cmd_chan.send(peer::Command::Shutdown);
        }
        // the disk task is shared across every torrent the engine runs, so
        // it isn't ours to shut down; the engine does that once it's done
        // running torrents.

        stop_cause
    }

    /// Issues one tracker announce. On failure, retries with exponential
    /// backoff up to `tracker_error_threshold` times if we don't yet have
    /// any known peers (the very first announce); a failing re-announce
    /// with peers already in hand is allowed to fail once and is reported
    /// to the caller instead, since the swarm can keep running without it.
    async fn announce(
        &mut self,
        event: Option<Event>,
    ) -> Result<std::time::Duration> {
        let has_peers = !self.known_peers.is_empty() || !self.peers.is_empty();
        let mut backoff = self.torrent.conf.tracker_backoff_base;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let params = Announce {
                info_hash: self.torrent.info_hash,
                peer_id: self.torrent.client_id,
                port: 6881,
                uploaded: self.uploaded,
                downloaded: self.downloaded,
                left: self.left(),
                event,
            };
            match tracker::announce(
                &self.metainfo.announce,
                &params,
                self.torrent.conf.tracker_timeout,
            )
            .await
            {
                Ok(resp) => {
                    log::info!(
                        "Tracker returned {} peers for torrent {}",
                        resp.peers.len(),
                        self.torrent.id
                    );
                    self.merge_peers(resp.peers);
                    let interval = if resp.interval.as_secs() == 0 {
                        self.torrent.conf.announce_interval
                    } else {
                        resp.interval
                    };
                    return Ok(interval);
                }
                Err(e) => {
                    log::warn!(
                        "Tracker announce attempt {} failed: {}",
                        attempt,
                        e
                    );
                    if has_peers
                        || attempt >= self.torrent.conf.tracker_error_threshold
                    {
                        return Err(e);
                    }
                    time::delay_for(backoff).await;
                    backoff = (backoff * 2)
                        .min(self.torrent.conf.tracker_backoff_cap);
                }
            }
        }
    }

    /// The number of bytes left to download, per the tracker announce
    /// contract: the torrent's total size minus what's already verified.
    fn left(&self) -> u64 {
        self.torrent.storage.download_len.saturating_sub(self.downloaded)
    }

    /// Adds any tracker-supplied peer we don't already know about or aren't
    /// already connected to.
    fn merge_peers(&mut self, peers: Vec<SocketAddr>) {
        for addr in peers {
            if !self.peers.contains_key(&addr)
                && !self.known_peers.contains(&addr)
            {
                self.known_peers.push(addr);
            }
        }
    }

    /// Connects up to `initial_connected_peer_count` peers right after the
    /// first successful announce.
    fn connect_initial_peers(
        &mut self,
        closed_chan: &mpsc::UnboundedSender<SocketAddr>,
    ) {
        let count = self.torrent.conf.initial_connected_peer_count;
        for _ in 0..count {
            if !self.connect_one_peer(closed_chan) {
                break;
            }
        }
    }

    /// Connects one more peer from `known_peers`, if the connected peer
    /// count allows it and there's a candidate left to try. This is also
    /// how a closed session (or a failed re-announce) gets backfilled.
    fn connect_replacement_peer(
        &mut self,
        closed_chan: &mpsc::UnboundedSender<SocketAddr>,
    ) {
        if self.peers.len() >= self.torrent.conf.max_connected_peer_count {
            return;
        }
        self.connect_one_peer(closed_chan);
    }

    fn connect_one_peer(
        &mut self,
        closed_chan: &mpsc::UnboundedSender<SocketAddr>,
    ) -> bool {
        let addr = match self.known_peers.pop() {
            Some(addr) => addr,
            None => return false,
        };
        log::info!("Connecting to peer {}", addr);
        let (mut session, cmd_chan, info) = PeerSession::outbound(
            Arc::clone(&self.torrent),
            Arc::clone(&self.piece_picker),
            self.disk.clone(),
            addr,
        );
        let closed_chan = closed_chan.clone();
        tokio::task::spawn(async move {
            if let Err(e) = session.start().await {
                log::warn!("Peer {} session ended with error: {}", addr, e);
            }
            // any piece this session claimed but didn't finish must go back
            // to `Missing`, or it would be unobtainable for the rest of the
            // torrent's life
            session.release_claimed_pieces().await;
            let _ = closed_chan.send(addr);
        });
        self.peers.insert(addr, Peer { cmd_chan, info });
        true
    }

    /// Handles the outcome of writing a just-completed piece to disk:
    /// broadcasts `have` on success, resets the piece picker on a failed
    /// hash check so the piece is requested anew, possibly from a
    /// different peer.
    async fn handle_batch_write(&mut self, batch: BatchWrite) {
        match batch.is_piece_valid {
            Some(true) => {
                let piece_len: u64 =
                    batch.blocks.iter().map(|b| b.len as u64).sum();
                self.downloaded += piece_len;
                self.piece_picker
                    .write()
                    .await
                    .received_piece(batch.piece_index);
                self.broadcast_have(batch.piece_index);
                let _ = self.progress_chan.send(Progress::PieceVerified {
                    downloaded: self.downloaded,
                    total: self.torrent.storage.download_len,
                });
            }
            Some(false) => {
                log::warn!(
                    "Piece {} failed verification, resetting",
                    batch.piece_index
                );
                self.piece_picker
                    .write()
                    .await
                    .reset_piece(batch.piece_index);
                let wasted = self
                    .torrent
                    .storage
                    .piece_len(batch.piece_index)
                    .unwrap_or(0) as u64;
                let _ =
                    self.progress_chan.send(Progress::PieceFailed { wasted });
            }
            None => {}
        }
    }

    /// Tells every connected peer session that the piece is complete, so it
    /// can advertise a `have` message and recompute its interest.
    fn broadcast_have(&self, index: PieceIndex) {
        for (addr, peer) in &self.peers {
            if let Err(e) =
                peer.cmd_chan.send(peer::Command::Have(index))
            {
                log::warn!("Failed to notify peer {} of have: {:?}", addr, e);
            }
        }
    }

    /// Every `choke_interval`, ranks interested peers by their download
    /// rate and unchokes the top `unchoke_count`; every
    /// `optimistic_choke_ratio`-th round, one of the would-be-choked slots
    /// is instead given to a uniformly random choked, interested peer.
    async fn run_choke_round(&mut self) {
        self.choke_round += 1;

        let mut sessions = Vec::with_capacity(self.peers.len());
        for (&addr, peer) in self.peers.iter() {
            let info = *peer.info.read().await;
            sessions.push((addr, info));
        }

        let aggregate_download_rate: f64 =
            sessions.iter().map(|(_, info)| info.download_rate).sum();
        let pieces_done = self.piece_picker.read().await.have_count();
        let _ = self.progress_chan.send(Progress::Stats {
            pieces_done,
            pieces_total: self.torrent.storage.piece_count,
            download_rate: aggregate_download_rate,
            peer_count: self.peers.len(),
        });

        let mut interested: Vec<_> = sessions
            .into_iter()
            .filter(|(_, info)| info.is_peer_interested)
            .collect();
        interested.sort_by(|a, b| {
            b.1.download_rate
                .partial_cmp(&a.1.download_rate)
                .unwrap_or(Ordering::Equal)
        });

        let unchoke_count = self.torrent.conf.unchoke_count;
        let mut to_unchoke: Vec<SocketAddr> = interested
            .iter()
            .take(unchoke_count)
            .map(|(addr, _)| *addr)
            .collect();

        let is_optimistic_round =
            self.choke_round % self.torrent.conf.optimistic_choke_ratio == 0;
        if is_optimistic_round && interested.len() > unchoke_count {
            to_unchoke.pop();
            let candidate = interested
                .iter()
                .skip(unchoke_count)
                .filter(|(_, info)| info.is_peer_choked)
                .map(|(addr, _)| *addr)
                .choose(&mut rand::thread_rng());
            if let Some(addr) = candidate {
                log::debug!("Optimistically unchoking {}", addr);
                to_unchoke.push(addr);
            }
        }

        for (&addr, peer) in self.peers.iter() {
            let cmd = if to_unchoke.contains(&addr) {
                peer::Command::Unchoke
            } else {
                peer::Command::Choke
            };
            if let Err(e) = peer.cmd_chan.send(cmd) {
                log::warn!(
                    "Failed to send choke command to {}: {:?}",
                    addr,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(interested: bool, choked: bool, rate: f64) -> peer::SessionInfo {
        peer::SessionInfo {
            is_peer_interested: interested,
            is_peer_choked: choked,
            download_rate: rate,
        }
    }

    #[test]
    fn ranks_interested_peers_by_download_rate() {
        let mut sessions = vec![
            ("a", info(true, true, 100.0)),
            ("b", info(true, true, 50.0)),
            ("c", info(true, true, 200.0)),
            ("d", info(false, true, 300.0)),
        ];
        sessions.sort_by(|a, b| {
            b.1.download_rate
                .partial_cmp(&a.1.download_rate)
                .unwrap_or(Ordering::Equal)
        });
        let interested: Vec<_> = sessions
            .into_iter()
            .filter(|(_, i)| i.is_peer_interested)
            .map(|(name, _)| name)
            .collect();
        assert_eq!(interested, vec!["c", "a", "b"]);
    }
}
