//! The top-level engine: the actor that owns the disk task and spawns a
//! coordinator task per torrent, reporting progress and completion back on
//! a single alert stream.

use std::collections::HashMap;

use futures::{select, FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot};

use crate::{
    conf::Conf,
    disk::{self, DiskHandle, TorrentAlertReceiver},
    error::*,
    metainfo::Metainfo,
    storage_info::StorageInfo,
    torrent::Torrent,
    TorrentId,
};

/// Re-exported so callers outside the crate can match on the progress
/// events carried by [`EngineAlert::Progress`] without reaching into the
/// (private) `torrent` module directly.
pub use crate::torrent::Progress;

/// Alerts the engine reports to whoever is driving it.
pub enum EngineAlert {
    /// A piece was verified; carries the running download total.
    Progress(Progress),
    /// A torrent finished downloading and verifying every piece.
    Complete(TorrentId),
    /// A torrent stopped before completing, with the error that ended it.
    Error(TorrentId, Error),
}

pub type AlertReceiver = mpsc::UnboundedReceiver<EngineAlert>;

/// Commands sent to the engine task.
enum Command {
    /// Allocates a torrent's files and starts its coordinator task.
    CreateTorrent { id: TorrentId, metainfo: Metainfo },
    /// Stops the disk task and ends the engine's event loop. In-flight
    /// torrent tasks are not waited on.
    Shutdown,
}

/// A cloneable handle for driving a running [`Engine`].
#[derive(Clone)]
pub struct EngineHandle {
    cmd_chan: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    /// Registers a new torrent with the engine: allocates its files on
    /// disk and starts its coordinator task once allocation succeeds.
    /// Failures are reported on the engine's alert stream rather than
    /// returned here, since allocation happens asynchronously on the disk
    /// task.
    pub fn create_torrent(
        &self,
        id: TorrentId,
        metainfo: Metainfo,
    ) -> Result<()> {
        Ok(self
            .cmd_chan
            .send(Command::CreateTorrent { id, metainfo })?)
    }

    /// Tells the engine to stop the disk task and end its event loop.
    pub fn shutdown(&self) -> Result<()> {
        Ok(self.cmd_chan.send(Command::Shutdown)?)
    }
}

/// The engine task itself. Spawn it with [`Engine::spawn`], which returns a
/// handle and an alert stream and leaves the engine running in the
/// background.
pub struct Engine {
    conf: Conf,
    disk: DiskHandle,
    cmd_port: mpsc::UnboundedReceiver<Command>,
    disk_alert_port: disk::AlertReceiver,
    alert_chan: mpsc::UnboundedSender<EngineAlert>,
    /// Allocation requests awaiting the disk task's reply, keyed by torrent
    /// id, so the correct spawned coordinator task can be handed its
    /// per-torrent alert channel once it arrives.
    pending_allocations:
        HashMap<TorrentId, oneshot::Sender<TorrentAlertReceiver>>,
}

impl Engine {
    /// Spawns the disk task and the engine's own event loop, returning a
    /// handle to create torrents with and the stream on which all of their
    /// alerts are reported.
    pub fn spawn(conf: Conf) -> Result<(EngineHandle, AlertReceiver)> {
        let (disk, disk_alert_port) = DiskHandle::spawn()?;
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let engine = Self {
            conf,
            disk,
            cmd_port,
            disk_alert_port,
            alert_chan,
            pending_allocations: HashMap::new(),
        };
        tokio::task::spawn(engine.run());
        Ok((EngineHandle { cmd_chan }, alert_port))
    }

    async fn run(self) {
        let Engine {
            conf,
            disk,
            cmd_port,
            disk_alert_port,
            alert_chan,
            mut pending_allocations,
        } = self;
        let mut cmd_port = cmd_port.fuse();
        let mut disk_alert_port = disk_alert_port.fuse();

        loop {
            select! {
                cmd = cmd_port.select_next_some() => {
                    match cmd {
                        Command::CreateTorrent { id, metainfo } => {
                            Self::create_torrent(
                                id,
                                metainfo,
                                &conf,
                                &disk,
                                &alert_chan,
                                &mut pending_allocations,
                            );
                        }
                        Command::Shutdown => {
                            let _ = disk.shutdown();
                            break;
                        }
                    }
                }
                alert = disk_alert_port.select_next_some() => {
                    match alert {
                        disk::Alert::TorrentAllocation(Ok(alloc)) => {
                            if let Some(resp_chan) =
                                pending_allocations.remove(&alloc.id)
                            {
                                let _ = resp_chan.send(alloc.alert_port);
                            }
                        }
                        disk::Alert::TorrentAllocation(Err(e)) => {
                            log::warn!("Torrent allocation failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Allocates the torrent's files on disk and, once allocation succeeds,
    /// spawns its coordinator task. The coordinator's own alert channel
    /// arrives asynchronously, so it's handed over via a one-shot channel
    /// registered in `pending_allocations`.
    fn create_torrent(
        id: TorrentId,
        metainfo: Metainfo,
        conf: &Conf,
        disk: &DiskHandle,
        alert_chan: &mpsc::UnboundedSender<EngineAlert>,
        pending_allocations: &mut HashMap<
            TorrentId,
            oneshot::Sender<TorrentAlertReceiver>,
        >,
    ) {
        let storage = StorageInfo::new(
            &metainfo,
            conf.torrent.download_dir.clone(),
        );
        let piece_hashes = metainfo.piece_hashes_bytes().to_vec();
        if let Err(e) = disk.allocate_new_torrent(id, storage, piece_hashes) {
            let _ = alert_chan.send(EngineAlert::Error(id, e));
            return;
        }

        let (resp_chan, resp_port) = oneshot::channel();
        pending_allocations.insert(id, resp_chan);

        let client_id = conf.engine.client_id;
        let torrent_conf = conf.torrent.clone();
        let disk = disk.clone();
        let alert_chan = alert_chan.clone();
        tokio::task::spawn(async move {
            let torrent_alert_port = match resp_port.await {
                Ok(port) => port,
                Err(_) => {
                    let io_err = std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "engine shut down before torrent was allocated",
                    );
                    let _ = alert_chan
                        .send(EngineAlert::Error(id, io_err.into()));
                    return;
                }
            };

            let (progress_chan, mut progress_port) =
                mpsc::unbounded_channel();
            let forward_chan = alert_chan.clone();
            tokio::task::spawn(async move {
                while let Some(progress) = progress_port.recv().await {
                    if forward_chan
                        .send(EngineAlert::Progress(progress))
                        .is_err()
                    {
                        break;
                    }
                }
            });

            let mut torrent = Torrent::new(
                id,
                client_id,
                metainfo,
                torrent_conf,
                disk,
                progress_chan,
            );
            match torrent.start(torrent_alert_port).await {
                Ok(()) => {
                    let _ = alert_chan.send(EngineAlert::Complete(id));
                }
                Err(e) => {
                    let _ = alert_chan.send(EngineAlert::Error(id, e));
                }
            }
        });
    }
}
