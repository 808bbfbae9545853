//! Owns all on-disk state: where a torrent's files live, the in-progress
//! piece write buffer, and hash verification. The disk task runs on its own
//! tokio task and is driven purely by [`Command`]s sent over an unbounded
//! channel; it reports back over per-torrent [`TorrentAlert`] channels (and a
//! top-level [`Alert`] channel for torrent allocation) so a slow or failing
//! disk never blocks a peer session.

mod error;
mod io;
mod iovecs;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

pub(crate) use error::{NewTorrentError, WriteError};

use crate::{storage_info::StorageInfo, BlockInfo, PieceIndex, TorrentId};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;
pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;
pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// Commands sent to the disk task.
pub(crate) enum Command {
    /// Registers a new torrent with the disk task, allocating its files.
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    },
    /// Queues a downloaded block for writing.
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    /// Looks up a just-verified piece in the torrent's in-memory cache, for
    /// serving it back out to a peer without touching disk again.
    ReadPiece {
        id: TorrentId,
        index: PieceIndex,
        respond_to: oneshot::Sender<Option<Arc<Vec<u8>>>>,
    },
    /// Tells the disk task to stop its event loop.
    Shutdown,
}

/// Alerts sent by the disk task to whoever created it (the engine).
pub(crate) enum Alert {
    /// The result of allocating a new torrent's files.
    TorrentAllocation(Result<TorrentAllocation, NewTorrentError>),
}

/// Returned on successful torrent allocation: the id it was registered under
/// and the per-torrent alert channel on which block writes and piece
/// completions will be reported from here on.
pub(crate) struct TorrentAllocation {
    pub id: TorrentId,
    pub alert_port: TorrentAlertReceiver,
}

/// Alerts sent by the disk task on a torrent's own alert channel.
pub(crate) enum TorrentAlert {
    /// The outcome of writing a just-completed piece's blocks to disk (or
    /// the failure that prevented it).
    BatchWrite(Result<BatchWrite, WriteError>),
}

/// Reports which blocks were written to disk as part of completing a piece,
/// and whether the piece passed its hash check.
pub(crate) struct BatchWrite {
    /// The piece this batch completed, valid or not.
    pub piece_index: PieceIndex,
    /// The blocks written to disk. Empty when the piece failed verification,
    /// since nothing was written in that case.
    pub blocks: Vec<BlockInfo>,
    /// `None` if the piece isn't complete yet (shouldn't occur in practice,
    /// since a `BatchWrite` is only sent once a piece is complete), `Some`
    /// with the hash check's result otherwise.
    pub is_piece_valid: Option<bool>,
}

/// A lightweight handle to the disk task, cloned into every peer session so
/// it can queue block writes without owning the task itself.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: CommandSender,
}

impl DiskHandle {
    /// Spawns the disk task on its own tokio task and returns a handle to it
    /// along with the channel on which torrent allocation results arrive.
    pub(crate) fn spawn() -> crate::error::Result<(Self, AlertReceiver)> {
        let (mut disk, cmd_chan, alert_port) = io::Disk::new()?;
        tokio::task::spawn(async move {
            if let Err(e) = disk.start().await {
                log::error!("Disk task exited with error: {}", e);
            }
        });
        Ok((Self { cmd_chan }, alert_port))
    }

    /// Registers a new torrent's on-disk layout.
    pub(crate) fn allocate_new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> crate::error::Result<()> {
        Ok(self.cmd_chan.send(Command::NewTorrent {
            id,
            info,
            piece_hashes,
        })?)
    }

    /// Queues a downloaded block for writing to disk.
    pub(crate) fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> crate::error::Result<()> {
        Ok(self.cmd_chan.send(Command::WriteBlock { id, info, data })?)
    }

    /// Fetches a just-verified piece's bytes from the torrent's in-memory
    /// cache, if still present, for serving it back out to a peer. Returns
    /// `None` both when the torrent is unknown and when the piece has
    /// already been evicted, since the cache only ever holds a handful of
    /// the most recently completed pieces.
    pub(crate) async fn read_piece(
        &self,
        id: TorrentId,
        index: PieceIndex,
    ) -> crate::error::Result<Option<Arc<Vec<u8>>>> {
        let (respond_to, response) = oneshot::channel();
        self.cmd_chan.send(Command::ReadPiece {
            id,
            index,
            respond_to,
        })?;
        Ok(response.await.unwrap_or(None))
    }

    /// Tells the disk task to stop.
    pub(crate) fn shutdown(&self) -> crate::error::Result<()> {
        Ok(self.cmd_chan.send(Command::Shutdown)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_handle_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<DiskHandle>();
    }
}
