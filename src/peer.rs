mod codec;

use {
    futures::{
        select,
        stream::{Fuse, SplitSink},
        FutureExt, SinkExt, StreamExt,
    },
    std::{net::SocketAddr, sync::Arc, time::Instant},
    tokio::{
        net::TcpStream,
        sync::{
            mpsc::{self, UnboundedReceiver, UnboundedSender},
            RwLock,
        },
        time,
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        counter::ThroughputCounter, disk::DiskHandle, download::PieceDownload,
        error::*, piece_picker::PiecePicker, torrent::SharedStatus, Bitfield,
        BlockInfo, PeerId,
    },
    codec::*,
};

/// Live session info exposed to the coordinator for choke ranking, refreshed
/// once per rate sample tick rather than on every message.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SessionInfo {
    pub is_peer_interested: bool,
    pub is_peer_choked: bool,
    pub download_rate: f64,
}

/// Shared handle through which the coordinator reads a session's live info
/// without owning the session task itself.
pub(crate) type SharedSessionInfo = Arc<RwLock<SessionInfo>>;

pub(crate) struct PeerSession {
    /// Shared information of the torrent.
    torrent: Arc<SharedStatus>,
    /// The piece picker picks the next most optimal piece to download and is
    /// shared by other entities in the same torrent.
    piece_picker: Arc<RwLock<PiecePicker>>,
    /// The entity used to save downloaded file blocks to disk.
    disk: DiskHandle,
    /// The port on which peer session receives commands.
    cmd_port: Fuse<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// Session related information.
    status: Status,
    /// These are the active piece downloads in which this session is
    /// participating.
    downloads: Vec<PieceDownload>,
    /// Our pending requests that we sent to peer, along with when we sent
    /// them, so a request can be reclaimed if the peer never answers it. It
    /// represents the blocks that we are expecting. Thus, if we receive a
    /// block that is not in this list, it is dropped. If we receive a block
    /// whose request entry is in here, the entry is removed.
    ///
    /// Since the Fast extension is not supported (yet), this is emptied when
    /// we're choked, as in that case we don't expect outstanding requests to
    /// be served.
    ///
    /// Note that if a request for a piece's block is in this queue, there
    /// _must_ be a corresponding entry for the piece download in
    /// `downloads`.
    outgoing_requests: Vec<(BlockInfo, Instant)>,
    /// Requests the peer has made of us, served in FIFO order while we're
    /// not choking them.
    incoming_requests: Vec<BlockInfo>,
    /// Information about a peer that is set after a successful handshake.
    peer_info: Option<PeerInfo>,
    /// Downloaded block bytes since the last rate sample tick.
    download_rate: ThroughputCounter,
    /// Uploaded block bytes since the last rate sample tick.
    upload_rate: ThroughputCounter,
    /// When we last received any message from the peer, used to detect and
    /// close idle connections.
    last_activity_at: Instant,
    /// Live session info the coordinator reads for choke ranking.
    info: SharedSessionInfo,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    pub fn outbound(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        disk: DiskHandle,
        addr: SocketAddr,
    ) -> (Self, Sender, SharedSessionInfo) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let info = Arc::new(RwLock::new(SessionInfo::default()));
        (
            Self {
                torrent,
                piece_picker,
                disk,
                cmd_port: cmd_port.fuse(),
                addr,
                status: Status::default(),
                downloads: Vec::new(),
                outgoing_requests: Vec::new(),
                incoming_requests: Vec::new(),
                peer_info: None,
                download_rate: ThroughputCounter::new(),
                upload_rate: ThroughputCounter::new(),
                last_activity_at: Instant::now(),
                info: Arc::clone(&info),
            },
            cmd_chan,
            info,
        )
    }

    /// Starts the peer session and returns once the connection is closed or
    /// an error occurs.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting peer {} session", self.addr);

        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket = time::timeout(
            self.torrent.conf.handshake_timeout,
            TcpStream::connect(self.addr),
        )
        .await??;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.status.state = State::Handshaking;
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        log::info!("Sending handshake to peer {}", self.addr);
        socket.send(handshake).await?;

        // receive peer's handshake
        log::info!("Waiting for peer {} handshake", self.addr);
        let peer_handshake =
            time::timeout(self.torrent.conf.handshake_timeout, socket.next())
                .await?;
        if let Some(peer_handshake) = peer_handshake {
            let peer_handshake = peer_handshake?;
            log::info!("Received handshake from peer {}", self.addr);
            log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
            debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

            // verify that the advertised torrent info hash is the same as ours
            if peer_handshake.info_hash != self.torrent.info_hash {
                log::info!("Peer {} handshake invalid info hash", self.addr);
                return Err(Error::InvalidPeerInfoHash);
            }

            self.peer_info = Some(PeerInfo {
                peer_id: peer_handshake.peer_id,
                pieces: None,
            });

            // now that we have the handshake, we need to switch to the peer
            // message codec and save the socket in self (note that we need to
            // keep the buffer from the original codec as it may contain bytes
            // of any potential message the peer may have sent after the
            // handshake)
            let old_parts = socket.into_parts();
            let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
            new_parts.read_buf = old_parts.read_buf;
            new_parts.write_buf = old_parts.write_buf;
            let socket = Framed::from_parts(new_parts);

            // enter the piece availability exchange state until peer sends a
            // bitfield, or we otherwise learn of its pieces via `have`
            self.status.state = State::AvailabilityExchange;
            log::info!(
                "Peer {} session state: {:?}",
                self.addr,
                self.status.state
            );

            self.run(socket).await?;
        } else {
            log::info!("Peer {} closed connection during handshake", self.addr);
            return Err(Error::PeerTimeout);
        }

        Ok(())
    }

    /// Runs the session after connection to peer is established.
    ///
    /// This is the main session loop: message exchange, command handling,
    /// rate sampling, and timeout enforcement.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // send our own bitfield right away, even if we have nothing yet, so
        // the peer knows what it can request from us without waiting for
        // individual `have` messages
        let our_bitfield = self.piece_picker.read().await.to_bitfield();
        log::info!("Sending bitfield to peer {}", self.addr);
        sink.send(Message::Bitfield(our_bitfield)).await?;

        let mut rate_ticker =
            time::interval(self.torrent.conf.rate_sample_interval);
        let sample_secs = self.torrent.conf.rate_sample_interval.as_secs_f64();

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    self.last_activity_at = Instant::now();
                    log::debug!(
                        "Received message {} from peer {:?}",
                        self.addr,
                        msg.id()
                    );

                    if self.status.state == State::AvailabilityExchange {
                        if let Message::Bitfield(bitfield) = msg {
                            self.handle_bitfield_msg(&mut sink, bitfield).await?;
                        } else {
                            self.status.state = State::Connected;
                            log::info!(
                                "Peer {} session state: {:?}",
                                self.addr,
                                self.status.state
                            );
                            // the peer skipped sending a bitfield and went
                            // straight to e.g. `have`; start it off from an
                            // empty bitfield so per-piece availability can
                            // still be tracked for request filtering
                            if let Some(peer_info) = &mut self.peer_info {
                                if peer_info.pieces.is_none() {
                                    let mut pieces = Bitfield::new();
                                    pieces.resize(
                                        self.torrent.storage.piece_count,
                                        false,
                                    );
                                    peer_info.pieces = Some(pieces);
                                }
                            }
                            self.handle_msg(&mut sink, msg).await?;
                        }
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Shutdown => {
                            log::info!("Shutting down peer {} session", self.addr);
                            break;
                        }
                        Command::Choke => {
                            self.choke_peer(&mut sink).await?;
                        }
                        Command::Unchoke => {
                            self.unchoke_peer(&mut sink).await?;
                        }
                        Command::Have(piece_index) => {
                            sink.send(Message::Have { piece_index }).await?;
                        }
                    }
                }
                _ = rate_ticker.tick().fuse() => {
                    self.download_rate.tick(sample_secs);
                    self.upload_rate.tick(sample_secs);
                    self.reap_timed_out_requests()?;
                    *self.info.write().await = SessionInfo {
                        is_peer_interested: self.status.is_peer_interested,
                        is_peer_choked: self.status.is_peer_choked,
                        download_rate: self.download_rate.rate(),
                    };
                    if self.last_activity_at.elapsed()
                        >= self.torrent.conf.peer_idle_timeout
                    {
                        log::warn!("Peer {} went idle, closing session", self.addr);
                        return Err(Error::PeerTimeout);
                    }
                }
            }
        }

        Ok(())
    }

    /// Handles a message expected in the `AvailabilityExchange` state
    /// (currently only the bitfield message).
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        debug_assert_eq!(self.status.state, State::AvailabilityExchange);
        log::info!("Handling peer {} Bitfield message", self.addr);
        log::trace!("Bitfield: {:?}", bitfield);

        // the bitfield raw data sent over the wire may be longer than the
        // logical pieces it represents, if the piece count isn't a multiple
        // of 8; those spare high bits must be zero
        let piece_count = self.torrent.storage.piece_count;
        if bitfield.len() > piece_count
            && bitfield[piece_count..].iter().any(|bit| *bit)
        {
            log::info!("Peer {} bitfield has spare bits set", self.addr);
            return Err(WireError::ProtocolSequence.into());
        }
        bitfield.resize(piece_count, false);

        let mut piece_picker = self.piece_picker.write().await;
        self.status.is_interested =
            piece_picker.register_availability(&bitfield)?;
        drop(piece_picker);
        if let Some(peer_info) = &mut self.peer_info {
            peer_info.pieces = Some(bitfield);
        }

        self.status.state = State::Connected;
        log::info!(
            "Peer {} session state: {:?}",
            self.addr,
            self.status.state
        );

        if self.status.is_interested {
            log::info!("Interested in peer {}", self.addr);
            sink.send(Message::Interested).await?;
        }

        Ok(())
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(_) => {
                log::info!(
                    "Peer {} sent bitfield message not after handshake",
                    self.addr
                );
                return Err(Error::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {
                log::info!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    // since we're choked we don't expect to receive blocks
                    // for our pending requests
                    self.outgoing_requests.clear();
                    self.status.is_choked = true;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                }
                self.incoming_requests.clear();
            }
            Message::Have { piece_index } => {
                log::info!("Peer {} has piece {}", self.addr, piece_index);
                let mut piece_picker = self.piece_picker.write().await;
                piece_picker.register_piece_availability(piece_index);
                if let Some(peer_info) = &mut self.peer_info {
                    if let Some(pieces) = &mut peer_info.pieces {
                        pieces.set(piece_index, true);
                    }
                }
                if !self.status.is_interested
                    && !piece_picker.has_piece(piece_index)
                {
                    self.status.is_interested = true;
                }
                drop(piece_picker);
                if self.status.is_interested && self.status.is_choked {
                    sink.send(Message::Interested).await?;
                }
            }
            Message::Request(block_info) => {
                self.handle_request_msg(sink, block_info).await?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block_msg(block_info, data).await?;
                self.make_requests(sink).await?;
            }
            Message::Cancel(block_info) => {
                self.incoming_requests.retain(|b| *b != block_info);
            }
        }

        Ok(())
    }

    /// Serves a block request if we're not choking the peer and we have the
    /// requested piece, either cached from a recent download or queued for
    /// later once the cache no longer holds it.
    async fn handle_request_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        block_info: BlockInfo,
    ) -> Result<()> {
        if self.status.is_peer_choked {
            log::debug!(
                "Ignoring request from choked peer {}: {:?}",
                self.addr,
                block_info
            );
            return Ok(());
        }

        let piece = self
            .disk
            .read_piece(self.torrent.id, block_info.piece_index)
            .await?;
        match piece {
            Some(piece) => {
                let start = block_info.offset as usize;
                let end = start + block_info.len as usize;
                if end > piece.len() {
                    log::warn!(
                        "Peer {} requested out of range block: {:?}",
                        self.addr,
                        block_info
                    );
                    return Ok(());
                }
                let data = piece[start..end].to_vec();
                self.upload_rate.update(data.len() as u64);
                sink.send(Message::Block {
                    piece_index: block_info.piece_index,
                    offset: block_info.offset,
                    data,
                })
                .await?;
            }
            None => {
                log::debug!(
                    "Piece {} no longer cached, queuing request from peer {}",
                    block_info.piece_index,
                    self.addr
                );
                self.incoming_requests.push(block_info);
            }
        }

        Ok(())
    }

    /// Tells the peer we're no longer willing to upload to them.
    async fn choke_peer(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if !self.status.is_peer_choked {
            log::info!("Choking peer {}", self.addr);
            self.status.is_peer_choked = true;
            self.incoming_requests.clear();
            sink.send(Message::Choke).await?;
        }
        Ok(())
    }

    /// Tells the peer we're now willing to upload to them.
    async fn unchoke_peer(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if self.status.is_peer_choked {
            log::info!("Unchoking peer {}", self.addr);
            self.status.is_peer_choked = false;
            sink.send(Message::Unchoke).await?;
        }
        Ok(())
    }

    /// Fills the session's download pipeline with the optimal number of
    /// requests.
    async fn make_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        log::trace!("Making requests to peer {}", self.addr);

        let pipeline_len = self.torrent.conf.max_pipeline_len;
        let mut blocks = Vec::new();

        // if we have active downloads, prefer to continue those, resulting
        // in fewer in-progress pieces
        for download in self.downloads.iter_mut() {
            debug_assert!(pipeline_len >= self.outgoing_requests.len());
            let to_request_count = pipeline_len - self.outgoing_requests.len();
            if to_request_count == 0 {
                break;
            }
            download.pick_blocks(to_request_count, &mut blocks);
        }

        // the pieces this peer actually has, per its bitfield/have
        // messages; without it we can't safely start a new piece for it,
        // but blocks already picked above for in-progress downloads are
        // still sent below
        let peer_pieces =
            self.peer_info.as_ref().and_then(|info| info.pieces.clone());

        // while we can make more requests we start new download(s)
        if let Some(peer_pieces) = peer_pieces {
            loop {
                debug_assert!(pipeline_len >= self.outgoing_requests.len());
                let request_queue_len =
                    pipeline_len - self.outgoing_requests.len();
                if request_queue_len == 0 {
                    break;
                }

                log::debug!(
                    "Session {} starting new piece download",
                    self.addr
                );

                let mut piece_picker = self.piece_picker.write().await;
                let picked = piece_picker.pick_piece(&peer_pieces);
                drop(piece_picker);
                if let Some(index) = picked {
                    log::info!("Session {} picked piece {}", self.addr, index);

                    let mut download = PieceDownload::new(
                        index,
                        self.torrent.storage.piece_len(index)?,
                    );
                    download.pick_blocks(request_queue_len, &mut blocks);
                    self.downloads.push(download);
                } else {
                    log::debug!(
                        "Could not pick more pieces from peer {}",
                        self.addr
                    );
                    break;
                }
            }
        } else {
            log::trace!(
                "Peer {} pieces still unknown, not starting new pieces",
                self.addr
            );
        }

        let now = Instant::now();
        self.outgoing_requests
            .extend(blocks.iter().map(|b| (*b, now)));
        for block in blocks.iter() {
            sink.send(Message::Request(*block)).await?;
        }

        Ok(())
    }

    /// Verifies block validity, registers the download (and finishes a piece
    /// download if this was the last missing block in piece) and updates
    /// statistics about the download.
    async fn handle_block_msg(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::info!("Received block from peer {}: {:?}", self.addr, block_info);

        let block_pos = match self
            .outgoing_requests
            .iter()
            .position(|(b, _)| *b == block_info)
        {
            Some(pos) => pos,
            None => {
                log::warn!(
                    "Peer {} sent not requested block: {:?}",
                    self.addr,
                    block_info,
                );
                return Ok(());
            }
        };
        self.outgoing_requests.remove(block_pos);
        self.download_rate.update(block_info.len as u64);

        let download_pos = self
            .downloads
            .iter()
            .position(|d| d.piece_index() == block_info.piece_index);
        debug_assert!(download_pos.is_some());
        let download_pos = download_pos.unwrap();
        let download = &mut self.downloads[download_pos];
        download.received_block(block_info);

        if download.count_missing_blocks() == 0 {
            log::info!(
                "Finished piece {} via peer {}",
                block_info.piece_index,
                self.addr
            );
            self.piece_picker
                .write()
                .await
                .received_piece(block_info.piece_index);
            self.downloads.remove(download_pos);
        }

        self.disk.write_block(self.torrent.id, block_info, data)?;
        self.status.downloaded_block_bytes_count += block_info.len as u64;

        Ok(())
    }

    /// Frees any outgoing request that has been outstanding for longer than
    /// the configured request timeout, so its block can be requested again,
    /// possibly from a different peer, and closes the session: a peer slow
    /// enough to miss a request deadline isn't worth keeping around.
    fn reap_timed_out_requests(&mut self) -> Result<()> {
        let timeout = self.torrent.conf.request_timeout;
        let now = Instant::now();
        let (timed_out, still_pending): (Vec<_>, Vec<_>) = self
            .outgoing_requests
            .drain(..)
            .partition(|(_, sent_at)| now.duration_since(*sent_at) >= timeout);
        self.outgoing_requests = still_pending;
        let timed_out_any = !timed_out.is_empty();
        for (block_info, _) in timed_out {
            log::warn!(
                "Peer {} timed out on request {:?}",
                self.addr,
                block_info
            );
            if let Some(download) = self
                .downloads
                .iter_mut()
                .find(|d| d.piece_index() == block_info.piece_index)
            {
                download.free_block(block_info);
            }
        }
        if timed_out_any {
            return Err(Error::PeerTimeout);
        }
        Ok(())
    }

    /// Releases every piece this session had claimed but not finished back
    /// to `Missing`, so another session can pick it up. Must be called once
    /// the session is ending, whether it closed cleanly or errored out,
    /// since `downloads` otherwise dies with the session and its claimed
    /// pieces would be stuck `Pending` forever.
    pub(crate) async fn release_claimed_pieces(&mut self) {
        if self.downloads.is_empty() {
            return;
        }
        let mut piece_picker = self.piece_picker.write().await;
        for download in self.downloads.drain(..) {
            piece_picker.reset_piece(download.piece_index());
        }
    }
}

/// The channel on which torrent can send a command to the peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands peer session can receive.
pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
    /// Stop uploading to the peer.
    Choke,
    /// Start (or resume) uploading to the peer.
    Unchoke,
    /// A piece was just verified; announce it to the peer.
    Have(crate::PieceIndex),
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we have.
    is_peer_interested: bool,
    /// The total number of piece/block bytes downloaded.
    downloaded_block_bytes_count: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            downloaded_block_bytes_count: 0,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    /// The peer connection has not yet been connected or it had been connected
    /// before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// This state is used to verify that the bitfield exchange occurs right
    /// after the handshake and not later. It is set once the handshakes are
    /// exchanged and changed as soon as we receive the bitfield or the first
    /// message that is not a bitfield.
    AvailabilityExchange,
    /// The normal state of a peer session, in which any messages except the
    /// handshake and a second bitfield may be exchanged.
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Information about the peer we're connected to.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    peer_id: PeerId,
    /// All pieces peer has, updated when it announces a new piece via
    /// `have` or the initial bitfield.
    pieces: Option<Bitfield>,
}
