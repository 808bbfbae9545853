//! The wire format: the one-time handshake and the length-prefixed peer
//! message stream that follows it.
//!
//! Message framing: a 4 byte big endian length prefix followed by that many
//! bytes of payload. A length of zero is the keep-alive message and carries
//! no payload. Otherwise the first payload byte is the message id, the rest
//! is the message's body.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::*, Bitfield, BlockInfo, PeerId, Sha1Hash, MAX_MSG_LEN};

/// The protocol string sent in every handshake, as of BEP 3.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

const HANDSHAKE_LEN: usize = 1 + PROTOCOL_STRING.len() + 8 + 20 + 20;

/// The one-time message exchanged at the start of every connection, before
/// any other message may be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Handshake {
    /// The protocol string, `"BitTorrent protocol"` for every peer we
    /// interoperate with.
    pub prot: Vec<u8>,
    /// 8 reserved bytes, used by extensions we don't implement; always zero.
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self {
            prot: PROTOCOL_STRING.as_bytes().to_vec(),
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Frames the handshake, which unlike every other message has no length
/// prefix (its length is implied by the fixed protocol string length that
/// precedes it).
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        dst: &mut BytesMut,
    ) -> Result<()> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(handshake.prot.len() as u8);
        dst.put(handshake.prot.as_slice());
        dst.put(&handshake.reserved[..]);
        dst.put(&handshake.info_hash[..]);
        dst.put(&handshake.peer_id[..]);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>> {
        if src.is_empty() {
            return Ok(None);
        }

        let prot_len = src[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(WireError::HandshakeMismatch.into());
        }

        let len = 1 + prot_len + 8 + 20 + 20;
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut src = src.split_to(len);
        src.advance(1);
        let prot = src.split_to(prot_len).to_vec();
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(WireError::HandshakeMismatch.into());
        }

        let mut reserved = [0; 8];
        reserved.copy_from_slice(&src[..8]);
        src.advance(8);

        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&src[..20]);
        src.advance(20);

        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&src[..20]);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The message ids as they appear on the wire, BEP 3 section "peer
/// messages".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl MessageId {
    fn from_u8(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Choke),
            1 => Some(Self::Unchoke),
            2 => Some(Self::Interested),
            3 => Some(Self::NotInterested),
            4 => Some(Self::Have),
            5 => Some(Self::Bitfield),
            6 => Some(Self::Request),
            7 => Some(Self::Block),
            8 => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// A peer protocol message, as defined by BEP 3.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: crate::PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: crate::PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Frames the peer message stream that follows a successful handshake.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                dst.reserve(4);
                dst.put_u32(0);
            }
            Message::Choke => {
                dst.reserve(5);
                dst.put_u32(1);
                dst.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                dst.reserve(5);
                dst.put_u32(1);
                dst.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                dst.reserve(5);
                dst.put_u32(1);
                dst.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                dst.reserve(5);
                dst.put_u32(1);
                dst.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece_index } => {
                dst.reserve(9);
                dst.put_u32(5);
                dst.put_u8(MessageId::Have as u8);
                dst.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                dst.reserve(5 + bytes.len());
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.put(bytes.as_slice());
            }
            Message::Request(block) => {
                dst.reserve(17);
                dst.put_u32(13);
                dst.put_u8(MessageId::Request as u8);
                dst.put_u32(block.piece_index as u32);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            }
            Message::Cancel(block) => {
                dst.reserve(17);
                dst.put_u32(13);
                dst.put_u8(MessageId::Cancel as u8);
                dst.put_u32(block.piece_index as u32);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                dst.reserve(13 + data.len());
                dst.put_u32(9 + data.len() as u32);
                dst.put_u8(MessageId::Block as u8);
                dst.put_u32(piece_index as u32);
                dst.put_u32(offset);
                dst.put(data.as_slice());
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if len > MAX_MSG_LEN {
            return Err(WireError::OversizeMessage.into());
        }
        let len = len as usize;

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);

        if len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut body = src.split_to(len);
        let id = body.get_u8();

        let msg = match MessageId::from_u8(id) {
            Some(MessageId::Choke) => Message::Choke,
            Some(MessageId::Unchoke) => Message::Unchoke,
            Some(MessageId::Interested) => Message::Interested,
            Some(MessageId::NotInterested) => Message::NotInterested,
            Some(MessageId::Have) => {
                if body.len() < 4 {
                    return Err(WireError::ProtocolSequence.into());
                }
                Message::Have {
                    piece_index: body.get_u32() as crate::PieceIndex,
                }
            }
            Some(MessageId::Bitfield) => {
                let bytes: Bytes = body.freeze();
                Message::Bitfield(Bitfield::from_vec(bytes.to_vec()))
            }
            Some(MessageId::Request) => {
                if body.len() < 12 {
                    return Err(WireError::ProtocolSequence.into());
                }
                Message::Request(BlockInfo {
                    piece_index: body.get_u32() as crate::PieceIndex,
                    offset: body.get_u32(),
                    len: body.get_u32(),
                })
            }
            Some(MessageId::Block) => {
                if body.len() < 8 {
                    return Err(WireError::ProtocolSequence.into());
                }
                let piece_index = body.get_u32() as crate::PieceIndex;
                let offset = body.get_u32();
                Message::Block {
                    piece_index,
                    offset,
                    data: body.to_vec(),
                }
            }
            Some(MessageId::Cancel) => {
                if body.len() < 12 {
                    return Err(WireError::ProtocolSequence.into());
                }
                Message::Cancel(BlockInfo {
                    piece_index: body.get_u32() as crate::PieceIndex,
                    offset: body.get_u32(),
                    len: body.get_u32(),
                })
            }
            None => {
                // unknown message id, discard it silently: BEP 3 leaves room
                // for future extensions to add message types we don't
                // understand
                return self.decode(src);
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_handshake() {
        let mut buf = BytesMut::new();
        let handshake = Handshake::new([1; 20], [2; 20]);
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn rejects_mismatched_protocol_string() {
        let mut buf = BytesMut::new();
        buf.put_u8(4);
        buf.put(&b"ftp!"[..]);
        buf.extend_from_slice(&[0; 8 + 20 + 20]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn roundtrips_keep_alive() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }

    #[test]
    fn roundtrips_request() {
        let mut buf = BytesMut::new();
        let block = BlockInfo {
            piece_index: 3,
            offset: 16384,
            len: 16384,
        };
        PeerCodec.encode(Message::Request(block), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Request(block));
    }

    #[test]
    fn roundtrips_block() {
        let mut buf = BytesMut::new();
        let data = vec![7u8; 1024];
        PeerCodec
            .encode(
                Message::Block {
                    piece_index: 1,
                    offset: 0,
                    data: data.clone(),
                },
                &mut buf,
            )
            .unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            decoded,
            Message::Block {
                piece_index: 1,
                offset: 0,
                data,
            }
        );
    }

    #[test]
    fn rejects_oversize_message_length() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MSG_LEN + 1);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn discards_unknown_message_id_and_continues() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        // followed by a legitimate keep-alive
        buf.put_u32(0);
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }
}
