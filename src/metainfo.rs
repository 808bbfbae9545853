//! Bencoded metainfo ("`.torrent`") parsing.
//!
//! A metainfo file is a bencoded dictionary; this module decodes it with
//! `serde_bencode`, validates it, and derives the pieces a
//! [`crate::storage_info::StorageInfo`] needs: piece count and length, the
//! info digest used as the swarm identifier in both the tracker announce and
//! the peer handshake, and the single-file/multi-file
//! [`FsStructure`](crate::storage_info::FsStructure).

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    storage_info::{FileInfo, FsStructure},
    PieceIndex, Sha1Hash,
};

/// A parsed and validated metainfo descriptor.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The tracker's announce URL.
    pub announce: String,
    /// The suggested name of the torrent (file or directory name).
    pub name: String,
    /// The nominal length of a piece, in bytes.
    pub piece_len: u32,
    /// The SHA-1 of the bencoded `info` dictionary, byte-for-byte as it
    /// appeared in the source file; the swarm identifier.
    pub info_hash: Sha1Hash,
    /// The concatenation of all piece SHA-1 digests, 20 bytes each.
    piece_hashes: Vec<u8>,
    /// The single-file or multi-file layout of the download.
    pub structure: FsStructure,
}

impl Metainfo {
    /// Parses and validates a metainfo file's raw bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawMetainfo) -> Result<Self> {
        let info = raw.info;

        if info.pieces.is_empty() || info.pieces.len() % 20 != 0 {
            return Err(Error::Metainfo(format!(
                "`pieces` length {} is not a positive multiple of 20",
                info.pieces.len()
            )));
        }
        if info.piece_length == 0 {
            return Err(Error::Metainfo("`piece length` is zero".into()));
        }

        // the info hash is computed over the bencoded `info` sub-dictionary
        // exactly as it appears in the source, which `serde_bencode`
        // reproduces faithfully as long as we re-encode the very value we
        // decoded
        let info_hash = {
            let bytes = serde_bencode::to_bytes(&info)?;
            let digest = Sha1::digest(&bytes);
            let mut hash = [0; 20];
            hash.copy_from_slice(&digest);
            hash
        };

        let structure = match (info.length, info.files) {
            (Some(len), None) => {
                if len == 0 {
                    return Err(Error::Metainfo("file length is zero".into()));
                }
                FsStructure::File(FileInfo {
                    path: PathBuf::from(&info.name),
                    len,
                    torrent_offset: 0,
                })
            }
            (None, Some(files)) => {
                if files.is_empty() {
                    return Err(Error::Metainfo("`files` is empty".into()));
                }
                let mut torrent_offset = 0u64;
                let files = files
                    .into_iter()
                    .map(|f| {
                        if f.length < 0 {
                            return Err(Error::Metainfo(
                                "negative file length".into(),
                            ));
                        }
                        if f.path.is_empty() {
                            return Err(Error::Metainfo(
                                "empty file path".into(),
                            ));
                        }
                        let path: PathBuf = f.path.iter().collect();
                        let file = FileInfo {
                            path,
                            len: f.length as u64,
                            torrent_offset,
                        };
                        torrent_offset += file.len;
                        Ok(file)
                    })
                    .collect::<Result<Vec<_>>>()?;
                FsStructure::Archive { files }
            }
            (Some(_), Some(_)) => {
                return Err(Error::Metainfo(
                    "both `length` and `files` are set".into(),
                ))
            }
            (None, None) => {
                return Err(Error::Metainfo(
                    "neither `length` nor `files` is set".into(),
                ))
            }
        };

        Ok(Self {
            announce: raw.announce,
            name: info.name,
            piece_len: info.piece_length as u32,
            info_hash,
            piece_hashes: info.pieces,
            structure,
        })
    }

    /// The number of pieces the torrent is divided into.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len() / 20
    }

    /// Returns the expected SHA-1 digest of the piece at `index`.
    pub fn piece_hash(&self, index: PieceIndex) -> Result<Sha1Hash> {
        let pos = index * 20;
        if pos + 20 > self.piece_hashes.len() {
            return Err(Error::InvalidPieceIndex);
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&self.piece_hashes[pos..pos + 20]);
        Ok(hash)
    }

    /// The raw concatenated piece digest bytes, handed to the disk task
    /// verbatim so it can slice its own 20-byte windows.
    pub fn piece_hashes_bytes(&self) -> &[u8] {
        &self.piece_hashes
    }
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    announce: String,
    info: Info,
}

#[derive(Debug, Serialize, Deserialize)]
struct Info {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    piece_length: u64,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bencode_single_file(piece_count: usize) -> Vec<u8> {
        let pieces = vec![b'a'; 20 * piece_count];
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce9:udp://tr4:infod6:lengthi40000e4:name5:movie12:piece lengthi32768e6:pieces");
        buf.extend_from_slice(format!("{}:", pieces.len()).as_bytes());
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn parses_single_file_torrent() {
        let buf = bencode_single_file(2);
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.announce, "udp://tr");
        assert_eq!(metainfo.name, "movie");
        assert_eq!(metainfo.piece_len, 32768);
        assert_eq!(metainfo.piece_count(), 2);
        assert!(!metainfo.structure.is_archive());
        assert_eq!(metainfo.structure.download_len(), 40000);
    }

    #[test]
    fn rejects_pieces_not_multiple_of_20() {
        // a zero-length `pieces` string is valid bencode but fails the
        // positive-multiple-of-20 check
        let buf = b"d8:announce9:udp://tr4:infod6:lengthi1e4:name1:x12:piece lengthi1e6:pieces0:ee";
        assert!(Metainfo::from_bytes(buf).is_err());
    }

    #[test]
    fn info_hash_is_stable_for_same_bytes() {
        let buf = bencode_single_file(1);
        let a = Metainfo::from_bytes(&buf).unwrap();
        let b = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
    }
}
