//! The HTTP tracker client.
//!
//! A single [`announce`] call issues one GET request and parses the
//! response; it does not retry or schedule re-announces itself, that is
//! [`crate::torrent`]'s job (exponential backoff between failed
//! announces, re-announcing on the tracker's advertised interval).

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde::{
    de::{Error as DeError, Visitor},
    Deserialize, Deserializer,
};
use url::Url;

use crate::{
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// The event announced to the tracker, reflecting the torrent's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Sent with the very first announce of a torrent.
    Started,
    /// Sent when the torrent is torn down before completing.
    Stopped,
    /// Sent once, when the last piece is verified.
    Completed,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }
}

/// The parameters of a single announce request.
#[derive(Debug, Clone, Copy)]
pub struct Announce {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
}

/// A successful, parsed tracker response.
#[derive(Debug, Clone)]
pub struct Response {
    /// How long to wait before the next announce.
    pub interval: Duration,
    /// The peers the tracker knows about for this torrent.
    pub peers: Vec<SocketAddr>,
}

/// Issues a single HTTP GET announce to `announce_url` and parses the reply.
///
/// `info_hash` and `peer_id` are raw bytes and are percent-escaped by hand
/// rather than via the request's query string serializer, since every byte
/// must be escaped whether or not it happens to be a printable ASCII
/// character; a query string library that only escapes reserved characters
/// would mangle them.
pub async fn announce(
    announce_url: &str,
    params: &Announce,
    timeout: Duration,
) -> Result<Response> {
    let url = build_url(announce_url, params)?;
    log::info!("Announcing to tracker: {}", announce_url);
    log::debug!("Announce url: {}", url);

    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let resp = client.get(&url).send().await?;

    let status = resp.status();
    let body = resp.bytes().await?;
    if !status.is_success() {
        return Err(Error::Tracker(format!(
            "tracker returned HTTP {}",
            status
        )));
    }

    let raw: RawResponse = serde_bencode::from_bytes(&body).map_err(|e| {
        Error::Tracker(format!("malformed tracker response: {}", e))
    })?;

    if let Some(reason) = raw.failure_reason {
        return Err(Error::Tracker(reason));
    }

    let interval = Duration::from_secs(raw.interval.unwrap_or(0));
    let peers = raw.peers.unwrap_or_default().0;
    log::info!("Tracker returned {} peers", peers.len());

    Ok(Response { interval, peers })
}

/// Builds the announce GET url. `url::Url` validates and assembles the
/// scheme, host, and scalar query parameters; `info_hash` and `peer_id`
/// are appended by hand afterwards, since they are arbitrary byte strings
/// that aren't valid UTF-8 and can't be handed to a `&str`-based query
/// serializer.
fn build_url(announce_url: &str, params: &Announce) -> Result<String> {
    let mut url = Url::parse(announce_url).map_err(|e| {
        Error::Tracker(format!("invalid announce url: {}", e))
    })?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("port", &params.port.to_string())
            .append_pair("uploaded", &params.uploaded.to_string())
            .append_pair("downloaded", &params.downloaded.to_string())
            .append_pair("left", &params.left.to_string())
            .append_pair("compact", "1");
        if let Some(event) = params.event {
            query.append_pair("event", event.as_str());
        }
    }
    let mut url = url.to_string();
    url.push_str("&info_hash=");
    url.push_str(&escape_bytes(&params.info_hash));
    url.push_str("&peer_id=");
    url.push_str(&escape_bytes(&params.peer_id));
    Ok(url)
}

/// Percent-escapes every byte that isn't an ASCII alphanumeric, which is a
/// superset of RFC 3986's unreserved set but still round-trips correctly
/// through every tracker we've come across.
fn escape_bytes(bytes: &[u8]) -> String {
    percent_encode(bytes, NON_ALPHANUMERIC).to_string()
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u64>,
    peers: Option<PeerList>,
}

/// The tracker's `peers` value, which may arrive in either of two shapes:
/// the compact form (a single byte string, 6 bytes per peer) favored by
/// most trackers, or the older form, a bencoded list of `{ip, port}`
/// dictionaries.
#[derive(Debug, Clone, Default)]
struct PeerList(Vec<SocketAddr>);

impl<'de> Deserialize<'de> for PeerList {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(PeerListVisitor)
    }
}

struct PeerListVisitor;

impl<'de> Visitor<'de> for PeerListVisitor {
    type Value = PeerList;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(
            "a compact peers byte string or a list of peer dictionaries",
        )
    }

    fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Self::Value, E>
    where
        E: DeError,
    {
        if v.len() % 6 != 0 {
            return Err(E::custom(format!(
                "compact peers length {} is not a multiple of 6",
                v.len()
            )));
        }
        let peers = v
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::new(IpAddr::V4(ip), port)
            })
            .collect();
        Ok(PeerList(peers))
    }

    fn visit_byte_buf<E>(
        self,
        v: Vec<u8>,
    ) -> std::result::Result<Self::Value, E>
    where
        E: DeError,
    {
        self.visit_bytes(&v)
    }

    fn visit_seq<A>(
        self,
        mut seq: A,
    ) -> std::result::Result<Self::Value, A::Error>
    where
        A: serde::de::SeqAccess<'de>,
    {
        let mut peers = Vec::new();
        while let Some(raw) = seq.next_element::<RawDictPeer>()? {
            let ip: IpAddr = raw.ip.parse().map_err(|_| {
                A::Error::custom(format!("invalid peer ip: {}", raw.ip))
            })?;
            peers.push(SocketAddr::new(ip, raw.port));
        }
        Ok(PeerList(peers))
    }
}

#[derive(Debug, Deserialize)]
struct RawDictPeer {
    ip: String,
    port: u16,
    #[serde(rename = "peer id", with = "serde_bytes", default)]
    #[allow(dead_code)]
    peer_id: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_all_non_alphanumeric_bytes() {
        let raw = [0u8, 1, b'a', b'9', 255];
        let escaped = escape_bytes(&raw);
        assert_eq!(escaped, "%00%01a9%FF");
    }

    #[test]
    fn decodes_compact_peer_list() {
        let bytes = vec![127, 0, 0, 1, 0x1A, 0xE1];
        let visitor = PeerListVisitor;
        let list = visitor
            .visit_bytes::<serde::de::value::Error>(&bytes)
            .unwrap();
        assert_eq!(list.0.len(), 1);
        assert_eq!(list.0[0].port(), 0x1AE1);
    }

    #[test]
    fn rejects_compact_peer_list_of_invalid_length() {
        let bytes = vec![127, 0, 0, 1, 0x1A];
        let visitor = PeerListVisitor;
        assert!(visitor
            .visit_bytes::<serde::de::value::Error>(&bytes)
            .is_err());
    }

    #[tokio::test]
    async fn announces_and_parses_compact_response() {
        let mut peers = Vec::new();
        peers.extend_from_slice(&[127, 0, 0, 1]);
        peers.extend_from_slice(&6881u16.to_be_bytes());
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers6:");
        body.extend_from_slice(&peers);
        body.extend_from_slice(b"e");

        let _m = mockito::mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create();

        let params = Announce {
            info_hash: [1; 20],
            peer_id: [2; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: Some(Event::Started),
        };
        let resp = announce(
            &mockito::server_url(),
            &params,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(resp.interval, Duration::from_secs(1800));
        assert_eq!(resp.peers.len(), 1);
        assert_eq!(resp.peers[0].port(), 6881);
    }

    #[tokio::test]
    async fn propagates_failure_reason() {
        let _m = mockito::mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(b"d14:failure reason17:torrent not founde".to_vec())
            .create();

        let params = Announce {
            info_hash: [1; 20],
            peer_id: [2; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: None,
        };
        let err = announce(
            &mockito::server_url(),
            &params,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Tracker(_)));
    }
}
