//! The tracker collaborator's contract: out of the core's scope (trackers
//! are glue per the engine's design), but the interface it announces
//! through and the compact peer format it must decode are defined here.

use std::net::{Ipv4Addr, SocketAddr};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_bytes::ByteBuf;

use crate::{
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// Anything that can yield peer addresses for a torrent and tell a tracker
/// we're leaving the swarm. The core engine depends only on this interface.
#[async_trait::async_trait]
pub trait PeerSource {
    async fn announce_all(&self) -> Result<Vec<SocketAddr>>;
    async fn announce_stopped(&self) -> Result<()>;
}

/// Decodes the compact peer list format: 6 bytes per IPv4 peer (4 byte
/// address, 2 byte big-endian port), as returned by a tracker's `peers`
/// field when `compact=1` was requested.
pub fn decode_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::from((ip, port))
        })
        .collect()
}

/// Encodes peer addresses into the compact format, the inverse of
/// [`decode_compact_peers`].
pub fn encode_compact_peers(peers: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(peers.len() * 6);
    for peer in peers {
        if let SocketAddr::V4(addr) = peer {
            out.extend_from_slice(&addr.ip().octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct AnnounceResponse {
    #[serde(default)]
    interval: Option<i64>,
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    peers: Option<ByteBuf>,
}

/// Announces to a single HTTP tracker using the query-string convention
/// (BEP 3), requesting the compact peer format.
pub struct HttpTracker {
    announce_url: String,
    client: reqwest::Client,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
}

impl HttpTracker {
    pub fn new(announce_url: String, info_hash: Sha1Hash, peer_id: PeerId, port: u16) -> Self {
        Self {
            announce_url,
            client: reqwest::Client::new(),
            info_hash,
            peer_id,
            port,
        }
    }

    fn build_url(&self, event: Option<&str>, uploaded: u64, downloaded: u64, left: u64) -> String {
        let info_hash = percent_encode(&self.info_hash, NON_ALPHANUMERIC).to_string();
        let peer_id = percent_encode(&self.peer_id, NON_ALPHANUMERIC).to_string();
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.announce_url, info_hash, peer_id, self.port, uploaded, downloaded, left
        );
        if let Some(event) = event {
            url.push_str("&event=");
            url.push_str(event);
        }
        url
    }

    async fn announce(&self, event: Option<&str>) -> Result<AnnounceResponse> {
        let url = self.build_url(event, 0, 0, 0);
        let bytes = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Fatal(format!("tracker request failed: {}", e)))?
            .bytes()
            .await
            .map_err(|e| Error::Fatal(format!("tracker response read failed: {}", e)))?;
        let response: AnnounceResponse = serde_bencode::from_bytes(&bytes)?;
        if let Some(reason) = response.failure_reason {
            return Err(Error::Fatal(format!("tracker announce failed: {}", reason)));
        }
        if let Some(interval) = response.interval {
            log::debug!("tracker {} reported announce interval {}s", self.announce_url, interval);
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl PeerSource for HttpTracker {
    async fn announce_all(&self) -> Result<Vec<SocketAddr>> {
        let response = self.announce(Some("started")).await?;
        Ok(response
            .peers
            .map(|peers| decode_compact_peers(&peers))
            .unwrap_or_default())
    }

    async fn announce_stopped(&self) -> Result<()> {
        self.announce(Some("stopped")).await?;
        Ok(())
    }
}
