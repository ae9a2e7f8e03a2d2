//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::{PeerId, BLOCK_LEN};

/// The default bitleech client id.
pub const BITLEECH_CLIENT_ID: &PeerId = b"bl-0000000000000000";

/// The global configuration for the engine and all its parts.
///
/// Every field corresponds to one row of the configuration table in the
/// design: each subsystem reads its own slice of this struct rather than
/// threading individual parameters through constructors.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub peer: PeerConf,
    pub swarm: SwarmConf,
    pub requester: RequesterConf,
    pub leecher: LeecherConf,
}

impl Conf {
    /// Returns the configuration with the defaults from the design's
    /// configuration table, except for the download directory, as it is not
    /// sensible to guess that for the user. It uses the default bitleech
    /// client id, [`BITLEECH_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *BITLEECH_CLIENT_ID,
            },
            peer: PeerConf::default(),
            swarm: SwarmConf::default(),
            requester: RequesterConf::default(),
            leecher: LeecherConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Per-peer-session configuration (C5).
#[derive(Clone, Copy, Debug)]
pub struct PeerConf {
    /// The block granularity. Always [`BLOCK_LEN`] in practice, but kept
    /// configurable as some swarms may use unusual piece layouts.
    pub block_size: u32,
    /// Deadline for establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Deadline for completing the handshake exchange.
    pub handshake_timeout: Duration,
    /// Read granularity used while draining a message body.
    pub chunk_size: usize,
}

impl Default for PeerConf {
    fn default() -> Self {
        Self {
            block_size: BLOCK_LEN,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            chunk_size: 4096,
        }
    }
}

/// Swarm-wide configuration (C6).
#[derive(Clone, Copy, Debug)]
pub struct SwarmConf {
    /// The maximum number of simultaneously connected peers.
    pub max_connections: usize,
    /// How often a keep-alive is sent on an otherwise idle connection.
    pub keep_alive_interval: Duration,
    /// How long a peer may go without sending us anything before we drop it.
    pub inactivity_timeout: Duration,
    /// Whether to send `have` to peers that already advertised the piece.
    pub send_redundant_have: bool,
}

impl Default for SwarmConf {
    fn default() -> Self {
        Self {
            max_connections: 200,
            keep_alive_interval: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(120),
            send_redundant_have: true,
        }
    }
}

/// Piece requester configuration (C7/C8).
#[derive(Clone, Copy, Debug)]
pub struct RequesterConf {
    /// Global cap on concurrently in-flight block requests across all peers.
    pub max_block_requests_to_peers: usize,
    /// Per-peer cap on concurrently in-flight block requests.
    pub max_block_requests_per_peer: usize,
    /// How long we wait for a dispatched block before it reverts to missing.
    pub block_receive_timeout: Duration,
    /// Pause between dispatch rounds, to avoid flooding the swarm.
    pub request_pacing: Duration,
    /// Whether `missing_blocks` is kept ordered by piece rarity.
    pub sort_by_rarity: bool,
}

impl Default for RequesterConf {
    fn default() -> Self {
        Self {
            max_block_requests_to_peers: 10,
            max_block_requests_per_peer: 10,
            block_receive_timeout: Duration::from_secs(30),
            request_pacing: Duration::from_millis(400),
            sort_by_rarity: true,
        }
    }
}

/// Leecher configuration (C9).
#[derive(Clone, Debug)]
pub struct LeecherConf {
    /// The directory in which the torrent's files are placed upon download.
    pub download_dir: PathBuf,
    /// Whether to accept blocks that were not requested by us.
    pub accept_unrequested_blocks: bool,
}

impl LeecherConf {
    /// Returns the leecher configuration with reasonable defaults, except
    /// for the download directory, as it is not sensible to guess that for
    /// the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            accept_unrequested_blocks: true,
        }
    }
}
