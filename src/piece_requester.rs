//! The block-level request scheduler: picks `(piece, block, peer)` triples
//! subject to in-flight caps, and reverts timed-out requests back to
//! missing.

use std::{collections::HashMap, sync::Arc, time::Instant};

use tokio::sync::Mutex;

use crate::{
    conf::RequesterConf,
    pieces::{BlockInfo, PieceManager},
    protocol::message::BlockRequest,
    swarm::{PeerFilter, Swarm},
    PieceIndex,
};

/// Drives outbound block requests to completion or timeout.
pub struct PieceRequester {
    swarm: Arc<Swarm>,
    piece_manager: Arc<Mutex<PieceManager>>,
    conf: RequesterConf,
    dispatched_at: Mutex<HashMap<(PieceIndex, u32), Instant>>,
    warned_no_peers: Mutex<bool>,
}

impl PieceRequester {
    pub fn new(swarm: Arc<Swarm>, piece_manager: Arc<Mutex<PieceManager>>, conf: RequesterConf) -> Self {
        Self {
            swarm,
            piece_manager,
            conf,
            dispatched_at: Mutex::new(HashMap::new()),
            warned_no_peers: Mutex::new(false),
        }
    }

    /// Runs the scheduler until every piece is locally complete. Intended to
    /// be spawned as its own task; cancel-safe at every await point.
    pub async fn run(&self) {
        loop {
            if self.piece_manager.lock().await.is_complete() {
                log::info!("piece requester finished: every piece is complete");
                return;
            }

            if !self.wait_for_unchoked_peer().await {
                continue;
            }

            self.reap_timeouts().await;
            self.dispatch_tick().await;

            tokio::time::sleep(self.conf.request_pacing).await;
        }
    }

    /// Polls at 1 Hz until at least one unchoked peer is available, logging
    /// at most once. Returns `false` if it had to wait (so the caller can
    /// skip straight to the next loop iteration).
    async fn wait_for_unchoked_peer(&self) -> bool {
        let peers = self.swarm.get_peers(PeerFilter {
            unchoked_only: true,
            ..Default::default()
        }).await;
        if !peers.is_empty() {
            *self.warned_no_peers.lock().await = false;
            return true;
        }
        let mut warned = self.warned_no_peers.lock().await;
        if !*warned {
            log::info!("no unchoked peers available, waiting");
            *warned = true;
        }
        drop(warned);
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        false
    }

    /// Reverts any block whose `block_receive_timeout` has elapsed back to
    /// MISSING, purging it from the peer(s) it was outstanding on.
    async fn reap_timeouts(&self) {
        let now = Instant::now();
        let mut dispatched_at = self.dispatched_at.lock().await;
        let expired: Vec<_> = dispatched_at
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= self.conf.block_receive_timeout)
            .map(|(key, _)| *key)
            .collect();
        if expired.is_empty() {
            return;
        }
        let mut pm = self.piece_manager.lock().await;
        for (index, begin) in expired {
            dispatched_at.remove(&(index, begin));
            pm.revert_to_missing(index, begin);
            self.swarm.purge_in_flight(index, begin).await;
            log::debug!("piece {} block {} timed out, reverted to missing", index, begin);
        }
    }

    /// Rarest-first, selects eligible peers per candidate block and fires
    /// requests in parallel, subject to the global and per-peer caps.
    async fn dispatch_tick(&self) {
        let candidates: Vec<BlockInfo> = {
            let pm = self.piece_manager.lock().await;
            pm.missing_blocks().to_vec()
        };

        for block in candidates {
            let in_flight = self.piece_manager.lock().await.requested_count();
            if in_flight >= self.conf.max_block_requests_to_peers {
                break;
            }

            let peers = self
                .swarm
                .get_peers(PeerFilter {
                    unchoked_only: true,
                    has_capacity_for_outbound: Some(self.conf.max_block_requests_per_peer),
                    must_have_piece: Some(block.index),
                })
                .await;
            if peers.is_empty() {
                continue;
            }

            let request = BlockRequest {
                index: block.index,
                begin: block.begin,
                length: block.length,
            };
            let mut any_sent = false;
            for addr in peers {
                if self.swarm.send_request(addr, request).await {
                    any_sent = true;
                }
            }
            if any_sent {
                self.piece_manager.lock().await.mark_requested(block);
                self.dispatched_at
                    .lock()
                    .await
                    .insert((block.index, block.begin), Instant::now());
            }
        }
    }
}
