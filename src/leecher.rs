//! The orchestrator: handshakes new peers, reacts to inbound `piece`
//! messages, and commits verified pieces to disk.

use std::{net::SocketAddr, sync::Arc};

use tokio::sync::Mutex;

use crate::{
    conf::{Conf, LeecherConf},
    error::Result,
    file_storage::FileStorage,
    metainfo::Metainfo,
    pieces::{BlockStatus, PieceManager, PieceOutcome},
    piece_requester::PieceRequester,
    storage_info::StorageInfo,
    swarm::{Swarm, SwarmEvent},
    protocol::Message,
    PieceIndex,
};

pub struct Leecher {
    swarm: Arc<Swarm>,
    piece_manager: Arc<Mutex<PieceManager>>,
    storage: FileStorage,
    metainfo: Metainfo,
    conf: LeecherConf,
    requester: Arc<PieceRequester>,
}

impl Leecher {
    pub fn new(metainfo: Metainfo, conf: Conf) -> Result<Self> {
        let storage_info = StorageInfo::new(&metainfo, conf.leecher.download_dir.clone());
        let piece_manager = Arc::new(Mutex::new(PieceManager::new(
            &metainfo,
            &storage_info,
            conf.requester.sort_by_rarity,
        )?));
        let swarm = Swarm::new(
            Arc::clone(&piece_manager),
            conf.swarm,
            conf.peer,
            conf.engine.client_id,
            metainfo.info_hash,
        );
        let requester = Arc::new(PieceRequester::new(
            Arc::clone(&swarm),
            Arc::clone(&piece_manager),
            conf.requester,
        ));
        let storage = FileStorage::new(storage_info);

        Ok(Self {
            swarm,
            piece_manager,
            storage,
            metainfo,
            conf: conf.leecher,
            requester,
        })
    }

    /// Connects to the given peer addresses and runs the download until
    /// every piece is locally complete.
    pub async fn run(self: Arc<Self>, peer_addrs: impl IntoIterator<Item = SocketAddr>) {
        let mut events = self.swarm.subscribe().await;

        for addr in peer_addrs {
            let swarm = Arc::clone(&self.swarm);
            tokio::spawn(async move {
                swarm.add_peer(addr).await;
            });
        }

        let requester = Arc::clone(&self.requester);
        let requester_task = tokio::spawn(async move {
            requester.run().await;
        });

        while let Some(event) = events.recv().await {
            match event {
                SwarmEvent::PeerConnected(addr) => {
                    self.swarm.send_interested(addr).await;
                }
                SwarmEvent::PeerMessage(
                    addr,
                    Message::Piece { index, begin, block },
                ) => {
                    self.handle_piece(addr, index, begin, &block).await;
                }
                SwarmEvent::PeerMessage(..) | SwarmEvent::PeerDisconnected(_) => {}
            }

            if self.piece_manager.lock().await.is_complete() {
                log::info!("download complete");
                break;
            }
        }

        requester_task.abort();
        self.swarm.shutdown().await;
    }

    /// Implements the five-step inbound `piece` handling algorithm: in-flight
    /// / policy check, status check, length check, write, and (on piece
    /// completion) verify, flush, and broadcast.
    async fn handle_piece(&self, addr: SocketAddr, index: PieceIndex, begin: u32, data: &[u8]) {
        let was_requested = self.swarm.take_in_flight(addr, index, begin).await;
        if !was_requested && !self.conf.accept_unrequested_blocks {
            log::debug!(
                "dropping unrequested block (piece {}, begin {}) from {}",
                index,
                begin,
                addr
            );
            return;
        }

        let status = self.piece_manager.lock().await.block_status(index, begin);
        if status == Some(BlockStatus::Available) {
            log::debug!(
                "dropping duplicate block (piece {}, begin {}): already AVAILABLE",
                index,
                begin
            );
            return;
        }

        if let Err(e) = self
            .piece_manager
            .lock()
            .await
            .write_block(index, begin, data)
        {
            log::error!(
                "failed to write block (piece {}, begin {}): {}",
                index,
                begin,
                e
            );
            return;
        }

        if !self.piece_manager.lock().await.is_piece_complete(index) {
            return;
        }

        let expected_hash = match self.metainfo.piece_hash(index) {
            Ok(hash) => hash,
            Err(e) => {
                log::error!("cannot verify piece {}: {}", index, e);
                return;
            }
        };

        let outcome = match self
            .piece_manager
            .lock()
            .await
            .finish_piece(index, &expected_hash)
        {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("failed to finish piece {}: {}", index, e);
                return;
            }
        };

        match outcome {
            PieceOutcome::HashMismatch => {
                log::warn!(
                    "piece {} failed hash verification (expected {}), blocks re-queued",
                    index,
                    hex::encode(expected_hash)
                );
            }
            PieceOutcome::Verified(buffer) => {
                if let Err(e) = self.storage.write_piece(index, &buffer).await {
                    log::error!("failed to write piece {} to disk: {}", index, e);
                    return;
                }
                self.piece_manager.lock().await.mark_complete(index);
                self.swarm.broadcast_have(index).await;
                log::info!("piece {} committed to disk", index);
            }
        }
    }
}
