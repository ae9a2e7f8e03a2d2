//! Owns the peer set, multiplexes peer events to subscribers, and enforces
//! keep-alive / inactivity / broadcast-have.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Instant};

use futures::stream::{SplitStream, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time,
};
use tokio_util::codec::Framed;

use crate::{
    conf::{PeerConf, SwarmConf},
    pieces::PieceManager,
    protocol::{
        message::{BlockRequest, PeerCodec},
        peer::{ConnectionState, PeerSession},
        Message,
    },
    PeerId, PieceIndex, Sha1Hash,
};

/// An event fanned out to every subscriber.
#[derive(Clone, Debug)]
pub enum SwarmEvent {
    /// A peer finished its handshake and is ready to be used.
    PeerConnected(SocketAddr),
    /// A peer sent a message. Status-affecting messages (choke/unchoke/
    /// interested/not-interested/have/bitfield) have already been folded
    /// into the peer's and piece manager's state by the time this is
    /// delivered.
    PeerMessage(SocketAddr, Message),
    /// A peer was removed from the swarm, due to an error or inactivity.
    PeerDisconnected(SocketAddr),
}

struct PeerHandle {
    session: Arc<Mutex<PeerSession>>,
    reader_task: JoinHandle<()>,
    keep_alive_task: JoinHandle<()>,
    inactivity_task: JoinHandle<()>,
}

impl PeerHandle {
    fn abort_all(&self) {
        self.reader_task.abort();
        self.keep_alive_task.abort();
        self.inactivity_task.abort();
    }
}

/// Which peers a caller is interested in, combinable via [`get_peers`](Swarm::get_peers).
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerFilter {
    pub unchoked_only: bool,
    pub has_capacity_for_outbound: Option<usize>,
    pub must_have_piece: Option<PieceIndex>,
}

/// Owns every peer session and fans out their events to subscribers.
pub struct Swarm {
    peers: Mutex<HashMap<SocketAddr, PeerHandle>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SwarmEvent>>>,
    piece_manager: Arc<Mutex<PieceManager>>,
    conf: SwarmConf,
    peer_conf: PeerConf,
    our_id: PeerId,
    info_hash: Sha1Hash,
}

impl Swarm {
    pub fn new(
        piece_manager: Arc<Mutex<PieceManager>>,
        conf: SwarmConf,
        peer_conf: PeerConf,
        our_id: PeerId,
        info_hash: Sha1Hash,
    ) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            piece_manager,
            conf,
            peer_conf,
            our_id,
            info_hash,
        })
    }

    /// Registers a new event subscriber. Dropping the receiver unsubscribes.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<SwarmEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        rx
    }

    async fn publish(&self, event: SwarmEvent) {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Connects to and handshakes a new peer, then spawns its reader,
    /// keep-alive, and inactivity tasks. Enforces `max_connections`.
    pub async fn add_peer(self: &Arc<Self>, addr: SocketAddr) {
        {
            let peers = self.peers.lock().await;
            if peers.len() >= self.conf.max_connections {
                log::debug!("not adding peer {}: at max_connections", addr);
                return;
            }
            if peers.contains_key(&addr) {
                return;
            }
        }

        let mut session = PeerSession::new(addr, self.peer_conf);
        if let Err(e) = session.connect().await {
            log::warn!("failed to connect to peer {}: {}", addr, e);
            return;
        }
        if let Err(e) = session.handshake(self.our_id, self.info_hash).await {
            log::warn!("failed to handshake with peer {}: {}", addr, e);
            return;
        }
        let reader = session
            .take_reader()
            .expect("handshake always populates the reader");

        let session = Arc::new(Mutex::new(session));

        let reader_task = tokio::spawn(Self::run_reader(
            Arc::clone(self),
            addr,
            Arc::clone(&session),
            reader,
        ));
        let keep_alive_task = tokio::spawn(Self::run_keep_alive(
            Arc::clone(self),
            addr,
            Arc::clone(&session),
        ));
        let inactivity_task = tokio::spawn(Self::run_inactivity_monitor(
            Arc::clone(self),
            addr,
            Arc::clone(&session),
        ));

        self.peers.lock().await.insert(
            addr,
            PeerHandle {
                session,
                reader_task,
                keep_alive_task,
                inactivity_task,
            },
        );

        self.publish(SwarmEvent::PeerConnected(addr)).await;
    }

    /// Removes a peer, cancelling its three tasks and closing its socket.
    pub async fn remove_peer(&self, addr: SocketAddr) {
        let handle = self.peers.lock().await.remove(&addr);
        if let Some(handle) = handle {
            handle.abort_all();
            handle.session.lock().await.disconnect();
            self.publish(SwarmEvent::PeerDisconnected(addr)).await;
        }
    }

    /// Cancels every per-peer task and drops every peer.
    pub async fn shutdown(&self) {
        let mut peers = self.peers.lock().await;
        for (_, handle) in peers.drain() {
            handle.abort_all();
            handle.session.lock().await.disconnect();
        }
    }

    /// Drives the read half of the peer's socket on its own, taken out of
    /// `PeerSession` before it was wrapped in a mutex. This is deliberate:
    /// `reader.next()` blocks until the peer sends a frame, which on a
    /// freshly handshaken, otherwise-silent peer can be indefinite, and
    /// every write path (requests, keep-alives, have-broadcasts) needs the
    /// session lock too. Holding that lock across the read would starve
    /// every writer for as long as the peer stays quiet.
    async fn run_reader(
        self_: Arc<Self>,
        addr: SocketAddr,
        session: Arc<Mutex<PeerSession>>,
        mut reader: SplitStream<Framed<TcpStream, PeerCodec>>,
    ) {
        loop {
            let msg = match reader.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    log::info!("peer {} reader loop ending: {}", addr, e);
                    self_.remove_peer(addr).await;
                    return;
                }
                None => {
                    log::info!("peer {} closed the connection", addr);
                    self_.remove_peer(addr).await;
                    return;
                }
            };

            {
                let mut session = session.lock().await;
                session.last_read_at = Instant::now();
            }

            self_.handle_local(addr, &session, &msg).await;
            self_.publish(SwarmEvent::PeerMessage(addr, msg)).await;
        }
    }

    /// Applies the subset of incoming messages that affect local peer or
    /// piece-manager state, before the message is fanned out to subscribers.
    async fn handle_local(&self, addr: SocketAddr, session: &Arc<Mutex<PeerSession>>, msg: &Message) {
        let mut session = session.lock().await;
        match msg {
            Message::Choke => session.flags.set_they_choking(true),
            Message::Unchoke => session.flags.set_they_choking(false),
            Message::Interested => session.flags.set_they_interested(true),
            Message::NotInterested => session.flags.set_they_interested(false),
            Message::Have(index) => {
                session.bitfield.set(*index);
                self.piece_manager.lock().await.record_have(*index);
            }
            Message::Bitfield(bytes) => {
                let piece_count = self.piece_manager.lock().await.piece_count();
                match crate::bitfield::Bitfield::from_bytes(bytes, piece_count) {
                    Some(bitfield) => {
                        self.piece_manager.lock().await.record_bitfield(&bitfield);
                        session.bitfield = bitfield;
                    }
                    None => {
                        log::warn!("peer {} sent an invalid bitfield", addr);
                    }
                }
            }
            _ => {}
        }
    }

    async fn run_keep_alive(self_: Arc<Self>, addr: SocketAddr, session: Arc<Mutex<PeerSession>>) {
        loop {
            let wait = {
                let session = session.lock().await;
                let elapsed = session.last_write_at.elapsed();
                self_.conf.keep_alive_interval.saturating_sub(elapsed)
            };
            if !wait.is_zero() {
                time::sleep(wait).await;
                continue;
            }
            let result = session.lock().await.send_message(Message::KeepAlive).await;
            if let Err(e) = result {
                log::info!("peer {} keep-alive failed: {}", addr, e);
                self_.remove_peer(addr).await;
                return;
            }
        }
    }

    async fn run_inactivity_monitor(
        self_: Arc<Self>,
        addr: SocketAddr,
        session: Arc<Mutex<PeerSession>>,
    ) {
        loop {
            let wait = {
                let session = session.lock().await;
                let elapsed = session.last_read_at.elapsed();
                self_.conf.inactivity_timeout.saturating_sub(elapsed)
            };
            if wait.is_zero() {
                log::info!("peer {} timed out due to inactivity", addr);
                self_.remove_peer(addr).await;
                return;
            }
            time::sleep(wait).await;
        }
    }

    /// Sends `request(index, begin, length)` to a specific peer.
    pub async fn send_request(&self, addr: SocketAddr, request: BlockRequest) -> bool {
        let handle = self.peers.lock().await.get(&addr).map(|h| Arc::clone(&h.session));
        let Some(session) = handle else { return false };
        let mut session = session.lock().await;
        session.in_flight_outbound.insert((request.index, request.begin));
        session.send_message(Message::Request(request)).await.is_ok()
    }

    /// Sends `interested` to a peer.
    pub async fn send_interested(&self, addr: SocketAddr) -> bool {
        self.send_simple(addr, Message::Interested).await
    }

    async fn send_simple(&self, addr: SocketAddr, msg: Message) -> bool {
        let handle = self.peers.lock().await.get(&addr).map(|h| Arc::clone(&h.session));
        let Some(session) = handle else { return false };
        session.lock().await.send_message(msg).await.is_ok()
    }

    /// Broadcasts `have(index)` to every connected, unchoking peer, unless
    /// `send_redundant_have` is disabled and the peer already advertised it.
    pub async fn broadcast_have(&self, index: PieceIndex) {
        let peers: Vec<_> = self
            .peers
            .lock()
            .await
            .iter()
            .map(|(addr, handle)| (*addr, Arc::clone(&handle.session)))
            .collect();

        for (addr, session) in peers {
            let should_send = {
                let session = session.lock().await;
                if session.state != ConnectionState::Handshaken || session.flags.they_choking() {
                    false
                } else {
                    self.conf.send_redundant_have || !session.bitfield.has(index)
                }
            };
            if !should_send {
                continue;
            }
            let result = session.lock().await.send_message(Message::Have(index)).await;
            if result.is_err() {
                self.remove_peer(addr).await;
            }
        }
    }

    /// Returns the addresses of connected peers matching `filter`.
    pub async fn get_peers(&self, filter: PeerFilter) -> Vec<SocketAddr> {
        let peers = self.peers.lock().await;
        let mut matches = Vec::new();
        for (addr, handle) in peers.iter() {
            let session = handle.session.lock().await;
            if session.state != ConnectionState::Handshaken {
                continue;
            }
            if filter.unchoked_only && session.flags.they_choking() {
                continue;
            }
            if let Some(max) = filter.has_capacity_for_outbound {
                if !session.has_capacity_for_outbound_request(max) {
                    continue;
                }
            }
            if let Some(index) = filter.must_have_piece {
                if !session.bitfield.has(index) {
                    continue;
                }
            }
            matches.push(*addr);
        }
        matches
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Removes `(index, begin)` from `addr`'s in-flight outbound set,
    /// returning whether it was present.
    pub async fn take_in_flight(&self, addr: SocketAddr, index: PieceIndex, begin: u32) -> bool {
        let handle = self.peers.lock().await.get(&addr).map(|h| Arc::clone(&h.session));
        let Some(session) = handle else { return false };
        session.lock().await.in_flight_outbound.remove(&(index, begin))
    }

    /// Purges `(index, begin)` from every peer's in-flight outbound set,
    /// e.g. after the requester reverts a timed-out block to missing.
    pub async fn purge_in_flight(&self, index: PieceIndex, begin: u32) {
        let peers = self.peers.lock().await;
        for handle in peers.values() {
            handle.session.lock().await.in_flight_outbound.remove(&(index, begin));
        }
    }
}
