//! A single peer connection: handshake, framed reads/writes, and the
//! status/in-flight bookkeeping that doesn't belong to the swarm that owns
//! this session.

use std::{collections::HashSet, net::SocketAddr, time::Instant};

use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    bitfield::Bitfield,
    conf::PeerConf,
    error::{Error, PeerError, Result},
    PeerId, PieceIndex, Sha1Hash,
};

use super::{
    handshake::{Handshake, HandshakeCodec},
    message::{Message, PeerCodec},
};

/// Connection lifecycle. Monotonic except that any I/O failure drives it
/// straight to the terminal `Closed` state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Handshaken,
    Closed,
}

const THEY_CHOKING: u8 = 1 << 0;
const THEY_INTERESTED: u8 = 1 << 1;
const WE_CHOKING: u8 = 1 << 2;
const WE_INTERESTED: u8 = 1 << 3;

/// The four-bit orthogonal choke/interested lattice, as a bitset rather
/// than a set of string flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerFlags(u8);

impl Default for PeerFlags {
    fn default() -> Self {
        Self(THEY_CHOKING | WE_CHOKING)
    }
}

impl PeerFlags {
    pub fn they_choking(&self) -> bool {
        self.0 & THEY_CHOKING != 0
    }

    pub fn they_interested(&self) -> bool {
        self.0 & THEY_INTERESTED != 0
    }

    pub fn we_choking(&self) -> bool {
        self.0 & WE_CHOKING != 0
    }

    pub fn we_interested(&self) -> bool {
        self.0 & WE_INTERESTED != 0
    }

    pub fn set_they_choking(&mut self, v: bool) {
        self.set(THEY_CHOKING, v);
    }

    pub fn set_they_interested(&mut self, v: bool) {
        self.set(THEY_INTERESTED, v);
    }

    pub fn set_we_choking(&mut self, v: bool) {
        self.set(WE_CHOKING, v);
    }

    pub fn set_we_interested(&mut self, v: bool) {
        self.set(WE_INTERESTED, v);
    }

    fn set(&mut self, bit: u8, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// A `(piece, block)` pair, identified by its begin offset within the
/// piece.
pub type BlockKey = (PieceIndex, u32);

/// A single peer session: one TCP connection plus the session-local state
/// the swarm doesn't track on its own behalf.
pub struct PeerSession {
    pub addr: SocketAddr,
    pub state: ConnectionState,
    pub flags: PeerFlags,
    /// The pieces this peer has announced possession of.
    pub bitfield: Bitfield,
    /// Blocks we've requested from this peer and are awaiting.
    pub in_flight_outbound: HashSet<BlockKey>,
    /// Blocks this peer has requested from us and we haven't sent yet.
    pub in_flight_inbound: HashSet<BlockKey>,
    pub last_read_at: Instant,
    pub last_write_at: Instant,
    pub uploaded: u64,
    pub downloaded: u64,
    peer_id: Option<PeerId>,
    /// The raw socket, held here only between `connect()` and `handshake()`.
    raw_socket: Option<TcpStream>,
    /// The read half of the framed socket, populated once the handshake
    /// codec has been swapped for the message codec. Split off from the
    /// write half so a caller can pull it out and drive it on its own task
    /// without holding this session's lock across a blocking read -- see
    /// [`take_reader`](Self::take_reader).
    reader: Option<SplitStream<Framed<TcpStream, PeerCodec>>>,
    /// The write half of the framed socket.
    writer: Option<SplitSink<Framed<TcpStream, PeerCodec>, Message>>,
    conf: PeerConf,
}

impl PeerSession {
    /// Constructs a not-yet-connected session for an outbound peer address.
    pub fn new(addr: SocketAddr, conf: PeerConf) -> Self {
        let now = Instant::now();
        Self {
            addr,
            state: ConnectionState::Disconnected,
            flags: PeerFlags::default(),
            bitfield: Bitfield::new(0),
            in_flight_outbound: HashSet::new(),
            in_flight_inbound: HashSet::new(),
            last_read_at: now,
            last_write_at: now,
            uploaded: 0,
            downloaded: 0,
            peer_id: None,
            raw_socket: None,
            reader: None,
            writer: None,
            conf,
        }
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    pub fn has_capacity_for_outbound_request(&self, max_per_peer: usize) -> bool {
        self.in_flight_outbound.len() < max_per_peer
    }

    /// Dials the peer's address with a deadline. On success, transitions to
    /// `Connected`.
    pub async fn connect(&mut self) -> Result<(), PeerError> {
        log::info!("connecting to peer {}", self.addr);
        let socket = timeout(self.conf.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| PeerError(format!("connect to {} timed out", self.addr)))??;
        self.raw_socket = Some(socket);
        self.state = ConnectionState::Connected;
        log::info!("connected to peer {}", self.addr);
        Ok(())
    }

    /// Sends our handshake, reads the peer's, and verifies it against
    /// `expected_info_hash`. On success, transitions to `Handshaken` and
    /// swaps the framed codec over to [`PeerCodec`].
    pub async fn handshake(
        &mut self,
        our_id: PeerId,
        expected_info_hash: Sha1Hash,
    ) -> Result<(), PeerError> {
        let raw_socket = self
            .raw_socket
            .take()
            .ok_or_else(|| PeerError("handshake attempted before connect".into()))?;
        let mut handshake_socket =
            Framed::with_capacity(raw_socket, HandshakeCodec, self.conf.chunk_size);

        let ours = Handshake::new(expected_info_hash, our_id);
        handshake_socket
            .send(ours)
            .await
            .map_err(|e| PeerError(e.to_string()))?;

        let theirs = timeout(self.conf.handshake_timeout, handshake_socket.next())
            .await
            .map_err(|_| PeerError(format!("handshake with {} timed out", self.addr)))?
            .ok_or_else(|| PeerError(format!("peer {} closed before handshaking", self.addr)))?
            .map_err(|e| PeerError(e.to_string()))?;

        if theirs.info_hash != expected_info_hash {
            self.state = ConnectionState::Closed;
            return Err(PeerError(format!(
                "peer {} handshake info hash mismatch",
                self.addr
            )));
        }

        self.peer_id = Some(theirs.peer_id);
        self.state = ConnectionState::Handshaken;
        self.last_read_at = Instant::now();

        let parts = handshake_socket.into_parts();
        let mut peer_parts = FramedParts::new(parts.io, PeerCodec);
        peer_parts.read_buf = parts.read_buf;
        peer_parts.write_buf = parts.write_buf;
        let (writer, reader) = Framed::from_parts(peer_parts).split();
        self.writer = Some(writer);
        self.reader = Some(reader);

        log::info!("handshaken with peer {}", self.addr);
        Ok(())
    }

    /// Takes ownership of the read half, so a caller can drive it on its own
    /// task without holding this session's lock across a blocking read. Only
    /// meaningful once [`handshake`](Self::handshake) has completed; returns
    /// `None` if called twice or before handshaking.
    pub fn take_reader(&mut self) -> Option<SplitStream<Framed<TcpStream, PeerCodec>>> {
        self.reader.take()
    }

    /// Reads the next message frame from the still-owned read half, updating
    /// `last_read_at`. Once [`take_reader`](Self::take_reader) has been
    /// called, this always fails; the taker is responsible for reading.
    pub async fn read_message(&mut self) -> Result<Message, PeerError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| PeerError("read attempted before handshake, or reader taken".into()))?;
        let msg = reader
            .next()
            .await
            .ok_or_else(|| PeerError(format!("peer {} closed the connection", self.addr)))?
            .map_err(|e| PeerError(e.to_string()))?;
        self.last_read_at = Instant::now();
        Ok(msg)
    }

    /// Serializes and writes a message, updating `last_write_at`.
    pub async fn send_message(&mut self, msg: Message) -> Result<(), PeerError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PeerError("send attempted before handshake".into()))?;
        writer.send(msg).await.map_err(|e| PeerError(e.to_string()))?;
        self.last_write_at = Instant::now();
        Ok(())
    }

    /// Idempotent close. Does nothing if already closed.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        log::info!("disconnecting peer {}", self.addr);
        self.raw_socket = None;
        self.reader = None;
        self.writer = None;
        self.state = ConnectionState::Closed;
    }
}

impl From<Error> for PeerError {
    fn from(e: Error) -> Self {
        PeerError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags_match_initial_handshaken_state() {
        let flags = PeerFlags::default();
        assert!(flags.they_choking());
        assert!(flags.we_choking());
        assert!(!flags.they_interested());
        assert!(!flags.we_interested());
    }

    #[test]
    fn flags_toggle_independently() {
        let mut flags = PeerFlags::default();
        flags.set_they_choking(false);
        assert!(!flags.they_choking());
        assert!(flags.we_choking());
        flags.set_we_interested(true);
        assert!(flags.we_interested());
        assert!(!flags.they_choking());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut session = PeerSession::new(
            "127.0.0.1:6881".parse().unwrap(),
            PeerConf::default(),
        );
        session.disconnect();
        assert_eq!(session.state, ConnectionState::Closed);
        session.disconnect();
        assert_eq!(session.state, ConnectionState::Closed);
    }

    #[test]
    fn capacity_check_respects_max_per_peer() {
        let mut session = PeerSession::new(
            "127.0.0.1:6881".parse().unwrap(),
            PeerConf::default(),
        );
        assert!(session.has_capacity_for_outbound_request(1));
        session.in_flight_outbound.insert((0, 0));
        assert!(!session.has_capacity_for_outbound_request(1));
    }
}
