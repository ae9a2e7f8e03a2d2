//! End-to-end exercises of a `PeerSession` against a real loopback peer: a
//! fake remote speaking the wire protocol directly via `Framed`, driving our
//! side through `connect`/`handshake`/`read_message`/`send_message`.

use bitleech::{
    conf::PeerConf,
    protocol::{
        handshake::{Handshake, HandshakeCodec},
        message::{BlockRequest, Message, PeerCodec},
        peer::PeerSession,
    },
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, FramedParts};

const OUR_ID: [u8; 20] = *b"bl-0000000000000001";
const REMOTE_ID: [u8; 20] = *b"bl-0000000000000002";
const INFO_HASH: [u8; 20] = [7; 20];

/// Accepts one connection, performs the handshake as the remote peer, and
/// returns a message-framed socket for the rest of the exchange.
async fn accept_and_handshake(listener: &TcpListener) -> Framed<TcpStream, PeerCodec> {
    let (socket, _) = listener.accept().await.unwrap();
    let mut framed = Framed::new(socket, HandshakeCodec);

    let theirs = framed.next().await.unwrap().unwrap();
    assert_eq!(theirs.info_hash, INFO_HASH);
    assert_eq!(theirs.peer_id, OUR_ID);

    framed
        .send(Handshake::new(INFO_HASH, REMOTE_ID))
        .await
        .unwrap();

    let parts = framed.into_parts();
    let mut peer_parts = FramedParts::new(parts.io, PeerCodec);
    peer_parts.read_buf = parts.read_buf;
    peer_parts.write_buf = parts.write_buf;
    Framed::from_parts(peer_parts)
}

#[tokio::test]
async fn handshake_succeeds_over_loopback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let remote = tokio::spawn(async move {
        let _framed = accept_and_handshake(&listener).await;
    });

    let mut session = PeerSession::new(addr, PeerConf::default());
    session.connect().await.unwrap();
    session.handshake(OUR_ID, INFO_HASH).await.unwrap();
    assert_eq!(session.peer_id(), Some(REMOTE_ID));

    remote.await.unwrap();
}

#[tokio::test]
async fn exchanges_bitfield_and_piece_after_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let remote = tokio::spawn(async move {
        let mut framed = accept_and_handshake(&listener).await;

        framed
            .send(Message::Bitfield(Bytes::from(vec![0b1000_0000])))
            .await
            .unwrap();
        framed.send(Message::Unchoke).await.unwrap();

        let request = framed.next().await.unwrap().unwrap();
        let request = match request {
            Message::Request(r) => r,
            other => panic!("expected a request, got {:?}", other),
        };
        assert_eq!(request.index, 0);
        assert_eq!(request.begin, 0);

        framed
            .send(Message::Piece {
                index: request.index,
                begin: request.begin,
                block: Bytes::from(vec![0xAB; request.length as usize]),
            })
            .await
            .unwrap();
    });

    let mut session = PeerSession::new(addr, PeerConf::default());
    session.connect().await.unwrap();
    session.handshake(OUR_ID, INFO_HASH).await.unwrap();

    let bitfield_msg = session.read_message().await.unwrap();
    assert!(matches!(bitfield_msg, Message::Bitfield(_)));

    let unchoke_msg = session.read_message().await.unwrap();
    assert!(matches!(unchoke_msg, Message::Unchoke));

    session
        .send_message(Message::Request(BlockRequest {
            index: 0,
            begin: 0,
            length: 16384,
        }))
        .await
        .unwrap();

    let piece_msg = session.read_message().await.unwrap();
    match piece_msg {
        Message::Piece { index, begin, block } => {
            assert_eq!(index, 0);
            assert_eq!(begin, 0);
            assert_eq!(block.len(), 16384);
        }
        other => panic!("expected a piece message, got {:?}", other),
    }

    remote.await.unwrap();
}
