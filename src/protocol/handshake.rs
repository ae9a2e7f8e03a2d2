//! The fixed 68 byte greeting exchanged immediately after connecting,
//! authenticating both protocol and content identity.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, PeerId, Sha1Hash};

/// Protocol v1's identifier string, prefixed on the wire by its length.
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

const PSTRLEN: u8 = 19;
const RESERVED_LEN: usize = 8;
pub const HANDSHAKE_LEN: usize =
    1 + PROTOCOL_STRING.len() + RESERVED_LEN + 20 + 20;

/// A decoded handshake frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }
}

/// Frames the handshake exactly once per connection; afterwards the socket
/// is handed over to [`PeerCodec`](super::message::PeerCodec).
#[derive(Clone, Copy, Debug, Default)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<(), Self::Error> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(PSTRLEN);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&[0; RESERVED_LEN]);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < 1 {
            return Ok(None);
        }
        let pstrlen = buf[0] as usize;
        let frame_len = 1 + pstrlen + RESERVED_LEN + 20 + 20;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(frame_len);
        frame.advance(1);
        let pstr = frame.split_to(pstrlen);
        if pstr != PROTOCOL_STRING.as_bytes() {
            return Err(Error::PeerError(format!(
                "unsupported protocol string {:?}",
                String::from_utf8_lossy(&pstr)
            )));
        }
        frame.advance(RESERVED_LEN);

        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&frame.split_to(20));
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&frame.split_to(20));

        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_codec() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        codec.encode(handshake, &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        codec.encode(handshake, &mut buf).unwrap();
        let mut partial = buf.split_to(HANDSHAKE_LEN - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_wrong_protocol_string() {
        let mut buf = BytesMut::new();
        buf.put_u8(PSTRLEN);
        buf.put_slice(b"not the right protocol str");
        buf.put_slice(&[0; RESERVED_LEN]);
        buf.put_slice(&[0; 20]);
        buf.put_slice(&[0; 20]);
        let mut codec = HandshakeCodec;
        assert!(codec.decode(&mut buf).is_err());
    }
}
