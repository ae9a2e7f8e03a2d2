//! Message framing: `length: u32 | id: u8 | payload`, decoded into a single
//! tagged [`Message`] enum rather than dispatched via runtime type lookup.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, PieceIndex};

const LEN_MARKER_LEN: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl MessageId {
    fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            9 => Self::Port,
            _ => return None,
        })
    }
}

/// A request or cancel's block coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: PieceIndex,
    pub begin: u32,
    pub length: u32,
}

/// A single wire message, including the implicit zero-length keep-alive.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    Bitfield(Bytes),
    Request(BlockRequest),
    Piece {
        index: PieceIndex,
        begin: u32,
        block: Bytes,
    },
    Cancel(BlockRequest),
    Port(u16),
}

/// Frames [`Message`]s after the handshake has completed.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {
            Message::KeepAlive => {
                buf.reserve(LEN_MARKER_LEN);
                buf.put_u32(0);
            }
            Message::Choke => encode_header(buf, 1, MessageId::Choke),
            Message::Unchoke => encode_header(buf, 1, MessageId::Unchoke),
            Message::Interested => encode_header(buf, 1, MessageId::Interested),
            Message::NotInterested => encode_header(buf, 1, MessageId::NotInterested),
            Message::Have(index) => {
                encode_header(buf, 5, MessageId::Have);
                buf.put_u32(index as u32);
            }
            Message::Bitfield(bytes) => {
                encode_header(buf, 1 + bytes.len() as u32, MessageId::Bitfield);
                buf.put_slice(&bytes);
            }
            Message::Request(r) => {
                encode_header(buf, 13, MessageId::Request);
                buf.put_u32(r.index as u32);
                buf.put_u32(r.begin);
                buf.put_u32(r.length);
            }
            Message::Piece { index, begin, block } => {
                encode_header(buf, 9 + block.len() as u32, MessageId::Piece);
                buf.put_u32(index as u32);
                buf.put_u32(begin);
                buf.put_slice(&block);
            }
            Message::Cancel(r) => {
                encode_header(buf, 13, MessageId::Cancel);
                buf.put_u32(r.index as u32);
                buf.put_u32(r.begin);
                buf.put_u32(r.length);
            }
            Message::Port(port) => {
                encode_header(buf, 3, MessageId::Port);
                buf.put_u16(port);
            }
        }
        Ok(())
    }
}

fn encode_header(buf: &mut BytesMut, len: u32, id: MessageId) {
    buf.reserve(LEN_MARKER_LEN + 1 + len as usize - 1);
    buf.put_u32(len);
    buf.put_u8(id as u8);
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < LEN_MARKER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
        if len == 0 {
            buf.advance(LEN_MARKER_LEN);
            return Ok(Some(Message::KeepAlive));
        }
        if buf.len() < LEN_MARKER_LEN + len {
            buf.reserve(LEN_MARKER_LEN + len - buf.len());
            return Ok(None);
        }

        buf.advance(LEN_MARKER_LEN);
        let id = buf[0];
        let mut payload = buf.split_to(len).freeze();
        payload.advance(1);

        let msg = match MessageId::from_u8(id) {
            Some(MessageId::Choke) => Message::Choke,
            Some(MessageId::Unchoke) => Message::Unchoke,
            Some(MessageId::Interested) => Message::Interested,
            Some(MessageId::NotInterested) => Message::NotInterested,
            Some(MessageId::Have) => {
                Message::Have(read_u32(&payload)? as PieceIndex)
            }
            Some(MessageId::Bitfield) => Message::Bitfield(payload),
            Some(MessageId::Request) => Message::Request(read_block_request(&payload)?),
            Some(MessageId::Piece) => {
                let index = read_u32(&payload[0..4])? as PieceIndex;
                let begin = read_u32(&payload[4..8])?;
                let block = payload.slice(8..);
                Message::Piece { index, begin, block }
            }
            Some(MessageId::Cancel) => Message::Cancel(read_block_request(&payload)?),
            Some(MessageId::Port) => {
                if payload.len() < 2 {
                    return Err(Error::UnknownMessage { id, payload_len: payload.len() });
                }
                Message::Port(u16::from_be_bytes([payload[0], payload[1]]))
            }
            None => {
                return Err(Error::UnknownMessage {
                    id,
                    payload_len: payload.len(),
                })
            }
        };
        Ok(Some(msg))
    }
}

fn read_u32(bytes: &[u8]) -> Result<u32, Error> {
    let arr: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::Fatal("short integer field in message payload".into()))?;
    Ok(u32::from_be_bytes(arr))
}

fn read_block_request(payload: &[u8]) -> Result<BlockRequest, Error> {
    Ok(BlockRequest {
        index: read_u32(&payload[0..4])? as PieceIndex,
        begin: read_u32(&payload[4..8])?,
        length: read_u32(&payload[8..12])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn round_trips_fixed_messages() {
        round_trip(Message::KeepAlive);
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have(42));
        round_trip(Message::Port(6881));
    }

    #[test]
    fn round_trips_bitfield_of_varying_lengths() {
        for len in [0, 1, 8, 9] {
            round_trip(Message::Bitfield(Bytes::from(vec![0xAA; len])));
        }
    }

    #[test]
    fn round_trips_request_piece_cancel() {
        round_trip(Message::Request(BlockRequest {
            index: 3,
            begin: 16384,
            length: 16384,
        }));
        round_trip(Message::Piece {
            index: 3,
            begin: 0,
            block: Bytes::from(vec![1, 2, 3, 4]),
        });
        round_trip(Message::Cancel(BlockRequest {
            index: 3,
            begin: 0,
            length: 16384,
        }));
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::Have(1), &mut buf).unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_unknown_message_id() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        let mut codec = PeerCodec;
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::UnknownMessage { id: 200, .. })
        ));
    }
}
