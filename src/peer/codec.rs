//! The BitTorrent wire format: the 68 byte handshake and the length
//! prefixed message frames of BEP 3, plus the BEP 6 have-all/have-none and
//! BEP 10 extended message shapes.
//!
//! The handshake is exchanged through a [`tokio_util::codec::Framed`]
//! transport by the socket driver. Steady-state messages are decoded in the
//! scheduling domain straight out of a [`ChunkedBuffer`]: control messages
//! are extracted with one small allocation, while a PIECE frame is only
//! peeked at, so its payload can land in the destination piece buffer with
//! a single copy.

use std::convert::{TryFrom, TryInto};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    chunked_buf::ChunkedBuffer,
    error::{Error, Result},
    Bitfield, Block, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The length prefix, message id, piece index and offset of a PIECE frame.
pub(crate) const PIECE_HEADER_LEN: usize = 4 + 1 + 8;

/// The handshake's reserved bits we understand, as (byte, mask) pairs:
/// extended messaging, the fast extension, and DHT support (the leftmost
/// bit of the first reserved byte).
const EXTENDED_FLAG: (usize, u8) = (5, 0x10);
const FAST_FLAG: (usize, u8) = (7, 0x04);
const DHT_FLAG: (usize, u8) = (0, 0x80);

/// The first message of every connection, sent by both sides.
#[derive(Clone, Debug)]
pub(crate) struct Handshake {
    /// The protocol string, must equal [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Reserved extension bits.
    pub reserved: [u8; 8],
    /// The torrent's identity.
    pub info_hash: Sha1Hash,
    /// The sender's arbitrary 20 byte id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Creates our side of the handshake. We always advertise extended
    /// messaging and the fast extension; DHT only when the engine has it
    /// enabled.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId, dht: bool) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        let mut reserved = [0; 8];
        reserved[EXTENDED_FLAG.0] |= EXTENDED_FLAG.1;
        reserved[FAST_FLAG.0] |= FAST_FLAG.1;
        if dht {
            reserved[DHT_FLAG.0] |= DHT_FLAG.1;
        }
        Self {
            prot,
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extended(&self) -> bool {
        self.reserved[EXTENDED_FLAG.0] & EXTENDED_FLAG.1 != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved[FAST_FLAG.0] & FAST_FLAG.1 != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[DHT_FLAG.0] & DHT_FLAG.1 != 0
    }

    /// The length of the handshake on the wire.
    pub const fn len() -> usize {
        1 + 19 + 8 + 20 + 20
    }
}

/// Codec for the handshake phase, used with `Framed` by the socket driver.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        buf.reserve(Handshake::len());
        buf.put_u8(19);
        buf.put_slice(&handshake.prot);
        buf.put_slice(&handshake.reserved);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }
        // the protocol string length must be valid before waiting for the
        // rest, otherwise a garbage peer could stall us for a full buffer
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(Error::ProtocolViolation("handshake protocol string"));
        }
        if buf.len() < Handshake::len() {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::ProtocolViolation("handshake protocol string"));
        }
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The message ids of BEP 3, 6 and 10.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    HaveAll = 0x0e,
    HaveNone = 0x0f,
    Extended = 20,
}

impl std::convert::TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        use MessageId::*;
        match id {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Piece),
            8 => Ok(Cancel),
            0x0e => Ok(HaveAll),
            0x0f => Ok(HaveNone),
            20 => Ok(Extended),
            _ => Err(Error::ProtocolViolation("unknown message id")),
        }
    }
}

/// A protocol message, minus PIECE, whose inbound path never materializes
/// a message value (see [`Decoded::Piece`]). Outbound piece payloads are
/// sent as [`Message::Block`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: PieceIndex },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Cancel(BlockInfo),
    Block { info: BlockInfo, data: Bytes },
    HaveAll,
    HaveNone,
    Extended { id: u8, payload: Bytes },
}

impl Message {
    /// Appends the message's frame, including the length prefix, to the
    /// outbound buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        use Message::*;
        match self {
            KeepAlive => buf.put_u32(0),
            Choke => Self::encode_header(buf, MessageId::Choke, 0),
            Unchoke => Self::encode_header(buf, MessageId::Unchoke, 0),
            Interested => Self::encode_header(buf, MessageId::Interested, 0),
            NotInterested => {
                Self::encode_header(buf, MessageId::NotInterested, 0)
            }
            Have { piece_index } => {
                Self::encode_header(buf, MessageId::Have, 4);
                buf.put_u32(*piece_index as u32);
            }
            Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                Self::encode_header(buf, MessageId::Bitfield, raw.len());
                buf.put_slice(raw);
            }
            Request(block) => {
                Self::encode_header(buf, MessageId::Request, 12);
                Self::encode_block_info(buf, block);
            }
            Cancel(block) => {
                Self::encode_header(buf, MessageId::Cancel, 12);
                Self::encode_block_info(buf, block);
            }
            Block { info, data } => {
                Self::encode_header(buf, MessageId::Piece, 8 + data.len());
                buf.put_u32(info.piece_index as u32);
                buf.put_u32(info.offset);
                buf.put_slice(data);
            }
            HaveAll => Self::encode_header(buf, MessageId::HaveAll, 0),
            HaveNone => Self::encode_header(buf, MessageId::HaveNone, 0),
            Extended { id, payload } => {
                Self::encode_header(
                    buf,
                    MessageId::Extended,
                    1 + payload.len(),
                );
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
    }

    fn encode_header(buf: &mut BytesMut, id: MessageId, payload_len: usize) {
        buf.reserve(4 + 1 + payload_len);
        buf.put_u32(1 + payload_len as u32);
        buf.put_u8(id as u8);
    }

    fn encode_block_info(buf: &mut BytesMut, block: &BlockInfo) {
        buf.put_u32(block.piece_index as u32);
        buf.put_u32(block.offset);
        buf.put_u32(block.len);
    }
}

impl From<Block> for Message {
    fn from(block: Block) -> Self {
        Message::Block {
            info: block.info(),
            data: block.data,
        }
    }
}

/// The header of a PIECE frame whose payload is still in the receive
/// buffer, starting at logical offset [`PIECE_HEADER_LEN`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PieceHeader {
    pub piece_index: PieceIndex,
    pub offset: u32,
    pub data_len: u32,
}

impl PieceHeader {
    /// The whole frame's length: header plus payload.
    pub fn frame_len(&self) -> usize {
        PIECE_HEADER_LEN + self.data_len as usize
    }
}

/// One step of the inbound decode loop.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decoded {
    /// A complete message, already consumed from the buffer.
    Message(Message),
    /// A complete PIECE frame. Nothing has been consumed: the caller lands
    /// the payload with `ChunkedBuffer::copy_to` from offset
    /// [`PIECE_HEADER_LEN`] and then discards [`PieceHeader::frame_len`]
    /// bytes.
    Piece(PieceHeader),
}

/// Decodes the next complete frame out of the receive buffer, or `None` if
/// more bytes are needed. Frames longer than `max_frame_len` are a protocol
/// violation.
pub(crate) fn decode_message(
    buf: &mut ChunkedBuffer,
    max_frame_len: u32,
) -> Result<Option<Decoded>> {
    let frame_len = match buf.peek_u32_be(0) {
        Some(len) => len,
        None => return Ok(None),
    };
    if frame_len == 0 {
        buf.discard(4);
        return Ok(Some(Decoded::Message(Message::KeepAlive)));
    }
    if frame_len > max_frame_len {
        log::warn!("Rejecting oversize {} byte frame", frame_len);
        return Err(Error::ProtocolViolation("oversize frame"));
    }
    if buf.len() < 4 + frame_len as usize {
        return Ok(None);
    }

    let id = MessageId::try_from(buf.peek_u8(4).expect("length checked"))?;

    // PIECE stays in the buffer for the zero-copy landing
    if id == MessageId::Piece {
        if frame_len < 9 {
            return Err(Error::ProtocolViolation("truncated piece header"));
        }
        let piece_index =
            buf.peek_u32_be(5).expect("length checked") as PieceIndex;
        let offset = buf.peek_u32_be(9).expect("length checked");
        return Ok(Some(Decoded::Piece(PieceHeader {
            piece_index,
            offset,
            data_len: frame_len - 9,
        })));
    }

    let payload_len = frame_len as usize - 1;
    buf.discard(5);
    let msg = match id {
        MessageId::Choke => fixed(buf, payload_len, 0, Message::Choke)?,
        MessageId::Unchoke => fixed(buf, payload_len, 0, Message::Unchoke)?,
        MessageId::Interested => {
            fixed(buf, payload_len, 0, Message::Interested)?
        }
        MessageId::NotInterested => {
            fixed(buf, payload_len, 0, Message::NotInterested)?
        }
        MessageId::HaveAll => fixed(buf, payload_len, 0, Message::HaveAll)?,
        MessageId::HaveNone => {
            fixed(buf, payload_len, 0, Message::HaveNone)?
        }
        MessageId::Have => {
            let payload = exact(buf, payload_len, 4)?;
            Message::Have {
                piece_index: u32::from_be_bytes(
                    payload[..4].try_into().expect("length checked"),
                ) as PieceIndex,
            }
        }
        MessageId::Bitfield => {
            let payload = buf.consume(payload_len);
            Message::Bitfield(Bitfield::from_vec(payload))
        }
        MessageId::Request => {
            Message::Request(decode_block_info(buf, payload_len)?)
        }
        MessageId::Cancel => {
            Message::Cancel(decode_block_info(buf, payload_len)?)
        }
        MessageId::Extended => {
            if payload_len < 1 {
                return Err(Error::ProtocolViolation(
                    "truncated extended message",
                ));
            }
            let payload = buf.consume(payload_len);
            Message::Extended {
                id: payload[0],
                payload: Bytes::copy_from_slice(&payload[1..]),
            }
        }
        MessageId::Piece => unreachable!("handled above"),
    };
    Ok(Some(Decoded::Message(msg)))
}

/// Validates a zero-payload message's length.
fn fixed(
    buf: &mut ChunkedBuffer,
    payload_len: usize,
    expected: usize,
    msg: Message,
) -> Result<Message> {
    if payload_len != expected {
        // drop the payload to keep the buffer frame-aligned before erroring
        buf.discard(payload_len);
        return Err(Error::ProtocolViolation("unexpected message length"));
    }
    Ok(msg)
}

fn exact(
    buf: &mut ChunkedBuffer,
    payload_len: usize,
    expected: usize,
) -> Result<Vec<u8>> {
    if payload_len != expected {
        buf.discard(payload_len);
        return Err(Error::ProtocolViolation("unexpected message length"));
    }
    Ok(buf.consume(payload_len))
}

fn decode_block_info(
    buf: &mut ChunkedBuffer,
    payload_len: usize,
) -> Result<BlockInfo> {
    let payload = exact(buf, payload_len, 12)?;
    Ok(BlockInfo {
        piece_index: u32::from_be_bytes(
            payload[0..4].try_into().expect("length checked"),
        ) as PieceIndex,
        offset: u32::from_be_bytes(
            payload[4..8].try_into().expect("length checked"),
        ),
        len: u32::from_be_bytes(
            payload[8..12].try_into().expect("length checked"),
        ),
    })
}
