//! Frame layout: building outgoing frames and reassembling received ones.
//!
//! Three shapes exist, selected by payload size (the payload always starts
//! with the command, sub-command and codebit bytes):
//!
//! ```text
//! regular   STX LEN CMD SUB CB data.. ETX CS                      LEN = size + 2
//! extended  STX FE  CMD SUB CB EXTLEN(3) data.. ETX CS            EXTLEN = size + 5
//! divided   STX FE  CMD SUB CB|fl EXTLEN(3) NO(2) COUNT(2) chunk.. ETX CS
//!                                                                EXTLEN = chunk + 12
//! ```
//!
//! All multi-byte fields are big endian. The checksum covers LEN/EXT_LEN
//! through ETX.

use byteorder::{BigEndian, ByteOrder};

use crate::checksum::Checksum;
use crate::error::{LinkError, Result};

/// Data transmission control codes.
pub mod control {
    pub const STX: u8 = 0x02;
    pub const ETX: u8 = 0x03;
    pub const ENQ: u8 = 0x05;
    pub const ACK: u8 = 0x06;
    pub const NAK: u8 = 0x15;
    /// Sits in the LEN position of extended frames.
    pub const EXT_LEN: u8 = 0xFE;
}

/// Codebit division flags.
pub mod division {
    /// Split transfer, more frames follow.
    pub const MORE: u8 = 0x02;
    /// Split transfer, final frame.
    pub const LAST: u8 = 0x03;
    pub const MASK: u8 = 0x03;
}

use control::{ETX, EXT_LEN, STX};

pub const STX_LEN: usize = 1;
pub const LEN_LEN: usize = 1;
/// Command, sub-command and codebit.
pub const CMD_LEN: usize = 3;
pub const EXT_LEN_LEN: usize = 3;
pub const FRAME_NUMBER_LEN: usize = 2;
pub const FRAME_COUNT_LEN: usize = 2;
pub const ETX_LEN: usize = 1;
pub const CS_LEN: usize = 1;
pub const FRAME_HEADER_LEN: usize = STX_LEN + LEN_LEN;
pub const FRAME_FOOTER_LEN: usize = ETX_LEN + CS_LEN;

/// Valid range of the regular LEN byte.
pub const MIN_FRAME_LEN: usize = 5;
pub const MAX_FRAME_LEN: usize = 253;

/// Largest payload (header included) sent as a regular frame.
pub const MAX_REGULAR_PAYLOAD: usize = MAX_FRAME_LEN - FRAME_FOOTER_LEN;
/// Largest payload (header included) sent as a single extended frame.
pub const MAX_EXTENDED_PAYLOAD: usize = 1030;
/// Data bytes carried by one divided frame.
pub const MAX_CHUNK_LEN: usize = 1024;

/// EXTLEN bounds for an undivided extended frame.
pub const MIN_EXTENDED_LEN: usize = CMD_LEN + EXT_LEN_LEN + FRAME_FOOTER_LEN;
pub const MAX_EXTENDED_LEN: usize = MAX_EXTENDED_PAYLOAD + EXT_LEN_LEN + FRAME_FOOTER_LEN;

/// Fixed EXTLEN overhead of a divided frame on top of its chunk.
pub const DIVIDED_OVERHEAD: usize =
    CMD_LEN + EXT_LEN_LEN + FRAME_NUMBER_LEN + FRAME_COUNT_LEN + FRAME_FOOTER_LEN;
/// EXTLEN bounds for a divided frame.
pub const MIN_DIVIDED_LEN: usize = DIVIDED_OVERHEAD + 1;
pub const MAX_DIVIDED_LEN: usize = DIVIDED_OVERHEAD + MAX_CHUNK_LEN;

/// Largest frame on the wire, STX through CS.
pub const FRAME_CAPACITY: usize = FRAME_HEADER_LEN + MAX_DIVIDED_LEN;

/// Largest payload a divided transfer can carry.
pub const MAX_PAYLOAD: usize = CMD_LEN + u16::MAX as usize * MAX_CHUNK_LEN;

/// Receive-side frame buffer.
pub type FrameBuf = heapless::Vec<u8, FRAME_CAPACITY>;

/// Transmission shape of one logical message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Shape {
    Regular,
    Extended,
    Divided,
}

impl Shape {
    /// Shape used to send a payload of `len` bytes, header included.
    pub fn for_payload(len: usize) -> Shape {
        if len <= MAX_REGULAR_PAYLOAD {
            Shape::Regular
        } else if len <= MAX_EXTENDED_PAYLOAD {
            Shape::Extended
        } else {
            Shape::Divided
        }
    }

    /// Bytes of the declared data length that precede the payload data.
    pub fn field_overhead(self) -> usize {
        match self {
            Shape::Regular => CMD_LEN,
            Shape::Extended => CMD_LEN + EXT_LEN_LEN,
            Shape::Divided => CMD_LEN + EXT_LEN_LEN + FRAME_NUMBER_LEN + FRAME_COUNT_LEN,
        }
    }
}

fn u24_field(value: usize) -> [u8; EXT_LEN_LEN] {
    let mut field = [0u8; EXT_LEN_LEN];
    BigEndian::write_u24(&mut field, value as u32);
    field
}

fn u16_field(value: usize) -> [u8; 2] {
    let mut field = [0u8; 2];
    BigEndian::write_u16(&mut field, value as u16);
    field
}

fn seal(mut frame: Vec<u8>, checksum: Checksum) -> Vec<u8> {
    frame.push(ETX);
    let cs = checksum.generate(&frame[STX_LEN..]);
    frame.push(cs);
    frame
}

/// Builds the wire frames for `payload`.
///
/// Regular payloads need no header; extended and divided payloads always
/// carry one since they are longer than three bytes.
pub fn build_frames(payload: &[u8], checksum: Checksum) -> Result<Vec<Vec<u8>>> {
    match Shape::for_payload(payload.len()) {
        Shape::Regular => {
            let mut frame = Vec::with_capacity(payload.len() + FRAME_HEADER_LEN + FRAME_FOOTER_LEN);
            frame.push(STX);
            frame.push((payload.len() + FRAME_FOOTER_LEN) as u8);
            frame.extend_from_slice(payload);
            Ok(vec![seal(frame, checksum)])
        }
        Shape::Extended => {
            let mut frame = Vec::with_capacity(FRAME_CAPACITY);
            frame.push(STX);
            frame.push(EXT_LEN);
            frame.extend_from_slice(&payload[..CMD_LEN]);
            frame.extend_from_slice(&u24_field(
                payload.len() + EXT_LEN_LEN + FRAME_FOOTER_LEN,
            ));
            frame.extend_from_slice(&payload[CMD_LEN..]);
            Ok(vec![seal(frame, checksum)])
        }
        Shape::Divided => {
            if payload.len() > MAX_PAYLOAD {
                return Err(LinkError::PayloadTooLarge(payload.len()));
            }
            let (header, data) = payload.split_at(CMD_LEN);
            let count = data.len().div_ceil(MAX_CHUNK_LEN);
            let frames = data
                .chunks(MAX_CHUNK_LEN)
                .enumerate()
                .map(|(number, chunk)| {
                    let flags = if number + 1 == count {
                        division::LAST
                    } else {
                        division::MORE
                    };
                    let mut frame = Vec::with_capacity(FRAME_CAPACITY);
                    frame.push(STX);
                    frame.push(EXT_LEN);
                    frame.push(header[0]);
                    frame.push(header[1]);
                    frame.push(header[2] | flags);
                    frame.extend_from_slice(&u24_field(chunk.len() + DIVIDED_OVERHEAD));
                    frame.extend_from_slice(&u16_field(number));
                    frame.extend_from_slice(&u16_field(count));
                    frame.extend_from_slice(chunk);
                    seal(frame, checksum)
                })
                .collect();
            Ok(frames)
        }
    }
}

/// Whether an extended frame belongs to a divided transfer.
///
/// The first frame of a divided transfer always carries a full chunk, so its
/// extended length is past anything an undivided frame can declare. The
/// codebit is not consulted: its low bits belong to the caller until the
/// transfer is divided. Used by both the receiver and [`parse_frames`].
pub fn is_divided(mid_division: bool, ext_len: usize) -> bool {
    mid_division || ext_len > MAX_EXTENDED_LEN
}

/// Strips the link fields from a validated frame set and returns the payload.
///
/// The codebit division flags of a divided message are cleared.
pub fn parse_frames<B: AsRef<[u8]>>(frames: &[B]) -> Result<Vec<u8>> {
    let first = frames
        .first()
        .ok_or(LinkError::MalformedFrame("empty frame set"))?
        .as_ref();
    if first.len() < FRAME_HEADER_LEN + FRAME_FOOTER_LEN {
        return Err(LinkError::MalformedFrame("frame shorter than its envelope"));
    }

    if first[LEN_LEN] != EXT_LEN {
        if frames.len() != 1 {
            return Err(LinkError::MalformedFrame("regular frame in a multi-frame set"));
        }
        return Ok(first[FRAME_HEADER_LEN..first.len() - FRAME_FOOTER_LEN].to_vec());
    }

    let header_end = FRAME_HEADER_LEN + CMD_LEN;
    if first.len() < header_end + EXT_LEN_LEN + FRAME_FOOTER_LEN {
        return Err(LinkError::MalformedFrame("extended frame too short"));
    }
    let ext_len = BigEndian::read_u24(&first[header_end..header_end + EXT_LEN_LEN]) as usize;
    let divided = is_divided(frames.len() > 1, ext_len);

    let mut payload = Vec::new();
    payload.extend_from_slice(&first[FRAME_HEADER_LEN..header_end]);
    if !divided {
        payload.extend_from_slice(&first[header_end + EXT_LEN_LEN..first.len() - FRAME_FOOTER_LEN]);
        return Ok(payload);
    }

    payload[CMD_LEN - 1] &= !division::MASK;
    let data_start = header_end + EXT_LEN_LEN + FRAME_NUMBER_LEN + FRAME_COUNT_LEN;
    for frame in frames {
        let frame = frame.as_ref();
        if frame.len() < data_start + FRAME_FOOTER_LEN {
            return Err(LinkError::MalformedFrame("divided frame too short"));
        }
        payload.extend_from_slice(&frame[data_start..frame.len() - FRAME_FOOTER_LEN]);
    }
    Ok(payload)
}
