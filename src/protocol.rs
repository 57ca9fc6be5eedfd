//! Length-prefixed frames used by the demo server and client.
//!
//! Format: `[u32 LE payload_len][payload]`, in both directions.

use crate::constants::MAX_FRAME_LEN;
use crate::servicer::HeaderWriter;
use crate::stream_buffer::OutboundChain;

pub const HEADER_LEN: usize = 4;

/// Result of attempting to parse a frame from a byte buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A whole frame is available. The payload is
    /// `buf[HEADER_LEN..bytes_consumed]`.
    Complete {
        payload_len: usize,
        bytes_consumed: usize,
    },
    /// Need more data. Contains minimum bytes still needed.
    Incomplete(usize),
    /// Declared length exceeds `MAX_FRAME_LEN`.
    Error(&'static str),
}

pub fn try_parse_frame(buf: &[u8]) -> ParseResult {
    if buf.len() < HEADER_LEN {
        return ParseResult::Incomplete(HEADER_LEN - buf.len());
    }

    let payload_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if payload_len > MAX_FRAME_LEN {
        return ParseResult::Error("frame length out of range");
    }

    let total = HEADER_LEN + payload_len;
    if buf.len() < total {
        return ParseResult::Incomplete(total - buf.len());
    }

    ParseResult::Complete {
        payload_len,
        bytes_consumed: total,
    }
}

/// Serialize a frame into `buf`.
pub fn encode_frame(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
}

/// Header writer emitting the length prefix for a payload of `payload_len`.
pub fn length_header(payload_len: usize) -> HeaderWriter {
    Box::new(move |out: &mut OutboundChain| {
        out.write_bytes(&(payload_len as u32).to_le_bytes());
    })
}

/// Split complete frames off the front of `buf`, returning their payloads
/// and the number of bytes consumed.
pub fn split_frames(buf: &[u8]) -> Result<(Vec<Vec<u8>>, usize), &'static str> {
    let mut frames = Vec::new();
    let mut consumed = 0;
    loop {
        match try_parse_frame(&buf[consumed..]) {
            ParseResult::Complete { bytes_consumed, .. } => {
                frames.push(buf[consumed + HEADER_LEN..consumed + bytes_consumed].to_vec());
                consumed += bytes_consumed;
            }
            ParseResult::Incomplete(_) => return Ok((frames, consumed)),
            ParseResult::Error(reason) => return Err(reason),
        }
    }
}
