//! MongoDB wire protocol scaffolding.
//! - Message header parsing and packing
//! - Body decoders for the legacy opcodes and OP_MSG (`decode`)
//! - Request and reply encoders (`encode`)

mod decode;
mod encode;

pub use decode::{OpGetMore, OpKillCursors, OpMsg, OpQuery, OpWrite, RequestBody};
pub use encode::{
    decode_op_reply, encode_op_delete, encode_op_get_more, encode_op_insert,
    encode_op_kill_cursors, encode_op_msg, encode_op_msg_reply, encode_op_msg_with_sequence,
    encode_op_query, encode_op_reply, encode_op_update,
};

use crate::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

// Relevant op codes
pub const OP_REPLY: i32 = 1;
pub const OP_UPDATE: i32 = 2001;
pub const OP_INSERT: i32 = 2002;
pub const OP_QUERY: i32 = 2004;
pub const OP_GET_MORE: i32 = 2005;
pub const OP_DELETE: i32 = 2006;
pub const OP_KILL_CURSORS: i32 = 2007;
pub const OP_MSG: i32 = 2013;

// OP_QUERY flag bits
pub mod query_flags {
    pub const TAILABLE_CURSOR: u32 = 2;
    pub const SLAVE_OKAY: u32 = 4;
    pub const OPLOG_REPLAY: u32 = 8;
    pub const NO_TIMEOUT: u32 = 16;
    pub const AWAIT_DATA: u32 = 32;
    pub const EXHAUST: u32 = 64;
    pub const PARTIAL: u32 = 128;
}

// OP_UPDATE flag bits
pub mod update_flags {
    pub const UPSERT: u32 = 1;
    pub const MULTI_UPDATE: u32 = 2;
}

// OP_INSERT flag bits
pub mod insert_flags {
    pub const CONTINUE_ON_ERROR: u32 = 1;
}

// OP_DELETE flag bits
pub mod delete_flags {
    pub const SINGLE_REMOVE: u32 = 1;
}

// OP_REPLY response flag bits
pub mod reply_flags {
    pub const CURSOR_NOT_FOUND: u32 = 1;
    pub const QUERY_FAILURE: u32 = 2;
}

// OP_MSG flag bits
pub mod msg_flags {
    pub const CHECKSUM_PRESENT: u32 = 1;
    pub const MORE_TO_COME: u32 = 2;
    pub const EXHAUST_ALLOWED: u32 = 0x10000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < 16 {
            return None;
        }
        // Little-endian 32-bit fields
        let message_length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let request_id = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let response_to = i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let op_code = i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);

        Some((
            Self {
                message_length,
                request_id,
                response_to,
                op_code,
            },
            16,
        ))
    }

    pub fn pack(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.message_length.to_le_bytes());
        out[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        out[12..16].copy_from_slice(&self.op_code.to_le_bytes());
        out
    }
}

/// Read one framed message: the 16-byte header, then `length - 16` body bytes.
///
/// Returns `Ok(None)` on a clean EOF at a message boundary. A length below 16
/// or a short body is a malformed frame.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<(MessageHeader, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; 16];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let (hdr, _) = MessageHeader::parse(&header_buf)
        .ok_or_else(|| Error::Malformed("short message header".into()))?;
    if hdr.message_length < 16 {
        return Err(Error::Malformed(format!(
            "message length {} below header size",
            hdr.message_length
        )));
    }
    let body_len = (hdr.message_length as usize) - 16;
    let mut body = vec![0u8; body_len];
    if body_len > 0 {
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Error::Malformed(format!(
                    "body shorter than declared length {}",
                    hdr.message_length
                )),
                _ => Error::Io(e),
            })?;
    }
    Ok(Some((hdr, body)))
}

pub(crate) fn read_i32(buf: &[u8], pos: usize) -> Option<i32> {
    let b = buf.get(pos..pos + 4)?;
    Some(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn read_u32(buf: &[u8], pos: usize) -> Option<u32> {
    read_i32(buf, pos).map(|v| v as u32)
}

pub(crate) fn read_i64(buf: &[u8], pos: usize) -> Option<i64> {
    let b = buf.get(pos..pos + 8)?;
    Some(i64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

/// Decode a BSON 'C' string. Returns the string and the position just past
/// the null terminator.
pub(crate) fn read_cstring(buf: &[u8], pos: usize) -> Option<(String, usize)> {
    let rest = buf.get(pos..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    let s = std::str::from_utf8(&rest[..end]).ok()?.to_string();
    Some((s, pos + end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_pack_parse_round_trip() {
        let hdr = MessageHeader {
            message_length: 61,
            request_id: 7,
            response_to: 3,
            op_code: OP_MSG,
        };
        let bytes = hdr.pack();
        let (parsed, consumed) = MessageHeader::parse(&bytes).unwrap();
        assert_eq!(consumed, 16);
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn header_parse_rejects_short_buffer() {
        assert!(MessageHeader::parse(&[0u8; 15]).is_none());
    }

    #[test]
    fn cstring_stops_at_null() {
        let buf = b"db.coll\0rest";
        let (s, pos) = read_cstring(buf, 0).unwrap();
        assert_eq!(s, "db.coll");
        assert_eq!(pos, 8);
        assert!(read_cstring(b"no terminator", 0).is_none());
    }

    #[tokio::test]
    async fn read_message_clean_eof() {
        let empty: &[u8] = &[];
        let mut reader = empty;
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_message_rejects_short_length() {
        let hdr = MessageHeader {
            message_length: 8,
            request_id: 1,
            response_to: 0,
            op_code: OP_QUERY,
        };
        let bytes = hdr.pack();
        let mut reader = &bytes[..];
        assert!(matches!(
            read_message(&mut reader).await,
            Err(crate::error::Error::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn read_message_rejects_truncated_body() {
        let hdr = MessageHeader {
            message_length: 32,
            request_id: 1,
            response_to: 0,
            op_code: OP_MSG,
        };
        let mut bytes = hdr.pack().to_vec();
        bytes.extend_from_slice(&[0u8; 4]); // 4 of the declared 16 body bytes
        let mut reader = &bytes[..];
        assert!(matches!(
            read_message(&mut reader).await,
            Err(crate::error::Error::Malformed(_))
        ));
    }
}
