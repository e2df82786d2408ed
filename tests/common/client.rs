//! Raw wire-protocol client helpers shared by the e2e tests.
#![allow(dead_code)]

use bson::Document;
use mockmongo::protocol::{decode_op_reply, MessageHeader, RequestBody, OP_MSG, OP_REPLY};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub async fn send<S>(stream: &mut S, bytes: &[u8])
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await.unwrap();
    stream.flush().await.unwrap();
}

pub async fn read_frame<S>(stream: &mut S) -> (MessageHeader, Vec<u8>)
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 16];
    stream.read_exact(&mut header).await.unwrap();
    let (hdr, _) = MessageHeader::parse(&header).unwrap();
    let mut body = vec![0u8; (hdr.message_length as usize) - 16];
    stream.read_exact(&mut body).await.unwrap();
    (hdr, body)
}

/// Read one OP_MSG reply and return its header and body document.
pub async fn read_msg_reply<S>(stream: &mut S) -> (MessageHeader, Document)
where
    S: AsyncRead + Unpin,
{
    let (hdr, body) = read_frame(stream).await;
    assert_eq!(hdr.op_code, OP_MSG);
    match RequestBody::decode(OP_MSG, &body).unwrap() {
        RequestBody::Msg(m) => (hdr, m.body),
        other => panic!("unexpected reply body {other}"),
    }
}

/// Read one OP_REPLY and return (header, flags, cursor_id, docs).
pub async fn read_legacy_reply<S>(stream: &mut S) -> (MessageHeader, u32, i64, Vec<Document>)
where
    S: AsyncRead + Unpin,
{
    let (hdr, body) = read_frame(stream).await;
    assert_eq!(hdr.op_code, OP_REPLY);
    let (flags, cursor_id, _starting_from, docs) = decode_op_reply(&body).unwrap();
    (hdr, flags, cursor_id, docs)
}
