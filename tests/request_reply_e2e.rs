use bson::{doc, Bson};
use mockmongo::protocol::{encode_op_msg, encode_op_msg_with_sequence};
use mockmongo::{go, Matcher, MockServer};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

#[path = "common/client.rs"]
mod client;

use client::{read_msg_reply, send};

#[tokio::test]
async fn insert_round_trip() {
    let server = MockServer::new();
    let addr = server.run().await.unwrap();

    let pending = go(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(
            &mut stream,
            &encode_op_msg(
                42,
                &doc! {"insert": "coll", "documents": [{"_id": 1}], "$db": "db"},
                0,
            ),
        )
        .await;
        read_msg_reply(&mut stream).await
    });

    let request = server
        .receives(Matcher::op_msg("insert", "coll").namespace("db"))
        .await
        .unwrap();
    assert_eq!(request.request_id(), 42);
    let doc = request.doc();
    assert_eq!(doc.get_str("$db").unwrap(), "db");
    assert_eq!(
        doc.get_array("documents").unwrap(),
        &vec![Bson::Document(doc! {"_id": 1})]
    );
    request.reply(doc! {"ok": 1}).await.unwrap();

    let (header, reply) = pending.wait().await;
    assert_eq!(header.response_to, 42);
    assert_eq!(reply.get_i32("ok").unwrap(), 1);

    server.stop().await;
}

#[tokio::test]
async fn document_sequence_inserts_match_like_inline_ones() {
    let server = MockServer::new();
    let addr = server.run().await.unwrap();

    let pending = go(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(
            &mut stream,
            &encode_op_msg_with_sequence(
                7,
                &doc! {"insert": "coll", "$db": "db"},
                "documents",
                &[doc! {"_id": 1}, doc! {"_id": 2}],
            ),
        )
        .await;
        read_msg_reply(&mut stream).await
    });

    let request = server
        .receives(Matcher::op_msg("insert", "coll").field("documents", vec![
            Bson::Document(doc! {"_id": 1}),
            Bson::Document(doc! {"_id": 2}),
        ]))
        .await
        .unwrap();
    request.reply(doc! {"ok": 1, "n": 2}).await.unwrap();

    let (_, reply) = pending.wait().await;
    assert_eq!(reply.get_i32("n").unwrap(), 2);

    server.stop().await;
}

#[tokio::test]
async fn command_error_reply() {
    let server = MockServer::new();
    let addr = server.run().await.unwrap();

    let pending = go(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(
            &mut stream,
            &encode_op_msg(
                1,
                &doc! {"insert": "coll", "documents": [{"_id": 1}], "$db": "db"},
                0,
            ),
        )
        .await;
        read_msg_reply(&mut stream).await
    });

    let request = server.receives(Matcher::op_msg("insert", "coll")).await.unwrap();
    request.command_err(11000, "dup").await.unwrap();

    let (_, reply) = pending.wait().await;
    assert_eq!(reply.get_i32("ok").unwrap(), 0);
    assert_eq!(reply.get_i32("code").unwrap(), 11000);
    assert_eq!(reply.get_str("errmsg").unwrap(), "dup");

    server.stop().await;
}

#[tokio::test]
async fn hangup_resets_the_client_and_leaves_the_server_running() {
    let server = MockServer::new();
    let addr = server.run().await.unwrap();

    let addr2 = addr.clone();
    let pending = go(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(
            &mut stream,
            &encode_op_msg(
                1,
                &doc! {"insert": "coll", "documents": [{"_id": 1}], "$db": "db"},
                0,
            ),
        )
        .await;
        // The server hangs up instead of replying.
        let mut buf = [0u8; 16];
        stream.read_exact(&mut buf).await
    });

    let request = server.receives(Matcher::op_msg("insert", "coll")).await.unwrap();
    request.hangup().await.unwrap();
    assert!(pending.wait().await.is_err());
    assert!(server.is_running());

    // A fresh connection still works.
    let pending = go(async move {
        let mut stream = TcpStream::connect(addr2).await.unwrap();
        send(&mut stream, &encode_op_msg(2, &doc! {"ping": 1, "$db": "db"}, 0)).await;
        read_msg_reply(&mut stream).await
    });
    let request = server.receives("ping").await.unwrap();
    request.reply(doc! {"ok": 1}).await.unwrap();
    let (_, reply) = pending.wait().await;
    assert_eq!(reply.get_i32("ok").unwrap(), 1);

    server.stop().await;
}

#[tokio::test]
async fn replying_twice_fails() {
    let server = MockServer::new();
    let addr = server.run().await.unwrap();

    let pending = go(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(&mut stream, &encode_op_msg(1, &doc! {"ping": 1, "$db": "db"}, 0)).await;
        read_msg_reply(&mut stream).await
    });

    let request = server.receives("ping").await.unwrap();
    request.reply(doc! {"ok": 1}).await.unwrap();
    let err = request.reply(doc! {"ok": 1}).await.unwrap_err();
    assert!(err.to_string().contains("already replied"), "{err}");
    pending.wait().await;

    server.stop().await;
}

#[tokio::test]
async fn replying_to_a_dead_connection_fails() {
    let server = MockServer::new();
    let addr = server.run().await.unwrap();

    {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(&mut stream, &encode_op_msg(1, &doc! {"ping": 1, "$db": "db"}, 0)).await;
    } // client disconnects without waiting

    let request = server.receives("ping").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let err = request.reply(doc! {"ok": 1}).await.unwrap_err();
    assert!(err.to_string().contains("gone"), "{err}");

    server.stop().await;
}

#[tokio::test]
async fn several_requests_can_wait_in_the_inbox_at_once() {
    let server = MockServer::new();
    let addr = server.run().await.unwrap();

    let pending = go(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(
            &mut stream,
            &encode_op_msg(10, &doc! {"find": "coll", "$db": "db"}, 0),
        )
        .await;
        send(
            &mut stream,
            &encode_op_msg(11, &doc! {"getMore": 5i64, "collection": "coll", "$db": "db"}, 0),
        )
        .await;
        let first = read_msg_reply(&mut stream).await;
        let second = read_msg_reply(&mut stream).await;
        (first, second)
    });

    let find = server.receives(Matcher::op_msg("find", "coll")).await.unwrap();
    let get_more = server.receives(Matcher::op_msg("getMore", 5i64)).await.unwrap();

    // Reply out of order; response_to keeps the driver's matching straight.
    get_more.reply(doc! {"tag": "getMore"}).await.unwrap();
    find.reply(doc! {"tag": "find"}).await.unwrap();

    let ((first_header, first), (second_header, second)) = pending.wait().await;
    assert_eq!(first_header.response_to, 11);
    assert_eq!(first.get_str("tag").unwrap(), "getMore");
    assert_eq!(second_header.response_to, 10);
    assert_eq!(second.get_str("tag").unwrap(), "find");

    server.stop().await;
}

#[tokio::test]
async fn reply_ids_increase_monotonically() {
    let server = MockServer::new();
    let addr = server.run().await.unwrap();

    let pending = go(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut ids = Vec::new();
        for n in 0..3 {
            send(&mut stream, &encode_op_msg(n, &doc! {"ping": 1, "$db": "db"}, 0)).await;
            let (header, _) = read_msg_reply(&mut stream).await;
            ids.push(header.request_id);
        }
        ids
    });

    for _ in 0..3 {
        let request = server.receives("ping").await.unwrap();
        request.reply(doc! {"ok": 1}).await.unwrap();
    }

    let ids = pending.wait().await;
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "{ids:?}");

    server.stop().await;
}
