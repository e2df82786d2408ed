use bson::{doc, Bson};
use mockmongo::protocol::{
    delete_flags, encode_op_delete, encode_op_get_more, encode_op_insert, encode_op_kill_cursors,
    encode_op_query, encode_op_update, query_flags, reply_flags, update_flags,
};
use mockmongo::{go, Matcher, MockServer, OpKind, Reply};
use tokio::net::TcpStream;

#[path = "common/client.rs"]
mod client;

use client::{read_legacy_reply, send};

#[tokio::test]
async fn legacy_insert_then_get_last_error() {
    let server = MockServer::new();
    let addr = server.run().await.unwrap();

    let pending = go(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(
            &mut stream,
            &encode_op_insert(1, "db.coll", 0, &[doc! {"_id": 1}, doc! {"_id": 2}]),
        )
        .await;
        send(
            &mut stream,
            &encode_op_query(2, "db.$cmd", 0, 0, -1, &doc! {"getlasterror": 1}, None),
        )
        .await;
        read_legacy_reply(&mut stream).await
    });

    let insert = server
        .receives(Matcher::op_insert(vec![doc! {"_id": 1}, doc! {"_id": 2}]).namespace("db.coll"))
        .await
        .unwrap();
    assert_eq!(insert.docs().len(), 2);
    assert_eq!(insert.namespace(), Some("db.coll"));

    let gle = server.receives("getlasterror").await.unwrap();
    assert!(gle.is_command());
    assert_eq!(gle.namespace(), Some("db"));
    gle.replies_to_gle().await.unwrap();

    let (header, _, _, docs) = pending.wait().await;
    assert_eq!(header.response_to, 2);
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].get("err"), Some(&Bson::Null));
    assert_eq!(docs[0].get_i32("ok").unwrap(), 1);

    server.stop().await;
}

#[tokio::test]
async fn legacy_update_and_delete_carry_flags_and_selectors() {
    let server = MockServer::new();
    let addr = server.run().await.unwrap();

    let client_task = go(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(
            &mut stream,
            &encode_op_update(
                1,
                "db.coll",
                update_flags::MULTI_UPDATE,
                &doc! {"x": 1},
                &doc! {"$set": {"x": 2}},
            ),
        )
        .await;
        send(
            &mut stream,
            &encode_op_delete(2, "db.coll", delete_flags::SINGLE_REMOVE, &doc! {"x": 2}),
        )
        .await;
        // Legacy writes are fire-and-forget; keep the socket open until the
        // server has seen both.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    });

    let update = server
        .receives(
            Matcher::op_update(doc! {"x": 1}, doc! {"$set": {"x": 2}})
                .flags(update_flags::MULTI_UPDATE),
        )
        .await
        .unwrap();
    assert_eq!(update.flags(), update_flags::MULTI_UPDATE);

    let delete = server
        .receives(Matcher::op_delete(doc! {"x": 2}).flags(delete_flags::SINGLE_REMOVE))
        .await
        .unwrap();
    assert_eq!(delete.docs(), vec![&doc! {"x": 2}]);

    client_task.wait().await;
    server.stop().await;
}

#[tokio::test]
async fn get_more_replies_with_a_batch() {
    let server = MockServer::new();
    let addr = server.run().await.unwrap();

    let pending = go(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(&mut stream, &encode_op_get_more(1, "db.coll", 2, 99)).await;
        read_legacy_reply(&mut stream).await
    });

    let request = server
        .receives(Matcher::op_get_more().cursor_id(99).num_to_return(2))
        .await
        .unwrap();
    assert_eq!(request.cursor_id(), Some(99));
    request
        .reply(
            Reply::batch(vec![doc! {"_id": 3}, doc! {"_id": 4}])
                .cursor_id(99)
                .starting_from(2),
        )
        .await
        .unwrap();

    let (_, _, cursor_id, docs) = pending.wait().await;
    assert_eq!(cursor_id, 99);
    assert_eq!(docs, vec![doc! {"_id": 3}, doc! {"_id": 4}]);

    server.stop().await;
}

#[tokio::test]
async fn kill_cursors_matches_on_ids() {
    let server = MockServer::new();
    let addr = server.run().await.unwrap();

    let client_task = go(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(&mut stream, &encode_op_kill_cursors(1, &[99, 100])).await;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    });

    let request = server
        .receives(Matcher::op_kill_cursors().cursor_ids(vec![99, 100]))
        .await
        .unwrap();
    assert_eq!(request.cursor_ids(), Some(&[99i64, 100][..]));
    assert_eq!(request.namespace(), None);

    client_task.wait().await;
    server.stop().await;
}

#[tokio::test]
async fn fail_sets_the_query_failure_flag() {
    let server = MockServer::new();
    let addr = server.run().await.unwrap();

    let pending = go(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(
            &mut stream,
            &encode_op_query(
                1,
                "db.coll",
                query_flags::SLAVE_OKAY,
                0,
                10,
                &doc! {"x": 1},
                None,
            ),
        )
        .await;
        read_legacy_reply(&mut stream).await
    });

    let request = server
        .receives(Matcher::op_query(doc! {"x": 1}).num_to_return(10))
        .await
        .unwrap();
    assert!(!request.is_command());
    request.fail("mock query failure").await.unwrap();

    let (_, flags, _, docs) = pending.wait().await;
    assert_ne!(flags & reply_flags::QUERY_FAILURE, 0);
    assert_eq!(docs[0].get_str("$err").unwrap(), "mock query failure");

    server.stop().await;
}

#[tokio::test]
async fn legacy_command_gets_default_ok() {
    let server = MockServer::new();
    let addr = server.run().await.unwrap();

    let pending = go(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(
            &mut stream,
            &encode_op_query(5, "admin.$cmd", 0, 0, -1, &doc! {"ping": 1}, None),
        )
        .await;
        read_legacy_reply(&mut stream).await
    });

    let request = server.receives(Matcher::op(OpKind::Query)).await.unwrap();
    assert!(request.is_command());
    request.reply(Reply::default()).await.unwrap();

    let (header, _, _, docs) = pending.wait().await;
    assert_eq!(header.response_to, 5);
    assert_eq!(docs, vec![doc! {"ok": 1}]);

    server.stop().await;
}
