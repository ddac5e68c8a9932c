use crate::*;

use arbor_core::crypto::hash;
use arbor_core::wire::{DatumBody, DatumValue, MessageType};
use arbor_services::SchedulerError;
use bytes::Bytes;

#[tokio::test]
async fn test_hello_registers_both_sides() {
    let a = spawn_node("alice", empty_tree("a")).await.unwrap();
    let b = spawn_node("bob", empty_tree("b")).await.unwrap();

    let reply = a.scheduler.hello(b.addr).await.unwrap();
    assert_eq!(reply.message.kind, MessageType::HelloReply);
    assert_eq!(reply.addr, b.addr);

    assert_eq!(a.scheduler.peer(&b.addr).unwrap().name, "bob");
    assert_eq!(b.scheduler.peer(&a.addr).unwrap().name, "alice");
    assert!(a.scheduler.peer(&b.addr).unwrap().rtt.is_some());
}

#[tokio::test]
async fn test_handshake_exchanges_keys_and_roots() {
    let a = spawn_node("alice", empty_tree("a")).await.unwrap();
    let b_tree = File::directory("b".into(), vec![File::chunk("x".into(), &b"x"[..])]);
    let b_root = b_tree.hash();
    let b = spawn_node("bob", b_tree).await.unwrap();

    let root = a.scheduler.handshake(b.addr).await.unwrap();
    assert_eq!(root, b_root);

    let b_seen_by_a = a.scheduler.peer(&b.addr).unwrap();
    assert_eq!(b_seen_by_a.root, Some(b_root));
    assert_eq!(
        b_seen_by_a.public_key,
        Some(b.keypair.as_ref().unwrap().public.clone())
    );

    let a_seen_by_b = b.scheduler.peer(&a.addr).unwrap();
    assert_eq!(a_seen_by_b.root, Some(a.scheduler.exported_root().await));
    assert_eq!(
        a_seen_by_b.public_key,
        Some(a.keypair.as_ref().unwrap().public.clone())
    );

    // A second handshake verifies against the stored keys and still works.
    assert_eq!(a.scheduler.handshake(b.addr).await.unwrap(), b_root);
}

#[tokio::test]
async fn test_unsigned_node_interoperates() {
    let quiet = SchedulerConfig {
        sign: false,
        ..fast_config("quiet")
    };
    let a = spawn_node_with(empty_tree("a"), quiet, false).await.unwrap();
    let b = spawn_node("bob", empty_tree("b")).await.unwrap();

    a.scheduler.handshake(b.addr).await.unwrap();
    assert_eq!(b.scheduler.peer(&a.addr).unwrap().public_key, None);
    assert!(a.scheduler.peer(&b.addr).unwrap().public_key.is_some());
}

#[tokio::test]
async fn test_get_datum_returns_chunk() {
    let hi = File::chunk("hi.txt".into(), &b"hi"[..]);
    let want = hi.hash();
    assert_eq!(want, hash(b"\x00hi"));

    let a = spawn_node("alice", empty_tree("a")).await.unwrap();
    let b = spawn_node("bob", File::directory("b".into(), vec![hi])).await.unwrap();
    a.scheduler.hello(b.addr).await.unwrap();

    let reply = a.scheduler.get_datum(b.addr, &want).await.unwrap();
    assert_eq!(reply.message.kind, MessageType::Datum);
    let datum = DatumBody::decode(&reply.message.body).unwrap();
    assert_eq!(datum.hash, want);
    assert_eq!(datum.value[0], 0);
    assert_eq!(&datum.value[1..], b"hi");
    assert_eq!(
        datum.parse_value().unwrap(),
        DatumValue::Chunk(Bytes::from_static(b"hi"))
    );
}

#[tokio::test]
async fn test_missing_datum_is_no_datum() {
    let a = spawn_node("alice", empty_tree("a")).await.unwrap();
    let b = spawn_node("bob", empty_tree("b")).await.unwrap();
    a.scheduler.hello(b.addr).await.unwrap();

    let reply = a.scheduler.get_datum(b.addr, &[0xab; 32]).await.unwrap();
    assert_eq!(reply.message.kind, MessageType::NoDatum);
    assert!(reply.message.body.is_empty());
}

#[tokio::test]
async fn test_concurrent_requests_are_matched_by_id() {
    let chunks: Vec<File> = (0..16u8)
        .map(|i| File::chunk(format!("c{i}").as_str().into(), pattern(100 + i as usize, i)))
        .collect();
    let hashes: Vec<_> = chunks.iter().map(File::hash).collect();

    let a = spawn_node("alice", empty_tree("a")).await.unwrap();
    let b = spawn_node("bob", File::directory("b".into(), chunks)).await.unwrap();
    a.scheduler.hello(b.addr).await.unwrap();

    let mut tasks = Vec::new();
    for h in hashes {
        let scheduler = a.scheduler.clone();
        let addr = b.addr;
        tasks.push(tokio::spawn(async move {
            let reply = scheduler.get_datum(addr, &h).await.unwrap();
            (h, DatumBody::decode(&reply.message.body).unwrap().hash)
        }));
    }
    for task in tasks {
        let (requested, received) = task.await.unwrap();
        assert_eq!(requested, received);
    }
    assert_eq!(a.scheduler.in_flight(), 0);
}

#[tokio::test]
async fn test_requests_before_hello_are_ignored() {
    let b = spawn_node("bob", empty_tree("b")).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();

    let root = b.scheduler.exported_root().await;
    let get = Message::new(1, MessageType::GetDatum, root.to_vec());
    raw.send(b.addr, &get).await.unwrap();
    assert!(raw.recv(Duration::from_millis(300)).await.is_none());
    assert!(b.scheduler.peer(&raw.addr).is_none());

    // After a Hello the same request is served.
    let hello = Message::new(
        2,
        MessageType::Hello,
        arbor_core::wire::HelloBody {
            extensions: 0,
            name: "raw".into(),
        }
        .encode(),
    );
    raw.send(b.addr, &hello).await.unwrap();
    let (reply, _) = raw.recv(Duration::from_secs(1)).await.unwrap();
    assert_eq!(reply.kind, MessageType::HelloReply);

    raw.send(b.addr, &get).await.unwrap();
    let (reply, _) = raw.recv(Duration::from_secs(1)).await.unwrap();
    assert_eq!(reply.kind, MessageType::Datum);
    assert_eq!(reply.id, 1);
}

#[tokio::test]
async fn test_reply_from_unknown_address_is_not_admitted() {
    let a = spawn_node("alice", empty_tree("a")).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();
    let addr = raw.addr;

    // Answer the Hello with a NoDatum under the same id.
    let responder = tokio::spawn(async move {
        if let Some((msg, from)) = raw.recv(Duration::from_secs(2)).await {
            let reply = Message::new(msg.id, MessageType::NoDatum, Bytes::new());
            raw.send(from, &reply).await.unwrap();
        }
    });

    // NoDatum from an address that never said Hello fails admission, so
    // the request goes unanswered.
    let err = a.scheduler.hello(addr).await.unwrap_err();
    assert!(matches!(err, SchedulerError::NoResponse { .. }));
    responder.await.unwrap();
}

#[tokio::test]
async fn test_wrong_reply_type_is_an_error() {
    let a = spawn_node("alice", empty_tree("a")).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();

    let hello = Message::new(
        1,
        MessageType::Hello,
        arbor_core::wire::HelloBody {
            extensions: 0,
            name: "raw".into(),
        }
        .encode(),
    );
    raw.send(a.addr, &hello).await.unwrap();
    raw.recv(Duration::from_secs(1)).await.unwrap();

    let addr = raw.addr;
    let responder = tokio::spawn(async move {
        if let Some((msg, from)) = raw.recv(Duration::from_secs(2)).await {
            let reply = Message::new(msg.id, MessageType::RootReply, vec![0u8; 32]);
            raw.send(from, &reply).await.unwrap();
        }
    });

    let err = a.scheduler.get_datum(addr, &[1u8; 32]).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::UnexpectedReply {
            request: MessageType::GetDatum,
            reply: MessageType::RootReply,
        }
    ));
    responder.await.unwrap();
}
