use crate::*;

use std::sync::atomic::AtomicUsize;
use std::time::Instant;

use arbor_core::crypto::hash;
use arbor_core::wire::{DatumBody, DatumValue, HelloBody, MessageType};
use arbor_services::SchedulerError;
use bytes::Bytes;

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Count every datagram sent to a socket that never answers.
async fn silent_sink() -> (SocketAddr, Arc<AtomicUsize>) {
    let raw = RawPeer::bind().await.unwrap();
    let addr = raw.addr;
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while raw.socket.recv_from(&mut buf).await.is_ok() {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });
    (addr, count)
}

/// Introduce `raw` to `node` so its later replies pass admission.
async fn introduce(raw: &RawPeer, node: &Node) {
    let hello = Message::new(
        1,
        MessageType::Hello,
        HelloBody {
            extensions: 0,
            name: "raw".into(),
        }
        .encode(),
    );
    raw.send(node.addr, &hello).await.unwrap();
    let (reply, _) = raw.recv(Duration::from_secs(1)).await.unwrap();
    assert_eq!(reply.kind, MessageType::HelloReply);
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// Default timers: 1s, 2s, 4s, then give up.
#[tokio::test]
async fn test_unreachable_peer_gives_up_after_three_attempts() {
    let a = spawn_node_with(empty_tree("a"), SchedulerConfig::default(), true)
        .await
        .unwrap();
    let (sink, count) = silent_sink().await;

    let start = Instant::now();
    let err = a.scheduler.hello(sink).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, SchedulerError::NoResponse { attempts: 3, .. }));
    assert!(elapsed >= Duration::from_secs(7), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(9), "took {elapsed:?}");
    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert_eq!(a.scheduler.in_flight(), 0);
}

#[tokio::test]
async fn test_retransmission_recovers_a_lost_request() {
    let a = spawn_node("alice", empty_tree("a")).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();
    introduce(&raw, &a).await;

    let value = DatumValue::Chunk(Bytes::from_static(b"second time lucky")).encode();
    let want = hash(&value);
    let addr = raw.addr;

    // Ignore the first GetDatum, answer the retransmission.
    let responder = tokio::spawn(async move {
        let (first, _) = raw.recv(Duration::from_secs(2)).await.unwrap();
        let (second, from) = raw.recv(Duration::from_secs(2)).await.unwrap();
        assert_eq!(first.id, second.id);
        let body = DatumBody { hash: want, value }.encode();
        raw.send(from, &Message::new(second.id, MessageType::Datum, body))
            .await
            .unwrap();
    });

    let reply = a.scheduler.get_datum(addr, &want).await.unwrap();
    assert_eq!(reply.message.kind, MessageType::Datum);
    responder.await.unwrap();
}

#[tokio::test]
async fn test_corrupted_datum_never_satisfies_the_request() {
    let a = spawn_node("alice", empty_tree("a")).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();
    introduce(&raw, &a).await;
    let addr = raw.addr;

    let answered = Arc::new(AtomicUsize::new(0));
    let counter = answered.clone();
    tokio::spawn(async move {
        while let Some((msg, from)) = raw.recv(Duration::from_secs(5)).await {
            // The value does not hash to the advertised hash.
            let body = DatumBody {
                hash: [0x11; 32],
                value: DatumValue::Chunk(Bytes::from_static(b"tampered")).encode(),
            }
            .encode();
            raw.send(from, &Message::new(msg.id, MessageType::Datum, body))
                .await
                .unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let err = a.scheduler.get_datum(addr, &[0x11; 32]).await.unwrap_err();
    assert!(matches!(err, SchedulerError::NoResponse { .. }));
    assert_eq!(answered.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_reply_from_another_address_is_ignored() {
    let a = spawn_node("alice", empty_tree("a")).await.unwrap();
    let target = RawPeer::bind().await.unwrap();
    let impostor = RawPeer::bind().await.unwrap();
    introduce(&target, &a).await;
    introduce(&impostor, &a).await;
    let target_addr = target.addr;
    let a_addr = a.addr;

    // The impostor learns the id and answers in the target's place.
    let relay = tokio::spawn(async move {
        let (msg, _) = target.recv(Duration::from_secs(2)).await.unwrap();
        let reply = Message::new(msg.id, MessageType::NoDatum, Bytes::new());
        impostor.send(a_addr, &reply).await.unwrap();
        // Keep both sockets open until the request has given up.
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let err = a.scheduler.get_datum(target_addr, &[0u8; 32]).await.unwrap_err();
    assert!(matches!(err, SchedulerError::NoResponse { .. }));
    relay.await.unwrap();
}

#[tokio::test]
async fn test_forged_signature_is_dropped() {
    let b = spawn_node("bob", empty_tree("b")).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();
    introduce(&raw, &b).await;

    let key = Keypair::generate();
    let pk = Message::new(2, MessageType::PublicKey, key.public.to_raw().to_vec());
    raw.send(b.addr, &pk).await.unwrap();
    let (reply, _) = raw.recv(Duration::from_secs(1)).await.unwrap();
    assert_eq!(reply.kind, MessageType::PublicKeyReply);

    let mut forged = Message::new(3, MessageType::Root, vec![9u8; 32]);
    forged.sign(&Keypair::generate()).unwrap();
    raw.send(b.addr, &forged).await.unwrap();
    assert!(raw.recv(Duration::from_millis(300)).await.is_none());
    assert_eq!(b.scheduler.peer(&raw.addr).unwrap().root, None);

    let mut genuine = Message::new(4, MessageType::Root, vec![9u8; 32]);
    genuine.sign(&key).unwrap();
    raw.send(b.addr, &genuine).await.unwrap();
    let (reply, _) = raw.recv(Duration::from_secs(1)).await.unwrap();
    assert_eq!(reply.kind, MessageType::RootReply);
    assert_eq!(b.scheduler.peer(&raw.addr).unwrap().root, Some([9u8; 32]));
}

#[tokio::test]
async fn test_garbage_does_not_stop_the_node() {
    let b = spawn_node("bob", empty_tree("b")).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();

    for junk in [&b""[..], &[1, 2, 3][..], &[0, 0, 0, 1, 99, 0, 0][..], &[0, 0, 0, 1, 2, 0, 9, 1][..]] {
        raw.socket.send_to(junk, b.addr).await.unwrap();
    }

    // Still serving.
    let a = spawn_node("alice", empty_tree("a")).await.unwrap();
    a.scheduler.hello(b.addr).await.unwrap();
}
