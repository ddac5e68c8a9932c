use crate::*;

use arbor_core::disk::{load_tree, save_tree};
use arbor_services::DownloadError;

/// Root directory ‖ one bigfile ‖ two chunks.
#[tokio::test]
async fn test_two_level_tree_downloads_completely() {
    let content = pattern(2000, 7);
    let big = arbor_core::chunker::chunk_bytes("big.bin".into(), content.clone().into());
    assert_eq!(big.children().len(), 2);
    let exported = File::directory("share".into(), vec![big]);
    let advertised = exported.hash();

    let a = spawn_node("alice", empty_tree("a")).await.unwrap();
    let b = spawn_node("bob", exported).await.unwrap();

    let root = a.scheduler.handshake(b.addr).await.unwrap();
    assert_eq!(root, advertised);

    let tree = a.scheduler.fetch_tree(b.addr).await.unwrap();
    assert_eq!(tree.hash(), advertised);
    assert!(tree.is_materialized());
    assert!(tree.verify().is_ok());

    let fetched_big = &tree.children()[0];
    assert_eq!(fetched_big.name().to_string(), "big.bin");
    assert_eq!(fetched_big.children().len(), 2);
    assert!(fetched_big.children().iter().all(|c| matches!(c, File::Chunk { .. })));

    // The registry's partial tree ends up complete as well.
    let partial = a.scheduler.peer(&b.addr).unwrap().partial_tree.unwrap();
    assert!(partial.is_materialized());
    assert_eq!(partial.hash(), advertised);

    let out = TempDir::new("two-level");
    let target = out.path().join("copy");
    save_tree(&target, &tree).unwrap();
    assert_eq!(std::fs::read(target.join("big.bin")).unwrap(), content);
}

#[tokio::test]
async fn test_directory_on_disk_roundtrips_between_peers() {
    let src = TempDir::new("src");
    std::fs::write(src.path().join("readme.txt"), b"arbor test tree\n").unwrap();
    std::fs::create_dir_all(src.path().join("docs").join("deep")).unwrap();
    std::fs::write(src.path().join("docs").join("a.bin"), pattern(70_000, 1)).unwrap();
    std::fs::write(src.path().join("docs").join("deep").join("b.bin"), pattern(1025, 2)).unwrap();
    std::fs::write(src.path().join("docs").join("empty"), b"").unwrap();

    let exported = load_tree(src.path()).unwrap();
    let a = spawn_node("alice", empty_tree("a")).await.unwrap();
    let b = spawn_node("bob", exported.clone()).await.unwrap();

    a.scheduler.handshake(b.addr).await.unwrap();
    let tree = a.scheduler.fetch_tree(b.addr).await.unwrap();
    assert_eq!(tree.hash(), exported.hash());

    let dst = TempDir::new("dst");
    let target = dst.path().join("bob");
    save_tree(&target, &tree).unwrap();

    for rel in ["readme.txt", "docs/a.bin", "docs/deep/b.bin", "docs/empty"] {
        assert_eq!(
            std::fs::read(target.join(rel)).unwrap(),
            std::fs::read(src.path().join(rel)).unwrap(),
            "{rel} differs"
        );
    }
    assert_eq!(load_tree(&target).unwrap().hash(), exported.hash());
}

#[tokio::test]
async fn test_new_export_is_visible_after_root_exchange() {
    let a = spawn_node("alice", empty_tree("a")).await.unwrap();
    let b = spawn_node("bob", empty_tree("b")).await.unwrap();

    let first = a.scheduler.handshake(b.addr).await.unwrap();
    let empty = a.scheduler.fetch_tree(b.addr).await.unwrap();
    assert!(empty.children().is_empty());

    let updated = File::directory(
        "b".into(),
        vec![File::chunk("news.txt".into(), &b"fresh content"[..])],
    );
    b.scheduler.set_exported(updated.clone()).await;

    let second = a.scheduler.send_root(b.addr).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(second, updated.hash());

    let tree = a.scheduler.fetch_tree(b.addr).await.unwrap();
    assert_eq!(tree.hash(), updated.hash());
    assert_eq!(tree.children()[0].name().to_string(), "news.txt");
}

#[tokio::test]
async fn test_stale_root_reports_no_datum() {
    let a = spawn_node("alice", empty_tree("a")).await.unwrap();
    let b = spawn_node(
        "bob",
        File::directory("b".into(), vec![File::chunk("x".into(), &b"x"[..])]),
    )
    .await
    .unwrap();

    a.scheduler.handshake(b.addr).await.unwrap();
    // Bob moves on without telling Alice.
    b.scheduler.set_exported(empty_tree("b2")).await;

    let err = a.scheduler.fetch_tree(b.addr).await.unwrap_err();
    assert!(matches!(err, DownloadError::NoDatum(_)));
}
