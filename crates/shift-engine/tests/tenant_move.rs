//! End-to-end tenant moves over in-memory databases and a fake file server.

use std::sync::Arc;

use shift_core::{EnvironmentRef, SqlValue, TenantId};
use shift_engine::testing::{FakeRemote, MemoryCluster, MemoryDatabase, MemoryDirectory};
use shift_engine::{
    ManifestFileSync, MoveOptions, ShiftError, SyncPhase, TableTransferEngine, TenantMover,
    move_many,
};

fn env(s: &str) -> EnvironmentRef {
    EnvironmentRef::parse(s).unwrap()
}

fn tenant(s: &str) -> TenantId {
    TenantId::parse(s).unwrap()
}

fn blogs(db: &MemoryDatabase) {
    db.create_table("wp_blogs", &["blog_id", "domain", "path"]);
}

/// Source with tenant 5 (two tables, routing row, two files), plus a
/// neighbouring tenant 55 that must never move along with it.
fn seed_source(cluster: &MemoryCluster, remote: &FakeRemote, src: &EnvironmentRef) {
    let db = cluster.database(src);
    blogs(&db);
    db.insert("wp_blogs", &[Some("5"), Some("a.example"), Some("/")]);
    db.insert("wp_blogs", &[Some("55"), Some("b.example"), Some("/")]);

    db.create_table("wp_5_options", &["option_id", "option_name", "option_value"]);
    db.insert("wp_5_options", &[Some("1"), Some("siteurl"), Some("https://a.example")]);
    db.insert("wp_5_options", &[Some("2"), Some("blogname"), Some("A")]);
    db.create_table("wp_5_posts", &["ID", "post_title"]);
    for i in 1..=3 {
        let id = i.to_string();
        db.insert("wp_5_posts", &[Some(id.as_str()), Some("post")]);
    }
    db.create_table("wp_55_posts", &["ID", "post_title"]);
    db.insert("wp_55_posts", &[Some("1"), Some("other")]);

    remote.write_file(src, "files/sites/5/2024/01/cat.jpg", b"meow");
    remote.write_file(src, "files/sites/5/notes.txt", b"hello");
    remote.write_file(src, "files/sites/55/secret.txt", b"no");
}

struct World {
    remote: FakeRemote,
    cluster: MemoryCluster,
    directory: Arc<MemoryDirectory>,
    src: EnvironmentRef,
    dst: EnvironmentRef,
}

fn world() -> World {
    let remote = FakeRemote::new();
    let cluster = MemoryCluster::new();
    let src = env("origin.live");
    let dst = env("target.live");
    seed_source(&cluster, &remote, &src);
    blogs(&cluster.database(&dst));
    World {
        remote,
        cluster,
        directory: Arc::new(MemoryDirectory::new()),
        src,
        dst,
    }
}

#[tokio::test]
async fn move_copies_tables_row_and_files() {
    let w = world();
    let (ctx, reporter) = w.remote.context_with(&w.cluster, w.directory.clone());

    let report = TenantMover::new(&ctx)
        .move_tenant(&w.src, &w.dst, &tenant("5"), MoveOptions::default())
        .await
        .unwrap();

    assert_eq!(report.tables, vec!["wp_5_options", "wp_5_posts"]);
    let dst = w.cluster.database(&w.dst);
    assert_eq!(dst.row_count("wp_5_options"), 2);
    assert_eq!(dst.row_count("wp_5_posts"), 3);
    assert!(dst.table("wp_55_posts").is_none());

    let blogs = dst.table("wp_blogs").unwrap();
    assert_eq!(blogs.rows.len(), 1);
    assert_eq!(blogs.rows[0][0], SqlValue::Text("5".to_string()));
    assert_eq!(blogs.rows[0][1], SqlValue::Text("a.example".to_string()));

    let [got, put] = report.files.unwrap();
    assert_eq!((got.expected, got.completed), (2, 2));
    assert_eq!(put.phase, SyncPhase::Done);
    assert_eq!(w.remote.read_file(&w.dst, "files/sites/5/2024/01/cat.jpg").unwrap(), b"meow");
    assert_eq!(w.remote.file_count(&w.dst, "files/sites/55"), 0);

    assert_eq!(w.directory.wake_count(&w.src), 1);
    assert_eq!(w.directory.wake_count(&w.dst), 1);
    let events = reporter.events();
    let phases: Vec<&String> = events.iter().filter(|e| e.starts_with("phase:")).collect();
    assert_eq!(phases[1], "phase: Copying database tables");
    assert_eq!(phases[2], "phase: Copying routing row");
}

#[tokio::test]
async fn discovery_does_not_confuse_prefix_tenants() {
    let w = world();
    let (ctx, _) = w.remote.context_with(&w.cluster, w.directory.clone());
    let db = w.cluster.database(&w.src);
    db.create_table("wp_12_posts", &["ID"]);
    db.create_table("wp_123_posts", &["ID"]);
    db.create_table("wp_12x_posts", &["ID"]);

    let engine = TableTransferEngine::new(&ctx);
    let tables = engine.discover_tables(&w.src, &tenant("12")).await.unwrap();
    assert_eq!(tables.names(), ["wp_12_posts"]);
    let tables = engine.discover_tables(&w.src, &tenant("5")).await.unwrap();
    assert_eq!(tables.names(), ["wp_5_options", "wp_5_posts"]);
}

#[tokio::test]
async fn routing_row_transfer_is_idempotent() {
    let w = world();
    let (ctx, _) = w.remote.context_with(&w.cluster, w.directory.clone());
    let engine = TableTransferEngine::new(&ctx);

    engine.transfer_routing_row(&w.src, &w.dst, &tenant("5")).await.unwrap();
    engine.transfer_routing_row(&w.src, &w.dst, &tenant("5")).await.unwrap();
    assert_eq!(w.cluster.database(&w.dst).row_count("wp_blogs"), 1);
}

#[tokio::test]
async fn missing_routing_row_fails_before_any_write() {
    let w = world();
    let src = w.cluster.database(&w.src);
    src.create_table("wp_9_posts", &["ID"]);
    let (ctx, _) = w.remote.context_with(&w.cluster, w.directory.clone());

    let err = TenantMover::new(&ctx)
        .move_tenant(&w.src, &w.dst, &tenant("9"), MoveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ShiftError::Precondition(_)), "{err}");
    assert!(w.cluster.database(&w.dst).table("wp_9_posts").is_none());
}

#[tokio::test]
async fn tenant_without_tables_is_refused() {
    let w = world();
    let (ctx, _) = w.remote.context_with(&w.cluster, w.directory.clone());
    let err = TenantMover::new(&ctx)
        .move_tenant(&w.src, &w.dst, &tenant("404"), MoveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ShiftError::Precondition(_)));
}

#[tokio::test]
async fn occupied_destination_needs_force() {
    let w = world();
    let dst = w.cluster.database(&w.dst);
    dst.create_table("wp_5_posts", &["ID", "post_title"]);
    let (ctx, _) = w.remote.context_with(&w.cluster, w.directory.clone());
    let mover = TenantMover::new(&ctx);

    let err = mover
        .move_tenant(&w.src, &w.dst, &tenant("5"), MoveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ShiftError::Precondition(_)));
    assert_eq!(dst.row_count("wp_5_posts"), 0);

    let opts = MoveOptions {
        force: true,
        skip_files: true,
    };
    let report = mover.move_tenant(&w.src, &w.dst, &tenant("5"), opts).await.unwrap();
    assert!(report.files.is_none());
    assert_eq!(dst.row_count("wp_5_posts"), 3);
}

#[tokio::test]
async fn get_then_put_covers_the_manifest() {
    let w = world();
    let (ctx, _) = w.remote.context_with(&w.cluster, w.directory.clone());
    let sync = ManifestFileSync::new(&ctx);
    let id = tenant("5");

    let got = sync.get(&w.src, &id).await.unwrap();
    sync.put(&w.dst, &id).await.unwrap();

    let manifest = std::fs::read_to_string(&got.manifest).unwrap();
    assert_eq!(manifest.lines().count() as u64, got.expected);
    for path in manifest.lines() {
        let rel = format!("files/sites/5/{path}");
        assert!(w.remote.read_file(&w.dst, &rel).is_ok(), "{rel} missing");
    }
}

#[tokio::test]
async fn delete_leaves_no_files_for_tenant() {
    let w = world();
    w.remote.write_file(&w.dst, "files/sites/7/old.txt", b"x");
    w.remote.write_file(&w.dst, "files/sites/7/a/b/c.txt", b"y");
    let (ctx, _) = w.remote.context_with(&w.cluster, w.directory.clone());

    ManifestFileSync::new(&ctx).delete(&w.dst, &tenant("7")).await.unwrap();
    assert_eq!(w.remote.file_count(&w.dst, "files/sites/7"), 0);
}

#[tokio::test]
async fn batch_reports_each_tenant_in_order() {
    let w = world();
    let (ctx, _) = w.remote.context_with(&w.cluster, w.directory.clone());
    let opts = MoveOptions {
        force: false,
        skip_files: true,
    };

    let results = move_many(
        Arc::new(ctx),
        w.src.clone(),
        w.dst.clone(),
        vec![tenant("5"), tenant("404"), tenant("55"), tenant("5")],
        opts,
        2,
    )
    .await;

    let ids: Vec<&str> = results.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(ids, ["5", "404", "55"]);
    assert!(results[0].1.is_ok());
    assert!(matches!(results[1].1, Err(ShiftError::Precondition(_))));
    assert!(results[2].1.is_ok());
    assert_eq!(w.cluster.database(&w.dst).row_count("wp_blogs"), 2);
}
