//! Integration tests for the on-disk stores.
//!
//! Every test uses its own temporary directory.

use std::sync::Arc;
use std::time::Duration;
use tandem_collab::{
    Anarchy, BinderConfig, Curator, CuratorConfig, Document, FileStore, RocksStore, Store,
    StoreConfig, StoreError, StoreType,
};
use tandem_text::Transform;

const TIMEOUT: Duration = Duration::from_secs(2);

fn quiet_config() -> CuratorConfig {
    CuratorConfig {
        binder: BinderConfig {
            flush_period_ms: 60_000,
            ..Default::default()
        },
    }
}

/// Edit `id` through a curator on `store`, then close the curator.
async fn edit_and_close(store: Arc<dyn Store>, id: &str, edits: &[(i64, i64, &str)]) {
    let curator = Curator::new(quiet_config(), Arc::new(Anarchy { allow_create: true }), store);
    let portal = curator.edit_document("alice", "", id, TIMEOUT).await.unwrap();

    let mut version = portal.base_version();
    for (position, delete, insert) in edits {
        version = portal
            .send_transform(Transform::new(*position, *delete, *insert, version + 1), TIMEOUT)
            .await
            .unwrap();
    }
    curator.close().await;
}

#[tokio::test]
async fn test_file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let doc = Document::new("hello world");

    {
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        store.create(&doc).unwrap();
        edit_and_close(store, &doc.id, &[(6, 5, "universe"), (0, 0, "oh ")]).await;
    }

    let reopened = FileStore::open(dir.path()).unwrap();
    assert_eq!(reopened.read(&doc.id).unwrap().content, "oh hello universe");
}

#[tokio::test]
async fn test_rocks_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");
    let doc = Document::new("hello 世界");

    {
        let store = Arc::new(RocksStore::open(&path).unwrap());
        store.create(&doc).unwrap();
        edit_and_close(store, &doc.id, &[(6, 2, "地球"), (8, 0, "!")]).await;
    }

    let reopened = RocksStore::open(&path).unwrap();
    assert_eq!(reopened.read(&doc.id).unwrap().content, "hello 地球!");
    let meta = reopened.metadata(&doc.id).unwrap();
    assert_eq!(meta.size, "hello 地球!".len() as u64);
    assert!(meta.updated_at >= meta.created_at);
    assert_eq!(reopened.list_documents().unwrap(), vec![doc.id.clone()]);
}

#[tokio::test]
async fn test_store_config_builds_backends() {
    let dir = tempfile::tempdir().unwrap();

    for store_type in [StoreType::Memory, StoreType::File, StoreType::Rocks] {
        let config = StoreConfig {
            store_type,
            path: dir.path().join(format!("{store_type:?}")),
        };
        let store = config.build().unwrap();

        let doc = Document::new("content");
        store.create(&doc).unwrap();
        assert_eq!(store.read(&doc.id).unwrap(), doc, "{store_type:?}");
        assert_eq!(
            store.create(&doc),
            Err(StoreError::AlreadyExists(doc.id.clone())),
            "{store_type:?}"
        );
        assert_eq!(
            store.read("missing"),
            Err(StoreError::NotFound("missing".into())),
            "{store_type:?}"
        );
    }
}

#[tokio::test]
async fn test_binder_fails_on_unreadable_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let curator = Curator::new(quiet_config(), Arc::new(Anarchy { allow_create: true }), store);

    let err = curator
        .edit_document("alice", "", "../escape", TIMEOUT)
        .await
        .err()
        .unwrap();
    assert_eq!(
        err.to_string(),
        StoreError::InvalidId("../escape".into()).to_string()
    );
    assert!(curator.open_documents().await.is_empty());
}
