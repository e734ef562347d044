use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};

use devhub_sync::db;
use devhub_sync::keys::{self, SyncKey};
use devhub_sync::op::Operation;
use devhub_sync::store::{MemoryStore, OpStore};
use devhub_sync::sync;

#[test]
fn rotation_repushes_everything_under_the_new_key() {
    let store = MemoryStore::new();
    let old_key = SyncKey::generate();

    let dir_a = tempfile::tempdir().expect("tempdir A");
    let conn_a = db::open(dir_a.path()).expect("open A");
    keys::store(&conn_a, &old_key).expect("store key A");

    db::put_entity_with_op(&conn_a, "links", "L1", &serde_json::json!({"url": "x"}))
        .expect("put L1");
    db::put_entity_with_op(&conn_a, "tags", "T1", &serde_json::json!({"name": "ci"}))
        .expect("put T1");
    sync::push(&conn_a, &old_key, &store).expect("push under old key");
    sync::pull(&conn_a, &old_key, &store).expect("pull to advance cursor");

    let new_key = SyncKey::generate();
    let repushed = sync::rotate_key(&conn_a, &store, &new_key).expect("rotate");
    assert_eq!(repushed, 2);

    // The active key changed and the cursor was discarded.
    assert_eq!(keys::load(&conn_a).expect("load").expect("key"), new_key);
    assert_eq!(db::get_cursor(&conn_a).expect("cursor"), 0);
    assert_eq!(db::pending_count(&conn_a).expect("pending"), 0);

    // The store holds only the re-pushed ops, at sequence numbers past the
    // pre-rotation ones.
    assert_eq!(store.len(), 2);
    let seqs: Vec<i64> = store.snapshot().iter().filter_map(|op| op.server_seq).collect();
    assert_eq!(seqs, vec![3, 4]);

    // A fresh device holding only the new key can read everything.
    let dir_b = tempfile::tempdir().expect("tempdir B");
    let conn_b = db::open(dir_b.path()).expect("open B");
    let applied = sync::pull(&conn_b, &new_key, &store).expect("pull B");
    assert_eq!(applied, 2);
    assert!(db::get_entity(&conn_b, "links", "L1").expect("L1").is_some());
    assert!(db::get_entity(&conn_b, "tags", "T1").expect("T1").is_some());
    assert_eq!(db::get_cursor(&conn_b).expect("cursor B"), 4);
}

#[test]
fn stale_key_device_fails_loudly_until_it_adopts_the_new_key() {
    let store = MemoryStore::new();
    let old_key = SyncKey::generate();

    let dir_a = tempfile::tempdir().expect("tempdir A");
    let conn_a = db::open(dir_a.path()).expect("open A");
    db::put_entity_with_op(&conn_a, "links", "L1", &serde_json::json!({"url": "x"}))
        .expect("put");
    sync::push(&conn_a, &old_key, &store).expect("push old");

    let new_key = SyncKey::generate();
    sync::rotate_key(&conn_a, &store, &new_key).expect("rotate");

    // A device still on the old key cannot read the re-pushed ops; the pull
    // fails loudly instead of silently skipping them, and the cursor holds.
    let dir_c = tempfile::tempdir().expect("tempdir C");
    let conn_c = db::open(dir_c.path()).expect("open C");
    let err = sync::pull(&conn_c, &old_key, &store).unwrap_err();
    assert!(err.is::<devhub_sync::crypto::Undecryptable>());
    assert_eq!(db::get_cursor(&conn_c).expect("cursor C"), 0);
    assert!(db::get_entity(&conn_c, "links", "L1").expect("L1").is_none());

    // Adopting the new key unblocks it.
    sync::adopt_rotated_key(&conn_c, &store, &new_key).expect("adopt");
    let applied = sync::pull(&conn_c, &new_key, &store).expect("pull C");
    assert_eq!(applied, 1);
    assert!(db::get_entity(&conn_c, "links", "L1").expect("L1").is_some());
}

struct FlakyResetStore {
    inner: MemoryStore,
    fail_next_reset: AtomicBool,
}

impl FlakyResetStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_next_reset: AtomicBool::new(true),
        }
    }
}

impl OpStore for FlakyResetStore {
    fn push(&self, ops: &[Operation]) -> Result<i64> {
        self.inner.push(ops)
    }

    fn pull(
        &self,
        cursor: i64,
        exclude_client: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<Operation>, i64)> {
        self.inner.pull(cursor, exclude_client, limit)
    }

    fn count_pending(&self, cursor: i64, exclude_client: Option<&str>) -> Result<i64> {
        self.inner.count_pending(cursor, exclude_client)
    }

    fn reset(&self) -> Result<()> {
        if self.fail_next_reset.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("connection reset by peer"));
        }
        self.inner.reset()
    }

    fn health(&self) -> Result<()> {
        self.inner.health()
    }
}

#[test]
fn failed_remote_reset_leaves_rotation_retryable() {
    let store = FlakyResetStore::new();
    let old_key = SyncKey::generate();

    let dir = tempfile::tempdir().expect("tempdir");
    let conn = db::open(dir.path()).expect("open");
    db::put_entity_with_op(&conn, "links", "L1", &serde_json::json!({"url": "x"}))
        .expect("put");
    sync::push(&conn, &old_key, &store).expect("push old");
    sync::pull(&conn, &old_key, &store).expect("pull");

    // The remote reset fails mid-rotation. The local swap already committed,
    // so the device holds the new key and everything is pending again.
    let new_key = SyncKey::generate();
    sync::rotate_key(&conn, &store, &new_key).unwrap_err();
    assert_eq!(keys::load(&conn).expect("load").expect("key"), new_key);
    assert_eq!(db::get_cursor(&conn).expect("cursor"), 0);
    assert_eq!(db::pending_count(&conn).expect("pending"), 1);

    // Retrying with the same key completes the rotation.
    let repushed = sync::rotate_key(&conn, &store, &new_key).expect("retry");
    assert_eq!(repushed, 1);
    assert_eq!(db::pending_count(&conn).expect("pending"), 0);

    let dir_b = tempfile::tempdir().expect("tempdir B");
    let conn_b = db::open(dir_b.path()).expect("open B");
    let applied = sync::pull(&conn_b, &new_key, &store).expect("pull B");
    assert_eq!(applied, 1);
    assert!(db::get_entity(&conn_b, "links", "L1").expect("L1").is_some());
}

#[test]
fn adopting_devices_repush_is_deduplicated() {
    let store = MemoryStore::new();
    let old_key = SyncKey::generate();

    // A and B share state under the old key.
    let dir_a = tempfile::tempdir().expect("tempdir A");
    let conn_a = db::open(dir_a.path()).expect("open A");
    db::put_entity_with_op(&conn_a, "links", "L1", &serde_json::json!({"url": "x"}))
        .expect("put A");
    sync::push(&conn_a, &old_key, &store).expect("push A");

    let dir_b = tempfile::tempdir().expect("tempdir B");
    let conn_b = db::open(dir_b.path()).expect("open B");
    sync::pull(&conn_b, &old_key, &store).expect("pull B");

    // A rotates; B adopts. B re-pushes the same op id, which the store drops.
    let new_key = SyncKey::generate();
    sync::rotate_key(&conn_a, &store, &new_key).expect("rotate A");
    sync::adopt_rotated_key(&conn_b, &store, &new_key).expect("adopt B");

    assert_eq!(store.len(), 1);
}
