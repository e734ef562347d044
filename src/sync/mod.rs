use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as B64_STD;
use base64::Engine as _;
use rusqlite::Connection;

use crate::crypto;
use crate::db;
use crate::keys::SyncKey;
use crate::op::{payload_aad, Operation};
use crate::store::OpStore;

pub const DEFAULT_BATCH_LIMIT: usize = 200;
/// Upper bound on pull batches per cycle, so one cycle cannot spin forever.
pub const MAX_PULL_BATCHES: usize = 50;
/// A cycle continuously `syncing` longer than this is considered stuck.
pub const STUCK_CYCLE_TIMEOUT_MS: i64 = 5 * 60 * 1000;

const KV_STATUS: &str = "sync.status";
const KV_STARTED_AT: &str = "sync.started_at";
const KV_LAST_ERROR: &str = "sync.last_error";
const KV_LAST_SYNC_AT: &str = "sync.last_sync_at";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Status {
    #[default]
    Idle,
    Syncing,
    Partial,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Syncing => "syncing",
            Status::Partial => "partial",
            Status::Error => "error",
        }
    }

    fn parse(s: &str) -> Status {
        match s {
            "syncing" => Status::Syncing,
            "partial" => Status::Partial,
            "error" => Status::Error,
            _ => Status::Idle,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncStatus {
    pub status: Status,
    pub started_at_ms: Option<i64>,
    pub last_error: Option<String>,
    pub last_sync_at_ms: Option<i64>,
}

pub fn sync_status(conn: &Connection) -> Result<SyncStatus> {
    Ok(SyncStatus {
        status: db::kv_get_string(conn, KV_STATUS)?
            .map(|s| Status::parse(&s))
            .unwrap_or_default(),
        started_at_ms: db::kv_get_i64(conn, KV_STARTED_AT)?,
        last_error: db::kv_get_string(conn, KV_LAST_ERROR)?,
        last_sync_at_ms: db::kv_get_i64(conn, KV_LAST_SYNC_AT)?,
    })
}

/// Returns `false` without touching anything when a cycle is already running.
pub fn begin_cycle(conn: &Connection, now_ms: i64) -> Result<bool> {
    db::with_immediate_transaction(conn, || {
        let current = db::kv_get_string(conn, KV_STATUS)?
            .map(|s| Status::parse(&s))
            .unwrap_or_default();
        if current == Status::Syncing {
            return Ok(false);
        }

        db::kv_set_string(conn, KV_STATUS, Status::Syncing.as_str())?;
        db::kv_set_i64(conn, KV_STARTED_AT, now_ms)?;
        Ok(true)
    })
}

pub fn finish_cycle(conn: &Connection, now_ms: i64, errors: &[String]) -> Result<Status> {
    let status = if errors.is_empty() {
        Status::Idle
    } else {
        Status::Partial
    };

    db::with_immediate_transaction(conn, || {
        db::kv_set_string(conn, KV_STATUS, status.as_str())?;
        db::kv_set_i64(conn, KV_LAST_SYNC_AT, now_ms)?;
        if errors.is_empty() {
            db::kv_delete(conn, KV_LAST_ERROR)?;
        } else {
            db::kv_set_string(conn, KV_LAST_ERROR, &errors.join("; "))?;
        }
        Ok(status)
    })
}

pub fn fail_cycle(conn: &Connection, now_ms: i64, message: &str) -> Result<()> {
    db::with_immediate_transaction(conn, || {
        db::kv_set_string(conn, KV_STATUS, Status::Error.as_str())?;
        db::kv_set_i64(conn, KV_LAST_SYNC_AT, now_ms)?;
        db::kv_set_string(conn, KV_LAST_ERROR, message)?;
        Ok(())
    })
}

/// Forces `syncing → error` once the status has been `syncing` continuously
/// for longer than [`STUCK_CYCLE_TIMEOUT_MS`], unblocking future cycles.
pub fn watchdog_reset_if_stuck(conn: &Connection, now_ms: i64) -> Result<bool> {
    db::with_immediate_transaction(conn, || {
        let status = db::kv_get_string(conn, KV_STATUS)?
            .map(|s| Status::parse(&s))
            .unwrap_or_default();
        if status != Status::Syncing {
            return Ok(false);
        }

        let started_at = db::kv_get_i64(conn, KV_STARTED_AT)?.unwrap_or(now_ms);
        if now_ms - started_at <= STUCK_CYCLE_TIMEOUT_MS {
            return Ok(false);
        }

        db::kv_set_string(conn, KV_STATUS, Status::Error.as_str())?;
        db::kv_set_string(
            conn,
            KV_LAST_ERROR,
            "sync cycle watchdog: stuck in syncing for over 5 minutes, forcing error",
        )?;
        tracing::warn!(started_at, now_ms, "sync watchdog reset a stuck cycle");
        Ok(true)
    })
}

/// Seals the payload for transport; everything but the payload travels as-is.
fn seal_for_wire(key: &SyncKey, op: &Operation) -> Result<Operation> {
    let mut wire = op.clone();
    if let Some(payload) = &op.payload {
        let blob = crypto::seal(
            key.as_bytes(),
            payload.as_bytes(),
            payload_aad(&op.id).as_bytes(),
        )?;
        wire.payload = Some(B64_STD.encode(blob));
    }
    Ok(wire)
}

fn open_from_wire(key: &SyncKey, op: &Operation) -> Result<Operation> {
    let mut plain = op.clone();
    if let Some(payload) = &op.payload {
        let blob = B64_STD
            .decode(payload.as_bytes())
            .map_err(|e| anyhow!("invalid sealed payload encoding: {e}"))?;
        let plaintext = crypto::unseal(key.as_bytes(), &blob, payload_aad(&op.id).as_bytes())?;
        plain.payload = Some(String::from_utf8(plaintext)?);
    }
    Ok(plain)
}

/// Pushes pending ops sealed under the active key; marks them synced only
/// after the store acknowledged the batch.
pub fn push(conn: &Connection, key: &SyncKey, store: &dyn OpStore) -> Result<u64> {
    let pending = db::pending_ops(conn)?;
    if pending.is_empty() {
        return Ok(0);
    }

    let mut wire_ops = Vec::with_capacity(pending.len());
    for op in &pending {
        wire_ops.push(seal_for_wire(key, op)?);
    }

    let cursor = store.push(&wire_ops)?;

    let ids: Vec<String> = pending.into_iter().map(|op| op.id).collect();
    db::mark_synced(conn, &ids)?;
    tracing::debug!(pushed = ids.len(), cursor, "pushed pending operations");
    Ok(ids.len() as u64)
}

/// Applies each batch and advances the cursor in one transaction. A payload
/// that cannot be unsealed rolls the whole batch back, leaving the cursor
/// before the failing op.
pub fn pull(conn: &Connection, key: &SyncKey, store: &dyn OpStore) -> Result<u64> {
    pull_internal(conn, key, store, DEFAULT_BATCH_LIMIT, None)
}

pub fn pull_with_limit(
    conn: &Connection,
    key: &SyncKey,
    store: &dyn OpStore,
    batch_limit: usize,
) -> Result<u64> {
    pull_internal(conn, key, store, batch_limit, None)
}

pub fn pull_with_progress(
    conn: &Connection,
    key: &SyncKey,
    store: &dyn OpStore,
    batch_limit: usize,
    progress: &mut dyn FnMut(u64, u64),
) -> Result<u64> {
    pull_internal(conn, key, store, batch_limit, Some(progress))
}

fn pull_internal(
    conn: &Connection,
    key: &SyncKey,
    store: &dyn OpStore,
    batch_limit: usize,
    mut progress: Option<&mut dyn FnMut(u64, u64)>,
) -> Result<u64> {
    let client_id = db::get_or_create_client_id(conn)?;
    let mut cursor = db::get_cursor(conn)?;

    // Count is a hint (possibly approximate per backend); only fetched when
    // someone is listening.
    let total = if progress.is_some() {
        store
            .count_pending(cursor, Some(&client_id))
            .unwrap_or(0)
            .max(0) as u64
    } else {
        0
    };
    if let Some(cb) = progress.as_deref_mut() {
        cb(0, total);
    }

    let mut applied = 0u64;
    for _ in 0..MAX_PULL_BATCHES {
        let (ops, next_cursor) = store.pull(cursor, Some(&client_id), batch_limit)?;
        if ops.is_empty() {
            break;
        }

        let batch_applied = db::with_immediate_transaction(conn, || {
            let mut batch_applied = 0u64;
            for wire_op in &ops {
                let op = open_from_wire(key, wire_op)?;
                if db::apply_remote(conn, &op)? {
                    batch_applied += 1;
                }
            }
            db::set_cursor(conn, next_cursor)?;
            Ok(batch_applied)
        })?;

        applied += batch_applied;
        cursor = next_cursor;
        if let Some(cb) = progress.as_deref_mut() {
            cb(applied, total.max(applied));
        }
    }

    if let Some(cb) = progress.as_deref_mut() {
        cb(applied, total.max(applied));
    }
    Ok(applied)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingCounts {
    pub push: u64,
    /// The store's count, exact or approximate depending on backend.
    pub pull: u64,
}

pub fn pending_counts(conn: &Connection, store: &dyn OpStore) -> Result<PendingCounts> {
    let push = db::pending_count(conn)?;
    let client_id = db::get_or_create_client_id(conn)?;
    let cursor = db::get_cursor(conn)?;
    let pull = store.count_pending(cursor, Some(&client_id))?.max(0) as u64;
    Ok(PendingCounts { push, pull })
}

/// Rotates the active key. The local swap commits first (key stored, cursor
/// discarded, every op flipped back to pending), then the remote log is reset
/// and everything is re-pushed sealed under the new key. Sequence numbers keep
/// climbing across the reset, so serverSeq is never reused and other devices'
/// cursors stay behind the re-pushed ops.
///
/// If the reset or the re-push fails, the device already holds the new key
/// with all ops pending; retrying with the same key completes the rotation.
/// Destructive; callers confirm with the user before invoking.
pub fn rotate_key(
    conn: &Connection,
    store: &dyn OpStore,
    new_key: &SyncKey,
) -> Result<u64> {
    crate::keys::rotate(conn, new_key)?;
    store.reset()?;
    push(conn, new_key, store)
}

/// Installs a key rotated on another device: same local steps, no remote
/// reset. Ops another device already re-pushed are deduplicated by id.
pub fn adopt_rotated_key(
    conn: &Connection,
    store: &dyn OpStore,
    new_key: &SyncKey,
) -> Result<u64> {
    crate::keys::rotate(conn, new_key)?;
    push(conn, new_key, store)
}

#[cfg(test)]
mod status_tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn begin_cycle_is_a_noop_while_syncing() {
        let dir = tempdir().expect("tempdir");
        let conn = db::open(dir.path()).expect("open");

        assert!(begin_cycle(&conn, 1_000).expect("first begin"));
        assert!(!begin_cycle(&conn, 2_000).expect("second begin"));

        let status = sync_status(&conn).expect("status");
        assert_eq!(status.status, Status::Syncing);
        assert_eq!(status.started_at_ms, Some(1_000));
    }

    #[test]
    fn finish_cycle_without_errors_goes_idle() {
        let dir = tempdir().expect("tempdir");
        let conn = db::open(dir.path()).expect("open");

        begin_cycle(&conn, 1_000).expect("begin");
        let status = finish_cycle(&conn, 5_000, &[]).expect("finish");
        assert_eq!(status, Status::Idle);

        let record = sync_status(&conn).expect("status");
        assert_eq!(record.status, Status::Idle);
        assert_eq!(record.last_sync_at_ms, Some(5_000));
        assert!(record.last_error.is_none());
    }

    #[test]
    fn finish_cycle_with_errors_goes_partial_and_concatenates() {
        let dir = tempdir().expect("tempdir");
        let conn = db::open(dir.path()).expect("open");

        begin_cycle(&conn, 1_000).expect("begin");
        let errors = vec!["jenkins: HTTP 503".to_string(), "news: timed out".to_string()];
        let status = finish_cycle(&conn, 5_000, &errors).expect("finish");
        assert_eq!(status, Status::Partial);

        let record = sync_status(&conn).expect("status");
        assert_eq!(
            record.last_error.as_deref(),
            Some("jenkins: HTTP 503; news: timed out")
        );
    }

    #[test]
    fn watchdog_ignores_fresh_cycles() {
        let dir = tempdir().expect("tempdir");
        let conn = db::open(dir.path()).expect("open");

        begin_cycle(&conn, 1_000).expect("begin");
        let fired = watchdog_reset_if_stuck(&conn, 1_000 + STUCK_CYCLE_TIMEOUT_MS)
            .expect("watchdog");
        assert!(!fired);
        assert_eq!(sync_status(&conn).expect("status").status, Status::Syncing);
    }

    #[test]
    fn watchdog_forces_error_after_timeout() {
        let dir = tempdir().expect("tempdir");
        let conn = db::open(dir.path()).expect("open");

        begin_cycle(&conn, 1_000).expect("begin");
        let fired = watchdog_reset_if_stuck(&conn, 1_001 + STUCK_CYCLE_TIMEOUT_MS)
            .expect("watchdog");
        assert!(fired);

        let record = sync_status(&conn).expect("status");
        assert_eq!(record.status, Status::Error);
        assert!(record.last_error.expect("error").contains("watchdog"));

        // The forced transition unblocks future cycles.
        assert!(begin_cycle(&conn, 10_000).expect("begin again"));
    }

    #[test]
    fn watchdog_never_touches_terminal_states() {
        let dir = tempdir().expect("tempdir");
        let conn = db::open(dir.path()).expect("open");

        begin_cycle(&conn, 1_000).expect("begin");
        finish_cycle(&conn, 2_000, &[]).expect("finish");

        let fired = watchdog_reset_if_stuck(&conn, i64::MAX / 2).expect("watchdog");
        assert!(!fired);
        assert_eq!(sync_status(&conn).expect("status").status, Status::Idle);
    }
}
