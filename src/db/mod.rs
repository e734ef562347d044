use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::op::{OpType, Operation};

fn db_path(app_dir: &Path) -> PathBuf {
    app_dir.join("devhub.sqlite3")
}

pub fn open(app_dir: &Path) -> Result<Connection> {
    fs::create_dir_all(app_dir)?;
    let conn = Connection::open(db_path(app_dir))?;

    let journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    if !journal_mode.eq_ignore_ascii_case("wal") {
        return Err(anyhow!("failed to enable WAL mode, got: {journal_mode}"));
    }

    migrate(&conn)?;
    Ok(conn)
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    let user_version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if user_version < 1 {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS operations (
  id TEXT PRIMARY KEY,
  client_id TEXT NOT NULL,
  tbl TEXT NOT NULL,
  op_type TEXT NOT NULL,
  entity_key TEXT NOT NULL,
  payload TEXT,
  ts_ms INTEGER NOT NULL,
  server_seq INTEGER,
  synced INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_operations_synced ON operations(synced);
CREATE INDEX IF NOT EXISTS idx_operations_client ON operations(client_id);

CREATE TABLE IF NOT EXISTS entities (
  tbl TEXT NOT NULL,
  entity_key TEXT NOT NULL,
  payload TEXT,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (tbl, entity_key)
);

CREATE TABLE IF NOT EXISTS cache (
  name TEXT PRIMARY KEY,
  payload TEXT NOT NULL,
  fetched_at INTEGER NOT NULL
);

PRAGMA user_version = 1;
"#,
        )?;
    }

    Ok(())
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn kv_get_string(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        r#"SELECT value FROM kv WHERE key = ?1"#,
        params![key],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn kv_set_string(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        r#"INSERT INTO kv(key, value) VALUES (?1, ?2)
           ON CONFLICT(key) DO UPDATE SET value = excluded.value"#,
        params![key, value],
    )?;
    Ok(())
}

pub(crate) fn kv_get_i64(conn: &Connection, key: &str) -> Result<Option<i64>> {
    Ok(kv_get_string(conn, key)?.and_then(|v| v.parse::<i64>().ok()))
}

pub(crate) fn kv_set_i64(conn: &Connection, key: &str, value: i64) -> Result<()> {
    kv_set_string(conn, key, &value.to_string())
}

pub(crate) fn kv_delete(conn: &Connection, key: &str) -> Result<()> {
    conn.execute(r#"DELETE FROM kv WHERE key = ?1"#, params![key])?;
    Ok(())
}

pub(crate) fn with_immediate_transaction<T>(
    conn: &Connection,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE;")?;
    match f() {
        Ok(v) => {
            conn.execute_batch("COMMIT;")?;
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK;");
            Err(e)
        }
    }
}

pub fn get_or_create_client_id(conn: &Connection) -> Result<String> {
    if let Some(client_id) = kv_get_string(conn, "client_id")? {
        return Ok(client_id);
    }

    let client_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        r#"INSERT INTO kv(key, value) VALUES ('client_id', ?1)"#,
        params![client_id],
    )?;
    Ok(client_id)
}

const KV_CURSOR: &str = "sync.cursor";

/// Highest serverSeq this device has durably applied.
pub fn get_cursor(conn: &Connection) -> Result<i64> {
    Ok(kv_get_i64(conn, KV_CURSOR)?.unwrap_or(0))
}

pub fn set_cursor(conn: &Connection, cursor: i64) -> Result<()> {
    kv_set_i64(conn, KV_CURSOR, cursor)
}

pub fn clear_cursor(conn: &Connection) -> Result<()> {
    kv_delete(conn, KV_CURSOR)
}

fn insert_local_op(conn: &Connection, op: &Operation) -> Result<()> {
    conn.execute(
        r#"INSERT INTO operations(id, client_id, tbl, op_type, entity_key, payload, ts_ms, synced)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)"#,
        params![
            op.id,
            op.client_id,
            op.table,
            op.op_type.as_str(),
            op.key,
            op.payload,
            op.timestamp
        ],
    )?;
    Ok(())
}

/// Entity upsert and op append happen in one transaction so replication cannot
/// miss the write.
pub fn put_entity_with_op(
    conn: &Connection,
    table: &str,
    key: &str,
    payload: &serde_json::Value,
) -> Result<Operation> {
    let client_id = get_or_create_client_id(conn)?;
    let payload_json = serde_json::to_string(payload)?;
    let ts_ms = now_ms();

    with_immediate_transaction(conn, || {
        let existing: Option<i64> = conn
            .query_row(
                r#"SELECT 1 FROM entities WHERE tbl = ?1 AND entity_key = ?2"#,
                params![table, key],
                |row| row.get(0),
            )
            .optional()?;
        let op_type = if existing.is_some() {
            OpType::Update
        } else {
            OpType::Create
        };

        conn.execute(
            r#"INSERT INTO entities(tbl, entity_key, payload, updated_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(tbl, entity_key) DO UPDATE SET
                 payload = excluded.payload,
                 updated_at = excluded.updated_at"#,
            params![table, key, payload_json, ts_ms],
        )?;

        let op = Operation {
            id: uuid::Uuid::new_v4().to_string(),
            client_id: client_id.clone(),
            table: table.to_string(),
            op_type,
            key: key.to_string(),
            payload: Some(payload_json.clone()),
            timestamp: ts_ms,
            server_seq: None,
            server_timestamp: None,
        };
        insert_local_op(conn, &op)?;
        Ok(op)
    })
}

pub fn delete_entity_with_op(conn: &Connection, table: &str, key: &str) -> Result<Operation> {
    let client_id = get_or_create_client_id(conn)?;
    let ts_ms = now_ms();

    with_immediate_transaction(conn, || {
        conn.execute(
            r#"DELETE FROM entities WHERE tbl = ?1 AND entity_key = ?2"#,
            params![table, key],
        )?;

        let op = Operation {
            id: uuid::Uuid::new_v4().to_string(),
            client_id: client_id.clone(),
            table: table.to_string(),
            op_type: OpType::Delete,
            key: key.to_string(),
            payload: None,
            timestamp: ts_ms,
            server_seq: None,
            server_timestamp: None,
        };
        insert_local_op(conn, &op)?;
        Ok(op)
    })
}

pub fn get_entity(conn: &Connection, table: &str, key: &str) -> Result<Option<serde_json::Value>> {
    let payload: Option<Option<String>> = conn
        .query_row(
            r#"SELECT payload FROM entities WHERE tbl = ?1 AND entity_key = ?2"#,
            params![table, key],
            |row| row.get(0),
        )
        .optional()?;

    match payload.flatten() {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

pub fn list_entities(conn: &Connection, table: &str) -> Result<Vec<(String, serde_json::Value)>> {
    let mut stmt = conn.prepare(
        r#"SELECT entity_key, payload FROM entities
           WHERE tbl = ?1 ORDER BY entity_key ASC"#,
    )?;
    let mut rows = stmt.query(params![table])?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        let payload: Option<String> = row.get(1)?;
        let value = match payload {
            Some(json) => serde_json::from_str(&json)?,
            None => serde_json::Value::Null,
        };
        out.push((key, value));
    }
    Ok(out)
}

pub fn pending_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        r#"SELECT COUNT(*) FROM operations WHERE synced = 0"#,
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

pub fn pending_ops(conn: &Connection) -> Result<Vec<Operation>> {
    let mut stmt = conn.prepare(
        r#"SELECT id, client_id, tbl, op_type, entity_key, payload, ts_ms, server_seq
           FROM operations
           WHERE synced = 0
           ORDER BY ts_ms ASC, rowid ASC"#,
    )?;
    let mut rows = stmt.query([])?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let op_type_str: String = row.get(3)?;
        let op_type = OpType::parse(&op_type_str)
            .ok_or_else(|| anyhow!("unknown op type in local log: {op_type_str}"))?;
        out.push(Operation {
            id: row.get(0)?,
            client_id: row.get(1)?,
            table: row.get(2)?,
            op_type,
            key: row.get(4)?,
            payload: row.get(5)?,
            timestamp: row.get(6)?,
            server_seq: row.get(7)?,
            server_timestamp: None,
        });
    }
    Ok(out)
}

/// Call only after the remote store acknowledged persistence of every id.
pub fn mark_synced(conn: &Connection, ids: &[String]) -> Result<()> {
    let mut stmt = conn.prepare_cached(r#"UPDATE operations SET synced = 1 WHERE id = ?1"#)?;
    for id in ids {
        stmt.execute(params![id])?;
    }
    Ok(())
}

/// Flips every op back to pending; used by key rotation to force a re-push.
pub fn mark_all_unsynced(conn: &Connection) -> Result<u64> {
    let changed = conn.execute(r#"UPDATE operations SET synced = 0"#, [])?;
    Ok(changed as u64)
}

/// Materializes a pulled op onto the local entity. Idempotent: an id already
/// recorded (including our own echoed writes) is a no-op.
pub fn apply_remote(conn: &Connection, op: &Operation) -> Result<bool> {
    let local_client_id = get_or_create_client_id(conn)?;
    if op.client_id == local_client_id {
        return Ok(false);
    }

    let mut stmt = conn.prepare_cached(
        r#"INSERT OR IGNORE INTO operations(id, client_id, tbl, op_type, entity_key, payload, ts_ms, server_seq, synced)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)"#,
    )?;
    let inserted = stmt.execute(params![
        op.id,
        op.client_id,
        op.table,
        op.op_type.as_str(),
        op.key,
        op.payload,
        op.timestamp,
        op.server_seq
    ])?;
    if inserted == 0 {
        return Ok(false);
    }

    match op.op_type {
        OpType::Create | OpType::Update => {
            conn.execute(
                r#"INSERT INTO entities(tbl, entity_key, payload, updated_at)
                   VALUES (?1, ?2, ?3, ?4)
                   ON CONFLICT(tbl, entity_key) DO UPDATE SET
                     payload = excluded.payload,
                     updated_at = excluded.updated_at"#,
                params![op.table, op.key, op.payload, op.timestamp],
            )?;
        }
        OpType::Delete => {
            conn.execute(
                r#"DELETE FROM entities WHERE tbl = ?1 AND entity_key = ?2"#,
                params![op.table, op.key],
            )?;
        }
    }

    Ok(true)
}

pub fn put_cache(conn: &Connection, name: &str, payload: &str) -> Result<()> {
    conn.execute(
        r#"INSERT INTO cache(name, payload, fetched_at) VALUES (?1, ?2, ?3)
           ON CONFLICT(name) DO UPDATE SET
             payload = excluded.payload,
             fetched_at = excluded.fetched_at"#,
        params![name, payload, now_ms()],
    )?;
    Ok(())
}

pub fn get_cache(conn: &Connection, name: &str) -> Result<Option<(String, i64)>> {
    conn.query_row(
        r#"SELECT payload, fetched_at FROM cache WHERE name = ?1"#,
        params![name],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(Into::into)
}
