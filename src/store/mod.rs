use std::sync::Mutex;

use anyhow::{anyhow, Result};

use crate::op::Operation;

pub mod service;
pub mod sheet;

/// The remote rejected the shared credential (HTTP 401). Fatal for the cycle.
#[derive(Debug)]
pub struct AuthFailed;

impl std::fmt::Display for AuthFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "remote store rejected the sync credential")
    }
}

impl std::error::Error for AuthFailed {}

/// The shared append-only operation log: dedup-by-id append plus monotonic
/// ordered reads.
pub trait OpStore: Send + Sync {
    /// Idempotent append; returns the highest serverSeq reached. An empty
    /// batch is a no-op returning the current max.
    fn push(&self, ops: &[Operation]) -> Result<i64>;

    /// Ops with serverSeq strictly greater than `cursor`, ascending. The
    /// returned cursor is the last op's serverSeq, or the input cursor when
    /// nothing matched.
    fn pull(
        &self,
        cursor: i64,
        exclude_client: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<Operation>, i64)>;

    /// May be an approximation per backend; callers treat it as a hint.
    fn count_pending(&self, cursor: i64, exclude_client: Option<&str>) -> Result<i64>;

    /// Drops every stored op but preserves the sequence counter, so serverSeq
    /// is never reused. Called only by key rotation.
    fn reset(&self) -> Result<()>;

    fn health(&self) -> Result<()>;
}

#[derive(Default)]
struct MemoryLog {
    ops: Vec<Operation>,
    next_seq: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    log: Mutex<MemoryLog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.log.lock().map(|l| l.ops.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Operation> {
        self.log.lock().map(|l| l.ops.clone()).unwrap_or_default()
    }
}

impl OpStore for MemoryStore {
    fn push(&self, ops: &[Operation]) -> Result<i64> {
        let mut log = self.log.lock().map_err(|_| anyhow!("poisoned lock"))?;
        for op in ops {
            if log.ops.iter().any(|existing| existing.id == op.id) {
                continue;
            }
            log.next_seq += 1;
            let mut stored = op.clone();
            stored.server_seq = Some(log.next_seq);
            stored.server_timestamp = Some(crate::db::now_ms());
            log.ops.push(stored);
        }
        Ok(log.next_seq)
    }

    fn pull(
        &self,
        cursor: i64,
        exclude_client: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<Operation>, i64)> {
        let log = self.log.lock().map_err(|_| anyhow!("poisoned lock"))?;
        let ops: Vec<Operation> = log
            .ops
            .iter()
            .filter(|op| op.server_seq.unwrap_or(0) > cursor)
            .filter(|op| exclude_client != Some(op.client_id.as_str()))
            .take(limit)
            .cloned()
            .collect();

        let next_cursor = ops
            .last()
            .and_then(|op| op.server_seq)
            .unwrap_or(cursor);
        Ok((ops, next_cursor))
    }

    fn count_pending(&self, cursor: i64, exclude_client: Option<&str>) -> Result<i64> {
        let log = self.log.lock().map_err(|_| anyhow!("poisoned lock"))?;
        let count = log
            .ops
            .iter()
            .filter(|op| op.server_seq.unwrap_or(0) > cursor)
            .filter(|op| exclude_client != Some(op.client_id.as_str()))
            .count();
        Ok(count as i64)
    }

    fn reset(&self) -> Result<()> {
        let mut log = self.log.lock().map_err(|_| anyhow!("poisoned lock"))?;
        log.ops.clear();
        Ok(())
    }

    fn health(&self) -> Result<()> {
        Ok(())
    }
}
