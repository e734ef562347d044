use anyhow::Result;
use rusqlite::Connection;

use crate::crypto::Undecryptable;
use crate::db;
use crate::keys::SyncKey;
use crate::store::{AuthFailed, OpStore};
use crate::sync::{self, Status};

/// A non-replicated refresh routine run as part of an orchestrated cycle.
pub trait Refresh {
    fn name(&self) -> &str;
    fn run(&self, conn: &Connection) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct ModuleOutcome {
    pub name: String,
    pub error: Option<String>,
}

impl ModuleOutcome {
    fn ok(name: &str) -> Self {
        Self {
            name: name.to_string(),
            error: None,
        }
    }

    fn failed(name: &str, err: &anyhow::Error) -> Self {
        Self {
            name: name.to_string(),
            error: Some(format!("{err:#}")),
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone, Debug)]
pub struct CycleReport {
    pub status: Status,
    pub modules: Vec<ModuleOutcome>,
}

// A rejected credential won't heal between modules, and an undecryptable
// payload needs user action on the key first.
fn is_fatal(err: &anyhow::Error) -> bool {
    err.is::<AuthFailed>() || err.is::<Undecryptable>()
}

/// Runs engine push+pull plus every refresh module as one observable cycle.
/// Modules are attempted regardless of sibling failure; `None` means a cycle
/// was already running.
pub fn run_cycle(
    conn: &Connection,
    key: &SyncKey,
    store: &dyn OpStore,
    refreshers: &[&dyn Refresh],
    batch_limit: usize,
) -> Result<Option<CycleReport>> {
    if !sync::begin_cycle(conn, db::now_ms())? {
        return Ok(None);
    }

    let mut modules: Vec<ModuleOutcome> = Vec::new();

    // Records a sync-module outcome; returns the concatenation-ready message
    // when the failure is fatal for the whole cycle.
    fn record_sync_module(
        modules: &mut Vec<ModuleOutcome>,
        name: &str,
        result: Result<u64>,
    ) -> Option<String> {
        match result {
            Ok(_) => {
                modules.push(ModuleOutcome::ok(name));
                None
            }
            Err(err) => {
                tracing::warn!(module = name, error = %err, "sync module failed");
                modules.push(ModuleOutcome::failed(name, &err));
                is_fatal(&err).then(|| format!("{name}: {err:#}"))
            }
        }
    }

    for name in ["push", "pull"] {
        let result = match name {
            "push" => sync::push(conn, key, store),
            _ => sync::pull_with_limit(conn, key, store, batch_limit),
        };
        if let Some(fatal) = record_sync_module(&mut modules, name, result) {
            sync::fail_cycle(conn, db::now_ms(), &fatal)?;
            return Ok(Some(CycleReport {
                status: Status::Error,
                modules,
            }));
        }
    }

    for refresher in refreshers {
        let name = refresher.name();
        match refresher.run(conn) {
            Ok(()) => modules.push(ModuleOutcome::ok(name)),
            Err(err) => {
                tracing::warn!(module = name, error = %err, "refresh module failed");
                modules.push(ModuleOutcome::failed(name, &err));
            }
        }
    }

    let errors: Vec<String> = modules
        .iter()
        .filter_map(|m| m.error.as_ref().map(|e| format!("{}: {e}", m.name)))
        .collect();
    let status = sync::finish_cycle(conn, db::now_ms(), &errors)?;

    Ok(Some(CycleReport { status, modules }))
}
