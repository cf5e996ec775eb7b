//! Build Registry: the authoritative in-memory record of every build, with
//! an optional sqlite mirror for durability.
//!
//! A crash mid-build leaves the durable row in RUNNING; reconciling that on
//! restart is deliberately NOT automatic -- `Registry::open_durable` only
//! warns, leaving stale rows exactly as found.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::error::RegistryError;
use crate::model::{BuildRecord, BuildState};

/// Fields that may be updated on an existing record. Only the fields the
/// Runner actually sets at each phase boundary are exposed here.
#[derive(Default)]
pub struct StateUpdate {
    pub started_at: Option<i64>,
    pub build_dir: Option<String>,
    pub tmp_dir: Option<String>,
    pub deploy_dir: Option<String>,
}

trait DurableStore: Send {
    fn insert(&mut self, record: &BuildRecord) -> Result<(), RegistryError>;
    fn update(&mut self, record: &BuildRecord) -> Result<(), RegistryError>;
    fn load_all(&self) -> Result<Vec<BuildRecord>, RegistryError>;
}

struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    fn open(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open(path).map_err(|e| RegistryError::Store(e.to_string()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS builds (
                id TEXT PRIMARY KEY,
                customer TEXT NOT NULL,
                project_name TEXT NOT NULL,
                target_image TEXT NOT NULL,
                config_path TEXT NOT NULL,
                state TEXT NOT NULL,
                exit_code INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER NOT NULL,
                error_message TEXT NOT NULL,
                build_dir TEXT NOT NULL,
                tmp_dir TEXT NOT NULL,
                deploy_dir TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| RegistryError::Store(e.to_string()))?;
        Ok(Self { conn })
    }

    fn upsert(&mut self, record: &BuildRecord) -> Result<(), RegistryError> {
        self.conn
            .execute(
                "INSERT INTO builds (id, customer, project_name, target_image, config_path, state,
                    exit_code, started_at, ended_at, error_message, build_dir, tmp_dir, deploy_dir)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(id) DO UPDATE SET
                    state = excluded.state,
                    exit_code = excluded.exit_code,
                    started_at = excluded.started_at,
                    ended_at = excluded.ended_at,
                    error_message = excluded.error_message,
                    build_dir = excluded.build_dir,
                    tmp_dir = excluded.tmp_dir,
                    deploy_dir = excluded.deploy_dir",
                params![
                    record.id,
                    record.customer,
                    record.project_name,
                    record.target_image,
                    record.config_path,
                    record.state.to_string(),
                    record.exit_code,
                    record.started_at,
                    record.ended_at,
                    record.error_message,
                    record.build_dir,
                    record.tmp_dir,
                    record.deploy_dir,
                ],
            )
            .map_err(|e| RegistryError::Store(e.to_string()))?;
        Ok(())
    }
}

impl DurableStore for SqliteStore {
    fn insert(&mut self, record: &BuildRecord) -> Result<(), RegistryError> {
        self.upsert(record)
    }

    fn update(&mut self, record: &BuildRecord) -> Result<(), RegistryError> {
        self.upsert(record)
    }

    fn load_all(&self) -> Result<Vec<BuildRecord>, RegistryError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, customer, project_name, target_image, config_path, state, exit_code,
                        started_at, ended_at, error_message, build_dir, tmp_dir, deploy_dir
                 FROM builds",
            )
            .map_err(|e| RegistryError::Store(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                let state_str: String = row.get(5)?;
                Ok(BuildRecord {
                    id: row.get(0)?,
                    customer: row.get(1)?,
                    project_name: row.get(2)?,
                    target_image: row.get(3)?,
                    config_path: row.get(4)?,
                    state: state_str.parse().unwrap_or(BuildState::Failed),
                    exit_code: row.get(6)?,
                    started_at: row.get(7)?,
                    ended_at: row.get(8)?,
                    error_message: row.get(9)?,
                    build_dir: row.get(10)?,
                    tmp_dir: row.get(11)?,
                    deploy_dir: row.get(12)?,
                })
            })
            .map_err(|e| RegistryError::Store(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| RegistryError::Store(e.to_string()))?);
        }
        Ok(out)
    }
}

struct Inner {
    records: HashMap<String, BuildRecord>,
    store: Option<Box<dyn DurableStore>>,
}

/// In-memory record of every build, single-lock-guarded (no sharding).
/// Mirrors to sqlite in the same critical section when a `db_path` was
/// configured.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { records: HashMap::new(), store: None }),
        }
    }

    /// Open (or create) a durable sqlite mirror at `path`, loading any
    /// existing rows into memory. Rows already `RUNNING` are left exactly
    /// as they were found and logged once.
    pub fn open_durable(path: &Path) -> Result<Self, RegistryError> {
        let store = SqliteStore::open(path)?;
        let existing = store.load_all()?;
        let mut records = HashMap::new();
        let mut stale_running = Vec::new();
        for rec in existing {
            if rec.state == BuildState::Running {
                stale_running.push(rec.id.clone());
            }
            records.insert(rec.id.clone(), rec);
        }
        if !stale_running.is_empty() {
            tracing::warn!(
                ids = ?stale_running,
                "found {} build(s) left RUNNING by a prior daemon instance; not auto-resuming or auto-failing them",
                stale_running.len()
            );
        }
        Ok(Self {
            inner: Mutex::new(Inner { records, store: Some(Box::new(store)) }),
        })
    }

    pub fn create(&self, record: BuildRecord) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(store) = inner.store.as_mut() {
            store.insert(&record)?;
        }
        inner.records.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<BuildRecord, RegistryError> {
        let inner = self.inner.lock().unwrap();
        inner.records.get(id).cloned().ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn list(&self, state_filter: &[BuildState], limit: Option<usize>) -> Vec<BuildRecord> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<BuildRecord> = inner
            .records
            .values()
            .filter(|r| state_filter.is_empty() || state_filter.contains(&r.state))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }

    pub fn update_state(&self, id: &str, state: BuildState, update: StateUpdate) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.records.get_mut(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if !record.can_transition_to(state) {
            return Err(RegistryError::IllegalTransition {
                id: id.to_string(),
                from: record.state.to_string(),
                to: state.to_string(),
            });
        }
        record.state = state;
        if let Some(v) = update.started_at {
            record.started_at = v;
        }
        if let Some(v) = update.build_dir {
            record.build_dir = v;
        }
        if let Some(v) = update.tmp_dir {
            record.tmp_dir = v;
        }
        if let Some(v) = update.deploy_dir {
            record.deploy_dir = v;
        }
        let snapshot = record.clone();
        if let Some(store) = inner.store.as_mut() {
            store.update(&snapshot)?;
        }
        Ok(())
    }

    pub fn mark_terminal(&self, id: &str, state: BuildState, exit_code: i32, error_message: String, ended_at: i64) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.records.get_mut(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if record.state.is_terminal() {
            return Err(RegistryError::IllegalTransition {
                id: id.to_string(),
                from: record.state.to_string(),
                to: state.to_string(),
            });
        }
        if !record.can_transition_to(state) {
            return Err(RegistryError::IllegalTransition {
                id: id.to_string(),
                from: record.state.to_string(),
                to: state.to_string(),
            });
        }
        record.state = state;
        record.exit_code = exit_code;
        record.error_message = error_message;
        record.ended_at = ended_at;
        if record.started_at == 0 {
            record.started_at = ended_at;
        }
        let snapshot = record.clone();
        if let Some(store) = inner.store.as_mut() {
            store.update(&snapshot)?;
        }
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BuildRecord;

    fn rec(id: &str) -> BuildRecord {
        BuildRecord::new(id.into(), String::new(), "proj".into(), "target".into(), "/cfg".into())
    }

    #[test]
    fn terminal_states_are_immutable() {
        let reg = Registry::new();
        reg.create(rec("a")).unwrap();
        reg.update_state("a", BuildState::Running, StateUpdate { started_at: Some(1), ..Default::default() }).unwrap();
        reg.mark_terminal("a", BuildState::Succeeded, 0, String::new(), 2).unwrap();
        let err = reg.mark_terminal("a", BuildState::Failed, 1, "x".into(), 3);
        assert!(err.is_err());
        let got = reg.get("a").unwrap();
        assert_eq!(got.state, BuildState::Succeeded);
    }

    #[test]
    fn cancel_before_dispatch_is_direct() {
        let reg = Registry::new();
        reg.create(rec("a")).unwrap();
        reg.mark_terminal("a", BuildState::Canceled, crate::model::EXIT_CODE_CANCELED, String::new(), 5).unwrap();
        let got = reg.get("a").unwrap();
        assert_eq!(got.state, BuildState::Canceled);
    }

    #[test]
    fn list_orders_newest_first() {
        let reg = Registry::new();
        let mut a = rec("a");
        a.started_at = 10;
        let mut b = rec("b");
        b.started_at = 20;
        reg.create(a).unwrap();
        reg.create(b).unwrap();
        let all = reg.list(&[], None);
        assert_eq!(all[0].id, "b");
        assert_eq!(all[1].id, "a");
    }

    #[test]
    fn durable_mirror_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("builds.db");
        {
            let reg = Registry::open_durable(&db_path).unwrap();
            reg.create(rec("a")).unwrap();
            reg.update_state("a", BuildState::Running, StateUpdate { started_at: Some(42), ..Default::default() }).unwrap();
        }
        let reopened = Registry::open_durable(&db_path).unwrap();
        let got = reopened.get("a").unwrap();
        assert_eq!(got.state, BuildState::Running);
        assert_eq!(got.started_at, 42);
    }
}
