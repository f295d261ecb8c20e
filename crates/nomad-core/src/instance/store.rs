use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};

use anyhow::Result;
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use super::{now_millis, Instance, InstanceStatus};

/// Registry of instance records.
///
/// The in-memory map is authoritative. When a database is attached every
/// change is written through to it; write failures are logged and do not
/// affect the in-memory view.
pub struct InstanceStore {
    records: RwLock<HashMap<String, Instance>>,
    conn: Option<Mutex<Connection>>,
    retain_history: bool,
}

impl InstanceStore {
    /// Memory-only store.
    pub fn in_memory(retain_history: bool) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            conn: None,
            retain_history,
        }
    }

    /// Open the database at `db_path`, falling back to memory-only when it
    /// cannot be opened. Records left live by a previous process are marked
    /// stopped, since their processes are not ours to supervise.
    pub fn open(db_path: &Path, retain_history: bool) -> Self {
        match open_db(db_path) {
            Ok(conn) => {
                let store = Self {
                    records: RwLock::new(HashMap::new()),
                    conn: Some(Mutex::new(conn)),
                    retain_history,
                };
                store.restore();
                store
            }
            Err(e) => {
                warn!(path = %db_path.display(), "Instance database unavailable, keeping records in memory: {e:#}");
                Self::in_memory(retain_history)
            }
        }
    }

    pub fn retains_history(&self) -> bool {
        self.retain_history
    }

    /// Add or replace a record.
    pub fn insert(&self, instance: Instance) {
        self.write().insert(instance.id.clone(), instance.clone());
        self.persist(&instance);
    }

    /// Apply `f` to a record and stamp `updated_at`. Returns the new record.
    pub fn update<F>(&self, id: &str, f: F) -> Option<Instance>
    where
        F: FnOnce(&mut Instance),
    {
        let updated = {
            let mut records = self.write();
            let record = records.get_mut(id)?;
            f(record);
            record.updated_at = now_millis();
            record.clone()
        };
        self.persist(&updated);
        Some(updated)
    }

    pub fn set_status(&self, id: &str, status: InstanceStatus) -> Option<Instance> {
        self.update(id, |r| r.status = status)
    }

    /// Move a record to a terminal status. Without history retention the
    /// record is dropped instead.
    pub fn finish(&self, id: &str, status: InstanceStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        if self.retain_history {
            self.update(id, |r| {
                r.status = status;
                r.last_error = error;
            });
        } else {
            self.remove(id);
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self.write().remove(id).is_some();
        if removed {
            self.delete(id);
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        self.read().get(id).cloned()
    }

    /// Live record owning `pid`, if any.
    pub fn find_by_pid(&self, pid: u32) -> Option<Instance> {
        self.read()
            .values()
            .find(|r| r.pid == Some(pid) && r.status.is_live())
            .cloned()
    }

    /// Records ordered by creation time. Terminal records are included only
    /// when `include_history` is set.
    pub fn list(&self, include_history: bool) -> Vec<Instance> {
        let mut records: Vec<Instance> = self
            .read()
            .values()
            .filter(|r| include_history || r.status.is_live())
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub fn live_count(&self) -> usize {
        self.read().values().filter(|r| r.status.is_live()).count()
    }

    fn restore(&self) {
        let loaded = match self.with_conn(load_all) {
            Some(Ok(records)) => records,
            Some(Err(e)) => {
                warn!("Failed to read instance records: {e:#}");
                return;
            }
            None => return,
        };

        let mut reconciled = 0;
        for mut record in loaded {
            if record.status.is_live() {
                record.status = InstanceStatus::Stopped;
                record.pid = None;
                record.updated_at = now_millis();
                reconciled += 1;
                if !self.retain_history {
                    self.delete(&record.id);
                    continue;
                }
                self.persist(&record);
            }
            self.write().insert(record.id.clone(), record);
        }
        if reconciled > 0 {
            info!(count = reconciled, "Marked instances from a previous run as stopped");
        }
    }

    fn persist(&self, instance: &Instance) {
        if let Some(Err(e)) = self.with_conn(|conn| upsert(conn, instance)) {
            warn!(id = %instance.id, "Failed to persist instance record: {e}");
        }
    }

    fn delete(&self, id: &str) {
        let result = self.with_conn(|conn| {
            conn.execute("DELETE FROM instances WHERE id = ?1", params![id])
                .map(|_| ())
        });
        if let Some(Err(e)) = result {
            warn!(id, "Failed to delete instance record: {e}");
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> T) -> Option<T> {
        let conn = self.conn.as_ref()?;
        let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
        Some(f(&guard))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Instance>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Instance>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_db(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS instances (
            id TEXT PRIMARY KEY,
            folder TEXT NOT NULL,
            port INTEGER NOT NULL,
            pid INTEGER,
            binary_path TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status);",
    )?;
    debug!(path = %db_path.display(), "Opened instance database");
    Ok(conn)
}

fn upsert(conn: &Connection, r: &Instance) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO instances
            (id, folder, port, pid, binary_path, status, created_at, updated_at, last_error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            r.id,
            r.folder,
            r.port,
            r.pid,
            r.binary_path,
            r.status.as_str(),
            r.created_at,
            r.updated_at,
            r.last_error,
        ],
    )?;
    Ok(())
}

fn load_all(conn: &Connection) -> rusqlite::Result<Vec<Instance>> {
    let mut stmt = conn.prepare(
        "SELECT id, folder, port, pid, binary_path, status, created_at, updated_at, last_error
         FROM instances",
    )?;
    let rows = stmt.query_map([], |row| {
        let status: String = row.get(5)?;
        Ok(Instance {
            id: row.get(0)?,
            folder: row.get(1)?,
            port: row.get(2)?,
            pid: row.get(3)?,
            binary_path: row.get(4)?,
            status: InstanceStatus::parse(&status).unwrap_or(InstanceStatus::Stopped),
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            last_error: row.get(8)?,
        })
    })?;
    rows.collect()
}

/// Status column of one row, bypassing the in-memory map.
#[cfg(test)]
fn load_one(conn: &Connection, id: &str) -> rusqlite::Result<Option<String>> {
    use rusqlite::OptionalExtension;
    conn.query_row(
        "SELECT status FROM instances WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )
    .optional()
}
